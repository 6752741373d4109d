use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub on_threshold_c: f64,
    pub off_threshold_c: f64,
    pub min_cycle_secs: u64,
    pub stale_timeout_secs: u64,
    pub override_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub verification_attempts: u32,
    pub verification_backoff_ms: u64,
    pub gateway_timeout_secs: u64,
    pub tick_timeout_secs: u64,
    pub actuator_settle_ms: u64,
    pub min_valid_temp_c: f64,
    pub max_valid_temp_c: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            on_threshold_c: 25.0,
            off_threshold_c: 26.0,
            min_cycle_secs: 180,
            stale_timeout_secs: 300,
            override_timeout_secs: 1_800,
            poll_interval_secs: 30,
            verification_attempts: 3,
            verification_backoff_ms: 2_000,
            gateway_timeout_secs: 5,
            tick_timeout_secs: 60,
            actuator_settle_ms: 1_500,
            min_valid_temp_c: -40.0,
            max_valid_temp_c: 85.0,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("on_threshold_c", self.on_threshold_c),
            ("off_threshold_c", self.off_threshold_c),
            ("min_valid_temp_c", self.min_valid_temp_c),
            ("max_valid_temp_c", self.max_valid_temp_c),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::NotFinite { field });
            }
        }

        if self.on_threshold_c >= self.off_threshold_c {
            return Err(ConfigError::ThresholdOrder {
                on: self.on_threshold_c,
                off: self.off_threshold_c,
            });
        }

        if self.min_valid_temp_c >= self.max_valid_temp_c {
            return Err(ConfigError::EmptyValidRange {
                min: self.min_valid_temp_c,
                max: self.max_valid_temp_c,
            });
        }

        for (field, value) in [
            ("min_cycle_secs", self.min_cycle_secs),
            ("stale_timeout_secs", self.stale_timeout_secs),
            ("override_timeout_secs", self.override_timeout_secs),
            ("poll_interval_secs", self.poll_interval_secs),
            ("verification_attempts", u64::from(self.verification_attempts)),
            ("gateway_timeout_secs", self.gateway_timeout_secs),
            ("tick_timeout_secs", self.tick_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        let needed = self.worst_case_tick();
        if self.tick_timeout() < needed {
            return Err(ConfigError::TickBudget {
                tick_secs: self.tick_timeout_secs,
                needed_secs: needed.as_secs_f64().ceil() as u64,
            });
        }

        Ok(())
    }

    /// Longest a tick can legitimately take: both reads, every verification
    /// attempt (command plus re-read), the backoffs between them and one alert.
    pub fn worst_case_tick(&self) -> Duration {
        let attempts = self.verification_attempts.max(1);
        let gateway_calls = attempts.saturating_mul(2).saturating_add(3);
        self.gateway_timeout()
            .saturating_mul(gateway_calls)
            .saturating_add(self.verification_backoff().saturating_mul(attempts - 1))
    }

    pub fn is_valid_temperature(&self, value_c: f64) -> bool {
        value_c.is_finite() && (self.min_valid_temp_c..=self.max_valid_temp_c).contains(&value_c)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn verification_backoff(&self) -> Duration {
        Duration::from_millis(self.verification_backoff_ms)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_secs(self.tick_timeout_secs)
    }

    pub fn actuator_settle(&self) -> Duration {
        Duration::from_millis(self.actuator_settle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            user: String::new(),
            pass: String::new(),
            client_id: "heater-controller".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub controller: ControllerConfig,
    pub mqtt: MqttConfig,
    pub http_port: u16,
    pub alert_dedup_minutes: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            mqtt: MqttConfig::default(),
            http_port: 8080,
            alert_dedup_minutes: 30,
        }
    }
}

impl RuntimeConfig {
    /// Applies `HEATER_*`-style overrides. `lookup` is usually `std::env::var(..).ok()`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let controller = &mut self.controller;
        override_parsed(&lookup, "HEATER_ON_TEMP", &mut controller.on_threshold_c)?;
        override_parsed(&lookup, "HEATER_OFF_TEMP", &mut controller.off_threshold_c)?;
        override_parsed(&lookup, "MIN_CYCLE_TIME_SECONDS", &mut controller.min_cycle_secs)?;
        override_parsed(
            &lookup,
            "SENSOR_STALE_TIMEOUT_SECONDS",
            &mut controller.stale_timeout_secs,
        )?;
        override_parsed(
            &lookup,
            "MANUAL_OVERRIDE_TIMEOUT_SECONDS",
            &mut controller.override_timeout_secs,
        )?;
        override_parsed(
            &lookup,
            "POLL_INTERVAL_SECONDS",
            &mut controller.poll_interval_secs,
        )?;

        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt.host = host;
        }
        override_parsed(&lookup, "MQTT_PORT", &mut self.mqtt.port)?;
        if let Some(user) = lookup("MQTT_USER") {
            self.mqtt.user = user;
        }
        if let Some(pass) = lookup("MQTT_PASS") {
            self.mqtt.pass = pass;
        }
        override_parsed(&lookup, "CONTROLLER_HTTP_PORT", &mut self.http_port)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.controller.validate()?;
        if self.mqtt.port == 0 {
            return Err(ConfigError::Zero { field: "mqtt.port" });
        }
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return Ok(());
    };
    *slot = raw
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidOverride {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.controller.on_threshold_c, 25.0);
        assert_eq!(config.controller.off_threshold_c, 26.0);
        assert_eq!(config.controller.min_cycle_secs, 180);
        assert_eq!(config.controller.stale_timeout_secs, 300);
        assert_eq!(config.controller.override_timeout_secs, 1_800);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let config = ControllerConfig {
            on_threshold_c: 26.0,
            off_threshold_c: 26.0,
            ..ControllerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ThresholdOrder {
                on: 26.0,
                off: 26.0
            })
        );
    }

    #[test]
    fn rejects_zero_timeouts() {
        let config = ControllerConfig {
            stale_timeout_secs: 0,
            ..ControllerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "stale_timeout_secs"
            })
        );

        let config = ControllerConfig {
            verification_attempts: 0,
            ..ControllerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_tick_budget_covers_worst_case() {
        let config = ControllerConfig::default();
        assert_eq!(config.worst_case_tick(), Duration::from_secs(49));
        assert!(config.tick_timeout() >= config.worst_case_tick());
    }

    #[test]
    fn rejects_tick_budget_below_worst_case() {
        let config = ControllerConfig {
            tick_timeout_secs: 30,
            ..ControllerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::TickBudget {
                tick_secs: 30,
                needed_secs: 49
            })
        );

        let config = ControllerConfig {
            tick_timeout_secs: 30,
            gateway_timeout_secs: 2,
            verification_backoff_ms: 1_000,
            ..ControllerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_non_finite_threshold() {
        let config = ControllerConfig {
            on_threshold_c: f64::NAN,
            ..ControllerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotFinite {
                field: "on_threshold_c"
            })
        );
    }

    #[test]
    fn overrides_apply_from_lookup() {
        let mut config = RuntimeConfig::default();
        config
            .apply_overrides(lookup_from(&[
                ("HEATER_ON_TEMP", "20.5"),
                ("HEATER_OFF_TEMP", "22"),
                ("MIN_CYCLE_TIME_SECONDS", "240"),
                ("MQTT_HOST", "broker.local"),
                ("CONTROLLER_HTTP_PORT", "9090"),
            ]))
            .unwrap();

        assert_eq!(config.controller.on_threshold_c, 20.5);
        assert_eq!(config.controller.off_threshold_c, 22.0);
        assert_eq!(config.controller.min_cycle_secs, 240);
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.http_port, 9090);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn negative_timeout_override_is_rejected() {
        let mut config = RuntimeConfig::default();
        let err = config
            .apply_overrides(lookup_from(&[("SENSOR_STALE_TIMEOUT_SECONDS", "-5")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidOverride {
                key: "SENSOR_STALE_TIMEOUT_SECONDS".to_string(),
                value: "-5".to_string(),
            }
        );
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"controller":{"on_threshold_c":19.0,"off_threshold_c":21.0}}"#)
                .unwrap();
        assert_eq!(config.controller.on_threshold_c, 19.0);
        assert_eq!(config.controller.min_cycle_secs, 180);
        assert_eq!(config.http_port, 8080);
    }
}

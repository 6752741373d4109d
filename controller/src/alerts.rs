use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use heater_common::{
    engine::elapsed_ms, Alert, AlertKind, AlertSeverity, TOPIC_CONTROLLER_ALERT,
};

const HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent {
        alert_id: u64,
        channels: Vec<&'static str>,
    },
    Deduplicated,
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert channel {channel} failed: {message}")]
    Channel {
        channel: &'static str,
        message: String,
    },
}

/// Destination for operator alerts. Delivery problems are reported, never retried.
pub trait AlertSink: Send + Sync {
    fn send(&self, alert: Alert) -> impl Future<Output = Result<Delivery, AlertError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRecord {
    pub alert_id: u64,
    pub severity: AlertSeverity,
    pub kind: AlertKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub channels: Vec<&'static str>,
    pub acknowledged: bool,
}

struct DispatcherState {
    last_sent: HashMap<String, DateTime<Utc>>,
    history: VecDeque<AlertRecord>,
    next_id: u64,
}

/// Deduplicating fan-out to the log and, when configured, the MQTT alert topic.
#[derive(Clone)]
pub struct AlertDispatcher {
    state: Arc<Mutex<DispatcherState>>,
    mqtt: Option<AsyncClient>,
    dedup_window: Duration,
}

impl AlertDispatcher {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(DispatcherState {
                last_sent: HashMap::new(),
                history: VecDeque::with_capacity(HISTORY_CAPACITY),
                next_id: 1,
            })),
            mqtt: None,
            dedup_window,
        }
    }

    pub fn with_mqtt(mut self, mqtt: AsyncClient) -> Self {
        self.mqtt = Some(mqtt);
        self
    }

    /// Most recent `limit` alerts, oldest first, optionally filtered by severity.
    pub async fn history(&self, limit: usize, severity: Option<AlertSeverity>) -> Vec<AlertRecord> {
        let state = self.state.lock().await;
        let matching: Vec<&AlertRecord> = state
            .history
            .iter()
            .filter(|record| severity.map_or(true, |wanted| record.severity == wanted))
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    /// Marks an alert in history as seen by an operator. `false` if the id is unknown.
    pub async fn acknowledge(&self, alert_id: u64) -> bool {
        let mut state = self.state.lock().await;
        let Some(record) = state
            .history
            .iter_mut()
            .find(|record| record.alert_id == alert_id)
        else {
            return false;
        };
        record.acknowledged = true;
        info!(alert_id, "alert acknowledged");
        true
    }

    /// Empties the history. Dedup memory is kept, so cleared alerts are not resent early.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let cleared = state.history.len();
        state.history.clear();
        info!(cleared, "alert log cleared");
        cleared
    }

    /// Claims an id for `alert` unless an identical alert went out inside the window.
    async fn admit(&self, alert: &Alert) -> Option<u64> {
        let window_ms = i64::try_from(self.dedup_window.as_millis()).unwrap_or(i64::MAX);
        let key = alert.dedup_key();

        let mut state = self.state.lock().await;
        state
            .last_sent
            .retain(|_, last| elapsed_ms(alert.timestamp, *last) < window_ms);
        if state.last_sent.contains_key(&key) {
            return None;
        }
        state.last_sent.insert(key, alert.timestamp);
        let alert_id = state.next_id;
        state.next_id += 1;
        Some(alert_id)
    }

    async fn publish_mqtt(&self, mqtt: &AsyncClient, alert: &Alert) -> Result<(), AlertError> {
        let body = serde_json::to_vec(alert).map_err(|err| AlertError::Channel {
            channel: "mqtt",
            message: err.to_string(),
        })?;
        mqtt.publish(TOPIC_CONTROLLER_ALERT, QoS::AtLeastOnce, false, body)
            .await
            .map_err(|err| AlertError::Channel {
                channel: "mqtt",
                message: err.to_string(),
            })
    }
}

impl AlertSink for AlertDispatcher {
    async fn send(&self, alert: Alert) -> Result<Delivery, AlertError> {
        let Some(alert_id) = self.admit(&alert).await else {
            info!("alert deduplicated: {}", alert.dedup_key());
            return Ok(Delivery::Deduplicated);
        };

        let kind = alert.kind.as_str();
        match alert.severity {
            AlertSeverity::Critical => error!(alert_id, kind, "{}", alert.message),
            AlertSeverity::Warning => warn!(alert_id, kind, "{}", alert.message),
            AlertSeverity::Info => info!(alert_id, kind, "{}", alert.message),
        }
        let mut channels = vec!["log"];

        if let Some(mqtt) = &self.mqtt {
            match self.publish_mqtt(mqtt, &alert).await {
                Ok(()) => channels.push("mqtt"),
                Err(err) => warn!("{err}"),
            }
        }

        let mut state = self.state.lock().await;
        if state.history.len() == HISTORY_CAPACITY {
            state.history.pop_front();
        }
        state.history.push_back(AlertRecord {
            alert_id,
            severity: alert.severity,
            kind: alert.kind,
            message: alert.message,
            timestamp: alert.timestamp,
            channels: channels.clone(),
            acknowledged: false,
        });

        Ok(Delivery::Sent { alert_id, channels })
    }
}

use chrono::{DateTime, Utc};

use crate::{
    config::ControllerConfig,
    types::{ActuatorCommand, ControllerState, FailureCause, TemperatureSample},
};

#[derive(Debug, Clone, Copy)]
pub struct EngineInput<'a> {
    pub state: ControllerState,
    pub sample: Option<&'a TemperatureSample>,
    pub manual_signal: bool,
    /// Actuator position as last reported by the gateway, if known.
    pub actuator_on: Option<bool>,
    pub now: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    /// Last verified turn-off. Cooldown dwell is measured from here.
    pub last_off_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub next_state: ControllerState,
    pub action: Option<ActuatorCommand>,
    pub reason: String,
    pub failure: Option<FailureCause>,
}

impl Evaluation {
    fn new(
        next_state: ControllerState,
        action: Option<ActuatorCommand>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            next_state,
            action,
            reason: reason.into(),
            failure: None,
        }
    }

    fn stale(reason: String) -> Self {
        Self {
            next_state: ControllerState::Failure,
            action: None,
            reason,
            failure: Some(FailureCause::StaleData),
        }
    }
}

/// Pure hysteresis state machine. Holds only configuration; all state is passed in.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    config: ControllerConfig,
}

impl DecisionEngine {
    pub fn new(config: ControllerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn is_stale(&self, sample: &TemperatureSample, now: DateTime<Utc>) -> bool {
        elapsed_ms(now, sample.observed_at) > secs_to_ms(self.config.stale_timeout_secs)
    }

    pub fn evaluate(&self, input: &EngineInput<'_>) -> Evaluation {
        let Some(sample) = input.sample else {
            return Evaluation::stale("stale data: no temperature sample".to_string());
        };

        if self.is_stale(sample, input.now) {
            return Evaluation::stale(format!(
                "stale data: sample is {}s old (timeout {}s)",
                elapsed_ms(input.now, sample.observed_at) / 1_000,
                self.config.stale_timeout_secs
            ));
        }

        if input.state == ControllerState::Failure {
            let resume = if self.within_min_cycle(input) {
                ControllerState::Cooldown
            } else {
                ControllerState::Idle
            };
            let mut evaluation = self.evaluate_fresh(resume, sample, input, true);
            evaluation.reason = format!("recovered from failure: {}", evaluation.reason);
            return evaluation;
        }

        self.evaluate_fresh(input.state, sample, input, false)
    }

    fn within_min_cycle(&self, input: &EngineInput<'_>) -> bool {
        input.last_off_at.is_some_and(|off_at| {
            elapsed_ms(input.now, off_at) < secs_to_ms(self.config.min_cycle_secs)
        })
    }

    fn evaluate_fresh(
        &self,
        state: ControllerState,
        sample: &TemperatureSample,
        input: &EngineInput<'_>,
        recovering: bool,
    ) -> Evaluation {
        if input.manual_signal && state != ControllerState::ManualOverride {
            return Evaluation::new(
                ControllerState::ManualOverride,
                None,
                "manual control detected",
            );
        }

        let dwell_ms = elapsed_ms(input.now, input.last_transition_at);
        let value = sample.value_c;
        let on = self.config.on_threshold_c;
        let off = self.config.off_threshold_c;
        let settle_off = if recovering {
            force_off(input.actuator_on)
        } else {
            None
        };

        match state {
            ControllerState::ManualOverride => {
                let timeout_ms = secs_to_ms(self.config.override_timeout_secs);
                if dwell_ms >= timeout_ms {
                    Evaluation::new(
                        ControllerState::Idle,
                        force_off(input.actuator_on),
                        "override timeout",
                    )
                } else {
                    Evaluation::new(
                        ControllerState::ManualOverride,
                        None,
                        format!(
                            "manual override active, {} seconds remaining",
                            ceil_secs(timeout_ms - dwell_ms)
                        ),
                    )
                }
            }
            ControllerState::Cooldown => {
                let anchor = input.last_off_at.unwrap_or(input.last_transition_at);
                let cooled_ms = elapsed_ms(input.now, anchor);
                let min_cycle_ms = secs_to_ms(self.config.min_cycle_secs);
                if cooled_ms >= min_cycle_ms {
                    Evaluation::new(ControllerState::Idle, None, "cooldown elapsed")
                } else {
                    Evaluation::new(
                        ControllerState::Cooldown,
                        settle_off,
                        format!(
                            "cooldown active, {} seconds remaining",
                            ceil_secs(min_cycle_ms - cooled_ms)
                        ),
                    )
                }
            }
            ControllerState::Idle | ControllerState::Failure => {
                if value < on {
                    Evaluation::new(
                        ControllerState::Heating,
                        Some(ActuatorCommand::TurnOn),
                        format!("temperature below threshold ({value:.1}°C < {on:.1}°C)"),
                    )
                } else {
                    Evaluation::new(
                        ControllerState::Idle,
                        settle_off,
                        format!("above threshold, no action ({value:.1}°C >= {on:.1}°C)"),
                    )
                }
            }
            ControllerState::Heating => {
                if value >= off {
                    Evaluation::new(
                        ControllerState::Cooldown,
                        Some(ActuatorCommand::TurnOff),
                        format!("temperature at/above threshold ({value:.1}°C >= {off:.1}°C)"),
                    )
                } else {
                    Evaluation::new(
                        ControllerState::Heating,
                        None,
                        format!("within hysteresis band ({value:.1}°C < {off:.1}°C)"),
                    )
                }
            }
        }
    }
}

fn force_off(actuator_on: Option<bool>) -> Option<ActuatorCommand> {
    (actuator_on == Some(true)).then_some(ActuatorCommand::TurnOff)
}

pub fn elapsed_ms(now: DateTime<Utc>, since: DateTime<Utc>) -> i64 {
    (now - since).num_milliseconds()
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1_000)).unwrap_or(i64::MAX)
}

fn ceil_secs(ms: i64) -> i64 {
    (ms + 999).div_euclid(1_000)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap()
    }

    fn engine() -> DecisionEngine {
        DecisionEngine::new(ControllerConfig::default())
    }

    fn fresh(value_c: f64) -> TemperatureSample {
        TemperatureSample::new(value_c, t0())
    }

    fn input(state: ControllerState, sample: &TemperatureSample) -> EngineInput<'_> {
        EngineInput {
            state,
            sample: Some(sample),
            manual_signal: false,
            actuator_on: state.expected_actuator(),
            now: t0(),
            last_transition_at: t0() - Duration::seconds(3_600),
            last_off_at: None,
        }
    }

    #[test]
    fn idle_below_threshold_turns_on() {
        let sample = fresh(24.0);
        let result = engine().evaluate(&input(ControllerState::Idle, &sample));

        assert_eq!(result.next_state, ControllerState::Heating);
        assert_eq!(result.action, Some(ActuatorCommand::TurnOn));
        assert!(result.reason.contains("below threshold"), "{}", result.reason);
        assert_eq!(result.failure, None);
    }

    #[test]
    fn heating_above_threshold_turns_off() {
        let sample = fresh(26.5);
        let result = engine().evaluate(&input(ControllerState::Heating, &sample));

        assert_eq!(result.next_state, ControllerState::Cooldown);
        assert_eq!(result.action, Some(ActuatorCommand::TurnOff));
    }

    #[test]
    fn on_threshold_boundary_takes_no_action() {
        let sample = fresh(25.0);
        let result = engine().evaluate(&input(ControllerState::Idle, &sample));

        assert_eq!(result.next_state, ControllerState::Idle);
        assert_eq!(result.action, None);
        assert!(result.reason.contains("above threshold, no action"));
    }

    #[test]
    fn off_threshold_boundary_turns_off() {
        let sample = fresh(26.0);
        let result = engine().evaluate(&input(ControllerState::Heating, &sample));

        assert_eq!(result.next_state, ControllerState::Cooldown);
        assert_eq!(result.action, Some(ActuatorCommand::TurnOff));
    }

    #[test]
    fn deadband_holds_in_both_directions() {
        let sample = fresh(25.5);

        let idle = engine().evaluate(&input(ControllerState::Idle, &sample));
        assert_eq!(idle.next_state, ControllerState::Idle);
        assert_eq!(idle.action, None);

        let heating = engine().evaluate(&input(ControllerState::Heating, &sample));
        assert_eq!(heating.next_state, ControllerState::Heating);
        assert_eq!(heating.action, None);
        assert!(heating.reason.contains("within hysteresis band"));
    }

    #[test]
    fn cooldown_reports_remaining_seconds() {
        let sample = fresh(20.0);
        let mut input = input(ControllerState::Cooldown, &sample);
        input.last_transition_at = t0() - Duration::seconds(60);

        let result = engine().evaluate(&input);

        assert_eq!(result.next_state, ControllerState::Cooldown);
        assert_eq!(result.action, None);
        assert_eq!(result.reason, "cooldown active, 120 seconds remaining");
    }

    #[test]
    fn cooldown_elapsed_returns_to_idle() {
        let sample = fresh(20.0);
        let mut input = input(ControllerState::Cooldown, &sample);
        input.last_transition_at = t0() - Duration::seconds(200);

        let result = engine().evaluate(&input);

        assert_eq!(result.next_state, ControllerState::Idle);
        assert_eq!(result.action, None);
        assert_eq!(result.reason, "cooldown elapsed");
    }

    #[test]
    fn cooldown_boundary_is_inclusive() {
        let sample = fresh(20.0);
        let mut input = input(ControllerState::Cooldown, &sample);
        input.last_transition_at = t0() - Duration::seconds(180);

        assert_eq!(engine().evaluate(&input).next_state, ControllerState::Idle);

        input.last_transition_at = t0() - Duration::milliseconds(179_500);
        let result = engine().evaluate(&input);
        assert_eq!(result.next_state, ControllerState::Cooldown);
        assert_eq!(result.reason, "cooldown active, 1 seconds remaining");
    }

    #[test]
    fn old_sample_fails_from_every_state() {
        let sample = TemperatureSample::new(24.0, t0() - Duration::seconds(400));

        for state in ControllerState::ALL {
            let result = engine().evaluate(&input(state, &sample));
            assert_eq!(result.next_state, ControllerState::Failure, "from {state}");
            assert_eq!(result.action, None);
            assert_eq!(result.failure, Some(FailureCause::StaleData));
            assert!(result.reason.starts_with("stale data"), "{}", result.reason);
        }
    }

    #[test]
    fn staleness_boundary_is_exclusive() {
        let sample = TemperatureSample::new(24.0, t0() - Duration::seconds(300));
        let result = engine().evaluate(&input(ControllerState::Idle, &sample));
        assert_eq!(result.next_state, ControllerState::Heating);
    }

    #[test]
    fn missing_sample_fails() {
        let sample = fresh(24.0);
        let mut input = input(ControllerState::Heating, &sample);
        input.sample = None;

        let result = engine().evaluate(&input);

        assert_eq!(result.next_state, ControllerState::Failure);
        assert_eq!(result.reason, "stale data: no temperature sample");
    }

    #[test]
    fn staleness_beats_manual_override() {
        let sample = TemperatureSample::new(24.0, t0() - Duration::seconds(301));
        let mut input = input(ControllerState::ManualOverride, &sample);
        input.manual_signal = true;
        input.last_transition_at = t0();

        assert_eq!(
            engine().evaluate(&input).next_state,
            ControllerState::Failure
        );
    }

    #[test]
    fn manual_signal_enters_override_from_any_automatic_state() {
        let sample = fresh(24.0);
        for state in [
            ControllerState::Idle,
            ControllerState::Heating,
            ControllerState::Cooldown,
        ] {
            let mut input = input(state, &sample);
            input.manual_signal = true;
            let result = engine().evaluate(&input);
            assert_eq!(result.next_state, ControllerState::ManualOverride);
            assert_eq!(result.action, None);
            assert_eq!(result.reason, "manual control detected");
        }
    }

    #[test]
    fn override_holds_until_timeout() {
        let sample = fresh(18.0);
        let mut input = input(ControllerState::ManualOverride, &sample);
        input.manual_signal = true;
        input.actuator_on = Some(true);
        input.last_transition_at = t0() - Duration::seconds(600);

        let result = engine().evaluate(&input);
        assert_eq!(result.next_state, ControllerState::ManualOverride);
        assert_eq!(result.reason, "manual override active, 1200 seconds remaining");

        input.last_transition_at = t0() - Duration::seconds(1_800);
        let result = engine().evaluate(&input);
        assert_eq!(result.next_state, ControllerState::Idle);
        assert_eq!(result.action, Some(ActuatorCommand::TurnOff));
        assert_eq!(result.reason, "override timeout");
    }

    #[test]
    fn override_timeout_ignores_temperature() {
        let sample = fresh(10.0);
        let mut input = input(ControllerState::ManualOverride, &sample);
        input.actuator_on = Some(false);
        input.last_transition_at = t0() - Duration::seconds(1_801);

        let result = engine().evaluate(&input);
        assert_eq!(result.next_state, ControllerState::Idle);
        assert_eq!(result.action, None);
    }

    #[test]
    fn fresh_data_recovers_from_failure() {
        let cold = fresh(22.0);
        let result = engine().evaluate(&input(ControllerState::Failure, &cold));
        assert_eq!(result.next_state, ControllerState::Heating);
        assert_eq!(result.action, Some(ActuatorCommand::TurnOn));
        assert!(result.reason.starts_with("recovered from failure: "));

        let warm = fresh(25.5);
        let mut input = input(ControllerState::Failure, &warm);
        input.actuator_on = Some(true);
        let result = engine().evaluate(&input);
        assert_eq!(result.next_state, ControllerState::Idle);
        assert_eq!(result.action, Some(ActuatorCommand::TurnOff));

        input.actuator_on = Some(false);
        assert_eq!(engine().evaluate(&input).action, None);
    }

    #[test]
    fn recovery_inside_min_cycle_resumes_cooldown() {
        let cold = fresh(22.0);
        let mut input = input(ControllerState::Failure, &cold);
        input.last_transition_at = t0() - Duration::seconds(10);
        input.last_off_at = Some(t0() - Duration::seconds(20));

        let result = engine().evaluate(&input);
        assert_eq!(result.next_state, ControllerState::Cooldown);
        assert_eq!(result.action, None);
        assert_eq!(
            result.reason,
            "recovered from failure: cooldown active, 160 seconds remaining"
        );

        input.actuator_on = Some(true);
        assert_eq!(
            engine().evaluate(&input).action,
            Some(ActuatorCommand::TurnOff)
        );

        input.last_off_at = Some(t0() - Duration::seconds(180));
        input.actuator_on = Some(false);
        let result = engine().evaluate(&input);
        assert_eq!(result.next_state, ControllerState::Heating);
        assert_eq!(result.action, Some(ActuatorCommand::TurnOn));
    }

    #[test]
    fn cooldown_dwell_runs_from_last_turn_off() {
        let sample = fresh(20.0);
        let mut input = input(ControllerState::Cooldown, &sample);
        input.last_transition_at = t0();
        input.last_off_at = Some(t0() - Duration::seconds(170));

        let result = engine().evaluate(&input);
        assert_eq!(result.next_state, ControllerState::Cooldown);
        assert_eq!(result.reason, "cooldown active, 10 seconds remaining");

        input.last_off_at = Some(t0() - Duration::seconds(180));
        assert_eq!(engine().evaluate(&input).next_state, ControllerState::Idle);
    }

    fn any_state() -> impl Strategy<Value = ControllerState> {
        prop::sample::select(ControllerState::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn idle_below_on_threshold_always_heats(value in -40.0f64..24.999) {
            let sample = fresh(value);
            let result = engine().evaluate(&input(ControllerState::Idle, &sample));
            prop_assert_eq!(result.next_state, ControllerState::Heating);
            prop_assert_eq!(result.action, Some(ActuatorCommand::TurnOn));
        }

        #[test]
        fn heating_at_or_above_off_threshold_always_cools(value in 26.0f64..85.0) {
            let sample = fresh(value);
            let result = engine().evaluate(&input(ControllerState::Heating, &sample));
            prop_assert_eq!(result.next_state, ControllerState::Cooldown);
            prop_assert_eq!(result.action, Some(ActuatorCommand::TurnOff));
        }

        #[test]
        fn cooldown_dwell_is_never_cut_short(value in -40.0f64..85.0, dwell in 0i64..180) {
            let sample = fresh(value);
            let mut input = input(ControllerState::Cooldown, &sample);
            input.last_transition_at = t0() - Duration::seconds(dwell);
            let result = engine().evaluate(&input);
            prop_assert_eq!(result.next_state, ControllerState::Cooldown);
            prop_assert_eq!(result.action, None);
        }

        #[test]
        fn recovery_never_reheats_inside_min_cycle(
            value in -40.0f64..85.0,
            since_off in 0i64..180,
        ) {
            let sample = fresh(value);
            let mut input = input(ControllerState::Failure, &sample);
            input.last_off_at = Some(t0() - Duration::seconds(since_off));
            let result = engine().evaluate(&input);
            prop_assert_eq!(result.next_state, ControllerState::Cooldown);
            prop_assert_ne!(result.action, Some(ActuatorCommand::TurnOn));
        }

        #[test]
        fn stale_sample_always_fails(
            state in any_state(),
            age in 301i64..100_000,
            manual in any::<bool>(),
        ) {
            let sample = TemperatureSample::new(20.0, t0() - Duration::seconds(age));
            let mut input = input(state, &sample);
            input.manual_signal = manual;
            let result = engine().evaluate(&input);
            prop_assert_eq!(result.next_state, ControllerState::Failure);
            prop_assert_eq!(result.action, None);
        }

        #[test]
        fn evaluation_is_idempotent(
            state in any_state(),
            value in -40.0f64..85.0,
            dwell in 0i64..4_000,
            manual in any::<bool>(),
        ) {
            let sample = fresh(value);
            let mut input = input(state, &sample);
            input.manual_signal = manual;
            input.last_transition_at = t0() - Duration::seconds(dwell);
            let engine = engine();
            prop_assert_eq!(engine.evaluate(&input), engine.evaluate(&input));
        }
    }
}

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    engine::elapsed_ms,
    types::{
        ControllerState, Decision, FailureCause, HealthSnapshot, PersistedControl,
        StateTransition, TemperatureSample,
    },
};

/// Everything the controller remembers between ticks.
///
/// A tick builds the next record from the previous one and swaps it in whole,
/// so readers never see a new state next to an old decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlRecord {
    pub state: ControllerState,
    pub last_transition_at: DateTime<Utc>,
    pub last_transition: Option<StateTransition>,
    pub last_sample: Option<TemperatureSample>,
    pub last_decision: Option<Decision>,
    pub failure_cause: Option<FailureCause>,
    pub last_off_at: Option<DateTime<Utc>>,
}

impl ControlRecord {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            state: ControllerState::Idle,
            last_transition_at: started_at,
            last_transition: None,
            last_sample: None,
            last_decision: None,
            failure_cause: None,
            last_off_at: None,
        }
    }

    pub fn restore(persisted: PersistedControl) -> Self {
        Self {
            state: persisted.state,
            last_transition_at: persisted.last_transition_at,
            last_transition: None,
            last_sample: None,
            last_decision: None,
            failure_cause: persisted.failure_cause,
            last_off_at: persisted.last_off_at,
        }
    }

    pub fn persisted(&self) -> PersistedControl {
        PersistedControl {
            state: self.state,
            last_transition_at: self.last_transition_at,
            failure_cause: self.failure_cause,
            last_off_at: self.last_off_at,
        }
    }

    pub fn is_failure_latched(&self) -> bool {
        self.state == ControllerState::Failure
            && self.failure_cause.is_some_and(FailureCause::is_latching)
    }

    /// Moves to `to`, recording a transition only when the state actually changes.
    pub fn transition(
        &mut self,
        to: ControllerState,
        at: DateTime<Utc>,
    ) -> Option<StateTransition> {
        if self.state == to {
            return None;
        }
        let transition = StateTransition {
            from: self.state,
            to,
            at,
        };
        self.state = to;
        self.last_transition_at = at;
        self.last_transition = Some(transition);
        Some(transition)
    }

    pub fn seconds_in_state(&self, now: DateTime<Utc>) -> f64 {
        elapsed_ms(now, self.last_transition_at) as f64 / 1_000.0
    }

    pub fn health(&self, now: DateTime<Utc>) -> HealthSnapshot {
        HealthSnapshot {
            state: self.state,
            last_temperature: self.last_sample.map(|sample| sample.value_c),
            last_temp_timestamp: self.last_sample.map(|sample| sample.observed_at),
            last_decision: self.last_decision.as_ref().map(|d| d.reason.clone()),
            last_decision_timestamp: self.last_decision.as_ref().map(|d| d.timestamp),
            time_since_state_change: self.seconds_in_state(now),
            last_state_change: self.last_transition_at,
        }
    }
}

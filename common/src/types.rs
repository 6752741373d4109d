use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerState {
    Idle,
    Heating,
    Cooldown,
    ManualOverride,
    Failure,
}

impl ControllerState {
    pub const ALL: [ControllerState; 5] = [
        Self::Idle,
        Self::Heating,
        Self::Cooldown,
        Self::ManualOverride,
        Self::Failure,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Heating => "HEATING",
            Self::Cooldown => "COOLDOWN",
            Self::ManualOverride => "MANUAL_OVERRIDE",
            Self::Failure => "FAILURE",
        }
    }

    /// Actuator position the controller expects while resting in this state.
    pub fn expected_actuator(self) -> Option<bool> {
        match self {
            Self::Idle | Self::Cooldown => Some(false),
            Self::Heating => Some(true),
            Self::ManualOverride | Self::Failure => None,
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSample {
    pub value_c: f64,
    pub observed_at: DateTime<Utc>,
}

impl TemperatureSample {
    pub fn new(value_c: f64, observed_at: DateTime<Utc>) -> Self {
        Self {
            value_c,
            observed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorCommand {
    TurnOn,
    TurnOff,
}

impl ActuatorCommand {
    pub fn from_on(on: bool) -> Self {
        if on {
            Self::TurnOn
        } else {
            Self::TurnOff
        }
    }

    pub fn is_on(self) -> bool {
        matches!(self, Self::TurnOn)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TurnOn => "turn on",
            Self::TurnOff => "turn off",
        }
    }
}

impl fmt::Display for ActuatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    StaleData,
    GatewayUnreachable,
    VerificationExhausted,
    TickTimeout,
}

impl FailureCause {
    /// Latched causes survive fresh data and need an operator reset.
    pub fn is_latching(self) -> bool {
        matches!(self, Self::VerificationExhausted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StaleData => "stale data",
            Self::GatewayUnreachable => "gateway unreachable",
            Self::VerificationExhausted => "command verification exhausted",
            Self::TickTimeout => "tick timed out",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub resulting_state: ControllerState,
    pub command_issued: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ControllerState,
    pub to: ControllerState,
    pub at: DateTime<Utc>,
}

/// Externally visible health view. Field names are part of the HTTP contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub state: ControllerState,
    pub last_temperature: Option<f64>,
    pub last_temp_timestamp: Option<DateTime<Utc>>,
    pub last_decision: Option<String>,
    pub last_decision_timestamp: Option<DateTime<Utc>>,
    pub time_since_state_change: f64,
    pub last_state_change: DateTime<Utc>,
}

/// The subset of controller bookkeeping that survives a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedControl {
    pub state: ControllerState,
    pub last_transition_at: DateTime<Utc>,
    #[serde(default)]
    pub failure_cause: Option<FailureCause>,
    /// Last verified turn-off; anchors the minimum cycle across failures.
    #[serde(default)]
    pub last_off_at: Option<DateTime<Utc>>,
}

/// Temperature payload published by sensor nodes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub value: f64,
    #[serde(rename = "observedAt")]
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SensorFailure,
    ApiUnreachable,
    VerificationFailed,
    StateChange,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SensorFailure => "sensor_failure",
            Self::ApiUnreachable => "api_unreachable",
            Self::VerificationFailed => "verification_failed",
            Self::StateChange => "state_change",
        }
    }
}

impl From<FailureCause> for AlertKind {
    fn from(cause: FailureCause) -> Self {
        match cause {
            FailureCause::StaleData => Self::SensorFailure,
            FailureCause::GatewayUnreachable | FailureCause::TickTimeout => Self::ApiUnreachable,
            FailureCause::VerificationExhausted => Self::VerificationFailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub kind: AlertKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn critical(kind: AlertKind, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            severity: AlertSeverity::Critical,
            kind,
            message: message.into(),
            timestamp,
        }
    }

    pub fn info(kind: AlertKind, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            severity: AlertSeverity::Info,
            kind,
            message: message.into(),
            timestamp,
        }
    }

    pub fn dedup_key(&self) -> String {
        format!("{}_{}", self.kind.as_str(), self.message)
    }
}

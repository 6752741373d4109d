pub mod config;
pub mod engine;
pub mod error;
pub mod payload;
pub mod record;
pub mod topics;
pub mod types;

pub use config::{ControllerConfig, MqttConfig, RuntimeConfig};
pub use engine::{DecisionEngine, EngineInput, Evaluation};
pub use error::{ConfigError, GatewayError};
pub use record::ControlRecord;
pub use topics::*;
pub use types::{
    ActuatorCommand, Alert, AlertKind, AlertSeverity, ControllerState, Decision, FailureCause,
    HealthSnapshot, PersistedControl, SensorReading, StateTransition, TemperatureSample,
};

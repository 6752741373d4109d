use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("on threshold {on}°C must be below off threshold {off}°C")]
    ThresholdOrder { on: f64, off: f64 },
    #[error("{field} must be a finite number")]
    NotFinite { field: &'static str },
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("valid temperature range {min}..={max}°C is empty")]
    EmptyValidRange { min: f64, max: f64 },
    #[error("invalid value {value:?} for {key}")]
    InvalidOverride { key: String, value: String },
    #[error("tick timeout {tick_secs}s is below the worst-case tick of {needed_secs}s")]
    TickBudget { tick_secs: u64, needed_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("gateway unreachable: {0}")]
    Unreachable(String),
    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),
    #[error("no {0} reading received yet")]
    NoReading(&'static str),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl GatewayError {
    /// Transport-level failures, as opposed to missing or malformed data.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout(_))
    }
}

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::{
    error::GatewayError,
    types::{SensorReading, TemperatureSample},
};

/// Parses a temperature message. Accepts a `SensorReading` JSON object, an
/// object with a loosely formatted timestamp, or a bare number stamped with
/// `received_at`. Every timestamp comes out in UTC.
pub fn parse_temperature(
    raw: &str,
    received_at: DateTime<Utc>,
) -> Result<TemperatureSample, GatewayError> {
    let trimmed = raw.trim();

    if let Ok(value) = trimmed.parse::<f64>() {
        return Ok(TemperatureSample::new(value, received_at));
    }

    if let Ok(reading) = serde_json::from_str::<SensorReading>(trimmed) {
        return Ok(TemperatureSample::new(reading.value, reading.observed_at));
    }

    let json: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|err| GatewayError::InvalidPayload(format!("temperature: {err}")))?;

    let value = match &json["value"] {
        serde_json::Value::Number(number) => number.as_f64(),
        serde_json::Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| GatewayError::InvalidPayload("temperature: missing numeric value".into()))?;

    let observed_at = match &json["observedAt"] {
        serde_json::Value::Null => received_at,
        serde_json::Value::String(text) => parse_timestamp(text)
            .ok_or_else(|| GatewayError::InvalidPayload(format!("bad timestamp {text:?}")))?,
        serde_json::Value::Number(secs) => secs
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| GatewayError::InvalidPayload(format!("bad epoch {secs}")))?,
        other => {
            return Err(GatewayError::InvalidPayload(format!(
                "bad timestamp {other}"
            )))
        }
    };

    Ok(TemperatureSample::new(value, observed_at))
}

/// RFC 3339 with any offset, or a naive ISO-8601 timestamp taken as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn parse_actuator_state(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "on" | "heat" | "true" | "1" => Some(true),
        "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

pub fn actuator_command_payload(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

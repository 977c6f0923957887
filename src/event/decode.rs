//! Decoding and validation of broker payloads.
//!
//! A payload is a JSON object using the telemetry wire names. Decoding only
//! checks shape; [`WireEvent::validate`] then enforces the data-integrity
//! bounds and produces a [`TelemetryEvent`]. Both failures are terminal for
//! the message: malformed payloads are not transient and are never retried.

use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use super::{Details, Status, TelemetryEvent};

/// Physically plausible conveyor speed (m/s). Wider than any alert threshold.
pub const SPEED_SANITY_RANGE: RangeInclusive<f64> = 0.0..=10.0;
/// Physically plausible temperature (°C).
pub const TEMPERATURE_SANITY_RANGE: RangeInclusive<f64> = -50.0..=200.0;
/// Physically plausible robot arm angle (degrees).
pub const ANGLE_SANITY_RANGE: RangeInclusive<f64> = 0.0..=360.0;

/// Payload could not be decoded into the event shape.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decoded event violates a data-integrity rule.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("machine_id is required")]
    MissingMachineId,

    #[error("event_type is required")]
    MissingEventType,

    #[error("status is required")]
    MissingStatus,

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

impl ValidationError {
    /// Short label used for metrics.
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::MissingMachineId => "missing_machine_id",
            Self::MissingEventType => "missing_event_type",
            Self::MissingStatus => "missing_status",
            Self::InvalidStatus(_) => "invalid_status",
            Self::OutOfRange { .. } => "out_of_range",
        }
    }
}

/// Telemetry event exactly as it appears on the wire.
///
/// String fields default to empty so that a missing `machine_id` surfaces as
/// a validation error naming the field rather than a generic decode error.
#[derive(Debug, Clone, Deserialize)]
pub struct WireEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub machine_id: String,
    pub conveyor_speed: f64,
    pub temperature: f64,
    pub robot_arm_angle: f64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub additional_data: Option<Details>,
}

/// Decode a raw broker payload.
pub fn decode(payload: &[u8]) -> Result<WireEvent, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(serde_json::from_slice(payload)?)
}

impl WireEvent {
    /// Validate and convert into the canonical event.
    pub fn validate(self) -> Result<TelemetryEvent, ValidationError> {
        if self.machine_id.is_empty() {
            return Err(ValidationError::MissingMachineId);
        }
        if self.status.is_empty() {
            return Err(ValidationError::MissingStatus);
        }
        if self.event_type.is_empty() {
            return Err(ValidationError::MissingEventType);
        }

        let status = Status::from_name(&self.status)
            .ok_or_else(|| ValidationError::InvalidStatus(self.status.clone()))?;

        check_range("conveyor_speed", self.conveyor_speed, &SPEED_SANITY_RANGE)?;
        check_range("temperature", self.temperature, &TEMPERATURE_SANITY_RANGE)?;
        check_range("robot_arm_angle", self.robot_arm_angle, &ANGLE_SANITY_RANGE)?;

        Ok(TelemetryEvent {
            timestamp: self.timestamp,
            machine_id: self.machine_id,
            conveyor_speed: self.conveyor_speed,
            temperature: self.temperature,
            robot_arm_angle: self.robot_arm_angle,
            status,
            event_type: self.event_type,
            details: self.additional_data,
        })
    }
}

// NaN fails `contains`, so non-finite readings are rejected here too.
fn check_range(
    field: &'static str,
    value: f64,
    range: &RangeInclusive<f64>,
) -> Result<(), ValidationError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange { field, value })
    }
}

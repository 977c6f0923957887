pub mod decode;
pub mod details;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::details::Details;

/// Identifier assigned to an event by the event store.
pub type EventId = u64;

/// Machine status reported with every telemetry reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Warning,
    Fault,
}

impl Status {
    /// Returns the wire/label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Fault => "fault",
        }
    }

    /// Convert from the wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ok" => Some(Self::Ok),
            "warning" => Some(Self::Warning),
            "fault" => Some(Self::Fault),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated telemetry reading from one machine.
///
/// Built by the stream consumer after decode and validation, never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub timestamp: DateTime<Utc>,
    pub machine_id: String,
    /// Conveyor belt speed in m/s.
    pub conveyor_speed: f64,
    /// Temperature in °C.
    pub temperature: f64,
    /// Robot arm angle in degrees.
    pub robot_arm_angle: f64,
    pub status: Status,
    pub event_type: String,
    #[serde(rename = "additional_data", skip_serializing_if = "Option::is_none")]
    pub details: Option<Details>,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An anomaly raised while analyzing a telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub machine_id: String,
    /// Store id of the triggering event, when it was persisted.
    pub event_id: Option<EventId>,
    pub alert_type: String,
    pub severity: Severity,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        machine_id: impl Into<String>,
        alert_type: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            event_id: None,
            alert_type: alert_type.into(),
            severity,
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    /// Attaches the store id of the triggering event.
    pub fn with_event_id(mut self, event_id: Option<EventId>) -> Self {
        self.event_id = event_id;
        self
    }
}

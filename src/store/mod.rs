pub mod memory;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::event::{Alert, EventId, Status, TelemetryEvent};

pub use self::memory::MemoryStore;

/// Failure reported by an [`EventStore`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("write rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Label used for metrics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// Aggregate over stored events.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventStats {
    pub total_events: u64,
    pub fault_events: u64,
    pub warning_events: u64,
    pub avg_temperature: f64,
    pub avg_conveyor_speed: f64,
    /// Share of non-fault events, in percent.
    pub uptime_percent: f64,
    pub last_event_time: Option<DateTime<Utc>>,
}

impl EventStats {
    /// Folds a set of events into an aggregate.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a TelemetryEvent>) -> Self {
        let mut stats = Self::default();
        let mut sum_temperature = 0.0;
        let mut sum_speed = 0.0;

        for event in events {
            stats.total_events += 1;
            match event.status {
                Status::Fault => stats.fault_events += 1,
                Status::Warning => stats.warning_events += 1,
                Status::Ok => {}
            }
            sum_temperature += event.temperature;
            sum_speed += event.conveyor_speed;
            if stats.last_event_time.is_none_or(|t| event.timestamp > t) {
                stats.last_event_time = Some(event.timestamp);
            }
        }

        if stats.total_events > 0 {
            let n = stats.total_events as f64;
            stats.avg_temperature = sum_temperature / n;
            stats.avg_conveyor_speed = sum_speed / n;
            stats.uptime_percent = (stats.total_events - stats.fault_events) as f64 / n * 100.0;
        }

        stats
    }
}

/// Durable persistence for events and alerts.
///
/// Implementations handle their own synchronization; the pipeline issues
/// concurrent calls from the driver loop, the alert worker and the stats
/// publisher.
pub trait EventStore: Send + Sync + 'static {
    /// Persists an event, returning its assigned id.
    fn write(
        &self,
        event: &TelemetryEvent,
    ) -> impl std::future::Future<Output = Result<EventId, StoreError>> + Send;

    /// Persists an alert.
    fn write_alert(
        &self,
        alert: &Alert,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Aggregates events newer than `since`, optionally for one machine.
    fn aggregate(
        &self,
        machine_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<EventStats, StoreError>> + Send;
}

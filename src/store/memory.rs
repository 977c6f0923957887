use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::event::{Alert, EventId, TelemetryEvent};

use super::{EventStats, EventStore, StoreError};

/// Default number of events (and alerts) retained.
pub const DEFAULT_RETENTION: usize = 10_000;

/// In-process [`EventStore`] keeping the most recent events and alerts.
///
/// Ids increase monotonically and are never reused, even after the event
/// they named has aged out.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    retention: usize,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: EventId,
    events: VecDeque<(EventId, TelemetryEvent)>,
    alerts: VecDeque<Alert>,
}

impl MemoryStore {
    pub fn new(retention: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                ..Default::default()
            }),
            retention: retention.max(1),
        }
    }

    /// Number of events currently retained.
    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retained events with their ids, oldest first.
    pub fn events(&self) -> Vec<(EventId, TelemetryEvent)> {
        self.inner.lock().events.iter().cloned().collect()
    }

    /// Retained alerts, oldest first.
    pub fn alerts(&self) -> Vec<Alert> {
        self.inner.lock().alerts.iter().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl EventStore for MemoryStore {
    async fn write(&self, event: &TelemetryEvent) -> Result<EventId, StoreError> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        if inner.events.len() == self.retention {
            inner.events.pop_front();
        }
        inner.events.push_back((id, event.clone()));

        Ok(id)
    }

    async fn write_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.alerts.len() == self.retention {
            inner.alerts.pop_front();
        }
        inner.alerts.push_back(alert.clone());
        Ok(())
    }

    async fn aggregate(
        &self,
        machine_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<EventStats, StoreError> {
        let inner = self.inner.lock();
        let matching = inner.events.iter().map(|(_, e)| e).filter(|e| {
            e.timestamp >= since && machine_id.is_none_or(|id| e.machine_id == id)
        });
        Ok(EventStats::from_events(matching))
    }
}

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::{Status, TelemetryEvent};

use super::ring::RingBuffer;

/// Aggregate view of one machine's recent history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineStats {
    pub event_count: usize,
    pub avg_temperature: f64,
    pub avg_conveyor_speed: f64,
    pub avg_robot_arm_angle: f64,
    pub fault_rate: f64,
    pub last_event_time: DateTime<Utc>,
}

/// Recent events for one machine plus running aggregates over them.
///
/// The counters are adjusted on every insert by adding the new event and
/// subtracting the one the ring displaced, so they always describe exactly
/// the events currently held.
#[derive(Debug)]
pub struct MachineWindow {
    events: RingBuffer<Arc<TelemetryEvent>>,
    fault_count: usize,
    sum_temperature: f64,
    sum_speed: f64,
    sum_angle: f64,
    last_insert: Instant,
}

impl MachineWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: RingBuffer::new(capacity),
            fault_count: 0,
            sum_temperature: 0.0,
            sum_speed: 0.0,
            sum_angle: 0.0,
            last_insert: Instant::now(),
        }
    }

    /// Appends an event, updating the cached aggregates.
    pub fn insert(&mut self, event: Arc<TelemetryEvent>) {
        self.account(&event, 1.0);
        if let Some(evicted) = self.events.push(event) {
            self.account(&evicted, -1.0);
        }
        self.last_insert = Instant::now();
    }

    fn account(&mut self, event: &TelemetryEvent, sign: f64) {
        self.sum_temperature += sign * event.temperature;
        self.sum_speed += sign * event.conveyor_speed;
        self.sum_angle += sign * event.robot_arm_angle;
        if event.status == Status::Fault {
            if sign > 0.0 {
                self.fault_count += 1;
            } else {
                self.fault_count = self.fault_count.saturating_sub(1);
            }
        }
    }

    /// The most recent `n` events, oldest first.
    pub fn tail(&self, n: usize) -> Vec<Arc<TelemetryEvent>> {
        self.events.tail(n)
    }

    pub fn snapshot(&self) -> Vec<Arc<TelemetryEvent>> {
        self.events.snapshot()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn fault_count(&self) -> usize {
        self.fault_count
    }

    /// Time of the last insert, used by idle eviction.
    pub fn last_insert(&self) -> Instant {
        self.last_insert
    }

    /// Aggregates over the held events, `None` while empty.
    pub fn stats(&self) -> Option<MachineStats> {
        let last = self.events.last()?;
        let n = self.events.len() as f64;

        Some(MachineStats {
            event_count: self.events.len(),
            avg_temperature: self.sum_temperature / n,
            avg_conveyor_speed: self.sum_speed / n,
            avg_robot_arm_angle: self.sum_angle / n,
            fault_rate: self.fault_count as f64 / n,
            last_event_time: last.timestamp,
        })
    }
}

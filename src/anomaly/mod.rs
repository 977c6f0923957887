pub mod ring;
pub mod thresholds;
pub mod window;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::info;

use crate::event::{Alert, Severity, Status, TelemetryEvent};

pub use self::ring::RingBuffer;
pub use self::thresholds::{AnomalyThresholds, ThresholdError};
pub use self::window::{MachineStats, MachineWindow};

/// Events kept per machine by default.
pub const DEFAULT_WINDOW_SIZE: usize = 50;

/// Events examined by the trend checks.
pub const TREND_WINDOW: usize = 5;
/// Temperature change rate (°C/s, either direction) that counts as rapid.
pub const TEMPERATURE_RATE_LIMIT: f64 = 2.0;
/// Population standard deviation of conveyor speed (m/s) over the trend
/// window above which the belt counts as unstable.
pub const SPEED_STDDEV_LIMIT: f64 = 0.5;

/// Events examined by the pattern check.
pub const PATTERN_WINDOW: usize = 20;
/// Minimum history before the pattern check runs.
pub const PATTERN_MIN_EVENTS: usize = 10;
/// Faults within the pattern window that raise a repeated-faults alert.
pub const REPEATED_FAULT_LIMIT: usize = 3;

/// Per-machine stateful anomaly detection.
///
/// Holds one [`MachineWindow`] per machine id, created on first sight. The
/// window map is a `DashMap`, so only the shard owning a machine is locked
/// while its window is updated; the thresholds sit behind a read-mostly lock.
pub struct AnomalyEngine {
    thresholds: RwLock<AnomalyThresholds>,
    windows: DashMap<String, MachineWindow>,
    window_size: usize,
}

impl AnomalyEngine {
    /// Creates an engine with validated initial thresholds.
    pub fn new(thresholds: AnomalyThresholds, window_size: usize) -> Result<Self, ThresholdError> {
        thresholds.validate()?;

        Ok(Self {
            thresholds: RwLock::new(thresholds),
            windows: DashMap::with_capacity(16),
            window_size: window_size.max(PATTERN_WINDOW),
        })
    }

    /// Records the event in its machine window and evaluates every check.
    ///
    /// Alerts come back in evaluation order: threshold alerts (speed,
    /// temperature, angle, status), then trend, then pattern.
    pub fn analyze(&self, event: Arc<TelemetryEvent>) -> Vec<Alert> {
        // One snapshot for the whole evaluation.
        let thresholds = *self.thresholds.read();

        let (trend_tail, pattern_tail) = {
            let mut window = match self.windows.get_mut(event.machine_id.as_str()) {
                Some(window) => window,
                None => self
                    .windows
                    .entry(event.machine_id.clone())
                    .or_insert_with(|| MachineWindow::new(self.window_size)),
            };
            window.insert(Arc::clone(&event));
            (window.tail(TREND_WINDOW), window.tail(PATTERN_WINDOW))
        };

        let mut alerts = Vec::new();
        check_thresholds(&event, &thresholds, &mut alerts);
        check_trends(&event, &trend_tail, &mut alerts);
        check_patterns(&event, &pattern_tail, &mut alerts);
        alerts
    }

    /// Replaces the thresholds after validating them.
    ///
    /// A rejected update leaves the current thresholds untouched.
    pub fn update_thresholds(&self, thresholds: AnomalyThresholds) -> Result<(), ThresholdError> {
        thresholds.validate()?;
        *self.thresholds.write() = thresholds;
        info!(?thresholds, "updated anomaly thresholds");
        Ok(())
    }

    /// Current thresholds.
    pub fn thresholds(&self) -> AnomalyThresholds {
        *self.thresholds.read()
    }

    /// Aggregates over a machine's window, `None` for unknown machines.
    pub fn stats(&self, machine_id: &str) -> Option<MachineStats> {
        self.windows.get(machine_id).and_then(|window| window.stats())
    }

    /// Number of machines with a live window.
    pub fn machine_count(&self) -> usize {
        self.windows.len()
    }

    /// Drops windows that have not seen an event within `ttl`.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows
            .retain(|_, window| now.duration_since(window.last_insert()) < ttl);
        before.saturating_sub(self.windows.len())
    }
}

fn check_thresholds(event: &TelemetryEvent, t: &AnomalyThresholds, alerts: &mut Vec<Alert>) {
    let machine = event.machine_id.as_str();

    if event.conveyor_speed < t.conveyor_speed_min {
        alerts.push(Alert::new(
            machine,
            "conveyor_speed_low",
            Severity::High,
            format!(
                "Conveyor speed below minimum threshold: {:.2} m/s (min: {:.2})",
                event.conveyor_speed, t.conveyor_speed_min
            ),
        ));
    } else if event.conveyor_speed > t.conveyor_speed_max {
        alerts.push(Alert::new(
            machine,
            "conveyor_speed_high",
            Severity::High,
            format!(
                "Conveyor speed above maximum threshold: {:.2} m/s (max: {:.2})",
                event.conveyor_speed, t.conveyor_speed_max
            ),
        ));
    }

    if event.temperature < t.temperature_min {
        alerts.push(Alert::new(
            machine,
            "temperature_low",
            Severity::High,
            format!(
                "Temperature below minimum threshold: {:.1}°C (min: {:.1})",
                event.temperature, t.temperature_min
            ),
        ));
    } else if event.temperature > t.temperature_max {
        alerts.push(Alert::new(
            machine,
            "temperature_high",
            Severity::High,
            format!(
                "Temperature above maximum threshold: {:.1}°C (max: {:.1})",
                event.temperature, t.temperature_max
            ),
        ));
    }

    if event.robot_arm_angle < t.robot_angle_min || event.robot_arm_angle > t.robot_angle_max {
        alerts.push(Alert::new(
            machine,
            "robot_angle_invalid",
            Severity::Medium,
            format!(
                "Robot arm angle out of valid range: {:.1}° (range: {:.1}-{:.1})",
                event.robot_arm_angle, t.robot_angle_min, t.robot_angle_max
            ),
        ));
    }

    match event.status {
        Status::Fault => {
            let message = match event.details.as_ref().and_then(|d| d.description()) {
                Some(description) => format!("Machine fault: {description}"),
                None => format!("Machine fault detected: {}", event.event_type),
            };
            alerts.push(Alert::new(
                machine,
                event.event_type.as_str(),
                Severity::High,
                message,
            ));
        }
        Status::Warning => {
            alerts.push(Alert::new(
                machine,
                event.event_type.as_str(),
                Severity::Medium,
                format!("Warning condition: {}", event.event_type),
            ));
        }
        Status::Ok => {}
    }
}

fn check_trends(event: &TelemetryEvent, tail: &[Arc<TelemetryEvent>], alerts: &mut Vec<Alert>) {
    if tail.len() < TREND_WINDOW {
        return;
    }

    if let Some(rate) = temperature_rate(tail) {
        if rate.abs() > TEMPERATURE_RATE_LIMIT {
            alerts.push(Alert::new(
                event.machine_id.as_str(),
                "rapid_temperature_change",
                Severity::Medium,
                format!(
                    "Rapid temperature change detected on machine {}: {:+.2}°C/s",
                    event.machine_id, rate
                ),
            ));
        }
    }

    let stddev = speed_stddev(tail);
    if stddev > SPEED_STDDEV_LIMIT {
        alerts.push(Alert::new(
            event.machine_id.as_str(),
            "speed_instability",
            Severity::Medium,
            format!(
                "Conveyor speed instability detected on machine {}: σ={:.2} m/s",
                event.machine_id, stddev
            ),
        ));
    }
}

fn check_patterns(event: &TelemetryEvent, tail: &[Arc<TelemetryEvent>], alerts: &mut Vec<Alert>) {
    if tail.len() < PATTERN_MIN_EVENTS {
        return;
    }

    let faults = tail.iter().filter(|e| e.status == Status::Fault).count();
    if faults >= REPEATED_FAULT_LIMIT {
        alerts.push(Alert::new(
            event.machine_id.as_str(),
            "repeated_faults",
            Severity::High,
            format!(
                "Multiple faults detected in recent history ({faults} faults in last {} events)",
                tail.len()
            ),
        ));
    }
}

/// Temperature slope between the first and last event, in °C/s.
///
/// `None` when the events do not span a positive time interval.
fn temperature_rate(events: &[Arc<TelemetryEvent>]) -> Option<f64> {
    let first = events.first()?;
    let last = events.last()?;

    let span = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0;
    if span <= 0.0 {
        return None;
    }
    Some((last.temperature - first.temperature) / span)
}

/// Population standard deviation of conveyor speed.
fn speed_stddev(events: &[Arc<TelemetryEvent>]) -> f64 {
    if events.is_empty() {
        return 0.0;
    }
    let n = events.len() as f64;
    let mean = events.iter().map(|e| e.conveyor_speed).sum::<f64>() / n;
    let variance = events
        .iter()
        .map(|e| (e.conveyor_speed - mean).powi(2))
        .sum::<f64>()
        / n;
    variance.sqrt()
}

use anyhow::Result;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

const NAMESPACE: &str = "linewatch";

/// Prometheus metrics for the pipeline.
///
/// All metrics use the "linewatch" namespace and live in a private
/// registry served at `/metrics`.
pub struct HealthMetrics {
    registry: Registry,

    // === Ingestion ===
    /// Messages pulled from the broker.
    pub events_received: Counter,
    /// Messages dropped by decode or validation, by reason.
    pub events_invalid: CounterVec,
    /// Broker errors surfaced by the consumer, by severity.
    pub broker_errors: CounterVec,
    /// Consumer group rebalances observed.
    pub consumer_rebalances: Counter,
    /// Error reports dropped because the error channel was full.
    pub error_reports_dropped: Counter,

    // === Processing ===
    /// Events written to the store.
    pub events_persisted: Counter,
    /// Store write failures by target (event/alert) and kind.
    pub persistence_errors: CounterVec,
    /// Alerts raised by alert type.
    pub alerts_raised: CounterVec,
    /// Time from dequeue to broadcast of one event (50us-50ms buckets).
    pub event_processing_duration: Histogram,
    /// Machines with a live anomaly window.
    pub machine_windows: Gauge,

    // === Broadcast ===
    /// Currently registered subscribers.
    pub subscribers_connected: Gauge,
    /// Subscribers dropped for a full mailbox.
    pub subscribers_dropped: Counter,
    /// Messages broadcast by message type.
    pub broadcast_messages: CounterVec,
}

impl HealthMetrics {
    /// Creates a metrics instance with every metric registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        // === Ingestion ===
        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total messages received from the broker.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_invalid = CounterVec::new(
            Opts::new(
                "events_invalid_total",
                "Total messages dropped by decode or validation, by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let broker_errors = CounterVec::new(
            Opts::new("broker_errors_total", "Total broker errors by severity.")
                .namespace(NAMESPACE),
            &["severity"],
        )?;
        let consumer_rebalances = Counter::with_opts(
            Opts::new(
                "consumer_rebalances_total",
                "Total consumer group rebalances.",
            )
            .namespace(NAMESPACE),
        )?;
        let error_reports_dropped = Counter::with_opts(
            Opts::new(
                "error_reports_dropped_total",
                "Total error reports dropped on a full error channel.",
            )
            .namespace(NAMESPACE),
        )?;

        // === Processing ===
        let events_persisted = Counter::with_opts(
            Opts::new("events_persisted_total", "Total events written to the store.")
                .namespace(NAMESPACE),
        )?;
        let persistence_errors = CounterVec::new(
            Opts::new(
                "persistence_errors_total",
                "Total store write failures by target and kind.",
            )
            .namespace(NAMESPACE),
            &["target", "kind"],
        )?;
        let alerts_raised = CounterVec::new(
            Opts::new("alerts_raised_total", "Total alerts raised by alert type.")
                .namespace(NAMESPACE),
            &["alert_type"],
        )?;
        let event_processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "event_processing_duration_seconds",
                "Time to persist, analyze and broadcast a single event.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05]),
        )?;
        let machine_windows = Gauge::with_opts(
            Opts::new(
                "machine_windows",
                "Number of machines with a live anomaly window.",
            )
            .namespace(NAMESPACE),
        )?;

        // === Broadcast ===
        let subscribers_connected = Gauge::with_opts(
            Opts::new(
                "subscribers_connected",
                "Number of currently registered subscribers.",
            )
            .namespace(NAMESPACE),
        )?;
        let subscribers_dropped = Counter::with_opts(
            Opts::new(
                "subscribers_dropped_total",
                "Total subscribers dropped for a full mailbox.",
            )
            .namespace(NAMESPACE),
        )?;
        let broadcast_messages = CounterVec::new(
            Opts::new(
                "broadcast_messages_total",
                "Total messages broadcast by message type.",
            )
            .namespace(NAMESPACE),
            &["type"],
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_invalid.clone()))?;
        registry.register(Box::new(broker_errors.clone()))?;
        registry.register(Box::new(consumer_rebalances.clone()))?;
        registry.register(Box::new(error_reports_dropped.clone()))?;
        registry.register(Box::new(events_persisted.clone()))?;
        registry.register(Box::new(persistence_errors.clone()))?;
        registry.register(Box::new(alerts_raised.clone()))?;
        registry.register(Box::new(event_processing_duration.clone()))?;
        registry.register(Box::new(machine_windows.clone()))?;
        registry.register(Box::new(subscribers_connected.clone()))?;
        registry.register(Box::new(subscribers_dropped.clone()))?;
        registry.register(Box::new(broadcast_messages.clone()))?;

        Ok(Self {
            registry,
            events_received,
            events_invalid,
            broker_errors,
            consumer_rebalances,
            error_reports_dropped,
            events_persisted,
            persistence_errors,
            alerts_raised,
            event_processing_duration,
            machine_windows,
            subscribers_connected,
            subscribers_dropped,
            broadcast_messages,
        })
    }

    /// Renders the registry in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

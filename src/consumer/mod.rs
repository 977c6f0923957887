#[cfg(feature = "kafka")]
pub mod kafka;
pub mod source;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::decode::{self, DecodeError, ValidationError};
use crate::event::TelemetryEvent;
use crate::server::health::HealthMetrics;

pub use self::source::{BrokerError, ChannelSource, MessageSource, RawMessage, SourceEvent};

/// How long a decoded event may wait for channel room once stop is requested.
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(10);

/// Error reported on the consumer's error channel.
#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),

    #[error("validation: {0}")]
    Validation(#[from] ValidationError),

    #[error("broker: {error}")]
    Broker { error: BrokerError, fatal: bool },
}

impl ConsumeError {
    /// Label used for the invalid-events metric.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Validation(e) => e.reason(),
            Self::Broker { .. } => "broker",
        }
    }
}

/// Consumer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Started,
    Consuming,
    Rebalancing,
    /// Terminal.
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Consuming => "consuming",
            Self::Rebalancing => "rebalancing",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Pulls records from a [`MessageSource`], decodes and validates them, and
/// hands valid events downstream.
///
/// Both channels are created up front; take the receivers with
/// [`take_events`](Self::take_events) and [`take_errors`](Self::take_errors)
/// before calling [`start`](Self::start). The senders live in the consume
/// task, so both channels close once it exits.
pub struct StreamConsumer<S: MessageSource> {
    source: Option<S>,
    state: Arc<Mutex<ConsumerState>>,
    event_tx: Option<mpsc::Sender<TelemetryEvent>>,
    event_rx: Option<mpsc::Receiver<TelemetryEvent>>,
    error_tx: Option<mpsc::Sender<ConsumeError>>,
    error_rx: Option<mpsc::Receiver<ConsumeError>>,
    metrics: Option<Arc<HealthMetrics>>,
    handoff_timeout: Duration,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<S: MessageSource> StreamConsumer<S> {
    pub fn new(
        source: S,
        event_capacity: usize,
        error_capacity: usize,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(event_capacity.max(1));
        let (error_tx, error_rx) = mpsc::channel(error_capacity.max(1));

        Self {
            source: Some(source),
            state: Arc::new(Mutex::new(ConsumerState::Created)),
            event_tx: Some(event_tx),
            event_rx: Some(event_rx),
            error_tx: Some(error_tx),
            error_rx: Some(error_rx),
            metrics,
            handoff_timeout: DEFAULT_HANDOFF_TIMEOUT,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Bounds how long stop waits to hand off an event that was already
    /// decoded when cancellation arrived.
    pub fn with_handoff_timeout(mut self, timeout: Duration) -> Self {
        self.handoff_timeout = timeout;
        self
    }

    /// Takes the receiving end of the event channel.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TelemetryEvent>> {
        self.event_rx.take()
    }

    /// Takes the receiving end of the error channel.
    pub fn take_errors(&mut self) -> Option<mpsc::Receiver<ConsumeError>> {
        self.error_rx.take()
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    /// Connects the source and spawns the consume loop.
    ///
    /// The loop stops when `parent` is cancelled, on [`stop`](Self::stop),
    /// when the source ends, or on a fatal broker error.
    pub async fn start(&mut self, parent: &CancellationToken) -> Result<(), BrokerError> {
        let (Some(mut source), Some(events), Some(errors)) =
            (self.source.take(), self.event_tx.take(), self.error_tx.take())
        else {
            return Err(BrokerError::new("consumer already started"));
        };

        if let Err(e) = source.connect().await {
            *self.state.lock() = ConsumerState::Stopped;
            return Err(e);
        }

        self.cancel = parent.child_token();
        *self.state.lock() = ConsumerState::Started;
        info!(source = source.name(), "stream consumer started");

        let worker = ConsumeLoop {
            state: Arc::clone(&self.state),
            events,
            errors,
            metrics: self.metrics.clone(),
            handoff_timeout: self.handoff_timeout,
            cancel: self.cancel.clone(),
        };
        self.task = Some(tokio::spawn(worker.run(source)));

        Ok(())
    }

    /// Stops consuming and waits for the loop to exit, closing both channels.
    ///
    /// An event decoded before the stop still gets handed downstream, waiting
    /// up to the hand-off timeout for channel room. Past that it is dropped
    /// and logged; its offset may already be committed.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "consume task panicked");
            }
        }

        // Never started: drop the senders so receivers still observe closure.
        self.event_tx.take();
        self.error_tx.take();
        *self.state.lock() = ConsumerState::Stopped;
    }
}

struct ConsumeLoop {
    state: Arc<Mutex<ConsumerState>>,
    events: mpsc::Sender<TelemetryEvent>,
    errors: mpsc::Sender<ConsumeError>,
    metrics: Option<Arc<HealthMetrics>>,
    handoff_timeout: Duration,
    cancel: CancellationToken,
}

impl ConsumeLoop {
    async fn run<S: MessageSource>(self, mut source: S) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = source.recv() => next,
            };

            let Some(next) = next else {
                info!(source = source.name(), "source exhausted");
                break;
            };

            match next {
                SourceEvent::Message(msg) => {
                    self.set_state(ConsumerState::Consuming);
                    if let Some(m) = &self.metrics {
                        m.events_received.inc();
                    }

                    match parse(&msg) {
                        // Await capacity so a slow pipeline slows the broker
                        // rather than losing events.
                        Ok(event) => match self.reserve().await {
                            Some(permit) => permit.send(event),
                            None => {
                                warn!(
                                    machine_id = %event.machine_id,
                                    topic = %msg.topic,
                                    partition = msg.partition,
                                    offset = msg.offset,
                                    "event not handed off before shutdown, dropping",
                                );
                                break;
                            }
                        },
                        Err(e) => {
                            debug!(
                                topic = %msg.topic,
                                partition = msg.partition,
                                offset = msg.offset,
                                error = %e,
                                "dropping invalid message",
                            );
                            self.report(e);
                        }
                    }
                }
                SourceEvent::Assigned => {
                    self.set_state(ConsumerState::Consuming);
                    info!("partitions assigned");
                }
                SourceEvent::Rebalance => {
                    self.set_state(ConsumerState::Rebalancing);
                    info!("consumer group rebalancing");
                    if let Some(m) = &self.metrics {
                        m.consumer_rebalances.inc();
                    }
                }
                SourceEvent::Error { error, fatal } => {
                    self.report(ConsumeError::Broker { error, fatal });
                    if fatal {
                        break;
                    }
                }
            }
        }

        self.set_state(ConsumerState::Stopped);
        info!("stream consumer stopped");
    }

    /// Waits for room in the event channel. After cancellation the wait
    /// continues for at most the hand-off timeout.
    async fn reserve(&self) -> Option<mpsc::Permit<'_, TelemetryEvent>> {
        tokio::select! {
            biased;
            permit = self.events.reserve() => permit.ok(),
            _ = self.cancel.cancelled() => {
                time::timeout(self.handoff_timeout, self.events.reserve())
                    .await
                    .ok()
                    .and_then(Result::ok)
            }
        }
    }

    fn set_state(&self, next: ConsumerState) {
        let mut state = self.state.lock();
        let prev = *state;
        if prev != next {
            debug!(from = %prev, to = %next, "consumer state");
            *state = next;
        }
    }

    fn report(&self, error: ConsumeError) {
        match self.errors.try_send(error) {
            Ok(()) => {}
            Err(TrySendError::Full(e)) => {
                warn!(error = %e, "error channel full, dropping report");
                if let Some(m) = &self.metrics {
                    m.error_reports_dropped.inc();
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

fn parse(msg: &RawMessage) -> Result<TelemetryEvent, ConsumeError> {
    Ok(decode::decode(&msg.payload)?.validate()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{"timestamp":"2024-05-01T12:00:00Z","machine_id":"m1","conveyor_speed":1.0,"temperature":40.0,"robot_arm_angle":90.0,"status":"ok","event_type":"normal"}"#;

    fn message(payload: &str) -> SourceEvent {
        SourceEvent::Message(RawMessage::new("telemetry", payload.as_bytes()))
    }

    #[tokio::test]
    async fn test_valid_and_invalid_messages_are_routed() {
        let (tx, source) = ChannelSource::channel(16);
        let mut consumer = StreamConsumer::new(source, 16, 16, None);
        let mut events = consumer.take_events().expect("events");
        let mut errors = consumer.take_errors().expect("errors");

        consumer
            .start(&CancellationToken::new())
            .await
            .expect("start");

        tx.send(message(VALID)).await.expect("send");
        tx.send(message("{not json")).await.expect("send");
        tx.send(message(&VALID.replace("\"ok\"", "\"bogus\"")))
            .await
            .expect("send");
        drop(tx);

        let event = events.recv().await.expect("event");
        assert_eq!(event.machine_id, "m1");
        assert!(events.recv().await.is_none(), "channel closes when source ends");

        let first = errors.recv().await.expect("decode error");
        assert!(matches!(first, ConsumeError::Decode(_)));
        let second = errors.recv().await.expect("validation error");
        assert_eq!(second.reason(), "invalid_status");
        assert!(errors.recv().await.is_none());

        consumer.stop().await;
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn test_rebalance_state_transitions() {
        let (tx, source) = ChannelSource::channel(16);
        let mut consumer = StreamConsumer::new(source, 16, 16, None);
        let mut events = consumer.take_events().expect("events");
        assert_eq!(consumer.state(), ConsumerState::Created);

        consumer
            .start(&CancellationToken::new())
            .await
            .expect("start");
        assert_eq!(consumer.state(), ConsumerState::Started);

        tx.send(SourceEvent::Rebalance).await.expect("send");
        tx.send(SourceEvent::Assigned).await.expect("send");
        tx.send(SourceEvent::Rebalance).await.expect("send");
        tx.send(message(VALID)).await.expect("send");

        // The message is processed after the rebalance notice.
        events.recv().await.expect("event");
        assert_eq!(consumer.state(), ConsumerState::Consuming);

        tx.send(SourceEvent::Rebalance).await.expect("send");
        tx.send(message(VALID)).await.expect("send");
        events.recv().await.expect("event");

        consumer.stop().await;
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_fatal_broker_error_stops_consumer() {
        let (tx, source) = ChannelSource::channel(16);
        let mut consumer = StreamConsumer::new(source, 16, 16, None);
        let mut events = consumer.take_events().expect("events");
        let mut errors = consumer.take_errors().expect("errors");
        consumer
            .start(&CancellationToken::new())
            .await
            .expect("start");

        tx.send(SourceEvent::Error {
            error: BrokerError::new("transport down"),
            fatal: false,
        })
        .await
        .expect("send");
        tx.send(SourceEvent::Error {
            error: BrokerError::new("fenced"),
            fatal: true,
        })
        .await
        .expect("send");

        assert!(matches!(
            errors.recv().await,
            Some(ConsumeError::Broker { fatal: false, .. })
        ));
        assert!(matches!(
            errors.recv().await,
            Some(ConsumeError::Broker { fatal: true, .. })
        ));
        assert!(events.recv().await.is_none());
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn test_parent_cancel_closes_channels() {
        let (_tx, source) = ChannelSource::channel(16);
        let mut consumer = StreamConsumer::new(source, 16, 16, None);
        let mut events = consumer.take_events().expect("events");
        let parent = CancellationToken::new();
        consumer.start(&parent).await.expect("start");

        parent.cancel();
        assert!(events.recv().await.is_none());
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_full_error_channel_drops_reports() {
        let metrics = Arc::new(HealthMetrics::new().expect("metrics"));
        let (tx, source) = ChannelSource::channel(16);
        let mut consumer = StreamConsumer::new(source, 16, 1, Some(Arc::clone(&metrics)));
        let mut events = consumer.take_events().expect("events");
        let _errors = consumer.take_errors().expect("errors");
        consumer
            .start(&CancellationToken::new())
            .await
            .expect("start");

        for _ in 0..3 {
            tx.send(message("")).await.expect("send");
        }
        drop(tx);

        assert!(events.recv().await.is_none());
        assert_eq!(metrics.error_reports_dropped.get(), 2.0);
        assert_eq!(metrics.events_received.get(), 3.0);
    }

    /// Starts a consumer whose event channel holds one event, then feeds two
    /// valid messages so the second is decoded but waiting for room.
    async fn blocked_on_handoff(
        handoff: Duration,
    ) -> (StreamConsumer<ChannelSource>, mpsc::Receiver<TelemetryEvent>) {
        let metrics = Arc::new(HealthMetrics::new().expect("metrics"));
        let (tx, source) = ChannelSource::channel(4);
        let mut consumer = StreamConsumer::new(source, 1, 4, Some(Arc::clone(&metrics)))
            .with_handoff_timeout(handoff);
        let events = consumer.take_events().expect("events");
        consumer
            .start(&CancellationToken::new())
            .await
            .expect("start");

        tx.send(message(VALID)).await.expect("send");
        tx.send(message(&VALID.replace("\"m1\"", "\"m2\"")))
            .await
            .expect("send");
        while metrics.events_received.get() < 2.0 {
            time::sleep(Duration::from_millis(5)).await;
        }
        (consumer, events)
    }

    #[tokio::test]
    async fn test_stop_hands_off_decoded_event() {
        let (mut consumer, mut events) = blocked_on_handoff(Duration::from_secs(5)).await;

        let reader = tokio::spawn(async move {
            time::sleep(Duration::from_millis(50)).await;
            let mut machines = Vec::new();
            while let Some(event) = events.recv().await {
                machines.push(event.machine_id);
            }
            machines
        });

        consumer.stop().await;
        assert_eq!(reader.await.expect("reader"), vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_stop_bounds_handoff_wait() {
        let (mut consumer, mut events) = blocked_on_handoff(Duration::from_millis(50)).await;

        time::timeout(Duration::from_secs(2), consumer.stop())
            .await
            .expect("stop returns after the hand-off timeout");

        assert_eq!(events.recv().await.expect("first event").machine_id, "m1");
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (_tx, source) = ChannelSource::channel(1);
        let mut consumer = StreamConsumer::new(source, 1, 1, None);
        let cancel = CancellationToken::new();
        consumer.start(&cancel).await.expect("start");
        assert!(consumer.start(&cancel).await.is_err());
        consumer.stop().await;
    }
}

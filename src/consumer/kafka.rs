use std::sync::Arc;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{ClientContext, Message};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::BrokerConfig;

use super::source::{BrokerError, MessageSource, RawMessage, SourceEvent};

/// Bound on queued group notifications; overflow is dropped.
const GROUP_EVENT_CAPACITY: usize = 64;

/// Forwards client errors and rebalance notifications into the source.
struct GroupContext {
    events: mpsc::Sender<SourceEvent>,
}

impl GroupContext {
    fn notify(&self, event: SourceEvent) {
        if self.events.try_send(event).is_err() {
            debug!("group notification queue full, dropping");
        }
    }
}

impl ClientContext for GroupContext {
    fn error(&self, error: KafkaError, reason: &str) {
        self.notify(SourceEvent::Error {
            fatal: is_fatal(&error),
            error: BrokerError::new(format!("{error}: {reason}")),
        });
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(_) => self.notify(SourceEvent::Rebalance),
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => self.notify(SourceEvent::Error {
                error: BrokerError::new(format!("rebalance: {e}")),
                fatal: false,
            }),
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(partitions) = rebalance {
            debug!(partitions = partitions.count(), "partitions assigned");
            self.notify(SourceEvent::Assigned);
        }
    }
}

/// Kafka consumer-group member.
///
/// Uses round-robin partition assignment and auto-commits consumed offsets;
/// reconnection and rejoin are left to librdkafka.
pub struct KafkaSource {
    consumer: Arc<StreamConsumer<GroupContext>>,
    group_events: mpsc::Receiver<SourceEvent>,
    topics: Vec<String>,
    metadata_timeout: std::time::Duration,
}

impl KafkaSource {
    pub fn new(cfg: &BrokerConfig) -> Result<Self, BrokerError> {
        let (tx, rx) = mpsc::channel(GROUP_EVENT_CAPACITY);

        let consumer: StreamConsumer<GroupContext> = ClientConfig::new()
            .set("bootstrap.servers", cfg.brokers.join(","))
            .set("group.id", &cfg.group_id)
            .set("partition.assignment.strategy", "roundrobin")
            .set("auto.offset.reset", &cfg.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set(
                "session.timeout.ms",
                cfg.session_timeout.as_millis().to_string(),
            )
            .set(
                "heartbeat.interval.ms",
                cfg.heartbeat_interval.as_millis().to_string(),
            )
            .create_with_context(GroupContext { events: tx })
            .map_err(|e| BrokerError::new(format!("creating consumer: {e}")))?;

        Ok(Self {
            consumer: Arc::new(consumer),
            group_events: rx,
            topics: cfg.topics.clone(),
            metadata_timeout: cfg.metadata_timeout,
        })
    }
}

impl MessageSource for KafkaSource {
    fn name(&self) -> &str {
        "kafka"
    }

    async fn connect(&mut self) -> Result<(), BrokerError> {
        // fetch_metadata blocks on the network.
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.metadata_timeout;
        let metadata = tokio::task::spawn_blocking(move || consumer.fetch_metadata(None, timeout))
            .await
            .map_err(|e| BrokerError::new(format!("metadata task failed: {e}")))?
            .map_err(|e| BrokerError::new(format!("fetching metadata: {e}")))?;

        info!(
            brokers = metadata.brokers().len(),
            topics = metadata.topics().len(),
            "connected to kafka",
        );

        let topic_refs: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topic_refs)
            .map_err(|e| BrokerError::new(format!("subscribing to {topic_refs:?}: {e}")))?;

        Ok(())
    }

    async fn recv(&mut self) -> Option<SourceEvent> {
        // Group notifications take priority over records.
        tokio::select! {
            biased;
            Some(event) = self.group_events.recv() => Some(event),
            result = self.consumer.recv() => Some(match result {
                Ok(msg) => SourceEvent::Message(RawMessage {
                    topic: msg.topic().to_string(),
                    partition: msg.partition(),
                    offset: msg.offset(),
                    key: msg.key().map(<[u8]>::to_vec),
                    payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                }),
                Err(e) => SourceEvent::Error {
                    fatal: is_fatal(&e),
                    error: BrokerError::new(e.to_string()),
                },
            }),
        }
    }
}

fn is_fatal(error: &KafkaError) -> bool {
    error.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal)
}

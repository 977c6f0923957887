use thiserror::Error;
use tokio::sync::mpsc;

/// Connectivity or group-coordination failure reported by a source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct BrokerError(pub String);

impl BrokerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A raw broker record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Conventionally the machine id.
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl RawMessage {
    /// A keyless record at partition 0, offset 0.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset: 0,
            key: None,
            payload: payload.into(),
        }
    }
}

/// Everything a source can report to the consumer loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Message(RawMessage),
    /// Partitions were assigned to this member.
    Assigned,
    /// The group is rebalancing; partitions were revoked.
    Rebalance,
    /// A broker error. Fatal errors end consumption.
    Error { error: BrokerError, fatal: bool },
}

/// A pull-based feed of broker records under one consumer-group identity.
///
/// Reconnection and group membership are the source's own concern; the
/// consumer loop only observes the resulting events.
pub trait MessageSource: Send + 'static {
    /// Returns the source's name for logging.
    fn name(&self) -> &str;

    /// Verifies initial connectivity. Failure aborts startup.
    fn connect(&mut self) -> impl std::future::Future<Output = Result<(), BrokerError>> + Send;

    /// Waits for the next event. `None` means the source is exhausted.
    fn recv(&mut self) -> impl std::future::Future<Output = Option<SourceEvent>> + Send;
}

/// In-process source fed through a channel.
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<SourceEvent>,
}

impl ChannelSource {
    /// Creates a source and the sender that feeds it. Dropping every sender
    /// ends the stream.
    pub fn channel(capacity: usize) -> (mpsc::Sender<SourceEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }
}

impl MessageSource for ChannelSource {
    fn name(&self) -> &str {
        "channel"
    }

    async fn connect(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn recv(&mut self) -> Option<SourceEvent> {
        self.rx.recv().await
    }
}

//! Subscriber wire protocol.
//!
//! Outbound frames are `{"type", "data", "timestamp"}` JSON objects. Inbound
//! frames are control messages: `subscribe`/`unsubscribe` carrying
//! `data.topics`, and `ping`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::EventStats;

/// Type tag of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    SensorEvent,
    Alert,
    Stats,
    Connection,
    Pong,
}

impl MessageKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SensorEvent => "sensor_event",
            Self::Alert => "alert",
            Self::Stats => "stats",
            Self::Connection => "connection",
            Self::Pong => "pong",
        }
    }

    /// Connection notices and pongs are addressed to a single subscriber.
    pub const fn is_direct(self) -> bool {
        matches!(self, Self::Connection | Self::Pong)
    }
}

/// Outbound envelope, serialized once per publish.
#[derive(Debug, Serialize)]
pub struct OutboundMessage<'a, T: Serialize> {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub data: &'a T,
    pub timestamp: DateTime<Utc>,
}

impl<'a, T: Serialize> OutboundMessage<'a, T> {
    pub fn new(kind: MessageKind, data: &'a T) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Payload of a `stats` message.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub system_stats: EventStats,
    pub connected_clients: usize,
    pub timestamp: DateTime<Utc>,
}

/// Rejected inbound frame.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown control message type: {0}")]
    UnknownType(String),
}

/// Parsed inbound control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Ping,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<TopicList>,
}

#[derive(Deserialize, Default)]
struct TopicList {
    #[serde(default)]
    topics: Vec<String>,
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, ControlError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let topics = || envelope.data.unwrap_or_default().topics;

        match envelope.kind.as_str() {
            "subscribe" => Ok(Self::Subscribe(topics())),
            "unsubscribe" => Ok(Self::Unsubscribe(topics())),
            "ping" => Ok(Self::Ping),
            other => Err(ControlError::UnknownType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe() {
        let msg = InboundMessage::parse(
            r#"{"type":"subscribe","data":{"topics":["alert","m7"]}}"#,
        )
        .expect("parse");
        assert_eq!(
            msg,
            InboundMessage::Subscribe(vec!["alert".to_string(), "m7".to_string()])
        );
    }

    #[test]
    fn test_parse_ping_with_and_without_data() {
        assert_eq!(
            InboundMessage::parse(r#"{"type":"ping"}"#).expect("parse"),
            InboundMessage::Ping
        );
        assert_eq!(
            InboundMessage::parse(r#"{"type":"ping","data":{}}"#).expect("parse"),
            InboundMessage::Ping
        );
    }

    #[test]
    fn test_parse_rejects_unknown_and_garbage() {
        assert!(matches!(
            InboundMessage::parse(r#"{"type":"reboot"}"#),
            Err(ControlError::UnknownType(t)) if t == "reboot"
        ));
        assert!(matches!(
            InboundMessage::parse("{"),
            Err(ControlError::Malformed(_))
        ));
    }

    #[test]
    fn test_outbound_envelope_shape() {
        let data = serde_json::json!({"client_id": "abc"});
        let json = serde_json::to_value(OutboundMessage::new(MessageKind::Pong, &data))
            .expect("serialize");
        assert_eq!(json["type"], "pong");
        assert_eq!(json["data"]["client_id"], "abc");
        assert!(json["timestamp"].is_string());
    }
}

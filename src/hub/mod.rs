pub mod message;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{Alert, TelemetryEvent};
use crate::server::health::HealthMetrics;

pub use self::message::{InboundMessage, MessageKind, OutboundMessage, StatsSnapshot};

/// Default per-subscriber mailbox bound.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

pub type SubscriberId = Uuid;

/// A serialized outbound frame shared by every recipient.
pub type Payload = Arc<str>;

/// Receiving half handed to a subscriber connection on registration.
///
/// The `connection` notice travels beside the mailbox, so the mailbox bound
/// counts broadcast frames only. The mailbox closes once the hub drops the
/// subscriber, either on [`BroadcastHub::unregister`], on overflow, or on
/// [`BroadcastHub::close_all`].
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    /// Serialized `connection` frame, written before any mailbox frame.
    pub notice: Option<Payload>,
    pub mailbox: mpsc::Receiver<Payload>,
}

struct Subscriber {
    mailbox: mpsc::Sender<Payload>,
    topics: RwLock<HashSet<String>>,
}

impl Subscriber {
    fn matches(&self, kind: MessageKind, machine_id: Option<&str>) -> bool {
        let topics = self.topics.read();
        topics.is_empty()
            || topics.contains(kind.as_str())
            || machine_id.is_some_and(|id| topics.contains(id))
    }
}

/// Fans serialized messages out to registered subscribers.
///
/// Publishing never waits on a subscriber: each frame is offered to every
/// matching mailbox with `try_send`, and a subscriber whose mailbox is full is
/// dropped on the spot.
pub struct BroadcastHub {
    subscribers: RwLock<HashMap<SubscriberId, Arc<Subscriber>>>,
    mailbox_capacity: usize,
    metrics: Option<Arc<HealthMetrics>>,
}

impl BroadcastHub {
    pub fn new(mailbox_capacity: usize, metrics: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            mailbox_capacity: mailbox_capacity.max(1),
            metrics,
        }
    }

    /// Registers a new subscriber and prepares its `connection` notice.
    pub fn register(&self) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.mailbox_capacity);

        let notice = encode(
            MessageKind::Connection,
            &serde_json::json!({
                "status": "connected",
                "client_id": id,
            }),
        );

        let count = {
            let mut subscribers = self.subscribers.write();
            subscribers.insert(
                id,
                Arc::new(Subscriber {
                    mailbox: tx,
                    topics: RwLock::new(HashSet::new()),
                }),
            );
            subscribers.len()
        };
        self.set_connected(count);

        info!(client_id = %id, clients = count, "subscriber registered");

        Subscription {
            id,
            notice,
            mailbox: rx,
        }
    }

    /// Removes a subscriber, closing its mailbox. Unknown ids are ignored.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let (removed, count) = {
            let mut subscribers = self.subscribers.write();
            (subscribers.remove(&id).is_some(), subscribers.len())
        };

        if removed {
            self.set_connected(count);
            info!(client_id = %id, clients = count, "subscriber unregistered");
        }

        removed
    }

    /// Adds topics to a subscriber's filter.
    pub fn subscribe<I>(&self, id: SubscriberId, topics: I) -> bool
    where
        I: IntoIterator<Item = String>,
    {
        let Some(subscriber) = self.get(id) else {
            return false;
        };
        subscriber.topics.write().extend(topics);
        true
    }

    /// Removes topics from a subscriber's filter.
    pub fn unsubscribe<I>(&self, id: SubscriberId, topics: I) -> bool
    where
        I: IntoIterator<Item = String>,
    {
        let Some(subscriber) = self.get(id) else {
            return false;
        };
        let mut filter = subscriber.topics.write();
        for topic in topics {
            filter.remove(&topic);
        }
        true
    }

    /// Applies an inbound control message from a subscriber.
    pub fn handle_control(&self, id: SubscriberId, message: InboundMessage) {
        match message {
            InboundMessage::Subscribe(topics) => {
                debug!(client_id = %id, ?topics, "subscribe");
                self.subscribe(id, topics);
            }
            InboundMessage::Unsubscribe(topics) => {
                debug!(client_id = %id, ?topics, "unsubscribe");
                self.unsubscribe(id, topics);
            }
            InboundMessage::Ping => {
                let data = serde_json::json!({ "client_id": id });
                self.send_to(id, MessageKind::Pong, &data);
            }
        }
    }

    pub fn publish_event(&self, event: &TelemetryEvent) -> usize {
        self.publish(MessageKind::SensorEvent, Some(&event.machine_id), event)
    }

    pub fn publish_alert(&self, alert: &Alert) -> usize {
        self.publish(MessageKind::Alert, Some(&alert.machine_id), alert)
    }

    pub fn publish_stats(&self, snapshot: &StatsSnapshot) -> usize {
        self.publish(MessageKind::Stats, None, snapshot)
    }

    /// Number of registered subscribers.
    pub fn client_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Drops every subscriber, closing all mailboxes.
    pub fn close_all(&self) {
        let closed = {
            let mut subscribers = self.subscribers.write();
            let n = subscribers.len();
            subscribers.clear();
            n
        };
        self.set_connected(0);
        if closed > 0 {
            info!(clients = closed, "closed all subscribers");
        }
    }

    /// Serializes once and offers the frame to every matching subscriber.
    ///
    /// Returns the number of mailboxes the frame was queued to.
    fn publish<T: Serialize>(
        &self,
        kind: MessageKind,
        machine_id: Option<&str>,
        data: &T,
    ) -> usize {
        let Some(payload) = encode(kind, data) else {
            return 0;
        };

        // Snapshot under the read lock, enqueue outside it.
        let targets: Vec<(SubscriberId, Arc<Subscriber>)> = self
            .subscribers
            .read()
            .iter()
            .map(|(id, s)| (*id, Arc::clone(s)))
            .collect();

        let mut delivered = 0;
        for (id, subscriber) in targets {
            if !subscriber.matches(kind, machine_id) {
                continue;
            }
            if self.offer(id, &subscriber, Arc::clone(&payload)) {
                delivered += 1;
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .broadcast_messages
                .with_label_values(&[kind.as_str()])
                .inc();
        }

        delivered
    }

    fn send_to<T: Serialize>(&self, id: SubscriberId, kind: MessageKind, data: &T) -> bool {
        debug_assert!(kind.is_direct());
        let Some(subscriber) = self.get(id) else {
            return false;
        };
        let Some(payload) = encode(kind, data) else {
            return false;
        };
        self.offer(id, &subscriber, payload)
    }

    fn offer(&self, id: SubscriberId, subscriber: &Subscriber, payload: Payload) -> bool {
        match subscriber.mailbox.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if self.unregister(id) {
                    info!(client_id = %id, "dropped slow subscriber, mailbox full");
                    if let Some(metrics) = &self.metrics {
                        metrics.subscribers_dropped.inc();
                    }
                }
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.unregister(id);
                false
            }
        }
    }

    fn get(&self, id: SubscriberId) -> Option<Arc<Subscriber>> {
        self.subscribers.read().get(&id).cloned()
    }

    fn set_connected(&self, count: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.subscribers_connected.set(count as f64);
        }
    }
}

fn encode<T: Serialize>(kind: MessageKind, data: &T) -> Option<Payload> {
    match serde_json::to_string(&OutboundMessage::new(kind, data)) {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            warn!(kind = kind.as_str(), error = %e, "serializing outbound message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::event::{Severity, Status};
    use crate::store::EventStats;

    fn event(machine: &str) -> TelemetryEvent {
        TelemetryEvent {
            timestamp: Utc::now(),
            machine_id: machine.to_string(),
            conveyor_speed: 1.2,
            temperature: 44.0,
            robot_arm_angle: 30.0,
            status: Status::Ok,
            event_type: "normal".to_string(),
            details: None,
        }
    }

    fn kind_of(payload: &str) -> String {
        let value: serde_json::Value = serde_json::from_str(payload).expect("json");
        value["type"].as_str().expect("type").to_string()
    }

    /// Registers and checks the connection notice.
    fn connect(hub: &BroadcastHub) -> Subscription {
        let sub = hub.register();
        let notice = sub.notice.as_deref().expect("connection notice");
        assert_eq!(kind_of(notice), "connection");
        sub
    }

    #[test]
    fn test_connection_notice_carries_id() {
        let hub = BroadcastHub::new(8, None);
        let mut sub = hub.register();
        let notice = sub.notice.as_deref().expect("notice");
        let value: serde_json::Value = serde_json::from_str(notice).expect("json");
        assert_eq!(value["data"]["status"], "connected");
        assert_eq!(value["data"]["client_id"], sub.id.to_string());
        assert!(sub.mailbox.try_recv().is_err());
    }

    #[test]
    fn test_undrained_subscriber_dropped_on_second_publish() {
        let hub = BroadcastHub::new(1, None);
        let mut idle = hub.register();

        // The notice does not occupy the single mailbox slot.
        assert_eq!(hub.publish_event(&event("m1")), 1);
        assert_eq!(hub.client_count(), 1);

        assert_eq!(hub.publish_event(&event("m1")), 0);
        assert_eq!(hub.client_count(), 0);

        let frame = idle.mailbox.try_recv().expect("first frame kept");
        assert_eq!(kind_of(&frame), "sensor_event");
        assert_eq!(
            idle.mailbox.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        );
    }

    #[test]
    fn test_fan_out_identical_payload() {
        let hub = BroadcastHub::new(8, None);
        let mut subs: Vec<_> = (0..3).map(|_| connect(&hub)).collect();

        assert_eq!(hub.publish_event(&event("m1")), 3);

        let frames: Vec<Payload> = subs
            .iter_mut()
            .map(|s| s.mailbox.try_recv().expect("frame"))
            .collect();
        assert!(frames.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(kind_of(&frames[0]), "sensor_event");
    }

    #[test]
    fn test_publish_order_preserved() {
        let hub = BroadcastHub::new(8, None);
        let mut sub = connect(&hub);

        hub.publish_event(&event("m1"));
        hub.publish_alert(&Alert::new("m1", "temperature_high", Severity::High, "hot"));
        hub.publish_stats(&StatsSnapshot {
            system_stats: EventStats::default(),
            connected_clients: 1,
            timestamp: Utc::now(),
        });

        let kinds: Vec<String> = (0..3)
            .map(|_| kind_of(&sub.mailbox.try_recv().expect("frame")))
            .collect();
        assert_eq!(kinds, vec!["sensor_event", "alert", "stats"]);
    }

    #[test]
    fn test_full_mailbox_drops_only_slow_subscriber() {
        let metrics = Arc::new(HealthMetrics::new().expect("metrics"));
        let hub = BroadcastHub::new(1, Some(Arc::clone(&metrics)));
        let slow = connect(&hub);
        let mut fast = connect(&hub);

        assert_eq!(hub.publish_event(&event("m1")), 2);
        assert_eq!(hub.client_count(), 2);
        fast.mailbox.try_recv().expect("first frame");

        // Second publish finds the slow mailbox still full.
        assert_eq!(hub.publish_event(&event("m1")), 1);
        assert_eq!(hub.client_count(), 1);
        assert!(fast.mailbox.try_recv().is_ok());
        assert_eq!(metrics.subscribers_dropped.get(), 1.0);
        assert_eq!(metrics.subscribers_connected.get(), 1.0);

        drop(slow);
    }

    #[test]
    fn test_dropped_subscriber_mailbox_closes() {
        let hub = BroadcastHub::new(1, None);
        let mut slow = connect(&hub);
        hub.publish_event(&event("m1"));
        hub.publish_event(&event("m1"));

        assert!(slow.mailbox.try_recv().is_ok());
        assert_eq!(
            slow.mailbox.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        );
    }

    #[test]
    fn test_closed_receiver_is_unregistered() {
        let hub = BroadcastHub::new(4, None);
        let sub = connect(&hub);
        drop(sub);
        assert_eq!(hub.publish_event(&event("m1")), 0);
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn test_topic_filter_by_type_and_machine() {
        let hub = BroadcastHub::new(8, None);
        let mut alerts_only = connect(&hub);
        let mut machine_only = connect(&hub);
        let mut everything = connect(&hub);

        assert!(hub.subscribe(alerts_only.id, vec!["alert".to_string()]));
        assert!(hub.subscribe(machine_only.id, vec!["m2".to_string()]));

        hub.publish_event(&event("m1"));
        hub.publish_event(&event("m2"));
        hub.publish_alert(&Alert::new("m1", "temperature_high", Severity::High, "hot"));

        let drain = |sub: &mut Subscription| {
            let mut kinds = Vec::new();
            while let Ok(frame) = sub.mailbox.try_recv() {
                kinds.push(kind_of(&frame));
            }
            kinds
        };

        assert_eq!(drain(&mut alerts_only), vec!["alert"]);
        assert_eq!(drain(&mut machine_only), vec!["sensor_event"]);
        assert_eq!(drain(&mut everything).len(), 3);
    }

    #[test]
    fn test_unsubscribe_restores_everything() {
        let hub = BroadcastHub::new(8, None);
        let mut sub = connect(&hub);

        hub.handle_control(sub.id, InboundMessage::Subscribe(vec!["stats".to_string()]));
        assert_eq!(hub.publish_event(&event("m1")), 0);

        hub.handle_control(sub.id, InboundMessage::Unsubscribe(vec!["stats".to_string()]));
        assert_eq!(hub.publish_event(&event("m1")), 1);
        assert_eq!(kind_of(&sub.mailbox.try_recv().expect("frame")), "sensor_event");
    }

    #[test]
    fn test_ping_bypasses_filter() {
        let hub = BroadcastHub::new(8, None);
        let mut sub = connect(&hub);
        hub.subscribe(sub.id, vec!["alert".to_string()]);

        hub.handle_control(sub.id, InboundMessage::Ping);

        let frame = sub.mailbox.try_recv().expect("pong");
        let value: serde_json::Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(value["type"], "pong");
        assert_eq!(value["data"]["client_id"], sub.id.to_string());
    }

    #[test]
    fn test_unknown_subscriber_ignored() {
        let hub = BroadcastHub::new(8, None);
        assert!(!hub.subscribe(Uuid::new_v4(), vec!["alert".to_string()]));
        assert!(!hub.unregister(Uuid::new_v4()));
    }

    #[test]
    fn test_close_all() {
        let hub = BroadcastHub::new(8, None);
        let mut a = connect(&hub);
        let mut b = connect(&hub);
        hub.close_all();

        assert_eq!(hub.client_count(), 0);
        for sub in [&mut a, &mut b] {
            assert_eq!(
                sub.mailbox.try_recv(),
                Err(mpsc::error::TryRecvError::Disconnected)
            );
        }
    }
}

//! WebSocket subscriber connections.
//!
//! Each connection runs a write pump (mailbox frames plus keepalive pings,
//! every write bounded by a deadline) and a read pump (control messages,
//! with a read deadline refreshed by any inbound frame). The first pump to
//! finish ends the connection and unregisters the subscriber.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::HubConfig;
use crate::hub::{BroadcastHub, InboundMessage, Payload, SubscriberId, Subscription};

use super::AppState;

/// Per-connection timing.
#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl From<&HubConfig> for Keepalive {
    fn from(cfg: &HubConfig) -> Self {
        Self {
            ping_interval: cfg.ping_interval,
            read_timeout: cfg.read_timeout,
            write_timeout: cfg.write_timeout,
        }
    }
}

/// GET /ws - upgrade to a subscriber connection.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| serve_subscriber(socket, state, peer))
}

async fn serve_subscriber(socket: WebSocket, state: Arc<AppState>, peer: SocketAddr) {
    let Subscription {
        id,
        notice,
        mailbox,
    } = state.hub.register();
    info!(client_id = %id, %peer, "subscriber connected");

    let (sink, stream) = socket.split();

    tokio::select! {
        _ = write_pump(sink, notice, mailbox, state.keepalive) => {}
        _ = read_pump(stream, &state.hub, id, state.keepalive.read_timeout) => {}
    }

    state.hub.unregister(id);
    info!(client_id = %id, %peer, "subscriber disconnected");
}

/// Writes the connection notice, then forwards mailbox frames and keepalive
/// pings until the mailbox closes or a write fails.
pub(crate) async fn write_pump<S>(
    mut sink: S,
    notice: Option<Payload>,
    mut mailbox: mpsc::Receiver<Payload>,
    keepalive: Keepalive,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    if let Some(notice) = notice {
        let hello = Message::Text(notice.to_string().into());
        if !write_frame(&mut sink, hello, keepalive.write_timeout).await {
            return;
        }
    }

    let mut ping = time::interval_at(
        Instant::now() + keepalive.ping_interval,
        keepalive.ping_interval,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let frame = tokio::select! {
            payload = mailbox.recv() => match payload {
                Some(payload) => Message::Text(payload.to_string().into()),
                None => {
                    // Hub dropped us: say goodbye.
                    let close = sink.send(Message::Close(None));
                    let _ = time::timeout(keepalive.write_timeout, close).await;
                    return;
                }
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        if !write_frame(&mut sink, frame, keepalive.write_timeout).await {
            return;
        }
    }
}

/// Sends one frame within the write deadline. `false` ends the connection.
async fn write_frame<S>(sink: &mut S, frame: Message, write_timeout: Duration) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match time::timeout(write_timeout, sink.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(error = %e, "websocket write failed");
            false
        }
        Err(_) => {
            debug!("websocket write deadline exceeded");
            false
        }
    }
}

/// Applies control messages until the peer closes, errors, or stays silent
/// past the read deadline.
pub(crate) async fn read_pump<St, E>(
    mut stream: St,
    hub: &BroadcastHub,
    id: SubscriberId,
    read_timeout: Duration,
) where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    loop {
        let next = match time::timeout(read_timeout, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                info!(client_id = %id, "read deadline exceeded");
                return;
            }
        };

        match next {
            Some(Ok(Message::Text(text))) => match InboundMessage::parse(text.as_str()) {
                Ok(message) => hub.handle_control(id, message),
                Err(e) => debug!(client_id = %id, error = %e, "ignoring control message"),
            },
            Some(Ok(Message::Close(_))) | None => return,
            // Pongs and anything else only refresh the deadline.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(client_id = %id, error = %e, "websocket read failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;

    fn keepalive() -> Keepalive {
        Keepalive {
            ping_interval: Duration::from_millis(40),
            read_timeout: Duration::from_millis(200),
            write_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_write_pump_forwards_and_closes() {
        let (sink, mut written) = fmpsc::unbounded::<Message>();
        let (tx, rx) = mpsc::channel::<Payload>(4);
        let notice: Payload = Arc::from("{\"type\":\"connection\"}");
        let pump = tokio::spawn(write_pump(sink, Some(notice), rx, keepalive()));

        tx.send(Arc::from("{\"type\":\"stats\"}")).await.expect("send");
        drop(tx);
        pump.await.expect("pump");

        let mut frames = Vec::new();
        while let Some(frame) = written.next().await {
            frames.push(frame);
        }
        let texts: Vec<String> = frames
            .iter()
            .filter_map(|m| match m {
                Message::Text(t) => Some(t.as_str().to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["{\"type\":\"connection\"}", "{\"type\":\"stats\"}"]);
        assert!(matches!(frames.last(), Some(Message::Close(None))));
    }

    #[tokio::test]
    async fn test_write_pump_pings_when_idle() {
        let (sink, mut written) = fmpsc::unbounded::<Message>();
        let (_tx, rx) = mpsc::channel::<Payload>(4);
        let pump = tokio::spawn(write_pump(sink, None, rx, keepalive()));

        let first = written.next().await.expect("frame");
        assert!(matches!(first, Message::Ping(_)));
        pump.abort();
    }

    #[tokio::test]
    async fn test_write_pump_stops_on_sink_error() {
        let (sink, written) = fmpsc::unbounded::<Message>();
        drop(written);
        let (tx, rx) = mpsc::channel::<Payload>(4);
        tx.send(Arc::from("x")).await.expect("send");

        // Returns instead of spinning on a dead peer.
        time::timeout(Duration::from_secs(1), write_pump(sink, None, rx, keepalive()))
            .await
            .expect("pump exits");
    }

    #[tokio::test]
    async fn test_read_pump_applies_control_messages() {
        let hub = BroadcastHub::new(8, None);
        let mut sub = hub.register();

        let frames: Vec<Result<Message, std::io::Error>> = vec![
            Ok(Message::Text(
                r#"{"type":"subscribe","data":{"topics":["alert"]}}"#
                    .to_string()
                    .into(),
            )),
            Ok(Message::Text("garbage".to_string().into())),
            Ok(Message::Text(r#"{"type":"ping"}"#.to_string().into())),
            Ok(Message::Close(None)),
        ];
        read_pump(futures::stream::iter(frames), &hub, sub.id, keepalive().read_timeout).await;

        let pong = sub.mailbox.try_recv().expect("pong");
        assert!(pong.contains("\"pong\""));
    }

    #[tokio::test]
    async fn test_read_pump_deadline() {
        let hub = BroadcastHub::new(8, None);
        let sub = hub.register();
        let silent = futures::stream::pending::<Result<Message, std::io::Error>>();

        time::timeout(
            Duration::from_secs(2),
            read_pump(silent, &hub, sub.id, Duration::from_millis(50)),
        )
        .await
        .expect("read deadline ends the pump");
    }
}

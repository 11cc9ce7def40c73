//! WebSocket [`Transport`] talking to a [`RelayServer`](crate::server::RelayServer).
//!
//! One supervisor task per subscription owns the socket:
//!
//! ```text
//!  send()/publish_presence() ──► outgoing (unbounded) ──┐
//!                                                      ▼
//!                       supervisor: connect → Join → roster → select {
//!                                     outgoing  → ws writer
//!                                     ws reader → TransportEvent → session
//!                                  } → on loss: Error, backoff, reconnect
//! ```
//!
//! A connection counts as live once the relay answers `Join` with the
//! roster; a relay that closes instead (full room) never went live.
//! A dropped connection is reported as `Error` and retried with exponential
//! backoff; going live after a loss is reported as `Recovered`. Once retries are
//! exhausted the supervisor reports `Closed` and stops, leaving it to the
//! session's lifecycle manager to ask for a fresh subscription.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;

use crate::identity::RoomId;
use crate::lifecycle::Backoff;
use crate::protocol::{MessageKind, Participant, RoomMessage, SyncEvent};
use crate::transport::{classify, Transport, TransportError, TransportEvent, DEFAULT_EVENT_CAPACITY};

/// Socket state as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// First reconnect delay; doubles per attempt up to 8x
    pub reconnect_base: Duration,
    /// Reconnect attempts before reporting `Closed`
    pub max_reconnect_attempts: u32,
    /// Buffer of the event channel handed to the session
    pub event_capacity: usize,
    /// How long `unsubscribe` waits for the supervisor before aborting it
    pub shutdown_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            reconnect_base: Duration::from_millis(250),
            max_reconnect_attempts: 5,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }
}

struct Subscription {
    room_id: RoomId,
    participant_id: String,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    /// Latest self record, replayed in `Join` after a reconnect.
    me: watch::Sender<Participant>,
    supervisor: JoinHandle<()>,
}

/// WebSocket transport. One room at a time.
pub struct WsTransport {
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    subscription: Option<Subscription>,
}

impl WsTransport {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            subscription: None,
        }
    }

    pub fn connect_to(server_url: impl Into<String>) -> Self {
        Self::new(ClientConfig::new(server_url))
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }

    fn active(&self) -> Result<&Subscription, TransportError> {
        self.subscription.as_ref().ok_or(TransportError::NotSubscribed)
    }

    fn enqueue(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.active()?
            .outgoing
            .send(bytes)
            .map_err(|_| TransportError::ChannelClosed)
    }
}

impl Transport for WsTransport {
    async fn subscribe(
        &mut self,
        room_id: &RoomId,
        me: &Participant,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        if let Some(sub) = &self.subscription {
            return Err(TransportError::AlreadySubscribed(sub.room_id.clone()));
        }

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(self.config.event_capacity);
        let (me_tx, me_rx) = watch::channel(me.clone());

        let supervisor = Supervisor {
            url: format!("{}/{}", self.config.server_url, room_id),
            room_id: room_id.clone(),
            self_id: me.id.clone(),
            me: me_rx,
            outgoing: outgoing_rx,
            events: events_tx,
            state: self.state.clone(),
            went_live: false,
            backoff: Backoff::new(self.config.reconnect_base, self.config.max_reconnect_attempts),
        };

        self.subscription = Some(Subscription {
            room_id: room_id.clone(),
            participant_id: me.id.clone(),
            outgoing: outgoing_tx,
            me: me_tx,
            supervisor: tokio::spawn(supervisor.run()),
        });
        Ok(events_rx)
    }

    async fn send(&mut self, event: &SyncEvent) -> Result<(), TransportError> {
        let sub = self.active()?;
        let bytes = RoomMessage::broadcast(&sub.room_id, &sub.participant_id, event)?.encode()?;
        self.enqueue(bytes)
    }

    async fn publish_presence(&mut self, me: &Participant) -> Result<(), TransportError> {
        let sub = self.active()?;
        sub.me.send_replace(me.clone());
        let bytes = RoomMessage::presence(&sub.room_id, me)?.encode()?;
        self.enqueue(bytes)
    }

    async fn unsubscribe(&mut self) {
        let Some(sub) = self.subscription.take() else {
            return;
        };
        // Closing the outgoing channel tells the supervisor to say goodbye.
        drop(sub.outgoing);
        let mut supervisor = sub.supervisor;
        if timeout(self.config.shutdown_timeout, &mut supervisor).await.is_err() {
            log::warn!("Supervisor for {} did not stop in time, aborting", sub.room_id);
            supervisor.abort();
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsWriter = futures_util::stream::SplitSink<WsStream, Message>;
type WsReader = futures_util::stream::SplitStream<WsStream>;

/// Why a connection ended.
enum Disconnect {
    /// `unsubscribe` was called or the session went away.
    Shutdown,
    Lost(String),
}

struct Supervisor {
    url: String,
    room_id: RoomId,
    self_id: String,
    me: watch::Receiver<Participant>,
    outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::Sender<TransportEvent>,
    state: Arc<RwLock<ConnectionState>>,
    /// Set once any connection got the roster; later ones are recoveries.
    went_live: bool,
    backoff: Backoff,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            *self.state.write().await = if self.went_live {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            };

            let reason = match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((ws_stream, _)) => {
                    self.backoff.reset();
                    match self.serve(ws_stream).await {
                        Disconnect::Shutdown => break,
                        Disconnect::Lost(reason) => reason,
                    }
                }
                Err(e) => e.to_string(),
            };

            *self.state.write().await = ConnectionState::Disconnected;
            log::debug!("Connection to {} lost: {reason}", self.url);
            if self.events.send(TransportEvent::Error(reason)).await.is_err() {
                break;
            }
            if self.backoff.is_exhausted() {
                log::warn!(
                    "Giving up on {} after {} attempts",
                    self.url,
                    self.backoff.attempt()
                );
                let _ = self.events.send(TransportEvent::Closed).await;
                break;
            }
            let delay = self.backoff.next();
            if !self.wait(delay).await {
                break;
            }
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Sleep out a backoff delay. Returns false if unsubscribed meanwhile.
    async fn wait(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return true,
                queued = self.outgoing.recv() => {
                    if queued.is_none() {
                        return false;
                    }
                    // Playback state moves on; nothing is replayed after a gap.
                }
            }
        }
    }

    async fn serve(&mut self, ws_stream: WsStream) -> Disconnect {
        let (mut writer, mut reader) = ws_stream.split();

        let me = self.me.borrow().clone();
        let join = match RoomMessage::join(&self.room_id, &me).and_then(|m| m.encode()) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Cannot encode join for {}: {e}", self.room_id);
                return Disconnect::Shutdown;
            }
        };
        if let Err(e) = writer.send(Message::Binary(join.into())).await {
            return Disconnect::Lost(e.to_string());
        }
        while self.outgoing.try_recv().is_ok() {}

        let accepted = match self.await_roster(&mut writer, &mut reader).await {
            Ok(events) => events,
            Err(disconnect) => return disconnect,
        };

        *self.state.write().await = ConnectionState::Connected;
        let live = if self.went_live {
            TransportEvent::Recovered
        } else {
            TransportEvent::Subscribed
        };
        self.went_live = true;
        for event in std::iter::once(live).chain(accepted) {
            if self.events.send(event).await.is_err() {
                let _ = writer.send(Message::Close(None)).await;
                return Disconnect::Shutdown;
            }
        }
        log::info!("Connected to {} as {}", self.url, self.self_id);

        loop {
            tokio::select! {
                queued = self.outgoing.recv() => {
                    match queued {
                        Some(bytes) => {
                            if let Err(e) = writer.send(Message::Binary(bytes.into())).await {
                                return Disconnect::Lost(e.to_string());
                            }
                        }
                        None => {
                            let _ = writer.send(Message::Close(None)).await;
                            return Disconnect::Shutdown;
                        }
                    }
                }

                msg = reader.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let room_msg = match RoomMessage::decode(&data) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Dropping undecodable relay message: {e}");
                                    continue;
                                }
                            };
                            if let Some(event) = classify(room_msg, &self.self_id) {
                                if self.events.send(event).await.is_err() {
                                    let _ = writer.send(Message::Close(None)).await;
                                    return Disconnect::Shutdown;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = writer.send(Message::Pong(data)).await {
                                return Disconnect::Lost(e.to_string());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Disconnect::Lost("closed by relay".to_string());
                        }
                        Some(Err(e)) => return Disconnect::Lost(e.to_string()),
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    /// Wait for the relay to accept `Join`. Returns the events to deliver
    /// once live, ending with the roster.
    async fn await_roster(
        &mut self,
        writer: &mut WsWriter,
        reader: &mut WsReader,
    ) -> Result<Vec<TransportEvent>, Disconnect> {
        let mut held = Vec::new();
        loop {
            tokio::select! {
                queued = self.outgoing.recv() => {
                    match queued {
                        Some(bytes) => {
                            writer
                                .send(Message::Binary(bytes.into()))
                                .await
                                .map_err(|e| Disconnect::Lost(e.to_string()))?;
                        }
                        None => {
                            let _ = writer.send(Message::Close(None)).await;
                            return Err(Disconnect::Shutdown);
                        }
                    }
                }

                msg = reader.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let room_msg = match RoomMessage::decode(&data) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Dropping undecodable relay message: {e}");
                                    continue;
                                }
                            };
                            let accepted = room_msg.kind == MessageKind::PresenceSync;
                            held.extend(classify(room_msg, &self.self_id));
                            if accepted {
                                return Ok(held);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            writer
                                .send(Message::Pong(data))
                                .await
                                .map_err(|e| Disconnect::Lost(e.to_string()))?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(Disconnect::Lost("join rejected by relay".to_string()));
                        }
                        Some(Err(e)) => return Err(Disconnect::Lost(e.to_string())),
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::parse("tavern").unwrap()
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.server_url, "ws://127.0.0.1:9090");
        assert_eq!(config.reconnect_base, Duration::from_millis(250));
        assert_eq!(config.max_reconnect_attempts, 5);
    }

    #[tokio::test]
    async fn test_initial_state() {
        let transport = WsTransport::connect_to("ws://127.0.0.1:1");
        assert_eq!(transport.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(transport.server_url(), "ws://127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_send_before_subscribe_fails() {
        let mut transport = WsTransport::connect_to("ws://127.0.0.1:1");
        assert!(matches!(
            transport.send(&SyncEvent::play("t", 0.0, 0)).await,
            Err(TransportError::NotSubscribed)
        ));
        assert!(transport
            .publish_presence(&Participant::with_id("a", "A"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unreachable_relay_reports_error_then_closed() {
        let free = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = free.local_addr().unwrap().port();
        drop(free);

        let mut transport = WsTransport::new(ClientConfig {
            reconnect_base: Duration::from_millis(5),
            max_reconnect_attempts: 2,
            ..ClientConfig::new(format!("ws://127.0.0.1:{port}"))
        });
        let mut events = transport
            .subscribe(&room(), &Participant::with_id("a", "A"))
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(Some(event)) = timeout(Duration::from_secs(2), events.recv()).await {
            let closed = event == TransportEvent::Closed;
            seen.push(event);
            if closed {
                break;
            }
        }
        assert!(matches!(seen.first(), Some(TransportEvent::Error(_))));
        assert_eq!(seen.last(), Some(&TransportEvent::Closed));
        assert_eq!(seen.len(), 4);

        transport.unsubscribe().await;
        assert_eq!(transport.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_relay_closing_after_join_is_not_live() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // A relay that reads the join and hangs up, as a full room does.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _join = ws.next().await;
            let _ = ws.close(None).await;
        });

        let mut transport = WsTransport::new(ClientConfig {
            max_reconnect_attempts: 0,
            ..ClientConfig::new(format!("ws://127.0.0.1:{port}"))
        });
        let mut events = transport
            .subscribe(&room(), &Participant::with_id("a", "A"))
            .await
            .unwrap();

        let first = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
        assert!(matches!(first, Some(TransportEvent::Error(_))));
        let second = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
        assert_eq!(second, Some(TransportEvent::Closed));
        transport.unsubscribe().await;
    }

    #[tokio::test]
    async fn test_double_subscribe_rejected() {
        let mut transport = WsTransport::connect_to("ws://127.0.0.1:1");
        let me = Participant::with_id("a", "A");
        let _events = transport.subscribe(&room(), &me).await.unwrap();
        assert!(matches!(
            transport.subscribe(&room(), &me).await,
            Err(TransportError::AlreadySubscribed(_))
        ));
        transport.unsubscribe().await;
    }
}

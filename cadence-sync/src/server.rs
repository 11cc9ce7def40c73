//! WebSocket relay with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (room id) ── BroadcastGroup ── presence table
//! Client B ──┘                          │
//!                          ┌────────────┼────────────┐
//!                          ▼            ▼            ▼
//!                       Client A     Client B     Client C
//! ```
//!
//! The relay holds no playback state. It fans `Broadcast` messages out to
//! everyone else in the room and keeps the presence table that new joiners
//! receive as a `PresenceSync`.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{BroadcastGroup, PeerToken, RoomManager};
use crate::identity::RoomId;
use crate::protocol::{MessageKind, ProtocolError, RoomMessage};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    /// Joins refused because the room was full
    pub rejected_joins: u64,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let connection = Connection {
                addr,
                config: self.config.clone(),
                rooms: self.rooms.clone(),
                stats: self.stats.clone(),
                participant_id: None,
                room_id: None,
                broadcast_rx: None,
                peer_token: None,
            };

            tokio::spawn(async move {
                if let Err(e) = connection.run(stream).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<TcpStream>,
    Message,
>;

/// State of one WebSocket connection.
struct Connection {
    addr: SocketAddr,
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    participant_id: Option<String>,
    room_id: Option<RoomId>,
    broadcast_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>>,
    /// Registration owned by this connection in the room's peer table.
    peer_token: Option<PeerToken>,
}

impl Connection {
    async fn run(mut self, stream: TcpStream) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {}", self.addr);

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = self.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            match RoomMessage::decode(&data) {
                                Ok(room_msg) => {
                                    match self.handle_message(room_msg, &mut ws_sender).await {
                                        Ok(true) => {}
                                        Ok(false) => break Ok(()),
                                        Err(e) => break Err(e),
                                    }
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {}: {e}", self.addr);
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {}", self.addr);
                            break Ok(());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {}: {e}", self.addr);
                            break Ok(());
                        }
                        _ => {}
                    }
                }

                msg = async {
                    if let Some(ref mut rx) = self.broadcast_rx {
                        rx.recv().await
                    } else {
                        std::future::pending().await
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            if let Ok(room_msg) = RoomMessage::decode(&data) {
                                if Some(&room_msg.sender_id) == self.participant_id.as_ref() {
                                    continue;
                                }
                            }
                            if let Err(e) = ws_sender.send(Message::Binary(data.to_vec().into())).await {
                                break Err(e.into());
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer {:?} lagged by {n} messages", self.participant_id);
                            if let Some(room_id) = &self.room_id {
                                if let Some(group) = self.rooms.get(room_id).await {
                                    group.record_dropped(n);
                                }
                            }
                        }
                        Err(_) => break Ok(()),
                    }
                }
            }
        };

        self.cleanup().await;
        result
    }

    /// Returns `Ok(false)` when the connection should be closed.
    async fn handle_message(
        &mut self,
        msg: RoomMessage,
        ws_sender: &mut WsSink,
    ) -> Result<bool, ServerError> {
        match msg.kind {
            MessageKind::Join => {
                if self.room_id.is_some() {
                    log::debug!("Ignoring second join from {}", self.addr);
                    return Ok(true);
                }
                let participant = match msg.participant() {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("Join without participant from {}: {e}", self.addr);
                        return Ok(false);
                    }
                };

                let group = self.rooms.get_or_create(&msg.room_id).await;
                if group.peer_count().await >= self.config.max_peers_per_room {
                    log::warn!(
                        "Room {} is full, rejecting {}",
                        msg.room_id,
                        participant.id
                    );
                    self.stats.write().await.rejected_joins += 1;
                    self.rooms.remove_if_empty(&msg.room_id).await;
                    ws_sender.send(Message::Close(None)).await?;
                    return Ok(false);
                }

                let (token, rx) = group.add_peer(participant.clone()).await;
                self.broadcast_rx = Some(rx);
                self.peer_token = Some(token);
                self.participant_id = Some(participant.id.clone());
                self.room_id = Some(msg.room_id.clone());

                let roster = group.peers().await;
                let sync = RoomMessage::presence_sync(&msg.room_id, &roster)?.encode()?;
                ws_sender.send(Message::Binary(sync.into())).await?;

                group.broadcast(&RoomMessage::presence(&msg.room_id, &participant)?)?;

                self.stats.write().await.active_rooms = self.rooms.room_count().await;
                log::info!(
                    "Participant {} ({}) joined room {}",
                    participant.display_name,
                    participant.id,
                    msg.room_id
                );
            }

            MessageKind::Presence => {
                let Some(group) = self.joined_group(&msg).await else {
                    return Ok(true);
                };
                match msg.participant() {
                    Ok(p) if p.id == msg.sender_id => {
                        log::debug!("Presence update from {} in room {}", p.id, msg.room_id);
                        group.update_peer(p).await;
                        group.broadcast(&msg)?;
                    }
                    Ok(p) => {
                        log::warn!("Participant {} tried to publish presence for {}", msg.sender_id, p.id);
                    }
                    Err(e) => log::warn!("Bad presence payload from {}: {e}", self.addr),
                }
            }

            MessageKind::Broadcast => {
                if let Some(group) = self.joined_group(&msg).await {
                    group.broadcast(&msg)?;
                }
            }

            MessageKind::Ping => {
                if let (Some(room_id), Some(pid)) = (&self.room_id, &self.participant_id) {
                    let pong = RoomMessage::pong(room_id, pid).encode()?;
                    ws_sender.send(Message::Binary(pong.into())).await?;
                }
            }

            _ => {
                log::debug!("Unhandled message type: {:?}", msg.kind);
            }
        }
        Ok(true)
    }

    /// Group for `msg` if it comes from this connection's joined identity.
    async fn joined_group(&self, msg: &RoomMessage) -> Option<Arc<BroadcastGroup>> {
        if self.room_id.as_ref() != Some(&msg.room_id)
            || self.participant_id.as_ref() != Some(&msg.sender_id)
        {
            log::debug!("Dropping {:?} from {} before join", msg.kind, self.addr);
            return None;
        }
        self.rooms.get(&msg.room_id).await
    }

    async fn cleanup(&mut self) {
        if let (Some(pid), Some(room_id), Some(token)) = (
            self.participant_id.take(),
            self.room_id.take(),
            self.peer_token.take(),
        ) {
            self.broadcast_rx = None;
            if let Some(group) = self.rooms.get(&room_id).await {
                if group.remove_peer(&pid, token).await.is_some() {
                    let _ = group.broadcast(&RoomMessage::presence_left(&room_id, &pid));
                    log::info!("Participant {pid} left room {room_id}");
                } else {
                    log::debug!("Participant {pid} already rejoined {room_id} on another connection");
                }
            }
            self.rooms.remove_if_empty(&room_id).await;
        }
        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = self.rooms.room_count().await;
    }
}

//! Room-scoped broadcast + presence transport.
//!
//! A [`Transport`] carries [`SyncEvent`]s to every *other* subscriber of a
//! room and publishes the local participant's presence record. Delivery is
//! fire-and-forget: no ack, no retry, no ordering. Everything the transport
//! observes (health changes, remote events, roster changes) arrives on one
//! `mpsc` channel of [`TransportEvent`]s returned by `subscribe`.

use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::broadcast::{BroadcastGroup, PeerToken, RoomManager};
use crate::identity::RoomId;
use crate::protocol::{MessageKind, Participant, ProtocolError, RoomMessage, SyncEvent};

/// Default buffer for the event channel handed to the session.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Subscription is live.
    Subscribed,
    /// Transient or persistent failure; the lifecycle manager decides which.
    Error(String),
    /// Connection came back after an `Error`.
    Recovered,
    /// Channel is gone for good.
    Closed,
    /// Remote participant broadcast an event.
    Event { from: String, event: SyncEvent },
    /// Full presence record of a remote participant.
    Presence(Participant),
    PresenceLeft(String),
    /// Authoritative roster snapshot from the provider.
    PresenceSync(Vec<Participant>),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not subscribed to a room")]
    NotSubscribed,
    #[error("already subscribed to room {0}")]
    AlreadySubscribed(RoomId),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transport channel closed")]
    ChannelClosed,
}

/// Pub/sub + presence provider for a single room at a time.
pub trait Transport: Send + 'static {
    /// Join `room_id` as `me`. The returned receiver yields every
    /// [`TransportEvent`] until `unsubscribe` or `Closed`.
    fn subscribe(
        &mut self,
        room_id: &RoomId,
        me: &Participant,
    ) -> impl Future<Output = Result<mpsc::Receiver<TransportEvent>, TransportError>> + Send;

    /// Fan out to every other subscriber. Never echoed back.
    fn send(&mut self, event: &SyncEvent) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Publish the full current record of the local participant.
    fn publish_presence(
        &mut self,
        me: &Participant,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Leave the room. Completes only once nothing more will be delivered.
    fn unsubscribe(&mut self) -> impl Future<Output = ()> + Send;
}

/// Map a relayed envelope onto what the session cares about.
///
/// Returns `None` for the local participant's own messages and for
/// keepalive traffic.
pub(crate) fn classify(msg: RoomMessage, self_id: &str) -> Option<TransportEvent> {
    if !msg.sender_id.is_empty() && msg.sender_id == self_id {
        return None;
    }
    let decoded = match msg.kind {
        MessageKind::Join | MessageKind::Presence => msg.participant().map(TransportEvent::Presence),
        MessageKind::PresenceLeft => Ok(TransportEvent::PresenceLeft(msg.sender_id.clone())),
        MessageKind::PresenceSync => msg.roster().map(TransportEvent::PresenceSync),
        MessageKind::Broadcast => msg.event().map(|event| TransportEvent::Event {
            from: msg.sender_id.clone(),
            event,
        }),
        MessageKind::Ping | MessageKind::Pong => return None,
    };
    match decoded {
        Ok(event) => Some(event),
        Err(e) => {
            log::warn!("Dropping malformed {:?} from {}: {e}", msg.kind, msg.sender_id);
            None
        }
    }
}

struct LocalSubscription {
    room_id: RoomId,
    participant_id: String,
    token: PeerToken,
    group: Arc<BroadcastGroup>,
    pump: JoinHandle<()>,
}

/// In-process transport over a shared [`RoomManager`].
///
/// Every `LocalTransport` built from the same manager sees the same rooms,
/// which makes it the transport for embedded relays and tests.
pub struct LocalTransport {
    rooms: Arc<RoomManager>,
    event_capacity: usize,
    subscription: Option<LocalSubscription>,
}

impl LocalTransport {
    pub fn new(rooms: Arc<RoomManager>) -> Self {
        Self {
            rooms,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            subscription: None,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    fn active(&self) -> Result<&LocalSubscription, TransportError> {
        self.subscription.as_ref().ok_or(TransportError::NotSubscribed)
    }

    async fn pump(
        group: Arc<BroadcastGroup>,
        mut rx: broadcast::Receiver<Arc<Vec<u8>>>,
        tx: mpsc::Sender<TransportEvent>,
        self_id: String,
    ) {
        loop {
            match rx.recv().await {
                Ok(bytes) => {
                    let msg = match RoomMessage::decode(&bytes) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("Dropping undecodable room message: {e}");
                            continue;
                        }
                    };
                    if let Some(event) = classify(msg, &self_id) {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Participant {self_id} lagged by {n} messages");
                    group.record_dropped(n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let _ = tx.send(TransportEvent::Closed).await;
                    break;
                }
            }
        }
    }
}

impl Transport for LocalTransport {
    async fn subscribe(
        &mut self,
        room_id: &RoomId,
        me: &Participant,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        if let Some(sub) = &self.subscription {
            return Err(TransportError::AlreadySubscribed(sub.room_id.clone()));
        }

        let group = self.rooms.get_or_create(room_id).await;
        let (token, rx) = group.add_peer(me.clone()).await;
        let roster = group.peers().await;
        group.broadcast(&RoomMessage::presence(room_id, me)?)?;

        let (tx, events) = mpsc::channel(self.event_capacity);
        // Fresh channel, capacity > 2: these cannot fail.
        let _ = tx.try_send(TransportEvent::Subscribed);
        let _ = tx.try_send(TransportEvent::PresenceSync(roster));

        let pump = tokio::spawn(Self::pump(group.clone(), rx, tx, me.id.clone()));
        self.subscription = Some(LocalSubscription {
            room_id: room_id.clone(),
            participant_id: me.id.clone(),
            token,
            group,
            pump,
        });
        log::debug!("Local transport subscribed {} to {room_id}", me.id);
        Ok(events)
    }

    async fn send(&mut self, event: &SyncEvent) -> Result<(), TransportError> {
        let sub = self.active()?;
        let msg = RoomMessage::broadcast(&sub.room_id, &sub.participant_id, event)?;
        sub.group.broadcast(&msg)?;
        Ok(())
    }

    async fn publish_presence(&mut self, me: &Participant) -> Result<(), TransportError> {
        let sub = self.active()?;
        sub.group.update_peer(me.clone()).await;
        sub.group.broadcast(&RoomMessage::presence(&sub.room_id, me)?)?;
        Ok(())
    }

    async fn unsubscribe(&mut self) {
        let Some(sub) = self.subscription.take() else {
            return;
        };
        sub.pump.abort();
        let _ = sub.pump.await;
        // Leave the record alone if the same id has since subscribed again.
        if sub.group.remove_peer(&sub.participant_id, sub.token).await.is_some() {
            let left = RoomMessage::presence_left(&sub.room_id, &sub.participant_id);
            if let Err(e) = sub.group.broadcast(&left) {
                log::error!("Failed to announce departure from {}: {e}", sub.room_id);
            }
        }
        self.rooms.remove_if_empty(&sub.room_id).await;
        log::debug!("Local transport left {}", sub.room_id);
    }
}

//! Room-scoped fan-out with backpressure.
//!
//! One tokio broadcast channel per room carries pre-encoded
//! [`RoomMessage`] bytes to every subscriber. The peer table doubles as the
//! room's presence table, so a joiner can be handed the current roster.
//! Self-exclusion is the receiver's job: compare `sender_id` before
//! delivering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::identity::RoomId;
use crate::protocol::{Participant, ProtocolError, RoomMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Identifies one registration of a participant.
///
/// A participant that reconnects registers again under the same id and
/// gets a new token; the stale connection's token no longer matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerToken(u64);

struct PeerEntry {
    token: PeerToken,
    participant: Participant,
}

/// Subscribers and presence records of a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Presence table keyed by participant id.
    peers: Arc<RwLock<HashMap<String, PeerEntry>>>,
    next_token: AtomicU64,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` bounds how far a slow subscriber may lag before it starts
    /// losing messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            next_token: AtomicU64::new(1),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Register a participant and hand back its token and receiver. A
    /// record already present under the same id is taken over.
    pub async fn add_peer(
        &self,
        participant: Participant,
    ) -> (PeerToken, broadcast::Receiver<Arc<Vec<u8>>>) {
        let token = PeerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut peers = self.peers.write().await;
        let previous = peers.insert(
            participant.id.clone(),
            PeerEntry {
                token,
                participant,
            },
        );
        if let Some(previous) = previous {
            log::debug!("Participant {} re-registered", previous.participant.id);
        }
        (token, self.sender.subscribe())
    }

    /// Replace a participant's presence record. Returns false if the
    /// participant is not (or no longer) in the room.
    pub async fn update_peer(&self, participant: Participant) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(&participant.id) {
            Some(existing) => {
                existing.participant = participant;
                true
            }
            None => false,
        }
    }

    /// Remove the registration identified by `token`. A participant who
    /// has since registered again under a newer token is left in place.
    pub async fn remove_peer(&self, participant_id: &str, token: PeerToken) -> Option<Participant> {
        let mut peers = self.peers.write().await;
        if peers.get(participant_id)?.token != token {
            return None;
        }
        peers.remove(participant_id).map(|entry| entry.participant)
    }

    /// Encode and fan out. Returns how many receivers got the message,
    /// including the sender's own receiver.
    pub fn broadcast(&self, msg: &RoomMessage) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(encoded))
    }

    /// Fan out bytes that are already encoded.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for messages a lagging receiver skipped.
    pub fn record_dropped(&self, skipped: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Current presence table, sorted by id for stable output.
    pub async fn peers(&self) -> Vec<Participant> {
        let mut roster: Vec<Participant> = self
            .peers
            .read()
            .await
            .values()
            .map(|entry| entry.participant.clone())
            .collect();
        roster.sort_by(|a, b| a.id.cmp(&b.id));
        roster
    }

    pub async fn has_peer(&self, participant_id: &str) -> bool {
        self.peers.read().await.contains_key(participant_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}

/// Maps room ids to broadcast groups so rooms never see each other's traffic.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<RoomId, Arc<BroadcastGroup>>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, room_id: &RoomId) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Another task may have created it between the two locks.
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(room_id.clone(), room.clone());
        log::debug!("Created room {room_id}");
        room
    }

    pub async fn get(&self, room_id: &RoomId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Drop the room if nobody is left in it.
    pub async fn remove_if_empty(&self, room_id: &RoomId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            if room.peer_count().await == 0 {
                rooms.remove(room_id);
                log::info!("Room {room_id} removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageKind, SyncEvent};

    fn room(name: &str) -> RoomId {
        RoomId::parse(name).unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let alice = Participant::with_id("alice", "Alice");

        let (token, _rx) = group.add_peer(alice).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer("alice").await);

        let removed = group.remove_peer("alice", token).await.unwrap();
        assert_eq!(removed.display_name, "Alice");
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_includes_sender_receiver() {
        let group = BroadcastGroup::new(16);
        let (_, mut rx1) = group.add_peer(Participant::with_id("a", "A")).await;
        let (_, mut rx2) = group.add_peer(Participant::with_id("b", "B")).await;
        let (_, mut rx3) = group.add_peer(Participant::with_id("c", "C")).await;

        let msg = RoomMessage::broadcast(&room("r"), "a", &SyncEvent::play("t", 0.0, 1)).unwrap();
        assert_eq!(group.broadcast(&msg).unwrap(), 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let bytes = rx.recv().await.unwrap();
            let decoded = RoomMessage::decode(&bytes).unwrap();
            assert_eq!(decoded.kind, MessageKind::Broadcast);
            assert_eq!(decoded.sender_id, "a");
        }
    }

    #[tokio::test]
    async fn test_update_peer_requires_membership() {
        let group = BroadcastGroup::new(16);
        let mut bob = Participant::with_id("bob", "Bob");
        assert!(!group.update_peer(bob.clone()).await);

        let (_token, _rx) = group.add_peer(bob.clone()).await;
        bob.display_name = "Robert".into();
        assert!(group.update_peer(bob).await);
        assert_eq!(group.peers().await[0].display_name, "Robert");
    }

    #[tokio::test]
    async fn test_stale_registration_cannot_remove_newer_one() {
        let group = BroadcastGroup::new(16);
        let (old, _old_rx) = group.add_peer(Participant::with_id("host", "Host")).await;
        let (new, _new_rx) = group.add_peer(Participant::with_id("host", "Host")).await;
        assert_ne!(old, new);
        assert_eq!(group.peer_count().await, 1);

        assert!(group.remove_peer("host", old).await.is_none());
        assert!(group.has_peer("host").await);
        assert!(group.remove_peer("host", new).await.is_some());
        assert!(!group.has_peer("host").await);
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::new(16);
        let (_token, _rx) = group.add_peer(Participant::with_id("a", "A")).await;

        let ping = RoomMessage::ping(&room("r"), "a");
        group.broadcast(&ping).unwrap();
        group.broadcast(&ping).unwrap();
        group.record_dropped(3);

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver_reports_lag() {
        let group = BroadcastGroup::new(2);
        let (_, mut rx) = group.add_peer(Participant::with_id("a", "A")).await;
        for _ in 0..5 {
            group.broadcast_raw(Arc::new(vec![1]));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::new(16);
        let room1 = manager.get_or_create(&room("tavern")).await;
        let room2 = manager.get_or_create(&room("tavern")).await;
        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(manager.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_room_manager_isolates_rooms() {
        let manager = RoomManager::new(16);
        let tavern = manager.get_or_create(&room("tavern")).await;
        let dungeon = manager.get_or_create(&room("dungeon")).await;

        let (_, mut dungeon_rx) = dungeon.add_peer(Participant::with_id("d", "D")).await;
        tavern.broadcast_raw(Arc::new(vec![7]));

        assert!(dungeon_rx.try_recv().is_err());
        let rooms = manager.active_rooms().await;
        assert!(rooms.contains(&room("tavern")));
        assert!(rooms.contains(&room("dungeon")));
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16);
        let id = room("tavern");
        let group = manager.get_or_create(&id).await;
        let (token, _rx) = group.add_peer(Participant::with_id("a", "A")).await;

        assert!(!manager.remove_if_empty(&id).await);
        group.remove_peer("a", token).await;
        assert!(manager.remove_if_empty(&id).await);
        assert!(manager.get(&id).await.is_none());
    }
}

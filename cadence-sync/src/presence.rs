//! Live room roster.
//!
//! Every participant publishes its *full* record into room presence and
//! merges everyone else's records into a local view. The directory does not
//! interpret roles; it only answers roster questions such as "is there
//! already a host?".
//!
//! ## Flow
//!
//! ```text
//! update_self()            remote Presence / PresenceSync
//!       │                              │
//!       ▼                              ▼
//! PresenceDirectory ── LWW merge by participant id
//!       │                              │
//!       ├── record to publish          ▼
//!       │   (or buffered until live)  watch::Sender<Vec<Participant>>
//!       ▼                              │
//! Transport::publish_presence          ▼
//!                                RosterHandle (observers)
//! ```

use std::collections::BTreeMap;
use tokio::sync::watch;

use crate::identity::{sanitize_display_name, RoomId};
use crate::protocol::{HostState, Participant, Role};

// ───────────────────────────────────────────────────────────────────
// Partial self update
// ───────────────────────────────────────────────────────────────────

/// Fields of the local record to change. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticipantUpdate {
    pub display_name: Option<String>,
    pub role: Option<Role>,
    /// `Some(None)` clears the snapshot.
    pub host_snapshot: Option<Option<HostState>>,
}

impl ParticipantUpdate {
    pub fn role(role: Role) -> Self {
        Self {
            role: Some(role),
            ..Self::default()
        }
    }

    pub fn display_name(name: impl Into<String>) -> Self {
        Self {
            display_name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn host_snapshot(snapshot: Option<HostState>) -> Self {
        Self {
            host_snapshot: Some(snapshot),
            ..Self::default()
        }
    }

    pub fn with_snapshot(mut self, snapshot: Option<HostState>) -> Self {
        self.host_snapshot = Some(snapshot);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.role.is_none() && self.host_snapshot.is_none()
    }

    fn apply_to(self, participant: &mut Participant) {
        if let Some(name) = self.display_name {
            participant.display_name = sanitize_display_name(&name);
        }
        if let Some(role) = self.role {
            participant.role = role;
        }
        if let Some(snapshot) = self.host_snapshot {
            participant.host_snapshot = snapshot;
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Roster observer
// ───────────────────────────────────────────────────────────────────

/// Read side of a room roster. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RosterHandle {
    rx: watch::Receiver<Vec<Participant>>,
}

impl RosterHandle {
    /// Snapshot of the roster, local participant included, sorted by id.
    pub fn current(&self) -> Vec<Participant> {
        self.rx.borrow().clone()
    }

    /// Wait for the next roster change. Returns false once the room is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    pub fn receiver(&self) -> watch::Receiver<Vec<Participant>> {
        self.rx.clone()
    }
}

// ───────────────────────────────────────────────────────────────────
// Directory
// ───────────────────────────────────────────────────────────────────

/// Roster of one room as seen by the local participant.
pub struct PresenceDirectory {
    room_id: RoomId,
    me: Participant,
    /// Remote participants keyed by id.
    remotes: BTreeMap<String, Participant>,
    live: bool,
    /// A self update arrived while not live and still has to go out.
    pending: bool,
    roster_tx: watch::Sender<Vec<Participant>>,
}

impl PresenceDirectory {
    pub fn join(room_id: RoomId, me: Participant) -> (Self, RosterHandle) {
        let (roster_tx, rx) = watch::channel(vec![me.clone()]);
        log::info!("{} ({}) joined room {room_id}", me.display_name, me.id);
        let directory = Self {
            room_id,
            me,
            remotes: BTreeMap::new(),
            live: false,
            pending: false,
            roster_tx,
        };
        (directory, RosterHandle { rx })
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn me(&self) -> &Participant {
        &self.me
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn subscribe(&self) -> RosterHandle {
        RosterHandle {
            rx: self.roster_tx.subscribe(),
        }
    }

    /// Change the local record.
    ///
    /// Returns the full record to publish, or `None` when the transport is
    /// not live yet; the latest record is then held and handed out by
    /// [`set_live`](Self::set_live).
    pub fn update_self(&mut self, update: ParticipantUpdate) -> Option<Participant> {
        if update.is_empty() {
            return None;
        }
        update.apply_to(&mut self.me);
        self.publish_roster();
        if self.live {
            Some(self.me.clone())
        } else {
            self.pending = true;
            log::debug!("Buffering presence update for {} until live", self.me.id);
            None
        }
    }

    /// Track transport liveness. Going live flushes a buffered record.
    pub fn set_live(&mut self, live: bool) -> Option<Participant> {
        self.live = live;
        if live && self.pending {
            self.pending = false;
            return Some(self.me.clone());
        }
        None
    }

    /// Merge one remote record, last write wins. Records carrying the local
    /// id are ignored; only this process writes the local record.
    pub fn merge_remote(&mut self, participant: Participant) -> bool {
        if participant.id == self.me.id {
            return false;
        }
        if self.remotes.get(&participant.id) == Some(&participant) {
            return false;
        }
        if !self.remotes.contains_key(&participant.id) {
            log::info!(
                "{} ({}) is in room {}",
                participant.display_name,
                participant.id,
                self.room_id
            );
        }
        self.remotes.insert(participant.id.clone(), participant);
        self.publish_roster();
        true
    }

    pub fn remove(&mut self, participant_id: &str) -> Option<Participant> {
        let removed = self.remotes.remove(participant_id)?;
        log::info!(
            "{} ({}) left room {}",
            removed.display_name,
            removed.id,
            self.room_id
        );
        self.publish_roster();
        Some(removed)
    }

    /// Adopt a provider-supplied roster. The local record always survives.
    pub fn replace_all(&mut self, roster: Vec<Participant>) {
        let me_id = self.me.id.clone();
        self.remotes = roster
            .into_iter()
            .filter(|p| p.id != me_id)
            .map(|p| (p.id.clone(), p))
            .collect();
        self.publish_roster();
    }

    /// Forget the room. Observers see an empty roster.
    pub fn leave(&mut self) {
        self.remotes.clear();
        self.live = false;
        self.pending = false;
        self.roster_tx.send_replace(Vec::new());
        log::info!("{} ({}) left room {}", self.me.display_name, self.me.id, self.room_id);
    }

    pub fn get(&self, participant_id: &str) -> Option<&Participant> {
        if participant_id == self.me.id {
            return Some(&self.me);
        }
        self.remotes.get(participant_id)
    }

    /// Participants in the room, local one included.
    pub fn member_count(&self) -> usize {
        self.remotes.len() + 1
    }

    /// Everyone, local participant included, sorted by id.
    pub fn roster(&self) -> Vec<Participant> {
        let mut roster: Vec<Participant> = self.remotes.values().cloned().collect();
        let at = roster.partition_point(|p| p.id < self.me.id);
        roster.insert(at, self.me.clone());
        roster
    }

    /// Every participant currently holding the Host role.
    pub fn hosts(&self) -> Vec<&Participant> {
        std::iter::once(&self.me)
            .chain(self.remotes.values())
            .filter(|p| p.is_host())
            .collect()
    }

    pub fn has_host_conflict(&self) -> bool {
        self.hosts().len() > 1
    }

    /// A host other than `excluding`, if any. With several, the lowest id wins.
    pub fn active_host(&self, excluding: &str) -> Option<&Participant> {
        let mut hosts: Vec<&Participant> = self
            .hosts()
            .into_iter()
            .filter(|p| p.id != excluding)
            .collect();
        hosts.sort_by(|a, b| a.id.cmp(&b.id));
        hosts.into_iter().next()
    }

    fn publish_roster(&self) {
        self.roster_tx.send_replace(self.roster());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::parse("tavern").unwrap()
    }

    fn host(id: &str) -> Participant {
        let mut p = Participant::with_id(id, id);
        p.role = Role::Host;
        p.host_snapshot = Some(HostState::new("t", true, 1.0, 0));
        p
    }

    #[test]
    fn test_join_roster_contains_self() {
        let (dir, handle) = PresenceDirectory::join(room(), Participant::with_id("me", "Me"));
        assert_eq!(handle.current().len(), 1);
        assert_eq!(dir.roster()[0].id, "me");
        assert_eq!(dir.member_count(), 1);
    }

    #[test]
    fn test_update_self_buffers_until_live() {
        let (mut dir, handle) = PresenceDirectory::join(room(), Participant::with_id("me", "Me"));

        assert!(dir.update_self(ParticipantUpdate::role(Role::Listener)).is_none());
        assert!(dir.update_self(ParticipantUpdate::display_name("Mira")).is_none());
        // Local view reflects the change immediately.
        assert_eq!(handle.current()[0].role, Role::Listener);

        let flushed = dir.set_live(true).unwrap();
        assert_eq!(flushed.role, Role::Listener);
        assert_eq!(flushed.display_name, "Mira");
        assert!(dir.set_live(true).is_none());
    }

    #[test]
    fn test_update_self_publishes_full_record_when_live() {
        let (mut dir, _handle) = PresenceDirectory::join(room(), Participant::with_id("me", "Me"));
        dir.set_live(true);
        let snapshot = HostState::new("t", false, 30.0, 5);
        let record = dir
            .update_self(ParticipantUpdate::role(Role::Host).with_snapshot(Some(snapshot.clone())))
            .unwrap();
        assert_eq!(record.id, "me");
        assert_eq!(record.display_name, "Me");
        assert_eq!(record.host_snapshot, Some(snapshot));

        let cleared = dir.update_self(ParticipantUpdate::host_snapshot(None)).unwrap();
        assert!(cleared.host_snapshot.is_none());
        assert!(dir.update_self(ParticipantUpdate::default()).is_none());
    }

    #[test]
    fn test_display_name_update_is_sanitized() {
        let (mut dir, _handle) = PresenceDirectory::join(room(), Participant::with_id("me", "Me"));
        dir.update_self(ParticipantUpdate::display_name(" <i>x</i> "));
        assert_eq!(dir.me().display_name, "&lt;i&gt;x&lt;/i&gt;");
    }

    #[test]
    fn test_merge_remote_last_write_wins() {
        let (mut dir, handle) = PresenceDirectory::join(room(), Participant::with_id("me", "Me"));
        let mut bob = Participant::with_id("bob", "Bob");
        assert!(dir.merge_remote(bob.clone()));
        assert!(!dir.merge_remote(bob.clone()));

        bob.role = Role::Listener;
        assert!(dir.merge_remote(bob));
        assert_eq!(dir.get("bob").unwrap().role, Role::Listener);
        assert_eq!(handle.current().len(), 2);
    }

    #[test]
    fn test_merge_ignores_own_id() {
        let (mut dir, _handle) = PresenceDirectory::join(room(), Participant::with_id("me", "Me"));
        assert!(!dir.merge_remote(host("me")));
        assert!(!dir.me().is_host());
    }

    #[test]
    fn test_remove_and_replace_all() {
        let (mut dir, handle) = PresenceDirectory::join(room(), Participant::with_id("me", "Me"));
        dir.merge_remote(Participant::with_id("a", "A"));
        assert!(dir.remove("a").is_some());
        assert!(dir.remove("a").is_none());

        dir.replace_all(vec![
            Participant::with_id("b", "B"),
            Participant::with_id("me", "Stale"),
            Participant::with_id("c", "C"),
        ]);
        let ids: Vec<String> = handle.current().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["b", "c", "me"]);
        assert_eq!(dir.me().display_name, "Me");
    }

    #[test]
    fn test_host_conflict_detection() {
        let (mut dir, _handle) = PresenceDirectory::join(room(), Participant::with_id("me", "Me"));
        assert!(dir.hosts().is_empty());
        assert!(dir.active_host("me").is_none());

        dir.merge_remote(host("h2"));
        dir.merge_remote(host("h1"));
        assert!(dir.has_host_conflict());
        assert_eq!(dir.active_host("me").unwrap().id, "h1");
        assert_eq!(dir.active_host("h1").unwrap().id, "h2");
    }

    #[test]
    fn test_leave_empties_roster() {
        let (mut dir, handle) = PresenceDirectory::join(room(), Participant::with_id("me", "Me"));
        dir.set_live(true);
        dir.merge_remote(Participant::with_id("a", "A"));
        dir.leave();
        assert!(handle.current().is_empty());
        assert!(!dir.is_live());
    }

    #[tokio::test]
    async fn test_roster_handle_notified_on_change() {
        let (mut dir, mut handle) = PresenceDirectory::join(room(), Participant::with_id("me", "Me"));
        dir.merge_remote(Participant::with_id("a", "A"));
        assert!(handle.changed().await);
        assert_eq!(handle.current().len(), 2);

        drop(dir);
        assert!(!handle.changed().await);
    }
}

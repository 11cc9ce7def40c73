//! Host / listener / spectator playback state machine.
//!
//! ```text
//!             join_sync                 claim_host
//! Spectator ────────────► Listener ─────────────────► Host
//!     ▲   ◄──────────────    │                          │
//!     │      leave_sync      └────── claim_host ───────►│
//!     └─────────────────────── relinquish_host ─────────┘
//! ```
//!
//! The controller is the only place playback rules live. It drives the
//! local [`AudioRenderer`] directly and hands every side effect that needs
//! I/O (broadcast, presence, persistence) back to its owner as a list of
//! [`SyncEffect`]s.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::external::{AudioRenderer, Clock, SoundEffects, TrackCatalog};
use crate::presence::ParticipantUpdate;
use crate::protocol::{AmbienceState, HostState, Participant, Role, SyncAction, SyncEvent};
use crate::recovery::RecoverySnapshot;

/// I/O the owner of the controller must perform, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEffect {
    Broadcast(SyncEvent),
    PublishPresence(ParticipantUpdate),
    SaveRecovery(RecoverySnapshot),
}

/// What happened to an incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Local playback changed.
    Applied,
    /// Accepted, nothing to change (heartbeat within tolerance).
    InSync,
    /// Not a listener.
    Ignored,
    /// Older than the last event applied from the same sender, or an unknown track.
    Dropped,
}

/// Local playback as observers see it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSnapshot {
    pub role: Role,
    pub track_id: Option<String>,
    pub is_playing: bool,
    pub position_seconds: f64,
}

impl Default for PlaybackSnapshot {
    fn default() -> Self {
        Self {
            role: Role::Spectator,
            track_id: None,
            is_playing: false,
            position_seconds: 0.0,
        }
    }
}

/// Collaborators the controller drives.
pub struct Collaborators {
    pub audio: Box<dyn AudioRenderer>,
    pub effects: Box<dyn SoundEffects>,
    pub catalog: Box<dyn TrackCatalog>,
    pub clock: Arc<dyn Clock>,
}

pub struct SyncController {
    role: Role,
    track_id: Option<String>,
    is_playing: bool,
    /// Set only while Host.
    host_state: Option<HostState>,
    ambience: BTreeMap<String, AmbienceState>,
    /// `sent_at` of the newest transport event applied, per sender. Each
    /// sender stamps with its own clock, so watermarks are never compared
    /// across senders.
    applied_watermarks: HashMap<String, i64>,
    /// Local clock reading when an event was last applied.
    last_event_at: Option<i64>,
    /// Host whose snapshot was last considered for catch-up.
    followed_host: Option<String>,
    audio: Box<dyn AudioRenderer>,
    effects: Box<dyn SoundEffects>,
    catalog: Box<dyn TrackCatalog>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl SyncController {
    pub fn new(collaborators: Collaborators, config: SyncConfig) -> Self {
        Self {
            role: Role::Spectator,
            track_id: None,
            is_playing: false,
            host_state: None,
            ambience: BTreeMap::new(),
            applied_watermarks: HashMap::new(),
            last_event_at: None,
            followed_host: None,
            audio: collaborators.audio,
            effects: collaborators.effects,
            catalog: collaborators.catalog,
            clock: collaborators.clock,
            config,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn host_state(&self) -> Option<&HostState> {
        self.host_state.as_ref()
    }

    pub fn ambience(&self) -> &BTreeMap<String, AmbienceState> {
        &self.ambience
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            role: self.role,
            track_id: self.track_id.clone(),
            is_playing: self.is_playing,
            position_seconds: self.audio.position(),
        }
    }

    fn now(&self) -> i64 {
        self.clock.now_epoch_ms()
    }

    // ─── Local transport controls ─────────────────────────────────────

    pub fn play(&mut self) -> Vec<SyncEffect> {
        self.set_playing(true)
    }

    pub fn pause(&mut self) -> Vec<SyncEffect> {
        self.set_playing(false)
    }

    fn set_playing(&mut self, playing: bool) -> Vec<SyncEffect> {
        let Some(track_id) = self.track_id.clone() else {
            log::debug!("No track loaded, ignoring {}", if playing { "play" } else { "pause" });
            return Vec::new();
        };
        if playing {
            self.audio.play();
        } else {
            self.audio.pause();
        }
        self.is_playing = playing;

        if self.role != Role::Host {
            return Vec::new();
        }
        let now = self.now();
        let position = self.audio.position();
        let event = if playing {
            SyncEvent::play(&track_id, position, now)
        } else {
            SyncEvent::pause(&track_id, position, now)
        };
        self.host_changed(HostState::new(track_id, playing, position, now), vec![event])
    }

    pub fn seek(&mut self, position_seconds: f64) -> Vec<SyncEffect> {
        let Some(track_id) = self.track_id.clone() else {
            log::debug!("No track loaded, ignoring seek");
            return Vec::new();
        };
        let position = position_seconds.max(0.0);
        self.audio.seek(position);

        if self.role != Role::Host {
            return Vec::new();
        }
        let now = self.now();
        let event = SyncEvent::seek(&track_id, position, now);
        self.host_changed(
            HostState::new(track_id, self.is_playing, position, now),
            vec![event],
        )
    }

    /// Switch track, keeping the transport flag.
    pub fn change_track(&mut self, track_id: &str) -> Vec<SyncEffect> {
        if !self.catalog.contains(track_id) {
            log::warn!("Unknown track {track_id}, not switching");
            return Vec::new();
        }
        self.load(track_id);

        if self.role != Role::Host {
            return Vec::new();
        }
        let now = self.now();
        let follow_up = if self.is_playing {
            SyncEvent::play(track_id, 0.0, now)
        } else {
            SyncEvent::pause(track_id, 0.0, now)
        };
        self.host_changed(
            HostState::new(track_id, self.is_playing, 0.0, now),
            vec![SyncEvent::change_track(track_id, now), follow_up],
        )
    }

    /// Renderer reached the end of the current track.
    pub fn track_ended(&mut self) -> Vec<SyncEffect> {
        if !self.is_playing {
            return Vec::new();
        }
        log::debug!("Track {:?} ended", self.track_id);
        self.pause()
    }

    /// Periodic host tick while playing.
    pub fn heartbeat(&mut self) -> Vec<SyncEffect> {
        if self.role != Role::Host || !self.is_playing {
            return Vec::new();
        }
        let Some(track_id) = self.track_id.clone() else {
            return Vec::new();
        };
        let now = self.now();
        let position = self.audio.position();
        log::trace!("Heartbeat {track_id} @ {position:.2}s");
        let event = SyncEvent::time_update(&track_id, position, now);
        self.host_changed(HostState::new(track_id, true, position, now), vec![event])
    }

    pub fn play_sfx(&mut self, sfx_id: &str, volume: Option<u8>) -> Vec<SyncEffect> {
        self.effects.play_sfx(sfx_id, volume);
        if self.role != Role::Host {
            return Vec::new();
        }
        let track_id = self.track_id.clone().unwrap_or_default();
        vec![SyncEffect::Broadcast(SyncEvent::play_sfx(
            track_id,
            sfx_id,
            volume,
            self.now(),
        ))]
    }

    pub fn update_ambience(&mut self, ambience_id: &str, state: AmbienceState) -> Vec<SyncEffect> {
        let state = AmbienceState::new(state.is_playing, state.volume, state.looped);
        self.ambience.insert(ambience_id.to_string(), state);
        self.effects.update_ambience(ambience_id, &state);
        if self.role != Role::Host {
            return Vec::new();
        }
        let track_id = self.track_id.clone().unwrap_or_default();
        vec![SyncEffect::Broadcast(SyncEvent::ambience_update(
            track_id,
            ambience_id,
            state,
            self.now(),
        ))]
    }

    fn load(&mut self, track_id: &str) {
        self.audio.load_track(track_id);
        self.track_id = Some(track_id.to_string());
        if self.is_playing {
            self.audio.play();
        }
    }

    fn host_changed(&mut self, state: HostState, events: Vec<SyncEvent>) -> Vec<SyncEffect> {
        let mut effects = Vec::with_capacity(events.len() + 2);
        effects.push(SyncEffect::SaveRecovery(RecoverySnapshot::from_host_state(&state)));
        effects.push(SyncEffect::PublishPresence(ParticipantUpdate::host_snapshot(Some(
            state.clone(),
        ))));
        effects.extend(events.into_iter().map(SyncEffect::Broadcast));
        self.host_state = Some(state);
        effects
    }

    // ─── Role transitions ─────────────────────────────────────────────

    /// Become Host.
    ///
    /// The published snapshot comes from, in order: the in-memory host
    /// state, the locally loaded track, or `recovered` if it is fresh.
    /// Restored playback always starts paused.
    pub fn claim_host(&mut self, recovered: Option<&RecoverySnapshot>) -> Vec<SyncEffect> {
        if self.role == Role::Host {
            return Vec::new();
        }
        log::info!("Claiming host (was {:?})", self.role);
        self.role = Role::Host;
        self.followed_host = None;
        let now = self.now();

        let state = match (&self.host_state, &self.track_id) {
            (Some(state), _) => Some(state.clone()),
            (None, Some(track_id)) => Some(HostState::new(
                track_id.clone(),
                self.is_playing,
                self.audio.position(),
                now,
            )),
            (None, None) => self.restore(recovered, now),
        };

        let mut effects = Vec::new();
        if let Some(state) = &state {
            effects.push(SyncEffect::SaveRecovery(RecoverySnapshot::from_host_state(state)));
        }
        effects.push(SyncEffect::PublishPresence(
            ParticipantUpdate::role(Role::Host).with_snapshot(state.clone()),
        ));
        self.host_state = state;
        effects
    }

    fn restore(&mut self, recovered: Option<&RecoverySnapshot>, now: i64) -> Option<HostState> {
        let snapshot = recovered?;
        if snapshot.is_stale(now, self.config.recovery_staleness) {
            log::info!(
                "Discarding recovery snapshot for {} ({} ms old)",
                snapshot.track_id,
                now - snapshot.captured_at_epoch_ms
            );
            return None;
        }
        if !self.catalog.contains(&snapshot.track_id) {
            log::warn!("Recovery snapshot names unknown track {}", snapshot.track_id);
            return None;
        }
        self.is_playing = false;
        self.load(&snapshot.track_id);
        self.audio.seek(snapshot.position_seconds);
        log::info!(
            "Restored {} @ {:.1}s from recovery snapshot",
            snapshot.track_id,
            snapshot.position_seconds
        );
        Some(HostState::new(
            snapshot.track_id.clone(),
            false,
            snapshot.position_seconds,
            now,
        ))
    }

    /// Stop hosting and become a Spectator.
    pub fn relinquish_host(&mut self) -> Vec<SyncEffect> {
        if self.role != Role::Host {
            return Vec::new();
        }
        log::info!("Relinquishing host");
        self.role = Role::Spectator;
        self.host_state = None;
        vec![SyncEffect::PublishPresence(
            ParticipantUpdate::role(Role::Spectator).with_snapshot(None),
        )]
    }

    /// Become a Listener and catch up with `host` if given.
    pub fn join_sync(&mut self, host: Option<&Participant>) -> Vec<SyncEffect> {
        if self.role == Role::Listener {
            return Vec::new();
        }
        log::info!("Following host playback (was {:?})", self.role);
        if self.role == Role::Host {
            self.host_state = None;
        }
        self.role = Role::Listener;
        self.followed_host = None;
        self.observe_host(host);
        vec![SyncEffect::PublishPresence(
            ParticipantUpdate::role(Role::Listener).with_snapshot(None),
        )]
    }

    /// Stop following and become a Spectator.
    pub fn leave_sync(&mut self) -> Vec<SyncEffect> {
        if self.role != Role::Listener {
            return Vec::new();
        }
        log::info!("No longer following host playback");
        self.role = Role::Spectator;
        self.followed_host = None;
        vec![SyncEffect::PublishPresence(ParticipantUpdate::role(Role::Spectator))]
    }

    // ─── Listener side ────────────────────────────────────────────────

    /// Roster now shows `host` as the active host (or none).
    ///
    /// The first time a listener sees a given host it catches up from the
    /// host's snapshot, unless an event was applied recently enough that
    /// the live stream is already authoritative.
    pub fn observe_host(&mut self, host: Option<&Participant>) -> bool {
        if self.role != Role::Listener {
            return false;
        }
        let Some(host) = host else {
            self.followed_host = None;
            return false;
        };
        if self.followed_host.as_deref() == Some(host.id.as_str()) {
            return false;
        }
        let Some(snapshot) = host.host_snapshot.clone() else {
            // Wait for a record that carries a snapshot.
            return false;
        };
        self.followed_host = Some(host.id.clone());
        if self.has_recent_event() {
            log::debug!("Recent event applied, skipping catch-up with {}", host.id);
            return false;
        }
        self.catch_up(&host.id, &snapshot)
    }

    fn has_recent_event(&self) -> bool {
        let window = self.config.recent_event_window.as_millis() as i64;
        self.last_event_at
            .is_some_and(|at| self.now() - at <= window)
    }

    fn catch_up(&mut self, host_id: &str, snapshot: &HostState) -> bool {
        if !self.catalog.contains(&snapshot.track_id) {
            log::warn!("Host {host_id} is on unknown track {}", snapshot.track_id);
            return false;
        }
        let now = self.now();
        let estimated = snapshot.estimated_position(now);
        if self.track_id.as_deref() != Some(snapshot.track_id.as_str()) {
            self.audio.load_track(&snapshot.track_id);
            self.track_id = Some(snapshot.track_id.clone());
        }
        self.audio.seek(estimated);
        self.set_flag(snapshot.is_playing);
        self.applied_watermarks
            .entry(host_id.to_string())
            .and_modify(|t| *t = (*t).max(snapshot.captured_at_epoch_ms))
            .or_insert(snapshot.captured_at_epoch_ms);
        self.last_event_at = Some(now);
        log::info!(
            "Caught up with host {host_id}: {} @ {estimated:.2}s ({})",
            snapshot.track_id,
            if snapshot.is_playing { "playing" } else { "paused" }
        );
        true
    }

    /// Apply an event broadcast by `from`.
    pub fn apply_event(&mut self, from: &str, event: &SyncEvent) -> ApplyOutcome {
        if self.role != Role::Listener {
            return ApplyOutcome::Ignored;
        }

        match event.action {
            SyncAction::PlaySfx => {
                if let Some(sfx_id) = &event.sfx_id {
                    self.effects.play_sfx(sfx_id, event.volume);
                    return ApplyOutcome::Applied;
                }
                log::warn!("PlaySfx from {from} without sfx id");
                return ApplyOutcome::Dropped;
            }
            SyncAction::AmbienceUpdate => {
                if let Some((ambience_id, state)) = event.ambience_state() {
                    self.effects.update_ambience(&ambience_id, &state);
                    self.ambience.insert(ambience_id, state);
                    return ApplyOutcome::Applied;
                }
                log::warn!("AmbienceUpdate from {from} without ambience id");
                return ApplyOutcome::Dropped;
            }
            _ => {}
        }

        if let Some(&last) = self.applied_watermarks.get(from) {
            if event.sent_at_epoch_ms < last {
                log::warn!(
                    "Dropping stale {:?} from {from} ({} ms older than last applied)",
                    event.action,
                    last - event.sent_at_epoch_ms
                );
                return ApplyOutcome::Dropped;
            }
        }
        if !self.catalog.contains(&event.track_id) {
            log::warn!("Dropping {:?} from {from}: unknown track {}", event.action, event.track_id);
            return ApplyOutcome::Dropped;
        }

        let outcome = match event.action {
            SyncAction::ChangeTrack => {
                self.load(&event.track_id);
                ApplyOutcome::Applied
            }
            SyncAction::Play | SyncAction::Pause => {
                self.ensure_track(&event.track_id);
                self.audio.seek(event.position_seconds);
                self.set_flag(event.action == SyncAction::Play);
                ApplyOutcome::Applied
            }
            SyncAction::Seek => {
                self.ensure_track(&event.track_id);
                self.audio.seek(event.position_seconds);
                ApplyOutcome::Applied
            }
            SyncAction::TimeUpdate => self.apply_time_update(event),
            SyncAction::PlaySfx | SyncAction::AmbienceUpdate => ApplyOutcome::Ignored,
        };

        self.applied_watermarks
            .insert(from.to_string(), event.sent_at_epoch_ms);
        self.last_event_at = Some(self.now());
        log::debug!(
            "{:?} from {from}: {} @ {:.2}s -> {outcome:?}",
            event.action,
            event.track_id,
            event.position_seconds
        );
        outcome
    }

    fn apply_time_update(&mut self, event: &SyncEvent) -> ApplyOutcome {
        if self.track_id.as_deref() != Some(event.track_id.as_str()) {
            // Missed the track change; adopt the host's track outright.
            self.ensure_track(&event.track_id);
            self.audio.seek(event.position_seconds);
            self.set_flag(true);
            return ApplyOutcome::Applied;
        }
        let drift = (self.audio.position() - event.position_seconds).abs();
        if drift > self.config.drift_tolerance_secs {
            log::debug!("Drift {drift:.2}s exceeds tolerance, resyncing");
            self.audio.seek(event.position_seconds);
            // Full resync: a lost Play or Pause is recovered here.
            self.set_flag(event.is_playing.unwrap_or(true));
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::InSync
        }
    }

    fn ensure_track(&mut self, track_id: &str) {
        if self.track_id.as_deref() != Some(track_id) {
            self.audio.load_track(track_id);
            self.track_id = Some(track_id.to_string());
        }
    }

    fn set_flag(&mut self, playing: bool) {
        if playing {
            self.audio.play();
        } else {
            self.audio.pause();
        }
        self.is_playing = playing;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{ManualClock, OpenCatalog, SilentEffects, SimulatedRenderer, StaticCatalog};
    use std::sync::Mutex;
    use std::time::Duration;

    const T0: i64 = 1_700_000_000_000;

    #[derive(Clone, Default)]
    struct RecordingEffects {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl SoundEffects for RecordingEffects {
        fn play_sfx(&mut self, sfx_id: &str, volume: Option<u8>) {
            self.log.lock().unwrap().push(format!("sfx:{sfx_id}:{volume:?}"));
        }
        fn update_ambience(&mut self, ambience_id: &str, state: &AmbienceState) {
            self.log
                .lock()
                .unwrap()
                .push(format!("amb:{ambience_id}:{}:{}", state.is_playing, state.volume));
        }
    }

    struct Harness {
        controller: SyncController,
        audio: SimulatedRenderer,
        clock: ManualClock,
        effects: RecordingEffects,
    }

    fn harness_with(catalog: Box<dyn TrackCatalog>) -> Harness {
        let clock = ManualClock::new(T0);
        let audio = SimulatedRenderer::new(Arc::new(clock.clone()));
        let effects = RecordingEffects::default();
        let controller = SyncController::new(
            Collaborators {
                audio: Box::new(audio.clone()),
                effects: Box::new(effects.clone()),
                catalog,
                clock: Arc::new(clock.clone()),
            },
            SyncConfig::default(),
        );
        Harness {
            controller,
            audio,
            clock,
            effects,
        }
    }

    fn harness() -> Harness {
        harness_with(Box::new(OpenCatalog))
    }

    fn listener() -> Harness {
        let mut h = harness();
        h.controller.join_sync(None);
        h
    }

    fn broadcasts(effects: &[SyncEffect]) -> Vec<&SyncEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                SyncEffect::Broadcast(ev) => Some(ev),
                _ => None,
            })
            .collect()
    }

    fn host_on(track: &str) -> Harness {
        let mut h = harness();
        h.controller.claim_host(None);
        h.controller.change_track(track);
        h
    }

    // ─── Host ─────────────────────────────────────────────────────────

    #[test]
    fn test_host_play_emits_event_presence_and_recovery() {
        let mut h = host_on("forest");
        h.controller.seek(30.0);
        let effects = h.controller.play();

        assert!(matches!(effects[0], SyncEffect::SaveRecovery(ref s) if s.is_playing));
        match &effects[1] {
            SyncEffect::PublishPresence(update) => {
                let snapshot = update.host_snapshot.clone().flatten().unwrap();
                assert_eq!(snapshot.position_seconds, 30.0);
                assert!(snapshot.is_playing);
            }
            other => panic!("expected presence, got {other:?}"),
        }
        let events = broadcasts(&effects);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, SyncAction::Play);
        assert_eq!(events[0].sent_at_epoch_ms, T0);
        assert!(h.audio.is_playing());
    }

    #[test]
    fn test_host_change_track_keeps_transport_flag() {
        let mut h = host_on("forest");
        h.controller.play();
        let effects = h.controller.change_track("cave");
        let events = broadcasts(&effects);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, SyncAction::ChangeTrack);
        assert_eq!(events[1].action, SyncAction::Play);
        assert_eq!(events[1].position_seconds, 0.0);
        assert_eq!(h.audio.track_id().as_deref(), Some("cave"));
        assert!(h.audio.is_playing());
    }

    #[test]
    fn test_change_track_rejects_unknown() {
        let mut h = harness_with(Box::new(StaticCatalog::new(["forest"])));
        h.controller.claim_host(None);
        assert!(h.controller.change_track("castle").is_empty());
        assert!(h.audio.track_id().is_none());
    }

    #[test]
    fn test_heartbeat_only_while_playing() {
        let mut h = host_on("forest");
        assert!(h.controller.heartbeat().is_empty());

        h.controller.play();
        h.clock.advance_ms(2_000);
        let effects = h.controller.heartbeat();
        let events = broadcasts(&effects);
        assert_eq!(events[0].action, SyncAction::TimeUpdate);
        assert_eq!(events[0].position_seconds, 2.0);
        assert_eq!(h.controller.host_state().unwrap().captured_at_epoch_ms, T0 + 2_000);
    }

    #[test]
    fn test_track_ended_pauses_and_broadcasts() {
        let mut h = host_on("forest");
        h.controller.play();
        h.clock.advance_ms(5_000);
        let effects = h.controller.track_ended();
        let events = broadcasts(&effects);
        assert_eq!(events[0].action, SyncAction::Pause);
        assert_eq!(events[0].position_seconds, 5.0);
        assert!(!h.controller.host_state().unwrap().is_playing);
        assert!(h.controller.track_ended().is_empty());
    }

    #[test]
    fn test_host_sfx_and_ambience() {
        let mut h = host_on("forest");
        let sfx = h.controller.play_sfx("thunder", Some(70));
        assert_eq!(broadcasts(&sfx)[0].sfx_id.as_deref(), Some("thunder"));

        let amb = h
            .controller
            .update_ambience("rain", AmbienceState::new(true, 40, true));
        let (id, state) = broadcasts(&amb)[0].ambience_state().unwrap();
        assert_eq!(id, "rain");
        assert_eq!(state.volume, 40);
        assert_eq!(h.controller.ambience()["rain"], state);
        assert_eq!(
            *h.effects.log.lock().unwrap(),
            vec!["sfx:thunder:Some(70)", "amb:rain:true:40"]
        );
    }

    #[test]
    fn test_non_host_controls_are_local_only() {
        let mut h = harness();
        h.controller.change_track("forest");
        assert!(h.controller.play().is_empty());
        assert!(h.controller.play_sfx("bell", None).is_empty());
        assert!(h.audio.is_playing());
    }

    // ─── Listener ─────────────────────────────────────────────────────

    #[test]
    fn test_listener_applies_transport_events() {
        let mut h = listener();
        let c = &mut h.controller;
        assert_eq!(c.apply_event("h", &SyncEvent::change_track("forest", T0)), ApplyOutcome::Applied);
        assert_eq!(c.apply_event("h", &SyncEvent::play("forest", 12.0, T0 + 1)), ApplyOutcome::Applied);
        assert!(h.audio.is_playing());
        assert_eq!(h.audio.position(), 12.0);

        c.apply_event("h", &SyncEvent::seek("forest", 50.0, T0 + 2));
        assert!(h.audio.is_playing());
        assert_eq!(h.audio.position(), 50.0);

        c.apply_event("h", &SyncEvent::pause("forest", 51.0, T0 + 3));
        assert!(!h.audio.is_playing());
        assert_eq!(c.snapshot().position_seconds, 51.0);
    }

    #[test]
    fn test_change_track_keeps_listener_flag() {
        let mut h = listener();
        h.controller.apply_event("h", &SyncEvent::play("forest", 3.0, T0));
        h.controller.apply_event("h", &SyncEvent::change_track("cave", T0 + 1));
        assert_eq!(h.audio.track_id().as_deref(), Some("cave"));
        assert_eq!(h.audio.position(), 0.0);
        assert!(h.audio.is_playing());
    }

    #[test]
    fn test_seek_is_idempotent() {
        let mut h = listener();
        let seek = SyncEvent::seek("forest", 42.0, T0);
        h.controller.apply_event("h", &seek);
        let once = h.controller.snapshot();
        h.controller.apply_event("h", &seek);
        assert_eq!(h.controller.snapshot(), once);
        assert_eq!(once.position_seconds, 42.0);
    }

    #[test]
    fn test_time_update_resyncs_only_beyond_tolerance() {
        let mut h = listener();
        h.controller.apply_event("h", &SyncEvent::pause("forest", 10.0, T0));
        let seeks = h.audio.seek_count();

        let small = SyncEvent::time_update("forest", 11.0, T0 + 1);
        assert_eq!(h.controller.apply_event("h", &small), ApplyOutcome::InSync);
        assert_eq!(h.audio.position(), 10.0);
        assert_eq!(h.audio.seek_count(), seeks);

        let large = SyncEvent::time_update("forest", 13.5, T0 + 2);
        assert_eq!(h.controller.apply_event("h", &large), ApplyOutcome::Applied);
        assert_eq!(h.audio.position(), 13.5);
        // Heartbeats only come while the host plays.
        assert!(h.audio.is_playing());
    }

    #[test]
    fn test_time_updates_do_not_override_last_transport_state() {
        let mut h = listener();
        h.controller.apply_event("h", &SyncEvent::pause("forest", 20.0, T0));
        for i in 1..5 {
            let tick = SyncEvent::time_update("forest", 20.0 + i as f64 * 0.5, T0 + i);
            h.controller.apply_event("h", &tick);
        }
        assert!(!h.audio.is_playing());
        assert_eq!(h.audio.position(), 20.0);
    }

    #[test]
    fn test_heartbeat_beyond_tolerance_recovers_lost_play() {
        let mut h = listener();
        h.controller.apply_event("h", &SyncEvent::pause("forest", 10.0, T0));
        // The host's Play never arrives; its heartbeats keep coming.
        for i in 1..=5 {
            h.clock.advance_ms(2_000);
            let tick = SyncEvent::time_update("forest", 10.0 + 2.0 * i as f64, T0 + 2_000 * i);
            h.controller.apply_event("h", &tick);
        }
        assert!(h.audio.is_playing());
        assert!(h.controller.snapshot().is_playing);
        assert!((h.audio.position() - 20.0).abs() <= 2.0);
    }

    #[test]
    fn test_stale_event_dropped() {
        let mut h = listener();
        h.controller.apply_event("h", &SyncEvent::seek("forest", 80.0, T0 + 100));
        let late = SyncEvent::seek("forest", 5.0, T0);
        assert_eq!(h.controller.apply_event("h", &late), ApplyOutcome::Dropped);
        assert_eq!(h.audio.position(), 80.0);
    }

    #[test]
    fn test_unknown_track_dropped() {
        let mut h = harness_with(Box::new(StaticCatalog::new(["forest"])));
        h.controller.join_sync(None);
        let outcome = h.controller.apply_event("h", &SyncEvent::play("castle", 1.0, T0));
        assert_eq!(outcome, ApplyOutcome::Dropped);
        assert!(h.audio.track_id().is_none());
    }

    #[test]
    fn test_listener_forwards_sfx_and_ambience() {
        let mut h = listener();
        h.controller.apply_event("h", &SyncEvent::play_sfx("", "bell", Some(20), T0));
        h.controller.apply_event(
            "h",
            &SyncEvent::ambience_update("", "wind", AmbienceState::default(), T0),
        );
        assert_eq!(
            *h.effects.log.lock().unwrap(),
            vec!["sfx:bell:Some(20)", "amb:wind:false:50"]
        );
        assert!(h.controller.ambience().contains_key("wind"));
    }

    #[test]
    fn test_spectator_ignores_events() {
        let mut h = harness();
        let before = h.controller.snapshot();
        for event in [
            SyncEvent::play("forest", 9.0, T0),
            SyncEvent::seek("forest", 3.0, T0),
            SyncEvent::play_sfx("", "bell", None, T0),
        ] {
            assert_eq!(h.controller.apply_event("h", &event), ApplyOutcome::Ignored);
        }
        assert_eq!(h.controller.snapshot(), before);
        assert!(h.effects.log.lock().unwrap().is_empty());
    }

    // ─── Catch-up ─────────────────────────────────────────────────────

    fn remote_host(playing: bool, position: f64, captured: i64) -> Participant {
        let mut host = Participant::with_id("host", "Host");
        host.role = Role::Host;
        host.host_snapshot = Some(HostState::new("forest", playing, position, captured));
        host
    }

    #[test]
    fn test_late_join_extrapolates_playing_host() {
        let mut h = harness();
        h.clock.set(T0 + 4_000);
        h.controller.join_sync(Some(&remote_host(true, 100.0, T0)));
        assert_eq!(h.audio.track_id().as_deref(), Some("forest"));
        assert_eq!(h.audio.position(), 104.0);
        assert!(h.audio.is_playing());
    }

    #[test]
    fn test_late_join_paused_host_uses_position() {
        let mut h = harness();
        h.clock.set(T0 + 60_000);
        h.controller.join_sync(Some(&remote_host(false, 33.0, T0)));
        assert_eq!(h.audio.position(), 33.0);
        assert!(!h.audio.is_playing());
    }

    #[test]
    fn test_catch_up_skipped_after_recent_event() {
        let mut h = listener();
        h.controller.apply_event("h", &SyncEvent::pause("cave", 7.0, T0));
        h.clock.advance_ms(1_000);
        assert!(!h.controller.observe_host(Some(&remote_host(true, 100.0, T0))));
        assert_eq!(h.audio.track_id().as_deref(), Some("cave"));

        // Same host again: already considered.
        h.clock.advance_ms(10_000);
        assert!(!h.controller.observe_host(Some(&remote_host(true, 100.0, T0))));
    }

    #[test]
    fn test_catch_up_when_host_appears_later() {
        let mut h = listener();
        h.clock.advance_ms(2_000);
        assert!(h.controller.observe_host(Some(&remote_host(true, 10.0, T0))));
        assert_eq!(h.audio.position(), 12.0);

        // Events captured before the snapshot are now stale.
        let old = SyncEvent::seek("forest", 1.0, T0 - 5);
        assert_eq!(h.controller.apply_event("host", &old), ApplyOutcome::Dropped);
    }

    #[test]
    fn test_new_host_with_slower_clock_is_followed() {
        let mut h = listener();
        // First host's clock runs a minute ahead.
        h.controller.apply_event("a", &SyncEvent::play("forest", 10.0, T0 + 60_000));
        assert!(h.audio.is_playing());

        h.clock.advance_ms(10_000);
        let mut b = Participant::with_id("b", "B");
        b.role = Role::Host;
        b.host_snapshot = Some(HostState::new("forest", true, 20.0, T0 + 10_000));
        h.controller.observe_host(Some(&b));

        let pause = SyncEvent::pause("forest", 30.0, T0 + 10_500);
        assert_eq!(h.controller.apply_event("b", &pause), ApplyOutcome::Applied);
        assert!(!h.audio.is_playing());
        assert_eq!(h.audio.position(), 30.0);

        // Ordering is still enforced per sender.
        let late = SyncEvent::seek("forest", 1.0, T0 + 10_400);
        assert_eq!(h.controller.apply_event("b", &late), ApplyOutcome::Dropped);
    }

    // ─── Roles / recovery ─────────────────────────────────────────────

    fn recovered(age_ms: i64) -> RecoverySnapshot {
        RecoverySnapshot {
            track_id: "forest".into(),
            is_playing: true,
            position_seconds: 87.0,
            captured_at_epoch_ms: T0 - age_ms,
        }
    }

    #[test]
    fn test_claim_host_restores_fresh_snapshot_paused() {
        let mut h = harness();
        let effects = h.controller.claim_host(Some(&recovered(60_000)));
        let state = h.controller.host_state().unwrap();
        assert_eq!(state.track_id, "forest");
        assert_eq!(state.position_seconds, 87.0);
        assert!(!state.is_playing);
        assert!(!h.audio.is_playing());
        assert_eq!(h.audio.position(), 87.0);
        assert!(matches!(
            effects.last(),
            Some(SyncEffect::PublishPresence(u)) if u.role == Some(Role::Host)
        ));
    }

    #[test]
    fn test_claim_host_discards_stale_snapshot() {
        let mut h = harness();
        h.controller.claim_host(Some(&recovered(3_700_000)));
        assert!(h.controller.host_state().is_none());
        assert!(h.audio.track_id().is_none());
        assert_eq!(h.controller.role(), Role::Host);
    }

    #[test]
    fn test_claim_host_prefers_local_playback() {
        let mut h = listener();
        h.controller.apply_event("h", &SyncEvent::play("cave", 5.0, T0));
        h.controller.claim_host(Some(&recovered(1_000)));
        let state = h.controller.host_state().unwrap();
        assert_eq!(state.track_id, "cave");
        assert!(state.is_playing);
    }

    #[test]
    fn test_relinquish_and_leave_sync() {
        let mut h = host_on("forest");
        let effects = h.controller.relinquish_host();
        assert_eq!(
            effects,
            vec![SyncEffect::PublishPresence(
                ParticipantUpdate::role(Role::Spectator).with_snapshot(None)
            )]
        );
        assert!(h.controller.host_state().is_none());
        assert!(h.controller.relinquish_host().is_empty());

        h.controller.join_sync(None);
        assert_eq!(h.controller.role(), Role::Listener);
        h.controller.leave_sync();
        assert_eq!(h.controller.role(), Role::Spectator);
    }

    #[test]
    fn test_recovery_window_is_configurable() {
        let clock = ManualClock::new(T0);
        let mut c = SyncController::new(
            Collaborators {
                audio: Box::new(SimulatedRenderer::new(Arc::new(clock.clone()))),
                effects: Box::new(SilentEffects),
                catalog: Box::new(OpenCatalog),
                clock: Arc::new(clock),
            },
            SyncConfig {
                recovery_staleness: Duration::from_secs(10),
                ..SyncConfig::default()
            },
        );
        c.claim_host(Some(&recovered(60_000)));
        assert!(c.host_state().is_none());
    }
}

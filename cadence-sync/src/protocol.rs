//! Wire protocol for room playback synchronization.
//!
//! Two layers travel on the wire:
//!
//! - [`SyncEvent`]: the ephemeral playback message a host emits and listeners
//!   apply. Every event carries its own send timestamp.
//! - [`RoomMessage`]: the relay envelope that scopes an event or a presence
//!   record to a room and names its sender.
//!
//! Envelope layout (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬────────────┬──────────┐
//! │ kind     │ room_id   │ sender_id  │ payload  │
//! │ 1 byte   │ ≤20 bytes │ 36 bytes   │ variable │
//! └──────────┴───────────┴────────────┴──────────┘
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{new_participant_id, sanitize_display_name, RoomId};

/// Participant role within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Role {
    /// Visible in the roster, ignores playback synchronization.
    #[default]
    Spectator,
    /// Mirrors the host's playback.
    Listener,
    /// Drives the room's playback timeline.
    Host,
}

/// Host playback snapshot embedded in the host's own presence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostState {
    pub track_id: String,
    pub is_playing: bool,
    pub position_seconds: f64,
    /// Wall-clock time at which `position_seconds` was true.
    pub captured_at_epoch_ms: i64,
}

impl HostState {
    pub fn new(
        track_id: impl Into<String>,
        is_playing: bool,
        position_seconds: f64,
        captured_at_epoch_ms: i64,
    ) -> Self {
        Self {
            track_id: track_id.into(),
            is_playing,
            position_seconds,
            captured_at_epoch_ms,
        }
    }

    /// Extrapolate the host position to `now_epoch_ms`.
    ///
    /// A paused host stays put. A clock that reads earlier than the capture
    /// time contributes no elapsed time.
    pub fn estimated_position(&self, now_epoch_ms: i64) -> f64 {
        if !self.is_playing {
            return self.position_seconds;
        }
        let elapsed_ms = (now_epoch_ms - self.captured_at_epoch_ms).max(0);
        self.position_seconds + elapsed_ms as f64 / 1000.0
    }
}

/// A room member as seen by every roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub role: Role,
    /// Present only on a host's record.
    pub host_snapshot: Option<HostState>,
}

impl Participant {
    /// New spectator with a fresh id and a sanitized name.
    pub fn new(display_name: &str) -> Self {
        Self::with_id(new_participant_id(), display_name)
    }

    /// Create with an explicit id (reconnects, tests).
    pub fn with_id(id: impl Into<String>, display_name: &str) -> Self {
        Self {
            id: id.into(),
            display_name: sanitize_display_name(display_name),
            role: Role::Spectator,
            host_snapshot: None,
        }
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }
}

/// What a [`SyncEvent`] asks the receiver to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SyncAction {
    Play = 1,
    Pause = 2,
    Seek = 3,
    ChangeTrack = 4,
    /// Host heartbeat carrying the live position.
    TimeUpdate = 5,
    PlaySfx = 6,
    AmbienceUpdate = 7,
}

impl SyncAction {
    /// Whether the action touches the shared transport timeline.
    pub fn is_transport(self) -> bool {
        !matches!(self, SyncAction::PlaySfx | SyncAction::AmbienceUpdate)
    }
}

/// Per-ambience-layer playback settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbienceState {
    pub is_playing: bool,
    /// 0–100.
    pub volume: u8,
    pub looped: bool,
}

impl AmbienceState {
    pub fn new(is_playing: bool, volume: u8, looped: bool) -> Self {
        Self {
            is_playing,
            volume: volume.min(100),
            looped,
        }
    }
}

impl Default for AmbienceState {
    fn default() -> Self {
        Self {
            is_playing: false,
            volume: 50,
            looped: false,
        }
    }
}

/// Ephemeral synchronization message. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub action: SyncAction,
    pub track_id: String,
    pub position_seconds: f64,
    pub sent_at_epoch_ms: i64,
    pub sfx_id: Option<String>,
    pub ambience_id: Option<String>,
    /// 0–100.
    pub volume: Option<u8>,
    pub is_playing: Option<bool>,
    pub looped: Option<bool>,
}

impl SyncEvent {
    fn transport(
        action: SyncAction,
        track_id: impl Into<String>,
        position_seconds: f64,
        sent_at_epoch_ms: i64,
    ) -> Self {
        Self {
            action,
            track_id: track_id.into(),
            position_seconds,
            sent_at_epoch_ms,
            sfx_id: None,
            ambience_id: None,
            volume: None,
            is_playing: None,
            looped: None,
        }
    }

    pub fn play(track_id: impl Into<String>, position_seconds: f64, now_ms: i64) -> Self {
        let mut event = Self::transport(SyncAction::Play, track_id, position_seconds, now_ms);
        event.is_playing = Some(true);
        event
    }

    pub fn pause(track_id: impl Into<String>, position_seconds: f64, now_ms: i64) -> Self {
        let mut event = Self::transport(SyncAction::Pause, track_id, position_seconds, now_ms);
        event.is_playing = Some(false);
        event
    }

    pub fn seek(track_id: impl Into<String>, position_seconds: f64, now_ms: i64) -> Self {
        Self::transport(SyncAction::Seek, track_id, position_seconds, now_ms)
    }

    pub fn change_track(track_id: impl Into<String>, now_ms: i64) -> Self {
        Self::transport(SyncAction::ChangeTrack, track_id, 0.0, now_ms)
    }

    pub fn time_update(track_id: impl Into<String>, position_seconds: f64, now_ms: i64) -> Self {
        let mut event = Self::transport(SyncAction::TimeUpdate, track_id, position_seconds, now_ms);
        event.is_playing = Some(true);
        event
    }

    /// Sound effect trigger. `track_id` is the host's current track, if any.
    pub fn play_sfx(
        track_id: impl Into<String>,
        sfx_id: impl Into<String>,
        volume: Option<u8>,
        now_ms: i64,
    ) -> Self {
        let mut event = Self::transport(SyncAction::PlaySfx, track_id, 0.0, now_ms);
        event.sfx_id = Some(sfx_id.into());
        event.volume = volume.map(|v| v.min(100));
        event
    }

    pub fn ambience_update(
        track_id: impl Into<String>,
        ambience_id: impl Into<String>,
        state: AmbienceState,
        now_ms: i64,
    ) -> Self {
        let mut event = Self::transport(SyncAction::AmbienceUpdate, track_id, 0.0, now_ms);
        event.ambience_id = Some(ambience_id.into());
        event.volume = Some(state.volume);
        event.is_playing = Some(state.is_playing);
        event.looped = Some(state.looped);
        event
    }

    /// Ambience settings carried by an `AmbienceUpdate`, defaults filled in.
    pub fn ambience_state(&self) -> Option<(String, AmbienceState)> {
        if self.action != SyncAction::AmbienceUpdate {
            return None;
        }
        let id = self.ambience_id.clone()?;
        let defaults = AmbienceState::default();
        Some((
            id,
            AmbienceState::new(
                self.is_playing.unwrap_or(defaults.is_playing),
                self.volume.unwrap_or(defaults.volume),
                self.looped.unwrap_or(defaults.looped),
            ),
        ))
    }

    /// Milliseconds between send and `now_ms`, never negative.
    pub fn transit_delay_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.sent_at_epoch_ms).max(0)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_value(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_value(bytes)
    }
}

/// Relay envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// First message on a connection; payload is the joiner's record.
    Join = 1,
    /// Full presence record of the sender.
    Presence = 2,
    /// Sender left the room.
    PresenceLeft = 3,
    /// Relay → joiner: everyone currently in the room.
    PresenceSync = 4,
    /// Payload is a [`SyncEvent`].
    Broadcast = 5,
    Ping = 6,
    Pong = 7,
}

/// Top-level relay message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMessage {
    pub kind: MessageKind,
    pub room_id: RoomId,
    pub sender_id: String,
    pub payload: Vec<u8>,
}

impl RoomMessage {
    fn with_payload(
        kind: MessageKind,
        room_id: &RoomId,
        sender_id: &str,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            room_id: room_id.clone(),
            sender_id: sender_id.to_string(),
            payload,
        }
    }

    pub fn join(room_id: &RoomId, me: &Participant) -> Result<Self, ProtocolError> {
        Ok(Self::with_payload(MessageKind::Join, room_id, &me.id, encode_value(me)?))
    }

    pub fn presence(room_id: &RoomId, me: &Participant) -> Result<Self, ProtocolError> {
        Ok(Self::with_payload(MessageKind::Presence, room_id, &me.id, encode_value(me)?))
    }

    pub fn presence_left(room_id: &RoomId, sender_id: &str) -> Self {
        Self::with_payload(MessageKind::PresenceLeft, room_id, sender_id, Vec::new())
    }

    /// Sent by the relay itself, so the sender id is empty.
    pub fn presence_sync(room_id: &RoomId, roster: &[Participant]) -> Result<Self, ProtocolError> {
        Ok(Self::with_payload(
            MessageKind::PresenceSync,
            room_id,
            "",
            encode_value(&roster)?,
        ))
    }

    pub fn broadcast(
        room_id: &RoomId,
        sender_id: &str,
        event: &SyncEvent,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::with_payload(
            MessageKind::Broadcast,
            room_id,
            sender_id,
            event.encode()?,
        ))
    }

    pub fn ping(room_id: &RoomId, sender_id: &str) -> Self {
        Self::with_payload(MessageKind::Ping, room_id, sender_id, Vec::new())
    }

    pub fn pong(room_id: &RoomId, sender_id: &str) -> Self {
        Self::with_payload(MessageKind::Pong, room_id, sender_id, Vec::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_value(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_value(bytes)
    }

    /// Participant record carried by `Join` or `Presence`.
    pub fn participant(&self) -> Result<Participant, ProtocolError> {
        match self.kind {
            MessageKind::Join | MessageKind::Presence => decode_value(&self.payload),
            found => Err(ProtocolError::InvalidMessageType {
                expected: "Join or Presence",
                found,
            }),
        }
    }

    /// Roster carried by `PresenceSync`.
    pub fn roster(&self) -> Result<Vec<Participant>, ProtocolError> {
        match self.kind {
            MessageKind::PresenceSync => decode_value(&self.payload),
            found => Err(ProtocolError::InvalidMessageType {
                expected: "PresenceSync",
                found,
            }),
        }
    }

    /// Event carried by `Broadcast`.
    pub fn event(&self) -> Result<SyncEvent, ProtocolError> {
        match self.kind {
            MessageKind::Broadcast => SyncEvent::decode(&self.payload),
            found => Err(ProtocolError::InvalidMessageType {
                expected: "Broadcast",
                found,
            }),
        }
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_value<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("invalid message type: expected {expected}, found {found:?}")]
    InvalidMessageType {
        expected: &'static str,
        found: MessageKind,
    },
}

//! Seams to the embedding application.
//!
//! The engine never decodes audio, browses a catalog or reads the system
//! clock directly. It talks to these traits instead, so a desktop player, a
//! headless bot and a test harness can all drive the same controller.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::AmbienceState;

/// Local track playback.
pub trait AudioRenderer: Send {
    /// Switch to `track_id`, paused at position 0.
    fn load_track(&mut self, track_id: &str);
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, position_seconds: f64);
    /// Live playback position.
    fn position(&self) -> f64;
}

/// One-shot effects and looping ambience layers.
pub trait SoundEffects: Send {
    fn play_sfx(&mut self, sfx_id: &str, volume: Option<u8>);
    fn update_ambience(&mut self, ambience_id: &str, state: &AmbienceState);
}

/// Known track ids. Ids are opaque to the engine.
pub trait TrackCatalog: Send {
    fn contains(&self, track_id: &str) -> bool;
}

/// Wall clock in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_epoch_ms(&self) -> i64;
}

/// Whether the host environment believes it has connectivity.
pub trait NetworkProbe: Send + Sync {
    fn is_online(&self) -> bool;
}

/// [`Clock`] backed by `SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Settable clock shared between a test and the code under test.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(now_epoch_ms: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(now_epoch_ms)),
        }
    }

    pub fn set(&self, now_epoch_ms: i64) {
        self.now.store(now_epoch_ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Probe that can be flipped from outside; starts online.
#[derive(Debug, Clone)]
pub struct SwitchableProbe {
    online: Arc<AtomicBool>,
}

impl SwitchableProbe {
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Default for SwitchableProbe {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkProbe for SwitchableProbe {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Catalog that accepts every id.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenCatalog;

impl TrackCatalog for OpenCatalog {
    fn contains(&self, _track_id: &str) -> bool {
        true
    }
}

/// Fixed set of track ids.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    tracks: HashSet<String>,
}

impl StaticCatalog {
    pub fn new<I, S>(tracks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tracks: tracks.into_iter().map(Into::into).collect(),
        }
    }
}

impl TrackCatalog for StaticCatalog {
    fn contains(&self, track_id: &str) -> bool {
        self.tracks.contains(track_id)
    }
}

/// Sound effects sink for players without sfx or ambience support.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentEffects;

impl SoundEffects for SilentEffects {
    fn play_sfx(&mut self, _sfx_id: &str, _volume: Option<u8>) {}
    fn update_ambience(&mut self, _ambience_id: &str, _state: &AmbienceState) {}
}

#[derive(Debug, Default)]
struct SimulatedState {
    track_id: Option<String>,
    is_playing: bool,
    anchor_position: f64,
    anchor_epoch_ms: i64,
    seeks: usize,
}

/// Renderer that produces no sound and advances position with a [`Clock`].
///
/// Clones share state, so one clone can be handed to the engine while
/// another is inspected. Useful for headless participants and tests.
#[derive(Clone)]
pub struct SimulatedRenderer {
    state: Arc<Mutex<SimulatedState>>,
    clock: Arc<dyn Clock>,
}

impl SimulatedRenderer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimulatedState::default())),
            clock,
        }
    }

    pub fn track_id(&self) -> Option<String> {
        self.lock().track_id.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.lock().is_playing
    }

    /// Number of explicit seeks so far.
    pub fn seek_count(&self) -> usize {
        self.lock().seeks
    }

    fn lock(&self) -> MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn position_at(state: &SimulatedState, now_epoch_ms: i64) -> f64 {
        if state.is_playing {
            let elapsed_ms = (now_epoch_ms - state.anchor_epoch_ms).max(0);
            state.anchor_position + elapsed_ms as f64 / 1000.0
        } else {
            state.anchor_position
        }
    }

    fn reanchor(&self, state: &mut SimulatedState, position: f64) {
        state.anchor_position = position;
        state.anchor_epoch_ms = self.clock.now_epoch_ms();
    }
}

impl AudioRenderer for SimulatedRenderer {
    fn load_track(&mut self, track_id: &str) {
        let mut state = self.lock();
        state.track_id = Some(track_id.to_string());
        state.is_playing = false;
        self.reanchor(&mut state, 0.0);
    }

    fn play(&mut self) {
        let now = self.clock.now_epoch_ms();
        let mut state = self.lock();
        let position = Self::position_at(&state, now);
        state.is_playing = true;
        self.reanchor(&mut state, position);
    }

    fn pause(&mut self) {
        let now = self.clock.now_epoch_ms();
        let mut state = self.lock();
        let position = Self::position_at(&state, now);
        state.is_playing = false;
        self.reanchor(&mut state, position);
    }

    fn seek(&mut self, position_seconds: f64) {
        let mut state = self.lock();
        state.seeks += 1;
        self.reanchor(&mut state, position_seconds.max(0.0));
    }

    fn position(&self) -> f64 {
        let now = self.clock.now_epoch_ms();
        Self::position_at(&self.lock(), now)
    }
}

//! Tunables shared by the controller, lifecycle manager and room session.

use std::time::Duration;

/// Synchronization timing and buffering configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Host `TimeUpdate` cadence while playing.
    pub heartbeat_interval: Duration,
    /// Listener drift (seconds) tolerated before a `TimeUpdate` forces a resync.
    pub drift_tolerance_secs: f64,
    /// How long a transport error may go unrecovered before surfacing `Degraded`.
    pub grace_period: Duration,
    /// Recovery snapshots older than this are discarded.
    pub recovery_staleness: Duration,
    /// A listener that applied an event within this window skips late-join catch-up.
    pub recent_event_window: Duration,
    /// Capacity of the room session command queue.
    pub command_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            drift_tolerance_secs: 2.0,
            grace_period: Duration::from_secs(5),
            recovery_staleness: Duration::from_secs(60 * 60),
            recent_event_window: Duration::from_secs(4),
            command_capacity: 64,
        }
    }
}

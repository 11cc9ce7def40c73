//! Connection health with grace-period hysteresis.
//!
//! ```text
//!             subscribe ok
//! Connecting ─────────────► Live ◄──────────────┐
//!                            │                  │ recovered / subscribe ok
//!                 error      │  grace elapsed   │
//!            (grace armed) ──┴────────────────► Degraded
//!
//! any ── unsubscribe ──► Closed
//! ```
//!
//! A transport error only arms a deadline. Status flips to `Degraded` when
//! the deadline passes without a recovering signal, so a blip that heals in
//! time is never surfaced. Observers read status from a `watch` channel that
//! only carries surfaced transitions.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Surfaced connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Live,
    Degraded,
    Closed,
}

/// What the owner of the lifecycle has to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    None,
    /// Tear the channel down and subscribe afresh.
    Resubscribe,
}

pub struct ConnectionLifecycle {
    grace_period: Duration,
    grace_deadline: Option<Instant>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl ConnectionLifecycle {
    pub fn new(grace_period: Duration) -> (Self, watch::Receiver<ConnectionStatus>) {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let lifecycle = Self {
            grace_period,
            grace_deadline: None,
            status_tx,
        };
        (lifecycle, status_rx)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// When the pending grace timer fires, if one is armed.
    pub fn grace_deadline(&self) -> Option<Instant> {
        self.grace_deadline
    }

    /// A subscribe attempt is starting. A degraded connection stays
    /// degraded until the attempt succeeds.
    pub fn begin_subscribe(&mut self) {
        if self.status() == ConnectionStatus::Closed {
            self.publish(ConnectionStatus::Connecting);
        }
    }

    pub fn on_subscribed(&mut self) {
        self.grace_deadline = None;
        self.publish(ConnectionStatus::Live);
    }

    /// Transport reported a failure. Arms the grace timer unless one is
    /// already running.
    pub fn on_transport_error(&mut self, now: Instant, reason: &str) {
        if self.status() == ConnectionStatus::Closed {
            return;
        }
        if self.grace_deadline.is_none() {
            self.grace_deadline = Some(now + self.grace_period);
            log::debug!(
                "Transport error ({reason}), waiting {:?} before degrading",
                self.grace_period
            );
        } else {
            log::debug!("Transport error ({reason}) while grace timer armed");
        }
    }

    pub fn on_recovered(&mut self) {
        if self.status() == ConnectionStatus::Closed {
            return;
        }
        if self.grace_deadline.take().is_some() {
            log::debug!("Transport recovered within grace period");
        }
        self.publish(ConnectionStatus::Live);
    }

    /// Grace timer fired.
    ///
    /// Surfaces `Degraded` and, when the environment is online, asks for a
    /// fresh subscription. The timer is re-armed either way so a failed or
    /// skipped attempt is retried one grace period later.
    pub fn on_grace_elapsed(&mut self, now: Instant, online: bool) -> LifecycleAction {
        match self.grace_deadline {
            Some(deadline) if now >= deadline => {}
            _ => return LifecycleAction::None,
        }
        if self.status() != ConnectionStatus::Degraded {
            log::warn!("Connection degraded: no recovery within {:?}", self.grace_period);
        }
        self.publish(ConnectionStatus::Degraded);
        self.grace_deadline = Some(now + self.grace_period);
        if online {
            LifecycleAction::Resubscribe
        } else {
            log::debug!("Offline, postponing resubscribe");
            LifecycleAction::None
        }
    }

    /// Clean unsubscribe. No grace.
    pub fn close(&mut self) {
        self.grace_deadline = None;
        self.publish(ConnectionStatus::Closed);
    }

    fn publish(&self, status: ConnectionStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            log::info!("Connection status {:?} -> {:?}", *current, status);
            *current = status;
            true
        });
    }
}

/// Exponential reconnect delay: `base * 2^n`, n capped at 3.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn next(&mut self) -> Duration {
        self.attempt += 1;
        self.base * 2u32.pow((self.attempt - 1).min(3))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

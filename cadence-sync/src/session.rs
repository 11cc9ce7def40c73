//! One task per joined room.
//!
//! ```text
//! RoomHandle ──commands──┐
//!                        ▼
//! Transport ──events──► SessionActor ──► SyncController ──► AudioRenderer
//!                        │  ▲    │
//!    heartbeat interval ─┘  │    ├──► PresenceDirectory ──► roster watch
//!    grace timer ───────────┘    └──► ConnectionLifecycle ─► status watch
//! ```
//!
//! Every callback (transport event, command, timer) is handled on the same
//! task, so controller, directory and lifecycle never need locks. Leaving
//! cancels the timers and awaits the unsubscribe before the handle's
//! `leave()` returns.

use std::future::pending;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};

use crate::config::SyncConfig;
use crate::controller::{Collaborators, PlaybackSnapshot, SyncController, SyncEffect};
use crate::external::NetworkProbe;
use crate::identity::RoomId;
use crate::lifecycle::{ConnectionLifecycle, ConnectionStatus, LifecycleAction};
use crate::presence::{ParticipantUpdate, PresenceDirectory, RosterHandle};
use crate::protocol::{AmbienceState, Participant};
use crate::recovery::{RecoverySnapshot, RecoveryStore};
use crate::transport::{Transport, TransportEvent};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("room session has ended")]
    Closed,
}

/// Everything a session needs besides the transport.
pub struct SessionDeps {
    pub collaborators: Collaborators,
    pub recovery: Box<dyn RecoveryStore>,
    pub probe: Arc<dyn NetworkProbe>,
}

enum Command {
    Play,
    Pause,
    Seek(f64),
    ChangeTrack(String),
    TrackEnded,
    PlaySfx { sfx_id: String, volume: Option<u8> },
    UpdateAmbience { ambience_id: String, state: AmbienceState },
    ClaimHost(oneshot::Sender<Option<Participant>>),
    RelinquishHost,
    JoinSync,
    LeaveSync,
    Rename(String),
    Leave(oneshot::Sender<()>),
}

/// Entry point for joining a room.
pub struct RoomSession;

impl RoomSession {
    /// Spawn the session task for `room_id`. Must be called inside a tokio
    /// runtime. Subscription happens on the task; watch [`RoomHandle::status`]
    /// to see it go live.
    pub fn join<T: Transport>(
        room_id: RoomId,
        me: Participant,
        transport: T,
        deps: SessionDeps,
        config: SyncConfig,
    ) -> RoomHandle {
        let participant_id = me.id.clone();
        let (directory, roster) = PresenceDirectory::join(room_id.clone(), me);
        let (lifecycle, status) = ConnectionLifecycle::new(config.grace_period);
        let (playback_tx, playback) = watch::channel(PlaybackSnapshot::default());
        let (commands_tx, commands_rx) = mpsc::channel(config.command_capacity);

        let actor = SessionActor {
            room_id: room_id.clone(),
            transport,
            events: None,
            directory,
            controller: SyncController::new(deps.collaborators, config.clone()),
            lifecycle,
            recovery: deps.recovery,
            recovered: None,
            probe: deps.probe,
            config,
            playback_tx,
        };
        let task = tokio::spawn(actor.run(commands_rx));

        RoomHandle {
            room_id,
            participant_id,
            commands: commands_tx,
            roster,
            status,
            playback,
            task,
        }
    }
}

/// Control surface of a running room session.
pub struct RoomHandle {
    room_id: RoomId,
    participant_id: String,
    commands: mpsc::Sender<Command>,
    roster: RosterHandle,
    status: watch::Receiver<ConnectionStatus>,
    playback: watch::Receiver<PlaybackSnapshot>,
    task: JoinHandle<()>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn roster(&self) -> RosterHandle {
        self.roster.clone()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Local playback as of the last handled callback.
    pub fn playback(&self) -> PlaybackSnapshot {
        self.playback.borrow().clone()
    }

    pub fn playback_watch(&self) -> watch::Receiver<PlaybackSnapshot> {
        self.playback.clone()
    }

    async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).await.map_err(|_| SessionError::Closed)
    }

    pub async fn play(&self) -> Result<(), SessionError> {
        self.send(Command::Play).await
    }

    pub async fn pause(&self) -> Result<(), SessionError> {
        self.send(Command::Pause).await
    }

    pub async fn seek(&self, position_seconds: f64) -> Result<(), SessionError> {
        self.send(Command::Seek(position_seconds)).await
    }

    pub async fn change_track(&self, track_id: impl Into<String>) -> Result<(), SessionError> {
        self.send(Command::ChangeTrack(track_id.into())).await
    }

    /// The audio layer finished the current track.
    pub async fn track_ended(&self) -> Result<(), SessionError> {
        self.send(Command::TrackEnded).await
    }

    pub async fn play_sfx(
        &self,
        sfx_id: impl Into<String>,
        volume: Option<u8>,
    ) -> Result<(), SessionError> {
        self.send(Command::PlaySfx {
            sfx_id: sfx_id.into(),
            volume,
        })
        .await
    }

    pub async fn update_ambience(
        &self,
        ambience_id: impl Into<String>,
        state: AmbienceState,
    ) -> Result<(), SessionError> {
        self.send(Command::UpdateAmbience {
            ambience_id: ambience_id.into(),
            state,
        })
        .await
    }

    /// Become host. Returns the record of another participant who was
    /// already hosting, if any. The claim goes through regardless.
    pub async fn claim_host(&self) -> Result<Option<Participant>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ClaimHost(reply)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn relinquish_host(&self) -> Result<(), SessionError> {
        self.send(Command::RelinquishHost).await
    }

    pub async fn join_sync(&self) -> Result<(), SessionError> {
        self.send(Command::JoinSync).await
    }

    pub async fn leave_sync(&self) -> Result<(), SessionError> {
        self.send(Command::LeaveSync).await
    }

    pub async fn rename(&self, display_name: impl Into<String>) -> Result<(), SessionError> {
        self.send(Command::Rename(display_name.into())).await
    }

    /// Unsubscribe and stop the session task. Returns once the task is gone.
    pub async fn leave(self) -> Result<(), SessionError> {
        let (ack, done) = oneshot::channel();
        let sent = self.commands.send(Command::Leave(ack)).await.is_ok();
        if sent {
            let _ = done.await;
        }
        if let Err(e) = self.task.await {
            log::error!("Room session task for {} failed: {e}", self.room_id);
        }
        if sent {
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }
}

struct SessionActor<T: Transport> {
    room_id: RoomId,
    transport: T,
    events: Option<mpsc::Receiver<TransportEvent>>,
    directory: PresenceDirectory,
    controller: SyncController,
    lifecycle: ConnectionLifecycle,
    recovery: Box<dyn RecoveryStore>,
    /// Read once at session start.
    recovered: Option<RecoverySnapshot>,
    probe: Arc<dyn NetworkProbe>,
    config: SyncConfig,
    playback_tx: watch::Sender<PlaybackSnapshot>,
}

impl<T: Transport> SessionActor<T> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        self.recovered = match self.recovery.load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::error!("Failed to read recovery snapshot for {}: {e}", self.room_id);
                None
            }
        };
        self.subscribe().await;

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let grace = self.lifecycle.grace_deadline();
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Leave(ack)) => {
                            self.shutdown().await;
                            let _ = ack.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.shutdown().await;
                            break;
                        }
                    }
                }

                event = async {
                    match self.events.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => pending().await,
                    }
                } => {
                    match event {
                        Some(event) => self.handle_transport_event(event).await,
                        None => {
                            self.events = None;
                            self.directory.set_live(false);
                            self.lifecycle.on_transport_error(Instant::now(), "event channel closed");
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    let effects = self.controller.heartbeat();
                    self.perform(effects).await;
                }

                _ = async {
                    match grace {
                        Some(deadline) => sleep_until(deadline).await,
                        None => pending().await,
                    }
                } => {
                    let online = self.probe.is_online();
                    if self.lifecycle.on_grace_elapsed(Instant::now(), online)
                        == LifecycleAction::Resubscribe
                    {
                        self.resubscribe().await;
                    }
                }
            }
            self.playback_tx.send_replace(self.controller.snapshot());
        }
        log::debug!("Room session for {} stopped", self.room_id);
    }

    async fn subscribe(&mut self) {
        self.lifecycle.begin_subscribe();
        match self
            .transport
            .subscribe(&self.room_id, self.directory.me())
            .await
        {
            Ok(events) => self.events = Some(events),
            Err(e) => {
                log::warn!("Subscribe to {} failed: {e}", self.room_id);
                self.lifecycle.on_transport_error(Instant::now(), &e.to_string());
            }
        }
    }

    async fn resubscribe(&mut self) {
        log::info!("Re-creating channel for room {}", self.room_id);
        self.events = None;
        self.transport.unsubscribe().await;
        self.directory.set_live(false);
        self.subscribe().await;
    }

    async fn shutdown(&mut self) {
        self.lifecycle.close();
        self.events = None;
        self.transport.unsubscribe().await;
        self.directory.leave();
        self.playback_tx.send_replace(self.controller.snapshot());
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Subscribed => {
                self.lifecycle.on_subscribed();
                self.go_live().await;
            }
            TransportEvent::Recovered => {
                self.lifecycle.on_recovered();
                self.go_live().await;
            }
            TransportEvent::Error(reason) => {
                self.directory.set_live(false);
                self.lifecycle.on_transport_error(Instant::now(), &reason);
            }
            TransportEvent::Closed => {
                self.events = None;
                self.directory.set_live(false);
                self.lifecycle.on_transport_error(Instant::now(), "channel closed");
            }
            TransportEvent::Event { from, event } => {
                self.controller.apply_event(&from, &event);
            }
            TransportEvent::Presence(participant) => {
                if self.directory.merge_remote(participant) {
                    self.observe_roster();
                }
            }
            TransportEvent::PresenceLeft(participant_id) => {
                if self.directory.remove(&participant_id).is_some() {
                    self.observe_roster();
                }
            }
            TransportEvent::PresenceSync(roster) => {
                self.directory.replace_all(roster);
                self.observe_roster();
            }
        }
    }

    async fn go_live(&mut self) {
        if let Some(record) = self.directory.set_live(true) {
            self.publish_presence(&record).await;
        }
    }

    fn observe_roster(&mut self) {
        let host = self
            .directory
            .active_host(&self.directory.me().id)
            .cloned();
        self.controller.observe_host(host.as_ref());
    }

    async fn handle_command(&mut self, command: Command) {
        let effects = match command {
            Command::Play => self.controller.play(),
            Command::Pause => self.controller.pause(),
            Command::Seek(position) => self.controller.seek(position),
            Command::ChangeTrack(track_id) => self.controller.change_track(&track_id),
            Command::TrackEnded => self.controller.track_ended(),
            Command::PlaySfx { sfx_id, volume } => self.controller.play_sfx(&sfx_id, volume),
            Command::UpdateAmbience { ambience_id, state } => {
                self.controller.update_ambience(&ambience_id, state)
            }
            Command::ClaimHost(reply) => {
                let me = self.directory.me().id.clone();
                let existing = self.directory.active_host(&me).cloned();
                if let Some(host) = &existing {
                    log::warn!(
                        "{} is already hosting {}; claiming anyway",
                        host.display_name,
                        self.room_id
                    );
                }
                let effects = self.controller.claim_host(self.recovered.as_ref());
                let _ = reply.send(existing);
                effects
            }
            Command::RelinquishHost => self.controller.relinquish_host(),
            Command::JoinSync => {
                let me = self.directory.me().id.clone();
                let host = self.directory.active_host(&me).cloned();
                self.controller.join_sync(host.as_ref())
            }
            Command::LeaveSync => self.controller.leave_sync(),
            Command::Rename(name) => {
                vec![SyncEffect::PublishPresence(ParticipantUpdate::display_name(name))]
            }
            // Handled by the run loop.
            Command::Leave(_) => Vec::new(),
        };
        self.perform(effects).await;
    }

    async fn perform(&mut self, effects: Vec<SyncEffect>) {
        for effect in effects {
            match effect {
                SyncEffect::Broadcast(event) => {
                    if let Err(e) = self.transport.send(&event).await {
                        log::debug!("Broadcast of {:?} not sent: {e}", event.action);
                    }
                }
                SyncEffect::PublishPresence(update) => {
                    if let Some(record) = self.directory.update_self(update) {
                        self.publish_presence(&record).await;
                    }
                }
                SyncEffect::SaveRecovery(snapshot) => {
                    if let Err(e) = self.recovery.save(&snapshot) {
                        log::error!("Failed to save recovery snapshot for {}: {e}", self.room_id);
                    }
                }
            }
        }
    }

    async fn publish_presence(&mut self, record: &Participant) {
        if let Err(e) = self.transport.publish_presence(record).await {
            log::debug!("Presence for {} not published: {e}", record.id);
        }
    }
}

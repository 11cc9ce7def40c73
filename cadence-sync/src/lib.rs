//! # cadence-sync — Room playback synchronization
//!
//! Keeps background music, sound effects and ambience in step across the
//! participants of a named room. One participant hosts and broadcasts
//! playback events; listeners apply them to their local player.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  commands   ┌──────────────────────────────────────┐
//! │ RoomHandle   │ ──────────► │ session actor (one task per room)    │
//! │ (app / UI)   │ ◄────────── │  SyncController  PresenceDirectory   │
//! └──────────────┘  watches    │  ConnectionLifecycle  RecoveryStore  │
//!                              └──────────────────┬───────────────────┘
//!                                                 │ Transport
//!                          ┌──────────────────────┴─────────────┐
//!                          ▼                                    ▼
//!                  ┌───────────────┐   WebSocket      ┌───────────────┐
//!                  │ WsTransport   │ ◄──────────────► │ RelayServer   │
//!                  └───────────────┘  Binary Proto    │ BroadcastGroup│
//!                  ┌───────────────┐                  └───────────────┘
//!                  │LocalTransport │ (in process, same RoomManager)
//!                  └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`identity`] — Room ids, participant ids and display names
//! - [`protocol`] — Sync events, presence records and the bincode wire format
//! - [`broadcast`] — Room-based fan-out with a presence table per room
//! - [`transport`] — Transport trait and the in-process transport
//! - [`presence`] — Local view of who is in the room and who hosts
//! - [`controller`] — Host and listener playback logic
//! - [`lifecycle`] — Channel status, grace period and reconnect backoff
//! - [`recovery`] — Host playback snapshots (memory or RocksDB)
//! - [`session`] — The per-room actor tying everything together
//! - [`server`] — WebSocket relay
//! - [`client`] — WebSocket transport

pub mod identity;
pub mod config;
pub mod protocol;
pub mod broadcast;
pub mod transport;
pub mod presence;
pub mod external;
pub mod lifecycle;
pub mod recovery;
pub mod controller;
pub mod session;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use identity::{RoomId, RoomIdError};
pub use config::SyncConfig;
pub use protocol::{
    AmbienceState, HostState, MessageKind, Participant, ProtocolError, Role, RoomMessage,
    SyncAction, SyncEvent,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, PeerToken, RoomManager};
pub use transport::{LocalTransport, Transport, TransportError, TransportEvent};
pub use presence::{ParticipantUpdate, PresenceDirectory, RosterHandle};
pub use external::{
    AudioRenderer, Clock, ManualClock, NetworkProbe, OpenCatalog, SilentEffects,
    SimulatedRenderer, SoundEffects, StaticCatalog, SwitchableProbe, SystemClock, TrackCatalog,
};
pub use lifecycle::{Backoff, ConnectionLifecycle, ConnectionStatus};
pub use recovery::{
    MemoryRecoveryStore, RecoveryDatabase, RecoveryError, RecoverySnapshot, RecoveryStore,
    RocksRecoveryStore, StoreConfig,
};
pub use controller::{ApplyOutcome, Collaborators, PlaybackSnapshot, SyncController, SyncEffect};
pub use session::{RoomHandle, RoomSession, SessionDeps, SessionError};
pub use server::{RelayServer, ServerConfig, ServerError, ServerStats};
pub use client::{ClientConfig, ConnectionState, WsTransport};

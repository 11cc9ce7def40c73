//! Host playback recovery across restarts.
//!
//! Only a host writes here: every HostState change is written through, and a
//! new host session reads it once to restore where playback stopped.
//! Persistence is best effort. A failing store never blocks playback.
//!
//! Column families of the RocksDB-backed store:
//! - `recovery` — one [`RecoverySnapshot`] per room id (bincode)
//! - `meta`     — the last room the local user was in

use rocksdb::{ColumnFamilyDescriptor, DBWithThreadMode, Options, SingleThreaded, WriteOptions};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use crate::identity::{RoomId, RoomIdError};
use crate::protocol::HostState;

const CF_RECOVERY: &str = "recovery";
const CF_META: &str = "meta";
const COLUMN_FAMILIES: &[&str] = &[CF_RECOVERY, CF_META];

const KEY_LAST_ROOM: &[u8] = b"last_room";

/// Last known host playback state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    pub track_id: String,
    pub is_playing: bool,
    pub position_seconds: f64,
    pub captured_at_epoch_ms: i64,
}

impl RecoverySnapshot {
    pub fn from_host_state(state: &HostState) -> Self {
        Self {
            track_id: state.track_id.clone(),
            is_playing: state.is_playing,
            position_seconds: state.position_seconds,
            captured_at_epoch_ms: state.captured_at_epoch_ms,
        }
    }

    /// Older than `max_age` at `now_epoch_ms`.
    pub fn is_stale(&self, now_epoch_ms: i64, max_age: Duration) -> bool {
        now_epoch_ms - self.captured_at_epoch_ms > max_age.as_millis() as i64
    }

    fn encode(&self) -> Result<Vec<u8>, RecoveryError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| RecoveryError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, RecoveryError> {
        let (snapshot, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| RecoveryError::Deserialization(e.to_string()))?;
        Ok(snapshot)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecoveryError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("missing column family {0}")]
    MissingColumnFamily(&'static str),
    #[error("stored room id is invalid: {0}")]
    InvalidRoomId(#[from] RoomIdError),
}

impl From<rocksdb::Error> for RecoveryError {
    fn from(e: rocksdb::Error) -> Self {
        RecoveryError::Database(e.to_string())
    }
}

/// Durable slot for one room's snapshot.
pub trait RecoveryStore: Send {
    fn save(&mut self, snapshot: &RecoverySnapshot) -> Result<(), RecoveryError>;
    fn load(&self) -> Result<Option<RecoverySnapshot>, RecoveryError>;
}

/// In-memory store. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecoveryStore {
    slot: Arc<Mutex<Option<RecoverySnapshot>>>,
}

impl MemoryRecoveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: RecoverySnapshot) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(snapshot))),
        }
    }
}

impl RecoveryStore for MemoryRecoveryStore {
    fn save(&mut self, snapshot: &RecoverySnapshot) -> Result<(), RecoveryError> {
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<RecoverySnapshot>, RecoveryError> {
        let slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(slot.clone())
    }
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory
    pub path: PathBuf,
    /// fsync every write
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cadence_data"),
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// RocksDB database holding recovery snapshots for every room.
#[derive(Clone)]
pub struct RecoveryDatabase {
    db: Arc<DBWithThreadMode<SingleThreaded>>,
    sync_writes: bool,
}

impl RecoveryDatabase {
    /// Open or create the database and its column families.
    pub fn open(config: StoreConfig) -> Result<Self, RecoveryError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened recovery store at {}", config.path.display());

        Ok(Self {
            db: Arc::new(db),
            sync_writes: config.sync_writes,
        })
    }

    /// Store handle scoped to `room_id`.
    pub fn store_for(&self, room_id: &RoomId) -> RocksRecoveryStore {
        RocksRecoveryStore {
            db: self.clone(),
            room_id: room_id.clone(),
        }
    }

    pub fn save_snapshot(
        &self,
        room_id: &RoomId,
        snapshot: &RecoverySnapshot,
    ) -> Result<(), RecoveryError> {
        self.put(CF_RECOVERY, room_id.as_str().as_bytes(), &snapshot.encode()?)
    }

    pub fn load_snapshot(&self, room_id: &RoomId) -> Result<Option<RecoverySnapshot>, RecoveryError> {
        let cf = self.cf(CF_RECOVERY)?;
        match self.db.get_cf(&cf, room_id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(RecoverySnapshot::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save_last_room(&self, room_id: &RoomId) -> Result<(), RecoveryError> {
        self.put(CF_META, KEY_LAST_ROOM, room_id.as_str().as_bytes())
    }

    pub fn load_last_room(&self) -> Result<Option<RoomId>, RecoveryError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, KEY_LAST_ROOM)? {
            Some(bytes) => {
                let raw = String::from_utf8_lossy(&bytes);
                Ok(Some(RoomId::parse(&raw)?))
            }
            None => Ok(None),
        }
    }

    fn put(&self, cf_name: &'static str, key: &[u8], value: &[u8]) -> Result<(), RecoveryError> {
        let cf = self.cf(cf_name)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.put_cf_opt(&cf, key, value, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, RecoveryError> {
        self.db
            .cf_handle(name)
            .ok_or(RecoveryError::MissingColumnFamily(name))
    }
}

/// [`RecoveryStore`] for one room inside a [`RecoveryDatabase`].
pub struct RocksRecoveryStore {
    db: RecoveryDatabase,
    room_id: RoomId,
}

impl RecoveryStore for RocksRecoveryStore {
    fn save(&mut self, snapshot: &RecoverySnapshot) -> Result<(), RecoveryError> {
        self.db.save_snapshot(&self.room_id, snapshot)
    }

    fn load(&self) -> Result<Option<RecoverySnapshot>, RecoveryError> {
        self.db.load_snapshot(&self.room_id)
    }
}

//! Durable resting place for converged room snapshots and chat history.
//!
//! ```text
//! ┌──────────────┐  latest snapshot  ┌────────────┐   encoded    ┌──────────────┐
//! │ Room actor   │ ────(watch)─────► │ Reconciler │ ───────────► │ DocumentStore│
//! │ (Document)   │ ◄──merge_snapshot─│ (per room) │ ◄─────────── │ memory/rocks │
//! └──────────────┘                   └────────────┘              └──────────────┘
//! ```
//!
//! The store never resolves conflicts. Whatever it returns is folded into
//! the live document with `merge_snapshot`, and `saved_at` is only a hint
//! for the logs.
//!
//! Snapshot bytes on disk: `[version:1][lz4(size-prepended bincode)]`.

pub mod codec;
pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;

use async_trait::async_trait;
use pairwise_core::DocumentSnapshot;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ChatMessage;

pub use codec::{decode_snapshot, encode_snapshot, FORMAT_VERSION};
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksStore, StoreConfig};

/// A snapshot as it sits in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub snapshot: DocumentSnapshot,
    /// Unix millis of the save.
    pub saved_at: u64,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("unsupported snapshot format version {0}")]
    UnsupportedVersion(u8),
    #[error("database error: {0}")]
    Database(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Persistence collaborator consumed by the rooms.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// `Ok(None)` when the room was never saved.
    async fn load_document(&self, room_id: &str) -> Result<Option<StoredSnapshot>, StoreError>;

    async fn save_document(&self, room_id: &str, snapshot: &DocumentSnapshot) -> Result<(), StoreError>;

    async fn append_chat_message(&self, thread_id: &str, message: &ChatMessage) -> Result<(), StoreError>;
}

//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`: encoded room snapshots (see [`super::codec`])
//! - `metadata`: per-room bookkeeping (bincode)
//! - `chat`: chat history, keyed by `<thread>\0<millis:8 BE><seq:8 BE>`
//!
//! RocksDB calls block, so the async trait methods run them on the
//! blocking pool.

use async_trait::async_trait;
use pairwise_core::DocumentSnapshot;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::codec::{decode_snapshot, encode_snapshot};
use super::{DocumentStore, StoreError, StoredSnapshot};
use crate::protocol::{now_millis, ChatMessage};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";
const CF_CHAT: &str = "chat";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA, CF_CHAT];

type Db = DBWithThreadMode<SingleThreaded>;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true, saves are rare and final flushes matter)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pairwise_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each room snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room_id: String,
    pub saves: u64,
    pub visible_len: u64,
    pub encoded_size: u64,
    /// Unix millis
    pub created_at: u64,
    pub updated_at: u64,
}

impl RoomMetadata {
    fn new(room_id: &str, now: u64) -> Self {
        Self {
            room_id: room_id.to_string(),
            saves: 0,
            visible_len: 0,
            encoded_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Codec(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        Ok(meta)
    }
}

struct Inner {
    db: Db,
    config: StoreConfig,
    chat_seq: AtomicU64,
}

/// Durable store. Cheap to clone.
#[derive(Clone)]
pub struct RocksStore {
    inner: Arc<Inner>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("opened document store at {}", config.path.display());

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                config,
                chat_seq: AtomicU64::new(0),
            }),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // values are lz4 already
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_CHAT => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Write snapshot and metadata in one batch.
    pub fn save_blocking(&self, room_id: &str, snapshot: &DocumentSnapshot) -> Result<RoomMetadata, StoreError> {
        let inner = &self.inner;
        let cf_docs = inner.cf(CF_DOCUMENTS)?;
        let cf_meta = inner.cf(CF_METADATA)?;

        let now = now_millis();
        let bytes = encode_snapshot(&StoredSnapshot {
            snapshot: snapshot.clone(),
            saved_at: now,
        })?;

        let mut meta = self
            .metadata_blocking(room_id)?
            .unwrap_or_else(|| RoomMetadata::new(room_id, now));
        meta.saves += 1;
        meta.visible_len = snapshot.text.chars().count() as u64;
        meta.encoded_size = bytes.len() as u64;
        meta.updated_at = now;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, room_id.as_bytes(), &bytes);
        batch.put_cf(cf_meta, room_id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(inner.config.sync_writes);
        inner.db.write_opt(batch, &write_opts)?;
        Ok(meta)
    }

    pub fn load_blocking(&self, room_id: &str) -> Result<Option<StoredSnapshot>, StoreError> {
        let cf = self.inner.cf(CF_DOCUMENTS)?;
        self.inner
            .db
            .get_cf(cf, room_id.as_bytes())?
            .map(|bytes| decode_snapshot(&bytes))
            .transpose()
    }

    pub fn metadata_blocking(&self, room_id: &str) -> Result<Option<RoomMetadata>, StoreError> {
        let cf = self.inner.cf(CF_METADATA)?;
        self.inner
            .db
            .get_cf(cf, room_id.as_bytes())?
            .map(|bytes| RoomMetadata::decode(&bytes))
            .transpose()
    }

    pub fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.inner.cf(CF_METADATA)?;
        let mut rooms = Vec::new();
        for item in self.inner.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            rooms.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(rooms)
    }

    pub fn delete_room(&self, room_id: &str) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.inner.cf(CF_DOCUMENTS)?, room_id.as_bytes());
        batch.delete_cf(self.inner.cf(CF_METADATA)?, room_id.as_bytes());
        self.inner.db.write(batch)?;
        Ok(())
    }

    // ─── Chat ─────────────────────────────────────────────────────────

    pub fn append_chat_blocking(&self, thread_id: &str, message: &ChatMessage) -> Result<(), StoreError> {
        let cf = self.inner.cf(CF_CHAT)?;
        let seq = self.inner.chat_seq.fetch_add(1, Ordering::SeqCst);
        let key = chat_key(thread_id, now_millis(), seq);
        let value = bincode::serde::encode_to_vec(message, bincode::config::standard())
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        self.inner.db.put_cf(cf, key, value)?;
        Ok(())
    }

    /// Chat history of a thread, oldest first.
    pub fn chat_history(&self, thread_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let cf = self.inner.cf(CF_CHAT)?;
        let prefix = chat_prefix(thread_id);
        let mut messages = Vec::new();
        let iter = self
            .inner
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let (message, _) = bincode::serde::decode_from_slice(&value, bincode::config::standard())
                .map_err(|e| StoreError::Codec(e.to_string()))?;
            messages.push(message);
        }
        Ok(messages)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(RocksStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
    }
}

impl Inner {
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn load_document(&self, room_id: &str) -> Result<Option<StoredSnapshot>, StoreError> {
        let room_id = room_id.to_string();
        self.blocking(move |store| store.load_blocking(&room_id)).await
    }

    async fn save_document(&self, room_id: &str, snapshot: &DocumentSnapshot) -> Result<(), StoreError> {
        let room_id = room_id.to_string();
        let snapshot = snapshot.clone();
        self.blocking(move |store| store.save_blocking(&room_id, &snapshot).map(|_| ()))
            .await
    }

    async fn append_chat_message(&self, thread_id: &str, message: &ChatMessage) -> Result<(), StoreError> {
        let thread_id = thread_id.to_string();
        let message = message.clone();
        self.blocking(move |store| store.append_chat_blocking(&thread_id, &message))
            .await
    }
}

fn chat_prefix(thread_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(thread_id.len() + 1);
    prefix.extend_from_slice(thread_id.as_bytes());
    prefix.push(0);
    prefix
}

fn chat_key(thread_id: &str, millis: u64, seq: u64) -> Vec<u8> {
    let mut key = chat_prefix(thread_id);
    key.extend_from_slice(&millis.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

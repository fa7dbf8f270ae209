//! In-process store. Keeps encoded snapshots so the byte format is
//! exercised exactly as on disk.
//!
//! Failures can be injected to drive the retry and recovery paths.

use async_trait::async_trait;
use pairwise_core::DocumentSnapshot;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::codec::{decode_snapshot, encode_snapshot};
use super::{DocumentStore, StoreError, StoredSnapshot};
use crate::protocol::{now_millis, ChatMessage};

#[derive(Default)]
struct Tables {
    documents: HashMap<String, Vec<u8>>,
    chat: HashMap<String, Vec<ChatMessage>>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    loads: AtomicU64,
    saves: AtomicU64,
    fail_loads: AtomicUsize,
    fail_saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` loads fail with `Unavailable`.
    pub fn fail_next_loads(&self, n: usize) {
        self.fail_loads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` saves fail with `Unavailable`.
    pub fn fail_next_saves(&self, n: usize) {
        self.fail_saves.store(n, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Load attempts so far, failed ones included.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn chat_log(&self, thread_id: &str) -> Vec<ChatMessage> {
        self.tables().chat.get(thread_id).cloned().unwrap_or_default()
    }

    /// Stored text of a room without going through the trait.
    pub fn stored_text(&self, room_id: &str) -> Option<String> {
        let bytes = self.tables().documents.get(room_id).cloned()?;
        decode_snapshot(&bytes).ok().map(|s| s.snapshot.text)
    }

    /// Seed a room as if it had been saved earlier.
    pub fn insert(&self, room_id: &str, snapshot: &DocumentSnapshot) -> Result<(), StoreError> {
        let bytes = encode_snapshot(&StoredSnapshot {
            snapshot: snapshot.clone(),
            saved_at: now_millis(),
        })?;
        self.tables().documents.insert(room_id.to_string(), bytes);
        Ok(())
    }

    fn injected_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load_document(&self, room_id: &str) -> Result<Option<StoredSnapshot>, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if Self::injected_failure(&self.fail_loads) {
            return Err(StoreError::Unavailable("injected load failure".into()));
        }
        let bytes = self.tables().documents.get(room_id).cloned();
        bytes.map(|b| decode_snapshot(&b)).transpose()
    }

    async fn save_document(&self, room_id: &str, snapshot: &DocumentSnapshot) -> Result<(), StoreError> {
        if Self::injected_failure(&self.fail_saves) {
            return Err(StoreError::Unavailable("injected save failure".into()));
        }
        self.insert(room_id, snapshot)?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn append_chat_message(&self, thread_id: &str, message: &ChatMessage) -> Result<(), StoreError> {
        self.tables()
            .chat
            .entry(thread_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }
}

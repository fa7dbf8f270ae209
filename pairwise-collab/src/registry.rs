//! Room lookup and lifecycle entry points.
//!
//! The registry only knows which rooms are live. Everything that happens
//! inside a room goes through that room's actor mailbox, so membership
//! changes and broadcasts can never race each other.

use pairwise_core::{DocumentSnapshot, Operation};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex};

use crate::protocol::{validate_room_id, ProtocolError, RoomId, ServerEvent, SessionId};
use crate::relay::RelayStats;
use crate::room::{spawn_room, JoinAck, RoomCommand, RoomConfig, RoomHandle, RoomMap, RoomState};
use crate::session::SessionHandle;
use crate::storage::DocumentStore;

/// A join that keeps landing on retiring rooms gives up after this many tries.
const MAX_JOIN_ATTEMPTS: usize = 4;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidRoom(#[from] ProtocolError),
    #[error("room {0} is unavailable")]
    RoomUnavailable(RoomId),
}

pub struct RoomRegistry {
    rooms: RoomMap,
    store: Arc<dyn DocumentStore>,
    config: RoomConfig,
    next_generation: AtomicU64,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, config: RoomConfig) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            store,
            config,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    async fn handle_or_spawn(&self, room_id: &str) -> RoomHandle {
        let mut rooms = self.rooms.lock().await;
        if let Some(handle) = rooms.get(room_id) {
            return handle.clone();
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        log::info!("room {room_id}: created (generation {generation})");
        let handle = spawn_room(
            room_id.to_string(),
            generation,
            self.config.clone(),
            self.store.clone(),
            self.rooms.clone(),
        );
        rooms.insert(room_id.to_string(), handle.clone());
        handle
    }

    async fn handle(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms.lock().await.get(room_id).cloned()
    }

    /// Drop a retiring room from the map so the next join starts fresh.
    async fn forget(&self, room_id: &str, generation: u64) {
        let mut rooms = self.rooms.lock().await;
        if rooms.get(room_id).map(|h| h.generation) == Some(generation) {
            rooms.remove(room_id);
        }
    }

    /// Attach `session` to `room_id`, creating and loading the room if needed.
    pub async fn join_room(&self, session: &SessionHandle, room_id: &str) -> Result<JoinAck, RegistryError> {
        validate_room_id(room_id)?;
        for attempt in 1..=MAX_JOIN_ATTEMPTS {
            let handle = self.handle_or_spawn(room_id).await;
            let (reply, rx) = oneshot::channel();
            let command = RoomCommand::Join {
                session: session.clone(),
                reply,
            };
            if handle.tx.send(command).await.is_ok() {
                if let Ok(Ok(ack)) = rx.await {
                    return Ok(ack);
                }
            }
            log::debug!("room {room_id}: join hit a retiring room (attempt {attempt})");
            self.forget(room_id, handle.generation).await;
        }
        Err(RegistryError::RoomUnavailable(room_id.to_string()))
    }

    /// Detach `session`. Returns whether the room was live.
    pub async fn leave_room(&self, session: SessionId, room_id: &str) -> bool {
        self.send(room_id, RoomCommand::Leave { session }).await
    }

    pub(crate) async fn send(&self, room_id: &str, command: RoomCommand) -> bool {
        match self.handle(room_id).await {
            Some(handle) => handle.tx.send(command).await.is_ok(),
            None => false,
        }
    }

    pub async fn apply(&self, session: SessionId, room_id: &str, op: Operation) -> bool {
        self.send(room_id, RoomCommand::Edit { session, op }).await
    }

    pub async fn chat(&self, session: SessionId, room_id: &str, content: String) -> bool {
        self.send(room_id, RoomCommand::Chat { session, content }).await
    }

    pub async fn touch(&self, session: SessionId, room_id: &str, cursor: Option<usize>) -> bool {
        self.send(room_id, RoomCommand::Cursor { session, cursor }).await
    }

    pub async fn heartbeat(&self, session: SessionId, room_id: &str) -> bool {
        self.send(room_id, RoomCommand::Heartbeat { session }).await
    }

    pub async fn sync_request(&self, session: SessionId, room_id: &str) -> bool {
        self.send(room_id, RoomCommand::SyncRequest { session }).await
    }

    /// Publish a server event to every member of a live room.
    pub async fn announce(&self, room_id: &str, event: ServerEvent) -> bool {
        self.send(room_id, RoomCommand::Announce { event }).await
    }

    /// Current document of a live room.
    pub async fn snapshot(&self, room_id: &str) -> Option<DocumentSnapshot> {
        let (reply, rx) = oneshot::channel();
        if !self.send(room_id, RoomCommand::Snapshot { reply }).await {
            return None;
        }
        rx.await.ok()
    }

    pub async fn relay_stats(&self, room_id: &str) -> Option<RelayStats> {
        let (reply, rx) = oneshot::channel();
        if !self.send(room_id, RoomCommand::Stats { reply }).await {
            return None;
        }
        rx.await.ok()
    }

    /// Lifecycle state of a room; `Empty` when it is not live.
    pub async fn room_state(&self, room_id: &str) -> RoomState {
        match self.handle(room_id).await {
            Some(handle) => *handle.state.borrow(),
            None => RoomState::Empty,
        }
    }

    /// Watch a live room's lifecycle.
    pub async fn watch_state(&self, room_id: &str) -> Option<watch::Receiver<RoomState>> {
        self.handle(room_id).await.map(|h| h.state)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Release every room and wait for their final flushes.
    pub async fn shutdown(&self) {
        let handles: Vec<RoomHandle> = self.rooms.lock().await.drain().map(|(_, h)| h).collect();
        log::info!("shutting down {} room(s)", handles.len());
        for handle in handles {
            let RoomHandle { tx, mut state, .. } = handle;
            drop(tx);
            let _ = state.wait_for(|s| *s == RoomState::Empty).await;
        }
    }
}

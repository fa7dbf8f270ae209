//! Fan-out of accepted room events to member connections.
//!
//! Every connection owns one [`Outbox`]: a bounded FIFO shared by all the
//! rooms it joined. Rooms push, the connection's writer pops. A room actor
//! pushes in the order it accepted events, so each member observes that
//! room's events in one total order.
//!
//! When a stalled reader lets its outbox fill, the whole backlog is thrown
//! away and replaced by one `resync-required` per affected room. The client
//! then asks for a fresh snapshot instead of replaying stale traffic.
//! Queued resync signals do not count against the capacity, so events
//! published after an overflow are always accepted.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use pairwise_core::ReplicaId;

use crate::protocol::{RoomId, ServerEvent, SessionId};

/// What happened to a pushed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The backlog overflowed and was replaced by resync signals.
    Resync,
    Closed,
}

#[derive(Default)]
struct OutboxState {
    queue: VecDeque<Arc<ServerEvent>>,
    /// Rooms whose `resync-required` is queued but not yet taken.
    resync_pending: BTreeSet<RoomId>,
    closed: bool,
}

struct OutboxInner {
    state: Mutex<OutboxState>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

/// Bounded outbound buffer of one connection. Cheap to clone.
#[derive(Clone)]
pub struct Outbox {
    inner: Arc<OutboxInner>,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(OutboxInner {
                state: Mutex::new(OutboxState::default()),
                notify: Notify::new(),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutboxState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, event: Arc<ServerEvent>) -> PushOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            if let ServerEvent::ResyncRequired { room_id } = &*event {
                if state.resync_pending.contains(room_id) {
                    return PushOutcome::Queued;
                }
            }
            let fresh = state.queue.len().saturating_sub(state.resync_pending.len());
            if fresh < self.inner.capacity {
                state.queue.push_back(event);
                PushOutcome::Queued
            } else {
                self.overflow(&mut state, &event);
                PushOutcome::Resync
            }
        };
        self.inner.notify.notify_one();
        outcome
    }

    fn overflow(&self, state: &mut OutboxState, incoming: &ServerEvent) {
        let mut rooms = std::mem::take(&mut state.resync_pending);
        let mut dropped = 1u64;
        for event in state.queue.drain(..) {
            if let Some(room) = event.room_id() {
                rooms.insert(room.to_string());
            }
            if !matches!(*event, ServerEvent::ResyncRequired { .. }) {
                dropped += 1;
            }
        }
        if let Some(room) = incoming.room_id() {
            rooms.insert(room.to_string());
        }
        self.inner.dropped.fetch_add(dropped, Ordering::Relaxed);
        log::warn!(
            "outbox overflow: dropped {dropped} events, resync for {} room(s)",
            rooms.len()
        );

        for room in &rooms {
            state.queue.push_back(Arc::new(ServerEvent::ResyncRequired {
                room_id: room.clone(),
            }));
        }
        state.resync_pending = rooms;
    }

    /// Take the next event without waiting.
    pub fn try_next(&self) -> Option<Arc<ServerEvent>> {
        let mut state = self.lock();
        let event = state.queue.pop_front()?;
        if let ServerEvent::ResyncRequired { room_id } = &*event {
            state.resync_pending.remove(room_id);
        }
        Some(event)
    }

    /// Wait for the next event. `None` once the outbox is closed and empty.
    pub async fn next(&self) -> Option<Arc<ServerEvent>> {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(event) = self.try_next() {
                return Some(event);
            }
            if self.lock().closed {
                return None;
            }
            notified.await;
        }
    }

    /// Stop accepting events and discard whatever is still queued.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.queue.clear();
            state.resync_pending.clear();
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Events discarded by overflow so far.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn same_channel(&self, other: &Outbox) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub events_published: u64,
    pub deliveries: u64,
    pub resyncs: u64,
    pub members: usize,
}

struct RelayMember {
    replica: ReplicaId,
    outbox: Outbox,
}

/// Membership and fan-out for one room. Owned by the room actor.
pub struct Relay {
    room_id: RoomId,
    members: HashMap<SessionId, RelayMember>,
    events_published: u64,
    deliveries: u64,
    resyncs: u64,
}

impl Relay {
    pub fn new(room_id: impl Into<RoomId>) -> Self {
        Self {
            room_id: room_id.into(),
            members: HashMap::new(),
            events_published: 0,
            deliveries: 0,
            resyncs: 0,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Add or replace a member's outbox.
    pub fn add(&mut self, session: SessionId, replica: ReplicaId, outbox: Outbox) {
        self.members.insert(session, RelayMember { replica, outbox });
    }

    pub fn remove(&mut self, session: &SessionId) -> bool {
        self.members.remove(session).is_some()
    }

    pub fn contains(&self, session: &SessionId) -> bool {
        self.members.contains_key(session)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionId> {
        self.members.keys()
    }

    /// The member whose replica issued an operation, if still present.
    pub fn session_for_replica(&self, replica: ReplicaId) -> Option<SessionId> {
        self.members
            .iter()
            .find(|(_, m)| m.replica == replica)
            .map(|(id, _)| *id)
    }

    /// Deliver `event` to every member, skipping `sender` for editor
    /// changes. Returns the number of outboxes it reached.
    pub fn publish(&mut self, event: ServerEvent, sender: Option<SessionId>) -> usize {
        let skip = if event.echoes_to_sender() { None } else { sender };
        let event = Arc::new(event);
        self.events_published += 1;

        let mut delivered = 0;
        for (session, member) in &self.members {
            if Some(*session) == skip {
                continue;
            }
            match member.outbox.push(event.clone()) {
                PushOutcome::Queued => delivered += 1,
                PushOutcome::Resync => self.resyncs += 1,
                PushOutcome::Closed => {
                    log::debug!("room {}: outbox of {session} already closed", self.room_id)
                }
            }
        }
        self.deliveries += delivered as u64;
        delivered
    }

    /// Deliver to a single member.
    pub fn send_to(&mut self, session: &SessionId, event: ServerEvent) -> bool {
        let Some(member) = self.members.get(session) else {
            return false;
        };
        match member.outbox.push(Arc::new(event)) {
            PushOutcome::Queued => {
                self.deliveries += 1;
                true
            }
            PushOutcome::Resync => {
                self.resyncs += 1;
                false
            }
            PushOutcome::Closed => false,
        }
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            events_published: self.events_published,
            deliveries: self.deliveries,
            resyncs: self.resyncs,
            members: self.members.len(),
        }
    }
}

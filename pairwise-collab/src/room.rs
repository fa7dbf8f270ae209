//! The room actor.
//!
//! Each live room is one task that exclusively owns the room's
//! [`Document`], [`Relay`] and [`PresenceTracker`]. Every change arrives as
//! a [`RoomCommand`] on its mailbox and is handled to completion before the
//! next one, which gives the room a single total order of accepted events.
//!
//! ```text
//!            spawn               load ok / NotFound / failed (recovery)
//!  Empty ──────────► Loading ─────────────────────────────► Active
//!                                                       │      ▲
//!                                    last member leaves │      │ join
//!                                                       ▼      │
//!                                                     Draining ┘
//!                                                       │ grace expires
//!                                                       ▼
//!                                  final flush ──► retire ──► Empty
//! ```
//!
//! A member that misses its heartbeats is dropped from the fan-out and told
//! to resync. Its next edit, chat, cursor or heartbeat brings it back with a
//! fresh snapshot, ahead of whatever it sent.

use pairwise_core::{ApplyOutcome, Document, DocumentError, DocumentSnapshot, Operation, PendingLimits};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::presence::PresenceTracker;
use crate::protocol::{now_millis, ChatMessage, EditOp, PresenceInfo, RoomId, ServerEvent, SessionId};
use crate::reconciler::{self, FlushOutcome, ReconcilerHandle, RetryPolicy};
use crate::relay::{Relay, RelayStats};
use crate::session::SessionHandle;
use crate::storage::{DocumentStore, StoredSnapshot};

/// Lifecycle of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomState {
    Empty,
    Loading,
    Active,
    Draining,
}

/// Timing and sizing of rooms.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// How long an empty room waits for someone to come back.
    pub grace_period: Duration,
    /// Debounce interval of periodic saves.
    pub save_interval: Duration,
    /// Per-session presence broadcast rate limit.
    pub presence_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub mailbox_capacity: usize,
    pub retry: RetryPolicy,
    /// Caps on operations waiting for a missing dependency.
    pub pending_limits: PendingLimits,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            save_interval: Duration::from_millis(500),
            presence_interval: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            mailbox_capacity: 1024,
            retry: RetryPolicy::default(),
            pending_limits: PendingLimits::default(),
        }
    }
}

/// What a successful join hands back.
#[derive(Debug, Clone)]
pub struct JoinAck {
    pub snapshot: DocumentSnapshot,
    pub presence: Vec<PresenceInfo>,
}

/// The room finished its final flush and no longer takes commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomClosed;

pub(crate) enum RoomCommand {
    Join {
        session: SessionHandle,
        reply: oneshot::Sender<Result<JoinAck, RoomClosed>>,
    },
    Leave {
        session: SessionId,
    },
    Edit {
        session: SessionId,
        op: Operation,
    },
    Chat {
        session: SessionId,
        content: String,
    },
    Cursor {
        session: SessionId,
        cursor: Option<usize>,
    },
    Heartbeat {
        session: SessionId,
    },
    SyncRequest {
        session: SessionId,
    },
    /// Publish a server-originated event to every member.
    Announce {
        event: ServerEvent,
    },
    Snapshot {
        reply: oneshot::Sender<DocumentSnapshot>,
    },
    Stats {
        reply: oneshot::Sender<RelayStats>,
    },
    /// The background load finished after the room went live.
    Recovered(Option<StoredSnapshot>),
}

/// Registry-side view of a live room.
#[derive(Clone)]
pub(crate) struct RoomHandle {
    pub tx: mpsc::Sender<RoomCommand>,
    pub generation: u64,
    pub state: watch::Receiver<RoomState>,
}

pub(crate) type RoomMap = Arc<Mutex<HashMap<RoomId, RoomHandle>>>;

/// Start a room actor and return its handle. The caller inserts the
/// handle into `rooms`; the actor removes it again when it retires.
pub(crate) fn spawn_room(
    room_id: RoomId,
    generation: u64,
    config: RoomConfig,
    store: Arc<dyn DocumentStore>,
    rooms: RoomMap,
) -> RoomHandle {
    let (tx, mailbox) = mpsc::channel(config.mailbox_capacity.max(1));
    let (state_tx, state) = watch::channel(RoomState::Empty);
    let actor = RoomActor {
        presence: PresenceTracker::new(config.presence_interval, config.heartbeat_timeout),
        relay: Relay::new(room_id.clone()),
        room_id,
        generation,
        document: Document::with_limits(config.pending_limits),
        members: HashMap::new(),
        lapsed: HashMap::new(),
        reconciler: None,
        store,
        rooms,
        mailbox,
        weak_tx: tx.downgrade(),
        state_tx,
        flush_at: None,
        drain_at: None,
        dirty: false,
        recovering: false,
        recovery: None,
        config,
    };
    tokio::spawn(actor.run());
    RoomHandle {
        tx,
        generation,
        state,
    }
}

struct RoomActor {
    room_id: RoomId,
    generation: u64,
    config: RoomConfig,
    document: Document,
    relay: Relay,
    presence: PresenceTracker,
    members: HashMap<SessionId, SessionHandle>,
    /// Members dropped for missing heartbeats, kept until they show
    /// activity again or disconnect.
    lapsed: HashMap<SessionId, SessionHandle>,
    store: Arc<dyn DocumentStore>,
    reconciler: Option<ReconcilerHandle>,
    rooms: RoomMap,
    mailbox: mpsc::Receiver<RoomCommand>,
    weak_tx: mpsc::WeakSender<RoomCommand>,
    state_tx: watch::Sender<RoomState>,
    /// Next periodic save.
    flush_at: Option<Instant>,
    /// Grace timer expiry while draining.
    drain_at: Option<Instant>,
    /// Mutations since the last published snapshot.
    dirty: bool,
    /// The initial load failed; the stored copy is still unknown.
    recovering: bool,
    recovery: Option<JoinHandle<()>>,
}

impl RoomActor {
    async fn run(mut self) {
        self.set_state(RoomState::Loading);
        self.load().await;
        self.reconciler = Some(ReconcilerHandle::spawn(
            self.room_id.clone(),
            self.store.clone(),
            self.config.retry.clone(),
        ));
        self.set_state(RoomState::Active);

        let period = self.config.sweep_interval.max(Duration::from_millis(1));
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flush_deadline = self.flush_at.unwrap_or_else(Instant::now);
            let drain_deadline = self.drain_at.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;
                command = self.mailbox.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        log::info!("room {}: registry gone, shutting down", self.room_id);
                        break;
                    }
                },
                _ = tokio::time::sleep_until(drain_deadline), if self.drain_at.is_some() => {
                    log::info!("room {}: grace period over", self.room_id);
                    break;
                }
                _ = tokio::time::sleep_until(flush_deadline), if self.flush_at.is_some() => {
                    self.periodic_flush();
                }
                _ = sweep.tick() => self.sweep(Instant::now()),
            }
        }

        self.shutdown().await;
    }

    fn set_state(&self, state: RoomState) {
        self.state_tx.send_replace(state);
    }

    fn state(&self) -> RoomState {
        *self.state_tx.borrow()
    }

    // ─── Loading ──────────────────────────────────────────────────────

    async fn load(&mut self) {
        match reconciler::load(&*self.store, &self.room_id, &self.config.retry).await {
            Ok(Some(stored)) => {
                let mut document = Document::with_limits(self.config.pending_limits);
                match document.merge_snapshot(&stored.snapshot) {
                    Ok(_) => self.document = document,
                    Err(e) => log::error!(
                        "room {}: stored snapshot is corrupt ({e}), starting empty",
                        self.room_id
                    ),
                }
            }
            Ok(None) => {}
            Err(e) => {
                log::error!(
                    "room {}: load failed ({e}), going live in recovery mode",
                    self.room_id
                );
                self.recovering = true;
                self.recovery = Some(self.spawn_recovery());
            }
        }
    }

    /// Keep trying to load in the background and post the result back.
    fn spawn_recovery(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let policy = self.config.retry.clone();
        let room_id = self.room_id.clone();
        let tx = self.weak_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(policy.max_backoff).await;
                match reconciler::load(&*store, &room_id, &policy).await {
                    Ok(stored) => {
                        if let Some(tx) = tx.upgrade() {
                            let _ = tx.send(RoomCommand::Recovered(stored)).await;
                        }
                        return;
                    }
                    Err(_) => log::warn!("room {room_id}: store still unreachable, recovery continues"),
                }
            }
        })
    }

    fn recovered(&mut self, stored: Option<StoredSnapshot>) {
        self.recovering = false;
        self.recovery = None;
        if let Some(stored) = stored {
            match self.document.merge_snapshot(&stored.snapshot) {
                Ok(added) => {
                    log::info!(
                        "room {}: merged stored snapshot ({added} new blocks, saved_at={})",
                        self.room_id,
                        stored.saved_at
                    );
                    let event = ServerEvent::snapshot(&self.room_id, &self.document.snapshot());
                    self.relay.publish(event, None);
                }
                Err(e) => log::error!("room {}: stored snapshot unusable: {e}", self.room_id),
            }
        }
        self.mark_dirty();
    }

    // ─── Commands ─────────────────────────────────────────────────────

    fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Join { session, reply } => self.join(session, reply),
            RoomCommand::Leave { session } => self.leave(&session),
            RoomCommand::Edit { session, op } => self.edit(&session, op),
            RoomCommand::Chat { session, content } => self.chat(&session, content),
            RoomCommand::Cursor { session, cursor } => {
                if self.reattach(&session) && self.presence.touch(&session, cursor, Instant::now()) {
                    self.broadcast_presence();
                }
            }
            RoomCommand::Heartbeat { session } => {
                if self.reattach(&session) {
                    self.presence.heartbeat(&session, Instant::now());
                }
            }
            RoomCommand::SyncRequest { session } => {
                // a re-attached member already got its snapshot
                if self.lapsed.contains_key(&session) {
                    self.reattach(&session);
                } else {
                    let event = ServerEvent::snapshot(&self.room_id, &self.document.snapshot());
                    self.relay.send_to(&session, event);
                }
            }
            RoomCommand::Announce { event } => {
                self.relay.publish(event, None);
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(self.document.snapshot());
            }
            RoomCommand::Stats { reply } => {
                let _ = reply.send(self.relay.stats());
            }
            RoomCommand::Recovered(stored) => self.recovered(stored),
        }
    }

    fn join(&mut self, session: SessionHandle, reply: oneshot::Sender<Result<JoinAck, RoomClosed>>) {
        self.lapsed.remove(&session.id);
        let id = session.id;
        let ack = self.attach(session);
        if reply.send(Ok(ack)).is_err() {
            log::debug!("room {}: joiner {id} went away", self.room_id);
            self.leave(&id);
            return;
        }
        self.broadcast_presence();
    }

    /// Make `session` a member and queue its snapshot.
    fn attach(&mut self, session: SessionHandle) -> JoinAck {
        if self.drain_at.take().is_some() {
            log::info!("room {}: rejoined during grace period", self.room_id);
            self.set_state(RoomState::Active);
            if let Some(reconciler) = &self.reconciler {
                reconciler.resume();
            }
            if self.dirty {
                self.schedule_flush();
            }
        }

        let id = session.id;
        self.relay.add(id, session.replica, session.outbox.clone());
        self.presence.register(id, session.user_id.clone(), Instant::now());
        log::info!(
            "room {}: {} joined as {id} ({} members)",
            self.room_id,
            session.user_id,
            self.relay.len()
        );
        self.members.insert(id, session);

        // queued before any later edit so the member never sees an op
        // its snapshot already contains
        let snapshot = self.document.snapshot();
        self.relay.send_to(&id, ServerEvent::snapshot(&self.room_id, &snapshot));
        JoinAck {
            snapshot,
            presence: self.presence.list(),
        }
    }

    /// Whether `session` is a member, bringing a lapsed one back first.
    fn reattach(&mut self, session: &SessionId) -> bool {
        if self.members.contains_key(session) {
            return true;
        }
        let Some(handle) = self.lapsed.remove(session) else {
            return false;
        };
        if handle.outbox.is_closed() {
            return false;
        }
        log::info!("room {}: {session} is back after missing heartbeats", self.room_id);
        self.attach(handle);
        self.broadcast_presence();
        true
    }

    fn leave(&mut self, session: &SessionId) {
        self.lapsed.remove(session);
        let Some(member) = self.members.remove(session) else {
            return;
        };
        self.relay.remove(session);
        self.presence.remove(session);
        log::info!(
            "room {}: {} left ({} members)",
            self.room_id,
            member.user_id,
            self.relay.len()
        );
        self.broadcast_presence();
        if self.relay.is_empty() {
            self.begin_drain();
        }
    }

    fn edit(&mut self, session: &SessionId, op: Operation) {
        if !self.reattach(session) {
            log::debug!("room {}: edit from non-member {session} ignored", self.room_id);
            return;
        }
        self.presence.heartbeat(session, Instant::now());

        let id = op.id();
        match self.document.apply(op) {
            Ok(ApplyOutcome::Applied(ops)) => {
                for op in ops {
                    let origin = self.relay.session_for_replica(op.origin());
                    let event = ServerEvent::EditOp(EditOp::from_operation(&self.room_id, &op));
                    self.relay.publish(event, origin);
                }
                self.mark_dirty();
            }
            Ok(ApplyOutcome::Buffered) => {
                log::debug!("room {}: {id} buffered", self.room_id);
                self.mark_dirty();
            }
            Ok(ApplyOutcome::Duplicate) => log::debug!("room {}: duplicate {id}", self.room_id),
            Err(e @ DocumentError::BufferFull { .. }) => {
                log::warn!("room {}: refusing {id} from {session}: {e}", self.room_id);
                let event = ServerEvent::ResyncRequired {
                    room_id: self.room_id.clone(),
                };
                self.relay.send_to(session, event);
            }
            Err(e) => log::warn!("room {}: malformed operation from {session}: {e}", self.room_id),
        }
    }

    fn chat(&mut self, session: &SessionId, content: String) {
        if !self.reattach(session) {
            return;
        }
        let Some(member) = self.members.get(session) else {
            return;
        };
        let message = ChatMessage {
            room_id: self.room_id.clone(),
            author: member.user_id.clone(),
            content,
            ts: now_millis(),
        };
        self.presence.heartbeat(session, Instant::now());
        self.relay
            .publish(ServerEvent::ChatMessage(message.clone()), Some(*session));
        reconciler::spawn_chat_append(self.store.clone(), self.config.retry.clone(), message);
    }

    fn broadcast_presence(&mut self) {
        let event = ServerEvent::PresenceUpdate {
            room_id: self.room_id.clone(),
            sessions: self.presence.list(),
        };
        self.relay.publish(event, None);
    }

    // ─── Timers ───────────────────────────────────────────────────────

    fn sweep(&mut self, now: Instant) {
        let mut changed = self.presence.take_due(now);
        for session in self.presence.expire(now) {
            log::info!("room {}: {session} missed its heartbeats", self.room_id);
            self.relay.remove(&session);
            if let Some(member) = self.members.remove(&session) {
                member.send(ServerEvent::ResyncRequired {
                    room_id: self.room_id.clone(),
                });
                self.lapsed.insert(session, member);
            }
            changed = true;
        }
        if changed {
            self.broadcast_presence();
        }
        if self.relay.is_empty() && self.state() == RoomState::Active {
            self.begin_drain();
        }
    }

    fn begin_drain(&mut self) {
        if self.drain_at.is_some() {
            return;
        }
        log::info!(
            "room {}: empty, draining for {:?}",
            self.room_id,
            self.config.grace_period
        );
        self.set_state(RoomState::Draining);
        self.flush_at = None;
        self.drain_at = Some(Instant::now() + self.config.grace_period);
        if let Some(reconciler) = &self.reconciler {
            reconciler.hold();
        }
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.schedule_flush();
    }

    fn schedule_flush(&mut self) {
        if self.flush_at.is_none() && !self.recovering && self.state() == RoomState::Active {
            self.flush_at = Some(Instant::now() + self.config.save_interval);
        }
    }

    fn periodic_flush(&mut self) {
        self.flush_at = None;
        if !self.dirty || self.recovering || self.state() != RoomState::Active {
            return;
        }
        if let Some(reconciler) = &self.reconciler {
            reconciler.publish(self.document.snapshot());
            self.dirty = false;
        }
    }

    // ─── Shutdown ─────────────────────────────────────────────────────

    async fn shutdown(mut self) {
        if let Some(task) = self.recovery.take() {
            task.abort();
        }
        if let Some(reconciler) = self.reconciler.take() {
            let outcome = reconciler
                .flush(self.document.snapshot(), self.recovering)
                .await;
            match outcome {
                FlushOutcome::Saved => {}
                FlushOutcome::Skipped => log::error!(
                    "room {}: final flush skipped, store copy could not be reconciled",
                    self.room_id
                ),
                FlushOutcome::Failed(e) => {
                    log::error!("room {}: final flush failed: {e}", self.room_id)
                }
            }
        }

        {
            let mut rooms = self.rooms.lock().await;
            if rooms.get(&self.room_id).map(|h| h.generation) == Some(self.generation) {
                rooms.remove(&self.room_id);
            }
        }

        self.mailbox.close();
        while let Some(command) = self.mailbox.recv().await {
            match command {
                RoomCommand::Join { reply, .. } => {
                    let _ = reply.send(Err(RoomClosed));
                }
                RoomCommand::Snapshot { reply } => {
                    let _ = reply.send(self.document.snapshot());
                }
                _ => {}
            }
        }

        self.set_state(RoomState::Empty);
        log::info!("room {}: retired (generation {})", self.room_id, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;
    use crate::storage::MemoryStore;
    use pairwise_core::{OpId, ReplicaId};

    fn config() -> RoomConfig {
        RoomConfig::default()
    }

    fn start(store: Arc<MemoryStore>) -> RoomHandle {
        let rooms: RoomMap = Arc::new(Mutex::new(HashMap::new()));
        spawn_room("r".into(), 1, config(), store, rooms)
    }

    async fn join(handle: &RoomHandle, session: &SessionHandle) -> JoinAck {
        let (reply, rx) = oneshot::channel();
        handle
            .tx
            .send(RoomCommand::Join {
                session: session.clone(),
                reply,
            })
            .await
            .unwrap();
        rx.await.unwrap().unwrap()
    }

    async fn snapshot(handle: &RoomHandle) -> DocumentSnapshot {
        let (reply, rx) = oneshot::channel();
        handle.tx.send(RoomCommand::Snapshot { reply }).await.unwrap();
        rx.await.unwrap()
    }

    fn drain_events(session: &SessionHandle) -> Vec<Arc<ServerEvent>> {
        std::iter::from_fn(|| session.outbox.try_next()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_queues_snapshot_first() {
        let store = Arc::new(MemoryStore::new());
        let handle = start(store);
        let alice = SessionHandle::new("alice", Role::Student, 16);
        let ack = join(&handle, &alice).await;
        assert!(ack.snapshot.is_empty());
        assert_eq!(ack.presence.len(), 1);
        assert_eq!(*handle.state.borrow(), RoomState::Active);

        let events = drain_events(&alice);
        assert!(matches!(*events[0], ServerEvent::EditorSnapshot { .. }));
        assert!(matches!(*events[1], ServerEvent::PresenceUpdate { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_not_echoed_to_sender() {
        let store = Arc::new(MemoryStore::new());
        let handle = start(store);
        let alice = SessionHandle::new("alice", Role::Student, 16);
        let bob = SessionHandle::new("bob", Role::Mentor, 16);
        join(&handle, &alice).await;
        join(&handle, &bob).await;
        drain_events(&alice);
        drain_events(&bob);

        let op = Operation::insert(OpId::new(alice.replica, 1), None, "hi");
        handle
            .tx
            .send(RoomCommand::Edit {
                session: alice.id,
                op: op.clone(),
            })
            .await
            .unwrap();
        assert_eq!(snapshot(&handle).await.text, "hi");

        assert!(drain_events(&alice).is_empty());
        let bob_events = drain_events(&bob);
        assert_eq!(bob_events.len(), 1);
        assert_eq!(
            *bob_events[0],
            ServerEvent::EditOp(EditOp::from_operation("r", &op))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_operation_does_not_stop_room() {
        let store = Arc::new(MemoryStore::new());
        let handle = start(store);
        let alice = SessionHandle::new("alice", Role::Student, 16);
        join(&handle, &alice).await;

        let bad = Operation::delete(OpId::new(alice.replica, 1), OpId::new(ReplicaId(5), 7));
        handle
            .tx
            .send(RoomCommand::Edit {
                session: alice.id,
                op: bad,
            })
            .await
            .unwrap();
        let good = Operation::insert(OpId::new(alice.replica, 2), None, "ok");
        handle
            .tx
            .send(RoomCommand::Edit {
                session: alice.id,
                op: good,
            })
            .await
            .unwrap();
        assert_eq!(snapshot(&handle).await.text, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_author_is_member_identity() {
        let store = Arc::new(MemoryStore::new());
        let handle = start(store.clone());
        let alice = SessionHandle::new("alice", Role::Student, 16);
        join(&handle, &alice).await;
        drain_events(&alice);

        handle
            .tx
            .send(RoomCommand::Chat {
                session: alice.id,
                content: "hello".into(),
            })
            .await
            .unwrap();
        snapshot(&handle).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        let events = drain_events(&alice);
        let ServerEvent::ChatMessage(msg) = &*events[0] else {
            panic!("expected chat echo, got {events:?}");
        };
        assert_eq!(msg.author, "alice");
        assert_eq!(store.chat_log("r").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_member_expires() {
        let store = Arc::new(MemoryStore::new());
        let handle = start(store);
        let alice = SessionHandle::new("alice", Role::Student, 64);
        let bob = SessionHandle::new("bob", Role::Student, 64);
        join(&handle, &alice).await;
        join(&handle, &bob).await;

        for _ in 0..40 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle
                .tx
                .send(RoomCommand::Heartbeat { session: bob.id })
                .await
                .unwrap();
        }
        let (reply, rx) = oneshot::channel();
        handle.tx.send(RoomCommand::Stats { reply }).await.unwrap();
        assert_eq!(rx.await.unwrap().members, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_member_edit_reattaches() {
        let store = Arc::new(MemoryStore::new());
        let handle = start(store);
        let alice = SessionHandle::new("alice", Role::Student, 256);
        let bob = SessionHandle::new("bob", Role::Mentor, 256);
        join(&handle, &alice).await;
        join(&handle, &bob).await;

        for _ in 0..40 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle
                .tx
                .send(RoomCommand::Heartbeat { session: bob.id })
                .await
                .unwrap();
        }
        let (reply, rx) = oneshot::channel();
        handle.tx.send(RoomCommand::Stats { reply }).await.unwrap();
        assert_eq!(rx.await.unwrap().members, 1);
        let told = drain_events(&alice);
        assert!(told
            .iter()
            .any(|e| matches!(**e, ServerEvent::ResyncRequired { .. })));
        drain_events(&bob);

        let op = Operation::insert(OpId::new(alice.replica, 1), None, "back");
        handle
            .tx
            .send(RoomCommand::Edit {
                session: alice.id,
                op: op.clone(),
            })
            .await
            .unwrap();
        assert_eq!(snapshot(&handle).await.text, "back");

        let alice_events = drain_events(&alice);
        let ServerEvent::EditorSnapshot { text, .. } = &*alice_events[0] else {
            panic!("expected a fresh snapshot first, got {alice_events:?}");
        };
        assert_eq!(text, "");
        let bob_events = drain_events(&bob);
        assert!(bob_events
            .iter()
            .any(|e| **e == ServerEvent::EditOp(EditOp::from_operation("r", &op))));

        let (reply, rx) = oneshot::channel();
        handle.tx.send(RoomCommand::Stats { reply }).await.unwrap();
        assert_eq!(rx.await.unwrap().members, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_departed_session_is_not_reattached() {
        let store = Arc::new(MemoryStore::new());
        let handle = start(store);
        let alice = SessionHandle::new("alice", Role::Student, 64);
        let bob = SessionHandle::new("bob", Role::Student, 64);
        join(&handle, &alice).await;
        join(&handle, &bob).await;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle
                .tx
                .send(RoomCommand::Heartbeat { session: bob.id })
                .await
                .unwrap();
        }
        handle
            .tx
            .send(RoomCommand::Leave { session: alice.id })
            .await
            .unwrap();
        handle
            .tx
            .send(RoomCommand::Edit {
                session: alice.id,
                op: Operation::insert(OpId::new(alice.replica, 1), None, "ghost"),
            })
            .await
            .unwrap();
        assert_eq!(snapshot(&handle).await.text, "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_makes_exactly_one_save_after_degraded_store() {
        let store = Arc::new(MemoryStore::new());
        let handle = start(store.clone());
        let alice = SessionHandle::new("alice", Role::Student, 64);
        join(&handle, &alice).await;

        store.fail_next_saves(5);
        handle
            .tx
            .send(RoomCommand::Edit {
                session: alice.id,
                op: Operation::insert(OpId::new(alice.replica, 1), None, "draft"),
            })
            .await
            .unwrap();
        // debounced save runs out of attempts and enters its cool-down
        tokio::time::sleep(Duration::from_millis(1400)).await;
        assert_eq!(store.save_count(), 0);

        handle
            .tx
            .send(RoomCommand::Leave { session: alice.id })
            .await
            .unwrap();
        let mut state = handle.state.clone();
        state.wait_for(|s| *s == RoomState::Empty).await.unwrap();

        assert_eq!(store.save_count(), 1);
        assert_eq!(store.stored_text("r").as_deref(), Some("draft"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flooded_buffer_asks_sender_to_resync() {
        let store = Arc::new(MemoryStore::new());
        let rooms: RoomMap = Arc::new(Mutex::new(HashMap::new()));
        let config = RoomConfig {
            pending_limits: PendingLimits {
                total: 8,
                per_origin: 2,
            },
            ..RoomConfig::default()
        };
        let handle = spawn_room("r".into(), 1, config, store, rooms);
        let alice = SessionHandle::new("alice", Role::Student, 64);
        join(&handle, &alice).await;
        drain_events(&alice);

        let missing = OpId::new(ReplicaId(77), 1);
        for counter in 2..=4 {
            handle
                .tx
                .send(RoomCommand::Edit {
                    session: alice.id,
                    op: Operation::delete(OpId::new(alice.replica, counter), missing),
                })
                .await
                .unwrap();
        }
        assert_eq!(snapshot(&handle).await.pending.len(), 2);
        let events = drain_events(&alice);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(***e, ServerEvent::ResyncRequired { .. }))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_save_is_debounced() {
        let store = Arc::new(MemoryStore::new());
        let handle = start(store.clone());
        let alice = SessionHandle::new("alice", Role::Student, 1024);
        join(&handle, &alice).await;

        let mut anchor = None;
        for counter in 1..=20 {
            let id = OpId::new(alice.replica, counter);
            handle
                .tx
                .send(RoomCommand::Edit {
                    session: alice.id,
                    op: Operation::insert(id, anchor, "x"),
                })
                .await
                .unwrap();
            anchor = Some(id);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(600)).await;

        // 20 edits over one second: two or three debounced saves, not twenty
        let saves = store.save_count();
        assert!((1..=3).contains(&saves), "saves = {saves}");
        assert_eq!(store.stored_text("r").unwrap().len(), 20);
    }
}

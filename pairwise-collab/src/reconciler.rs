//! Per-room persistence task.
//!
//! The room actor owns the debounce deadline. When it fires, the actor
//! publishes a snapshot on a `watch` channel and the reconciler saves it on
//! its own task, so store latency never reaches the room. Only the newest
//! unsaved snapshot is held.
//!
//! ```text
//! room actor ──publish()──► watch ──► save (RetryPolicy) ──fail──► cool-down, retry
//! room actor ──hold()─────► control ─► cool-down cancelled, snapshot kept
//! room actor ──flush()────► control ─► [load + merge if recovering] ─► save ─► reply, exit
//! ```
//!
//! A draining room holds the reconciler first, so the final flush is the
//! only save made after the last member leaves.

use pairwise_core::{Document, DocumentError, DocumentSnapshot};
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::{ChatMessage, RoomId};
use crate::storage::{DocumentStore, StoreError, StoredSnapshot};

// ───────────────────────────────────────────────────────────────────
// Retry policy
// ───────────────────────────────────────────────────────────────────

/// Bounded exponential backoff for store calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds or the attempts are used up.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    let delay = self.backoff(attempt);
                    log::warn!("{what} failed (attempt {attempt}/{attempts}): {e}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    log::error!("{what} failed after {attempts} attempts: {e}");
                    return Err(e);
                }
            }
        }
    }
}

/// Load a room's stored snapshot under `policy`.
pub async fn load(
    store: &dyn DocumentStore,
    room_id: &str,
    policy: &RetryPolicy,
) -> Result<Option<StoredSnapshot>, StoreError> {
    let what = format!("load of room {room_id}");
    let stored = policy.run(&what, move || store.load_document(room_id)).await?;
    match &stored {
        Some(s) => log::info!(
            "room {room_id}: loaded snapshot ({} chars, saved_at={})",
            s.snapshot.text.chars().count(),
            s.saved_at
        ),
        None => log::info!("room {room_id}: no stored snapshot, starting empty"),
    }
    Ok(stored)
}

/// Append a chat message in the background.
pub fn spawn_chat_append(
    store: Arc<dyn DocumentStore>,
    policy: RetryPolicy,
    message: ChatMessage,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let thread_id = message.room_id.clone();
        let what = format!("chat append to {thread_id}");
        let store = &*store;
        let (thread, msg) = (&thread_id, &message);
        let _ = policy
            .run(&what, move || store.append_chat_message(thread, msg))
            .await;
    })
}

/// Fold a stored copy into a live snapshot.
pub fn merge_stored(
    live: &DocumentSnapshot,
    stored: &DocumentSnapshot,
) -> Result<DocumentSnapshot, DocumentError> {
    let mut doc = Document::from_snapshot(live)?;
    doc.merge_snapshot(stored)?;
    Ok(doc.snapshot())
}

// ───────────────────────────────────────────────────────────────────
// Reconciler task
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Saved,
    /// The store copy could not be reconciled, so nothing was written.
    Skipped,
    Failed(String),
}

enum Control {
    /// The room is draining: stop periodic saves, keep the newest snapshot.
    Hold,
    /// A drain was cancelled.
    Resume,
    Flush {
        snapshot: Arc<DocumentSnapshot>,
        recovering: bool,
        reply: oneshot::Sender<FlushOutcome>,
    },
}

/// Room-side handle of the reconciler.
pub struct ReconcilerHandle {
    snapshots: watch::Sender<Option<Arc<DocumentSnapshot>>>,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub fn spawn(room_id: RoomId, store: Arc<dyn DocumentStore>, policy: RetryPolicy) -> Self {
        let (snapshots, snapshot_rx) = watch::channel(None);
        let (control, control_rx) = mpsc::unbounded_channel();
        let reconciler = Reconciler {
            room_id,
            store,
            policy,
            snapshots: snapshot_rx,
            control: control_rx,
            pending: None,
            retry_at: None,
            held: false,
        };
        let task = tokio::spawn(reconciler.run());
        Self {
            snapshots,
            control,
            task,
        }
    }

    /// Hand over the latest snapshot for a periodic save.
    pub fn publish(&self, snapshot: DocumentSnapshot) {
        self.snapshots.send_replace(Some(Arc::new(snapshot)));
    }

    /// Suspend periodic saves until [`resume`](Self::resume) or the final
    /// flush. A save in progress is abandoned and its snapshot kept.
    pub fn hold(&self) {
        let _ = self.control.send(Control::Hold);
    }

    pub fn resume(&self) {
        let _ = self.control.send(Control::Resume);
    }

    /// Final save. The reconciler exits afterwards.
    pub async fn flush(self, snapshot: DocumentSnapshot, recovering: bool) -> FlushOutcome {
        let (reply, rx) = oneshot::channel();
        let command = Control::Flush {
            snapshot: Arc::new(snapshot),
            recovering,
            reply,
        };
        if self.control.send(command).is_err() {
            return FlushOutcome::Failed("reconciler stopped".into());
        }
        let outcome = rx
            .await
            .unwrap_or_else(|_| FlushOutcome::Failed("reconciler dropped the flush".into()));
        let _ = self.task.await;
        outcome
    }
}

struct Reconciler {
    room_id: RoomId,
    store: Arc<dyn DocumentStore>,
    policy: RetryPolicy,
    snapshots: watch::Receiver<Option<Arc<DocumentSnapshot>>>,
    control: mpsc::UnboundedReceiver<Control>,
    /// Newest snapshot not yet durable.
    pending: Option<Arc<DocumentSnapshot>>,
    /// Cool-down after an exhausted periodic save.
    retry_at: Option<Instant>,
    held: bool,
}

async fn save_snapshot(
    store: &dyn DocumentStore,
    room_id: &str,
    policy: &RetryPolicy,
    snapshot: &DocumentSnapshot,
) -> Result<(), StoreError> {
    let what = format!("save of room {room_id}");
    policy
        .run(&what, move || store.save_document(room_id, snapshot))
        .await
}

impl Reconciler {
    async fn run(mut self) {
        let mut watching = true;
        loop {
            let retry_deadline = self.retry_at.unwrap_or_else(Instant::now);
            let step = tokio::select! {
                biased;
                command = self.control.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => ControlFlow::Break(()),
                },
                changed = self.snapshots.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let latest = self.snapshots.borrow_and_update().clone();
                    match latest {
                        Some(snapshot) => {
                            self.pending = Some(snapshot);
                            if self.retry_at.is_none() && !self.held {
                                self.save_pending().await
                            } else {
                                ControlFlow::Continue(())
                            }
                        }
                        None => ControlFlow::Continue(()),
                    }
                }
                _ = tokio::time::sleep_until(retry_deadline), if self.retry_at.is_some() => {
                    self.retry_at = None;
                    self.save_pending().await
                }
            };
            if step.is_break() {
                return;
            }
        }
    }

    async fn handle(&mut self, command: Control) -> ControlFlow<()> {
        match command {
            Control::Hold => {
                log::debug!("room {}: periodic saves held", self.room_id);
                self.held = true;
                self.retry_at = None;
                ControlFlow::Continue(())
            }
            Control::Resume => {
                log::debug!("room {}: periodic saves resumed", self.room_id);
                self.held = false;
                if self.pending.is_some() {
                    self.retry_at = Some(Instant::now());
                }
                ControlFlow::Continue(())
            }
            Control::Flush {
                snapshot,
                recovering,
                reply,
            } => {
                let outcome = self.final_flush(snapshot, recovering).await;
                let _ = reply.send(outcome);
                ControlFlow::Break(())
            }
        }
    }

    /// Save the pending snapshot, giving way to any control message that
    /// arrives meanwhile.
    async fn save_pending(&mut self) -> ControlFlow<()> {
        let Some(snapshot) = self.pending.take() else {
            return ControlFlow::Continue(());
        };
        let result = tokio::select! {
            result = save_snapshot(&*self.store, &self.room_id, &self.policy, &snapshot) => Ok(result),
            command = self.control.recv() => Err(command),
        };
        match result {
            Ok(Ok(())) => {
                log::debug!(
                    "room {}: saved snapshot ({} ops)",
                    self.room_id,
                    snapshot.applied.len()
                );
                ControlFlow::Continue(())
            }
            Ok(Err(_)) => {
                let cool_down = self.policy.max_backoff;
                log::warn!(
                    "room {}: store degraded, keeping snapshot in memory and retrying in {cool_down:?}",
                    self.room_id
                );
                // a newer publish wins over the failed copy
                if self.pending.is_none() {
                    self.pending = Some(snapshot);
                }
                self.retry_at = Some(Instant::now() + cool_down);
                ControlFlow::Continue(())
            }
            Err(command) => {
                if self.pending.is_none() {
                    self.pending = Some(snapshot);
                }
                match command {
                    Some(command) => self.handle(command).await,
                    None => ControlFlow::Break(()),
                }
            }
        }
    }

    async fn final_flush(&mut self, snapshot: Arc<DocumentSnapshot>, recovering: bool) -> FlushOutcome {
        self.pending = None;
        self.retry_at = None;

        let snapshot = if recovering {
            match self.reconcile_with_store(&snapshot).await {
                Some(merged) => merged,
                None => return FlushOutcome::Skipped,
            }
        } else {
            snapshot
        };

        match save_snapshot(&*self.store, &self.room_id, &self.policy, &snapshot).await {
            Ok(()) => {
                log::info!("room {}: final flush saved", self.room_id);
                FlushOutcome::Saved
            }
            Err(e) => FlushOutcome::Failed(e.to_string()),
        }
    }

    async fn reconcile_with_store(&self, live: &Arc<DocumentSnapshot>) -> Option<Arc<DocumentSnapshot>> {
        match load(&*self.store, &self.room_id, &self.policy).await {
            Ok(None) => Some(live.clone()),
            Ok(Some(stored)) => match merge_stored(live, &stored.snapshot) {
                Ok(merged) => Some(Arc::new(merged)),
                Err(e) => {
                    log::error!("room {}: stored snapshot unusable, final save skipped: {e}", self.room_id);
                    None
                }
            },
            Err(e) => {
                log::error!("room {}: store unreachable at drain, final save skipped: {e}", self.room_id);
                None
            }
        }
    }
}

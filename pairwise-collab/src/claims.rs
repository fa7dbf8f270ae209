//! Mentor claims on help-request sessions.
//!
//! A post can be claimed once. The first accepted claim wins and the
//! external orchestrator is told exactly once through
//! [`Orchestrator::session_started`]. Later claimers get
//! [`ClaimError::AlreadyClaimed`] naming the holder.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{now_millis, Role, RoomId, SessionStarted, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub room_id: RoomId,
    pub post_id: String,
    pub mentor_id: UserId,
    pub claimed_at: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClaimError {
    #[error("post {post_id} already claimed by {holder}")]
    AlreadyClaimed { post_id: String, holder: UserId },
    #[error("only mentors can claim sessions")]
    NotMentor,
}

impl ClaimError {
    /// Value of the `reason` field in `claim-rejected`.
    pub fn reason(&self) -> &'static str {
        match self {
            ClaimError::AlreadyClaimed { .. } => "already-claimed",
            ClaimError::NotMentor => "not-mentor",
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Orchestrator
// ───────────────────────────────────────────────────────────────────

/// Receiver of escalation signals outside this core.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn session_started(&self, event: SessionStarted);
}

/// Writes escalations to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOrchestrator;

#[async_trait]
impl Orchestrator for LogOrchestrator {
    async fn session_started(&self, event: SessionStarted) {
        log::info!("session started: room={} post={}", event.room_id, event.post_id);
    }
}

/// Forwards escalations into a channel.
#[derive(Debug, Clone)]
pub struct ChannelOrchestrator {
    tx: mpsc::UnboundedSender<SessionStarted>,
}

impl ChannelOrchestrator {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionStarted>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Orchestrator for ChannelOrchestrator {
    async fn session_started(&self, event: SessionStarted) {
        if self.tx.send(event).is_err() {
            log::warn!("orchestrator channel closed, escalation dropped");
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Claim book
// ───────────────────────────────────────────────────────────────────

/// All claims, serialized under one lock.
pub struct ClaimBook {
    claims: Mutex<HashMap<String, Claim>>,
    orchestrator: Arc<dyn Orchestrator>,
}

impl ClaimBook {
    pub fn new(orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            claims: Mutex::new(HashMap::new()),
            orchestrator,
        }
    }

    /// Claim `post_id` for `mentor_id`.
    ///
    /// A repeat claim by the current holder returns the existing claim and
    /// does not signal the orchestrator again.
    pub async fn claim(
        &self,
        room_id: &str,
        post_id: &str,
        mentor_id: &str,
        role: Role,
    ) -> Result<Claim, ClaimError> {
        if role != Role::Mentor {
            return Err(ClaimError::NotMentor);
        }

        let fresh = {
            let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = claims.get(post_id) {
                if existing.mentor_id != mentor_id {
                    return Err(ClaimError::AlreadyClaimed {
                        post_id: post_id.to_string(),
                        holder: existing.mentor_id.clone(),
                    });
                }
                return Ok(existing.clone());
            }
            let claim = Claim {
                room_id: room_id.to_string(),
                post_id: post_id.to_string(),
                mentor_id: mentor_id.to_string(),
                claimed_at: now_millis(),
            };
            claims.insert(post_id.to_string(), claim.clone());
            claim
        };

        log::info!("post {post_id} claimed by {mentor_id} in room {room_id}");
        self.orchestrator
            .session_started(SessionStarted {
                room_id: fresh.room_id.clone(),
                post_id: fresh.post_id.clone(),
            })
            .await;
        Ok(fresh)
    }

    pub fn holder(&self, post_id: &str) -> Option<UserId> {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(post_id)
            .map(|c| c.mentor_id.clone())
    }

    pub fn len(&self) -> usize {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Authenticated connection state shared between the gateway and rooms.

use pairwise_core::ReplicaId;

use crate::protocol::{Role, ServerEvent, SessionId, UserId};
use crate::relay::{Outbox, PushOutcome};

/// One authenticated connection. Rooms hold clones of it as members.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub user_id: UserId,
    pub role: Role,
    /// Replica id stamped on every operation this session issues.
    pub replica: ReplicaId,
    pub outbox: Outbox,
}

impl SessionHandle {
    pub fn new(user_id: impl Into<UserId>, role: Role, outbox_capacity: usize) -> Self {
        Self {
            id: SessionId::new(),
            user_id: user_id.into(),
            role,
            replica: ReplicaId::random(),
            outbox: Outbox::new(outbox_capacity),
        }
    }

    /// Queue an event for this session alone.
    pub fn send(&self, event: ServerEvent) -> PushOutcome {
        self.outbox.push(std::sync::Arc::new(event))
    }

    pub fn ready_event(&self) -> ServerEvent {
        ServerEvent::SessionReady {
            session_id: self.id,
            user_id: self.user_id.clone(),
            role: self.role,
            replica_id: self.replica,
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .field("replica", &self.replica)
            .field("queued", &self.outbox.len())
            .finish()
    }
}

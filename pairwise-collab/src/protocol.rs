//! JSON event protocol spoken over the WebSocket.
//!
//! One event per text frame, tagged by `"type"`, fields in camelCase:
//! ```text
//! {"type":"join-room","roomId":"post-42"}
//! {"type":"edit-op","roomId":"post-42","opId":{"replica":7,"counter":3},
//!  "kind":"insert","anchorId":{"replica":7,"counter":2},
//!  "rightId":{"replica":4,"counter":1},"prevId":{"replica":7,"counter":1},"payload":"hi"}
//! {"type":"resync-required","roomId":"post-42"}
//! ```

use pairwise_core::{DocumentError, DocumentSnapshot, OpId, Operation, ReplicaId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

pub type RoomId = String;
pub type UserId = String;

/// Longest room id accepted from a client.
pub const MAX_ROOM_ID_LEN: usize = 128;

/// Identity of one authenticated connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Mentor,
    Student,
}

impl FromStr for Role {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mentor" => Ok(Role::Mentor),
            "student" => Ok(Role::Student),
            other => Err(ProtocolError::UnknownRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Mentor => f.write_str("mentor"),
            Role::Student => f.write_str("student"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditKind {
    Insert,
    Delete,
}

/// Wire form of an [`Operation`]. For deletes `anchor_id` names the target.
///
/// `right_id` is the block that followed the anchor when the insert was
/// typed, tombstones included; leaving it out places the text after
/// everything anchored at the same spot. `prev_id` is the sender's previous
/// operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditOp {
    pub room_id: RoomId,
    pub op_id: OpId,
    pub kind: EditKind,
    #[serde(default)]
    pub anchor_id: Option<OpId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_id: Option<OpId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_id: Option<OpId>,
    #[serde(default)]
    pub payload: String,
}

impl EditOp {
    pub fn from_operation(room_id: &str, op: &Operation) -> Self {
        let (kind, anchor_id, payload) = match op {
            Operation::Insert { anchor, payload, .. } => (EditKind::Insert, *anchor, payload.clone()),
            Operation::Delete { target, .. } => (EditKind::Delete, Some(*target), String::new()),
        };
        Self {
            room_id: room_id.to_string(),
            op_id: op.id(),
            kind,
            anchor_id,
            right_id: op.right(),
            prev_id: op.prev(),
            payload,
        }
    }

    /// Convert to an engine operation, refusing anything structurally
    /// invalid.
    pub fn into_operation(self) -> Result<Operation, ProtocolError> {
        let op = match self.kind {
            EditKind::Insert => Operation::insert(self.op_id, self.anchor_id, self.payload)
                .with_right(self.right_id),
            EditKind::Delete => {
                let target = self.anchor_id.ok_or(ProtocolError::MissingTarget(self.op_id))?;
                Operation::delete(self.op_id, target)
            }
        }
        .with_prev(self.prev_id);
        op.validate()?;
        Ok(op)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub room_id: RoomId,
    #[serde(default)]
    pub author: UserId,
    pub content: String,
    #[serde(default)]
    pub ts: u64,
}

/// One block of an `editor-snapshot`, in document order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub id: OpId,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

/// One row of a `presence-update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceInfo {
    pub id: SessionId,
    pub last_seen: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<usize>,
}

/// Events a client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    JoinRoom {
        room_id: RoomId,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    EditOp(EditOp),
    ChatMessage(ChatMessage),
    Cursor {
        room_id: RoomId,
        #[serde(default)]
        cursor: Option<usize>,
    },
    SyncRequest {
        room_id: RoomId,
    },
    ClaimSession {
        room_id: RoomId,
        post_id: String,
    },
    Heartbeat,
}

impl ClientEvent {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::JoinRoom { room_id }
            | Self::LeaveRoom { room_id }
            | Self::Cursor { room_id, .. }
            | Self::SyncRequest { room_id }
            | Self::ClaimSession { room_id, .. } => Some(room_id),
            Self::EditOp(edit) => Some(&edit.room_id),
            Self::ChatMessage(msg) => Some(&msg.room_id),
            Self::Heartbeat => None,
        }
    }
}

/// Events the core sends to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    SessionReady {
        session_id: SessionId,
        user_id: UserId,
        role: Role,
        replica_id: ReplicaId,
    },
    EditorSnapshot {
        room_id: RoomId,
        text: String,
        applied_ids: Vec<OpId>,
        blocks: Vec<BlockRef>,
        clock: u64,
    },
    EditOp(EditOp),
    ChatMessage(ChatMessage),
    PresenceUpdate {
        room_id: RoomId,
        sessions: Vec<PresenceInfo>,
    },
    ResyncRequired {
        room_id: RoomId,
    },
    SessionClaimed {
        room_id: RoomId,
        post_id: String,
        mentor_id: UserId,
    },
    ClaimRejected {
        room_id: RoomId,
        post_id: String,
        reason: String,
        holder: UserId,
    },
}

impl ServerEvent {
    pub fn snapshot(room_id: &str, snapshot: &DocumentSnapshot) -> Self {
        Self::EditorSnapshot {
            room_id: room_id.to_string(),
            text: snapshot.text.clone(),
            applied_ids: snapshot.applied.iter().copied().collect(),
            blocks: snapshot
                .blocks
                .iter()
                .map(|b| BlockRef {
                    id: b.id,
                    deleted: b.deleted,
                })
                .collect(),
            clock: snapshot.clock,
        }
    }

    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::SessionReady { .. } => None,
            Self::EditorSnapshot { room_id, .. }
            | Self::PresenceUpdate { room_id, .. }
            | Self::ResyncRequired { room_id }
            | Self::SessionClaimed { room_id, .. }
            | Self::ClaimRejected { room_id, .. } => Some(room_id),
            Self::EditOp(edit) => Some(&edit.room_id),
            Self::ChatMessage(msg) => Some(&msg.room_id),
        }
    }

    /// Editor changes are never echoed to the session that made them.
    pub fn echoes_to_sender(&self) -> bool {
        !matches!(self, Self::EditOp(_))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Escalation signal for the external orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "session-started", rename_all = "camelCase")]
pub struct SessionStarted {
    pub room_id: RoomId,
    pub post_id: String,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed event: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid room id {0:?}")]
    InvalidRoomId(String),
    #[error("delete {0} names no target")]
    MissingTarget(OpId),
    #[error("malformed operation: {0}")]
    MalformedOperation(#[from] DocumentError),
    #[error("unknown role {0:?}")]
    UnknownRole(String),
}

pub fn validate_room_id(room_id: &str) -> Result<(), ProtocolError> {
    if room_id.is_empty()
        || room_id.len() > MAX_ROOM_ID_LEN
        || room_id.chars().any(char::is_control)
    {
        return Err(ProtocolError::InvalidRoomId(room_id.to_string()));
    }
    Ok(())
}

/// Wall-clock milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

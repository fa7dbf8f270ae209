//! # pairwise-collab: real-time sync core for pair-programming rooms
//!
//! Hosts shared editor rooms over WebSocket. Each room holds one
//! authoritative [`pairwise_core::Document`], fans every accepted edit out in
//! a single per-room order and keeps the document in a [`DocumentStore`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket / JSON   ┌──────────────┐
//! │ SyncClient  │ ◄──────────────────► │   Gateway    │  origin → auth → session
//! │ (per user)  │                      └──────┬───────┘
//! └─────────────┘                             │
//!                                     ┌───────┴───────┐
//!                                     │ RoomRegistry  │  Empty → Loading → Active
//!                                     └───────┬───────┘      → Draining → …
//!                                             │ one actor per room
//!                      ┌──────────────────────┼──────────────────────┐
//!                      ▼                      ▼                      ▼
//!               ┌────────────┐        ┌──────────────┐       ┌──────────────┐
//!               │  Document  │        │    Relay     │       │  Reconciler  │
//!               │   (CRDT)   │        │ + Presence   │       │ debounce/retry│
//!               └────────────┘        └──────────────┘       └──────┬───────┘
//!                                                                    ▼
//!                                                            DocumentStore
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON client/server events
//! - [`auth`]: credential verification
//! - [`session`]: per-connection handle and outbox
//! - [`relay`]: bounded outboxes and ordered fan-out
//! - [`presence`]: per-room liveness and cursors
//! - [`room`]: the room actor
//! - [`registry`]: room lifecycle and lookup
//! - [`reconciler`]: debounced, retried persistence
//! - [`storage`]: snapshot codec and stores
//! - [`claims`]: mentor session claims
//! - [`gateway`]: WebSocket admission and event routing
//! - [`server`]: listener and configuration
//! - [`client`]: WebSocket client

pub mod auth;
pub mod claims;
pub mod client;
pub mod gateway;
pub mod presence;
pub mod protocol;
pub mod reconciler;
pub mod registry;
pub mod relay;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

pub use auth::{AuthError, Authenticator, Credentials, Identity, StaticTokens};
pub use claims::{Claim, ClaimBook, ClaimError, LogOrchestrator, Orchestrator};
pub use client::{ClientError, ClientOptions, ConnectionState, SyncClient, SyncEvent};
pub use gateway::{Gateway, GatewayConfig, GatewayError, GatewayStats};
pub use presence::PresenceTracker;
pub use protocol::{
    BlockRef, ChatMessage, ClientEvent, EditOp, PresenceInfo, ProtocolError, Role, RoomId,
    ServerEvent, SessionId, SessionStarted,
};
pub use reconciler::{FlushOutcome, RetryPolicy};
pub use registry::{RegistryError, RoomRegistry};
pub use relay::{Outbox, PushOutcome, Relay, RelayStats};
pub use room::{JoinAck, RoomConfig, RoomState};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::SessionHandle;
pub use storage::{DocumentStore, MemoryStore, StoreError, StoredSnapshot};

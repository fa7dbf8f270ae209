//! # pairwise-core: Document State Engine
//!
//! A sequence CRDT over characters. Every character is a block with a
//! globally unique id `(replica, counter)`, a left anchor and a tombstone
//! flag. Replicas that have seen the same set of operations render the same
//! text, whatever order those operations arrived in.
//!
//! ```text
//!   edit-op ──► Operation::validate ──► Document::apply
//!                                         │
//!                 ┌───────────────────────┼────────────────────┐
//!                 ▼                       ▼                    ▼
//!            Duplicate              Buffered              Applied(ops)
//!         (id already seen)   (dependency missing)      (op + released ops)
//! ```
//!
//! ## Modules
//!
//! - [`id`]: replica and operation identifiers
//! - [`op`]: insert/delete operations and their validation
//! - [`document`]: the engine: integration, buffering, snapshots
//! - [`error`]: [`DocumentError`]
//!
//! ## Ordering rule
//!
//! Counters are Lamport clocks. Each inserted block records the neighbours
//! it was typed between: its anchor on the left and the block that followed
//! the anchor on the right. A block is never placed outside that gap.
//! Concurrent blocks competing for the same gap are ordered by ascending
//! replica id, so they land in the same place on every replica.
//!
//! Operations from one replica also carry the id of that replica's previous
//! operation and take effect only after it, even when they touch unrelated
//! parts of the text.

pub mod document;
pub mod error;
pub mod id;
pub mod op;

pub use document::{ApplyOutcome, Block, Document, DocumentSnapshot, PendingLimits};
pub use error::DocumentError;
pub use id::{OpId, ReplicaId};
pub use op::Operation;

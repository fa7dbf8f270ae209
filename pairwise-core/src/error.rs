use thiserror::Error;

use crate::id::OpId;

/// Reasons an operation or snapshot is refused by the engine.
///
/// None of these leave the document modified.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("operation {0} has a zero counter")]
    ZeroCounter(OpId),
    #[error("insert {0} carries an empty payload")]
    EmptyPayload(OpId),
    #[error("operation {id} references {reference} which is not causally earlier")]
    CausalityViolation { id: OpId, reference: OpId },
    #[error("operation {id} follows {prev}, which is not an earlier operation of the same replica")]
    BrokenChain { id: OpId, prev: OpId },
    #[error("insert {id} overflows the counter space")]
    CounterOverflow { id: OpId },
    #[error("block id {0} is already taken")]
    IdConflict(OpId),
    #[error("block {block} references missing anchor {anchor}")]
    MissingAnchor { block: OpId, anchor: OpId },
    #[error("operation {id} cannot be buffered: {limit} operations already wait")]
    BufferFull { id: OpId, limit: usize },
}

use serde::{Deserialize, Serialize};

use crate::error::DocumentError;
use crate::id::{OpId, ReplicaId};

/// An immutable edit against a [`Document`](crate::Document).
///
/// An insert of `n` characters occupies the ids `id ..= id + (n - 1)` and
/// chains each character onto the one before it. `anchor` is the block it
/// was typed after and `right` the block that sat immediately after that
/// anchor at the time, tombstones included. `prev` names the issuing
/// replica's previous operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert {
        id: OpId,
        anchor: Option<OpId>,
        right: Option<OpId>,
        prev: Option<OpId>,
        payload: String,
    },
    Delete {
        id: OpId,
        target: OpId,
        prev: Option<OpId>,
    },
}

impl Operation {
    pub fn insert(id: OpId, anchor: Option<OpId>, payload: impl Into<String>) -> Self {
        Self::Insert {
            id,
            anchor,
            right: None,
            prev: None,
            payload: payload.into(),
        }
    }

    pub fn delete(id: OpId, target: OpId) -> Self {
        Self::Delete {
            id,
            target,
            prev: None,
        }
    }

    /// Set the right neighbour an insert was made against. Ignored for
    /// deletes.
    pub fn with_right(mut self, neighbour: Option<OpId>) -> Self {
        if let Self::Insert { right, .. } = &mut self {
            *right = neighbour;
        }
        self
    }

    /// Chain onto the issuing replica's previous operation.
    pub fn with_prev(mut self, previous: Option<OpId>) -> Self {
        match &mut self {
            Self::Insert { prev, .. } | Self::Delete { prev, .. } => *prev = previous,
        }
        self
    }

    pub fn id(&self) -> OpId {
        match self {
            Self::Insert { id, .. } | Self::Delete { id, .. } => *id,
        }
    }

    pub fn origin(&self) -> ReplicaId {
        self.id().replica
    }

    pub fn prev(&self) -> Option<OpId> {
        match self {
            Self::Insert { prev, .. } | Self::Delete { prev, .. } => *prev,
        }
    }

    pub fn right(&self) -> Option<OpId> {
        match self {
            Self::Insert { right, .. } => *right,
            Self::Delete { .. } => None,
        }
    }

    /// Blocks this operation cannot be applied without.
    pub fn references(&self) -> impl Iterator<Item = OpId> {
        let (first, second) = match self {
            Self::Insert { anchor, right, .. } => (*anchor, *right),
            Self::Delete { target, .. } => (Some(*target), None),
        };
        first.into_iter().chain(second)
    }

    /// Ids that exist once this operation is applied: every character of an
    /// insert, or the delete itself.
    pub fn produced_ids(&self) -> impl Iterator<Item = OpId> {
        let id = self.id();
        let span = match self {
            Self::Insert { payload, .. } => payload.chars().count() as u64,
            Self::Delete { .. } => 1,
        };
        (0..span).filter_map(move |k| id.offset(k))
    }

    /// Highest counter this operation consumes.
    pub fn last_counter(&self) -> u64 {
        match self {
            Self::Insert { id, payload, .. } => {
                let span = payload.chars().count().saturating_sub(1) as u64;
                id.counter.saturating_add(span)
            }
            Self::Delete { id, .. } => id.counter,
        }
    }

    /// Structural checks that need no document state.
    pub fn validate(&self) -> Result<(), DocumentError> {
        let id = self.id();
        if id.counter == 0 {
            return Err(DocumentError::ZeroCounter(id));
        }
        if let Self::Insert { payload, .. } = self {
            if payload.is_empty() {
                return Err(DocumentError::EmptyPayload(id));
            }
            let span = payload.chars().count() as u64 - 1;
            if id.offset(span).is_none() {
                return Err(DocumentError::CounterOverflow { id });
            }
        }
        // The issuer saw the referenced block, so its Lamport clock had
        // already moved past that block's counter.
        for reference in self.references() {
            if reference.counter >= id.counter {
                return Err(DocumentError::CausalityViolation { id, reference });
            }
        }
        if let Some(prev) = self.prev() {
            if prev.replica != id.replica || prev.counter >= id.counter {
                return Err(DocumentError::BrokenChain { id, prev });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(replica: u64, counter: u64) -> OpId {
        OpId::new(ReplicaId(replica), counter)
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        assert!(Operation::insert(id(1, 1), None, "abc").validate().is_ok());
        assert!(Operation::insert(id(1, 5), Some(id(2, 4)), "x").validate().is_ok());
        assert!(Operation::delete(id(2, 9), id(1, 3)).validate().is_ok());
        let chained = Operation::insert(id(1, 6), Some(id(2, 4)), "y")
            .with_right(Some(id(3, 2)))
            .with_prev(Some(id(1, 5)));
        assert!(chained.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_counter() {
        let err = Operation::insert(id(1, 0), None, "a").validate().unwrap_err();
        assert_eq!(err, DocumentError::ZeroCounter(id(1, 0)));
    }

    #[test]
    fn test_validate_rejects_empty_insert() {
        let err = Operation::insert(id(1, 1), None, "").validate().unwrap_err();
        assert!(matches!(err, DocumentError::EmptyPayload(_)));
    }

    #[test]
    fn test_validate_rejects_reference_from_the_future() {
        let err = Operation::delete(id(1, 3), id(2, 3)).validate().unwrap_err();
        assert!(matches!(err, DocumentError::CausalityViolation { .. }));
        let err = Operation::insert(id(1, 2), Some(id(1, 7)), "a")
            .validate()
            .unwrap_err();
        assert!(matches!(err, DocumentError::CausalityViolation { .. }));
        let err = Operation::insert(id(1, 2), None, "a")
            .with_right(Some(id(4, 2)))
            .validate()
            .unwrap_err();
        assert!(matches!(err, DocumentError::CausalityViolation { .. }));
    }

    #[test]
    fn test_validate_rejects_foreign_or_later_prev() {
        let foreign = Operation::delete(id(1, 5), id(2, 1)).with_prev(Some(id(2, 4)));
        assert_eq!(
            foreign.validate(),
            Err(DocumentError::BrokenChain {
                id: id(1, 5),
                prev: id(2, 4)
            })
        );
        let later = Operation::insert(id(1, 5), None, "a").with_prev(Some(id(1, 5)));
        assert!(matches!(later.validate(), Err(DocumentError::BrokenChain { .. })));
    }

    #[test]
    fn test_validate_rejects_counter_overflow() {
        let op = Operation::insert(id(1, u64::MAX), None, "ab");
        assert!(matches!(
            op.validate(),
            Err(DocumentError::CounterOverflow { .. })
        ));
    }

    #[test]
    fn test_last_counter_spans_run() {
        assert_eq!(Operation::insert(id(1, 10), None, "héllo").last_counter(), 14);
        assert_eq!(Operation::delete(id(1, 3), id(1, 1)).last_counter(), 3);
    }

    #[test]
    fn test_produced_ids_and_references() {
        let insert = Operation::insert(id(1, 10), Some(id(2, 3)), "abc").with_right(Some(id(3, 1)));
        let produced: Vec<_> = insert.produced_ids().collect();
        assert_eq!(produced, vec![id(1, 10), id(1, 11), id(1, 12)]);
        let refs: Vec<_> = insert.references().collect();
        assert_eq!(refs, vec![id(2, 3), id(3, 1)]);

        let delete = Operation::delete(id(1, 4), id(2, 2)).with_right(Some(id(9, 1)));
        assert_eq!(delete.right(), None);
        assert_eq!(delete.produced_ids().collect::<Vec<_>>(), vec![id(1, 4)]);
    }
}

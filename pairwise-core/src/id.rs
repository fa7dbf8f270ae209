use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Largest replica id that survives a round trip through a JSON number.
const MAX_SAFE_REPLICA: u64 = (1 << 53) - 1;

/// Identity of one editing replica (one connected session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    /// Pick a fresh random replica id in the 53-bit range.
    pub fn random() -> Self {
        let (hi, lo) = Uuid::new_v4().as_u64_pair();
        Self(((hi ^ lo) & MAX_SAFE_REPLICA).max(1))
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Globally unique id of a block or operation: `(replica, counter)`.
///
/// Derived `Ord` sorts by replica, then counter. Applied-id sets rely on
/// that to list one replica's operations contiguously and in issue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub replica: ReplicaId,
    pub counter: u64,
}

impl OpId {
    pub const fn new(replica: ReplicaId, counter: u64) -> Self {
        Self { replica, counter }
    }

    /// The id `n` steps further along the same replica's counter.
    pub fn offset(self, n: u64) -> Option<Self> {
        self.counter.checked_add(n).map(|counter| Self { counter, ..self })
    }

    /// Bounds of every id `replica` can issue, for range queries over
    /// ordered id sets.
    pub(crate) fn span_of(replica: ReplicaId) -> std::ops::RangeInclusive<Self> {
        Self::new(replica, 0)..=Self::new(replica, u64::MAX)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.replica, self.counter)
    }
}

//! The per-room replica.
//!
//! Blocks are kept in a flat vector in document order. Tombstoned blocks
//! stay in place forever so that late operations anchored on them still
//! find their position.
//!
//! Every block remembers its left origin (`anchor`) and right origin
//! (`right`): the two neighbours it was typed between. Integration scans
//! only the blocks between those two origins, so a block never jumps over
//! text its author could see. Concurrent blocks that share both origins are
//! ordered by ascending replica id.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::DocumentError;
use crate::id::{OpId, ReplicaId};
use crate::op::Operation;

/// One character of the shared text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: OpId,
    pub anchor: Option<OpId>,
    pub right: Option<OpId>,
    pub content: char,
    pub deleted: bool,
}

/// Immutable copy of a document, handed to joining sessions and to the
/// durable store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub text: String,
    pub applied: BTreeSet<OpId>,
    pub blocks: Vec<Block>,
    /// Buffered operations, sorted by id.
    pub pending: Vec<Operation>,
    pub clock: u64,
}

impl DocumentSnapshot {
    /// Ids of the visible blocks, aligned with the characters of `text`.
    pub fn visible_ids(&self) -> Vec<OpId> {
        self.blocks
            .iter()
            .filter(|b| !b.deleted)
            .map(|b| b.id)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.pending.is_empty()
    }
}

/// Result of [`Document::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The operation took effect, followed by any buffered operations it
    /// unblocked, in the order they were integrated.
    Applied(Vec<Operation>),
    /// The id was applied (or buffered) before; nothing changed.
    Duplicate,
    /// The operation waits for a block it references or for the previous
    /// operation of its replica.
    Buffered,
}

/// Caps on operations held back for missing dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingLimits {
    /// Across the whole document.
    pub total: usize,
    /// For any single issuing replica.
    pub per_origin: usize,
}

impl Default for PendingLimits {
    fn default() -> Self {
        Self {
            total: 4096,
            per_origin: 1024,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Document {
    blocks: Vec<Block>,
    known: HashSet<OpId>,
    applied: BTreeSet<OpId>,
    /// Buffered operations keyed by the id each one waits on.
    waiting: HashMap<OpId, Vec<Operation>>,
    buffered: HashSet<OpId>,
    buffered_by_origin: HashMap<ReplicaId, usize>,
    limits: PendingLimits,
    clock: u64,
    visible: usize,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: PendingLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// Rebuild a replica from a stored snapshot.
    pub fn from_snapshot(snapshot: &DocumentSnapshot) -> Result<Self, DocumentError> {
        let mut doc = Self::new();
        doc.merge_snapshot(snapshot)?;
        Ok(doc)
    }

    pub fn limits(&self) -> PendingLimits {
        self.limits
    }

    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter(|b| !b.deleted)
            .map(|b| b.content)
            .collect()
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }

    /// Total blocks held, tombstones included.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn pending_count(&self) -> usize {
        self.buffered.len()
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn applied_ids(&self) -> &BTreeSet<OpId> {
        &self.applied
    }

    pub fn has_applied(&self, id: &OpId) -> bool {
        self.applied.contains(id)
    }

    /// Latest operation applied from `replica`.
    pub fn last_applied(&self, replica: ReplicaId) -> Option<OpId> {
        self.applied.range(OpId::span_of(replica)).next_back().copied()
    }

    /// Id of the visible block at `index`.
    pub fn visible_id(&self, index: usize) -> Option<OpId> {
        self.blocks
            .iter()
            .filter(|b| !b.deleted)
            .nth(index)
            .map(|b| b.id)
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        let mut pending: Vec<Operation> = self.waiting.values().flatten().cloned().collect();
        pending.sort_by_key(Operation::id);
        DocumentSnapshot {
            text: self.text(),
            applied: self.applied.clone(),
            blocks: self.blocks.clone(),
            pending,
            clock: self.clock,
        }
    }

    /// Apply one operation.
    ///
    /// Malformed operations, and operations that would have to wait while
    /// the buffer is full, are refused with the document untouched.
    pub fn apply(&mut self, op: Operation) -> Result<ApplyOutcome, DocumentError> {
        op.validate()?;
        let id = op.id();
        if self.applied.contains(&id) || self.buffered.contains(&id) {
            return Ok(ApplyOutcome::Duplicate);
        }

        if let Some(missing) = self.missing_dependency(&op) {
            self.check_capacity(&op)?;
            log::debug!("buffering {id}, waiting on {missing}");
            self.clock = self.clock.max(op.last_counter());
            self.hold(missing, op);
            return Ok(ApplyOutcome::Buffered);
        }

        self.integrate(&op)?;
        let mut applied = vec![op];
        self.release(&mut applied);
        Ok(ApplyOutcome::Applied(applied))
    }

    /// Fold another replica's state into this one.
    ///
    /// Returns the number of blocks that were new to this replica. The
    /// snapshot is checked up front, so a corrupt one changes nothing.
    pub fn merge_snapshot(&mut self, snapshot: &DocumentSnapshot) -> Result<usize, DocumentError> {
        let incoming: HashSet<OpId> = snapshot.blocks.iter().map(|b| b.id).collect();
        for block in &snapshot.blocks {
            for reference in block.anchor.into_iter().chain(block.right) {
                if !self.known.contains(&reference) && !incoming.contains(&reference) {
                    return Err(DocumentError::MissingAnchor {
                        block: block.id,
                        anchor: reference,
                    });
                }
                if reference.counter >= block.id.counter {
                    return Err(DocumentError::CausalityViolation {
                        id: block.id,
                        reference,
                    });
                }
            }
        }

        // Every origin has a lower counter than the block that names it, so
        // counter order integrates origins first.
        let mut fresh: Vec<&Block> = snapshot
            .blocks
            .iter()
            .filter(|b| !self.known.contains(&b.id))
            .collect();
        fresh.sort_by_key(|b| (b.id.counter, b.id.replica));
        let added = fresh.len();
        for block in fresh {
            self.integrate_block(Block {
                deleted: false,
                ..block.clone()
            })?;
        }
        for block in snapshot.blocks.iter().filter(|b| b.deleted) {
            self.tombstone(block.id);
        }
        self.applied.extend(snapshot.applied.iter().copied());
        self.clock = self.clock.max(snapshot.clock);

        let mut held: Vec<Operation> = self.waiting.drain().flat_map(|(_, ops)| ops).collect();
        self.buffered.clear();
        self.buffered_by_origin.clear();
        held.extend(snapshot.pending.iter().cloned());
        held.sort_by_key(Operation::id);
        held.dedup_by_key(|op| op.id());
        self.readmit(held);
        Ok(added)
    }

    /// Insert `text` so that it appears at visible `index`, as `replica`.
    pub fn insert_at(
        &mut self,
        replica: ReplicaId,
        index: usize,
        text: &str,
    ) -> Result<Operation, DocumentError> {
        let index = index.min(self.visible);
        let anchor = index.checked_sub(1).and_then(|i| self.visible_id(i));
        let right = self.successor(anchor);
        let op = Operation::insert(self.next_id(replica)?, anchor, text)
            .with_right(right)
            .with_prev(self.last_applied(replica));
        self.apply(op.clone())?;
        Ok(op)
    }

    /// Delete the visible character at `index`, as `replica`.
    pub fn delete_at(
        &mut self,
        replica: ReplicaId,
        index: usize,
    ) -> Result<Option<Operation>, DocumentError> {
        let Some(target) = self.visible_id(index) else {
            return Ok(None);
        };
        let op = Operation::delete(self.next_id(replica)?, target)
            .with_prev(self.last_applied(replica));
        self.apply(op.clone())?;
        Ok(Some(op))
    }

    fn next_id(&self, replica: ReplicaId) -> Result<OpId, DocumentError> {
        let counter = self
            .clock
            .checked_add(1)
            .ok_or(DocumentError::CounterOverflow {
                id: OpId::new(replica, self.clock),
            })?;
        Ok(OpId::new(replica, counter))
    }

    /// The block directly after `anchor`, tombstones included.
    fn successor(&self, anchor: Option<OpId>) -> Option<OpId> {
        let next = match anchor {
            None => 0,
            Some(anchor) => self.position(anchor)? + 1,
        };
        self.blocks.get(next).map(|b| b.id)
    }

    fn missing_dependency(&self, op: &Operation) -> Option<OpId> {
        if let Some(prev) = op.prev() {
            if !self.applied.contains(&prev) {
                return Some(prev);
            }
        }
        op.references().find(|r| !self.known.contains(r))
    }

    fn check_capacity(&self, op: &Operation) -> Result<(), DocumentError> {
        let id = op.id();
        if self.buffered.len() >= self.limits.total {
            return Err(DocumentError::BufferFull {
                id,
                limit: self.limits.total,
            });
        }
        let from_origin = self.buffered_by_origin.get(&id.replica).copied().unwrap_or(0);
        if from_origin >= self.limits.per_origin {
            return Err(DocumentError::BufferFull {
                id,
                limit: self.limits.per_origin,
            });
        }
        Ok(())
    }

    fn hold(&mut self, missing: OpId, op: Operation) {
        self.buffered.insert(op.id());
        *self.buffered_by_origin.entry(op.origin()).or_default() += 1;
        self.waiting.entry(missing).or_default().push(op);
    }

    fn unhold(&mut self, op: &Operation) {
        self.buffered.remove(&op.id());
        let origin = op.origin();
        if let Some(count) = self.buffered_by_origin.get_mut(&origin) {
            *count -= 1;
            if *count == 0 {
                self.buffered_by_origin.remove(&origin);
            }
        }
    }

    /// Put previously buffered operations back through the buffer, applying
    /// whatever has become ready.
    fn readmit(&mut self, ops: Vec<Operation>) {
        for op in ops {
            let id = op.id();
            if self.applied.contains(&id) || self.buffered.contains(&id) {
                continue;
            }
            match self.missing_dependency(&op) {
                Some(missing) => match self.check_capacity(&op) {
                    Ok(()) => self.hold(missing, op),
                    Err(err) => log::warn!("dropping buffered operation {id}: {err}"),
                },
                None => match self.integrate(&op) {
                    Ok(()) => {
                        let mut applied = vec![op];
                        self.release(&mut applied);
                    }
                    Err(err) => log::warn!("dropping buffered operation {id}: {err}"),
                },
            }
        }
    }

    /// Apply every buffered operation unblocked by the ids `applied`
    /// produced, appending each one to `applied` as it takes effect.
    fn release(&mut self, applied: &mut Vec<Operation>) {
        let mut next = 0;
        while next < applied.len() {
            let arrived: Vec<OpId> = applied[next].produced_ids().collect();
            next += 1;
            for id in arrived {
                let Some(waiters) = self.waiting.remove(&id) else {
                    continue;
                };
                for op in waiters {
                    self.unhold(&op);
                    if let Some(missing) = self.missing_dependency(&op) {
                        self.hold(missing, op);
                        continue;
                    }
                    match self.integrate(&op) {
                        Ok(()) => applied.push(op),
                        Err(err) => log::warn!("dropping buffered operation {}: {err}", op.id()),
                    }
                }
            }
        }
    }

    fn integrate(&mut self, op: &Operation) -> Result<(), DocumentError> {
        match op {
            Operation::Insert {
                id,
                anchor,
                right,
                payload,
                ..
            } => {
                let ids = (0..payload.chars().count() as u64)
                    .map(|k| id.offset(k).ok_or(DocumentError::CounterOverflow { id: *id }))
                    .collect::<Result<Vec<_>, _>>()?;
                if let Some(taken) = ids
                    .iter()
                    .find(|bid| self.known.contains(*bid) || self.applied.contains(*bid))
                {
                    return Err(DocumentError::IdConflict(*taken));
                }

                let mut left = *anchor;
                for (bid, content) in ids.into_iter().zip(payload.chars()) {
                    self.integrate_block(Block {
                        id: bid,
                        anchor: left,
                        right: *right,
                        content,
                        deleted: false,
                    })?;
                    left = Some(bid);
                }
            }
            Operation::Delete { id, target, .. } => {
                if self.known.contains(id) {
                    return Err(DocumentError::IdConflict(*id));
                }
                self.tombstone(*target);
            }
        }
        self.applied.insert(op.id());
        self.clock = self.clock.max(op.last_counter());
        Ok(())
    }

    /// Place a single block between its two origins.
    ///
    /// Scanning right from the left origin, the block moves past a
    /// conflicting block that shares its left origin and has a lower
    /// replica id, and past anything anchored inside the stretch already
    /// skipped. It stops at the first block anchored further left, at an
    /// equal-origin sibling it outranks, or at its right origin.
    fn integrate_block(&mut self, block: Block) -> Result<(), DocumentError> {
        let start = match block.anchor {
            None => 0,
            Some(anchor) => {
                self.position(anchor)
                    .ok_or(DocumentError::MissingAnchor {
                        block: block.id,
                        anchor,
                    })?
                    + 1
            }
        };
        if let Some(right) = block.right {
            if !self.known.contains(&right) {
                return Err(DocumentError::MissingAnchor {
                    block: block.id,
                    anchor: right,
                });
            }
        }

        let mut pos = start;
        let mut before_origin: HashSet<OpId> = HashSet::new();
        let mut conflicting: HashSet<OpId> = HashSet::new();
        let mut scan = start;
        while let Some(other) = self.blocks.get(scan) {
            if Some(other.id) == block.right {
                break;
            }
            before_origin.insert(other.id);
            conflicting.insert(other.id);
            if other.anchor == block.anchor {
                if other.id.replica < block.id.replica {
                    pos = scan + 1;
                    conflicting.clear();
                } else if other.right == block.right {
                    break;
                }
            } else if let Some(other_anchor) = other.anchor.filter(|a| before_origin.contains(a)) {
                if !conflicting.contains(&other_anchor) {
                    pos = scan + 1;
                    conflicting.clear();
                }
            } else {
                break;
            }
            scan += 1;
        }

        if !block.deleted {
            self.visible += 1;
        }
        self.clock = self.clock.max(block.id.counter);
        self.known.insert(block.id);
        self.blocks.insert(pos, block);
        Ok(())
    }

    fn tombstone(&mut self, target: OpId) {
        if let Some(pos) = self.position(target) {
            let block = &mut self.blocks[pos];
            if !block.deleted {
                block.deleted = true;
                self.visible -= 1;
            }
        }
    }

    fn position(&self, id: OpId) -> Option<usize> {
        if !self.known.contains(&id) {
            return None;
        }
        self.blocks.iter().position(|b| b.id == id)
    }
}

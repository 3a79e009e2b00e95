//! Identity index with reversal pairing
//!
//! # Architecture
//!
//! ```text
//! by_id:   a7c0 → Slot(4)      a7c1 → Slot(5)     (inserted together)
//! by_slot: Slot(4) → a7c0      Slot(5) → a7c1
//! ```
//!
//! Every insert registers an identity and its reversal at the two slots of
//! one pair, so either direction resolves without extra I/O. All checks run
//! before either half is inserted.

use super::slot::Slot;
use crate::error::{Error, Result};
use crate::snapshot::SnapshotId;
use std::collections::HashMap;
use tracing::error;

#[derive(Debug, Default)]
pub struct ReversalIndex {
    by_id: HashMap<SnapshotId, Slot>,
    by_slot: HashMap<Slot, SnapshotId>,
}

impl ReversalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, id: SnapshotId) -> Option<Slot> {
        self.by_id.get(&id).copied()
    }

    /// Identity registered at `slot`
    pub fn identity_at(&self, slot: Slot) -> Option<SnapshotId> {
        self.by_slot.get(&slot).copied()
    }

    pub fn contains(&self, id: SnapshotId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Check that `id → slot` (and its reversal) can be inserted
    ///
    /// Returns `Ok(true)` if the mapping is new, `Ok(false)` if it already
    /// exists exactly.
    pub fn check_insert(&self, id: SnapshotId, slot: Slot) -> Result<bool> {
        let pairs = [(id, slot), (id.reversed(), slot.sibling())];

        let mut present = 0;
        for (id, slot) in pairs {
            let by_id = self.by_id.get(&id);
            let by_slot = self.by_slot.get(&slot);
            match (by_id, by_slot) {
                (None, None) => {}
                (Some(s), Some(i)) if *s == slot && *i == id => present += 1,
                _ => {
                    let msg = format!(
                        "Identity {} cannot map to {}: identity is at {:?}, slot holds {:?}",
                        id,
                        slot,
                        by_id,
                        by_slot.map(|i| i.to_string())
                    );
                    error!("{}", msg);
                    return Err(Error::ConsistencyViolation(msg));
                }
            }
        }

        match present {
            0 => Ok(true),
            2 => Ok(false),
            _ => {
                let msg = format!("Index holds only one half of the pair for {} at {}", id, slot);
                error!("{}", msg);
                Err(Error::ConsistencyViolation(msg))
            }
        }
    }

    /// Insert `id → slot` and `reverse(id) → slot ^ 1`
    pub fn insert(&mut self, id: SnapshotId, slot: Slot) -> Result<()> {
        if self.check_insert(id, slot)? {
            self.by_id.insert(id, slot);
            self.by_id.insert(id.reversed(), slot.sibling());
            self.by_slot.insert(slot, id);
            self.by_slot.insert(slot.sibling(), id.reversed());
        }
        Ok(())
    }

    /// Remove an identity and its reversal; returns the identity's slot
    pub fn remove(&mut self, id: SnapshotId) -> Option<Slot> {
        let slot = self.by_id.remove(&id)?;
        self.by_id.remove(&id.reversed());
        self.by_slot.remove(&slot);
        self.by_slot.remove(&slot.sibling());
        Some(slot)
    }

    /// Number of identities, counting both directions
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn slots(&self) -> impl Iterator<Item = Slot> + '_ {
        self.by_slot.keys().copied()
    }
}

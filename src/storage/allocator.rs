//! Paired slot allocator
//!
//! # Architecture
//!
//! ```text
//! SlotAllocator
//!   ├─→ high water: 8          (slots 0..8 have been handed out)
//!   ├─→ claimed:   {4, 6}      (reserved or allocated, not yet written)
//!   └─→ released:  {2}         (rolled back, reused first)
//! ```
//!
//! Only even slots are ever handed out; the odd partner comes with it.
//! Released slots are reused smallest first, then the allocator continues
//! from the high-water mark. Reserving a pair beyond the high-water mark
//! moves the mark past it and releases the pairs it jumped over.

use super::slot::{Slot, SlotState};
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Default)]
pub struct SlotAllocator {
    /// Next slot past every pair handed out so far
    high_water: u64,
    /// Pairs handed out or reserved but not written yet
    claimed: BTreeSet<u64>,
    /// Pairs returned by `release`
    released: BTreeSet<u64>,
}

impl SlotAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild allocator state for a store that already holds `rows` rows
    ///
    /// `reserved` pairs come back claimed, `free` pairs (rows that were
    /// never written) come back released.
    pub fn restore(
        rows: u64,
        reserved: impl IntoIterator<Item = Slot>,
        free: impl IntoIterator<Item = Slot>,
    ) -> Self {
        let mut allocator = Self {
            high_water: rows * 2,
            ..Self::default()
        };
        for slot in reserved {
            let slot = slot.forward().value();
            allocator.claimed.insert(slot);
            allocator.high_water = allocator.high_water.max(slot + 2);
        }
        for slot in free {
            let slot = slot.forward().value();
            if slot < allocator.high_water && !allocator.claimed.contains(&slot) {
                allocator.released.insert(slot);
            }
        }
        allocator
    }

    /// Claim the smallest available pair and return its even slot
    pub fn allocate(&mut self) -> Slot {
        if let Some(slot) = self.released.pop_first() {
            self.claimed.insert(slot);
            debug!(slot, "Reused released slot");
            return Slot::new(slot);
        }

        let slot = self.high_water;
        self.high_water = slot + 2;
        self.claimed.insert(slot);
        debug!(slot, high_water = self.high_water, "Allocated slot");
        Slot::new(slot)
    }

    /// Pre-claim a specific pair
    pub fn reserve(&mut self, slot: Slot) -> Result<()> {
        let forward = slot.forward().value();
        match self.state(slot) {
            SlotState::Unallocated => {
                if forward >= self.high_water {
                    // Pairs jumped over stay available
                    self.released.extend((self.high_water..forward).step_by(2));
                    self.high_water = forward + 2;
                }
                self.released.remove(&forward);
                self.claimed.insert(forward);
                debug!(slot = forward, "Reserved slot");
                Ok(())
            }
            state => Err(Error::ConsistencyViolation(format!(
                "Cannot reserve {}: pair is already {:?}",
                slot, state
            ))),
        }
    }

    /// Mark a claimed pair as written
    pub fn commit(&mut self, slot: Slot) -> Result<()> {
        let forward = slot.forward().value();
        if !self.claimed.remove(&forward) {
            return Err(Error::ConsistencyViolation(format!(
                "Cannot commit {}: pair is {:?}, not claimed",
                slot,
                self.state(slot)
            )));
        }
        self.high_water = self.high_water.max(forward + 2);
        Ok(())
    }

    /// Return a claimed but unwritten pair to the free list
    pub fn release(&mut self, slot: Slot) -> Result<()> {
        let forward = slot.forward().value();
        if !self.claimed.remove(&forward) {
            return Err(Error::InvalidArgument(format!(
                "Cannot release {}: pair is not claimed",
                slot
            )));
        }
        self.released.insert(forward);
        debug!(slot = forward, "Released slot");
        Ok(())
    }

    pub fn state(&self, slot: Slot) -> SlotState {
        let forward = slot.forward().value();
        if self.claimed.contains(&forward) {
            SlotState::Reserved
        } else if forward >= self.high_water || self.released.contains(&forward) {
            SlotState::Unallocated
        } else {
            SlotState::Written
        }
    }

    /// High-water mark: one past the highest slot handed out
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    pub fn claimed_count(&self) -> usize {
        self.claimed.len()
    }

    pub fn released_count(&self) -> usize {
        self.released.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_paired_and_monotonic() -> Result<()> {
        let mut allocator = SlotAllocator::new();

        let first = allocator.allocate();
        let second = allocator.allocate();
        assert_eq!(first, Slot::new(0));
        assert_eq!(second, Slot::new(2));
        assert_eq!(allocator.high_water(), 4);

        allocator.commit(first)?;
        allocator.commit(second)?;
        assert_eq!(allocator.state(Slot::new(3)), SlotState::Written);
        assert_eq!(allocator.allocate(), Slot::new(4));
        Ok(())
    }

    #[test]
    fn test_reserved_pairs_are_skipped() -> Result<()> {
        let mut allocator = SlotAllocator::new();
        allocator.reserve(Slot::new(1))?; // claims pair (0, 1)
        allocator.reserve(Slot::new(4))?;

        assert_eq!(allocator.state(Slot::new(0)), SlotState::Reserved);
        assert_eq!(allocator.allocate(), Slot::new(2));
        assert_eq!(allocator.allocate(), Slot::new(6));

        // Reserving an occupied pair is refused
        assert!(matches!(
            allocator.reserve(Slot::new(4)),
            Err(Error::ConsistencyViolation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_released_slots_are_reused_first() -> Result<()> {
        let mut allocator = SlotAllocator::new();
        let a = allocator.allocate();
        let b = allocator.allocate();
        allocator.commit(b)?;

        allocator.release(a)?;
        assert_eq!(allocator.state(a), SlotState::Unallocated);
        assert_eq!(allocator.released_count(), 1);

        assert_eq!(allocator.allocate(), a);
        assert_eq!(allocator.allocate(), Slot::new(4));
        Ok(())
    }

    #[test]
    fn test_write_once() -> Result<()> {
        let mut allocator = SlotAllocator::new();
        let slot = allocator.allocate();
        allocator.commit(slot)?;
        assert!(matches!(
            allocator.commit(slot),
            Err(Error::ConsistencyViolation(_))
        ));
        assert!(allocator.release(slot).is_err());
        Ok(())
    }

    #[test]
    fn test_restore() {
        let mut allocator =
            SlotAllocator::restore(4, vec![Slot::new(2), Slot::new(9)], vec![Slot::new(4)]);
        assert_eq!(allocator.high_water(), 10);
        assert_eq!(allocator.state(Slot::new(0)), SlotState::Written);
        assert_eq!(allocator.state(Slot::new(3)), SlotState::Reserved);
        assert_eq!(allocator.state(Slot::new(8)), SlotState::Reserved);
        assert_eq!(allocator.state(Slot::new(5)), SlotState::Unallocated);
        assert_eq!(allocator.allocate(), Slot::new(4));
        assert_eq!(allocator.allocate(), Slot::new(10));
    }
}

//! Slot addressing for paired storage

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical storage address
///
/// Slots come in pairs `(2n, 2n + 1)` that share row `n`: the even slot
/// holds the stored state, the odd slot its time reversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot(u64);

impl Slot {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// The forward slot of row `row`
    pub fn from_row(row: u64) -> Self {
        Self(row * 2)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Physical row shared by the pair
    pub fn row(&self) -> u64 {
        self.0 / 2
    }

    /// The paired partner (`slot XOR 1`)
    pub fn sibling(&self) -> Slot {
        Slot(self.0 ^ 1)
    }

    pub fn is_reversed(&self) -> bool {
        self.0 & 1 == 1
    }

    /// Even member of the pair
    pub fn forward(&self) -> Slot {
        Slot(self.0 & !1)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({}, row={})", self.0, self.row())
    }
}

/// Lifecycle of a slot pair
///
/// `Cached` is not a state here: whether an object sits in the object
/// cache is tracked by the cache and is independent of the slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Unallocated,
    /// Identity registered, attributes not written
    Reserved,
    /// Attributes written by a codec
    Written,
}

//! Slot numbers and the error raised for slots that were never issued.

use serde::{Deserialize, Serialize};

/// Rank of a live connection, as announced by the server.
///
/// Slots are dense small integers handed out lowest-free-first, so a lower
/// slot means an older, more preferred connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Slot(u32);

impl Slot {
    pub const ZERO: Slot = Slot(0);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Slot {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Slot> for u32 {
    fn from(slot: Slot) -> Self {
        slot.0
    }
}

impl TryFrom<i64> for Slot {
    type Error = InvalidSlot;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u32::try_from(value)
            .map(Slot)
            .map_err(|_| InvalidSlot(value))
    }
}

/// A slot outside `[0, high_water_mark]` was handed back to an allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("InvalidSlot: {0}")]
pub struct InvalidSlot(pub i64);

impl From<Slot> for InvalidSlot {
    fn from(slot: Slot) -> Self {
        Self(i64::from(slot.0))
    }
}

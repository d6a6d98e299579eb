//! Slot allocation: always hands out the lowest slot not currently in use.
//!
//! Keeping the live slot set dense is what makes a low slot scarce, and
//! therefore worth keeping, on the client side.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::queue::UniqueMinQueue;
use crate::slot::{InvalidSlot, Slot};

/// Issues and reclaims slots.
///
/// Safe to share between threads; every accepted connection draws from the
/// same allocator and returns its slot when it closes.
#[derive(Debug, Default)]
pub struct SlotAllocator {
    /// Number of slots ever issued, i.e. high-water mark + 1.
    issued: AtomicU32,
    free: UniqueMinQueue<Slot>,
}

impl SlotAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next available slot: the smallest returned slot if any, otherwise a
    /// fresh one above the high-water mark.
    pub fn next(&self) -> Slot {
        if let Some(slot) = self.free.poll() {
            return slot;
        }
        // The mark only grows while every issued slot is live, so it stays
        // bounded by peak concurrent connections.
        Slot::new(self.issued.fetch_add(1, Ordering::AcqRel))
    }

    /// Returns a previously issued slot.
    ///
    /// Returning a slot that is already free is absorbed; returning one that
    /// was never issued fails with [`InvalidSlot`].
    pub fn put(&self, slot: Slot) -> Result<(), InvalidSlot> {
        if slot.get() >= self.issued.load(Ordering::Acquire) {
            return Err(slot.into());
        }
        if !self.free.offer(slot) {
            tracing::debug!(slot = %slot, "Slot already free, ignoring duplicate return");
        }
        Ok(())
    }

    /// Largest slot issued so far, `None` on a fresh allocator.
    pub fn high_water_mark(&self) -> Option<Slot> {
        self.issued.load(Ordering::Acquire).checked_sub(1).map(Slot::new)
    }

    /// Number of returned slots waiting to be reissued.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

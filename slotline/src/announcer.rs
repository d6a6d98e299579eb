//! Server side of the protocol: every new connection is told its slot.
//!
//! A connection moves from awaiting-announce to announced in a single
//! [`SlotAnnouncer::announce`] call. The slot is reclaimed by the link's
//! close notification, which is registered before the announcement is
//! written so reclamation does not depend on the write ever completing.

use std::sync::Arc;

use crate::allocator::SlotAllocator;
use crate::link::Link;
use crate::slot::Slot;
use crate::wire;

/// Draws slots for new connections and returns them when they close.
///
/// Holds no per-connection state, so one announcer is shared by every
/// connection a server accepts.
#[derive(Debug, Clone, Default)]
pub struct SlotAnnouncer {
    slots: Arc<SlotAllocator>,
}

impl SlotAnnouncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allocator(slots: Arc<SlotAllocator>) -> Self {
        Self { slots }
    }

    pub fn allocator(&self) -> &Arc<SlotAllocator> {
        &self.slots
    }

    /// Assign a slot to a freshly established link and announce it.
    pub fn announce<L: Link + ?Sized>(&self, link: &L) -> Slot {
        let slot = self.slots.next();

        let slots = Arc::clone(&self.slots);
        link.on_close(Box::new(move || match slots.put(slot) {
            Ok(()) => tracing::debug!(slot = %slot, "Slot reclaimed"),
            Err(e) => {
                debug_assert!(false, "reclaimed slot was never issued: {e}");
                tracing::error!(slot = %slot, error = %e, "Bug: reclaimed slot was never issued");
            }
        }));

        link.send(wire::announcement(slot));
        tracing::debug!(slot = %slot, "Announced slot");
        slot
    }
}

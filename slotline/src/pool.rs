//! Client-side pool that keeps the lowest-slot connections.
//!
//! The pool holds at most `capacity` connections. Under capacity every
//! announced connection is admitted; at capacity a newcomer replaces the
//! highest-slot connection only if its own slot is lower, otherwise it is
//! closed. Callers lease the lowest-slot idle connection and release it when
//! done.
//!
//! # Bookkeeping
//!
//! Connection records live in one side-table keyed by a pool-assigned
//! [`ConnectionId`]. Two ordered indices over `(slot, id)` point into it:
//!
//! - `held`: every connection the pool counts toward capacity. Its maximum
//!   is the eviction candidate.
//! - `idle`: the subset not currently leased. Its minimum is the next lease.
//!
//! Every structural change is applied to both indices under one mutex. A
//! connection that is evicted while leased leaves both indices immediately
//! but keeps its record, marked closing, until the lease is released; only
//! then is it closed.
//!
//! Closed connections are dropped lazily when an operation runs into them,
//! and for certain when the link reports the close. Both paths converge on
//! the same removal, so whichever runs second is a no-op.
//!
//! Links are only closed, and close callbacks only registered, after the
//! pool lock has been released, so a link that notifies synchronously from
//! `close()` re-enters the pool like any other caller.

use std::collections::{BTreeSet, HashMap};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;

use crate::link::Link;
use crate::slot::Slot;

/// Capacity of [`ConnectionPool::default`].
pub const DEFAULT_CAPACITY: usize = 100;

/// Pool-assigned identity of an admitted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outcome of [`ConnectionPool::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted into spare capacity.
    Accepted { id: ConnectionId },
    /// Admitted in place of the connection holding `evicted`.
    Replaced { id: ConnectionId, evicted: Slot },
    /// Not an improvement; the connection was closed.
    Rejected,
}

impl Admission {
    pub fn id(&self) -> Option<ConnectionId> {
        match self {
            Admission::Accepted { id } | Admission::Replaced { id, .. } => Some(*id),
            Admission::Rejected => None,
        }
    }

    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Pool capacity must be at least 1")]
    ZeroCapacity,
    #[error("Connection {0} is not tracked by this pool")]
    Untracked(ConnectionId),
    #[error("Connection {0} is not leased")]
    NotLeased(ConnectionId),
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    /// Connections counted toward capacity.
    pub held: usize,
    /// Held connections that can be leased right now.
    pub available: usize,
    pub leased: usize,
}

type Key = (Slot, ConnectionId);

struct Entry<L> {
    link: Arc<L>,
    slot: Slot,
    leased: bool,
    /// Evicted while leased; close on release.
    closing: bool,
}

impl<L: Link> Entry<L> {
    fn is_live(&self) -> bool {
        !self.closing && self.link.is_open()
    }
}

struct PoolState<L> {
    entries: HashMap<ConnectionId, Entry<L>>,
    held: BTreeSet<Key>,
    idle: BTreeSet<Key>,
}

impl<L: Link> PoolState<L> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            held: BTreeSet::new(),
            idle: BTreeSet::new(),
        }
    }

    fn insert(&mut self, id: ConnectionId, slot: Slot, link: &Arc<L>) {
        self.entries.insert(
            id,
            Entry {
                link: Arc::clone(link),
                slot,
                leased: false,
                closing: false,
            },
        );
        self.held.insert((slot, id));
        self.idle.insert((slot, id));
    }

    /// Forget a connection entirely. Returns `false` if it was already gone.
    fn remove(&mut self, id: ConnectionId) -> bool {
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        self.held.remove(&(entry.slot, id));
        self.idle.remove(&(entry.slot, id));
        true
    }

    /// Drop closed entries off the top of `held`. Returns the live maximum,
    /// if any, and whether anything was dropped.
    fn live_max(&mut self) -> (Option<Key>, bool) {
        let mut dropped = false;
        while let Some(&(slot, id)) = self.held.last() {
            match self.entries.get(&id) {
                Some(entry) if entry.is_live() => return (Some((slot, id)), dropped),
                Some(_) => {
                    tracing::debug!(slot = %slot, id = %id, "Dropping closed connection");
                    self.remove(id);
                }
                None => {
                    debug_assert!(false, "held index references missing entry {id}");
                    tracing::error!(slot = %slot, id = %id, "Bug: held index references missing entry");
                    self.held.remove(&(slot, id));
                }
            }
            dropped = true;
        }
        (None, dropped)
    }

    /// Take a connection out of both indices to make room. A leased
    /// connection keeps its record, marked closing, until released.
    /// Returns the link if it should be closed now.
    fn evict(&mut self, (slot, id): Key) -> Option<Arc<L>> {
        self.held.remove(&(slot, id));
        self.idle.remove(&(slot, id));

        let entry = self.entries.get_mut(&id)?;
        entry.closing = true;
        if entry.leased {
            tracing::debug!(slot = %slot, id = %id, "Deferring close of leased connection");
            return None;
        }
        self.entries.remove(&id).map(|entry| entry.link)
    }

    /// Returns the admission outcome and a link to close, if any.
    fn admit(
        &mut self,
        capacity: usize,
        id: ConnectionId,
        slot: Slot,
        link: &Arc<L>,
    ) -> (Admission, Option<Arc<L>>) {
        if self.held.len() < capacity {
            self.insert(id, slot, link);
            return (Admission::Accepted { id }, None);
        }

        let (max, dropped) = self.live_max();

        if dropped && self.held.len() < capacity {
            self.insert(id, slot, link);
            return (Admission::Accepted { id }, None);
        }

        let Some(max) = max else {
            // At capacity with nothing held cannot happen while `held`
            // is the capacity count.
            debug_assert!(false, "pool at capacity with no live connections");
            tracing::error!(
                slot = %slot,
                held = self.held.len(),
                capacity,
                "Bug: pool at capacity with no live connections, discarding new connection"
            );
            return (Admission::Rejected, Some(Arc::clone(link)));
        };

        let (max_slot, _) = max;
        if max_slot <= slot {
            return (Admission::Rejected, Some(Arc::clone(link)));
        }

        let evicted = self.evict(max);
        self.insert(id, slot, link);
        (
            Admission::Replaced {
                id,
                evicted: max_slot,
            },
            evicted,
        )
    }

    fn stats(&self, capacity: usize) -> PoolStats {
        PoolStats {
            capacity,
            held: self.held.len(),
            available: self.idle.len(),
            leased: self
                .held
                .iter()
                .filter(|(_, id)| self.entries.get(id).is_some_and(|e| e.leased))
                .count(),
        }
    }
}

struct PoolInner<L> {
    capacity: usize,
    next_id: AtomicU64,
    state: Mutex<PoolState<L>>,
}

impl<L: Link> PoolInner<L> {
    fn state(&self) -> MutexGuard<'_, PoolState<L>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Pool mutex poisoned - continuing with possibly stale state");
                poisoned.into_inner()
            }
        }
    }

    fn release(&self, id: ConnectionId) -> Result<(), PoolError> {
        let to_close = {
            let mut guard = self.state();
            let state = &mut *guard;
            let entry = state.entries.get_mut(&id).ok_or(PoolError::Untracked(id))?;
            if !entry.leased {
                return Err(PoolError::NotLeased(id));
            }
            entry.leased = false;

            if entry.closing {
                state.entries.remove(&id).map(|entry| entry.link)
            } else {
                state.idle.insert((entry.slot, id));
                None
            }
        };

        if let Some(link) = to_close {
            tracing::debug!(id = %id, "Closing evicted connection on release");
            link.close();
        }
        Ok(())
    }

    fn reconcile_closed(&self, id: ConnectionId) {
        if self.state().remove(id) {
            tracing::debug!(id = %id, "Removed closed connection from pool");
        }
    }
}

/// Bounded pool of announced connections preferring the lowest slots.
///
/// Cheap to clone; clones share the same pool.
pub struct ConnectionPool<L> {
    inner: Arc<PoolInner<L>>,
}

impl<L> Clone for ConnectionPool<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: Link> Default for ConnectionPool<L> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl<L: Link> ConnectionPool<L> {
    pub fn new(capacity: usize) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }
        Ok(Self::with_capacity(capacity))
    }

    fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                next_id: AtomicU64::new(0),
                state: Mutex::new(PoolState::new()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Offer a newly announced connection to the pool.
    ///
    /// Rejected connections, and evicted ones that are not leased, are
    /// closed before this returns.
    pub fn admit(&self, slot: Slot, link: Arc<L>) -> Admission {
        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (admission, to_close) = self.inner.state().admit(self.inner.capacity, id, slot, &link);

        match admission {
            Admission::Accepted { .. } => {
                tracing::debug!(slot = %slot, id = %id, "Admitted connection");
            }
            Admission::Replaced { evicted, .. } => {
                tracing::debug!(slot = %slot, id = %id, evicted = %evicted, "Admitted connection, evicting higher slot");
            }
            Admission::Rejected => {
                tracing::debug!(slot = %slot, "Rejected connection, pool holds lower slots");
            }
        }

        if let Some(link) = to_close {
            link.close();
        }

        if admission.is_admitted() {
            let pool = Arc::downgrade(&self.inner);
            link.on_close(Box::new(move || {
                if let Some(pool) = Weak::upgrade(&pool) {
                    pool.reconcile_closed(id);
                }
            }));
        }

        admission
    }

    /// Lease the lowest-slot idle connection.
    ///
    /// Closed or closing connections met on the way are skipped. A leased
    /// connection still counts toward capacity and can still be chosen for
    /// eviction, in which case it is closed once released.
    pub fn acquire(&self) -> Option<Lease<L>> {
        let mut guard = self.inner.state();
        let state = &mut *guard;

        while let Some((slot, id)) = state.idle.pop_first() {
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            if !entry.is_live() {
                tracing::trace!(slot = %slot, id = %id, "Skipping closed connection");
                continue;
            }
            entry.leased = true;
            return Some(Lease {
                pool: Arc::clone(&self.inner),
                id,
                slot,
                link: Arc::clone(&entry.link),
            });
        }
        None
    }

    /// Return a leased connection by id.
    ///
    /// Prefer dropping the [`Lease`]; this is the underlying operation.
    pub fn release(&self, id: ConnectionId) -> Result<(), PoolError> {
        self.inner.release(id)
    }

    /// Connections counted toward capacity.
    pub fn len(&self) -> usize {
        self.inner.state().held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots currently held, ascending.
    pub fn slots(&self) -> Vec<Slot> {
        self.inner.state().held.iter().map(|&(slot, _)| slot).collect()
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.state().stats(self.inner.capacity)
    }
}

impl<L> std::fmt::Debug for ConnectionPool<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

/// A leased connection. Released back to the pool on drop.
#[must_use = "dropping a lease releases the connection immediately"]
pub struct Lease<L: Link> {
    pool: Arc<PoolInner<L>>,
    id: ConnectionId,
    slot: Slot,
    link: Arc<L>,
}

impl<L: Link> Lease<L> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn link(&self) -> &Arc<L> {
        &self.link
    }

    /// Release explicitly. Equivalent to dropping the lease.
    pub fn release(self) {
        drop(self);
    }
}

impl<L: Link> Deref for Lease<L> {
    type Target = L;

    fn deref(&self) -> &L {
        &self.link
    }
}

impl<L: Link> Drop for Lease<L> {
    fn drop(&mut self) {
        match self.pool.release(self.id) {
            Ok(()) => {}
            // Closed while leased; the pool already let go of it.
            Err(PoolError::Untracked(_)) => {
                tracing::trace!(slot = %self.slot, id = %self.id, "Released connection that already closed");
            }
            Err(e) => {
                debug_assert!(false, "lease release failed: {e}");
                tracing::error!(slot = %self.slot, id = %self.id, error = %e, "Bug: lease release failed");
            }
        }
    }
}

impl<L: Link> std::fmt::Debug for Lease<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .finish()
    }
}

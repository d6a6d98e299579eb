//! Transport connections as seen by the announcer and the pool.
//!
//! Neither side owns the transport: they write to it, probe it, ask it to
//! close, and get told exactly once when it is gone, whatever the cause.

mod tcp;

use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

pub use tcp::TcpLink;

/// Invoked once when a link becomes unusable.
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// A transport connection.
pub trait Link: Send + Sync + 'static {
    /// Queue bytes for writing. Fire-and-forget: failures surface as a close.
    fn send(&self, bytes: Bytes);

    fn is_open(&self) -> bool;

    /// Request termination. Idempotent.
    fn close(&self);

    /// Register a callback that runs exactly once when the link closes for
    /// any reason. Runs immediately if the link has already closed.
    fn on_close(&self, callback: CloseCallback);
}

#[derive(Default)]
struct Waiters {
    fired: bool,
    callbacks: Vec<CloseCallback>,
}

/// Exactly-once close notification.
///
/// Callbacks never run while the internal lock is held, so a callback may
/// take other locks or subscribe again without deadlocking.
#[derive(Default)]
pub struct CloseNotifier {
    waiters: Mutex<Waiters>,
}

impl CloseNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn waiters(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, callback: CloseCallback) {
        let mut waiters = self.waiters();
        if waiters.fired {
            drop(waiters);
            callback();
            return;
        }
        waiters.callbacks.push(callback);
    }

    /// Fire all pending callbacks. Returns `false` if already fired.
    pub fn notify(&self) -> bool {
        let callbacks = {
            let mut waiters = self.waiters();
            if waiters.fired {
                return false;
            }
            waiters.fired = true;
            std::mem::take(&mut waiters.callbacks)
        };
        for callback in callbacks {
            callback();
        }
        true
    }

    pub fn has_fired(&self) -> bool {
        self.waiters().fired
    }
}

impl std::fmt::Debug for CloseNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let waiters = self.waiters();
        f.debug_struct("CloseNotifier")
            .field("fired", &waiters.fired)
            .field("pending", &waiters.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use bytes::Bytes;

    use super::{CloseCallback, CloseNotifier, Link};

    /// In-memory link. By default `close()` notifies synchronously; a
    /// deferred link only notifies on `flush_close()`, like a transport that
    /// reports closes from its own event loop.
    #[derive(Debug, Default)]
    pub struct MockLink {
        open: AtomicBool,
        deferred: bool,
        close_requests: AtomicUsize,
        sent: Mutex<Vec<Bytes>>,
        notifier: CloseNotifier,
    }

    impl MockLink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                open: AtomicBool::new(true),
                ..Default::default()
            })
        }

        pub fn deferred() -> Arc<Self> {
            Arc::new(Self {
                open: AtomicBool::new(true),
                deferred: true,
                ..Default::default()
            })
        }

        /// Number of times `close()` was called.
        pub fn close_requests(&self) -> usize {
            self.close_requests.load(Ordering::SeqCst)
        }

        pub fn sent(&self) -> Vec<Bytes> {
            self.sent.lock().unwrap().clone()
        }

        /// The peer went away.
        pub fn disconnect(&self) {
            self.open.store(false, Ordering::SeqCst);
            if !self.deferred {
                self.notifier.notify();
            }
        }

        /// Deliver a pending close notification.
        pub fn flush_close(&self) {
            assert!(!self.is_open(), "flush_close on an open link");
            self.notifier.notify();
        }
    }

    impl Link for MockLink {
        fn send(&self, bytes: Bytes) {
            if self.is_open() {
                self.sent.lock().unwrap().push(bytes);
            }
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.close_requests.fetch_add(1, Ordering::SeqCst);
            self.disconnect();
        }

        fn on_close(&self, callback: CloseCallback) {
            self.notifier.subscribe(callback);
        }
    }
}

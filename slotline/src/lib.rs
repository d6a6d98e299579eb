//! slotline: connection-affinity protocol.
//!
//! A server gives every connection the lowest unused slot number and sends
//! it as the first bytes on the wire. A client keeps a bounded pool of such
//! connections and always prefers the lowest slots, evicting higher ones
//! when a lower one arrives.

mod allocator;
mod announcer;
mod queue;
mod slot;

pub mod client;
pub mod link;
pub mod pool;
pub mod server;
pub mod wire;

pub use allocator::SlotAllocator;
pub use announcer::SlotAnnouncer;
pub use client::{ClientConfig, ClientError, Dialer};
pub use link::{CloseCallback, CloseNotifier, Link, TcpLink};
pub use pool::{Admission, ConnectionId, ConnectionPool, Lease, PoolError, PoolStats};
pub use queue::UniqueMinQueue;
pub use server::ServerConfig;
pub use slot::{InvalidSlot, Slot};
pub use wire::{SlotCodec, WireError};

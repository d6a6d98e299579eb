//! Client side of the protocol: read the announced slot, then offer the
//! connection to a [`ConnectionPool`].

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;

use crate::link::TcpLink;
use crate::pool::{Admission, ConnectionPool, DEFAULT_CAPACITY, PoolError};
use crate::slot::Slot;
use crate::wire::{SlotCodec, WireError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("No slot announcement within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, `host:port`.
    pub addr: String,
    /// Most connections the pool keeps.
    pub capacity: usize,
    /// How long to wait for connect plus announcement.
    pub announce_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:7878".to_string(),
            capacity: DEFAULT_CAPACITY,
            announce_timeout: Duration::from_secs(5),
        }
    }
}

/// Connect to `addr` and read its slot announcement.
pub async fn connect(addr: &str) -> Result<(Slot, TcpLink), ClientError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| ClientError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(addr, error = %e, "Failed to set TCP_NODELAY");
    }
    read_announcement(stream).await
}

/// Read the slot announcement from a fresh connection.
///
/// Bytes that arrived after the announcement are handed to the link.
pub async fn read_announcement(stream: TcpStream) -> Result<(Slot, TcpLink), ClientError> {
    let mut framed = FramedRead::new(stream, SlotCodec::new());
    let slot = match framed.next().await {
        Some(slot) => slot?,
        None => return Err(WireError::Truncated.into()),
    };

    let buffered = framed.read_buffer_mut().split();
    let link = TcpLink::with_buffered(framed.into_inner(), buffered)?;
    tracing::debug!(slot = %slot, peer = %link.peer_addr(), "Received slot announcement");
    Ok((slot, link))
}

/// Opens connections to one server and feeds them to a pool.
#[derive(Debug, Clone)]
pub struct Dialer {
    config: ClientConfig,
    pool: ConnectionPool<TcpLink>,
}

impl Dialer {
    pub fn new(config: ClientConfig) -> Result<Self, PoolError> {
        let pool = ConnectionPool::new(config.capacity)?;
        Ok(Self { config, pool })
    }

    pub fn pool(&self) -> &ConnectionPool<TcpLink> {
        &self.pool
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open one connection and offer it to the pool.
    pub async fn dial(&self) -> Result<Admission, ClientError> {
        let timeout = self.config.announce_timeout;
        let (slot, link) = tokio::time::timeout(timeout, connect(&self.config.addr))
            .await
            .map_err(|_| ClientError::Timeout(timeout))??;
        Ok(self.pool.admit(slot, Arc::new(link)))
    }
}

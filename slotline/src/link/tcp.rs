//! TCP implementation of [`Link`] on tokio.
//!
//! Each link runs one driver task that owns both socket halves. Outbound
//! bytes go through an unbounded queue; inbound bytes are forwarded to a
//! bounded channel read via [`TcpLink::recv`], and held back by the driver
//! while that channel is full. EOF, an I/O error or
//! `close()` all end the driver, which then shuts the socket and fires the
//! close notifier.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::{CloseCallback, CloseNotifier, Link};

const READ_BUFFER_SIZE: usize = 8 * 1024;
const INBOUND_QUEUE_DEPTH: usize = 64;

struct Shared {
    peer: SocketAddr,
    cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<Bytes>,
    notifier: CloseNotifier,
}

/// A TCP connection driven by a background task.
pub struct TcpLink {
    shared: Arc<Shared>,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
}

impl TcpLink {
    /// Wrap a connected stream. Must be called within a tokio runtime.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        Self::with_buffered(stream, BytesMut::new())
    }

    /// Wrap a stream whose first bytes were already read into `buffered`
    /// (e.g. alongside the slot announcement). They are replayed first
    /// through [`recv`](Self::recv).
    pub fn with_buffered(stream: TcpStream, buffered: BytesMut) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);

        if !buffered.is_empty() {
            // Fresh channel with spare capacity; cannot fail.
            let _ = inbound_tx.try_send(buffered.freeze());
        }

        let shared = Arc::new(Shared {
            peer,
            cancel: CancellationToken::new(),
            outbound: outbound_tx,
            notifier: CloseNotifier::new(),
        });

        tokio::spawn(drive(
            Arc::clone(&shared),
            read,
            write,
            outbound_rx,
            inbound_tx,
        ));

        tracing::trace!(peer = %peer, "Link started");
        Ok(Self {
            shared,
            inbound: Mutex::new(inbound_rx),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Next chunk of inbound bytes, `None` once the link has closed and all
    /// received data has been consumed.
    pub async fn recv(&self) -> Option<Bytes> {
        self.inbound.lock().await.recv().await
    }

    /// Resolves once the link has closed.
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await;
    }
}

impl Link for TcpLink {
    fn send(&self, bytes: Bytes) {
        if self.shared.outbound.send(bytes).is_err() {
            tracing::trace!(peer = %self.shared.peer, "Dropping write on closed link");
        }
    }

    fn is_open(&self) -> bool {
        !self.shared.cancel.is_cancelled()
    }

    fn close(&self) {
        self.shared.cancel.cancel();
    }

    fn on_close(&self, callback: CloseCallback) {
        self.shared.notifier.subscribe(callback);
    }
}

impl std::fmt::Debug for TcpLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpLink")
            .field("peer", &self.shared.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

async fn drive(
    shared: Arc<Shared>,
    mut read: OwnedReadHalf,
    mut write: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    inbound: mpsc::Sender<Bytes>,
) {
    let peer = shared.peer;

    // Reading never waits on the consumer, so EOF is seen even when nobody
    // drains `recv()`. Bytes the inbound queue cannot take yet stay in
    // `pending`.
    let reader = async {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut pending = BytesMut::new();
        let mut forwarding = true;
        loop {
            tokio::select! {
                result = read.read_buf(&mut buf) => match result {
                    Ok(0) => {
                        tracing::debug!(peer = %peer, "Peer closed connection");
                        break;
                    }
                    Ok(_) => {
                        if forwarding {
                            pending.extend_from_slice(&buf);
                        }
                        buf.clear();
                    }
                    Err(e) => {
                        tracing::debug!(peer = %peer, error = %e, "Read failed");
                        break;
                    }
                },
                permit = inbound.reserve(), if forwarding && !pending.is_empty() => match permit {
                    Ok(permit) => permit.send(pending.split().freeze()),
                    Err(_) => {
                        // Receiver gone; keep reading only to observe EOF.
                        forwarding = false;
                        pending.clear();
                    }
                },
            }
        }
        if forwarding && !pending.is_empty() && inbound.try_send(pending.split().freeze()).is_err() {
            tracing::trace!(peer = %peer, "Discarding unread bytes of closed link");
        }
    };

    let writer = async {
        while let Some(bytes) = outbound.recv().await {
            if let Err(e) = write.write_all(&bytes).await {
                tracing::debug!(peer = %peer, error = %e, "Write failed");
                return;
            }
        }
    };

    tokio::select! {
        _ = shared.cancel.cancelled() => {
            tracing::debug!(peer = %peer, "Link closed locally");
        }
        _ = reader => {}
        _ = writer => {}
    }

    shared.cancel.cancel();
    if let Err(e) = write.shutdown().await {
        tracing::trace!(peer = %peer, error = %e, "Shutdown after close failed");
    }
    drop(read);
    drop(write);
    shared.notifier.notify();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn close_signal(link: &TcpLink) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        link.on_close(Box::new(move || {
            let _ = tx.send(());
        }));
        rx
    }

    #[tokio::test]
    async fn sent_bytes_reach_the_peer() {
        let (a, mut b) = pair().await;
        let link = TcpLink::new(a).unwrap();

        link.send(Bytes::from_static(b"7\r\n"));
        let mut buf = [0u8; 3];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"7\r\n");
    }

    #[tokio::test]
    async fn inbound_bytes_are_received() {
        let (a, mut b) = pair().await;
        let link = TcpLink::with_buffered(a, BytesMut::from(&b"early"[..])).unwrap();

        assert_eq!(link.recv().await.unwrap(), Bytes::from_static(b"early"));
        b.write_all(b"later").await.unwrap();
        assert_eq!(link.recv().await.unwrap(), Bytes::from_static(b"later"));
    }

    #[tokio::test]
    async fn peer_close_notifies_once() {
        let (a, b) = pair().await;
        let link = TcpLink::new(a).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        link.on_close(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let closed = close_signal(&link);

        drop(b);
        tokio::time::timeout(Duration::from_secs(5), closed)
            .await
            .expect("close notification")
            .unwrap();

        assert!(!link.is_open());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        link.close();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_close_shuts_socket_and_notifies() {
        let (a, mut b) = pair().await;
        let link = TcpLink::new(a).unwrap();
        let closed = close_signal(&link);

        link.close();
        assert!(!link.is_open());
        tokio::time::timeout(Duration::from_secs(5), closed)
            .await
            .expect("close notification")
            .unwrap();

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), b.read(&mut buf))
            .await
            .expect("peer sees EOF")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn peer_close_is_seen_while_inbound_is_not_drained() {
        let (a, mut b) = pair().await;
        let link = TcpLink::new(a).unwrap();
        let closed = close_signal(&link);

        let chunk = [7u8; 64];
        for _ in 0..200 {
            b.write_all(&chunk).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        drop(b);

        tokio::time::timeout(Duration::from_secs(5), closed)
            .await
            .expect("close notification")
            .unwrap();
        assert!(!link.is_open());

        // Data that fit in the queue is still readable after the close.
        let first = link.recv().await.unwrap();
        assert!(first.iter().all(|&byte| byte == 7));
    }

    #[tokio::test]
    async fn subscribing_after_close_still_notifies() {
        let (a, _b) = pair().await;
        let link = TcpLink::new(a).unwrap();
        link.close();
        link.closed().await;
        tokio::time::timeout(Duration::from_secs(5), close_signal(&link))
            .await
            .expect("close notification")
            .unwrap();
    }
}

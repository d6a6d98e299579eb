//! TCP accept loop that announces a slot on every connection.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use crate::announcer::SlotAnnouncer;
use crate::link::TcpLink;

/// Pause after a failed accept (e.g. out of file descriptors) before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7878,
        }
    }
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    config: ServerConfig,
    announcer: SlotAnnouncer,
    shutdown: impl Future<Output = ()>,
) -> io::Result<()> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    serve_listener(listener, announcer, shutdown).await
}

/// Serve on an already bound listener until `shutdown` resolves.
///
/// Connections already announced stay open; only accepting stops.
pub async fn serve_listener(
    listener: TcpListener,
    announcer: SlotAnnouncer,
    shutdown: impl Future<Output = ()>,
) -> io::Result<()> {
    info!("Starting slotline server on {}", listener.local_addr()?);

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    match TcpLink::new(stream) {
                        Ok(link) => {
                            let slot = announcer.announce(&link);
                            tracing::debug!(peer = %peer, slot = %slot, "Accepted connection");
                        }
                        Err(e) => {
                            tracing::warn!(peer = %peer, error = %e, "Dropping connection that closed during accept");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

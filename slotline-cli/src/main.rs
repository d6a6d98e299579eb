//! slotline: run a slot-announcing server, or probe one with a bounded pool.

mod probe;

use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use slotline::server::{self, ServerConfig};
use slotline::{ClientConfig, SlotAnnouncer};

/// Connection-affinity slot server and probe.
///
/// Logging: RUST_LOG takes precedence; otherwise SLOTLINE_LOG
/// (debug|info|warn|error) sets the level. LOG_FORMAT=json switches to
/// JSON lines on stderr.
#[derive(Parser)]
#[command(name = "slotline", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept connections and announce the lowest free slot on each
    Serve {
        #[arg(long, env = "SLOTLINE_HOST", default_value = "0.0.0.0")]
        host: String,

        #[arg(short, long, env = "SLOTLINE_PORT", default_value_t = 7878)]
        port: u16,
    },

    /// Dial a server repeatedly into a bounded pool and report which slots it kept
    Probe {
        /// Server address
        #[arg(long, env = "SLOTLINE_ADDR", default_value = "127.0.0.1:7878")]
        addr: String,

        /// Pool capacity
        #[arg(short, long, env = "SLOTLINE_CAPACITY", default_value_t = slotline::pool::DEFAULT_CAPACITY)]
        capacity: usize,

        /// Number of connections to open
        #[arg(short = 'n', long, default_value_t = 200)]
        connections: usize,

        /// Connect + announcement timeout per connection, in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Keep the pooled connections open until interrupted
        #[arg(long)]
        hold: bool,
    },
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("SLOTLINE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("slotline={level},slotline_cli={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Resolves on SIGINT or SIGTERM.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when
/// the tokio runtime is misconfigured.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { host, port } => {
            let config = ServerConfig { host, port };
            server::serve(config, SlotAnnouncer::new(), shutdown_signal()).await?;
        }
        Command::Probe {
            addr,
            capacity,
            connections,
            timeout_ms,
            json,
            hold,
        } => {
            let config = ClientConfig {
                addr,
                capacity,
                announce_timeout: Duration::from_millis(timeout_ms),
            };
            let (report, dialer) = probe::run(config, connections).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{report}");
            }
            if hold {
                info!(held = dialer.pool().len(), "Holding pooled connections until interrupted");
                shutdown_signal().await;
            }
        }
    }

    Ok(())
}

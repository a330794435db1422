/// mushd - A persistent multi-user MUSH server
///
/// A single world store task owns all world data; connections talk to it by
/// message. Snapshots go to disk periodically, on request and at shutdown.

// Module declarations
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod persistence;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{MushError, Result};
pub use network::{Lobby, Server, SessionHandler};
pub use persistence::{SnapshotStore, Snapshotter};

use std::path::PathBuf;
use tokio::sync::watch;

/// Initialize logging infrastructure
///
/// `RUST_LOG` wins when set; otherwise `default_filter` applies.
pub fn init_logging(default_filter: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    tracing::info!("{} starting...", network::lobby::version_string());
}

/// Run the server until Ctrl-C, returning the final snapshot path
pub async fn run(config: ServerConfig) -> Result<PathBuf> {
    let store = SnapshotStore::new(&config.data_dir, &config.backup_dir, &config.current_file);
    let server = Server::start(config, store, Lobby::new())?;
    let listener = server.bind().await?;

    let (stop, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received, shutting down");
                let _ = stop.send(true);
            }
            // Keep serving; the process can still be killed
            Err(e) => tracing::error!("Unable to listen for Ctrl-C: {}", e),
        }
    });

    server.serve(listener, stop_rx).await
}

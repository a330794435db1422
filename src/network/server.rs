/// Listener, per-connection spawning and orderly shutdown
///
/// The accept loop waits at most `accept_poll` for each connection so it can
/// notice the shutdown signal promptly. Shutdown runs in a fixed order: stop
/// accepting, then drain and save the world store, then force-close every
/// remaining session. Handlers still running at that point see their world
/// requests fail with `MushError::WorldStopped` and their reads end.

use crate::config::ServerConfig;
use crate::core::connection::Connection;
use crate::core::session::{Session, SessionRegistry};
use crate::core::world::{WorldHandle, WorldShutdown, WorldStore};
use crate::error::Result;
use crate::persistence::Snapshotter;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Per-connection control flow
///
/// Called once per accepted client after the session has been registered.
/// The server unregisters and closes the session when the future completes.
pub trait SessionHandler: Send + Sync + 'static {
    fn handle(&self, conn: Connection) -> impl Future<Output = Result<()>> + Send;
}

/// A running world plus the sessions attached to it
pub struct Server<H: SessionHandler> {
    config: ServerConfig,
    world: WorldHandle,
    world_shutdown: WorldShutdown,
    registry: Arc<SessionRegistry>,
    handler: Arc<H>,
}

impl<H: SessionHandler> Server<H> {
    /// Load the world through `snapshotter` and start its store
    ///
    /// # Errors
    /// Any load failure other than a missing snapshot. Starting on an empty
    /// world when a damaged one exists would overwrite it on the next save.
    pub fn start<S: Snapshotter>(config: ServerConfig, snapshotter: S, handler: H) -> Result<Self> {
        let db = snapshotter.load()?;

        let (world, world_shutdown) = WorldStore::builder(db, snapshotter)
            .save_interval(config.save_interval())
            .queue_size(config.request_queue)
            .spawn();

        Ok(Self {
            config,
            world,
            world_shutdown,
            registry: Arc::new(SessionRegistry::new()),
            handler: Arc::new(handler),
        })
    }

    pub fn world(&self) -> WorldHandle {
        self.world.clone()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept clients until `shutdown` turns true, then shut down
    ///
    /// Returns the path of the final snapshot.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PathBuf> {
        let poll = self.config.accept_poll();

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            match timeout(poll, listener.accept()).await {
                // Deadline passed; go round and re-check the signal
                Err(_) => continue,
                Ok(Ok((stream, peer))) => self.spawn_connection(stream, peer),
                Ok(Err(e)) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(poll).await;
                }
            }
        }

        drop(listener);
        info!("Stopped accepting connections");
        self.shutdown().await
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
        }

        let (reader, writer) = stream.into_split();
        let session = Session::new(peer.to_string(), writer);
        let registry = Arc::clone(&self.registry);
        let world = self.world.clone();
        let handler = Arc::clone(&self.handler);

        tokio::spawn(async move {
            if let Err(e) = registry.open(&session).await {
                warn!("Refusing connection from {}: {}", peer, e);
                session.close().await;
                return;
            }

            let conn = Connection::new(reader, Arc::clone(&session), world, Arc::clone(&registry));
            if let Err(e) = handler.handle(conn).await {
                warn!("Session {} ended with error: {}", session, e);
            }

            registry.close(&session).await;
            session.close().await;
        });
    }

    async fn shutdown(self) -> Result<PathBuf> {
        let saved = self.world_shutdown.shutdown().await;
        match &saved {
            Ok(path) => info!("Final snapshot written to {}", path.display()),
            Err(e) => error!("Final save failed: {}", e),
        }

        self.registry.shutdown().await;
        info!("Server stopped");
        saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entities::WorldDatabase;
    use crate::persistence::snapshot::MockSnapshotter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Echoes each line back, counting sessions it served
    struct Echo {
        served: Arc<AtomicUsize>,
    }

    impl SessionHandler for Echo {
        async fn handle(&self, mut conn: Connection) -> Result<()> {
            self.served.fetch_add(1, Ordering::SeqCst);
            while let Some(line) = conn.read_line().await? {
                conn.println(&line).await?;
            }
            Ok(())
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            accept_poll_millis: 20,
            ..Default::default()
        }
    }

    fn mock_snapshotter(saves: Arc<AtomicUsize>) -> MockSnapshotter {
        let mut mock = MockSnapshotter::new();
        mock.expect_load().returning(|| Ok(WorldDatabase::seeded()));
        mock.expect_save().returning(move |_| {
            saves.fetch_add(1, Ordering::SeqCst);
            Ok(PathBuf::from("backup/world-final.json"))
        });
        mock
    }

    #[tokio::test]
    async fn test_start_fails_on_load_error() {
        let mut mock = MockSnapshotter::new();
        mock.expect_load().returning(|| {
            Err(crate::error::MushError::SnapshotIo {
                path: PathBuf::from("world.json"),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            })
        });

        let served = Arc::new(AtomicUsize::new(0));
        let result = Server::start(test_config(), mock, Echo { served });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_serves_and_shuts_down_in_order() {
        let saves = Arc::new(AtomicUsize::new(0));
        let served = Arc::new(AtomicUsize::new(0));
        let server = Server::start(
            test_config(),
            mock_snapshotter(saves.clone()),
            Echo { served: served.clone() },
        )
        .unwrap();

        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = server.registry();
        let world = server.world();
        let (stop, stop_rx) = watch::channel(false);
        let running = tokio::spawn(server.serve(listener, stop_rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping\r\n").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\r\n");
        assert_eq!(registry.len().await, 1);

        stop.send(true).unwrap();
        let saved = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(saved, PathBuf::from("backup/world-final.json"));
        assert_eq!(saves.load(Ordering::SeqCst), 1);
        assert_eq!(served.load(Ordering::SeqCst), 1);
        assert!(world.is_closed());
        assert!(registry.is_halted().await);

        // Client sees the transport closed
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_session_unregistered_when_handler_returns() {
        let saves = Arc::new(AtomicUsize::new(0));
        let served = Arc::new(AtomicUsize::new(0));
        let server = Server::start(test_config(), mock_snapshotter(saves), Echo { served }).unwrap();

        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = server.registry();
        let (stop, stop_rx) = watch::channel(false);
        let running = tokio::spawn(server.serve(listener, stop_rx));

        let client = TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.is_empty().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !registry.is_empty().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        stop.send(true).unwrap();
        running.await.unwrap().unwrap();
    }
}

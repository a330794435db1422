/// Integration tests for mushd
///
/// Drives a real server over loopback TCP with the built-in lobby and an
/// on-disk snapshot store in a temporary directory.

use mushd_lib::{
    core::{EntityKind, FindQuery, NewEntity, WorldStore},
    network::telnet::{DO, IAC, WILL},
    Lobby, Server, ServerConfig, SnapshotStore, Snapshotter,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const STEP: Duration = Duration::from_secs(5);

// ============================================================================
// Helpers
// ============================================================================

struct Running {
    addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<mushd_lib::Result<PathBuf>>,
}

impl Running {
    async fn stop(self) -> PathBuf {
        self.stop.send(true).unwrap();
        tokio::time::timeout(STEP, self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap()
    }
}

fn config_for(dir: &TempDir) -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        data_dir: dir.path().to_path_buf(),
        accept_poll_millis: 20,
        ..Default::default()
    }
}

fn store_for(config: &ServerConfig) -> SnapshotStore {
    SnapshotStore::new(&config.data_dir, &config.backup_dir, &config.current_file)
}

async fn start(dir: &TempDir) -> Running {
    let config = config_for(dir);
    let server = Server::start(config.clone(), store_for(&config), Lobby::new()).unwrap();
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(server.serve(listener, stop_rx));
    Running { addr, stop, task }
}

struct Client {
    stream: TcpStream,
    seen: Vec<u8>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            seen: Vec::new(),
        }
    }

    async fn expect(&mut self, needle: &str) {
        tokio::time::timeout(STEP, async {
            let mut buf = [0u8; 512];
            loop {
                let found = self
                    .seen
                    .windows(needle.len())
                    .position(|w| w == needle.as_bytes());
                if let Some(at) = found {
                    self.seen.drain(..at + needle.len());
                    return;
                }
                let n = self.stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "EOF waiting for {:?}", needle);
                self.seen.extend_from_slice(&buf[..n]);
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", needle));
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    async fn send(&mut self, line: &str) {
        self.send_raw(format!("{}\r\n", line).as_bytes()).await;
    }

    async fn login_new(&mut self, name: &str, password: &str) {
        self.expect("Username => ").await;
        self.send(name).await;
        self.expect("Choose a password => ").await;
        self.send(password).await;
        self.expect(&format!("{} has appeared.", name)).await;
    }

    async fn read_to_eof(&mut self) {
        let mut rest = Vec::new();
        tokio::time::timeout(STEP, self.stream.read_to_end(&mut rest))
            .await
            .expect("connection was not closed")
            .unwrap();
    }
}

// ============================================================================
// Lobby over TCP
// ============================================================================

#[tokio::test]
async fn test_greeting_carries_version() {
    let dir = TempDir::new().unwrap();
    let server = start(&dir).await;

    let mut client = Client::connect(server.addr).await;
    client.expect(&format!("mushd v{}", env!("CARGO_PKG_VERSION"))).await;

    server.stop().await;
}

#[tokio::test]
async fn test_arrivals_and_departures_are_broadcast() {
    let dir = TempDir::new().unwrap();
    let server = start(&dir).await;

    let mut alice = Client::connect(server.addr).await;
    alice.login_new("Alice", "pw1").await;

    let mut bob = Client::connect(server.addr).await;
    bob.login_new("Bob", "pw2").await;
    alice.expect("Bob has appeared.").await;

    bob.send("quit").await;
    bob.expect("Goodbye.").await;
    bob.read_to_eof().await;
    alice.expect("Bob disappears in a puff of smoke.").await;

    server.stop().await;
}

#[tokio::test]
async fn test_telnet_negotiation_is_stripped_from_input() {
    let dir = TempDir::new().unwrap();
    let server = start(&dir).await;

    let mut client = Client::connect(server.addr).await;
    client.expect("Username => ").await;

    // Negotiation split across writes and interleaved with the name
    client.send_raw(&[IAC, WILL]).await;
    client.send_raw(&[31]).await;
    client.send_raw(b"Car").await;
    client.send_raw(&[IAC, DO, 3]).await;
    client.send_raw(b"ol\r\n").await;

    client.expect("Choose a password => ").await;
    client.send("secret").await;
    client.expect("Carol has appeared.").await;

    let saved = server.stop().await;
    let db = SnapshotStore::new(dir.path(), "backup", "world.json").load().unwrap();
    assert!(saved.starts_with(dir.path().join("backup")));
    assert!(db.players.values().any(|p| p.name == "Carol"));
}

// ============================================================================
// Shutdown and persistence
// ============================================================================

#[tokio::test]
async fn test_shutdown_saves_and_closes_clients() {
    let dir = TempDir::new().unwrap();
    let server = start(&dir).await;

    let mut client = Client::connect(server.addr).await;
    client.login_new("Dave", "hunter2").await;

    let saved = server.stop().await;
    client.read_to_eof().await;

    assert!(saved.exists());
    assert!(dir.path().join("world.json").exists());

    // A restarted server knows Dave and his password
    let server = start(&dir).await;
    let mut client = Client::connect(server.addr).await;
    client.expect("Username => ").await;
    client.send("dave").await;
    client.expect("Password => ").await;
    client.send("hunter2").await;
    client.expect("Welcome back, Dave.").await;
    client.send("who").await;
    client.expect("Dave").await;

    server.stop().await;
}

#[tokio::test]
async fn test_world_survives_snapshot_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::new(dir.path(), "backup", "world.json");

    let (world, shutdown) = WorldStore::builder(store.load().unwrap(), store.clone()).spawn();
    let owner = world
        .create(NewEntity::Player {
            name: "Erin".to_string(),
            description: String::new(),
        })
        .await
        .unwrap()
        .unwrap()
        .id();
    let lamp = world
        .create(NewEntity::Item {
            name: "lamp".to_string(),
            description: "A brass lamp".to_string(),
            owner,
        })
        .await
        .unwrap()
        .unwrap()
        .id();
    world.save_state().await.unwrap();
    shutdown.shutdown().await.unwrap();

    assert_eq!(store.backups().unwrap().len(), 2);

    let (world, shutdown) = WorldStore::builder(store.load().unwrap(), store.clone()).spawn();
    let found = world
        .find(EntityKind::Item, FindQuery::ByOwner(owner))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), lamp);

    let exits = world
        .find(EntityKind::Exit, FindQuery::ByName("DOWN".to_string()))
        .await
        .unwrap();
    assert_eq!(exits.len(), 1);
    shutdown.shutdown().await.unwrap();
}

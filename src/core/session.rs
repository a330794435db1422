/// Live connections and the registry that tracks them
///
/// The registry is independent of world data. `open`/`close` take the write
/// lock, `list` takes the read lock and hands back an owned copy, so callers
/// iterate without holding anything and never observe a half-applied change.

use crate::core::ids::{ConnectionId, IdType};
use crate::error::{MushError, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How long `close()` waits for the transport to shut down
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// One attached connection
pub struct Session {
    /// 0 until the registry assigns an identifier
    id: AtomicU64,
    peer: String,
    connected_at: DateTime<Utc>,
    player: Mutex<Option<IdType>>,
    writer: Mutex<Option<BoxedWriter>>,
    closed: watch::Sender<bool>,
}

impl Session {
    /// Wrap the outbound half of a transport
    pub fn new<W>(peer: impl Into<String>, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id: AtomicU64::new(0),
            peer: peer.into(),
            connected_at: Utc::now(),
            player: Mutex::new(None),
            writer: Mutex::new(Some(Box::new(writer))),
            closed,
        })
    }

    /// Registry-assigned identifier, if registered
    pub fn id(&self) -> Option<ConnectionId> {
        match self.id.load(Ordering::Acquire) {
            0 => None,
            n => Some(ConnectionId(n)),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub async fn player(&self) -> Option<IdType> {
        *self.player.lock().await
    }

    pub async fn set_player(&self, player: Option<IdType>) {
        *self.player.lock().await = player;
    }

    /// Write `bytes` to the connection and flush
    ///
    /// A write stalled on a peer that stops reading is abandoned as soon as
    /// `close()` is called.
    ///
    /// # Errors
    /// - `MushError::SessionClosed`: the transport was closed before or during the write
    /// - `MushError::IoError`: the write failed
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        let closed = || MushError::SessionClosed(self.to_string());
        if self.is_closed() {
            return Err(closed());
        }

        let mut guard = tokio::select! {
            _ = self.closed() => return Err(closed()),
            guard = self.writer.lock() => guard,
        };
        let writer = guard.as_mut().ok_or_else(closed)?;

        tokio::select! {
            _ = self.closed() => {
                debug!("Abandoned write to {}", self);
                Err(closed())
            }
            written = async {
                writer.write_all(bytes).await?;
                writer.flush().await
            } => Ok(written?),
        }
    }

    /// Shut the transport down and wake anyone waiting in `closed()`
    ///
    /// The signal fires first, so a `send` blocked on a slow peer lets go of
    /// the writer. Safe to call more than once.
    pub async fn close(&self) {
        self.closed.send_replace(true);

        if let Some(mut writer) = self.writer.lock().await.take() {
            match timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Error shutting down {}: {}", self, e),
                Err(_) => debug!("Timed out shutting down {}", self),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once `close()` has been called
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "[{} {}]", id, self.peer),
            None => write!(f, "[- {}]", self.peer),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("peer", &self.peer)
            .field("connected_at", &self.connected_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug)]
struct RegistryInner {
    sessions: Vec<Arc<Session>>,
    next_id: u64,
    halted: bool,
}

/// Thread-safe directory of live sessions
#[derive(Debug)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                sessions: Vec::new(),
                next_id: 1,
                halted: false,
            }),
        }
    }

    /// Register `session` under a fresh identifier
    ///
    /// Opening a session that is already registered returns its existing
    /// identifier and changes nothing.
    ///
    /// # Errors
    /// - `MushError::RegistryHalted`: `shutdown()` has already run
    pub async fn open(&self, session: &Arc<Session>) -> Result<ConnectionId> {
        let mut inner = self.inner.write().await;
        if inner.halted {
            return Err(MushError::RegistryHalted);
        }

        if inner.sessions.iter().any(|s| Arc::ptr_eq(s, session)) {
            debug!("Session {} already registered", session);
            return session.id().ok_or(MushError::RegistryHalted);
        }

        let id = ConnectionId(inner.next_id);
        inner.next_id += 1;
        session.id.store(id.0, Ordering::Release);
        inner.sessions.push(Arc::clone(session));

        info!("Connection opened {} ({} open)", session, inner.sessions.len());
        Ok(id)
    }

    /// Remove `session`; absent sessions are ignored
    pub async fn close(&self, session: &Arc<Session>) {
        let mut inner = self.inner.write().await;
        let before = inner.sessions.len();
        inner.sessions.retain(|s| !Arc::ptr_eq(s, session));

        if inner.sessions.len() != before {
            info!("Connection closed {} ({} open)", session, inner.sessions.len());
        }
    }

    /// Point-in-time copy of the registered sessions
    pub async fn list(&self) -> Vec<Arc<Session>> {
        self.inner.read().await.sessions.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_halted(&self) -> bool {
        self.inner.read().await.halted
    }

    /// Send `bytes` to every session in one `list()` snapshot
    ///
    /// Delivery is best-effort: a session that fails or closes mid-broadcast
    /// simply misses the message. Returns how many sessions accepted it.
    pub async fn broadcast(&self, bytes: &[u8]) -> usize {
        let mut delivered = 0;
        for session in self.list().await {
            match session.send(bytes).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Broadcast to {} failed: {}", session, e),
            }
        }
        delivered
    }

    /// Force-close every registered transport and refuse further opens
    pub async fn shutdown(&self) {
        let sessions = {
            let mut inner = self.inner.write().await;
            inner.halted = true;
            std::mem::take(&mut inner.sessions)
        };

        info!("Closing {} open connections", sessions.len());
        for session in sessions {
            session.close().await;
        }
        if !self.is_empty().await {
            warn!("Sessions registered during shutdown");
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

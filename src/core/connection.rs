/// Per-connection context handed to a session handler
///
/// Wraps the telnet-filtered input side of one client together with its
/// registered `Session` (output side) and handles to the world store and the
/// session registry.

use crate::core::session::{Session, SessionRegistry};
use crate::core::world::WorldHandle;
use crate::error::Result;
use crate::network::telnet::{TelnetReader, DISABLE_LOCAL_ECHO, ENABLE_LOCAL_ECHO};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tracing::debug;

/// Longest line accepted from a client
pub const MAX_LINE_LENGTH: usize = 4096;

type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// One client as seen by a session handler
pub struct Connection {
    session: Arc<Session>,
    reader: BufReader<TelnetReader<BoxedReader>>,
    world: WorldHandle,
    registry: Arc<SessionRegistry>,
}

impl Connection {
    pub fn new<R>(
        reader: R,
        session: Arc<Session>,
        world: WorldHandle,
        registry: Arc<SessionRegistry>,
    ) -> Self
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        let reader: BoxedReader = Box::new(reader);
        Self {
            session,
            reader: BufReader::new(TelnetReader::new(reader)),
            world,
            registry,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn world(&self) -> &WorldHandle {
        &self.world
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Next line of input without its line terminator
    ///
    /// Returns `None` on end of stream or once the session has been closed.
    /// Over-long lines are cut at `MAX_LINE_LENGTH` bytes; the rest of such a
    /// line is discarded up to its newline without being buffered.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut buf = Vec::new();
        let read = tokio::select! {
            _ = self.session.closed() => {
                debug!("{} closed while reading", self.session);
                return Ok(None);
            }
            read = read_bounded_line(&mut self.reader, &mut buf) => read?,
        };

        if read == 0 {
            return Ok(None);
        }
        if read > buf.len() {
            debug!("{} sent a {} byte line; kept {}", self.session, read, buf.len());
        }

        let line = String::from_utf8_lossy(&buf);
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    /// Read a line with the client's local echo switched off
    pub async fn read_secret(&mut self) -> Result<Option<String>> {
        self.session.send(&DISABLE_LOCAL_ECHO).await?;
        let secret = self.read_line().await;
        self.session.send(&ENABLE_LOCAL_ECHO).await?;
        self.session.send(b"\r\n").await?;
        secret
    }

    /// Write text, translating `\n` to the telnet `\r\n`
    pub async fn print(&self, text: &str) -> Result<()> {
        self.session.send(to_wire(text).as_bytes()).await
    }

    pub async fn println(&self, text: &str) -> Result<()> {
        self.print(&format!("{}\n", text)).await
    }

    /// Send text to every registered session, including this one
    pub async fn wall(&self, text: &str) -> usize {
        self.registry.broadcast(to_wire(text).as_bytes()).await
    }
}

/// Like `read_until(b'\n')`, but keeps at most `MAX_LINE_LENGTH` bytes
///
/// Returns the number of bytes consumed from `reader`, which exceeds
/// `buf.len()` when the line was cut.
async fn read_bounded_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(consumed);
        }

        let (done, used) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (true, i + 1),
            None => (false, available.len()),
        };
        let room = MAX_LINE_LENGTH.saturating_sub(buf.len());
        buf.extend_from_slice(&available[..used.min(room)]);

        reader.consume(used);
        consumed += used;
        if done {
            return Ok(consumed);
        }
    }
}

fn to_wire(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

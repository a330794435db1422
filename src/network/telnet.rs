/// Telnet control-sequence filter
///
/// Strips IAC sequences from the raw input of a connection so the line reader
/// above it only ever sees application bytes:
/// - `IAC IAC`            => consumed, nothing emitted
/// - `IAC <cmd>`          => NOP, DM, BRK, IP, AYT, EC, EL, GA etc. (2 bytes)
/// - `IAC <verb> <opt>`   => WILL, WONT, DO, DONT, SB (3 bytes)
///
/// The state survives across reads, so a sequence split over two packets is
/// still removed completely.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tracing::trace;

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const GA: u8 = 249;
pub const EL: u8 = 248;
pub const EC: u8 = 247;
pub const AO: u8 = 246;
pub const AYT: u8 = 245;
pub const IP: u8 = 244;
pub const BRK: u8 = 243;
pub const DM: u8 = 242;
pub const NOP: u8 = 241;
pub const SE: u8 = 240;

/// Telnet ECHO option
pub const OPT_ECHO: u8 = 1;

/// Server will echo: the client stops echoing locally
pub const DISABLE_LOCAL_ECHO: [u8; 3] = [IAC, WILL, OPT_ECHO];

/// Server won't echo: the client resumes local echo
pub const ENABLE_LOCAL_ECHO: [u8; 3] = [IAC, WONT, OPT_ECHO];

/// Where the filter is inside a control sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterState {
    #[default]
    Idle,
    SawEscape,
    /// Waiting for the option byte that follows this verb
    SawEscapeAndVerb(u8),
}

/// Byte-at-a-time IAC stripper
#[derive(Debug, Default)]
pub struct TelnetFilter {
    state: FilterState,
}

impl TelnetFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    /// Feed one byte; returns it back if it is application data
    pub fn push(&mut self, byte: u8) -> Option<u8> {
        match self.state {
            FilterState::Idle => {
                if byte == IAC {
                    self.state = FilterState::SawEscape;
                    None
                } else {
                    Some(byte)
                }
            }
            FilterState::SawEscape => {
                match byte {
                    IAC => {
                        trace!("IAC IAC");
                        self.state = FilterState::Idle;
                    }
                    SB..=DONT => {
                        self.state = FilterState::SawEscapeAndVerb(byte);
                    }
                    _ => {
                        // Two-byte command; unknown codes are dropped the same way
                        trace!("IAC {}", byte);
                        self.state = FilterState::Idle;
                    }
                }
                None
            }
            FilterState::SawEscapeAndVerb(verb) => {
                trace!("IAC {} {}", verb, byte);
                self.state = FilterState::Idle;
                None
            }
        }
    }

    /// Filter a chunk into a new buffer
    pub fn filter(&mut self, input: &[u8]) -> Vec<u8> {
        input.iter().filter_map(|&b| self.push(b)).collect()
    }

    /// Filter `buf` in place, returning the length of the kept prefix
    pub fn filter_in_place(&mut self, buf: &mut [u8]) -> usize {
        let mut kept = 0;
        for i in 0..buf.len() {
            if let Some(b) = self.push(buf[i]) {
                buf[kept] = b;
                kept += 1;
            }
        }
        kept
    }
}

/// `AsyncRead` adaptor that removes telnet sequences from `inner`
#[derive(Debug)]
pub struct TelnetReader<R> {
    inner: R,
    filter: TelnetFilter,
}

impl<R> TelnetReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            filter: TelnetFilter::new(),
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TelnetReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            let start = buf.filled().len();
            match Pin::new(&mut this.inner).poll_read(cx, buf) {
                Poll::Ready(Ok(())) => {}
                other => return other,
            }

            let end = buf.filled().len();
            if end == start {
                // EOF
                return Poll::Ready(Ok(()));
            }

            let kept = this.filter.filter_in_place(&mut buf.filled_mut()[start..end]);
            buf.set_filled(start + kept);

            // A read made only of control bytes must not look like EOF
            if kept > 0 || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

    #[test]
    fn test_passes_plain_data() {
        let mut f = TelnetFilter::new();
        assert_eq!(f.filter(b"look north\r\n"), b"look north\r\n");
        assert_eq!(f.state(), FilterState::Idle);
    }

    #[test]
    fn test_strips_will_echo() {
        let mut f = TelnetFilter::new();
        assert_eq!(f.filter(&[255, 251, 1, b'h', b'i']), b"hi");
    }

    #[test]
    fn test_escaped_iac_is_consumed() {
        let mut f = TelnetFilter::new();
        assert_eq!(f.filter(&[b'a', IAC, IAC, b'b']), b"ab");
        assert_eq!(f.state(), FilterState::Idle);
    }

    #[test]
    fn test_two_byte_commands() {
        let mut f = TelnetFilter::new();
        for cmd in [NOP, DM, BRK, IP, AO, AYT, EC, EL, GA, SE] {
            assert_eq!(f.filter(&[b'x', IAC, cmd, b'y']), b"xy", "command {}", cmd);
        }
    }

    #[test]
    fn test_three_byte_negotiations() {
        let mut f = TelnetFilter::new();
        for verb in [WILL, WONT, DO, DONT, SB] {
            assert_eq!(f.filter(&[IAC, verb, 31, b'o', b'k']), b"ok", "verb {}", verb);
        }
    }

    #[test]
    fn test_option_byte_may_be_iac_valued() {
        let mut f = TelnetFilter::new();
        assert_eq!(f.filter(&[IAC, DO, 255, b'z']), b"z");
        assert_eq!(f.state(), FilterState::Idle);
    }

    #[test]
    fn test_sequence_split_across_chunks() {
        let mut f = TelnetFilter::new();
        assert_eq!(f.filter(&[b'a', IAC]), b"a");
        assert_eq!(f.state(), FilterState::SawEscape);

        assert!(f.filter(&[DO]).is_empty());
        assert_eq!(f.state(), FilterState::SawEscapeAndVerb(DO));

        assert_eq!(f.filter(&[24, b'b']), b"b");
        assert_eq!(f.state(), FilterState::Idle);
    }

    #[test]
    fn test_filter_in_place() {
        let mut f = TelnetFilter::new();
        let mut buf = vec![b'n', IAC, WILL, 3, b'o', IAC, NOP];
        let kept = f.filter_in_place(&mut buf);
        assert_eq!(&buf[..kept], b"no");
    }

    #[tokio::test]
    async fn test_reader_strips_fragmented_sequences() {
        let raw = tokio_test::io::Builder::new()
            .read(&[b'b', b'o', IAC])
            .read(&[WILL])
            .read(&[OPT_ECHO, b'b', b'\n'])
            .build();

        let mut line = String::new();
        BufReader::new(TelnetReader::new(raw))
            .read_line(&mut line)
            .await
            .unwrap();
        assert_eq!(line, "bob\n");
    }

    #[tokio::test]
    async fn test_reader_control_only_chunk_is_not_eof() {
        let raw = tokio_test::io::Builder::new()
            .read(&[IAC, DO, 24])
            .read(b"hi")
            .build();

        let mut out = Vec::new();
        TelnetReader::new(raw).read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hi");
    }

    proptest! {
        #[test]
        fn prop_data_without_iac_passes_through(data in proptest::collection::vec(0u8..255, 0..512)) {
            let mut f = TelnetFilter::new();
            prop_assert_eq!(f.filter(&data), data);
        }

        #[test]
        fn prop_output_never_longer_and_never_contains_iac(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let mut f = TelnetFilter::new();
            let out = f.filter(&data);
            prop_assert!(out.len() <= data.len());
            prop_assert!(!out.contains(&IAC));
        }

        #[test]
        fn prop_chunking_does_not_change_output(
            data in proptest::collection::vec(any::<u8>(), 0..256),
            split in 0usize..256,
        ) {
            let split = split.min(data.len());
            let whole = TelnetFilter::new().filter(&data);

            let mut f = TelnetFilter::new();
            let mut parts = f.filter(&data[..split]);
            parts.extend(f.filter(&data[split..]));
            prop_assert_eq!(parts, whole);
        }
    }
}

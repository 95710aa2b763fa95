// MIT License - Copyright (c) 2026 pico-sync contributors
// Telnet transport with option negotiation and AYT keepalive

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, trace, warn};

use crate::constants::{AYT, DO, DONT, IAC, OPT_TERMINAL_TYPE, OPT_WINDOW_SIZE, SB, SE, WILL, WONT};
use crate::error::{BoardError, Result};
use crate::transport::{Transport, TransportEvent, TransportEventSender, TransportEvents, TransportKind};

/// Terminal type reported when the server asks for it.
const TERMINAL_TYPE: &[u8] = b"ANSI";
/// Window size reported to the server: 200 columns, 64 rows.
const WINDOW_SIZE: [u8; 4] = [0, 200, 0, 64];
/// Sub-negotiation qualifier "SEND" (RFC 1091).
const TTYPE_SEND: u8 = 1;
/// Sub-negotiation qualifier "IS" (RFC 1091).
const TTYPE_IS: u8 = 0;

#[derive(Debug, Default)]
enum ParseState {
    #[default]
    Data,
    Iac,
    Option(u8),
    Sub(Vec<u8>),
    SubIac(Vec<u8>),
}

/// Result of feeding bytes through the telnet parser.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Parsed {
    /// Application payload
    pub data: Vec<u8>,
    /// Negotiation replies to write back to the server
    pub replies: Vec<u8>,
    /// The server answered an AYT
    pub ayt: bool,
}

/// Incremental telnet command parser. Commands may be split across reads.
#[derive(Debug, Default)]
pub struct TelnetParser {
    state: ParseState,
}

impl TelnetParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, input: &[u8]) -> Parsed {
        let mut parsed = Parsed::default();

        for &byte in input {
            self.state = match std::mem::take(&mut self.state) {
                ParseState::Data if byte == IAC => ParseState::Iac,
                ParseState::Data => {
                    parsed.data.push(byte);
                    ParseState::Data
                }
                ParseState::Iac => match byte {
                    IAC => {
                        parsed.data.push(IAC);
                        ParseState::Data
                    }
                    DO | DONT | WILL | WONT => ParseState::Option(byte),
                    SB => ParseState::Sub(Vec::new()),
                    AYT => {
                        parsed.ayt = true;
                        ParseState::Data
                    }
                    _ => ParseState::Data,
                },
                ParseState::Option(command) => {
                    negotiate(command, byte, &mut parsed.replies);
                    ParseState::Data
                }
                ParseState::Sub(buf) if byte == IAC => ParseState::SubIac(buf),
                ParseState::Sub(mut buf) => {
                    buf.push(byte);
                    ParseState::Sub(buf)
                }
                ParseState::SubIac(buf) if byte == SE => {
                    subnegotiate(&buf, &mut parsed.replies);
                    ParseState::Data
                }
                ParseState::SubIac(mut buf) if byte == IAC => {
                    buf.push(IAC);
                    ParseState::Sub(buf)
                }
                ParseState::SubIac(buf) => ParseState::Sub(buf),
            };
        }

        parsed
    }
}

fn negotiate(command: u8, option: u8, replies: &mut Vec<u8>) {
    match (command, option) {
        (DO, OPT_TERMINAL_TYPE) => {
            replies.extend_from_slice(&[IAC, WILL, OPT_TERMINAL_TYPE, IAC, WILL, OPT_WINDOW_SIZE]);
        }
        (DO, OPT_WINDOW_SIZE) => {
            replies.extend_from_slice(&[IAC, SB, OPT_WINDOW_SIZE]);
            replies.extend_from_slice(&WINDOW_SIZE);
            replies.extend_from_slice(&[IAC, SE]);
        }
        (DO, _) | (DONT, _) => replies.extend_from_slice(&[IAC, WONT, option]),
        (WILL, _) => replies.extend_from_slice(&[IAC, DO, option]),
        (WONT, _) => replies.extend_from_slice(&[IAC, DONT, option]),
        _ => {}
    }
}

fn subnegotiate(payload: &[u8], replies: &mut Vec<u8>) {
    if payload == [OPT_TERMINAL_TYPE, TTYPE_SEND] {
        replies.extend_from_slice(&[IAC, SB, OPT_TERMINAL_TYPE, TTYPE_IS]);
        replies.extend_from_slice(TERMINAL_TYPE);
        replies.extend_from_slice(&[IAC, SE]);
    }
}

/// Telnet session to a networked board.
pub struct TelnetTransport {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    ayt_pending: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    reader_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TelnetTransport {
    pub async fn connect(host: &str, port: u16) -> Result<(Self, TransportEvents)> {
        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            error!("Telnet connect failed: {}", e);
            BoardError::Io(e)
        })?;
        stream.set_nodelay(true)?;
        debug!("Telnet socket connected");

        let (reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));
        let ayt_pending = Arc::new(AtomicBool::new(false));
        let connected = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = spawn_reader_task(
            reader,
            writer.clone(),
            tx,
            ayt_pending.clone(),
            connected.clone(),
        );

        Ok((
            Self {
                writer,
                ayt_pending,
                connected,
                reader_handle: std::sync::Mutex::new(Some(handle)),
            },
            rx,
        ))
    }
}

#[async_trait]
impl Transport for TelnetTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Telnet
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(BoardError::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await.map_err(|e| {
            error!("Telnet write failed: {}", e);
            BoardError::Io(e)
        })
    }

    /// Sends IAC AYT. A ping fails while the previous AYT is unanswered.
    async fn send_ping(&self) -> Result<()> {
        if self.ayt_pending.load(Ordering::SeqCst) {
            return Err(BoardError::PingFailed);
        }
        self.ayt_pending.store(true, Ordering::SeqCst);
        self.send(&[IAC, AYT]).await
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!("Telnet shutdown: {}", e);
        }
        if let Ok(mut handle) = self.reader_handle.lock() {
            if let Some(handle) = handle.take() {
                handle.abort();
            }
        }
        // No close acknowledgement exists; give the socket time to wind down
        sleep(Duration::from_millis(200)).await;
        debug!("Telnet session closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for TelnetTransport {
    fn drop(&mut self) {
        if let Ok(mut handle) = self.reader_handle.lock() {
            if let Some(handle) = handle.take() {
                handle.abort();
            }
        }
    }
}

fn spawn_reader_task(
    mut reader: OwnedReadHalf,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    tx: TransportEventSender,
    ayt_pending: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        let mut parser = TelnetParser::new();

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!("Telnet reader: connection closed");
                    connected.store(false, Ordering::SeqCst);
                    let _ = tx.send(TransportEvent::Closed);
                    break;
                }
                Ok(n) => {
                    let parsed = parser.feed(&buf[..n]);
                    if parsed.ayt {
                        ayt_pending.store(false, Ordering::SeqCst);
                    }
                    if !parsed.replies.is_empty() {
                        trace!("Telnet negotiation reply: {:?}", parsed.replies);
                        if let Err(e) = writer.lock().await.write_all(&parsed.replies).await {
                            warn!("Failed to answer telnet negotiation: {}", e);
                        }
                    }
                    if !parsed.data.is_empty()
                        && tx.send(TransportEvent::Data(parsed.data)).is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    error!("Telnet read error: {}", e);
                    connected.store(false, Ordering::SeqCst);
                    let _ = tx.send(TransportEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_data_passes_through() {
        let mut parser = TelnetParser::new();
        let parsed = parser.feed(b"Login as: ");
        assert_eq!(parsed.data, b"Login as: ");
        assert!(parsed.replies.is_empty());
        assert!(!parsed.ayt);
    }

    #[test]
    fn test_do_terminal_type() {
        let mut parser = TelnetParser::new();
        let parsed = parser.feed(&[IAC, DO, OPT_TERMINAL_TYPE]);
        assert!(parsed.data.is_empty());
        assert_eq!(
            parsed.replies,
            vec![IAC, WILL, OPT_TERMINAL_TYPE, IAC, WILL, OPT_WINDOW_SIZE]
        );
    }

    #[test]
    fn test_do_window_size() {
        let mut parser = TelnetParser::new();
        let parsed = parser.feed(&[IAC, DO, OPT_WINDOW_SIZE]);
        assert_eq!(
            parsed.replies,
            vec![IAC, SB, OPT_WINDOW_SIZE, 0, 200, 0, 64, IAC, SE]
        );
    }

    #[test]
    fn test_will_and_wont() {
        let mut parser = TelnetParser::new();
        let parsed = parser.feed(&[IAC, WILL, 3, IAC, WONT, 1, IAC, DO, 1]);
        assert_eq!(
            parsed.replies,
            vec![IAC, DO, 3, IAC, DONT, 1, IAC, WONT, 1]
        );
    }

    #[test]
    fn test_terminal_type_subnegotiation() {
        let mut parser = TelnetParser::new();
        let parsed = parser.feed(&[IAC, SB, OPT_TERMINAL_TYPE, TTYPE_SEND, IAC, SE]);
        let mut expected = vec![IAC, SB, OPT_TERMINAL_TYPE, TTYPE_IS];
        expected.extend_from_slice(b"ANSI");
        expected.extend_from_slice(&[IAC, SE]);
        assert_eq!(parsed.replies, expected);
    }

    #[test]
    fn test_command_split_across_reads() {
        let mut parser = TelnetParser::new();
        let first = parser.feed(&[b'a', IAC]);
        assert_eq!(first.data, b"a");
        assert!(first.replies.is_empty());

        let second = parser.feed(&[WILL]);
        assert!(second.replies.is_empty());

        let third = parser.feed(&[1, b'b']);
        assert_eq!(third.replies, vec![IAC, DO, 1]);
        assert_eq!(third.data, b"b");
    }

    #[test]
    fn test_ayt_and_escaped_iac() {
        let mut parser = TelnetParser::new();
        let parsed = parser.feed(&[b'x', IAC, AYT, IAC, IAC, b'y']);
        assert!(parsed.ayt);
        assert_eq!(parsed.data, vec![b'x', IAC, b'y']);
    }
}

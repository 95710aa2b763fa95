// MIT License - Copyright (c) 2026 pico-sync contributors
// Byte transports to the board

pub mod mock;
pub mod serial;
pub mod socket;
pub mod telnet;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info};

use crate::config::BoardConfig;
use crate::error::{BoardError, Result};

pub use serial::{list_boards, list_target_boards, BoardPort};

/// Which kind of link a transport drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Serial,
    Telnet,
    Socket,
    Mock,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Serial => "serial",
            TransportKind::Telnet => "telnet",
            TransportKind::Socket => "socket",
            TransportKind::Mock => "mock",
        }
    }
}

/// Everything a transport reports back to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Payload bytes, with any link-level framing already removed
    Data(Vec<u8>),
    /// Remote end closed the link
    Closed,
    /// Link failed
    Error(String),
}

/// Receiving side of a transport's event stream.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;
/// Sending side, held by the transport's reader task.
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// A connected byte stream to a board.
///
/// Transports know nothing about the REPL. Incoming bytes are delivered on
/// the `TransportEvents` channel returned when the transport is opened.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Write bytes to the link.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Liveness probe. Errors count as a failed ping.
    async fn send_ping(&self) -> Result<()>;

    /// Discard anything buffered on the link.
    async fn flush(&self) -> Result<()>;

    /// Close the link. Safe to call more than once.
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Whether `address` names a serial port rather than a network host.
pub async fn is_serial_port(address: &str) -> bool {
    if address.starts_with("COM") || address.contains("tty") || address.contains("/dev") {
        return true;
    }
    tokio::fs::try_exists(address).await.unwrap_or(false)
}

/// Open the transport matching `address`: a serial port, a raw socket when
/// `raw_socket` is set, telnet otherwise.
pub async fn open(
    address: &str,
    config: &BoardConfig,
) -> Result<(Arc<dyn Transport>, TransportEvents)> {
    let connect_timeout = Duration::from_millis(config.connect_timeout_ms);

    let opened = if is_serial_port(address).await {
        info!("Opening serial port {}", address);
        timeout(connect_timeout, serial::SerialTransport::open(address, config)).await
            .map(|r| r.map(|(t, rx)| (Arc::new(t) as Arc<dyn Transport>, rx)))
    } else if config.raw_socket {
        info!("Opening raw socket to {}:{}", address, config.tcp_port);
        timeout(connect_timeout, socket::SocketTransport::connect(address, config.tcp_port)).await
            .map(|r| r.map(|(t, rx)| (Arc::new(t) as Arc<dyn Transport>, rx)))
    } else {
        info!("Opening telnet session to {}:{}", address, config.tcp_port);
        timeout(connect_timeout, telnet::TelnetTransport::connect(address, config.tcp_port)).await
            .map(|r| r.map(|(t, rx)| (Arc::new(t) as Arc<dyn Transport>, rx)))
    };

    match opened {
        Ok(Ok(pair)) => {
            debug!("Transport {} open", pair.0.kind().as_str());
            Ok(pair)
        }
        Ok(Err(e)) => {
            error!("Failed to open {}: {}", address, e);
            Err(e)
        }
        Err(_) => {
            error!("Timeout while connecting to {}", address);
            Err(BoardError::ConnectTimeout)
        }
    }
}

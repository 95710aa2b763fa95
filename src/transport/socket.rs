// MIT License - Copyright (c) 2026 pico-sync contributors
// Raw TCP socket transport

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::constants::ESC;
use crate::error::{BoardError, Result};
use crate::transport::{Transport, TransportEvent, TransportEventSender, TransportEvents, TransportKind};

/// Plain TCP stream. The board treats a lone ESC as a command prefix, so
/// every ESC in outgoing data is doubled.
pub struct SocketTransport {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    connected: Arc<AtomicBool>,
    reader_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SocketTransport {
    pub async fn connect(host: &str, port: u16) -> Result<(Self, TransportEvents)> {
        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            error!("Socket connect failed: {}", e);
            BoardError::Io(e)
        })?;
        stream.set_nodelay(true)?;
        debug!("Raw socket connected");

        let (reader, writer) = stream.into_split();
        let connected = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_reader_task(reader, tx, connected.clone());

        Ok((
            Self {
                writer: Arc::new(Mutex::new(writer)),
                connected,
                reader_handle: std::sync::Mutex::new(Some(handle)),
            },
            rx,
        ))
    }
}

/// Double every ESC byte.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        out.push(byte);
        if byte == ESC {
            out.push(ESC);
        }
    }
    out
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(BoardError::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&escape(data)).await.map_err(|e| {
            error!("Socket write failed: {}", e);
            BoardError::Io(e)
        })
    }

    async fn send_ping(&self) -> Result<()> {
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!("Socket shutdown: {}", e);
        }
        if let Ok(mut handle) = self.reader_handle.lock() {
            if let Some(handle) = handle.take() {
                handle.abort();
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for SocketTransport {
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
    tx: TransportEventSender,
    connected: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!("Socket reader: connection closed");
                    connected.store(false, Ordering::SeqCst);
                    let _ = tx.send(TransportEvent::Closed);
                    break;
                }
                Ok(n) => {
                    if tx.send(TransportEvent::Data(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Socket read error: {}", e);
                    connected.store(false, Ordering::SeqCst);
                    let _ = tx.send(TransportEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    })
}

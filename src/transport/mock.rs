// MIT License - Copyright (c) 2026 pico-sync contributors
// In-memory transport driven by a scripted responder

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{BoardError, Result};
use crate::transport::{Transport, TransportEvent, TransportEventSender, TransportEvents, TransportKind};

/// Produces the device's reply to each chunk written to the transport.
pub trait Responder: Send {
    fn respond(&mut self, data: &[u8]) -> Vec<u8>;
}

impl<F> Responder for F
where
    F: FnMut(&[u8]) -> Vec<u8> + Send,
{
    fn respond(&mut self, data: &[u8]) -> Vec<u8> {
        self(data)
    }
}

/// Transport for tests: every `send` is recorded and answered by the
/// responder; replies arrive on the event channel like real device output.
pub struct MockTransport {
    kind: TransportKind,
    responder: Mutex<Box<dyn Responder>>,
    events: TransportEventSender,
    sent: Mutex<Vec<Vec<u8>>>,
    connected: AtomicBool,
    ping_ok: AtomicBool,
}

impl MockTransport {
    pub fn new<R: Responder + 'static>(responder: R) -> (Arc<Self>, TransportEvents) {
        Self::with_kind(TransportKind::Mock, responder)
    }

    /// A mock that reports itself as `kind`, so serial-only paths run.
    pub fn with_kind<R: Responder + 'static>(
        kind: TransportKind,
        responder: R,
    ) -> (Arc<Self>, TransportEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            kind,
            responder: Mutex::new(Box::new(responder)),
            events: tx,
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            ping_ok: AtomicBool::new(true),
        });
        (transport, rx)
    }

    /// Deliver unsolicited device output.
    pub fn inject(&self, data: &[u8]) {
        let _ = self.events.send(TransportEvent::Data(data.to_vec()));
    }

    /// Simulate the remote end going away.
    pub fn close_remote(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Closed);
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.ping_ok.store(ok, Ordering::SeqCst);
    }

    /// Everything written so far, one entry per `send`.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Everything written so far, concatenated and decoded lossily.
    pub fn sent_text(&self) -> String {
        String::from_utf8_lossy(&self.sent().concat()).into_owned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(BoardError::NotConnected);
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(data.to_vec());
        }
        let reply = match self.responder.lock() {
            Ok(mut responder) => responder.respond(data),
            Err(_) => return Err(BoardError::ChannelClosed),
        };
        if !reply.is_empty() {
            self.events
                .send(TransportEvent::Data(reply))
                .map_err(|_| BoardError::ChannelClosed)?;
        }
        Ok(())
    }

    async fn send_ping(&self) -> Result<()> {
        if self.ping_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BoardError::PingFailed)
        }
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_responder_reply_is_delivered() {
        let (transport, mut events) = MockTransport::new(|data: &[u8]| {
            let mut echo = b"echo:".to_vec();
            echo.extend_from_slice(data);
            echo
        });

        transport.send(b"hi").await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Data(b"echo:hi".to_vec())));
        assert_eq!(transport.sent(), vec![b"hi".to_vec()]);
    }

    #[tokio::test]
    async fn test_send_after_disconnect_fails() {
        let (transport, _events) = MockTransport::new(|_: &[u8]| Vec::new());
        transport.disconnect().await.unwrap();
        assert!(matches!(transport.send(b"x").await, Err(BoardError::NotConnected)));
    }
}

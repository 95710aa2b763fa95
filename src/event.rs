// MIT License - Copyright (c) 2026 pico-sync contributors
// Board events

use crate::board::ReplStatus;
use crate::error::DeviceError;

/// All events that can be emitted by a board connection.
///
/// Users subscribe via `board.subscribe()` to receive a
/// `tokio::sync::broadcast::Receiver<BoardEvent>`.
#[derive(Debug, Clone, PartialEq)]
pub enum BoardEvent {
    /// Transport opened (and logged in, for telnet)
    Connected { address: String },
    /// Connection closed, either on request or by the remote end
    Disconnected,
    /// Keepalive pings failed; the connection has been torn down
    ConnectionLost,
    /// REPL mode changed after a confirmed mode-switch response
    StatusChanged(ReplStatus),
    /// Console output not consumed by a pending wait
    Output(String),
    /// Device reported an error while nothing was waiting for it
    DeviceError(DeviceError),
    /// Transport-level failure
    TransportError(String),
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<BoardEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<BoardEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}

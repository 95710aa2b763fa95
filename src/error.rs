// MIT License - Copyright (c) 2026 pico-sync contributors
// Error types

use std::fmt;

/// Errors reported by the device on its console, recognised by substring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceError {
    /// EHOSTDOWN
    HostDown,
    /// EHOSTUNREACH
    HostUnreachable,
    /// ECONNREFUSED
    ConnectionRefused,
    /// ECONNRESET
    ConnectionReset,
    /// EPIPE
    BrokenPipe,
    /// MemoryError
    MemoryError,
}

/// Substring table scanned on every receive, in priority order.
const DEVICE_ERROR_TABLE: [(&str, DeviceError); 6] = [
    ("EHOSTDOWN", DeviceError::HostDown),
    ("EHOSTUNREACH", DeviceError::HostUnreachable),
    ("ECONNREFUSED", DeviceError::ConnectionRefused),
    ("ECONNRESET", DeviceError::ConnectionReset),
    ("EPIPE", DeviceError::BrokenPipe),
    ("MemoryError", DeviceError::MemoryError),
];

impl DeviceError {
    /// Find the first known error marker contained in `text`.
    pub fn from_output(text: &str) -> Option<Self> {
        DEVICE_ERROR_TABLE
            .iter()
            .find(|(marker, _)| text.contains(marker))
            .map(|(_, err)| *err)
    }

    /// The marker as it appears in device output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostDown => "EHOSTDOWN",
            Self::HostUnreachable => "EHOSTUNREACH",
            Self::ConnectionRefused => "ECONNREFUSED",
            Self::ConnectionReset => "ECONNRESET",
            Self::BrokenPipe => "EPIPE",
            Self::MemoryError => "MemoryError",
        }
    }

    /// Human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::HostDown => "Host down",
            Self::HostUnreachable => "Host unreachable",
            Self::ConnectionRefused => "Connection refused",
            Self::ConnectionReset => "Connection was reset",
            Self::BrokenPipe => "Broken pipe",
            Self::MemoryError => "Not enough memory available on the board.",
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// All errors that can occur while talking to a board.
#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("Timeout while connecting")]
    ConnectTimeout,

    #[error("Not connected")]
    NotConnected,

    #[error("Ping failed")]
    PingFailed,

    #[error("Connection lost")]
    Disconnected,

    #[error("timeout waiting for response to {command:?}")]
    ProtocolTimeout { command: String },

    #[error("Another command is still waiting for its response")]
    WaitPending,

    #[error("{0}")]
    Device(DeviceError),

    #[error("Device raised an exception: {output}")]
    Traceback { output: String },

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Failed to write file: {message}")]
    Transfer { message: String },

    #[error("Hashes do not match between computer ({local}) and board ({board})")]
    HashMismatch { local: String, board: String },

    #[error("Invalid response: {details}")]
    InvalidResponse { details: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Unable to find sync folder {path}")]
    SyncFolderMissing { path: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Channel closed")]
    ChannelClosed,
}

impl BoardError {
    /// Whether a fresh connection attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BoardError::Io(_)
                | BoardError::SerialPort(_)
                | BoardError::ConnectTimeout
                | BoardError::Disconnected
                | BoardError::PingFailed
                | BoardError::ChannelClosed
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BoardError::ProtocolTimeout { .. })
    }

    /// Errors after which a transfer is retried only once the device has
    /// been safe-booted.
    pub fn is_memory_class(&self) -> bool {
        let message = self.to_string();
        message.contains("Not enough memory") || message.contains("OSError:")
    }
}

pub type Result<T> = std::result::Result<T, BoardError>;

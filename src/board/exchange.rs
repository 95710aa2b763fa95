// MIT License - Copyright (c) 2026 pico-sync contributors
// Receive buffer and single pending wait of a board connection

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::board::wait::{ReplStatus, WaitPattern};
use crate::constants::{
    EOT, FRIENDLY_PROMPT, INVALID_CREDENTIALS, MAX_BUFFER_LEN, RAW_REPL_BANNER,
};
use crate::error::{BoardError, DeviceError, Result};
use crate::event::BoardEvent;

/// Resolution channel of a pending wait: the whole receive buffer on match.
pub type WaitReply = oneshot::Receiver<Result<String>>;

struct PendingWait {
    pattern: WaitPattern,
    /// Mode entered once the pattern matches
    transition: Option<ReplStatus>,
    reply: oneshot::Sender<Result<String>>,
}

/// Protocol state shared between the transport reader and request callers.
///
/// Holds the REPL mode, the bounded receive buffer and at most one pending
/// wait. Every incoming chunk goes through `receive`, which resolves the
/// wait and reports the events to broadcast.
pub struct Exchange {
    status: ReplStatus,
    buffer: Vec<u8>,
    pending: Option<PendingWait>,
    /// Forward raw REPL program output while a wait is pending
    stream_output: bool,
    raw_started: bool,
    raw_streamed: usize,
    raw_eots: u8,
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Exchange {
    pub fn new() -> Self {
        Self {
            status: ReplStatus::Disconnected,
            buffer: Vec::new(),
            pending: None,
            stream_output: true,
            raw_started: false,
            raw_streamed: 0,
            raw_eots: 0,
        }
    }

    pub fn status(&self) -> ReplStatus {
        self.status
    }

    /// Change mode, returning the notification if it actually changed.
    pub fn set_status(&mut self, status: ReplStatus) -> Option<BoardEvent> {
        if self.status == status {
            return None;
        }
        debug!("REPL status {} -> {}", self.status, status);
        self.status = status;
        Some(BoardEvent::StatusChanged(status))
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_waiting(&self) -> bool {
        self.pending.is_some()
    }

    pub fn set_stream_output(&mut self, enabled: bool) {
        self.stream_output = enabled;
    }

    /// Register the single pending wait.
    ///
    /// Fails with `WaitPending` while another live wait exists. A wait whose
    /// caller has gone away is discarded.
    pub fn register(
        &mut self,
        pattern: WaitPattern,
        transition: Option<ReplStatus>,
        clear: bool,
    ) -> Result<WaitReply> {
        if let Some(existing) = &self.pending {
            if !existing.reply.is_closed() {
                return Err(BoardError::WaitPending);
            }
            debug!("Discarding abandoned wait for {}", existing.pattern);
        }

        if clear {
            self.buffer.clear();
        }
        self.raw_started = false;
        self.raw_streamed = 0;
        self.raw_eots = 0;

        trace!("Waiting for {}", pattern);
        let (tx, rx) = oneshot::channel();
        self.pending = Some(PendingWait {
            pattern,
            transition,
            reply: tx,
        });
        Ok(rx)
    }

    /// Try to satisfy the pending wait from what is already buffered.
    pub fn check(&mut self) -> Vec<BoardEvent> {
        let mut events = Vec::new();
        self.try_match(false, &mut events);
        events
    }

    /// Process one chunk of incoming bytes.
    pub fn receive(&mut self, msg: &[u8]) -> Vec<BoardEvent> {
        let mut events = Vec::new();
        if msg.is_empty() {
            return events;
        }

        let text = String::from_utf8_lossy(msg);
        if self.pending.is_none() {
            events.push(BoardEvent::Output(text.to_string()));
        }

        self.append(msg);

        if let Some(err) = DeviceError::from_output(&text) {
            warn!("Device reported {}", err.as_str());
            match self.pending.take() {
                Some(pending) => {
                    let _ = pending.reply.send(Err(BoardError::Device(err)));
                }
                None => events.push(BoardEvent::DeviceError(err)),
            }
            return events;
        }

        if self.pending.is_none() {
            return events;
        }

        if contains(&self.buffer, INVALID_CREDENTIALS.as_bytes()) {
            self.reject(BoardError::InvalidCredentials);
            return events;
        }

        if self.status == ReplStatus::RawRepl && self.stream_output {
            self.stream_raw_output(&mut events);
        }

        self.try_match(contains(msg, RAW_REPL_BANNER.as_bytes()), &mut events);
        events
    }

    /// Drop the pending wait and the buffer after a timeout.
    pub fn expire(&mut self) {
        self.pending = None;
        self.buffer.clear();
    }

    /// Fail the pending wait with `err`.
    pub fn reject(&mut self, err: BoardError) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Err(err));
        }
    }

    /// Forget the pending wait without resolving it.
    pub fn drop_pending(&mut self) {
        self.pending = None;
    }

    /// Fresh state for a new connection.
    pub fn reset(&mut self) {
        self.reject(BoardError::Disconnected);
        self.buffer.clear();
        self.raw_started = false;
        self.raw_streamed = 0;
        self.raw_eots = 0;
    }

    fn append(&mut self, msg: &[u8]) {
        self.buffer.extend_from_slice(msg);
        if self.buffer.len() > MAX_BUFFER_LEN {
            let excess = self.buffer.len() - MAX_BUFFER_LEN / 2;
            self.buffer.drain(..excess);
            self.raw_streamed = self.raw_streamed.saturating_sub(excess);
            trace!("Receive buffer trimmed to {} bytes", self.buffer.len());
        }
    }

    /// Forward program output of a raw REPL execution: everything after
    /// `OK`, without the EOT markers, up to the second EOT.
    fn stream_raw_output(&mut self, events: &mut Vec<BoardEvent>) {
        if !self.raw_started {
            let Some(pos) = find(&self.buffer, b"OK") else {
                return;
            };
            self.raw_started = true;
            self.raw_streamed = pos + 2;
        }

        let mut out = Vec::new();
        let mut i = self.raw_streamed;
        while i < self.buffer.len() && self.raw_eots < 2 {
            let byte = self.buffer[i];
            if byte == EOT as u8 {
                self.raw_eots += 1;
            } else {
                out.push(byte);
            }
            i += 1;
        }
        self.raw_streamed = i;

        if !out.is_empty() {
            events.push(BoardEvent::Output(String::from_utf8_lossy(&out).into_owned()));
        }
    }

    fn try_match(&mut self, msg_has_banner: bool, events: &mut Vec<BoardEvent>) {
        let Some(pending) = &self.pending else {
            return;
        };

        let matched = msg_has_banner
            || match &pending.pattern {
                WaitPattern::ByteLength(n) => self.buffer.len() >= *n,
                WaitPattern::Regex(re) => re.is_match(&self.buffer),
                WaitPattern::Literal(literal) => {
                    let found = contains(&self.buffer, literal.as_bytes());
                    match self.status {
                        ReplStatus::RawRepl => found,
                        // Outside the raw REPL input is echoed, so the literal
                        // only counts once a prompt or the raw banner follows.
                        _ => {
                            found
                                && (contains(&self.buffer, FRIENDLY_PROMPT.as_bytes())
                                    || contains(&self.buffer, RAW_REPL_BANNER.as_bytes()))
                        }
                    }
                }
            };

        if !matched {
            return;
        }

        if let Some(pending) = self.pending.take() {
            trace!("Matched {} after {} bytes", pending.pattern, self.buffer.len());
            if let Some(status) = pending.transition {
                events.extend(self.set_status(status));
            }
            let response = String::from_utf8_lossy(&self.buffer).into_owned();
            let _ = pending.reply.send(Ok(response));
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

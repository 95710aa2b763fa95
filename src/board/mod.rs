// MIT License - Copyright (c) 2026 pico-sync contributors
// REPL protocol engine

pub mod exchange;
pub mod wait;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{interval, sleep, timeout, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::authorize;
use crate::config::BoardConfig;
use crate::constants::{
    CTRL_A, CTRL_B, CTRL_C, CTRL_D, CTRL_E, CTRL_F, DEFAULT_WAIT_TIMEOUT_MS, FRIENDLY_BANNER,
    MAX_PING_FAILURES, PASTE_MODE_BANNER, RAW_REPL_BANNER,
};
use crate::error::{BoardError, Result};
use crate::event::{event_channel, BoardEvent, EventReceiver, EventSender};
use crate::transport::{self, Transport, TransportEvent, TransportEvents, TransportKind};

pub use exchange::Exchange;
pub use wait::{ReplStatus, WaitPattern};

use exchange::WaitReply;
use wait::{prepare_command, strip_friendly_framing, strip_raw_framing, transition_for, trim_indent};

const EVENT_CAPACITY: usize = 256;

/// Connection to one MicroPython board.
///
/// Cloning is cheap; clones share the same connection. At most one
/// request/response exchange runs at a time: `send_wait` and `wait_for`
/// are serialised by an internal lock, and console output that no request
/// consumes is broadcast as `BoardEvent::Output`.
#[derive(Clone)]
pub struct Board {
    config: Arc<BoardConfig>,
    exchange: Arc<Mutex<Exchange>>,
    transport: Arc<RwLock<Option<Arc<dyn Transport>>>>,
    /// Held for the whole of one request/response exchange
    request_lock: Arc<Mutex<()>>,
    event_tx: EventSender,
    address: Arc<RwLock<Option<String>>>,
    /// Stops the reader and ping tasks of the current connection
    shutdown: Arc<Mutex<Option<watch::Sender<bool>>>>,
    ping_failures: Arc<AtomicU32>,
}

impl Board {
    pub fn new(config: BoardConfig) -> Self {
        let (event_tx, _) = event_channel(EVENT_CAPACITY);
        Self {
            config: Arc::new(config),
            exchange: Arc::new(Mutex::new(Exchange::new())),
            transport: Arc::new(RwLock::new(None)),
            request_lock: Arc::new(Mutex::new(())),
            event_tx,
            address: Arc::new(RwLock::new(None)),
            shutdown: Arc::new(Mutex::new(None)),
            ping_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Subscribe to board events.
    pub fn subscribe(&self) -> EventReceiver {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub async fn status(&self) -> ReplStatus {
        self.exchange.lock().await.status()
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.read().await.is_some()
    }

    /// Whether a wait is pending.
    pub async fn is_waiting(&self) -> bool {
        self.exchange.lock().await.is_waiting()
    }

    pub async fn address(&self) -> Option<String> {
        self.address.read().await.clone()
    }

    pub async fn transport_kind(&self) -> Option<TransportKind> {
        self.transport.read().await.as_ref().map(|t| t.kind())
    }

    pub async fn is_serial(&self) -> bool {
        self.transport_kind().await == Some(TransportKind::Serial)
    }

    /// Forward raw REPL program output as events while waiting.
    pub async fn set_stream_output(&self, enabled: bool) {
        self.exchange.lock().await.set_stream_output(enabled);
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Connect to `address`: a serial port name, or a host for telnet
    /// (or raw socket when configured). Transient failures are retried with
    /// exponential back-off up to `max_connect_retries` times.
    pub async fn connect(&self, address: &str) -> Result<()> {
        if self.is_connected().await {
            self.disconnect().await?;
        }
        *self.address.write().await = Some(address.to_string());

        let max_retries = self.config.max_connect_retries;
        let base_delay = Duration::from_millis(self.config.reconnect_delay_ms);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = match transport::open(address, &self.config).await {
                Ok((transport, events)) => self.connect_transport(address, transport, events).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt <= max_retries => {
                    let delay = base_delay * (1 << (attempt - 1).min(4));
                    warn!(
                        "Connection attempt {}/{} failed: {}. Retrying in {:?}...",
                        attempt,
                        max_retries + 1,
                        e,
                        delay
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    error!("Failed to connect to {}: {}", address, e);
                    return Err(e);
                }
            }
        }
    }

    /// Take over an already opened transport and bring the session up:
    /// telnet login, optional Ctrl-C, keepalive pings.
    pub async fn connect_transport(
        &self,
        address: &str,
        transport: Arc<dyn Transport>,
        events: TransportEvents,
    ) -> Result<()> {
        let kind = transport.kind();
        *self.address.write().await = Some(address.to_string());
        self.attach(transport, events).await;

        if kind == TransportKind::Telnet {
            if let Err(e) = authorize::login(self).await {
                error!("Login to {} failed: {}", address, e);
                self.teardown().await;
                return Err(e);
            }
        }

        self.update_status(ReplStatus::Connected).await;
        self.ping_failures.store(0, Ordering::SeqCst);

        if self.config.ctrl_c_on_connect && kind != TransportKind::Socket {
            if let Err(e) = self.stop_running_programs().await {
                warn!("Ctrl-C on connect got no prompt: {}", e);
            }
        }

        self.start_pings().await;
        info!("Connected to {} over {}", address, kind.as_str());
        let _ = self.event_tx.send(BoardEvent::Connected {
            address: address.to_string(),
        });
        Ok(())
    }

    /// Close the connection. The transport is dropped, not reused.
    pub async fn disconnect(&self) -> Result<()> {
        let was_connected = self.is_connected().await;
        self.teardown().await;
        if was_connected {
            info!("Disconnected");
            let _ = self.event_tx.send(BoardEvent::Disconnected);
        }
        Ok(())
    }

    /// Tear the connection down and open it again on the same address.
    pub async fn reconnect(&self) -> Result<()> {
        let address = self.address().await.ok_or(BoardError::NotConnected)?;
        info!("Reconnecting to {}", address);
        self.disconnect().await?;
        self.connect(&address).await
    }

    /// Replace the connection with one to another device.
    pub async fn switch_device(&self, address: &str) -> Result<()> {
        info!("Switching to {}", address);
        self.disconnect().await?;
        self.connect(address).await
    }

    async fn attach(&self, transport: Arc<dyn Transport>, events: TransportEvents) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        if let Some(previous) = self.shutdown.lock().await.replace(shutdown_tx) {
            let _ = previous.send(true);
        }

        self.exchange.lock().await.reset();
        *self.transport.write().await = Some(transport);
        spawn_reader_task(self.clone(), events, shutdown_rx);
    }

    async fn teardown(&self) {
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            let _ = shutdown.send(true);
        }

        let transport = self.transport.write().await.take();
        if let Some(transport) = transport {
            if let Err(e) = transport.disconnect().await {
                warn!("Error while closing transport: {}", e);
            }
        }

        let mut exchange = self.exchange.lock().await;
        exchange.reject(BoardError::Disconnected);
        if let Some(event) = exchange.set_status(ReplStatus::Disconnected) {
            let _ = self.event_tx.send(event);
        }
    }

    async fn update_status(&self, status: ReplStatus) {
        if let Some(event) = self.exchange.lock().await.set_status(status) {
            let _ = self.event_tx.send(event);
        }
    }

    async fn start_pings(&self) {
        if self.config.ping_interval_ms == 0 {
            return;
        }
        let Some(mut shutdown) = self.shutdown.lock().await.as_ref().map(|tx| tx.subscribe()) else {
            return;
        };

        let board = self.clone();
        let period = Duration::from_millis(self.config.ping_interval_ms);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let Some(transport) = board.transport.read().await.clone() else {
                            break;
                        };
                        match transport.send_ping().await {
                            Ok(()) => board.ping_failures.store(0, Ordering::SeqCst),
                            Err(e) => {
                                let failures = board.ping_failures.fetch_add(1, Ordering::SeqCst) + 1;
                                debug!("Ping failed ({}): {}", failures, e);
                                if failures >= MAX_PING_FAILURES {
                                    warn!("Connection lost");
                                    board.ping_failures.store(0, Ordering::SeqCst);
                                    let _ = board.event_tx.send(BoardEvent::ConnectionLost);
                                    let _ = board.disconnect().await;
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            debug!("Ping task stopped");
        });
    }

    async fn current_transport(&self) -> Result<Arc<dyn Transport>> {
        self.transport.read().await.clone().ok_or(BoardError::NotConnected)
    }

    // -----------------------------------------------------------------------
    // Request / response
    // -----------------------------------------------------------------------

    /// Write bytes without waiting for anything.
    pub async fn send(&self, data: &str) -> Result<()> {
        self.current_transport().await?.send(data.as_bytes()).await
    }

    /// Forward what the user typed in a terminal.
    pub async fn send_user_input(&self, data: &str) -> Result<()> {
        self.send(data).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.current_transport().await?.flush().await
    }

    /// Send `command` and wait until `pattern` shows up in the response.
    ///
    /// Without a pattern, waits for the raw REPL end marker in raw mode and
    /// for the echoed command otherwise. A line break is appended unless the
    /// command is a bare control character; in raw mode Ctrl-D is appended
    /// to execute it. `timeout_ms == 0` waits forever.
    ///
    /// Returns the response with REPL framing stripped.
    pub async fn send_wait(
        &self,
        command: &str,
        pattern: Option<WaitPattern>,
        timeout_ms: u64,
    ) -> Result<String> {
        let _request = self.request_lock.lock().await;
        let transport = self.current_transport().await?;

        let (prepared, reply) = {
            let mut exchange = self.exchange.lock().await;
            let status = exchange.status();
            let pattern = match pattern {
                Some(pattern) => pattern,
                None if status == ReplStatus::RawRepl => WaitPattern::raw_prompt()?,
                None => WaitPattern::literal(command),
            };
            let prepared = prepare_command(command, status);
            let reply = exchange.register(pattern, transition_for(command, status), true)?;
            (prepared, reply)
        };

        if let Err(e) = transport.send(prepared.as_bytes()).await {
            error!("Failed to send command: {}", e);
            self.exchange.lock().await.expire();
            return Err(e);
        }

        let received = self.await_reply(reply, command, timeout_ms).await?;

        if self.status().await == ReplStatus::RawRepl {
            Ok(strip_raw_framing(&received))
        } else {
            Ok(strip_friendly_framing(&received, &prepared))
        }
    }

    /// Wait for `pattern` without sending anything. Output received before
    /// the call counts towards the match.
    pub async fn wait_for(&self, pattern: WaitPattern, timeout_ms: u64) -> Result<String> {
        let _request = self.request_lock.lock().await;
        let label = pattern.to_string();

        let reply = {
            let mut exchange = self.exchange.lock().await;
            let reply = exchange.register(pattern, None, false)?;
            for event in exchange.check() {
                let _ = self.event_tx.send(event);
            }
            reply
        };

        self.await_reply(reply, &label, timeout_ms).await
    }

    /// Forget the pending wait; its caller gets `Cancelled`.
    pub async fn stop_waiting_silent(&self) {
        self.exchange.lock().await.drop_pending();
    }

    async fn await_reply(&self, reply: WaitReply, command: &str, timeout_ms: u64) -> Result<String> {
        let outcome = if timeout_ms == 0 {
            reply.await
        } else {
            match timeout(Duration::from_millis(timeout_ms), reply).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("Timeout waiting for response to {:?}", command);
                    self.exchange.lock().await.expire();
                    return Err(BoardError::ProtocolTimeout {
                        command: command.to_string(),
                    });
                }
            }
        };

        outcome.map_err(|_| BoardError::Cancelled)?
    }

    // -----------------------------------------------------------------------
    // REPL modes
    // -----------------------------------------------------------------------

    /// Enter the raw REPL (Ctrl-A) without resetting the board.
    pub async fn enter_raw_repl_no_reset(&self) -> Result<()> {
        self.flush().await?;
        info!("Entering raw REPL");
        self.send_wait(CTRL_A, Some(WaitPattern::literal(RAW_REPL_BANNER)), DEFAULT_WAIT_TIMEOUT_MS)
            .await
            .map(|_| ())
    }

    /// Leave the raw REPL (Ctrl-B).
    pub async fn enter_friendly_repl(&self) -> Result<()> {
        self.send_wait(CTRL_B, Some(WaitPattern::literal("\r\n>>>")), DEFAULT_WAIT_TIMEOUT_MS)
            .await
            .map(|_| ())
    }

    /// Leave the raw REPL and wait for the full friendly banner, then show a
    /// fresh prompt on the console.
    pub async fn enter_friendly_repl_wait(&self) -> Result<()> {
        self.send_wait(CTRL_B, Some(WaitPattern::literal(FRIENDLY_BANNER)), DEFAULT_WAIT_TIMEOUT_MS)
            .await?;
        let _ = self.event_tx.send(BoardEvent::Output("\r\n>>> ".to_string()));
        Ok(())
    }

    /// Leave the raw REPL in the background. The mode switch is queued
    /// behind any running request.
    pub fn enter_friendly_repl_non_blocking(&self) {
        let board = self.clone();
        tokio::spawn(async move {
            if let Err(e) = board.enter_friendly_repl().await {
                warn!("Leaving raw REPL failed: {}", e);
            }
        });
    }

    /// Soft reset (Ctrl-D) and wait for the board to come back.
    pub async fn soft_reset(&self, timeout_ms: u64) -> Result<String> {
        info!("Soft reset");
        let timeout_ms = if timeout_ms == 0 { DEFAULT_WAIT_TIMEOUT_MS } else { timeout_ms };
        let pattern = if self.status().await == ReplStatus::RawRepl {
            WaitPattern::literal(">")
        } else {
            WaitPattern::literal(FRIENDLY_BANNER)
        };
        self.send_wait(CTRL_D, Some(pattern), timeout_ms).await
    }

    /// Soft reset without waiting for the board.
    pub async fn soft_reset_no_follow(&self) -> Result<()> {
        info!("Soft reset (no follow)");
        self.send(CTRL_D).await
    }

    /// Restart without running boot.py/main.py (Ctrl-F).
    pub async fn safe_boot(&self, timeout_ms: u64) -> Result<()> {
        info!("Safe boot");
        self.send_wait(CTRL_F, Some(WaitPattern::literal(FRIENDLY_BANNER)), timeout_ms)
            .await
            .map(|_| ())
    }

    /// Interrupt the running program (Ctrl-C) and wait for a prompt.
    pub async fn stop_running_programs(&self) -> Result<()> {
        self.send_wait(CTRL_C, Some(WaitPattern::literal(">>>")), DEFAULT_WAIT_TIMEOUT_MS)
            .await
            .map(|_| ())
    }

    /// Two Ctrl-C in a row, for programs that catch the first one.
    pub async fn stop_running_programs_double(&self, timeout_ms: u64) -> Result<()> {
        let command = format!("{CTRL_C}{CTRL_C}");
        self.send_wait(&command, Some(WaitPattern::literal(">>>")), timeout_ms)
            .await
            .map(|_| ())
    }

    /// Ctrl-C without waiting for anything.
    pub async fn stop_running_programs_no_follow(&self) -> Result<()> {
        info!("CTRL-C (no follow)");
        self.send(&format!("{CTRL_C}\r\n")).await
    }

    // -----------------------------------------------------------------------
    // Running code
    // -----------------------------------------------------------------------

    /// Execute code in the raw REPL and return its output (stdout followed
    /// by stderr). The friendly REPL is restored afterwards unless the board
    /// was already in raw mode. Waits for as long as the code runs.
    pub async fn run(&self, code: &str) -> Result<String> {
        let already_raw = self.status().await == ReplStatus::RawRepl;

        match self.run_inner(code, already_raw).await {
            Ok(output) => Ok(output),
            Err(e) => {
                error!("Run failed: {}", e);
                if let Err(reset_err) = self.soft_reset_no_follow().await {
                    debug!("Soft reset after failed run: {}", reset_err);
                }
                Err(e)
            }
        }
    }

    async fn run_inner(&self, code: &str, already_raw: bool) -> Result<String> {
        if !already_raw {
            self.stop_running_programs().await?;
            self.enter_raw_repl_no_reset().await?;
        }

        // Short sleep so the end marker cannot arrive before we wait for it
        let code = format!("{code}\r\nimport time\r\ntime.sleep(0.1)");
        let output = self.send_wait(&code, None, 0).await?;

        if !already_raw {
            self.enter_friendly_repl_wait().await?;
        }
        Ok(output)
    }

    /// Run a selection of code, first removing its common indentation.
    pub async fn run_selection(&self, code: &str) -> Result<String> {
        self.run(&trim_indent(code)).await
    }

    /// Run code through paste mode (Ctrl-E ... Ctrl-D) in the friendly REPL.
    pub async fn paste(&self, code: &str) -> Result<String> {
        if self.status().await == ReplStatus::RawRepl {
            self.enter_friendly_repl().await?;
        }
        self.send_wait(CTRL_E, Some(WaitPattern::exact(PASTE_MODE_BANNER)?), DEFAULT_WAIT_TIMEOUT_MS)
            .await?;

        let body = code.replace("\r\n", "\n").replace('\n', "\r\n");
        self.send(&body).await?;
        if !body.ends_with("\r\n") {
            self.send("\r\n").await?;
        }

        self.send_wait(CTRL_D, Some(WaitPattern::literal(">>> ")), 0).await
    }

    /// Run code in the raw REPL the board is already in.
    pub async fn exec_raw(&self, code: &str, timeout_ms: u64) -> Result<String> {
        self.send_wait(code, None, timeout_ms).await
    }
}

fn spawn_reader_task(
    board: Board,
    mut events: TransportEvents,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(TransportEvent::Data(bytes)) => {
                        let emitted = board.exchange.lock().await.receive(&bytes);
                        for event in emitted {
                            let _ = board.event_tx.send(event);
                        }
                    }
                    Some(TransportEvent::Error(message)) => {
                        error!("Transport error: {}", message);
                        let _ = board.event_tx.send(BoardEvent::TransportError(message));
                        let _ = board.disconnect().await;
                        break;
                    }
                    Some(TransportEvent::Closed) | None => {
                        info!("Connection closed by the board");
                        let _ = board.disconnect().await;
                        break;
                    }
                },
            }
        }
        debug!("Reader task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn test_config() -> BoardConfig {
        BoardConfig::builder().ping_interval_ms(0).build()
    }

    /// Minimal REPL: answers Ctrl-A/Ctrl-B/Ctrl-C and echoes raw code output.
    fn repl_responder(data: &[u8]) -> Vec<u8> {
        match data {
            b"\x01" => b"\r\nraw REPL; CTRL-B to exit\r\n>".to_vec(),
            b"\x02" => b"\r\nMicroPython v1.22\r\nType \"help()\" for more information.\r\n>>> ".to_vec(),
            b"\x03" => b"\r\n>>> ".to_vec(),
            code if code.ends_with(b"\x04") => b"OKhi\r\n\x04\x04>".to_vec(),
            _ => Vec::new(),
        }
    }

    async fn connected_board<R>(responder: R) -> (Board, Arc<MockTransport>)
    where
        R: crate::transport::mock::Responder + 'static,
    {
        let board = Board::new(test_config());
        let (transport, events) = MockTransport::new(responder);
        board
            .connect_transport("mock", transport.clone(), events)
            .await
            .unwrap();
        (board, transport)
    }

    #[tokio::test]
    async fn test_connect_sets_connected_status() {
        let (board, _transport) = connected_board(repl_responder).await;
        assert_eq!(board.status().await, ReplStatus::Connected);
        assert!(board.is_connected().await);
        assert_eq!(board.address().await.as_deref(), Some("mock"));
    }

    #[tokio::test]
    async fn test_timeout_clears_pending_wait() {
        let (board, transport) = connected_board(|_: &[u8]| Vec::new()).await;

        let result = board
            .send_wait("foo", Some(WaitPattern::literal("BAR")), 100)
            .await;

        assert!(matches!(result, Err(BoardError::ProtocolTimeout { .. })));
        assert!(!board.is_waiting().await);
        assert!(transport.is_connected());
        assert_eq!(transport.sent(), vec![b"foo\r\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_raw_repl_round_trip() {
        let (board, transport) = connected_board(repl_responder).await;

        board.enter_raw_repl_no_reset().await.unwrap();
        assert_eq!(board.status().await, ReplStatus::RawRepl);

        let output = board.exec_raw("print('hi')", 1000).await.unwrap();
        assert_eq!(output, "hi\r\n");
        assert!(transport.sent_text().contains("print('hi')\r\n\x04"));

        board.enter_friendly_repl().await.unwrap();
        assert_eq!(board.status().await, ReplStatus::FriendlyRepl);
    }

    #[tokio::test]
    async fn test_run_restores_friendly_repl() {
        let (board, transport) = connected_board(repl_responder).await;
        let mut events = board.subscribe();

        let output = board.run("print('hi')").await.unwrap();
        assert_eq!(output, "hi\r\n");
        assert_eq!(board.status().await, ReplStatus::FriendlyRepl);
        assert!(transport.sent_text().contains("time.sleep(0.1)\r\n\x04"));

        let mut saw_raw = false;
        while let Ok(event) = events.try_recv() {
            if event == BoardEvent::StatusChanged(ReplStatus::RawRepl) {
                saw_raw = true;
            }
        }
        assert!(saw_raw);
    }

    #[tokio::test]
    async fn test_echo_without_prompt_does_not_answer() {
        let (board, _transport) = connected_board(|data: &[u8]| {
            let mut reply = data.to_vec();
            reply.extend_from_slice(b"1\r\n");
            reply
        })
        .await;
        assert_eq!(board.status().await, ReplStatus::Connected);

        let result = board.send_wait("print(1)", None, 300).await;

        assert!(matches!(result, Err(BoardError::ProtocolTimeout { .. })));
        assert_eq!(board.status().await, ReplStatus::Connected);
    }

    #[tokio::test]
    async fn test_unanswered_mode_switch_keeps_status() {
        let (board, _transport) = connected_board(|_: &[u8]| Vec::new()).await;
        board.update_status(ReplStatus::FriendlyRepl).await;

        let result = board
            .send_wait(CTRL_A, Some(WaitPattern::literal(RAW_REPL_BANNER)), 50)
            .await;
        assert!(result.is_err());
        assert_eq!(board.status().await, ReplStatus::FriendlyRepl);
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_serialised() {
        let (board, transport) = connected_board(|data: &[u8]| {
            let mut reply = data.to_vec();
            reply.extend_from_slice(b">>> ");
            reply
        })
        .await;
        board.update_status(ReplStatus::FriendlyRepl).await;

        let first = board.clone();
        let second = board.clone();
        let (a, b) = tokio::join!(
            first.send_wait("one", None, 1000),
            second.send_wait("two", None, 1000)
        );

        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_waiting_silent_cancels_caller() {
        let (board, _transport) = connected_board(|_: &[u8]| Vec::new()).await;

        let waiter = board.clone();
        let handle = tokio::spawn(async move {
            waiter.send_wait("loop()", Some(WaitPattern::literal("never")), 0).await
        });

        while !board.is_waiting().await {
            tokio::task::yield_now().await;
        }
        board.stop_waiting_silent().await;

        assert!(matches!(handle.await.unwrap(), Err(BoardError::Cancelled)));
    }

    #[tokio::test]
    async fn test_remote_close_disconnects() {
        let (board, transport) = connected_board(repl_responder).await;
        let mut events = board.subscribe();

        transport.close_remote();

        loop {
            match events.recv().await.unwrap() {
                BoardEvent::Disconnected => break,
                _ => continue,
            }
        }
        assert!(!board.is_connected().await);
        assert_eq!(board.status().await, ReplStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_old_reader_leaves_new_connection_alone() {
        let (board, first) = connected_board(repl_responder).await;

        board.disconnect().await.unwrap();
        first.close_remote();
        let (second, events) = MockTransport::new(repl_responder);
        board.connect_transport("mock", second, events).await.unwrap();

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(board.is_connected().await);
        assert_eq!(board.status().await, ReplStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failed_pings_drop_connection() {
        let board = Board::new(BoardConfig::builder().ping_interval_ms(5_000).build());
        let (transport, events) = MockTransport::new(|_: &[u8]| Vec::new());
        board
            .connect_transport("mock", transport.clone(), events)
            .await
            .unwrap();
        let mut board_events = board.subscribe();

        transport.set_ping_ok(false);

        loop {
            match board_events.recv().await.unwrap() {
                BoardEvent::ConnectionLost => break,
                _ => continue,
            }
        }
        tokio::task::yield_now().await;
        sleep(Duration::from_millis(10)).await;
        assert!(!board.is_connected().await);
    }

    #[tokio::test]
    async fn test_console_output_is_broadcast() {
        let (board, transport) = connected_board(repl_responder).await;
        let mut events = board.subscribe();

        transport.inject(b"hello from main.py\r\n");

        loop {
            if let BoardEvent::Output(text) = events.recv().await.unwrap() {
                assert_eq!(text, "hello from main.py\r\n");
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let board = Board::new(test_config());
        assert!(matches!(
            board.send_wait("x", None, 10).await,
            Err(BoardError::NotConnected)
        ));
    }
}

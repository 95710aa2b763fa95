// MIT License - Copyright (c) 2026 pico-sync contributors
// File-system operations on the board through the raw REPL

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use tokio::sync::{Notify, OnceCell};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use crate::board::{Board, ReplStatus};
use crate::config::SyncConfig;
use crate::constants::CTRL_D;
use crate::error::{BoardError, Result};
use crate::file_writer::FileWriter;
use crate::snippets::{Snippet, PROBE_OK, READ_SEGMENT_LEN};
use crate::transport::TransportKind;

const READ_TIMEOUT_MS: u64 = 60_000;
const LIST_TIMEOUT_MS: u64 = 10_000;
const MKDIR_TIMEOUT_MS: u64 = 30_000;
const COMMAND_TIMEOUT_MS: u64 = 5_000;
const SAFE_BOOT_TIMEOUT_MS: u64 = 4_000;
const INTERRUPT_GRACE: Duration = Duration::from_secs(1);

/// Kind of a remote directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    File,
    Dir,
    /// `os.stat` failed on the board
    Unreadable,
}

/// One entry returned by `Shell::list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Path relative to the board root, without leading slash
    pub path: String,
    pub kind: RemoteKind,
    pub size: u64,
    pub hash: Option<String>,
}

#[derive(Deserialize)]
struct ListedEntry(String, String, u64, Option<String>);

/// A file-system session on the board.
///
/// Opening the shell puts the board in the raw REPL; `exit` brings it back
/// to the friendly REPL (or resets it). Long operations check an interrupt
/// flag between device round-trips so `stop_working` never leaves the board
/// half-way through a command.
pub struct Shell {
    board: Board,
    config: Arc<SyncConfig>,
    mcu_root_folder: String,
    working: AtomicBool,
    interrupted: AtomicBool,
    interrupt_done: Notify,
    hashlib: OnceCell<bool>,
}

/// Marks the shell busy for the lifetime of one operation. An interrupt
/// that arrives too late to be seen is acknowledged when the work ends.
struct WorkingGuard<'a>(&'a Shell);

impl Drop for WorkingGuard<'_> {
    fn drop(&mut self) {
        self.0.working.store(false, Ordering::SeqCst);
        if self.0.interrupted.swap(false, Ordering::SeqCst) {
            self.0.interrupt_done.notify_one();
        }
    }
}

impl Shell {
    pub fn new(board: Board, config: Arc<SyncConfig>) -> Self {
        Self {
            board,
            config,
            mcu_root_folder: "/".to_string(),
            working: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            interrupt_done: Notify::new(),
            hashlib: OnceCell::new(),
        }
    }

    /// Create a shell and enter the raw REPL.
    pub async fn open(board: Board, config: Arc<SyncConfig>) -> Result<Self> {
        let shell = Self::new(board, config);
        shell.initialise().await?;
        Ok(shell)
    }

    /// Enter the raw REPL. Transfer payloads are not echoed as console
    /// output while the shell is open.
    pub async fn initialise(&self) -> Result<()> {
        debug!("Entering raw mode for shell");
        self.board.set_stream_output(false).await;
        if self.board.status().await != ReplStatus::RawRepl {
            self.board.enter_raw_repl_no_reset().await?;
        }
        Ok(())
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn mcu_root_folder(&self) -> &str {
        &self.mcu_root_folder
    }

    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    fn begin_work(&self) -> WorkingGuard<'_> {
        self.working.store(true, Ordering::SeqCst);
        WorkingGuard(self)
    }

    /// Between two steps of a long operation: bail out if interrupted.
    pub fn check_interrupt(&self) -> Result<()> {
        if self.interrupted.swap(false, Ordering::SeqCst) {
            info!("Shell operation interrupted");
            self.working.store(false, Ordering::SeqCst);
            self.interrupt_done.notify_one();
            return Err(BoardError::Cancelled);
        }
        Ok(())
    }

    /// Ask the running operation to stop and wait up to one second for it
    /// to reach a safe point. Returns false if it did not get there in time.
    pub async fn stop_working(&self) -> bool {
        if !self.is_working() {
            debug!("Shell not working, nothing to interrupt");
            return true;
        }
        info!("Interrupting running shell operation");
        self.interrupted.store(true, Ordering::SeqCst);
        let stopped = timeout(INTERRUPT_GRACE, self.interrupt_done.notified()).await.is_ok();
        if !stopped {
            info!("Interrupt timed out, continuing anyway");
        }
        self.interrupted.store(false, Ordering::SeqCst);
        stopped
    }

    /// Run code and return its raw output.
    pub async fn eval(&self, code: &str, timeout_ms: u64) -> Result<String> {
        self.board.send_wait(code, None, timeout_ms).await
    }

    async fn exec(&self, snippet: Snippet<'_>, timeout_ms: u64) -> Result<String> {
        let output = self.eval(&snippet.render(), timeout_ms).await?;
        if output.contains("Traceback (") {
            debug!("Board raised: {}", output.trim_end());
            return Err(BoardError::Traceback { output });
        }
        Ok(output)
    }

    pub async fn get_free_space(&self) -> Result<u64> {
        let output = self
            .exec(Snippet::FreeSpace { root: &self.mcu_root_folder }, COMMAND_TIMEOUT_MS)
            .await?;
        output.trim().parse().map_err(|_| BoardError::InvalidResponse {
            details: format!("free space: {output:?}"),
        })
    }

    /// Make sure every parent folder of `path` exists.
    pub async fn ensure_directory(&self, path: &str) -> Result<()> {
        let parent = match path.trim_start_matches('/').rsplit_once('/') {
            Some((parent, _)) => parent,
            None => return Ok(()),
        };
        self.create_dir_all(parent).await
    }

    /// Create `path` and all missing parents.
    pub async fn create_dir_all(&self, path: &str) -> Result<()> {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.is_empty() {
            return Ok(());
        }
        let folders = (1..=parts.len()).map(|i| parts[..i].join("/")).collect();
        self.exec(Snippet::EnsureFolders { folders }, MKDIR_TIMEOUT_MS)
            .await
            .map(|_| ())
    }

    /// Read a whole file, one segment per round-trip.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let _working = self.begin_work();
        let mut content = Vec::new();

        loop {
            self.check_interrupt()?;
            let snippet = Snippet::ReadFile {
                path,
                offset: content.len() as u64,
                length: READ_SEGMENT_LEN,
                chunk_size: self.config.chunk_size(),
            };
            let output = self.eval(&snippet.render(), READ_TIMEOUT_MS).await?;

            // A soft reset sometimes leaves its "OK" in front of the data
            let output = output.strip_prefix("OK").unwrap_or(&output);
            if output.contains("Traceback (") {
                debug!("Traceback reading {}: {}", path, output.trim_end());
                return Err(BoardError::Traceback {
                    output: output.to_string(),
                });
            }

            let segment = decode_base64_lines(output)?;
            let done = segment.len() < READ_SEGMENT_LEN;
            content.extend_from_slice(&segment);
            if done {
                break;
            }
        }

        debug!("Read {} bytes from {}", content.len(), path);
        Ok(content)
    }

    /// Write a file in chunks, verifying and retrying as configured.
    pub async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let _working = self.begin_work();
        FileWriter::new(self).write(path, content).await
    }

    /// Whether the board can compute SHA-256 hashes. Probed once per shell.
    pub async fn supports_hashing(&self) -> Result<bool> {
        self.hashlib
            .get_or_try_init(|| async {
                let output = self.eval(&Snippet::ProbeHashlib.render(), COMMAND_TIMEOUT_MS).await?;
                Ok::<_, BoardError>(!output.contains("Traceback") && output.contains(PROBE_OK))
            })
            .await
            .copied()
    }

    /// List `root`, optionally walking subdirectories, one device call per
    /// directory. Paths are relative to the board root.
    pub async fn list(&self, root: &str, recursive: bool, hash: bool) -> Result<Vec<RemoteEntry>> {
        let _working = self.begin_work();
        let mut entries = Vec::new();
        let mut queue = VecDeque::from([root.to_string()]);

        while let Some(dir) = queue.pop_front() {
            self.check_interrupt()?;
            let output = self.exec(Snippet::ListDir { path: &dir, hash }, LIST_TIMEOUT_MS).await?;
            let listed: Vec<ListedEntry> = serde_json::from_str(output.trim())?;

            for ListedEntry(name, kind, size, file_hash) in listed {
                if name.contains('\0') {
                    continue;
                }
                let full = join_remote(&dir, &name);
                let kind = match kind.as_str() {
                    "d" => RemoteKind::Dir,
                    "f" => RemoteKind::File,
                    _ => RemoteKind::Unreadable,
                };
                if kind == RemoteKind::Dir && recursive {
                    queue.push_back(full.clone());
                }
                entries.push(RemoteEntry {
                    path: self.relative_path(&full),
                    kind,
                    size,
                    hash: file_hash,
                });
            }
        }

        Ok(entries)
    }

    fn relative_path(&self, full: &str) -> String {
        let root = self.mcu_root_folder.trim_end_matches('/');
        full.strip_prefix(root)
            .unwrap_or(full)
            .trim_start_matches('/')
            .trim_start_matches("./")
            .to_string()
    }

    pub async fn remove_file(&self, path: &str) -> Result<()> {
        self.exec(Snippet::RemoveFile { path }, COMMAND_TIMEOUT_MS).await.map(|_| ())
    }

    pub async fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        self.exec(Snippet::RenameFile { from, to }, COMMAND_TIMEOUT_MS).await.map(|_| ())
    }

    pub async fn make_dir(&self, path: &str) -> Result<()> {
        self.exec(Snippet::MakeDir { path }, COMMAND_TIMEOUT_MS).await.map(|_| ())
    }

    pub async fn change_dir(&self, path: &str) -> Result<()> {
        self.exec(Snippet::ChangeDir { path }, COMMAND_TIMEOUT_MS).await.map(|_| ())
    }

    pub async fn remove_dir(&self, path: &str) -> Result<()> {
        self.exec(Snippet::RemoveDir { path }, COMMAND_TIMEOUT_MS).await.map(|_| ())
    }

    /// Hex SHA-256 of a file on the board.
    pub async fn hash_file(&self, path: &str) -> Result<String> {
        let snippet = Snippet::HashFile {
            path,
            chunk_size: self.config.chunk_size(),
        };
        self.exec(snippet, COMMAND_TIMEOUT_MS).await.map(|h| h.trim().to_string())
    }

    /// Hard reset the board, then reconnect.
    pub async fn reset(&self) -> Result<()> {
        info!("Resetting board");
        self.board.send(&format!("{}\r\n", Snippet::Reset.render())).await?;
        self.board.send(CTRL_D).await?;
        sleep(Duration::from_secs(1)).await;
        self.board.reconnect().await
    }

    /// Safe boot to free memory, then go back to the raw REPL.
    pub async fn safeboot_restart(&self) -> Result<()> {
        self.board.safe_boot(SAFE_BOOT_TIMEOUT_MS).await?;
        self.board.enter_raw_repl_no_reset().await
    }

    /// Stop any running operation and close the shell.
    pub async fn exit(&self) -> Result<()> {
        self.stop_working().await;
        let closed = self.clean_close().await;
        self.board.set_stream_output(true).await;
        closed
    }

    /// Reset the board if configured, otherwise return to the friendly REPL.
    pub async fn clean_close(&self) -> Result<()> {
        info!("Closing shell cleanly");
        if self.config.reboot_after_upload {
            info!("Rebooting after upload");
            return self.reset().await;
        }
        self.close().await
    }

    /// Return to the friendly REPL. Network connections are closed.
    pub async fn close(&self) -> Result<()> {
        self.board.enter_friendly_repl().await?;
        self.board.send("\r\n").await?;
        info!("Closed successfully");

        if self.board.transport_kind().await != Some(TransportKind::Serial) {
            self.board.disconnect().await?;
        }
        Ok(())
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn decode_base64_lines(output: &str) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        data.extend(BASE64.decode(line).map_err(|e| {
            warn!("Undecodable line from board: {:?}", line);
            BoardError::Base64(e)
        })?);
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoardConfig;
    use crate::event::BoardEvent;
    use crate::transport::mock::MockTransport;

    fn raw_responder(reply: &'static str) -> impl FnMut(&[u8]) -> Vec<u8> + Send {
        move |data: &[u8]| match data {
            b"\x01" => b"raw REPL; CTRL-B to exit\r\n>".to_vec(),
            b"\x02" => b"\r\n>>> ".to_vec(),
            _ => format!("OK{reply}\x04\x04>").into_bytes(),
        }
    }

    async fn open_shell(reply: &'static str) -> (Shell, Arc<MockTransport>) {
        let board = Board::new(BoardConfig::builder().ping_interval_ms(0).build());
        let (transport, events) = MockTransport::new(raw_responder(reply));
        board.connect_transport("mock", transport.clone(), events).await.unwrap();
        let shell = Shell::open(board, Arc::new(SyncConfig::default())).await.unwrap();
        (shell, transport)
    }

    #[test]
    fn test_decode_base64_lines() {
        assert_eq!(decode_base64_lines("aGVs\r\nbG8=\r\n").unwrap(), b"hello".to_vec());
        assert!(decode_base64_lines("").unwrap().is_empty());
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/", "lib"), "/lib");
        assert_eq!(join_remote("/lib", "x.py"), "/lib/x.py");
    }

    #[tokio::test]
    async fn test_open_enters_raw_repl() {
        let (shell, _transport) = open_shell("").await;
        assert_eq!(shell.board().status().await, ReplStatus::RawRepl);
    }

    #[tokio::test]
    async fn test_read_file_decodes_content() {
        let (shell, _transport) = open_shell("aGVsbG8=\r\n").await;
        assert_eq!(shell.read_file("main.py").await.unwrap(), b"hello".to_vec());
        assert!(!shell.is_working());
    }

    #[tokio::test]
    async fn test_transfers_are_not_broadcast() {
        let (shell, _transport) = open_shell("aGVsbG8=\r\n").await;
        let mut events = shell.board().subscribe();

        shell.read_file("main.py").await.unwrap();

        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, BoardEvent::Output(_)), "unexpected {event:?}");
        }

        shell.exit().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_file_traceback() {
        let (shell, _transport) = open_shell(
            "\x04Traceback (most recent call last):\r\nOSError: [Errno 2] ENOENT\r\n",
        )
        .await;
        assert!(matches!(
            shell.read_file("missing.py").await,
            Err(BoardError::Traceback { .. })
        ));
    }

    #[tokio::test]
    async fn test_free_space() {
        let (shell, _transport) = open_shell("1441792").await;
        assert_eq!(shell.get_free_space().await.unwrap(), 1_441_792);
    }

    #[tokio::test]
    async fn test_list_flat() {
        let (shell, _transport) =
            open_shell("[[\"main.py\", \"f\", 12, null], [\"lib\", \"d\", 0, null]]\r\n").await;
        let entries = shell.list("/", false, false).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "main.py");
        assert_eq!(entries[0].size, 12);
        assert_eq!(entries[1].kind, RemoteKind::Dir);
    }

    #[tokio::test]
    async fn test_ensure_directory_skips_top_level_files() {
        let (shell, transport) = open_shell("").await;
        let before = transport.sent().len();
        shell.ensure_directory("main.py").await.unwrap();
        assert_eq!(transport.sent().len(), before);

        shell.ensure_directory("lib/net/wifi.py").await.unwrap();
        let sent = transport.sent_text();
        assert!(sent.contains("ensureFolder('lib')\r\nensureFolder('lib/net')"));
    }

    #[tokio::test]
    async fn test_stop_working_when_idle_returns_immediately() {
        let (shell, _transport) = open_shell("").await;
        assert!(shell.stop_working().await);
        assert!(shell.check_interrupt().is_ok());
    }
}

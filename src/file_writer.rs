// MIT License - Copyright (c) 2026 pico-sync contributors
// Chunked file upload with hash verification and retry

use sha2::{Digest, Sha256};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{BoardError, Result};
use crate::shell::Shell;
use crate::snippets::Snippet;

const CHUNK_TIMEOUT_MS: u64 = 10_000;

/// Writes one file to the board: open, one round-trip per base64 chunk,
/// close, then compare SHA-256 hashes when the file is small enough and the
/// firmware has `uhashlib`.
pub struct FileWriter<'a> {
    shell: &'a Shell,
}

impl<'a> FileWriter<'a> {
    pub fn new(shell: &'a Shell) -> Self {
        Self { shell }
    }

    /// Write `content` to `board_path`, retrying failed attempts.
    ///
    /// Out-of-memory and `OSError` failures safe-boot the board before the
    /// next attempt; other failures wait `retry_delay_ms`. The last error is
    /// returned once `max_retries` attempts have failed.
    pub async fn write(&self, board_path: &str, content: &[u8]) -> Result<()> {
        let config = self.shell.config();
        let max_attempts = config.max_retries.max(1);
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            match self.write_once(board_path, content).await {
                Ok(()) => {
                    debug!(
                        "Wrote {} ({} bytes) in {:?}",
                        board_path,
                        content.len(),
                        started.elapsed()
                    );
                    return Ok(());
                }
                Err(BoardError::Cancelled) => return Err(BoardError::Cancelled),
                Err(e) => {
                    warn!("Writing {} failed (attempt {}/{}): {}", board_path, attempt, max_attempts, e);
                    if let Err(close_err) = self.close_file().await {
                        debug!("Closing after failed write: {}", close_err);
                    }

                    if attempt >= max_attempts {
                        error!("Giving up on {}", board_path);
                        return Err(e);
                    }

                    if e.is_memory_class() {
                        info!("Board is low on memory, safe booting before retry");
                        if let Err(boot_err) = self.shell.safeboot_restart().await {
                            warn!("Safe boot failed: {}", boot_err);
                        }
                    } else {
                        sleep(Duration::from_millis(config.retry_delay_ms)).await;
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn write_once(&self, board_path: &str, content: &[u8]) -> Result<()> {
        let local_hash = if self.can_hash(content).await? {
            Some(hex::encode(Sha256::digest(content)))
        } else {
            None
        };

        self.shell.ensure_directory(board_path).await?;
        self.run_checked(&Snippet::OpenForWrite { path: board_path }.render()).await?;

        for chunk in content.chunks(self.shell.config().chunk_size()) {
            self.shell.check_interrupt()?;
            self.run_checked(&Snippet::WriteChunk { data: chunk }.render()).await?;
        }

        self.close_file().await?;

        if let Some(local) = local_hash {
            self.check_hash(board_path, local).await?;
        }
        Ok(())
    }

    async fn can_hash(&self, content: &[u8]) -> Result<bool> {
        let size_kb = (content.len() as f64 / 1000.0).round();
        if size_kb >= self.shell.config().hash_check_max_size_kb as f64 {
            return Ok(false);
        }
        self.shell.supports_hashing().await
    }

    async fn close_file(&self) -> Result<()> {
        self.run_checked(&Snippet::CloseFile.render()).await
    }

    async fn check_hash(&self, board_path: &str, local: String) -> Result<()> {
        let board = self.shell.hash_file(board_path).await?;
        if board != local {
            error!("Local hash ({}) differs from board hash ({})", local, board);
            return Err(BoardError::HashMismatch { local, board });
        }
        Ok(())
    }

    async fn run_checked(&self, code: &str) -> Result<()> {
        let output = self.shell.eval(code, CHUNK_TIMEOUT_MS).await?;
        match transfer_error(&output) {
            Some(message) => Err(BoardError::Transfer { message }),
            None => Ok(()),
        }
    }
}

/// The error line of a failed write, if the output reports one.
fn transfer_error(output: &str) -> Option<String> {
    if !output.contains("Traceback") && !output.contains("Error: ") {
        return None;
    }
    let message = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or("unknown error");
    Some(message.to_string())
}

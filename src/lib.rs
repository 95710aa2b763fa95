// MIT License - Copyright (c) 2026 pico-sync contributors
// MicroPython REPL protocol engine and project sync
//
//! # pico-sync
//!
//! Talks to MicroPython boards (Raspberry Pi Pico and friends) over a serial
//! port, telnet or a raw TCP socket.
//!
//! The [`Board`] drives the REPL: it switches between the friendly and raw
//! REPL, runs code and matches device output against one pending wait at a
//! time. On top of it, a [`Shell`] turns file-system operations into
//! injected MicroPython snippets and [`SyncSession`] mirrors a local project
//! folder to the board, tracking what is there in an on-device manifest.
//!
//! ## Quick Start
//!
//! ```no_run
//! use pico_sync::{Board, BoardConfig, SyncConfig, SyncSession};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let board = Board::new(BoardConfig::default());
//!     board.connect("/dev/ttyACM0").await?;
//!
//!     let output = board.run("print(1 + 1)").await?;
//!     println!("{output}");
//!
//!     let sync = SyncSession::new(board.clone(), SyncConfig::default(), "./my-project");
//!     let report = sync.upload(None).await?;
//!     println!("{} files written", report.written);
//!
//!     board.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod authorize;
pub mod board;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod file_writer;
pub mod project_status;
pub mod shell;
pub mod snippets;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use board::{Board, ReplStatus, WaitPattern};
pub use config::{BoardConfig, BoardConfigBuilder, SyncConfig, SyncConfigBuilder};
pub use error::{BoardError, DeviceError, Result};
pub use event::{BoardEvent, EventReceiver};
pub use project_status::{Changes, EntryKind, HashEntry, ProjectStatus, SyncFilter};
pub use shell::{RemoteEntry, RemoteKind, Shell};
pub use sync::{DownloadMode, ProgressFn, SyncReport, SyncSession};
pub use transport::{list_boards, list_target_boards, BoardPort, Transport, TransportKind};

// MIT License - Copyright (c) 2026 pico-sync contributors
// Command line front end

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};

use pico_sync::config::{
    DEFAULT_HASH_CHECK_MAX_SIZE_KB, DEFAULT_MANIFEST_NAME, DEFAULT_MAX_RETRIES, DEFAULT_UPLOAD_CHUNK_SIZE,
};
use pico_sync::constants::DEFAULT_TCP_PORT;
use pico_sync::{
    list_boards, list_target_boards, Board, BoardConfig, DownloadMode, RemoteKind, Shell, SyncConfig,
    SyncReport, SyncSession,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "pico-sync")]
#[command(about = "Run code on a MicroPython board and sync project files to it")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "pico-sync.toml")]
    config: String,

    /// Serial port or host of the board (overrides the config file)
    #[arg(long, short, env = "PICO_SYNC_DEVICE")]
    device: Option<String>,

    /// Project folder
    #[arg(long, short, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List serial ports, boards first
    Ports {
        /// Only ports from known board manufacturers
        #[arg(long)]
        boards_only: bool,
    },
    /// Run a local Python file on the board
    Run { file: PathBuf },
    /// Execute a line of Python on the board
    Exec { code: String },
    /// Upload changed project files, or just the given files
    Upload { files: Vec<PathBuf> },
    /// Download board files into the project
    Download {
        /// Skip files that already exist locally
        #[arg(long)]
        only_new: bool,
    },
    /// List files on the board
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file from the board
    Cat { path: String },
    /// Remove a file from the board
    Rm { path: String },
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct Config {
    #[serde(default)]
    board: BoardToml,
    #[serde(default)]
    sync: SyncToml,
}

#[derive(Debug, Deserialize)]
struct BoardToml {
    /// Serial port or host; autodetected over USB when omitted
    #[serde(default)]
    address: Option<String>,
    #[serde(default = "default_connect_timeout")]
    connect_timeout_ms: u64,
    #[serde(default = "default_username")]
    username: String,
    #[serde(default = "default_password")]
    password: String,
    #[serde(default = "default_tcp_port")]
    tcp_port: u16,
    #[serde(default = "default_baud_rate")]
    baud_rate: u32,
    #[serde(default)]
    raw_socket: bool,
    #[serde(default)]
    ctrl_c_on_connect: bool,
    #[serde(default = "default_ping_interval")]
    ping_interval_ms: u64,
    #[serde(default = "default_reconnect_delay")]
    reconnect_delay_ms: u64,
    #[serde(default)]
    max_connect_retries: u32,
    #[serde(default = "default_manufacturers")]
    autoconnect_manufacturers: Vec<String>,
}

impl Default for BoardToml {
    fn default() -> Self {
        Self {
            address: None,
            connect_timeout_ms: default_connect_timeout(),
            username: default_username(),
            password: default_password(),
            tcp_port: default_tcp_port(),
            baud_rate: default_baud_rate(),
            raw_socket: false,
            ctrl_c_on_connect: false,
            ping_interval_ms: default_ping_interval(),
            reconnect_delay_ms: default_reconnect_delay(),
            max_connect_retries: 0,
            autoconnect_manufacturers: default_manufacturers(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    15000
}
fn default_username() -> String {
    "micro".to_string()
}
fn default_password() -> String {
    "python".to_string()
}
fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}
fn default_baud_rate() -> u32 {
    115200
}
fn default_ping_interval() -> u64 {
    5000
}
fn default_reconnect_delay() -> u64 {
    1000
}
fn default_manufacturers() -> Vec<String> {
    BoardConfig::default().autoconnect_manufacturers
}

#[derive(Debug, Deserialize)]
struct SyncToml {
    #[serde(default)]
    sync_folder: String,
    #[serde(default = "default_file_types")]
    sync_file_types: Vec<String>,
    #[serde(default)]
    sync_all_file_types: bool,
    #[serde(default = "default_py_ignore")]
    py_ignore: Vec<String>,
    #[serde(default = "default_chunk_size")]
    upload_chunk_size: usize,
    #[serde(default)]
    fast_upload: bool,
    #[serde(default = "default_hash_check_max_size")]
    hash_check_max_size_kb: usize,
    #[serde(default)]
    safe_boot_on_upload: bool,
    #[serde(default)]
    reboot_after_upload: bool,
    #[serde(default = "default_manifest_name")]
    manifest_name: String,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
}

impl Default for SyncToml {
    fn default() -> Self {
        Self {
            sync_folder: String::new(),
            sync_file_types: default_file_types(),
            sync_all_file_types: false,
            py_ignore: default_py_ignore(),
            upload_chunk_size: default_chunk_size(),
            fast_upload: false,
            hash_check_max_size_kb: default_hash_check_max_size(),
            safe_boot_on_upload: false,
            reboot_after_upload: false,
            manifest_name: default_manifest_name(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_file_types() -> Vec<String> {
    SyncConfig::default().sync_file_types
}
fn default_py_ignore() -> Vec<String> {
    SyncConfig::default().py_ignore
}
fn default_chunk_size() -> usize {
    DEFAULT_UPLOAD_CHUNK_SIZE
}
fn default_hash_check_max_size() -> usize {
    DEFAULT_HASH_CHECK_MAX_SIZE_KB
}
fn default_manifest_name() -> String {
    DEFAULT_MANIFEST_NAME.to_string()
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn load_config(path: &str) -> Result<Config> {
    match std::fs::read_to_string(path) {
        Ok(text) => toml::from_str(&text).context("Failed to parse config file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No config file at {path}, using defaults");
            Ok(Config::default())
        }
        Err(e) => Err(e).context("Failed to read config file"),
    }
}

fn build_board_config(toml: &BoardToml) -> BoardConfig {
    BoardConfig::builder()
        .connect_timeout_ms(toml.connect_timeout_ms)
        .username(&toml.username)
        .password(&toml.password)
        .tcp_port(toml.tcp_port)
        .baud_rate(toml.baud_rate)
        .raw_socket(toml.raw_socket)
        .ctrl_c_on_connect(toml.ctrl_c_on_connect)
        .ping_interval_ms(toml.ping_interval_ms)
        .reconnect_delay_ms(toml.reconnect_delay_ms)
        .max_connect_retries(toml.max_connect_retries)
        .autoconnect_manufacturers(toml.autoconnect_manufacturers.clone())
        .build()
}

fn build_sync_config(toml: &SyncToml) -> SyncConfig {
    SyncConfig::builder()
        .sync_folder(&toml.sync_folder)
        .sync_file_types(toml.sync_file_types.clone())
        .sync_all_file_types(toml.sync_all_file_types)
        .py_ignore(toml.py_ignore.clone())
        .upload_chunk_size(toml.upload_chunk_size)
        .fast_upload(toml.fast_upload)
        .hash_check_max_size_kb(toml.hash_check_max_size_kb)
        .safe_boot_on_upload(toml.safe_boot_on_upload)
        .reboot_after_upload(toml.reboot_after_upload)
        .manifest_name(&toml.manifest_name)
        .max_retries(toml.max_retries)
        .build()
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn resolve_address(cli: &Cli, config: &Config, board_config: &BoardConfig) -> Result<String> {
    if let Some(address) = cli.device.clone().or_else(|| config.board.address.clone()) {
        return Ok(address);
    }
    let ports = list_target_boards(&board_config.autoconnect_manufacturers)
        .context("Failed to list serial ports")?;
    let port = ports
        .into_iter()
        .next()
        .context("No board found; pass --device or set board.address")?;
    info!("Autodetected {} ({})", port.name, port.manufacturer);
    Ok(port.name)
}

async fn connect(cli: &Cli, config: &Config) -> Result<Board> {
    let board_config = build_board_config(&config.board);
    let address = resolve_address(cli, config, &board_config)?;
    let board = Board::new(board_config);
    board
        .connect(&address)
        .await
        .with_context(|| format!("Failed to connect to {address}"))?;
    Ok(board)
}

/// Cancel the session on Ctrl-C.
fn stop_on_ctrl_c(session: &Arc<SyncSession>) -> tokio::task::JoinHandle<()> {
    let session = Arc::clone(session);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping sync");
            session.stop().await;
        }
    })
}

fn print_report(action: &str, report: &SyncReport) {
    if report.cancelled {
        println!("{action} cancelled after {} files", report.written);
    } else {
        println!("{action} done: {} written, {} deleted", report.written, report.deleted);
    }
    for path in &report.failed {
        println!("  failed: {path}");
    }
}

fn absolute(project: &Path, file: &Path) -> PathBuf {
    if file.is_absolute() {
        file.to_path_buf()
    } else {
        project.join(file)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=pico_sync=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match &cli.command {
        Command::Ports { boards_only } => {
            let manufacturers = build_board_config(&config.board).autoconnect_manufacturers;
            let ports = if *boards_only {
                list_target_boards(&manufacturers)
            } else {
                list_boards(&manufacturers)
            }
            .context("Failed to list serial ports")?;
            for port in ports {
                println!("{}\t{}", port.name, port.manufacturer);
            }
        }
        Command::Run { file } => {
            let code = std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let board = connect(&cli, &config).await?;
            let output = board.run(&code).await.context("Run failed")?;
            print!("{output}");
            board.disconnect().await?;
        }
        Command::Exec { code } => {
            let board = connect(&cli, &config).await?;
            let output = board.run(code).await.context("Exec failed")?;
            print!("{output}");
            board.disconnect().await?;
        }
        Command::Upload { files } => {
            let board = connect(&cli, &config).await?;
            let files = if files.is_empty() {
                None
            } else {
                Some(files.iter().map(|f| absolute(&cli.project, f)).collect())
            };
            let session = Arc::new(SyncSession::new(
                board.clone(),
                build_sync_config(&config.sync),
                &cli.project,
            ));
            let watcher = stop_on_ctrl_c(&session);
            let report = session.upload(files).await.context("Upload failed")?;
            watcher.abort();
            print_report("Upload", &report);
            board.disconnect().await?;
        }
        Command::Download { only_new } => {
            let board = connect(&cli, &config).await?;
            let mode = if *only_new { DownloadMode::OnlyNew } else { DownloadMode::All };
            let session = Arc::new(SyncSession::new(
                board.clone(),
                build_sync_config(&config.sync),
                &cli.project,
            ));
            let watcher = stop_on_ctrl_c(&session);
            let report = session.download(mode).await.context("Download failed")?;
            watcher.abort();
            print_report("Download", &report);
            board.disconnect().await?;
        }
        Command::Ls { path } => {
            let board = connect(&cli, &config).await?;
            let shell = Shell::open(board.clone(), Arc::new(build_sync_config(&config.sync))).await?;
            let entries = shell.list(path, true, false).await;
            shell.exit().await?;
            for entry in entries.context("Listing failed")? {
                let marker = match entry.kind {
                    RemoteKind::Dir => "/",
                    RemoteKind::File => "",
                    RemoteKind::Unreadable => " (unreadable)",
                };
                println!("{:>8}  {}{}", entry.size, entry.path, marker);
            }
            board.disconnect().await?;
        }
        Command::Cat { path } => {
            let board = connect(&cli, &config).await?;
            let shell = Shell::open(board.clone(), Arc::new(build_sync_config(&config.sync))).await?;
            let content = shell.read_file(path).await;
            shell.exit().await?;
            print!("{}", String::from_utf8_lossy(&content.context("Read failed")?));
            board.disconnect().await?;
        }
        Command::Rm { path } => {
            let board = connect(&cli, &config).await?;
            let shell = Shell::open(board.clone(), Arc::new(build_sync_config(&config.sync))).await?;
            let removed = shell.remove_file(path).await;
            shell.exit().await?;
            removed.context("Remove failed")?;
            println!("Removed {path}");
            board.disconnect().await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.board.address.is_none());
        assert_eq!(config.board.tcp_port, 23);
        assert_eq!(config.sync.manifest_name, "project.pico-go");
        assert_eq!(config.sync.upload_chunk_size, 512);
    }

    #[test]
    fn test_partial_config() {
        let config: Config = toml::from_str(
            r#"
            [board]
            address = "192.168.4.1"
            password = "secret"

            [sync]
            sync_folder = "src"
            fast_upload = true
            "#,
        )
        .unwrap();
        let board = build_board_config(&config.board);
        assert_eq!(board.password, "secret");
        assert_eq!(board.username, "micro");

        let sync = build_sync_config(&config.sync);
        assert_eq!(sync.chunk_size(), 2048);
        assert_eq!(sync.sync_folder_trimmed(), "src");
    }

    #[test]
    fn test_missing_config_file_is_not_an_error() {
        let config = load_config("/nonexistent/pico-sync.toml").unwrap();
        assert_eq!(config.board.baud_rate, 115200);
    }
}

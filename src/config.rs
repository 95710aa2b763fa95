// MIT License - Copyright (c) 2026 pico-sync contributors
// Connection and sync configuration

use crate::constants::DEFAULT_TCP_PORT;

/// Default chunk size in bytes, before the fast-upload multiplier.
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 512;
/// Multiplier applied to the chunk size when fast upload is on.
pub const FAST_UPLOAD_MULTIPLIER: usize = 4;
/// Files larger than this (kB) are not hash-verified after upload.
pub const DEFAULT_HASH_CHECK_MAX_SIZE_KB: usize = 200;
/// Attempts made to write a single file.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Name of the on-device manifest.
pub const DEFAULT_MANIFEST_NAME: &str = "project.pico-go";

/// Configuration for connecting to a board.
#[derive(Debug, Clone)]
pub struct BoardConfig {
    /// Timeout for establishing the connection, in milliseconds
    pub connect_timeout_ms: u64,
    /// Telnet login name
    pub username: String,
    /// Telnet password
    pub password: String,
    /// Port for telnet and raw socket connections
    pub tcp_port: u16,
    /// Serial baud rate
    pub baud_rate: u32,
    /// Use a raw TCP socket instead of telnet for network addresses
    pub raw_socket: bool,
    /// Interrupt running programs right after connecting
    pub ctrl_c_on_connect: bool,
    /// Keepalive interval in milliseconds (0 disables pings)
    pub ping_interval_ms: u64,
    /// Base delay for connection retries (exponential back-off)
    pub reconnect_delay_ms: u64,
    /// Connection retries on transient errors (0 = no retries)
    pub max_connect_retries: u32,
    /// Serial port manufacturers considered to be boards, in preference order
    pub autoconnect_manufacturers: Vec<String>,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            username: "micro".to_string(),
            password: "python".to_string(),
            tcp_port: DEFAULT_TCP_PORT,
            baud_rate: 115_200,
            raw_socket: false,
            ctrl_c_on_connect: false,
            ping_interval_ms: 5_000,
            reconnect_delay_ms: 1_000,
            max_connect_retries: 0,
            autoconnect_manufacturers: vec![
                "MicroPython".to_string(),
                "Microsoft".to_string(),
                "Raspberry Pi".to_string(),
            ],
        }
    }
}

impl BoardConfig {
    pub fn builder() -> BoardConfigBuilder {
        BoardConfigBuilder::default()
    }
}

/// Builder for BoardConfig.
#[derive(Debug, Clone, Default)]
pub struct BoardConfigBuilder {
    config: BoardConfig,
}

impl BoardConfigBuilder {
    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = password.into();
        self
    }

    pub fn tcp_port(mut self, port: u16) -> Self {
        self.config.tcp_port = port;
        self
    }

    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.config.baud_rate = baud_rate;
        self
    }

    pub fn raw_socket(mut self, raw: bool) -> Self {
        self.config.raw_socket = raw;
        self
    }

    pub fn ctrl_c_on_connect(mut self, enabled: bool) -> Self {
        self.config.ctrl_c_on_connect = enabled;
        self
    }

    pub fn ping_interval_ms(mut self, ms: u64) -> Self {
        self.config.ping_interval_ms = ms;
        self
    }

    pub fn reconnect_delay_ms(mut self, ms: u64) -> Self {
        self.config.reconnect_delay_ms = ms;
        self
    }

    pub fn max_connect_retries(mut self, retries: u32) -> Self {
        self.config.max_connect_retries = retries;
        self
    }

    pub fn autoconnect_manufacturers(mut self, manufacturers: Vec<String>) -> Self {
        self.config.autoconnect_manufacturers = manufacturers;
        self
    }

    pub fn build(self) -> BoardConfig {
        self.config
    }
}

/// Configuration for file synchronisation.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Folder inside the project that mirrors the device root ("" = project root)
    pub sync_folder: String,
    /// File extensions that are synced, without the dot
    pub sync_file_types: Vec<String>,
    /// Ignore `sync_file_types` and sync everything
    pub sync_all_file_types: bool,
    /// File names or relative paths never synced
    pub py_ignore: Vec<String>,
    /// Transfer chunk size in bytes, before the fast-upload multiplier
    pub upload_chunk_size: usize,
    /// Multiply the chunk size by `FAST_UPLOAD_MULTIPLIER`
    pub fast_upload: bool,
    /// Largest file (kB) whose hash is verified after upload
    pub hash_check_max_size_kb: usize,
    /// Safe boot the board before uploading (serial only)
    pub safe_boot_on_upload: bool,
    /// Reset the board when the sync shell closes
    pub reboot_after_upload: bool,
    /// Name of the manifest file on the device
    pub manifest_name: String,
    /// Attempts made per file before giving up
    pub max_retries: u32,
    /// Pause between attempts that do not safe boot, in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_folder: String::new(),
            sync_file_types: ["py", "txt", "log", "json", "xml", "html", "js", "css", "mpy"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            sync_all_file_types: false,
            py_ignore: [".vscode", ".gitignore", ".git", "env", "venv"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            fast_upload: false,
            hash_check_max_size_kb: DEFAULT_HASH_CHECK_MAX_SIZE_KB,
            safe_boot_on_upload: false,
            reboot_after_upload: false,
            manifest_name: DEFAULT_MANIFEST_NAME.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: 1_000,
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Chunk size actually used on the wire.
    pub fn chunk_size(&self) -> usize {
        let base = self.upload_chunk_size.max(1);
        if self.fast_upload {
            base * FAST_UPLOAD_MULTIPLIER
        } else {
            base
        }
    }

    /// Sync folder with leading and trailing slashes removed.
    pub fn sync_folder_trimmed(&self) -> &str {
        self.sync_folder.trim_matches('/')
    }
}

/// Builder for SyncConfig.
#[derive(Debug, Clone, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn sync_folder(mut self, folder: impl Into<String>) -> Self {
        self.config.sync_folder = folder.into();
        self
    }

    pub fn sync_file_types(mut self, types: Vec<String>) -> Self {
        self.config.sync_file_types = types;
        self
    }

    pub fn sync_all_file_types(mut self, all: bool) -> Self {
        self.config.sync_all_file_types = all;
        self
    }

    pub fn py_ignore(mut self, ignore: Vec<String>) -> Self {
        self.config.py_ignore = ignore;
        self
    }

    pub fn upload_chunk_size(mut self, size: usize) -> Self {
        self.config.upload_chunk_size = size;
        self
    }

    pub fn fast_upload(mut self, fast: bool) -> Self {
        self.config.fast_upload = fast;
        self
    }

    pub fn hash_check_max_size_kb(mut self, kb: usize) -> Self {
        self.config.hash_check_max_size_kb = kb;
        self
    }

    pub fn safe_boot_on_upload(mut self, enabled: bool) -> Self {
        self.config.safe_boot_on_upload = enabled;
        self
    }

    pub fn reboot_after_upload(mut self, enabled: bool) -> Self {
        self.config.reboot_after_upload = enabled;
        self
    }

    pub fn manifest_name(mut self, name: impl Into<String>) -> Self {
        self.config.manifest_name = name.into();
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_delay_ms = ms;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

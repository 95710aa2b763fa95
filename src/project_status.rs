// MIT License - Copyright (c) 2026 pico-sync contributors
// Project manifest: local tree hashing, on-board record and diff

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{BoardError, Result};
use crate::shell::Shell;

/// Kind of a manifest entry, `"f"` or `"d"` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    #[serde(rename = "f")]
    File,
    #[serde(rename = "d")]
    Dir,
}

/// One manifest record: `[path, kind, sha256hex]` plus the size for files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireEntry", into = "WireEntry")]
pub struct HashEntry {
    pub path: String,
    pub kind: EntryKind,
    pub hash: String,
    pub size: Option<u64>,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WireEntry {
    Sized(String, EntryKind, String, Option<u64>),
    Unsized(String, EntryKind, String),
}

impl From<WireEntry> for HashEntry {
    fn from(wire: WireEntry) -> Self {
        match wire {
            WireEntry::Sized(path, kind, hash, size) => Self { path, kind, hash, size },
            WireEntry::Unsized(path, kind, hash) => Self {
                path,
                kind,
                hash,
                size: None,
            },
        }
    }
}

impl From<HashEntry> for WireEntry {
    fn from(entry: HashEntry) -> Self {
        match entry.size {
            Some(size) => WireEntry::Sized(entry.path, entry.kind, entry.hash, Some(size)),
            None => WireEntry::Unsized(entry.path, entry.kind, entry.hash),
        }
    }
}

impl HashEntry {
    pub fn file(path: impl Into<String>, content: &[u8]) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            hash: sha256_hex(content),
            size: Some(content.len() as u64),
        }
    }

    /// Folders are identified by the hash of their relative path.
    pub fn dir(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            hash: sha256_hex(path.as_bytes()),
            path,
            kind: EntryKind::Dir,
            size: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Decides which project paths take part in a sync.
#[derive(Debug, Clone)]
pub struct SyncFilter {
    allowed_types: Vec<String>,
    sync_all: bool,
    ignore: Vec<String>,
}

impl SyncFilter {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            allowed_types: config
                .sync_file_types
                .iter()
                .map(|t| t.trim_start_matches('.').to_string())
                .collect(),
            sync_all: config.sync_all_file_types,
            ignore: config.py_ignore.clone(),
        }
    }

    /// Whether `path` (relative, `/`-separated) is synced. Hidden names and
    /// ignored names are skipped; files also need an allowed extension
    /// unless every type is synced.
    pub fn allows(&self, path: &str, is_dir: bool) -> bool {
        let name = path.rsplit('/').next().unwrap_or(path);
        if name.is_empty() || name.starts_with('.') {
            return false;
        }
        if self.ignore.iter().any(|i| i == path || i == name) {
            return false;
        }
        if is_dir || self.sync_all {
            return true;
        }
        match name.rsplit_once('.') {
            Some((_, ext)) => self.allowed_types.iter().any(|t| t == ext),
            None => true,
        }
    }

    /// Whether every component of `path` passes the filter.
    pub fn allows_path(&self, path: &str) -> bool {
        let parts: Vec<&str> = path.split('/').collect();
        parts.iter().enumerate().all(|(i, _)| {
            let prefix = parts[..=i].join("/");
            self.allows(&prefix, i + 1 < parts.len())
        })
    }
}

/// Work derived from comparing the local tree with the board's manifest.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Changes {
    /// Board-only entries: files first, then folders deepest first
    pub deletes: Vec<HashEntry>,
    /// New or changed folders, parents before children
    pub folders: Vec<HashEntry>,
    /// New or changed files
    pub files: Vec<HashEntry>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.folders.is_empty() && self.files.is_empty()
    }

    /// Folders followed by files, in write order.
    pub fn writes(&self) -> Vec<HashEntry> {
        self.folders.iter().chain(self.files.iter()).cloned().collect()
    }
}

/// Local tree state plus the board's record of what it holds.
#[derive(Debug, Clone)]
pub struct ProjectStatus {
    manifest_name: String,
    local: BTreeMap<String, HashEntry>,
    board: BTreeMap<String, HashEntry>,
    changed: bool,
}

impl ProjectStatus {
    pub fn new(manifest_name: impl Into<String>, local: Vec<HashEntry>) -> Self {
        Self {
            manifest_name: manifest_name.into(),
            local: local.into_iter().map(|e| (e.path.clone(), e)).collect(),
            board: BTreeMap::new(),
            changed: false,
        }
    }

    /// Hash the local project folder.
    pub async fn scan(local_folder: &Path, config: &SyncConfig) -> Result<Self> {
        let entries = scan_local(local_folder, &SyncFilter::new(config)).await?;
        info!("Found {} local files and folders", entries.len());
        Ok(Self::new(config.manifest_name.clone(), entries))
    }

    pub fn manifest_name(&self) -> &str {
        &self.manifest_name
    }

    pub fn local(&self, path: &str) -> Option<&HashEntry> {
        self.local.get(path)
    }

    pub fn board_entries(&self) -> impl Iterator<Item = &HashEntry> {
        self.board.values()
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Add a locally prepared entry, e.g. for an explicit upload.
    pub fn insert_local(&mut self, entry: HashEntry) {
        self.local.insert(entry.path.clone(), entry);
    }

    /// Load the board's manifest. An empty file means an empty manifest.
    pub fn load_manifest(&mut self, json: &[u8]) -> Result<()> {
        let entries: Vec<HashEntry> = if json.iter().all(u8::is_ascii_whitespace) {
            Vec::new()
        } else {
            serde_json::from_slice(json)?
        };
        self.board = entries.into_iter().map(|e| (e.path.clone(), e)).collect();
        Ok(())
    }

    pub fn manifest_json(&self) -> Result<Vec<u8>> {
        let entries: Vec<&HashEntry> = self.board.values().collect();
        Ok(serde_json::to_vec(&entries)?)
    }

    /// Read the manifest from the board.
    pub async fn read(&mut self, shell: &Shell) -> Result<()> {
        let content = shell.read_file(&self.manifest_name).await?;
        self.load_manifest(&content)?;
        debug!("Board manifest lists {} entries", self.board.len());
        Ok(())
    }

    /// Write the manifest to the board if anything changed.
    pub async fn write(&mut self, shell: &Shell) -> Result<()> {
        if !self.changed {
            info!("No changes to project status, not writing");
            return Ok(());
        }
        info!("Writing project status file to board");
        let json = self.manifest_json()?;
        shell.write_file(&self.manifest_name, &json).await?;
        self.changed = false;
        Ok(())
    }

    /// Record that `path` now matches the local tree on the board, or is
    /// gone from both.
    pub fn update(&mut self, path: &str) {
        self.changed = true;
        match self.local.get(path) {
            Some(entry) => {
                self.board.insert(path.to_string(), entry.clone());
            }
            None => {
                self.board.remove(path);
            }
        }
    }

    /// New, changed and deleted entries.
    pub fn get_changes(&self) -> Changes {
        let mut changes = Changes::default();

        for (path, local) in &self.local {
            let differs = self.board.get(path).map_or(true, |board| board.hash != local.hash);
            if differs {
                if local.is_dir() {
                    changes.folders.push(local.clone());
                } else {
                    changes.files.push(local.clone());
                }
            }
        }

        let (mut dirs, files): (Vec<_>, Vec<_>) = self
            .board
            .iter()
            .filter(|(path, _)| !self.local.contains_key(*path))
            .map(|(_, entry)| entry.clone())
            .partition(HashEntry::is_dir);
        dirs.sort_by(|a, b| depth(&b.path).cmp(&depth(&a.path)).then_with(|| b.path.cmp(&a.path)));
        changes.deletes = files.into_iter().chain(dirs).collect();

        changes.folders.sort_by(|a, b| depth(&a.path).cmp(&depth(&b.path)).then_with(|| a.path.cmp(&b.path)));
        changes
    }
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}

/// Relative `/`-separated path of `file` under `root`.
pub fn relative_path(root: &Path, file: &Path) -> Option<String> {
    let relative = file.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Hash one local file for an explicit upload.
pub async fn prepare_file(sync_root: &Path, file: &Path) -> Result<HashEntry> {
    let path = relative_path(sync_root, file).ok_or_else(|| BoardError::InvalidResponse {
        details: format!("{} is not inside {}", file.display(), sync_root.display()),
    })?;
    let content = tokio::fs::read(file).await?;
    Ok(HashEntry::file(path, &content))
}

/// Hash every synced file under `root`. Folders are listed only when they
/// contain at least one synced file.
pub async fn scan_local(root: &Path, filter: &SyncFilter) -> Result<Vec<HashEntry>> {
    let mut entries = BTreeMap::new();
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if dir != root => {
                warn!("Unable to read from dir {}: {}", dir.display(), e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(item) = reader.next_entry().await? {
            let full = item.path();
            let Some(relative) = relative_path(root, &full) else {
                continue;
            };
            let metadata = tokio::fs::metadata(&full).await?;

            if !filter.allows(&relative, metadata.is_dir()) {
                continue;
            }
            if metadata.is_dir() {
                pending.push(full);
                continue;
            }

            let content = tokio::fs::read(&full).await?;
            let mut parent = relative.as_str();
            while let Some((dir_path, _)) = parent.rsplit_once('/') {
                entries
                    .entry(dir_path.to_string())
                    .or_insert_with(|| HashEntry::dir(dir_path));
                parent = dir_path;
            }
            entries.insert(relative.clone(), HashEntry::file(relative, &content));
        }
    }

    Ok(entries.into_values().collect())
}

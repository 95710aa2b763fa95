// MIT License - Copyright (c) 2026 pico-sync contributors
// Upload / download orchestration

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::board::Board;
use crate::config::SyncConfig;
use crate::error::{BoardError, Result};
use crate::project_status::{prepare_file, HashEntry, ProjectStatus, SyncFilter};
use crate::shell::{RemoteKind, Shell};

const SAFE_BOOT_TIMEOUT_MS: u64 = 4_000;
const STOP_PROGRAMS_TIMEOUT_MS: u64 = 500;
/// The manifest is persisted after this many written items.
const MANIFEST_PERSIST_INTERVAL: usize = 8;
/// Upper bound on tolerated file write failures per upload.
const MAX_WRITE_FAILURES: usize = 5;

/// Receives human-readable progress lines.
pub type ProgressFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Which board files a download fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadMode {
    /// Every synced file, overwriting local copies
    #[default]
    All,
    /// Only files missing locally
    OnlyNew,
}

/// Outcome of one upload or download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub deleted: usize,
    pub written: usize,
    pub failed: Vec<String>,
    pub cancelled: bool,
}

/// Drives uploads and downloads between a local project folder and a board.
///
/// One transfer runs at a time. `stop` may be called from another task; it
/// lets the current device round-trip finish, persists the manifest and
/// returns the board to the friendly REPL.
pub struct SyncSession {
    board: Board,
    config: Arc<SyncConfig>,
    project_path: PathBuf,
    running: AtomicBool,
    shell: Mutex<Option<Arc<Shell>>>,
    progress: ProgressFn,
}

impl SyncSession {
    pub fn new(board: Board, config: SyncConfig, project_path: impl Into<PathBuf>) -> Self {
        Self {
            board,
            config: Arc::new(config),
            project_path: project_path.into(),
            running: AtomicBool::new(false),
            shell: Mutex::new(None),
            progress: Arc::new(|message: &str| info!("{}", message)),
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = progress;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Local folder mirrored to the board root.
    pub fn sync_root(&self) -> PathBuf {
        match self.config.sync_folder_trimmed() {
            "" => self.project_path.clone(),
            folder => self.project_path.join(folder),
        }
    }

    fn folder_name(&self) -> &str {
        match self.config.sync_folder.as_str() {
            "" => "main folder",
            folder => folder,
        }
    }

    fn progress(&self, message: &str) {
        (self.progress)(message);
    }

    fn check_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            warn!("Sync cancelled");
            Err(BoardError::Cancelled)
        }
    }

    /// Cancel the running transfer.
    pub async fn stop(&self) {
        info!("Stopping sync");
        self.running.store(false, Ordering::SeqCst);

        let shell = self.shell.lock().ok().and_then(|s| s.clone());
        let Some(shell) = shell else {
            return;
        };
        if !shell.stop_working().await {
            self.board.stop_waiting_silent().await;
        }
    }

    /// Upload the project, or just `files` when given.
    ///
    /// Without explicit files the board manifest is diffed against the local
    /// tree: board-only entries are deleted, then new and changed folders and
    /// files are written.
    pub async fn upload(&self, files: Option<Vec<PathBuf>>) -> Result<SyncReport> {
        let root = self.sync_root();
        self.ensure_sync_root(&root).await?;

        match &files {
            Some(files) if files.len() == 1 => {
                let name = files[0]
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                self.progress(&format!("Uploading current file ({name})..."));
            }
            _ => self.progress(&format!("Uploading project ({})...", self.folder_name())),
        }

        let mut status = match &files {
            Some(_) => ProjectStatus::new(self.config.manifest_name.clone(), Vec::new()),
            None => ProjectStatus::scan(&root, &self.config).await?,
        };

        let shell = self.begin("Uploading").await?;
        let mut report = SyncReport::default();
        let result = self.upload_inner(&shell, &root, files, &mut status, &mut report).await;
        self.finish(&shell, result, Some(&mut status), report).await
    }

    /// Download synced board files into the project.
    pub async fn download(&self, mode: DownloadMode) -> Result<SyncReport> {
        let root = self.sync_root();
        self.ensure_sync_root(&root).await?;
        self.progress(&format!("Downloading project ({})...", self.folder_name()));

        let shell = self.begin("Downloading").await?;
        let mut report = SyncReport::default();
        let result = self.download_inner(&shell, &root, mode, &mut report).await;
        self.finish(&shell, result, None, report).await
    }

    async fn ensure_sync_root(&self, root: &Path) -> Result<()> {
        if tokio::fs::try_exists(root).await.unwrap_or(false) {
            return Ok(());
        }
        error!("Sync folder {} does not exist", root.display());
        Err(BoardError::SyncFolderMissing {
            path: root.display().to_string(),
        })
    }

    async fn begin(&self, action: &str) -> Result<Arc<Shell>> {
        self.running.store(true, Ordering::SeqCst);
        self.safe_boot(action).await;

        let shell = match Shell::open(self.board.clone(), self.config.clone()).await {
            Ok(shell) => Arc::new(shell),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                error!("Failed to open shell: {}", e);
                return Err(e);
            }
        };
        self.progress(&format!("{action} {} {}...", direction(action), shell.mcu_root_folder()));

        if let Ok(mut current) = self.shell.lock() {
            *current = Some(shell.clone());
        }
        Ok(shell)
    }

    async fn finish(
        &self,
        shell: &Shell,
        result: Result<()>,
        status: Option<&mut ProjectStatus>,
        mut report: SyncReport,
    ) -> Result<SyncReport> {
        let outcome = match result {
            Ok(()) => {
                self.progress("Done");
                Ok(report)
            }
            Err(BoardError::Cancelled) => {
                self.progress("Cancelled");
                if let Some(status) = status {
                    if let Err(e) = status.write(shell).await {
                        warn!("Failed to persist manifest after cancel: {}", e);
                    }
                }
                report.cancelled = true;
                Ok(report)
            }
            Err(e) => {
                error!("Sync failed: {}", e);
                self.progress(&format!("Failed: {e}"));
                self.board.stop_waiting_silent().await;
                Err(e)
            }
        };

        if let Err(e) = shell.exit().await {
            warn!("Closing shell failed: {}", e);
            if outcome.is_err() {
                self.board.enter_friendly_repl_non_blocking();
            }
        }

        if let Ok(mut current) = self.shell.lock() {
            *current = None;
        }
        self.running.store(false, Ordering::SeqCst);
        outcome
    }

    async fn safe_boot(&self, action: &str) {
        if let Err(e) = self
            .board
            .stop_running_programs_double(STOP_PROGRAMS_TIMEOUT_MS)
            .await
        {
            debug!("No prompt after interrupting programs: {}", e);
        }

        if !self.config.safe_boot_on_upload {
            self.progress("Not safe booting, disabled in settings");
            return;
        }
        if !self.board.is_serial().await {
            return;
        }

        info!("Safe booting...");
        self.progress("Safe booting device... (see settings for more info)");
        if let Err(e) = self.board.safe_boot(SAFE_BOOT_TIMEOUT_MS).await {
            error!("Safe boot failed: {}", e);
            self.progress(&format!("Safe boot failed, {} anyway.", action.to_lowercase()));
        }
    }

    async fn upload_inner(
        &self,
        shell: &Shell,
        root: &Path,
        files: Option<Vec<PathBuf>>,
        status: &mut ProjectStatus,
        report: &mut SyncReport,
    ) -> Result<()> {
        self.progress("Reading file status");
        let manifest = status.read(shell).await;
        if let Err(BoardError::Cancelled) = manifest {
            return Err(BoardError::Cancelled);
        }
        self.check_running()?;

        let (deletes, writes) = match files {
            Some(files) => {
                let mut writes = Vec::with_capacity(files.len());
                for file in &files {
                    let entry = prepare_file(root, file).await?;
                    status.insert_local(entry.clone());
                    writes.push(entry);
                }
                if writes.len() == 1 {
                    self.progress("Uploading single file");
                } else {
                    self.progress(&format!("Uploading {} files", writes.len()));
                }
                (Vec::new(), writes)
            }
            None => {
                if let Err(e) = &manifest {
                    debug!("Project status unreadable: {}", e);
                    self.progress("Failed to read project status, uploading all files");
                }
                let changes = status.get_changes();
                if changes.is_empty() {
                    self.progress("No files to upload");
                    return Ok(());
                }
                let writes = changes.writes();
                (changes.deletes, writes)
            }
        };

        if !deletes.is_empty() {
            self.progress(&format!("Deleting {} files/folders", deletes.len()));
            self.remove_entries(shell, &deletes, status, report).await?;
            status.write(shell).await?;
        }

        self.write_entries(shell, root, &writes, status, report).await?;

        info!("Writing project file");
        status.write(shell).await
    }

    async fn remove_entries(
        &self,
        shell: &Shell,
        deletes: &[HashEntry],
        status: &mut ProjectStatus,
        report: &mut SyncReport,
    ) -> Result<()> {
        for entry in deletes {
            self.check_running()?;
            let result = if entry.is_dir() {
                self.progress(&format!("Removing dir {}", entry.path));
                shell.remove_dir(&entry.path).await
            } else {
                self.progress(&format!("Removing file {}", entry.path));
                shell.remove_file(&entry.path).await
            };

            match result {
                Ok(()) => report.deleted += 1,
                Err(BoardError::Cancelled) => return Err(BoardError::Cancelled),
                Err(e) => {
                    debug!("Remove {} failed: {}", entry.path, e);
                    self.progress(&format!("Failed to remove {}", entry.path));
                }
            }
            status.update(&entry.path);
        }
        Ok(())
    }

    async fn write_entries(
        &self,
        shell: &Shell,
        root: &Path,
        writes: &[HashEntry],
        status: &mut ProjectStatus,
        report: &mut SyncReport,
    ) -> Result<()> {
        let file_count = writes.iter().filter(|e| !e.is_dir()).count();
        let max_failures = file_count.div_ceil(2).min(MAX_WRITE_FAILURES);
        let mut files_done = 0;
        let mut failures = 0;

        for (index, entry) in writes.iter().enumerate() {
            if index > 0 && index % MANIFEST_PERSIST_INTERVAL == 0 {
                info!("Updating project status file");
                status.write(shell).await?;
            }
            self.check_running()?;

            if entry.is_dir() {
                self.progress(&format!("Creating dir {}", entry.path));
                match shell.create_dir_all(&entry.path).await {
                    Ok(()) => status.update(&entry.path),
                    Err(BoardError::Cancelled) => return Err(BoardError::Cancelled),
                    Err(e) => warn!("Creating {} failed: {}", entry.path, e),
                }
                continue;
            }

            files_done += 1;
            let size_kb = (entry.size.unwrap_or(0) as f64 / 1000.0).round() as u64;
            self.progress(&format!(
                "[{files_done}/{file_count}] Writing file {} ({size_kb}kb)",
                entry.path
            ));

            let started = Instant::now();
            let result = match tokio::fs::read(root.join(&entry.path)).await {
                Ok(content) => shell.write_file(&entry.path, &content).await,
                Err(e) => Err(e.into()),
            };
            info!("Completed {} in {:?}", entry.path, started.elapsed());

            match result {
                Ok(()) => {
                    report.written += 1;
                    status.update(&entry.path);
                }
                Err(BoardError::Cancelled) => return Err(BoardError::Cancelled),
                Err(e) => {
                    failures += 1;
                    report.failed.push(entry.path.clone());
                    if failures > max_failures {
                        return Err(e);
                    }
                    self.progress(&e.to_string());
                }
            }
        }
        Ok(())
    }

    async fn download_inner(
        &self,
        shell: &Shell,
        root: &Path,
        mode: DownloadMode,
        report: &mut SyncReport,
    ) -> Result<()> {
        self.progress("Reading files from board");
        let filter = SyncFilter::new(&self.config);
        let listed = shell.list(shell.mcu_root_folder(), true, false).await?;
        self.check_running()?;

        let mut existing = Vec::new();
        let mut new = Vec::new();
        for entry in listed {
            if entry.kind != RemoteKind::File
                || entry.path == self.config.manifest_name
                || !filter.allows_path(&entry.path)
            {
                continue;
            }
            if tokio::fs::try_exists(root.join(&entry.path)).await.unwrap_or(false) {
                existing.push(entry.path);
            } else {
                new.push(entry.path);
            }
        }

        if existing.is_empty() && new.is_empty() {
            self.progress("No files found on the board to download");
            return Ok(());
        }
        self.progress(&format!(
            "Found {} new and {} existing {}",
            new.len(),
            existing.len(),
            plural("file", new.len() + existing.len())
        ));

        let targets: Vec<String> = match mode {
            DownloadMode::All => existing.into_iter().chain(new).collect(),
            DownloadMode::OnlyNew => new,
        };
        self.progress(&format!("Downloading {} {}...", targets.len(), plural("file", targets.len())));

        for (index, path) in targets.iter().enumerate() {
            self.check_running()?;
            self.progress(&format!("[{}/{}] Reading {}", index + 1, targets.len(), path));

            let content = match shell.read_file(path).await {
                Ok(content) => content,
                Err(BoardError::Cancelled) => return Err(BoardError::Cancelled),
                Err(e) => {
                    error!("Download of {} failed: {}", path, e);
                    self.progress(&format!("Failed to download {path}"));
                    report.failed.push(path.clone());
                    continue;
                }
            };

            if let Err(e) = write_local(&root.join(path), &content).await {
                error!("Failed to write {}: {}", path, e);
                self.progress(&format!("Failed to write to local file {path}"));
                report.failed.push(path.clone());
                continue;
            }
            report.written += 1;
        }
        Ok(())
    }
}

async fn write_local(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await
}

fn direction(action: &str) -> &'static str {
    if action == "Downloading" {
        "from"
    } else {
        "to"
    }
}

fn plural(word: &str, count: usize) -> String {
    if count == 1 {
        word.to_string()
    } else {
        format!("{word}s")
    }
}

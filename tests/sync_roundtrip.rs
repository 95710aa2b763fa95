// MIT License - Copyright (c) 2026 pico-sync contributors
// Upload and download against a simulated board

mod common;

use std::path::Path;
use std::sync::Arc;

use pico_sync::{DownloadMode, EntryKind, HashEntry, ReplStatus, SyncConfig, SyncSession};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use common::FakePico;

const MANIFEST: &str = "project.pico-go";

fn write(root: &Path, path: &str, content: &str) {
    let full = root.join(path);
    std::fs::create_dir_all(full.parent().unwrap()).unwrap();
    std::fs::write(full, content).unwrap();
}

fn project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "main.py", "import util\nutil.blink()\n");
    write(dir.path(), "lib/util.py", "def blink():\n    print('blink')\n");
    write(dir.path(), "data.json", "{\"interval\": 500}\n");
    write(dir.path(), "image.png", "not synced");
    write(dir.path(), "venv/x.py", "ignored");
    dir
}

fn board_manifest(fake: &FakePico) -> Vec<HashEntry> {
    let fs = fake.fs();
    serde_json::from_slice(fs.file(MANIFEST).expect("manifest on board")).unwrap()
}

#[tokio::test]
async fn test_upload_then_download() {
    let fake = FakePico::new();
    let (board, _) = fake.connect().await;
    let dir = project();

    let session = SyncSession::new(board.clone(), SyncConfig::default(), dir.path());
    let report = session.upload(None).await.unwrap();

    assert_eq!(report.written, 3);
    assert_eq!(report.deleted, 0);
    assert!(!report.cancelled);
    assert_eq!(board.status().await, ReplStatus::FriendlyRepl);
    {
        let fs = fake.fs();
        assert_eq!(fs.file("main.py"), Some(&b"import util\nutil.blink()\n"[..]));
        assert!(fs.file("lib/util.py").is_some());
        assert!(fs.file("image.png").is_none());
        assert!(fs.file("venv/x.py").is_none());
        assert!(fs.dirs.contains("lib"));
    }

    let manifest = board_manifest(&fake);
    assert_eq!(manifest.len(), 4);
    let util = manifest.iter().find(|e| e.path == "lib/util.py").unwrap();
    assert_eq!(util.kind, EntryKind::File);
    assert_eq!(
        util.hash,
        hex::encode(Sha256::digest(b"def blink():\n    print('blink')\n"))
    );

    let target = tempfile::tempdir().unwrap();
    let session = SyncSession::new(board, SyncConfig::default(), target.path());
    let report = session.download(DownloadMode::All).await.unwrap();

    assert_eq!(report.written, 3);
    assert!(report.failed.is_empty());
    for path in ["main.py", "lib/util.py", "data.json"] {
        assert_eq!(
            std::fs::read(target.path().join(path)).unwrap(),
            std::fs::read(dir.path().join(path)).unwrap(),
            "{path}"
        );
    }
    assert!(!target.path().join(MANIFEST).exists());
}

#[tokio::test]
async fn test_second_upload_is_a_no_op() {
    let fake = FakePico::new();
    let (board, _) = fake.connect().await;
    let dir = project();
    let session = SyncSession::new(board, SyncConfig::default(), dir.path());

    session.upload(None).await.unwrap();
    let opens = fake.fs().count_programs("f = open(");

    let report = session.upload(None).await.unwrap();
    assert_eq!(report.written, 0);
    assert_eq!(report.deleted, 0);
    assert_eq!(fake.fs().count_programs("f = open("), opens);
}

#[tokio::test]
async fn test_local_delete_reaches_board() {
    let fake = FakePico::new();
    let (board, _) = fake.connect().await;
    let dir = project();
    let session = SyncSession::new(board, SyncConfig::default(), dir.path());
    session.upload(None).await.unwrap();

    std::fs::remove_dir_all(dir.path().join("lib")).unwrap();
    write(dir.path(), "main.py", "print('standalone')\n");

    let report = session.upload(None).await.unwrap();
    assert_eq!(report.deleted, 2);
    assert_eq!(report.written, 1);

    let fs = fake.fs();
    assert!(fs.file("lib/util.py").is_none());
    assert!(!fs.dirs.contains("lib"));
    assert_eq!(fs.file("main.py"), Some(&b"print('standalone')\n"[..]));
    drop(fs);

    let paths: Vec<String> = board_manifest(&fake).into_iter().map(|e| e.path).collect();
    assert_eq!(paths, vec!["data.json", "main.py"]);
}

#[tokio::test]
async fn test_failed_folder_is_not_recorded() {
    let fake = FakePico::new();
    fake.fs().fail_mkdir = true;
    let (board, _) = fake.connect().await;
    let dir = project();
    let config = SyncConfig::builder().retry_delay_ms(0).build();
    let session = SyncSession::new(board, config, dir.path());

    let report = session.upload(None).await.unwrap();

    assert_eq!(report.written, 2);
    assert_eq!(report.failed, vec!["lib/util.py".to_string()]);
    let paths: Vec<String> = board_manifest(&fake).into_iter().map(|e| e.path).collect();
    assert_eq!(paths, vec!["data.json", "main.py"]);

    fake.fs().fail_mkdir = false;
    let report = session.upload(None).await.unwrap();
    assert_eq!(report.written, 1);
    assert!(fake.fs().dirs.contains("lib"));
    assert!(board_manifest(&fake).iter().any(|e| e.path == "lib"));
}

#[tokio::test]
async fn test_upload_single_file() {
    let fake = FakePico::new().with_file("boot.py", b"# keep me\n");
    let (board, _) = fake.connect().await;
    let dir = project();
    let session = SyncSession::new(board, SyncConfig::default(), dir.path());

    let report = session
        .upload(Some(vec![dir.path().join("main.py")]))
        .await
        .unwrap();

    assert_eq!(report.written, 1);
    let fs = fake.fs();
    assert!(fs.file("main.py").is_some());
    assert!(fs.file("lib/util.py").is_none());
    assert_eq!(fs.file("boot.py"), Some(&b"# keep me\n"[..]));
    drop(fs);

    let manifest = board_manifest(&fake);
    assert_eq!(manifest.len(), 1);
    assert_eq!(manifest[0].path, "main.py");
}

#[tokio::test]
async fn test_download_only_new() {
    let fake = FakePico::new()
        .with_file("main.py", b"print('board')\n")
        .with_file("lib/extra.py", b"X = 1\n");
    let (board, _) = fake.connect().await;

    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "main.py", "print('local')\n");

    let session = SyncSession::new(board, SyncConfig::default(), dir.path());
    let report = session.download(DownloadMode::OnlyNew).await.unwrap();

    assert_eq!(report.written, 1);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("main.py")).unwrap(),
        "print('local')\n"
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("lib/extra.py")).unwrap(),
        "X = 1\n"
    );
}

#[tokio::test]
async fn test_stop_keeps_manifest_consistent() {
    let fake = FakePico::new();
    let (board, _) = fake.connect().await;
    let dir = tempfile::tempdir().unwrap();
    for i in 0..20 {
        write(dir.path(), &format!("mod_{i:02}.py"), &format!("VALUE = {i}\n"));
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let session = Arc::new(
        SyncSession::new(board.clone(), SyncConfig::default(), dir.path())
            .with_progress(Arc::new(move |line: &str| {
                let _ = tx.send(line.to_string());
            })),
    );

    let stopper = {
        let session = session.clone();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if line.starts_with("[2/") {
                    session.stop().await;
                    break;
                }
            }
        })
    };

    let report = session.upload(None).await.unwrap();
    stopper.await.unwrap();

    assert!(report.cancelled);
    assert!(report.written < 20);
    assert!(!session.is_running());
    assert_eq!(board.status().await, ReplStatus::FriendlyRepl);

    let manifest = board_manifest(&fake);
    let fs = fake.fs();
    let on_board: Vec<&String> = fs.files.keys().filter(|p| *p != MANIFEST).collect();
    assert_eq!(manifest.len(), on_board.len());
    for entry in &manifest {
        let content = fs.file(&entry.path).expect("manifest entry exists on board");
        assert_eq!(entry.hash, hex::encode(Sha256::digest(content)));
    }
}

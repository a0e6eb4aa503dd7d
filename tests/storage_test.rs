//! Integration tests for the atomic file primitive.

use std::sync::Arc;

use tempfile::TempDir;
use workvault::error::Error;
use workvault::storage::AtomicFileStore;

// ---------------------------------------------------------------------------
// Atomicity under concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_only_ever_see_complete_files() {
    let dir = TempDir::new().unwrap();
    let path = Arc::new(dir.path().join("value.bin"));
    let store = AtomicFileStore::new();

    // Each payload is one byte value repeated, so a mix of two writes is
    // detectable.
    let payload = |b: u8| vec![b; 64 * 1024];
    store.write(&path, payload(0)).await.unwrap();

    let mut writers = Vec::new();
    for b in 1..=8u8 {
        let path = Arc::clone(&path);
        writers.push(tokio::spawn(async move {
            for _ in 0..10 {
                store.write(&path, payload(b)).await.unwrap();
            }
        }));
    }

    let reader = {
        let path = Arc::clone(&path);
        tokio::spawn(async move {
            for _ in 0..200 {
                let bytes = store.read(&path).await.unwrap();
                assert_eq!(bytes.len(), 64 * 1024, "truncated read");
                let first = bytes[0];
                assert!(bytes.iter().all(|b| *b == first), "mixed content");
            }
        })
    };

    for writer in writers {
        writer.await.unwrap();
    }
    reader.await.unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .filter(|n| n != "value.bin")
        .collect();
    assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
}

// ---------------------------------------------------------------------------
// Crash leftovers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interrupted_write_leaves_old_content_and_is_swept() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    let store = AtomicFileStore::new();
    store.write(&path, b"{\"v\":1}".to_vec()).await.unwrap();

    // What a crash between temp write and rename leaves behind.
    let orphan = dir.path().join(".state.json.4242.0.abcdef.tmp");
    std::fs::write(&orphan, b"{\"v\":2,\"trunc").unwrap();

    assert_eq!(store.read(&path).await.unwrap(), b"{\"v\":1}");
    assert_eq!(store.sweep_temp_files(dir.path()).await.unwrap(), 1);
    assert!(!orphan.exists());
    assert!(path.exists());
}

#[tokio::test]
async fn missing_files_are_not_found() {
    let dir = TempDir::new().unwrap();
    let store = AtomicFileStore::new();
    let path = dir.path().join("absent");

    assert!(matches!(store.read(&path).await, Err(Error::NotFound(_))));
    assert_eq!(store.read_if_exists(&path).await.unwrap(), None);
    assert_eq!(store.sweep_temp_files(&dir.path().join("nope")).await.unwrap(), 0);
}

#[tokio::test]
async fn write_creates_parent_directories() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a/b/c.json");
    AtomicFileStore::new().write(&path, b"[]".to_vec()).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"[]");
}

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end scenarios through the public surface: mount dispatch,
//! overlay semantics, per-path locking, and the descriptor table.

use std::sync::Arc;

use sandfs_core::backends::async_key_value::AsyncKeyValueFileSystem;
use sandfs_core::testing::InMemoryAsyncStore;
use sandfs_core::{
    in_memory_filesystem, ApiError, Credentials, ErrorCode, FileFlag, FileSystem, Inode, LockedFs,
    OverlayFs, Stats, Vfs,
};

const ROOT: Credentials = Credentials::ROOT;

#[tokio::test]
async fn basic_lifecycle_over_in_memory_store() {
    let vfs = Vfs::new().unwrap();

    vfs.mkdir("/a", 0o755).await.unwrap();
    assert!(vfs.readdir("/").await.unwrap().contains(&"a".to_string()));

    vfs.write_file("/a/f", b"hello", FileFlag::W, 0o644)
        .await
        .unwrap();
    assert_eq!(vfs.stat("/a/f").await.unwrap().size, 5);
    assert_eq!(
        vfs.read_file("/a/f", FileFlag::R).await.unwrap(),
        b"hello"
    );

    vfs.unlink("/a/f").await.unwrap();
    assert!(!vfs.exists("/a/f").await);
    vfs.rmdir("/a").await.unwrap();
    assert!(!vfs.exists("/a").await);
}

#[tokio::test]
async fn rename_into_own_subtree_is_rejected() {
    let vfs = Vfs::new().unwrap();
    vfs.mkdir("/d", 0o755).await.unwrap();
    vfs.mkdir("/d/e", 0o755).await.unwrap();

    let err = vfs.rename("/d", "/d/e/x").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::EBUSY);
}

#[tokio::test]
async fn overlay_union_readdir_and_persistent_whiteouts() {
    let lower: Arc<dyn FileSystem> = Arc::new(in_memory_filesystem("lower").unwrap());
    let upper: Arc<dyn FileSystem> = Arc::new(in_memory_filesystem("upper").unwrap());
    lower.mkdir("/z", 0o755, &ROOT).await.unwrap();
    lower
        .write_file("/z/a.txt", b"a", FileFlag::W, 0o644, &ROOT)
        .await
        .unwrap();
    lower
        .write_file("/z/b.txt", b"b", FileFlag::W, 0o644, &ROOT)
        .await
        .unwrap();

    let overlay = OverlayFs::new(upper.clone(), lower.clone()).unwrap();
    overlay.initialize().await.unwrap();

    let mut entries = overlay.readdir("/z", &ROOT).await.unwrap();
    entries.sort();
    assert_eq!(entries, ["a.txt", "b.txt"]);

    overlay.unlink("/z/a.txt", &ROOT).await.unwrap();
    assert_eq!(overlay.readdir("/z", &ROOT).await.unwrap(), ["b.txt"]);
    // Upper layer holds only the whiteout log, not the file.
    assert!(!upper.exists("/z/a.txt", &ROOT).await);

    // Remount over the same layers: the log is reparsed.
    let remounted = OverlayFs::new(upper, lower).unwrap();
    remounted.initialize().await.unwrap();
    assert_eq!(remounted.readdir("/z", &ROOT).await.unwrap(), ["b.txt"]);
}

#[tokio::test]
async fn overlay_copy_up_on_chmod() {
    let lower: Arc<dyn FileSystem> = Arc::new(in_memory_filesystem("lower").unwrap());
    let upper: Arc<dyn FileSystem> = Arc::new(in_memory_filesystem("upper").unwrap());
    lower
        .write_file("/r.txt", b"read-only bytes", FileFlag::W, 0o644, &ROOT)
        .await
        .unwrap();
    lower.chmod("/r.txt", 0o444, &ROOT).await.unwrap();

    let overlay = OverlayFs::new(upper.clone(), lower.clone()).unwrap();
    overlay.initialize().await.unwrap();
    overlay.chmod("/r.txt", 0o644, &ROOT).await.unwrap();

    assert_eq!(
        upper.read_file("/r.txt", FileFlag::R, &ROOT).await.unwrap(),
        b"read-only bytes"
    );
    assert_eq!(upper.stat("/r.txt", &ROOT).await.unwrap().mode & 0o777, 0o644);
    assert_eq!(lower.stat("/r.txt", &ROOT).await.unwrap().mode & 0o777, 0o444);
}

#[tokio::test]
async fn per_path_mutex_serializes_writers() {
    let store = Arc::new(InMemoryAsyncStore::new("serialize"));
    let engine = AsyncKeyValueFileSystem::new(store).await.unwrap();
    let fs = Arc::new(LockedFs::new(Arc::new(engine)));

    let mut handles = Vec::new();
    for content in [&b"AAAA"[..], &b"B"[..], &b"CC"[..]] {
        let fs = fs.clone();
        handles.push(tokio::spawn(async move {
            fs.write_file("/x", content, FileFlag::W, 0o644, &ROOT)
                .await
                .unwrap();
        }));
        tokio::task::yield_now().await;
    }

    // While async work is queued on /x, a sync call must be refused.
    let mut saw_invalid_sync_call = false;
    for _ in 0..32 {
        match fs.write_file_sync("/x", b"Z", FileFlag::W, 0o644, &ROOT) {
            Err(e) if e.message == "invalid sync call" => {
                saw_invalid_sync_call = true;
                break;
            }
            _ => tokio::task::yield_now().await,
        }
    }
    assert!(saw_invalid_sync_call);

    for handle in handles {
        handle.await.unwrap();
    }

    // Writers ran whole, in start order; the last write wins.
    let data = fs.read_file("/x", FileFlag::R, &ROOT).await.unwrap();
    assert_eq!(data, b"CC");
}

#[tokio::test]
async fn mount_routing_and_listing_augmentation() {
    let vfs = Vfs::new().unwrap();
    let m1: Arc<dyn FileSystem> = Arc::new(in_memory_filesystem("M1").unwrap());
    let m2: Arc<dyn FileSystem> = Arc::new(in_memory_filesystem("M2").unwrap());
    vfs.mount("/a", m1.clone()).unwrap();
    vfs.mount("/a/b", m2.clone()).unwrap();

    vfs.write_file("/a/b/c", b"1", FileFlag::W, 0o644)
        .await
        .unwrap();
    assert!(m2.exists_sync("/c", &ROOT));

    vfs.write_file("/a/own.txt", b"2", FileFlag::W, 0o644)
        .await
        .unwrap();
    let mut entries = vfs.readdir("/a").await.unwrap();
    entries.sort();
    assert_eq!(entries, ["b", "own.txt"]);
}

#[tokio::test]
async fn truncate_to_current_size_keeps_content() {
    let vfs = Vfs::new().unwrap();
    vfs.write_file("/f", b"stable", FileFlag::W, 0o644)
        .await
        .unwrap();
    vfs.truncate("/f", 6).await.unwrap();
    assert_eq!(vfs.read_file("/f", FileFlag::R).await.unwrap(), b"stable");
}

#[tokio::test]
async fn consecutive_reads_are_stable() {
    let vfs = Vfs::new().unwrap();
    vfs.write_file("/f", b"same bytes", FileFlag::W, 0o644)
        .await
        .unwrap();
    let first = vfs.read_file("/f", FileFlag::R).await.unwrap();
    let second = vfs.read_file("/f", FileFlag::R).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn descriptor_operations() {
    let vfs = Vfs::new().unwrap();
    let fd = vfs.open("/file.bin", FileFlag::WPlus, 0o644).await.unwrap();

    vfs.write(fd, b"0123456789", 0, 10, Some(0)).await.unwrap();
    vfs.ftruncate(fd, 4).await.unwrap();
    vfs.fchmod(fd, 0o600).await.unwrap();
    vfs.fchown(fd, 7, 7).await.unwrap();
    vfs.futimes(fd, 1000.0, 2000.0).await.unwrap();
    vfs.fsync(fd).await.unwrap();
    vfs.fdatasync(fd).await.unwrap();

    let stats = vfs.fstat(fd).unwrap();
    assert_eq!(stats.size, 4);
    assert_eq!(stats.mode & 0o777, 0o600);
    assert_eq!(stats.uid, 7);
    assert_eq!(stats.mtime_ms, 2000.0);

    vfs.close(fd).await.unwrap();
    assert_eq!(vfs.read(fd, &mut [0u8; 1], 0, 1, None).await.unwrap_err().code, ErrorCode::EBADF);

    let stats = vfs.stat("/file.bin").await.unwrap();
    assert_eq!(stats.size, 4);
    assert_eq!(stats.mode & 0o777, 0o600);
}

#[test]
fn wire_format_round_trips() {
    let inode = Inode::new("blob-key".to_string(), 7, 0o100644, 10, 20);
    assert_eq!(Inode::deserialize(&inode.serialize()).unwrap(), inode);

    let mut stats = Stats::new(sandfs_core::FileType::File, 7, 0o644);
    stats.chown(10, 20);
    let decoded = Stats::deserialize(&stats.serialize()).unwrap();
    assert_eq!(decoded.size, stats.size);
    assert_eq!(decoded.mode, stats.mode);

    let err = ApiError::not_found("/gone");
    assert_eq!(ApiError::deserialize(&err.serialize()).unwrap(), err);
}

#[tokio::test]
async fn backend_realpath_is_identity_without_links() {
    let fs = in_memory_filesystem("rp").unwrap();
    fs.write_file("/f", b"x", FileFlag::W, 0o644, &ROOT)
        .await
        .unwrap();
    assert_eq!(fs.realpath("/f", &ROOT).await.unwrap(), "/f");
    assert_eq!(
        fs.realpath("/missing", &ROOT).await.unwrap_err().code,
        ErrorCode::ENOENT
    );
}

#[tokio::test]
async fn flag_string_round_trip_and_actions() {
    for s in [
        "r", "r+", "rs", "rs+", "w", "wx", "w+", "wx+", "a", "ax", "a+", "ax+",
    ] {
        assert_eq!(FileFlag::parse(s).unwrap().as_str(), s);
    }
    assert!(FileFlag::parse("q").is_err());
}

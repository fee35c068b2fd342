// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Serializing wrapper for asynchronous backends.
//!
//! Every async operation takes the per-path mutex on its primary path
//! (the source path for two-path operations) before delegating, and
//! releases it on every exit path. Sync operations never take the lock;
//! they are refused while the path is locked, because a sync call
//! completing in the middle of an in-flight async sequence would corrupt
//! it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::credentials::Credentials;
use crate::error::{ApiError, FsResult};
use crate::file::File;
use crate::filesystem::{FileSystem, FileSystemMetadata};
use crate::flag::FileFlag;
use crate::mutex::PathMutex;
use crate::stats::Stats;

pub struct LockedFs {
    fs: Arc<dyn FileSystem>,
    mutex: PathMutex,
}

struct LockGuard<'a> {
    mutex: &'a PathMutex,
    path: &'a str,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock(self.path);
    }
}

impl LockedFs {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            mutex: PathMutex::new(),
        }
    }

    async fn acquire<'a>(&'a self, p: &'a str) -> LockGuard<'a> {
        self.mutex.lock(p).await;
        LockGuard {
            mutex: &self.mutex,
            path: p,
        }
    }

    fn check_unlocked(&self, p: &str) -> FsResult<()> {
        if self.mutex.is_locked(p) {
            return Err(ApiError::invalid_argument("invalid sync call"));
        }
        Ok(())
    }
}

#[async_trait]
impl FileSystem for LockedFs {
    fn metadata(&self) -> FileSystemMetadata {
        self.fs.metadata()
    }

    fn is_available(&self) -> bool {
        self.fs.is_available()
    }

    async fn stat(&self, p: &str, cred: &Credentials) -> FsResult<Stats> {
        let _guard = self.acquire(p).await;
        self.fs.stat(p, cred).await
    }

    fn stat_sync(&self, p: &str, cred: &Credentials) -> FsResult<Stats> {
        self.check_unlocked(p)?;
        self.fs.stat_sync(p, cred)
    }

    async fn open_file(
        &self,
        p: &str,
        flag: FileFlag,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        let _guard = self.acquire(p).await;
        self.fs.open_file(p, flag, cred).await
    }

    fn open_file_sync(
        &self,
        p: &str,
        flag: FileFlag,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        self.check_unlocked(p)?;
        self.fs.open_file_sync(p, flag, cred)
    }

    async fn create_file(
        &self,
        p: &str,
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        let _guard = self.acquire(p).await;
        self.fs.create_file(p, flag, mode, cred).await
    }

    fn create_file_sync(
        &self,
        p: &str,
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        self.check_unlocked(p)?;
        self.fs.create_file_sync(p, flag, mode, cred)
    }

    async fn open(
        &self,
        p: &str,
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        let _guard = self.acquire(p).await;
        self.fs.open(p, flag, mode, cred).await
    }

    fn open_sync(
        &self,
        p: &str,
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        self.check_unlocked(p)?;
        self.fs.open_sync(p, flag, mode, cred)
    }

    async fn unlink(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        let _guard = self.acquire(p).await;
        self.fs.unlink(p, cred).await
    }

    fn unlink_sync(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        self.check_unlocked(p)?;
        self.fs.unlink_sync(p, cred)
    }

    async fn rmdir(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        let _guard = self.acquire(p).await;
        self.fs.rmdir(p, cred).await
    }

    fn rmdir_sync(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        self.check_unlocked(p)?;
        self.fs.rmdir_sync(p, cred)
    }

    async fn mkdir(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        let _guard = self.acquire(p).await;
        self.fs.mkdir(p, mode, cred).await
    }

    fn mkdir_sync(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        self.check_unlocked(p)?;
        self.fs.mkdir_sync(p, mode, cred)
    }

    async fn readdir(&self, p: &str, cred: &Credentials) -> FsResult<Vec<String>> {
        let _guard = self.acquire(p).await;
        self.fs.readdir(p, cred).await
    }

    fn readdir_sync(&self, p: &str, cred: &Credentials) -> FsResult<Vec<String>> {
        self.check_unlocked(p)?;
        self.fs.readdir_sync(p, cred)
    }

    async fn rename(&self, old_path: &str, new_path: &str, cred: &Credentials) -> FsResult<()> {
        let _guard = self.acquire(old_path).await;
        self.fs.rename(old_path, new_path, cred).await
    }

    fn rename_sync(&self, old_path: &str, new_path: &str, cred: &Credentials) -> FsResult<()> {
        self.check_unlocked(old_path)?;
        self.fs.rename_sync(old_path, new_path, cred)
    }

    async fn chmod(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        let _guard = self.acquire(p).await;
        self.fs.chmod(p, mode, cred).await
    }

    fn chmod_sync(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        self.check_unlocked(p)?;
        self.fs.chmod_sync(p, mode, cred)
    }

    async fn chown(&self, p: &str, uid: u32, gid: u32, cred: &Credentials) -> FsResult<()> {
        let _guard = self.acquire(p).await;
        self.fs.chown(p, uid, gid, cred).await
    }

    fn chown_sync(&self, p: &str, uid: u32, gid: u32, cred: &Credentials) -> FsResult<()> {
        self.check_unlocked(p)?;
        self.fs.chown_sync(p, uid, gid, cred)
    }

    async fn utimes(
        &self,
        p: &str,
        atime_ms: f64,
        mtime_ms: f64,
        cred: &Credentials,
    ) -> FsResult<()> {
        let _guard = self.acquire(p).await;
        self.fs.utimes(p, atime_ms, mtime_ms, cred).await
    }

    fn utimes_sync(
        &self,
        p: &str,
        atime_ms: f64,
        mtime_ms: f64,
        cred: &Credentials,
    ) -> FsResult<()> {
        self.check_unlocked(p)?;
        self.fs.utimes_sync(p, atime_ms, mtime_ms, cred)
    }

    async fn link(&self, existing: &str, new_path: &str, cred: &Credentials) -> FsResult<()> {
        let _guard = self.acquire(existing).await;
        self.fs.link(existing, new_path, cred).await
    }

    fn link_sync(&self, existing: &str, new_path: &str, cred: &Credentials) -> FsResult<()> {
        self.check_unlocked(existing)?;
        self.fs.link_sync(existing, new_path, cred)
    }

    async fn symlink(&self, target: &str, p: &str, cred: &Credentials) -> FsResult<()> {
        let _guard = self.acquire(target).await;
        self.fs.symlink(target, p, cred).await
    }

    fn symlink_sync(&self, target: &str, p: &str, cred: &Credentials) -> FsResult<()> {
        self.check_unlocked(target)?;
        self.fs.symlink_sync(target, p, cred)
    }

    async fn readlink(&self, p: &str, cred: &Credentials) -> FsResult<String> {
        let _guard = self.acquire(p).await;
        self.fs.readlink(p, cred).await
    }

    fn readlink_sync(&self, p: &str, cred: &Credentials) -> FsResult<String> {
        self.check_unlocked(p)?;
        self.fs.readlink_sync(p, cred)
    }

    async fn read_file(&self, p: &str, flag: FileFlag, cred: &Credentials) -> FsResult<Vec<u8>> {
        let _guard = self.acquire(p).await;
        self.fs.read_file(p, flag, cred).await
    }

    fn read_file_sync(&self, p: &str, flag: FileFlag, cred: &Credentials) -> FsResult<Vec<u8>> {
        self.check_unlocked(p)?;
        self.fs.read_file_sync(p, flag, cred)
    }

    async fn write_file(
        &self,
        p: &str,
        data: &[u8],
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<()> {
        let _guard = self.acquire(p).await;
        self.fs.write_file(p, data, flag, mode, cred).await
    }

    fn write_file_sync(
        &self,
        p: &str,
        data: &[u8],
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<()> {
        self.check_unlocked(p)?;
        self.fs.write_file_sync(p, data, flag, mode, cred)
    }

    async fn append_file(
        &self,
        p: &str,
        data: &[u8],
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<()> {
        let _guard = self.acquire(p).await;
        self.fs.append_file(p, data, flag, mode, cred).await
    }

    fn append_file_sync(
        &self,
        p: &str,
        data: &[u8],
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<()> {
        self.check_unlocked(p)?;
        self.fs.append_file_sync(p, data, flag, mode, cred)
    }

    async fn truncate(&self, p: &str, len: u64, cred: &Credentials) -> FsResult<()> {
        let _guard = self.acquire(p).await;
        self.fs.truncate(p, len, cred).await
    }

    fn truncate_sync(&self, p: &str, len: u64, cred: &Credentials) -> FsResult<()> {
        self.check_unlocked(p)?;
        self.fs.truncate_sync(p, len, cred)
    }

    async fn exists(&self, p: &str, cred: &Credentials) -> bool {
        let _guard = self.acquire(p).await;
        self.fs.exists(p, cred).await
    }

    fn exists_sync(&self, p: &str, cred: &Credentials) -> bool {
        if self.mutex.is_locked(p) {
            return false;
        }
        self.fs.exists_sync(p, cred)
    }

    async fn access(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        let _guard = self.acquire(p).await;
        self.fs.access(p, mode, cred).await
    }

    fn access_sync(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        self.check_unlocked(p)?;
        self.fs.access_sync(p, mode, cred)
    }

    async fn realpath(&self, p: &str, cred: &Credentials) -> FsResult<String> {
        let _guard = self.acquire(p).await;
        self.fs.realpath(p, cred).await
    }

    fn realpath_sync(&self, p: &str, cred: &Credentials) -> FsResult<String> {
        self.check_unlocked(p)?;
        self.fs.realpath_sync(p, cred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::async_key_value::AsyncKeyValueFileSystem;
    use crate::testing::InMemoryAsyncStore;

    async fn locked_fs() -> Arc<LockedFs> {
        let store = Arc::new(InMemoryAsyncStore::new("locked-test"));
        let fs = AsyncKeyValueFileSystem::new(store).await.unwrap();
        Arc::new(LockedFs::new(Arc::new(fs)))
    }

    #[tokio::test]
    async fn test_concurrent_writes_do_not_interleave() {
        let fs = locked_fs().await;
        let root = Credentials::ROOT;

        let mut handles = Vec::new();
        for content in [&b"AAAA"[..], &b"B"[..], &b"CC"[..]] {
            let fs = fs.clone();
            handles.push(tokio::spawn(async move {
                fs.write_file("/x", content, FileFlag::W, 0o644, &Credentials::ROOT)
                    .await
                    .unwrap();
            }));
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Writers were serialized in start order; the last one wins whole.
        let data = fs.read_file("/x", FileFlag::R, &root).await.unwrap();
        assert_eq!(data, b"CC");
    }

    #[tokio::test]
    async fn test_sync_call_on_locked_path_refused() {
        let fs = locked_fs().await;
        fs.mutex.lock("/x").await;
        let err = fs
            .write_file_sync("/x", b"Z", FileFlag::W, 0o644, &Credentials::ROOT)
            .unwrap_err();
        assert_eq!(err.message, "invalid sync call");
        fs.mutex.unlock("/x");
    }

    #[tokio::test]
    async fn test_error_releases_lock() {
        let fs = locked_fs().await;
        let root = Credentials::ROOT;
        assert!(fs.read_file("/missing", FileFlag::R, &root).await.is_err());
        assert!(!fs.mutex.is_locked("/missing"));
    }
}

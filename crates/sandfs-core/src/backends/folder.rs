// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Subtree adapter: presents a folder of a wrapped filesystem as a
//! filesystem of its own. Paths are prefixed on the way in; errors are
//! rewritten on the way out so callers never see the inner prefix.

use std::sync::Arc;

use async_trait::async_trait;

use crate::credentials::Credentials;
use crate::error::{ApiError, FsResult};
use crate::file::File;
use crate::filesystem::{FileSystem, FileSystemMetadata};
use crate::flag::FileFlag;
use crate::path;
use crate::stats::Stats;

pub struct FolderAdapterFs {
    fs: Arc<dyn FileSystem>,
    folder: String,
}

impl FolderAdapterFs {
    pub fn new(folder: impl Into<String>, fs: Arc<dyn FileSystem>) -> FsResult<Self> {
        let folder = path::normalize(&folder.into())?;
        Ok(Self { fs, folder })
    }

    /// The scoped folder must exist on a read-only wrapped filesystem;
    /// on a writable one, missing ancestors are created.
    pub async fn initialize(&self) -> FsResult<()> {
        if self.fs.exists(&self.folder, &Credentials::ROOT).await {
            return Ok(());
        }
        if self.fs.metadata().readonly {
            return Err(ApiError::not_found(&self.folder));
        }
        let mut prefix = String::from("/");
        for segment in self.folder.split('/').filter(|s| !s.is_empty()) {
            prefix = path::join(&prefix, segment);
            if !self.fs.exists(&prefix, &Credentials::ROOT).await {
                self.fs.mkdir(&prefix, 0o777, &Credentials::ROOT).await?;
            }
        }
        Ok(())
    }

    pub fn initialize_sync(&self) -> FsResult<()> {
        if self.fs.exists_sync(&self.folder, &Credentials::ROOT) {
            return Ok(());
        }
        if self.fs.metadata().readonly {
            return Err(ApiError::not_found(&self.folder));
        }
        let mut prefix = String::from("/");
        for segment in self.folder.split('/').filter(|s| !s.is_empty()) {
            prefix = path::join(&prefix, segment);
            if !self.fs.exists_sync(&prefix, &Credentials::ROOT) {
                self.fs.mkdir_sync(&prefix, 0o777, &Credentials::ROOT)?;
            }
        }
        Ok(())
    }

    fn inner_path(&self, p: &str) -> String {
        if p == "/" {
            self.folder.clone()
        } else {
            format!("{}{}", self.folder, p)
        }
    }

    /// Strip the folder prefix from the error's path and message so the
    /// caller sees the scoped path it asked about.
    fn rescope(&self, mut e: ApiError, inner: &str, outer: &str) -> ApiError {
        e.rescope_path(inner, outer);
        e
    }
}

#[async_trait]
impl FileSystem for FolderAdapterFs {
    fn metadata(&self) -> FileSystemMetadata {
        let mut md = self.fs.metadata();
        md.supports_links = false;
        md
    }

    fn is_available(&self) -> bool {
        self.fs.is_available()
    }

    async fn stat(&self, p: &str, cred: &Credentials) -> FsResult<Stats> {
        let inner = self.inner_path(p);
        self.fs
            .stat(&inner, cred)
            .await
            .map_err(|e| self.rescope(e, &inner, p))
    }

    fn stat_sync(&self, p: &str, cred: &Credentials) -> FsResult<Stats> {
        let inner = self.inner_path(p);
        self.fs
            .stat_sync(&inner, cred)
            .map_err(|e| self.rescope(e, &inner, p))
    }

    async fn open_file(
        &self,
        p: &str,
        flag: FileFlag,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        let inner = self.inner_path(p);
        self.fs
            .open_file(&inner, flag, cred)
            .await
            .map_err(|e| self.rescope(e, &inner, p))
    }

    fn open_file_sync(
        &self,
        p: &str,
        flag: FileFlag,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        let inner = self.inner_path(p);
        self.fs
            .open_file_sync(&inner, flag, cred)
            .map_err(|e| self.rescope(e, &inner, p))
    }

    async fn create_file(
        &self,
        p: &str,
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        let inner = self.inner_path(p);
        self.fs
            .create_file(&inner, flag, mode, cred)
            .await
            .map_err(|e| self.rescope(e, &inner, p))
    }

    fn create_file_sync(
        &self,
        p: &str,
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        let inner = self.inner_path(p);
        self.fs
            .create_file_sync(&inner, flag, mode, cred)
            .map_err(|e| self.rescope(e, &inner, p))
    }

    async fn open(
        &self,
        p: &str,
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        let inner = self.inner_path(p);
        self.fs
            .open(&inner, flag, mode, cred)
            .await
            .map_err(|e| self.rescope(e, &inner, p))
    }

    fn open_sync(
        &self,
        p: &str,
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        let inner = self.inner_path(p);
        self.fs
            .open_sync(&inner, flag, mode, cred)
            .map_err(|e| self.rescope(e, &inner, p))
    }

    async fn unlink(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        let inner = self.inner_path(p);
        self.fs
            .unlink(&inner, cred)
            .await
            .map_err(|e| self.rescope(e, &inner, p))
    }

    fn unlink_sync(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        let inner = self.inner_path(p);
        self.fs
            .unlink_sync(&inner, cred)
            .map_err(|e| self.rescope(e, &inner, p))
    }

    async fn rmdir(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        let inner = self.inner_path(p);
        self.fs
            .rmdir(&inner, cred)
            .await
            .map_err(|e| self.rescope(e, &inner, p))
    }

    fn rmdir_sync(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        let inner = self.inner_path(p);
        self.fs
            .rmdir_sync(&inner, cred)
            .map_err(|e| self.rescope(e, &inner, p))
    }

    async fn mkdir(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        let inner = self.inner_path(p);
        self.fs
            .mkdir(&inner, mode, cred)
            .await
            .map_err(|e| self.rescope(e, &inner, p))
    }

    fn mkdir_sync(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        let inner = self.inner_path(p);
        self.fs
            .mkdir_sync(&inner, mode, cred)
            .map_err(|e| self.rescope(e, &inner, p))
    }

    async fn readdir(&self, p: &str, cred: &Credentials) -> FsResult<Vec<String>> {
        let inner = self.inner_path(p);
        self.fs
            .readdir(&inner, cred)
            .await
            .map_err(|e| self.rescope(e, &inner, p))
    }

    fn readdir_sync(&self, p: &str, cred: &Credentials) -> FsResult<Vec<String>> {
        let inner = self.inner_path(p);
        self.fs
            .readdir_sync(&inner, cred)
            .map_err(|e| self.rescope(e, &inner, p))
    }

    async fn rename(&self, old_path: &str, new_path: &str, cred: &Credentials) -> FsResult<()> {
        let inner_old = self.inner_path(old_path);
        let inner_new = self.inner_path(new_path);
        self.fs.rename(&inner_old, &inner_new, cred).await.map_err(|e| {
            let e = self.rescope(e, &inner_old, old_path);
            self.rescope(e, &inner_new, new_path)
        })
    }

    fn rename_sync(&self, old_path: &str, new_path: &str, cred: &Credentials) -> FsResult<()> {
        let inner_old = self.inner_path(old_path);
        let inner_new = self.inner_path(new_path);
        self.fs.rename_sync(&inner_old, &inner_new, cred).map_err(|e| {
            let e = self.rescope(e, &inner_old, old_path);
            self.rescope(e, &inner_new, new_path)
        })
    }

    async fn chmod(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        let inner = self.inner_path(p);
        self.fs
            .chmod(&inner, mode, cred)
            .await
            .map_err(|e| self.rescope(e, &inner, p))
    }

    fn chmod_sync(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        let inner = self.inner_path(p);
        self.fs
            .chmod_sync(&inner, mode, cred)
            .map_err(|e| self.rescope(e, &inner, p))
    }

    async fn chown(&self, p: &str, uid: u32, gid: u32, cred: &Credentials) -> FsResult<()> {
        let inner = self.inner_path(p);
        self.fs
            .chown(&inner, uid, gid, cred)
            .await
            .map_err(|e| self.rescope(e, &inner, p))
    }

    fn chown_sync(&self, p: &str, uid: u32, gid: u32, cred: &Credentials) -> FsResult<()> {
        let inner = self.inner_path(p);
        self.fs
            .chown_sync(&inner, uid, gid, cred)
            .map_err(|e| self.rescope(e, &inner, p))
    }

    async fn utimes(
        &self,
        p: &str,
        atime_ms: f64,
        mtime_ms: f64,
        cred: &Credentials,
    ) -> FsResult<()> {
        let inner = self.inner_path(p);
        self.fs
            .utimes(&inner, atime_ms, mtime_ms, cred)
            .await
            .map_err(|e| self.rescope(e, &inner, p))
    }

    fn utimes_sync(
        &self,
        p: &str,
        atime_ms: f64,
        mtime_ms: f64,
        cred: &Credentials,
    ) -> FsResult<()> {
        let inner = self.inner_path(p);
        self.fs
            .utimes_sync(&inner, atime_ms, mtime_ms, cred)
            .map_err(|e| self.rescope(e, &inner, p))
    }

    async fn link(&self, existing: &str, new_path: &str, cred: &Credentials) -> FsResult<()> {
        let inner_existing = self.inner_path(existing);
        let inner_new = self.inner_path(new_path);
        self.fs
            .link(&inner_existing, &inner_new, cred)
            .await
            .map_err(|e| {
                let e = self.rescope(e, &inner_existing, existing);
                self.rescope(e, &inner_new, new_path)
            })
    }

    async fn symlink(&self, target: &str, p: &str, cred: &Credentials) -> FsResult<()> {
        let inner_target = self.inner_path(target);
        let inner_p = self.inner_path(p);
        self.fs
            .symlink(&inner_target, &inner_p, cred)
            .await
            .map_err(|e| {
                let e = self.rescope(e, &inner_target, target);
                self.rescope(e, &inner_p, p)
            })
    }

    async fn readlink(&self, p: &str, cred: &Credentials) -> FsResult<String> {
        let inner = self.inner_path(p);
        self.fs
            .readlink(&inner, cred)
            .await
            .map_err(|e| self.rescope(e, &inner, p))
    }

    async fn truncate(&self, p: &str, len: u64, cred: &Credentials) -> FsResult<()> {
        let inner = self.inner_path(p);
        self.fs
            .truncate(&inner, len, cred)
            .await
            .map_err(|e| self.rescope(e, &inner, p))
    }

    fn truncate_sync(&self, p: &str, len: u64, cred: &Credentials) -> FsResult<()> {
        let inner = self.inner_path(p);
        self.fs
            .truncate_sync(&inner, len, cred)
            .map_err(|e| self.rescope(e, &inner, p))
    }

    async fn exists(&self, p: &str, cred: &Credentials) -> bool {
        self.fs.exists(&self.inner_path(p), cred).await
    }

    fn exists_sync(&self, p: &str, cred: &Credentials) -> bool {
        self.fs.exists_sync(&self.inner_path(p), cred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::in_memory_filesystem;
    use crate::error::ErrorCode;

    async fn scoped() -> (FolderAdapterFs, Arc<dyn FileSystem>) {
        let base: Arc<dyn FileSystem> = Arc::new(in_memory_filesystem("base").unwrap());
        let fs = FolderAdapterFs::new("/scope", base.clone()).unwrap();
        fs.initialize().await.unwrap();
        (fs, base)
    }

    #[tokio::test]
    async fn test_initialize_creates_folder() {
        let (_, base) = scoped().await;
        assert!(base.exists_sync("/scope", &Credentials::ROOT));
    }

    #[tokio::test]
    async fn test_operations_are_prefixed() {
        let (fs, base) = scoped().await;
        let root = Credentials::ROOT;
        fs.write_file("/f.txt", b"data", FileFlag::W, 0o644, &root)
            .await
            .unwrap();
        assert_eq!(
            base.read_file_sync("/scope/f.txt", FileFlag::R, &root).unwrap(),
            b"data"
        );
        assert_eq!(fs.readdir("/", &root).await.unwrap(), ["f.txt"]);
    }

    #[tokio::test]
    async fn test_error_paths_are_rescoped() {
        let (fs, _) = scoped().await;
        let err = fs
            .stat("/missing.txt", &Credentials::ROOT)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ENOENT);
        assert_eq!(err.path.as_deref(), Some("/missing.txt"));
        assert!(!err.to_string().contains("/scope"));
    }

    #[tokio::test]
    async fn test_readonly_wrapped_requires_existing_folder() {
        let base: Arc<dyn FileSystem> = Arc::new(in_memory_filesystem("base").unwrap());

        struct ReadOnly(Arc<dyn FileSystem>);
        #[async_trait]
        impl FileSystem for ReadOnly {
            fn metadata(&self) -> FileSystemMetadata {
                let mut md = self.0.metadata();
                md.readonly = true;
                md
            }
            async fn stat(&self, p: &str, cred: &Credentials) -> FsResult<Stats> {
                self.0.stat(p, cred).await
            }
        }

        let ro: Arc<dyn FileSystem> = Arc::new(ReadOnly(base));
        let fs = FolderAdapterFs::new("/nope", ro).unwrap();
        let err = fs.initialize().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ENOENT);
    }
}

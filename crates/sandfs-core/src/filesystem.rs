// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The backend contract.
//!
//! Every backend implements [`FileSystem`]. Each operation has a
//! canonical async form and a sync twin. The async defaults delegate to
//! the sync twin, so a synchronous backend only implements the `_sync`
//! methods; an asynchronous backend overrides the async forms and leaves
//! the sync twins at their ENOTSUP default. Composite operations
//! (`open`, `read_file`, `write_file`, `append_file`, `truncate`) are
//! built from the primitives and rarely need overriding.

use async_trait::async_trait;

use crate::credentials::Credentials;
use crate::error::{ApiError, ErrorCode, FsResult};
use crate::file::File;
use crate::flag::{ActionType, FileFlag};
use crate::path;
use crate::stats::Stats;

/// Static capabilities and identity of a backend.
#[derive(Clone, Debug)]
pub struct FileSystemMetadata {
    pub name: String,
    pub readonly: bool,
    pub synchronous: bool,
    pub supports_properties: bool,
    pub supports_links: bool,
    pub total_space: u64,
    pub free_space: u64,
}

impl FileSystemMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            readonly: false,
            synchronous: false,
            supports_properties: false,
            supports_links: false,
            total_space: 0,
            free_space: 0,
        }
    }
}

fn not_synchronous(name: &str) -> ApiError {
    ApiError::not_supported(format!("{} is not a synchronous filesystem", name))
}

fn not_supported(name: &str, op: &str) -> ApiError {
    ApiError::not_supported(format!("{} does not support {}", name, op))
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    fn metadata(&self) -> FileSystemMetadata;

    /// Whether the backend can serve traffic; checked at mount time.
    fn is_available(&self) -> bool {
        true
    }

    // --- primitives ------------------------------------------------------

    async fn stat(&self, p: &str, cred: &Credentials) -> FsResult<Stats> {
        self.stat_sync(p, cred)
    }

    fn stat_sync(&self, p: &str, _cred: &Credentials) -> FsResult<Stats> {
        let _ = p;
        Err(not_synchronous(&self.metadata().name))
    }

    /// Open an existing file; access is checked against the flag.
    async fn open_file(
        &self,
        p: &str,
        flag: FileFlag,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        self.open_file_sync(p, flag, cred)
    }

    fn open_file_sync(
        &self,
        p: &str,
        _flag: FileFlag,
        _cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        let _ = p;
        Err(not_synchronous(&self.metadata().name))
    }

    /// Create an empty file and open it.
    async fn create_file(
        &self,
        p: &str,
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        self.create_file_sync(p, flag, mode, cred)
    }

    fn create_file_sync(
        &self,
        p: &str,
        _flag: FileFlag,
        _mode: u32,
        _cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        let _ = p;
        Err(not_synchronous(&self.metadata().name))
    }

    async fn unlink(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        self.unlink_sync(p, cred)
    }

    fn unlink_sync(&self, p: &str, _cred: &Credentials) -> FsResult<()> {
        let _ = p;
        Err(not_synchronous(&self.metadata().name))
    }

    async fn rmdir(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        self.rmdir_sync(p, cred)
    }

    fn rmdir_sync(&self, p: &str, _cred: &Credentials) -> FsResult<()> {
        let _ = p;
        Err(not_synchronous(&self.metadata().name))
    }

    async fn mkdir(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        self.mkdir_sync(p, mode, cred)
    }

    fn mkdir_sync(&self, p: &str, _mode: u32, _cred: &Credentials) -> FsResult<()> {
        let _ = p;
        Err(not_synchronous(&self.metadata().name))
    }

    async fn readdir(&self, p: &str, cred: &Credentials) -> FsResult<Vec<String>> {
        self.readdir_sync(p, cred)
    }

    fn readdir_sync(&self, p: &str, _cred: &Credentials) -> FsResult<Vec<String>> {
        let _ = p;
        Err(not_synchronous(&self.metadata().name))
    }

    async fn rename(&self, old_path: &str, new_path: &str, cred: &Credentials) -> FsResult<()> {
        self.rename_sync(old_path, new_path, cred)
    }

    fn rename_sync(&self, old_path: &str, _new_path: &str, _cred: &Credentials) -> FsResult<()> {
        let _ = old_path;
        Err(not_synchronous(&self.metadata().name))
    }

    async fn chmod(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        let mut file = self.open(p, FileFlag::RPlus, 0o644, cred).await?;
        let result = file.chmod(mode).await;
        let close_result = file.close().await;
        result?;
        close_result
    }

    fn chmod_sync(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        let mut file = self.open_sync(p, FileFlag::RPlus, 0o644, cred)?;
        let result = file.chmod_sync(mode);
        let close_result = file.close_sync();
        result?;
        close_result
    }

    async fn chown(&self, p: &str, uid: u32, gid: u32, cred: &Credentials) -> FsResult<()> {
        let mut file = self.open(p, FileFlag::RPlus, 0o644, cred).await?;
        let result = file.chown(uid, gid).await;
        let close_result = file.close().await;
        result?;
        close_result
    }

    fn chown_sync(&self, p: &str, uid: u32, gid: u32, cred: &Credentials) -> FsResult<()> {
        let mut file = self.open_sync(p, FileFlag::RPlus, 0o644, cred)?;
        let result = file.chown_sync(uid, gid);
        let close_result = file.close_sync();
        result?;
        close_result
    }

    async fn utimes(
        &self,
        p: &str,
        atime_ms: f64,
        mtime_ms: f64,
        cred: &Credentials,
    ) -> FsResult<()> {
        let mut file = self.open(p, FileFlag::RPlus, 0o644, cred).await?;
        let result = file.utimes(atime_ms, mtime_ms).await;
        let close_result = file.close().await;
        result?;
        close_result
    }

    fn utimes_sync(&self, p: &str, atime_ms: f64, mtime_ms: f64, cred: &Credentials) -> FsResult<()> {
        let mut file = self.open_sync(p, FileFlag::RPlus, 0o644, cred)?;
        let result = file.utimes_sync(atime_ms, mtime_ms);
        let close_result = file.close_sync();
        result?;
        close_result
    }

    async fn link(&self, existing: &str, new_path: &str, cred: &Credentials) -> FsResult<()> {
        self.link_sync(existing, new_path, cred)
    }

    fn link_sync(&self, _existing: &str, _new_path: &str, _cred: &Credentials) -> FsResult<()> {
        Err(not_supported(&self.metadata().name, "hard links"))
    }

    async fn symlink(&self, target: &str, p: &str, cred: &Credentials) -> FsResult<()> {
        self.symlink_sync(target, p, cred)
    }

    fn symlink_sync(&self, _target: &str, _p: &str, _cred: &Credentials) -> FsResult<()> {
        Err(not_supported(&self.metadata().name, "symbolic links"))
    }

    async fn readlink(&self, p: &str, cred: &Credentials) -> FsResult<String> {
        self.readlink_sync(p, cred)
    }

    fn readlink_sync(&self, _p: &str, _cred: &Credentials) -> FsResult<String> {
        Err(not_supported(&self.metadata().name, "symbolic links"))
    }

    // --- composites ------------------------------------------------------

    /// Open with full flag semantics: probes `stat` and applies the
    /// exists/not-exists action table.
    async fn open(
        &self,
        p: &str,
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        match self.stat(p, cred).await {
            Ok(stats) => {
                if stats.is_directory() {
                    return Err(ApiError::is_directory(p));
                }
                if !stats.has_access(flag.access_mode(), cred) {
                    return Err(ApiError::access_denied(p));
                }
                match flag.path_exists_action() {
                    ActionType::ThrowException => Err(ApiError::exists(p)),
                    ActionType::TruncateFile => {
                        self.unlink(p, cred).await?;
                        self.create_file(p, flag, stats.mode & 0o7777, cred).await
                    }
                    _ => self.open_file(p, flag, cred).await,
                }
            }
            Err(e) if e.code == ErrorCode::ENOENT => {
                let parent = path::dirname(p);
                let parent_stats = self.stat(&parent, cred).await?;
                if !parent_stats.is_directory() {
                    return Err(ApiError::not_a_directory(parent));
                }
                if !parent_stats.has_access(0o2, cred) {
                    return Err(ApiError::access_denied(p));
                }
                match flag.path_not_exists_action() {
                    ActionType::CreateFile => self.create_file(p, flag, mode, cred).await,
                    _ => Err(ApiError::not_found(p)),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn open_sync(
        &self,
        p: &str,
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        match self.stat_sync(p, cred) {
            Ok(stats) => {
                if stats.is_directory() {
                    return Err(ApiError::is_directory(p));
                }
                if !stats.has_access(flag.access_mode(), cred) {
                    return Err(ApiError::access_denied(p));
                }
                match flag.path_exists_action() {
                    ActionType::ThrowException => Err(ApiError::exists(p)),
                    ActionType::TruncateFile => {
                        self.unlink_sync(p, cred)?;
                        self.create_file_sync(p, flag, stats.mode & 0o7777, cred)
                    }
                    _ => self.open_file_sync(p, flag, cred),
                }
            }
            Err(e) if e.code == ErrorCode::ENOENT => {
                let parent = path::dirname(p);
                let parent_stats = self.stat_sync(&parent, cred)?;
                if !parent_stats.is_directory() {
                    return Err(ApiError::not_a_directory(parent));
                }
                if !parent_stats.has_access(0o2, cred) {
                    return Err(ApiError::access_denied(p));
                }
                match flag.path_not_exists_action() {
                    ActionType::CreateFile => self.create_file_sync(p, flag, mode, cred),
                    _ => Err(ApiError::not_found(p)),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn read_file(&self, p: &str, flag: FileFlag, cred: &Credentials) -> FsResult<Vec<u8>> {
        let mut file = self.open(p, flag, 0o644, cred).await?;
        let result: FsResult<Vec<u8>> = (|| {
            let stats = file.stat()?;
            let mut buf = vec![0u8; stats.size as usize];
            let n = file.read(&mut buf, 0, stats.size as usize, Some(0))?;
            buf.truncate(n);
            Ok(buf)
        })();
        let close_result = file.close().await;
        let data = result?;
        close_result?;
        Ok(data)
    }

    fn read_file_sync(&self, p: &str, flag: FileFlag, cred: &Credentials) -> FsResult<Vec<u8>> {
        let mut file = self.open_sync(p, flag, 0o644, cred)?;
        let result: FsResult<Vec<u8>> = (|| {
            let stats = file.stat()?;
            let mut buf = vec![0u8; stats.size as usize];
            let n = file.read(&mut buf, 0, stats.size as usize, Some(0))?;
            buf.truncate(n);
            Ok(buf)
        })();
        let close_result = file.close_sync();
        let data = result?;
        close_result?;
        Ok(data)
    }

    async fn write_file(
        &self,
        p: &str,
        data: &[u8],
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<()> {
        let mut file = self.open(p, flag, mode, cred).await?;
        let result = file.write(data, 0, data.len(), Some(0)).await;
        let close_result = file.close().await;
        result?;
        close_result
    }

    fn write_file_sync(
        &self,
        p: &str,
        data: &[u8],
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<()> {
        let mut file = self.open_sync(p, flag, mode, cred)?;
        let result = file.write_sync(data, 0, data.len(), Some(0));
        let close_result = file.close_sync();
        result?;
        close_result
    }

    async fn append_file(
        &self,
        p: &str,
        data: &[u8],
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<()> {
        let mut file = self.open(p, flag, mode, cred).await?;
        let result = file.write(data, 0, data.len(), None).await;
        let close_result = file.close().await;
        result?;
        close_result
    }

    fn append_file_sync(
        &self,
        p: &str,
        data: &[u8],
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<()> {
        let mut file = self.open_sync(p, flag, mode, cred)?;
        let result = file.write_sync(data, 0, data.len(), None);
        let close_result = file.close_sync();
        result?;
        close_result
    }

    async fn truncate(&self, p: &str, len: u64, cred: &Credentials) -> FsResult<()> {
        let mut file = self.open(p, FileFlag::RPlus, 0o644, cred).await?;
        let result = file.truncate(len).await;
        let close_result = file.close().await;
        result?;
        close_result
    }

    fn truncate_sync(&self, p: &str, len: u64, cred: &Credentials) -> FsResult<()> {
        let mut file = self.open_sync(p, FileFlag::RPlus, 0o644, cred)?;
        let result = file.truncate_sync(len);
        let close_result = file.close_sync();
        result?;
        close_result
    }

    async fn exists(&self, p: &str, cred: &Credentials) -> bool {
        self.stat(p, cred).await.is_ok()
    }

    fn exists_sync(&self, p: &str, cred: &Credentials) -> bool {
        self.stat_sync(p, cred).is_ok()
    }

    async fn access(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        let stats = self.stat(p, cred).await?;
        if !stats.has_access(mode, cred) {
            return Err(ApiError::access_denied(p));
        }
        Ok(())
    }

    fn access_sync(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        let stats = self.stat_sync(p, cred)?;
        if !stats.has_access(mode, cred) {
            return Err(ApiError::access_denied(p));
        }
        Ok(())
    }

    /// Identity for backends without symlink support; backends that do
    /// support links resolve the path segment by segment.
    async fn realpath(&self, p: &str, cred: &Credentials) -> FsResult<String> {
        if !self.metadata().supports_links {
            if !self.exists(p, cred).await {
                return Err(ApiError::not_found(p));
            }
            return Ok(p.to_string());
        }
        let mut resolved = String::from("/");
        for segment in p.split('/').filter(|s| !s.is_empty()) {
            resolved = path::join(&resolved, segment);
            let stats = self.stat(&resolved, cred).await?;
            if stats.is_symlink() {
                let target = self.readlink(&resolved, cred).await?;
                resolved = path::normalize(&target)?;
            }
        }
        Ok(resolved)
    }

    fn realpath_sync(&self, p: &str, cred: &Credentials) -> FsResult<String> {
        if !self.metadata().supports_links {
            if !self.exists_sync(p, cred) {
                return Err(ApiError::not_found(p));
            }
            return Ok(p.to_string());
        }
        let mut resolved = String::from("/");
        for segment in p.split('/').filter(|s| !s.is_empty()) {
            resolved = path::join(&resolved, segment);
            let stats = self.stat_sync(&resolved, cred)?;
            if stats.is_symlink() {
                let target = self.readlink_sync(&resolved, cred)?;
                resolved = path::normalize(&target)?;
            }
        }
        Ok(resolved)
    }
}

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Overlay filesystem: a writable upper layer unioned over a read-only
//! lower layer.
//!
//! Writes land on the upper layer, reads prefer it; files that exist
//! only below are copied up on first modification. Deletions of lower
//! files are recorded as whiteouts in a log file persisted on the upper
//! layer (`/.deletedFiles.log`) and replayed on initialization, so a
//! remount sees the same union.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::credentials::Credentials;
use crate::error::{ApiError, ErrorCode, FsResult};
use crate::file::{File, PreloadFile, WriteOutcome};
use crate::filesystem::{FileSystem, FileSystemMetadata};
use crate::flag::{ActionType, FileFlag};
use crate::path;
use crate::stats::Stats;

/// Whiteout log location on the upper layer.
pub const DELETION_LOG_PATH: &str = "/.deletedFiles.log";

struct LogFlushState {
    flushing: bool,
    needs_rewrite: bool,
}

pub(crate) struct OverlayInner {
    upper: Arc<dyn FileSystem>,
    lower: Arc<dyn FileSystem>,
    deleted_files: Mutex<HashMap<String, bool>>,
    log_contents: Mutex<String>,
    log_flush: Mutex<LogFlushState>,
    log_error: Mutex<Option<ApiError>>,
    initialized: AtomicBool,
}

/// The overlay backend. `upper` must be writable; `lower` is never
/// modified.
pub struct OverlayFs {
    inner: Arc<OverlayInner>,
}

impl OverlayFs {
    pub fn new(upper: Arc<dyn FileSystem>, lower: Arc<dyn FileSystem>) -> FsResult<Self> {
        if upper.metadata().readonly {
            return Err(ApiError::invalid_argument(
                "the upper layer of an overlay must be writable",
            ));
        }
        Ok(Self {
            inner: Arc::new(OverlayInner {
                upper,
                lower,
                deleted_files: Mutex::new(HashMap::new()),
                log_contents: Mutex::new(String::new()),
                log_flush: Mutex::new(LogFlushState {
                    flushing: false,
                    needs_rewrite: false,
                }),
                log_error: Mutex::new(None),
                initialized: AtomicBool::new(false),
            }),
        })
    }

    /// Replay the persisted whiteout log. Must complete before any other
    /// operation.
    pub async fn initialize(&self) -> FsResult<()> {
        let contents = match self
            .inner
            .upper
            .read_file(DELETION_LOG_PATH, FileFlag::R, &Credentials::ROOT)
            .await
        {
            Ok(data) => String::from_utf8_lossy(&data).into_owned(),
            Err(e) if e.code == ErrorCode::ENOENT => String::new(),
            Err(e) => return Err(e),
        };
        self.inner.replay_log(&contents);
        self.inner.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn initialize_sync(&self) -> FsResult<()> {
        let contents = match self.inner.upper.read_file_sync(
            DELETION_LOG_PATH,
            FileFlag::R,
            &Credentials::ROOT,
        ) {
            Ok(data) => String::from_utf8_lossy(&data).into_owned(),
            Err(e) if e.code == ErrorCode::ENOENT => String::new(),
            Err(e) => return Err(e),
        };
        self.inner.replay_log(&contents);
        self.inner.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl OverlayInner {
    fn replay_log(&self, contents: &str) {
        let mut deleted = self.deleted_files.lock().unwrap();
        deleted.clear();
        for line in contents.lines() {
            if line.is_empty() {
                continue;
            }
            deleted.insert(line[1..].to_string(), line.starts_with('d'));
        }
        *self.log_contents.lock().unwrap() = contents.to_string();
    }

    fn check_initialized(&self) -> FsResult<()> {
        if let Some(e) = self.log_error.lock().unwrap().take() {
            return Err(e);
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(ApiError::new(
                ErrorCode::EPERM,
                "overlay is not initialized; call initialize() before use",
            ));
        }
        Ok(())
    }

    fn check_path(&self, p: &str) -> FsResult<()> {
        if p == DELETION_LOG_PATH {
            return Err(ApiError::not_permitted(p));
        }
        Ok(())
    }

    fn is_deleted(&self, p: &str) -> bool {
        self.deleted_files.lock().unwrap().get(p).copied() == Some(true)
    }

    fn mark_deleted(&self, p: &str) -> String {
        self.deleted_files
            .lock()
            .unwrap()
            .insert(p.to_string(), true);
        format!("d{}\n", p)
    }

    fn mark_undeleted(&self, p: &str) -> Option<String> {
        let mut deleted = self.deleted_files.lock().unwrap();
        if deleted.get(p).copied() == Some(true) {
            deleted.insert(p.to_string(), false);
            Some(format!("u{}\n", p))
        } else {
            None
        }
    }

    /// Append to the whiteout log and flush it to the upper layer. A
    /// single flush is in flight at a time; concurrent updates coalesce
    /// into one follow-up write. A flush failure is latched and raised
    /// on the next operation.
    async fn update_log(&self, addition: String) {
        self.log_contents.lock().unwrap().push_str(&addition);
        {
            let mut state = self.log_flush.lock().unwrap();
            if state.flushing {
                state.needs_rewrite = true;
                return;
            }
            state.flushing = true;
        }
        loop {
            let contents = self.log_contents.lock().unwrap().clone();
            let result = self
                .upper
                .write_file(
                    DELETION_LOG_PATH,
                    contents.as_bytes(),
                    FileFlag::W,
                    0o644,
                    &Credentials::ROOT,
                )
                .await;
            if let Err(e) = result {
                warn!("deletion log flush failed: {}", e);
                *self.log_error.lock().unwrap() = Some(e);
                break;
            }
            let mut state = self.log_flush.lock().unwrap();
            if state.needs_rewrite {
                state.needs_rewrite = false;
            } else {
                break;
            }
        }
        self.log_flush.lock().unwrap().flushing = false;
    }

    fn update_log_sync(&self, addition: String) {
        self.log_contents.lock().unwrap().push_str(&addition);
        let contents = self.log_contents.lock().unwrap().clone();
        let result = self.upper.write_file_sync(
            DELETION_LOG_PATH,
            contents.as_bytes(),
            FileFlag::W,
            0o644,
            &Credentials::ROOT,
        );
        if let Err(e) = result {
            warn!("deletion log flush failed: {}", e);
            *self.log_error.lock().unwrap() = Some(e);
        }
    }

    async fn exists_union(&self, p: &str, cred: &Credentials) -> bool {
        self.upper.exists(p, cred).await
            || (self.lower.exists(p, cred).await && !self.is_deleted(p))
    }

    fn exists_union_sync(&self, p: &str, cred: &Credentials) -> bool {
        self.upper.exists_sync(p, cred)
            || (self.lower.exists_sync(p, cred) && !self.is_deleted(p))
    }

    async fn stat_union(&self, p: &str, cred: &Credentials) -> FsResult<Stats> {
        match self.upper.stat(p, cred).await {
            Ok(stats) => Ok(stats),
            Err(e) if e.code == ErrorCode::ENOENT => {
                if self.is_deleted(p) {
                    return Err(ApiError::not_found(p));
                }
                let mut stats = self.lower.stat(p, cred).await?;
                // Lower entries surface as writable so a later copy-up
                // is not refused by the mode bits.
                stats.mode |= 0o222;
                Ok(stats)
            }
            Err(e) => Err(e),
        }
    }

    fn stat_union_sync(&self, p: &str, cred: &Credentials) -> FsResult<Stats> {
        match self.upper.stat_sync(p, cred) {
            Ok(stats) => Ok(stats),
            Err(e) if e.code == ErrorCode::ENOENT => {
                if self.is_deleted(p) {
                    return Err(ApiError::not_found(p));
                }
                let mut stats = self.lower.stat_sync(p, cred)?;
                stats.mode |= 0o222;
                Ok(stats)
            }
            Err(e) => Err(e),
        }
    }

    /// Create every missing ancestor of `p` on the upper layer, copying
    /// modes from whichever layer has the directory.
    async fn create_parent_directories(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        let mut parent = path::dirname(p);
        let mut to_create = Vec::new();
        while !self.upper.exists(&parent, cred).await {
            to_create.push(parent.clone());
            parent = path::dirname(&parent);
        }
        for dir in to_create.into_iter().rev() {
            let mode = self.stat_union(&dir, cred).await?.mode & 0o7777;
            self.upper.mkdir(&dir, mode, cred).await?;
        }
        Ok(())
    }

    fn create_parent_directories_sync(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        let mut parent = path::dirname(p);
        let mut to_create = Vec::new();
        while !self.upper.exists_sync(&parent, cred) {
            to_create.push(parent.clone());
            parent = path::dirname(&parent);
        }
        for dir in to_create.into_iter().rev() {
            let mode = self.stat_union_sync(&dir, cred)?.mode & 0o7777;
            self.upper.mkdir_sync(&dir, mode, cred)?;
        }
        Ok(())
    }

    /// Copy a lower-only entry to the upper layer.
    async fn copy_to_writable(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        let stats = self.stat_union(p, cred).await?;
        debug!(path = p, "copy-up to upper layer");
        if stats.is_directory() {
            self.upper.mkdir(p, stats.mode & 0o7777, cred).await?;
        } else {
            let data = self.lower.read_file(p, FileFlag::R, cred).await?;
            self.upper
                .write_file(p, &data, FileFlag::W, stats.mode & 0o7777, cred)
                .await?;
        }
        Ok(())
    }

    fn copy_to_writable_sync(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        let stats = self.stat_union_sync(p, cred)?;
        debug!(path = p, "copy-up to upper layer");
        if stats.is_directory() {
            self.upper.mkdir_sync(p, stats.mode & 0o7777, cred)?;
        } else {
            let data = self.lower.read_file_sync(p, FileFlag::R, cred)?;
            self.upper
                .write_file_sync(p, &data, FileFlag::W, stats.mode & 0o7777, cred)?;
        }
        Ok(())
    }

    /// Ensure `p` is materialized on the upper layer before a mutation.
    async fn operate_on_writable(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        if !self.exists_union(p, cred).await {
            return Err(ApiError::not_found(p));
        }
        if !self.upper.exists(p, cred).await {
            self.create_parent_directories(p, cred).await?;
            self.copy_to_writable(p, cred).await?;
        }
        Ok(())
    }

    fn operate_on_writable_sync(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        if !self.exists_union_sync(p, cred) {
            return Err(ApiError::not_found(p));
        }
        if !self.upper.exists_sync(p, cred) {
            self.create_parent_directories_sync(p, cred)?;
            self.copy_to_writable_sync(p, cred)?;
        }
        Ok(())
    }

    async fn undelete(&self, p: &str) {
        if let Some(line) = self.mark_undeleted(p) {
            self.update_log(line).await;
        }
    }

    fn undelete_sync(&self, p: &str) {
        if let Some(line) = self.mark_undeleted(p) {
            self.update_log_sync(line);
        }
    }

    async fn delete_path(&self, p: &str) {
        let line = self.mark_deleted(p);
        self.update_log(line).await;
    }

    fn delete_path_sync(&self, p: &str) {
        let line = self.mark_deleted(p);
        self.update_log_sync(line);
    }

    fn rename_recursive<'a>(
        self: &'a Arc<Self>,
        old_path: &'a str,
        new_path: &'a str,
        cred: &'a Credentials,
    ) -> Pin<Box<dyn Future<Output = FsResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let old_stats = self.stat_union(old_path, cred).await?;
            if old_stats.is_directory() {
                if old_path == new_path {
                    return Ok(());
                }
                let mut mode = 0o777;
                if self.exists_union(new_path, cred).await {
                    let stats = self.stat_union(new_path, cred).await?;
                    mode = stats.mode & 0o7777;
                    if stats.is_directory() {
                        if !self.readdir_union(new_path, cred).await?.is_empty() {
                            return Err(ApiError::not_empty(new_path));
                        }
                    } else {
                        return Err(ApiError::not_a_directory(new_path));
                    }
                }

                if self.upper.exists(old_path, cred).await {
                    self.upper.rename(old_path, new_path, cred).await?;
                } else if !self.upper.exists(new_path, cred).await {
                    self.create_parent_directories(new_path, cred).await?;
                    self.upper.mkdir(new_path, mode, cred).await?;
                }

                if self.lower.exists(old_path, cred).await {
                    for child in self.lower.readdir(old_path, cred).await? {
                        // Moving a lower child materializes it on the
                        // upper layer and whiteouts the original.
                        self.rename_recursive(
                            &path::join(old_path, &child),
                            &path::join(new_path, &child),
                            cred,
                        )
                        .await?;
                    }
                }
            } else {
                if self.exists_union(new_path, cred).await
                    && self.stat_union(new_path, cred).await?.is_directory()
                {
                    return Err(ApiError::is_directory(new_path));
                }
                if old_path != new_path {
                    let data = self.read_file_union(old_path, cred).await?;
                    self.create_parent_directories(new_path, cred).await?;
                    self.undelete(new_path).await;
                    self.upper
                        .write_file(
                            new_path,
                            &data,
                            FileFlag::W,
                            old_stats.mode & 0o7777,
                            cred,
                        )
                        .await?;
                }
            }

            if old_path != new_path && self.exists_union(old_path, cred).await {
                self.unlink_union(old_path, cred).await?;
            }
            Ok(())
        })
    }

    fn rename_recursive_sync(
        self: &Arc<Self>,
        old_path: &str,
        new_path: &str,
        cred: &Credentials,
    ) -> FsResult<()> {
        let old_stats = self.stat_union_sync(old_path, cred)?;
        if old_stats.is_directory() {
            if old_path == new_path {
                return Ok(());
            }
            let mut mode = 0o777;
            if self.exists_union_sync(new_path, cred) {
                let stats = self.stat_union_sync(new_path, cred)?;
                mode = stats.mode & 0o7777;
                if stats.is_directory() {
                    if !self.readdir_union_sync(new_path, cred)?.is_empty() {
                        return Err(ApiError::not_empty(new_path));
                    }
                } else {
                    return Err(ApiError::not_a_directory(new_path));
                }
            }

            if self.upper.exists_sync(old_path, cred) {
                self.upper.rename_sync(old_path, new_path, cred)?;
            } else if !self.upper.exists_sync(new_path, cred) {
                self.create_parent_directories_sync(new_path, cred)?;
                self.upper.mkdir_sync(new_path, mode, cred)?;
            }

            if self.lower.exists_sync(old_path, cred) {
                for child in self.lower.readdir_sync(old_path, cred)? {
                    self.rename_recursive_sync(
                        &path::join(old_path, &child),
                        &path::join(new_path, &child),
                        cred,
                    )?;
                }
            }
        } else {
            if self.exists_union_sync(new_path, cred)
                && self.stat_union_sync(new_path, cred)?.is_directory()
            {
                return Err(ApiError::is_directory(new_path));
            }
            if old_path != new_path {
                let data = self.read_file_union_sync(old_path, cred)?;
                self.create_parent_directories_sync(new_path, cred)?;
                self.undelete_sync(new_path);
                self.upper.write_file_sync(
                    new_path,
                    &data,
                    FileFlag::W,
                    old_stats.mode & 0o7777,
                    cred,
                )?;
            }
        }

        if old_path != new_path && self.exists_union_sync(old_path, cred) {
            self.unlink_union_sync(old_path, cred)?;
        }
        Ok(())
    }

    async fn readdir_union(&self, p: &str, cred: &Credentials) -> FsResult<Vec<String>> {
        let stats = self.stat_union(p, cred).await?;
        if !stats.is_directory() {
            return Err(ApiError::not_a_directory(p));
        }
        let upper_entries = self.upper.readdir(p, cred).await.unwrap_or_default();
        let lower_entries = self.lower.readdir(p, cred).await.unwrap_or_default();
        Ok(self.merge_listings(p, upper_entries, lower_entries))
    }

    fn readdir_union_sync(&self, p: &str, cred: &Credentials) -> FsResult<Vec<String>> {
        let stats = self.stat_union_sync(p, cred)?;
        if !stats.is_directory() {
            return Err(ApiError::not_a_directory(p));
        }
        let upper_entries = self.upper.readdir_sync(p, cred).unwrap_or_default();
        let lower_entries = self.lower.readdir_sync(p, cred).unwrap_or_default();
        Ok(self.merge_listings(p, upper_entries, lower_entries))
    }

    fn merge_listings(
        &self,
        p: &str,
        upper_entries: Vec<String>,
        lower_entries: Vec<String>,
    ) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for entry in upper_entries.into_iter().chain(lower_entries) {
            if entry == path::basename(DELETION_LOG_PATH) && p == "/" {
                continue;
            }
            if self.is_deleted(&path::join(p, &entry)) {
                continue;
            }
            if !seen.contains(&entry) {
                seen.push(entry);
            }
        }
        seen
    }

    async fn unlink_union(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        if !self.exists_union(p, cred).await {
            return Err(ApiError::not_found(p));
        }
        if self.upper.exists(p, cred).await {
            self.upper.unlink(p, cred).await?;
        }
        if self.exists_union(p, cred).await {
            self.delete_path(p).await;
        }
        Ok(())
    }

    fn unlink_union_sync(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        if !self.exists_union_sync(p, cred) {
            return Err(ApiError::not_found(p));
        }
        if self.upper.exists_sync(p, cred) {
            self.upper.unlink_sync(p, cred)?;
        }
        if self.exists_union_sync(p, cred) {
            self.delete_path_sync(p);
        }
        Ok(())
    }

    async fn read_file_union(&self, p: &str, cred: &Credentials) -> FsResult<Vec<u8>> {
        if self.upper.exists(p, cred).await {
            self.upper.read_file(p, FileFlag::R, cred).await
        } else if !self.is_deleted(p) {
            self.lower.read_file(p, FileFlag::R, cred).await
        } else {
            Err(ApiError::not_found(p))
        }
    }

    fn read_file_union_sync(&self, p: &str, cred: &Credentials) -> FsResult<Vec<u8>> {
        if self.upper.exists_sync(p, cred) {
            self.upper.read_file_sync(p, FileFlag::R, cred)
        } else if !self.is_deleted(p) {
            self.lower.read_file_sync(p, FileFlag::R, cred)
        } else {
            Err(ApiError::not_found(p))
        }
    }
}

#[async_trait]
impl FileSystem for OverlayFs {
    fn metadata(&self) -> FileSystemMetadata {
        let upper = self.inner.upper.metadata();
        let lower = self.inner.lower.metadata();
        FileSystemMetadata {
            name: "OverlayFS".to_string(),
            readonly: false,
            synchronous: upper.synchronous && lower.synchronous,
            supports_properties: upper.supports_properties && lower.supports_properties,
            supports_links: upper.supports_links && lower.supports_links,
            total_space: upper.total_space,
            free_space: upper.free_space,
        }
    }

    async fn stat(&self, p: &str, cred: &Credentials) -> FsResult<Stats> {
        self.inner.check_initialized()?;
        self.inner.check_path(p)?;
        self.inner.stat_union(p, cred).await
    }

    fn stat_sync(&self, p: &str, cred: &Credentials) -> FsResult<Stats> {
        self.inner.check_initialized()?;
        self.inner.check_path(p)?;
        self.inner.stat_union_sync(p, cred)
    }

    async fn open(
        &self,
        p: &str,
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        self.inner.check_initialized()?;
        self.inner.check_path(p)?;
        if self.inner.exists_union(p, cred).await {
            match flag.path_exists_action() {
                ActionType::TruncateFile => {
                    self.inner.create_parent_directories(p, cred).await?;
                    self.inner.upper.open(p, flag, mode, cred).await
                }
                ActionType::Nop => {
                    if self.inner.upper.exists(p, cred).await {
                        self.inner.upper.open(p, flag, mode, cred).await
                    } else {
                        let data = self.inner.lower.read_file(p, FileFlag::R, cred).await?;
                        let mut stats = self.inner.lower.stat(p, cred).await?;
                        stats.chmod(mode);
                        Ok(Box::new(OverlayFile::new(
                            self.inner.clone(),
                            *cred,
                            p.to_string(),
                            flag,
                            stats,
                            data,
                        )?) as Box<dyn File>)
                    }
                }
                _ => Err(ApiError::exists(p)),
            }
        } else {
            match flag.path_not_exists_action() {
                ActionType::CreateFile => {
                    self.inner.create_parent_directories(p, cred).await?;
                    self.inner.undelete(p).await;
                    self.inner.upper.open(p, flag, mode, cred).await
                }
                _ => Err(ApiError::not_found(p)),
            }
        }
    }

    fn open_sync(
        &self,
        p: &str,
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        self.inner.check_initialized()?;
        self.inner.check_path(p)?;
        if self.inner.exists_union_sync(p, cred) {
            match flag.path_exists_action() {
                ActionType::TruncateFile => {
                    self.inner.create_parent_directories_sync(p, cred)?;
                    self.inner.upper.open_sync(p, flag, mode, cred)
                }
                ActionType::Nop => {
                    if self.inner.upper.exists_sync(p, cred) {
                        self.inner.upper.open_sync(p, flag, mode, cred)
                    } else {
                        let data = self.inner.lower.read_file_sync(p, FileFlag::R, cred)?;
                        let mut stats = self.inner.lower.stat_sync(p, cred)?;
                        stats.chmod(mode);
                        Ok(Box::new(OverlayFile::new(
                            self.inner.clone(),
                            *cred,
                            p.to_string(),
                            flag,
                            stats,
                            data,
                        )?) as Box<dyn File>)
                    }
                }
                _ => Err(ApiError::exists(p)),
            }
        } else {
            match flag.path_not_exists_action() {
                ActionType::CreateFile => {
                    self.inner.create_parent_directories_sync(p, cred)?;
                    self.inner.undelete_sync(p);
                    self.inner.upper.open_sync(p, flag, mode, cred)
                }
                _ => Err(ApiError::not_found(p)),
            }
        }
    }

    async fn open_file(
        &self,
        p: &str,
        flag: FileFlag,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        self.open(p, flag, 0o644, cred).await
    }

    fn open_file_sync(
        &self,
        p: &str,
        flag: FileFlag,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        self.open_sync(p, flag, 0o644, cred)
    }

    async fn create_file(
        &self,
        p: &str,
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        self.inner.check_initialized()?;
        self.inner.check_path(p)?;
        self.inner.create_parent_directories(p, cred).await?;
        self.inner.undelete(p).await;
        self.inner.upper.create_file(p, flag, mode, cred).await
    }

    fn create_file_sync(
        &self,
        p: &str,
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        self.inner.check_initialized()?;
        self.inner.check_path(p)?;
        self.inner.create_parent_directories_sync(p, cred)?;
        self.inner.undelete_sync(p);
        self.inner.upper.create_file_sync(p, flag, mode, cred)
    }

    async fn unlink(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        self.inner.check_initialized()?;
        self.inner.check_path(p)?;
        self.inner.unlink_union(p, cred).await
    }

    fn unlink_sync(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        self.inner.check_initialized()?;
        self.inner.check_path(p)?;
        self.inner.unlink_union_sync(p, cred)
    }

    async fn rmdir(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        self.inner.check_initialized()?;
        if !self.inner.exists_union(p, cred).await {
            return Err(ApiError::not_found(p));
        }
        if !self.inner.readdir_union(p, cred).await?.is_empty() {
            return Err(ApiError::not_empty(p));
        }
        if self.inner.upper.exists(p, cred).await {
            self.inner.upper.rmdir(p, cred).await?;
        }
        if self.inner.exists_union(p, cred).await {
            self.inner.delete_path(p).await;
        }
        Ok(())
    }

    fn rmdir_sync(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        self.inner.check_initialized()?;
        if !self.inner.exists_union_sync(p, cred) {
            return Err(ApiError::not_found(p));
        }
        if !self.inner.readdir_union_sync(p, cred)?.is_empty() {
            return Err(ApiError::not_empty(p));
        }
        if self.inner.upper.exists_sync(p, cred) {
            self.inner.upper.rmdir_sync(p, cred)?;
        }
        if self.inner.exists_union_sync(p, cred) {
            self.inner.delete_path_sync(p);
        }
        Ok(())
    }

    async fn mkdir(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        self.inner.check_initialized()?;
        self.inner.check_path(p)?;
        if self.inner.exists_union(p, cred).await {
            return Err(ApiError::exists(p));
        }
        self.inner.create_parent_directories(p, cred).await?;
        self.inner.undelete(p).await;
        self.inner.upper.mkdir(p, mode, cred).await
    }

    fn mkdir_sync(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        self.inner.check_initialized()?;
        self.inner.check_path(p)?;
        if self.inner.exists_union_sync(p, cred) {
            return Err(ApiError::exists(p));
        }
        self.inner.create_parent_directories_sync(p, cred)?;
        self.inner.undelete_sync(p);
        self.inner.upper.mkdir_sync(p, mode, cred)
    }

    async fn readdir(&self, p: &str, cred: &Credentials) -> FsResult<Vec<String>> {
        self.inner.check_initialized()?;
        self.inner.readdir_union(p, cred).await
    }

    fn readdir_sync(&self, p: &str, cred: &Credentials) -> FsResult<Vec<String>> {
        self.inner.check_initialized()?;
        self.inner.readdir_union_sync(p, cred)
    }

    async fn rename(&self, old_path: &str, new_path: &str, cred: &Credentials) -> FsResult<()> {
        self.inner.check_initialized()?;
        self.inner.check_path(old_path)?;
        self.inner.check_path(new_path)?;
        self.inner.rename_recursive(old_path, new_path, cred).await
    }

    fn rename_sync(&self, old_path: &str, new_path: &str, cred: &Credentials) -> FsResult<()> {
        self.inner.check_initialized()?;
        self.inner.check_path(old_path)?;
        self.inner.check_path(new_path)?;
        self.inner.rename_recursive_sync(old_path, new_path, cred)
    }

    async fn chmod(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        self.inner.check_initialized()?;
        self.inner.operate_on_writable(p, cred).await?;
        self.inner.upper.chmod(p, mode, cred).await
    }

    fn chmod_sync(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        self.inner.check_initialized()?;
        self.inner.operate_on_writable_sync(p, cred)?;
        self.inner.upper.chmod_sync(p, mode, cred)
    }

    async fn chown(&self, p: &str, uid: u32, gid: u32, cred: &Credentials) -> FsResult<()> {
        self.inner.check_initialized()?;
        self.inner.operate_on_writable(p, cred).await?;
        self.inner.upper.chown(p, uid, gid, cred).await
    }

    fn chown_sync(&self, p: &str, uid: u32, gid: u32, cred: &Credentials) -> FsResult<()> {
        self.inner.check_initialized()?;
        self.inner.operate_on_writable_sync(p, cred)?;
        self.inner.upper.chown_sync(p, uid, gid, cred)
    }

    async fn utimes(
        &self,
        p: &str,
        atime_ms: f64,
        mtime_ms: f64,
        cred: &Credentials,
    ) -> FsResult<()> {
        self.inner.check_initialized()?;
        self.inner.operate_on_writable(p, cred).await?;
        self.inner.upper.utimes(p, atime_ms, mtime_ms, cred).await
    }

    fn utimes_sync(
        &self,
        p: &str,
        atime_ms: f64,
        mtime_ms: f64,
        cred: &Credentials,
    ) -> FsResult<()> {
        self.inner.check_initialized()?;
        self.inner.operate_on_writable_sync(p, cred)?;
        self.inner.upper.utimes_sync(p, atime_ms, mtime_ms, cred)
    }

    async fn truncate(&self, p: &str, len: u64, cred: &Credentials) -> FsResult<()> {
        self.inner.check_initialized()?;
        self.inner.operate_on_writable(p, cred).await?;
        self.inner.upper.truncate(p, len, cred).await
    }

    fn truncate_sync(&self, p: &str, len: u64, cred: &Credentials) -> FsResult<()> {
        self.inner.check_initialized()?;
        self.inner.operate_on_writable_sync(p, cred)?;
        self.inner.upper.truncate_sync(p, len, cred)
    }

    async fn exists(&self, p: &str, cred: &Credentials) -> bool {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.exists_union(p, cred).await
    }

    fn exists_sync(&self, p: &str, cred: &Credentials) -> bool {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.exists_union_sync(p, cred)
    }
}

/// A handle for a file that lives only on the lower layer: reads come
/// from the buffered lower contents, and the first `sync` materializes
/// the file on the upper layer.
pub struct OverlayFile {
    inner: Arc<OverlayInner>,
    cred: Credentials,
    pre: PreloadFile,
}

impl OverlayFile {
    fn new(
        inner: Arc<OverlayInner>,
        cred: Credentials,
        path: String,
        flag: FileFlag,
        stats: Stats,
        data: Vec<u8>,
    ) -> FsResult<Self> {
        Ok(Self {
            inner,
            cred,
            pre: PreloadFile::new(path, flag, stats, data)?,
        })
    }
}

#[async_trait]
impl File for OverlayFile {
    fn path(&self) -> &str {
        self.pre.path()
    }

    fn flag(&self) -> FileFlag {
        self.pre.flag()
    }

    fn stat(&self) -> FsResult<Stats> {
        Ok(*self.pre.stat())
    }

    fn get_pos(&self) -> u64 {
        self.pre.get_pos()
    }

    fn read(
        &mut self,
        buf: &mut [u8],
        offset: usize,
        length: usize,
        position: Option<u64>,
    ) -> FsResult<usize> {
        self.pre.read_at(buf, offset, length, position)
    }

    async fn write(
        &mut self,
        data: &[u8],
        offset: usize,
        length: usize,
        position: Option<u64>,
    ) -> FsResult<usize> {
        match self.pre.write_at(data, offset, length, position)? {
            WriteOutcome::Buffered(n) => Ok(n),
            WriteOutcome::NeedsSync(total) => {
                self.sync().await?;
                Ok(total)
            }
        }
    }

    fn write_sync(
        &mut self,
        data: &[u8],
        offset: usize,
        length: usize,
        position: Option<u64>,
    ) -> FsResult<usize> {
        match self.pre.write_at(data, offset, length, position)? {
            WriteOutcome::Buffered(n) => Ok(n),
            WriteOutcome::NeedsSync(total) => {
                self.sync_sync()?;
                Ok(total)
            }
        }
    }

    async fn truncate(&mut self, len: u64) -> FsResult<()> {
        if self.pre.truncate_to(len)? {
            self.sync().await?;
        }
        Ok(())
    }

    fn truncate_sync(&mut self, len: u64) -> FsResult<()> {
        if self.pre.truncate_to(len)? {
            self.sync_sync()?;
        }
        Ok(())
    }

    async fn sync(&mut self) -> FsResult<()> {
        if self.pre.is_dirty() {
            let path = self.pre.path().to_string();
            self.inner
                .create_parent_directories(&path, &self.cred)
                .await?;
            self.inner
                .upper
                .write_file(
                    &path,
                    self.pre.buffer(),
                    FileFlag::W,
                    self.pre.stat().mode & 0o7777,
                    &self.cred,
                )
                .await?;
            self.pre.mark_clean();
        }
        Ok(())
    }

    fn sync_sync(&mut self) -> FsResult<()> {
        if self.pre.is_dirty() {
            let path = self.pre.path().to_string();
            self.inner
                .create_parent_directories_sync(&path, &self.cred)?;
            self.inner.upper.write_file_sync(
                &path,
                self.pre.buffer(),
                FileFlag::W,
                self.pre.stat().mode & 0o7777,
                &self.cred,
            )?;
            self.pre.mark_clean();
        }
        Ok(())
    }

    async fn chmod(&mut self, mode: u32) -> FsResult<()> {
        self.pre.set_mode(mode);
        self.sync().await
    }

    fn chmod_sync(&mut self, mode: u32) -> FsResult<()> {
        self.pre.set_mode(mode);
        self.sync_sync()
    }

    async fn chown(&mut self, uid: u32, gid: u32) -> FsResult<()> {
        self.pre.set_owner(uid, gid);
        self.sync().await
    }

    fn chown_sync(&mut self, uid: u32, gid: u32) -> FsResult<()> {
        self.pre.set_owner(uid, gid);
        self.sync_sync()
    }

    async fn utimes(&mut self, atime_ms: f64, mtime_ms: f64) -> FsResult<()> {
        self.pre.set_times(atime_ms, mtime_ms);
        self.sync().await
    }

    fn utimes_sync(&mut self, atime_ms: f64, mtime_ms: f64) -> FsResult<()> {
        self.pre.set_times(atime_ms, mtime_ms);
        self.sync_sync()
    }
}

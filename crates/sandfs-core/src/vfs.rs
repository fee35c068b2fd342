// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The virtual filesystem instance: mount table, path dispatch, and the
//! open-file table.
//!
//! A `Vfs` owns all process-wide state (mounts, file descriptors,
//! current credentials), so several instances can coexist and tests can
//! construct them freely. Paths are normalized at this boundary,
//! symlinks are resolved against the mount table, and errors coming back
//! from a backend are rewritten to the caller's path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::backends::memory::in_memory_filesystem;
use crate::credentials::Credentials;
use crate::error::{ApiError, ErrorCode, FsResult};
use crate::file::File;
use crate::filesystem::FileSystem;
use crate::flag::FileFlag;
use crate::path;
use crate::stats::Stats;

/// Default mode for `open`/`write_file`/`append_file`.
pub const DEFAULT_FILE_MODE: u32 = 0o644;
/// Default mode for `mkdir`.
pub const DEFAULT_DIR_MODE: u32 = 0o777;
/// Default probe mode for `access`.
pub const DEFAULT_ACCESS_MODE: u32 = 0o600;

/// File descriptors start here; lower values are left to convention.
const FIRST_FD: u64 = 100;

/// Cap on symlink indirections during realpath traversal.
const MAX_LINK_DEPTH: usize = 64;

pub struct Vfs {
    /// Mount prefixes sorted by descending length; the first prefix of
    /// which a path is a prefix wins.
    mounts: RwLock<Vec<(String, Arc<dyn FileSystem>)>>,
    fds: Mutex<HashMap<u64, Box<dyn File>>>,
    next_fd: AtomicU64,
    cred: RwLock<Credentials>,
}

impl Vfs {
    /// A fresh instance with an in-memory filesystem mounted at `/`.
    pub fn new() -> FsResult<Self> {
        let root: Arc<dyn FileSystem> = Arc::new(in_memory_filesystem("InMemory")?);
        Ok(Self {
            mounts: RwLock::new(vec![("/".to_string(), root)]),
            fds: Mutex::new(HashMap::new()),
            next_fd: AtomicU64::new(FIRST_FD),
            cred: RwLock::new(Credentials::ROOT),
        })
    }

    pub fn credentials(&self) -> Credentials {
        *self.cred.read().unwrap()
    }

    pub fn set_credentials(&self, cred: Credentials) {
        *self.cred.write().unwrap() = cred;
    }

    // --- mount table -----------------------------------------------------

    /// Replace the mount table wholesale. The default root mount is
    /// dropped; every backend must report itself available.
    pub fn initialize(&self, map: Vec<(String, Arc<dyn FileSystem>)>) -> FsResult<()> {
        let mut prepared = Vec::with_capacity(map.len());
        for (point, fs) in map {
            let point = path::normalize(&point)?;
            if !fs.is_available() {
                return Err(ApiError::invalid_argument(format!(
                    "backend mounted at '{}' is not available",
                    point
                )));
            }
            prepared.push((point, fs));
        }
        let mut mounts = self.mounts.write().unwrap();
        mounts.clear();
        for (point, fs) in prepared {
            if mounts.iter().any(|(p, _)| *p == point) {
                return Err(ApiError::invalid_argument(format!(
                    "mount point '{}' is already in use",
                    point
                )));
            }
            debug!(point = %point, backend = %fs.metadata().name, "mount");
            mounts.push((point, fs));
        }
        mounts.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));
        Ok(())
    }

    pub fn mount(&self, point: &str, fs: Arc<dyn FileSystem>) -> FsResult<()> {
        let point = path::normalize(point)?;
        if !fs.is_available() {
            return Err(ApiError::invalid_argument(format!(
                "backend mounted at '{}' is not available",
                point
            )));
        }
        let mut mounts = self.mounts.write().unwrap();
        if mounts.iter().any(|(p, _)| *p == point) {
            return Err(ApiError::invalid_argument(format!(
                "mount point '{}' is already in use",
                point
            )));
        }
        debug!(point = %point, backend = %fs.metadata().name, "mount");
        mounts.push((point, fs));
        mounts.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));
        Ok(())
    }

    pub fn umount(&self, point: &str) -> FsResult<()> {
        let point = path::normalize(point)?;
        let mut mounts = self.mounts.write().unwrap();
        let before = mounts.len();
        mounts.retain(|(p, _)| *p != point);
        if mounts.len() == before {
            return Err(ApiError::invalid_argument(format!(
                "no filesystem mounted at '{}'",
                point
            )));
        }
        debug!(point = %point, "umount");
        Ok(())
    }

    /// Longest-prefix resolution of a normalized path to its backend and
    /// intra-backend path.
    fn resolve(&self, p: &str) -> FsResult<(String, Arc<dyn FileSystem>, String)> {
        let mounts = self.mounts.read().unwrap();
        for (prefix, fs) in mounts.iter() {
            if path::is_under(p, prefix) {
                let rel = if p == prefix {
                    "/".to_string()
                } else if prefix == "/" {
                    p.to_string()
                } else {
                    p[prefix.len()..].to_string()
                };
                return Ok((prefix.clone(), fs.clone(), rel));
            }
        }
        Err(ApiError::io(format!("no filesystem mounted for '{}'", p)))
    }

    fn rescope<T>(result: FsResult<T>, rel: &str, user: &str) -> FsResult<T> {
        result.map_err(|mut e| {
            e.rescope_path(rel, user);
            e
        })
    }

    // --- symlink-aware path resolution -----------------------------------

    /// Resolve mount-local symlinks. Errors with ENOENT when the path
    /// does not exist.
    pub async fn realpath(&self, p: &str) -> FsResult<String> {
        let cred = self.credentials();
        let mut current = path::normalize(p)?;
        for _ in 0..MAX_LINK_DEPTH {
            let (mount_point, fs, rel) = self.resolve(&current)?;
            let stats = Self::rescope(fs.stat(&rel, &cred).await, &rel, &current)?;
            if !stats.is_symlink() {
                return Ok(current);
            }
            let target = Self::rescope(fs.readlink(&rel, &cred).await, &rel, &current)?;
            let target = path::normalize(&target)?;
            current = if mount_point == "/" {
                target
            } else {
                path::normalize(&format!("{}{}", mount_point, target))?
            };
        }
        Err(ApiError::io(format!(
            "too many levels of symbolic links: '{}'",
            p
        )))
    }

    pub fn realpath_sync(&self, p: &str) -> FsResult<String> {
        let cred = self.credentials();
        let mut current = path::normalize(p)?;
        for _ in 0..MAX_LINK_DEPTH {
            let (mount_point, fs, rel) = self.resolve(&current)?;
            let stats = Self::rescope(fs.stat_sync(&rel, &cred), &rel, &current)?;
            if !stats.is_symlink() {
                return Ok(current);
            }
            let target = Self::rescope(fs.readlink_sync(&rel, &cred), &rel, &current)?;
            let target = path::normalize(&target)?;
            current = if mount_point == "/" {
                target
            } else {
                path::normalize(&format!("{}{}", mount_point, target))?
            };
        }
        Err(ApiError::io(format!(
            "too many levels of symbolic links: '{}'",
            p
        )))
    }

    /// Follow symlinks where the target may not exist yet (creation
    /// paths): a missing leaf resolves to the normalized input.
    async fn follow(&self, p: &str) -> FsResult<String> {
        match self.realpath(p).await {
            Ok(resolved) => Ok(resolved),
            Err(e) if e.code == ErrorCode::ENOENT => path::normalize(p),
            Err(e) => Err(e),
        }
    }

    fn follow_sync(&self, p: &str) -> FsResult<String> {
        match self.realpath_sync(p) {
            Ok(resolved) => Ok(resolved),
            Err(e) if e.code == ErrorCode::ENOENT => path::normalize(p),
            Err(e) => Err(e),
        }
    }

    // --- path operations -------------------------------------------------
    //
    // Symlink policy, per operation. Operations that address the file an
    // entry points at resolve the path through `follow` first: stat,
    // access, readdir, open, read_file, write_file, append_file,
    // truncate, chmod, chown, utimes. Operations that address the entry
    // itself dispatch on the normalized path and never follow a trailing
    // link: lstat, lchmod, lchown, lutimes, unlink, rmdir, mkdir,
    // rename, link, symlink, readlink.

    pub async fn stat(&self, p: &str) -> FsResult<Stats> {
        let cred = self.credentials();
        let p = self.follow(p).await?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.stat(&rel, &cred).await, &rel, &p)
    }

    pub fn stat_sync(&self, p: &str) -> FsResult<Stats> {
        let cred = self.credentials();
        let p = self.follow_sync(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.stat_sync(&rel, &cred), &rel, &p)
    }

    /// Like `stat`, without following a trailing symlink.
    pub async fn lstat(&self, p: &str) -> FsResult<Stats> {
        let cred = self.credentials();
        let p = path::normalize(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.stat(&rel, &cred).await, &rel, &p)
    }

    pub fn lstat_sync(&self, p: &str) -> FsResult<Stats> {
        let cred = self.credentials();
        let p = path::normalize(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.stat_sync(&rel, &cred), &rel, &p)
    }

    pub async fn exists(&self, p: &str) -> bool {
        self.stat(p).await.is_ok()
    }

    pub fn exists_sync(&self, p: &str) -> bool {
        self.stat_sync(p).is_ok()
    }

    pub async fn access(&self, p: &str, mode: u32) -> FsResult<()> {
        let cred = self.credentials();
        let stats = self.stat(p).await?;
        if !stats.has_access(mode, &cred) {
            return Err(ApiError::access_denied(p));
        }
        Ok(())
    }

    pub fn access_sync(&self, p: &str, mode: u32) -> FsResult<()> {
        let cred = self.credentials();
        let stats = self.stat_sync(p)?;
        if !stats.has_access(mode, &cred) {
            return Err(ApiError::access_denied(p));
        }
        Ok(())
    }

    /// A trailing symlink is not followed: mkdir over an existing entry
    /// of any kind is EEXIST.
    pub async fn mkdir(&self, p: &str, mode: u32) -> FsResult<()> {
        let cred = self.credentials();
        let p = path::normalize(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.mkdir(&rel, mode, &cred).await, &rel, &p)
    }

    pub fn mkdir_sync(&self, p: &str, mode: u32) -> FsResult<()> {
        let cred = self.credentials();
        let p = path::normalize(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.mkdir_sync(&rel, mode, &cred), &rel, &p)
    }

    /// A trailing symlink is not followed: rmdir must name the directory
    /// itself, not a link to one.
    pub async fn rmdir(&self, p: &str) -> FsResult<()> {
        let cred = self.credentials();
        let p = path::normalize(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.rmdir(&rel, &cred).await, &rel, &p)
    }

    pub fn rmdir_sync(&self, p: &str) -> FsResult<()> {
        let cred = self.credentials();
        let p = path::normalize(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.rmdir_sync(&rel, &cred), &rel, &p)
    }

    pub async fn unlink(&self, p: &str) -> FsResult<()> {
        let cred = self.credentials();
        let p = path::normalize(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.unlink(&rel, &cred).await, &rel, &p)
    }

    pub fn unlink_sync(&self, p: &str) -> FsResult<()> {
        let cred = self.credentials();
        let p = path::normalize(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.unlink_sync(&rel, &cred), &rel, &p)
    }

    /// Backend listing plus any mount point sitting directly beneath the
    /// path.
    pub async fn readdir(&self, p: &str) -> FsResult<Vec<String>> {
        let cred = self.credentials();
        let p = self.follow(p).await?;
        let (_, fs, rel) = self.resolve(&p)?;
        let mut entries = Self::rescope(fs.readdir(&rel, &cred).await, &rel, &p)?;
        self.add_mount_entries(&p, &mut entries);
        Ok(entries)
    }

    pub fn readdir_sync(&self, p: &str) -> FsResult<Vec<String>> {
        let cred = self.credentials();
        let p = self.follow_sync(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        let mut entries = Self::rescope(fs.readdir_sync(&rel, &cred), &rel, &p)?;
        self.add_mount_entries(&p, &mut entries);
        Ok(entries)
    }

    fn add_mount_entries(&self, p: &str, entries: &mut Vec<String>) {
        let mounts = self.mounts.read().unwrap();
        for (prefix, _) in mounts.iter() {
            if prefix != "/" && path::dirname(prefix) == p {
                let name = path::basename(prefix).to_string();
                if !entries.contains(&name) {
                    entries.push(name);
                }
            }
        }
    }

    /// Listing with a stats record per entry.
    pub async fn readdir_with_stats(&self, p: &str) -> FsResult<Vec<(String, Stats)>> {
        let p = self.follow(p).await?;
        let names = self.readdir(&p).await?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let child = path::join(&p, &name);
            let stats = self.stat(&child).await?;
            out.push((name, stats));
        }
        Ok(out)
    }

    pub fn readdir_with_stats_sync(&self, p: &str) -> FsResult<Vec<(String, Stats)>> {
        let p = self.follow_sync(p)?;
        let names = self.readdir_sync(&p)?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let child = path::join(&p, &name);
            let stats = self.stat_sync(&child)?;
            out.push((name, stats));
        }
        Ok(out)
    }

    /// Same-mount renames go to the backend; a cross-mount rename falls
    /// back to copy-then-unlink.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        let cred = self.credentials();
        let old_path = path::normalize(old_path)?;
        let new_path = path::normalize(new_path)?;
        let (old_mount, old_fs, old_rel) = self.resolve(&old_path)?;
        let (new_mount, _, _) = self.resolve(&new_path)?;
        if old_mount == new_mount {
            let new_rel = if new_path == old_mount {
                "/".to_string()
            } else if old_mount == "/" {
                new_path.clone()
            } else {
                new_path[old_mount.len()..].to_string()
            };
            let result = old_fs.rename(&old_rel, &new_rel, &cred).await;
            return Self::rescope(Self::rescope(result, &old_rel, &old_path), &new_rel, &new_path);
        }
        debug!(old = %old_path, new = %new_path, "cross-mount rename, copying");
        let data = self.read_file(&old_path, FileFlag::R).await?;
        self.write_file(&new_path, &data, FileFlag::W, DEFAULT_FILE_MODE)
            .await?;
        self.unlink(&old_path).await
    }

    pub fn rename_sync(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        let cred = self.credentials();
        let old_path = path::normalize(old_path)?;
        let new_path = path::normalize(new_path)?;
        let (old_mount, old_fs, old_rel) = self.resolve(&old_path)?;
        let (new_mount, _, _) = self.resolve(&new_path)?;
        if old_mount == new_mount {
            let new_rel = if new_path == old_mount {
                "/".to_string()
            } else if old_mount == "/" {
                new_path.clone()
            } else {
                new_path[old_mount.len()..].to_string()
            };
            let result = old_fs.rename_sync(&old_rel, &new_rel, &cred);
            return Self::rescope(Self::rescope(result, &old_rel, &old_path), &new_rel, &new_path);
        }
        debug!(old = %old_path, new = %new_path, "cross-mount rename, copying");
        let data = self.read_file_sync(&old_path, FileFlag::R)?;
        self.write_file_sync(&new_path, &data, FileFlag::W, DEFAULT_FILE_MODE)?;
        self.unlink_sync(&old_path)
    }

    pub async fn read_file(&self, p: &str, flag: FileFlag) -> FsResult<Vec<u8>> {
        let cred = self.credentials();
        let p = self.follow(p).await?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.read_file(&rel, flag, &cred).await, &rel, &p)
    }

    pub fn read_file_sync(&self, p: &str, flag: FileFlag) -> FsResult<Vec<u8>> {
        let cred = self.credentials();
        let p = self.follow_sync(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.read_file_sync(&rel, flag, &cred), &rel, &p)
    }

    pub async fn write_file(
        &self,
        p: &str,
        data: &[u8],
        flag: FileFlag,
        mode: u32,
    ) -> FsResult<()> {
        let cred = self.credentials();
        let p = self.follow(p).await?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.write_file(&rel, data, flag, mode, &cred).await, &rel, &p)
    }

    pub fn write_file_sync(&self, p: &str, data: &[u8], flag: FileFlag, mode: u32) -> FsResult<()> {
        let cred = self.credentials();
        let p = self.follow_sync(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.write_file_sync(&rel, data, flag, mode, &cred), &rel, &p)
    }

    pub async fn append_file(
        &self,
        p: &str,
        data: &[u8],
        flag: FileFlag,
        mode: u32,
    ) -> FsResult<()> {
        let cred = self.credentials();
        let p = self.follow(p).await?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(
            fs.append_file(&rel, data, flag, mode, &cred).await,
            &rel,
            &p,
        )
    }

    pub fn append_file_sync(
        &self,
        p: &str,
        data: &[u8],
        flag: FileFlag,
        mode: u32,
    ) -> FsResult<()> {
        let cred = self.credentials();
        let p = self.follow_sync(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.append_file_sync(&rel, data, flag, mode, &cred), &rel, &p)
    }

    pub async fn truncate(&self, p: &str, len: u64) -> FsResult<()> {
        let cred = self.credentials();
        let p = self.follow(p).await?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.truncate(&rel, len, &cred).await, &rel, &p)
    }

    pub fn truncate_sync(&self, p: &str, len: u64) -> FsResult<()> {
        let cred = self.credentials();
        let p = self.follow_sync(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.truncate_sync(&rel, len, &cred), &rel, &p)
    }

    pub async fn chmod(&self, p: &str, mode: u32) -> FsResult<()> {
        let cred = self.credentials();
        let p = self.follow(p).await?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.chmod(&rel, mode, &cred).await, &rel, &p)
    }

    pub fn chmod_sync(&self, p: &str, mode: u32) -> FsResult<()> {
        let cred = self.credentials();
        let p = self.follow_sync(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.chmod_sync(&rel, mode, &cred), &rel, &p)
    }

    /// `chmod` on the path itself, never following a trailing symlink.
    pub async fn lchmod(&self, p: &str, mode: u32) -> FsResult<()> {
        let cred = self.credentials();
        let p = path::normalize(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.chmod(&rel, mode, &cred).await, &rel, &p)
    }

    pub async fn chown(&self, p: &str, uid: u32, gid: u32) -> FsResult<()> {
        let cred = self.credentials();
        let p = self.follow(p).await?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.chown(&rel, uid, gid, &cred).await, &rel, &p)
    }

    pub fn chown_sync(&self, p: &str, uid: u32, gid: u32) -> FsResult<()> {
        let cred = self.credentials();
        let p = self.follow_sync(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.chown_sync(&rel, uid, gid, &cred), &rel, &p)
    }

    pub async fn lchown(&self, p: &str, uid: u32, gid: u32) -> FsResult<()> {
        let cred = self.credentials();
        let p = path::normalize(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.chown(&rel, uid, gid, &cred).await, &rel, &p)
    }

    pub async fn utimes(&self, p: &str, atime_ms: f64, mtime_ms: f64) -> FsResult<()> {
        let cred = self.credentials();
        let p = self.follow(p).await?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.utimes(&rel, atime_ms, mtime_ms, &cred).await, &rel, &p)
    }

    pub fn utimes_sync(&self, p: &str, atime_ms: f64, mtime_ms: f64) -> FsResult<()> {
        let cred = self.credentials();
        let p = self.follow_sync(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.utimes_sync(&rel, atime_ms, mtime_ms, &cred), &rel, &p)
    }

    pub async fn lutimes(&self, p: &str, atime_ms: f64, mtime_ms: f64) -> FsResult<()> {
        let cred = self.credentials();
        let p = path::normalize(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.utimes(&rel, atime_ms, mtime_ms, &cred).await, &rel, &p)
    }

    pub async fn link(&self, existing: &str, new_path: &str) -> FsResult<()> {
        let cred = self.credentials();
        let existing = path::normalize(existing)?;
        let new_path = path::normalize(new_path)?;
        let (mount, fs, existing_rel) = self.resolve(&existing)?;
        let (new_mount, _, new_rel) = self.resolve(&new_path)?;
        if mount != new_mount {
            return Err(ApiError::not_supported(
                "hard links cannot cross mount points",
            ));
        }
        Self::rescope(
            fs.link(&existing_rel, &new_rel, &cred).await,
            &existing_rel,
            &existing,
        )
    }

    pub async fn symlink(&self, target: &str, p: &str) -> FsResult<()> {
        let cred = self.credentials();
        let p = path::normalize(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.symlink(target, &rel, &cred).await, &rel, &p)
    }

    pub async fn readlink(&self, p: &str) -> FsResult<String> {
        let cred = self.credentials();
        let p = path::normalize(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        Self::rescope(fs.readlink(&rel, &cred).await, &rel, &p)
    }

    // --- file descriptors ------------------------------------------------

    pub async fn open(&self, p: &str, flag: FileFlag, mode: u32) -> FsResult<u64> {
        let cred = self.credentials();
        let p = self.follow(p).await?;
        let (_, fs, rel) = self.resolve(&p)?;
        let file = Self::rescope(fs.open(&rel, flag, mode, &cred).await, &rel, &p)?;
        Ok(self.install_fd(file))
    }

    pub fn open_sync(&self, p: &str, flag: FileFlag, mode: u32) -> FsResult<u64> {
        let cred = self.credentials();
        let p = self.follow_sync(p)?;
        let (_, fs, rel) = self.resolve(&p)?;
        let file = Self::rescope(fs.open_sync(&rel, flag, mode, &cred), &rel, &p)?;
        Ok(self.install_fd(file))
    }

    fn install_fd(&self, file: Box<dyn File>) -> u64 {
        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        self.fds.lock().unwrap().insert(fd, file);
        fd
    }

    fn take_fd(&self, fd: u64) -> FsResult<Box<dyn File>> {
        self.fds
            .lock()
            .unwrap()
            .remove(&fd)
            .ok_or_else(ApiError::bad_descriptor)
    }

    fn put_fd(&self, fd: u64, file: Box<dyn File>) {
        self.fds.lock().unwrap().insert(fd, file);
    }

    pub async fn close(&self, fd: u64) -> FsResult<()> {
        let mut file = self.take_fd(fd)?;
        file.close().await
    }

    pub fn close_sync(&self, fd: u64) -> FsResult<()> {
        let mut file = self.take_fd(fd)?;
        file.close_sync()
    }

    pub fn fstat(&self, fd: u64) -> FsResult<Stats> {
        let file = self.take_fd(fd)?;
        let stats = file.stat();
        self.put_fd(fd, file);
        stats
    }

    pub async fn read(
        &self,
        fd: u64,
        buf: &mut [u8],
        offset: usize,
        length: usize,
        position: Option<u64>,
    ) -> FsResult<usize> {
        let mut file = self.take_fd(fd)?;
        let result = file.read(buf, offset, length, position);
        self.put_fd(fd, file);
        result
    }

    pub fn read_sync(
        &self,
        fd: u64,
        buf: &mut [u8],
        offset: usize,
        length: usize,
        position: Option<u64>,
    ) -> FsResult<usize> {
        let mut file = self.take_fd(fd)?;
        let result = file.read(buf, offset, length, position);
        self.put_fd(fd, file);
        result
    }

    pub async fn write(
        &self,
        fd: u64,
        data: &[u8],
        offset: usize,
        length: usize,
        position: Option<u64>,
    ) -> FsResult<usize> {
        let mut file = self.take_fd(fd)?;
        let result = file.write(data, offset, length, position).await;
        self.put_fd(fd, file);
        result
    }

    pub fn write_sync(
        &self,
        fd: u64,
        data: &[u8],
        offset: usize,
        length: usize,
        position: Option<u64>,
    ) -> FsResult<usize> {
        let mut file = self.take_fd(fd)?;
        let result = file.write_sync(data, offset, length, position);
        self.put_fd(fd, file);
        result
    }

    pub async fn ftruncate(&self, fd: u64, len: u64) -> FsResult<()> {
        let mut file = self.take_fd(fd)?;
        let result = file.truncate(len).await;
        self.put_fd(fd, file);
        result
    }

    pub fn ftruncate_sync(&self, fd: u64, len: u64) -> FsResult<()> {
        let mut file = self.take_fd(fd)?;
        let result = file.truncate_sync(len);
        self.put_fd(fd, file);
        result
    }

    pub async fn fchmod(&self, fd: u64, mode: u32) -> FsResult<()> {
        let mut file = self.take_fd(fd)?;
        let result = file.chmod(mode).await;
        self.put_fd(fd, file);
        result
    }

    pub fn fchmod_sync(&self, fd: u64, mode: u32) -> FsResult<()> {
        let mut file = self.take_fd(fd)?;
        let result = file.chmod_sync(mode);
        self.put_fd(fd, file);
        result
    }

    pub async fn fchown(&self, fd: u64, uid: u32, gid: u32) -> FsResult<()> {
        let mut file = self.take_fd(fd)?;
        let result = file.chown(uid, gid).await;
        self.put_fd(fd, file);
        result
    }

    pub fn fchown_sync(&self, fd: u64, uid: u32, gid: u32) -> FsResult<()> {
        let mut file = self.take_fd(fd)?;
        let result = file.chown_sync(uid, gid);
        self.put_fd(fd, file);
        result
    }

    pub async fn futimes(&self, fd: u64, atime_ms: f64, mtime_ms: f64) -> FsResult<()> {
        let mut file = self.take_fd(fd)?;
        let result = file.utimes(atime_ms, mtime_ms).await;
        self.put_fd(fd, file);
        result
    }

    pub fn futimes_sync(&self, fd: u64, atime_ms: f64, mtime_ms: f64) -> FsResult<()> {
        let mut file = self.take_fd(fd)?;
        let result = file.utimes_sync(atime_ms, mtime_ms);
        self.put_fd(fd, file);
        result
    }

    pub async fn fsync(&self, fd: u64) -> FsResult<()> {
        let mut file = self.take_fd(fd)?;
        let result = file.sync().await;
        self.put_fd(fd, file);
        result
    }

    pub fn fsync_sync(&self, fd: u64) -> FsResult<()> {
        let mut file = self.take_fd(fd)?;
        let result = file.sync_sync();
        self.put_fd(fd, file);
        result
    }

    /// Data-only sync; this engine persists data and metadata together.
    pub async fn fdatasync(&self, fd: u64) -> FsResult<()> {
        self.fsync(fd).await
    }

    pub fn fdatasync_sync(&self, fd: u64) -> FsResult<()> {
        self.fsync_sync(fd)
    }

    // --- unsupported surface ---------------------------------------------

    pub fn watch(&self, _p: &str) -> FsResult<()> {
        Err(ApiError::not_supported("watch is not supported"))
    }

    pub fn watch_file(&self, _p: &str) -> FsResult<()> {
        Err(ApiError::not_supported("watchFile is not supported"))
    }

    pub fn unwatch_file(&self, _p: &str) -> FsResult<()> {
        Err(ApiError::not_supported("unwatchFile is not supported"))
    }

    pub fn rm(&self, _p: &str) -> FsResult<()> {
        Err(ApiError::not_supported("rm is not supported"))
    }

    pub fn mkdtemp(&self, _prefix: &str) -> FsResult<String> {
        Err(ApiError::not_supported("mkdtemp is not supported"))
    }

    pub fn copy_file(&self, _src: &str, _dst: &str) -> FsResult<()> {
        Err(ApiError::not_supported("copyFile is not supported"))
    }

    pub fn readv(&self, _fd: u64) -> FsResult<usize> {
        Err(ApiError::not_supported("readv is not supported"))
    }

    pub fn writev(&self, _fd: u64) -> FsResult<usize> {
        Err(ApiError::not_supported("writev is not supported"))
    }

    pub fn opendir(&self, _p: &str) -> FsResult<u64> {
        Err(ApiError::not_supported("opendir is not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_vfs() -> Vfs {
        Vfs::new().unwrap()
    }

    #[tokio::test]
    async fn test_basic_lifecycle() {
        let vfs = new_vfs();
        vfs.mkdir("/a", 0o755).await.unwrap();
        assert!(vfs.readdir("/").await.unwrap().contains(&"a".to_string()));

        vfs.write_file("/a/f", b"hello", FileFlag::W, DEFAULT_FILE_MODE)
            .await
            .unwrap();
        assert_eq!(vfs.stat("/a/f").await.unwrap().size, 5);
        assert_eq!(vfs.read_file("/a/f", FileFlag::R).await.unwrap(), b"hello");

        vfs.unlink("/a/f").await.unwrap();
        assert!(!vfs.exists("/a/f").await);
        vfs.rmdir("/a").await.unwrap();
    }

    #[tokio::test]
    async fn test_path_normalization() {
        let vfs = new_vfs();
        vfs.mkdir("/a", 0o755).await.unwrap();
        vfs.write_file("//a/./b", b"x", FileFlag::W, 0o644)
            .await
            .unwrap();
        assert!(vfs.exists("/a/b").await);
        assert!(vfs.exists("/a/../a/b").await);
        assert!(vfs.stat("/a\0b").await.is_err());
        assert!(vfs.stat("").await.is_err());
    }

    #[tokio::test]
    async fn test_mount_routing() {
        let vfs = new_vfs();
        let m1: Arc<dyn FileSystem> = Arc::new(in_memory_filesystem("M1").unwrap());
        let m2: Arc<dyn FileSystem> = Arc::new(in_memory_filesystem("M2").unwrap());
        vfs.mount("/a", m1.clone()).unwrap();
        vfs.mount("/a/b", m2.clone()).unwrap();

        vfs.write_file("/a/b/c", b"1", FileFlag::W, 0o644)
            .await
            .unwrap();
        // Routed to the longest prefix with the intra-backend path /c.
        assert!(m2.exists_sync("/c", &Credentials::ROOT));
        assert!(!m1.exists_sync("/b/c", &Credentials::ROOT));

        // The mount point shows up in its parent's listing.
        let entries = vfs.readdir("/a").await.unwrap();
        assert!(entries.contains(&"b".to_string()));
    }

    #[tokio::test]
    async fn test_cross_mount_rename_falls_back_to_copy() {
        let vfs = new_vfs();
        let m1: Arc<dyn FileSystem> = Arc::new(in_memory_filesystem("M1").unwrap());
        vfs.mount("/m", m1).unwrap();

        vfs.write_file("/src.txt", b"payload", FileFlag::W, 0o644)
            .await
            .unwrap();
        vfs.rename("/src.txt", "/m/dst.txt").await.unwrap();

        assert!(!vfs.exists("/src.txt").await);
        assert_eq!(
            vfs.read_file("/m/dst.txt", FileFlag::R).await.unwrap(),
            b"payload"
        );
    }

    #[tokio::test]
    async fn test_fd_table() {
        let vfs = new_vfs();
        let fd = vfs.open("/f", FileFlag::WPlus, 0o644).await.unwrap();
        assert!(fd >= 100);

        let n = vfs.write(fd, b"hello", 0, 5, Some(0)).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(vfs.fstat(fd).unwrap().size, 5);

        let mut buf = [0u8; 5];
        let n = vfs.read(fd, &mut buf, 0, 5, Some(0)).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");

        vfs.close(fd).await.unwrap();
        assert_eq!(
            vfs.fstat(fd).unwrap_err().code,
            crate::error::ErrorCode::EBADF
        );

        // Descriptors are never reused.
        let fd2 = vfs.open("/f", FileFlag::R, 0o644).await.unwrap();
        assert!(fd2 > fd);
        vfs.close(fd2).await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_replaces_root() {
        let vfs = new_vfs();
        vfs.write_file("/old", b"x", FileFlag::W, 0o644).await.unwrap();

        let fresh: Arc<dyn FileSystem> = Arc::new(in_memory_filesystem("fresh").unwrap());
        vfs.initialize(vec![("/".to_string(), fresh)]).unwrap();
        assert!(!vfs.exists("/old").await);
    }

    #[tokio::test]
    async fn test_unavailable_backend_rejected() {
        struct Unavailable;
        #[async_trait::async_trait]
        impl FileSystem for Unavailable {
            fn metadata(&self) -> crate::filesystem::FileSystemMetadata {
                crate::filesystem::FileSystemMetadata::new("unavailable")
            }
            fn is_available(&self) -> bool {
                false
            }
        }
        let vfs = new_vfs();
        let err = vfs
            .initialize(vec![("/".to_string(), Arc::new(Unavailable))])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::EINVAL);
    }

    #[tokio::test]
    async fn test_error_paths_are_user_visible() {
        let vfs = new_vfs();
        let m1: Arc<dyn FileSystem> = Arc::new(in_memory_filesystem("M1").unwrap());
        vfs.mount("/data", m1).unwrap();
        let err = vfs.stat("/data/missing.txt").await.unwrap_err();
        assert_eq!(err.path.as_deref(), Some("/data/missing.txt"));
    }

    #[tokio::test]
    async fn test_unsupported_surface() {
        let vfs = new_vfs();
        assert_eq!(
            vfs.watch("/x").unwrap_err().code,
            crate::error::ErrorCode::ENOTSUP
        );
        assert_eq!(
            vfs.mkdtemp("/tmp-").unwrap_err().code,
            crate::error::ErrorCode::ENOTSUP
        );
        assert_eq!(
            vfs.copy_file("/a", "/b").unwrap_err().code,
            crate::error::ErrorCode::ENOTSUP
        );
    }

    #[tokio::test]
    async fn test_umount() {
        let vfs = new_vfs();
        let m1: Arc<dyn FileSystem> = Arc::new(in_memory_filesystem("M1").unwrap());
        vfs.mount("/m", m1).unwrap();
        vfs.write_file("/m/f", b"x", FileFlag::W, 0o644).await.unwrap();
        vfs.umount("/m").unwrap();
        // The path now routes to the root backend.
        assert!(!vfs.exists("/m/f").await);
        assert!(vfs.umount("/m").is_err());
    }

    #[tokio::test]
    async fn test_access() {
        let vfs = new_vfs();
        vfs.write_file("/f", b"x", FileFlag::W, 0o600).await.unwrap();
        vfs.access("/f", DEFAULT_ACCESS_MODE).await.unwrap();

        vfs.chmod("/f", 0o400).await.unwrap();
        vfs.chown("/f", 1000, 1000).await.unwrap();
        vfs.set_credentials(Credentials::new(2000, 2000));
        assert_eq!(
            vfs.access("/f", 0o400).await.unwrap_err().code,
            ErrorCode::EACCES
        );
    }
}

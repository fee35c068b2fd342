// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Synchronous projection of an asynchronous backend.
//!
//! A shadow copy of the asynchronous tree is kept on a synchronous
//! backend. Reads are served from the shadow; every mutation is applied
//! to the shadow immediately and then enqueued on a strict-FIFO queue
//! that a single writer task replays against the asynchronous side, in
//! the order the shadow observed them. If a replay fails the two sides
//! can no longer be reconciled: the fault is latched and every
//! subsequent operation reports it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::credentials::Credentials;
use crate::error::{ApiError, FsResult};
use crate::file::{File, PreloadFile, WriteOutcome};
use crate::filesystem::{FileSystem, FileSystemMetadata};
use crate::flag::FileFlag;
use crate::path;
use crate::stats::Stats;

/// One mutation to replay on the asynchronous side.
enum MirrorOp {
    WriteFile {
        path: String,
        data: Vec<u8>,
        mode: u32,
        cred: Credentials,
    },
    CreateFile {
        path: String,
        mode: u32,
        cred: Credentials,
    },
    Unlink {
        path: String,
        cred: Credentials,
    },
    Rmdir {
        path: String,
        cred: Credentials,
    },
    Mkdir {
        path: String,
        mode: u32,
        cred: Credentials,
    },
    Rename {
        old_path: String,
        new_path: String,
        cred: Credentials,
    },
    Chmod {
        path: String,
        mode: u32,
        cred: Credentials,
    },
    Chown {
        path: String,
        uid: u32,
        gid: u32,
        cred: Credentials,
    },
    Utimes {
        path: String,
        atime_ms: f64,
        mtime_ms: f64,
        cred: Credentials,
    },
    Truncate {
        path: String,
        len: u64,
        cred: Credentials,
    },
}

struct MirrorInner {
    sync_fs: Arc<dyn FileSystem>,
    async_fs: Arc<dyn FileSystem>,
    queue: mpsc::UnboundedSender<MirrorOp>,
    fault: Arc<Mutex<Option<ApiError>>>,
    initialized: AtomicBool,
}

/// The mirror backend. Declares itself synchronous; the asynchronous
/// side trails behind by whatever sits in the writer queue.
pub struct AsyncMirrorFs {
    inner: Arc<MirrorInner>,
}

impl AsyncMirrorFs {
    /// Requires a running tokio runtime for the writer task.
    pub fn new(sync_fs: Arc<dyn FileSystem>, async_fs: Arc<dyn FileSystem>) -> FsResult<Self> {
        if !sync_fs.metadata().synchronous {
            return Err(ApiError::invalid_argument(
                "the mirror shadow must be a synchronous filesystem",
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let fault = Arc::new(Mutex::new(None));
        // The drain task holds only what it needs, so dropping the
        // mirror drops the sender and lets the task wind down.
        tokio::spawn(drain_queue(async_fs.clone(), fault.clone(), rx));
        let inner = Arc::new(MirrorInner {
            sync_fs,
            async_fs,
            queue: tx,
            fault,
            initialized: AtomicBool::new(false),
        });
        Ok(Self { inner })
    }

    /// Copy the asynchronous tree into the shadow. Must complete before
    /// any other operation.
    pub async fn initialize(&self) -> FsResult<()> {
        copy_directory(&self.inner, "/").await?;
        self.inner.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn copy_directory<'a>(
    inner: &'a Arc<MirrorInner>,
    p: &'a str,
) -> Pin<Box<dyn Future<Output = FsResult<()>> + Send + 'a>> {
    Box::pin(async move {
        let root = Credentials::ROOT;
        if p != "/" {
            let stats = inner.async_fs.stat(p, &root).await?;
            inner.sync_fs.mkdir_sync(p, stats.mode & 0o7777, &root)?;
        }
        for entry in inner.async_fs.readdir(p, &root).await? {
            let child = path::join(p, &entry);
            let stats = inner.async_fs.stat(&child, &root).await?;
            if stats.is_directory() {
                copy_directory(inner, &child).await?;
            } else {
                let data = inner.async_fs.read_file(&child, FileFlag::R, &root).await?;
                inner.sync_fs.write_file_sync(
                    &child,
                    &data,
                    FileFlag::W,
                    stats.mode & 0o7777,
                    &root,
                )?;
            }
        }
        Ok(())
    })
}

async fn drain_queue(
    async_fs: Arc<dyn FileSystem>,
    fault: Arc<Mutex<Option<ApiError>>>,
    mut rx: mpsc::UnboundedReceiver<MirrorOp>,
) {
    while let Some(op) = rx.recv().await {
        if let Err(e) = apply(&async_fs, op).await {
            warn!("mirror replay failed, filesystem desynchronized: {}", e);
            *fault.lock().unwrap() = Some(ApiError::io(format!(
                "filesystem desynchronized: {}",
                e
            )));
            break;
        }
    }
}

async fn apply(fs: &Arc<dyn FileSystem>, op: MirrorOp) -> FsResult<()> {
    match op {
        MirrorOp::WriteFile {
            path,
            data,
            mode,
            cred,
        } => fs.write_file(&path, &data, FileFlag::W, mode, &cred).await,
        MirrorOp::CreateFile { path, mode, cred } => {
            let mut file = fs.create_file(&path, FileFlag::W, mode, &cred).await?;
            file.close().await
        }
        MirrorOp::Unlink { path, cred } => fs.unlink(&path, &cred).await,
        MirrorOp::Rmdir { path, cred } => fs.rmdir(&path, &cred).await,
        MirrorOp::Mkdir { path, mode, cred } => fs.mkdir(&path, mode, &cred).await,
        MirrorOp::Rename {
            old_path,
            new_path,
            cred,
        } => fs.rename(&old_path, &new_path, &cred).await,
        MirrorOp::Chmod { path, mode, cred } => fs.chmod(&path, mode, &cred).await,
        MirrorOp::Chown {
            path,
            uid,
            gid,
            cred,
        } => fs.chown(&path, uid, gid, &cred).await,
        MirrorOp::Utimes {
            path,
            atime_ms,
            mtime_ms,
            cred,
        } => fs.utimes(&path, atime_ms, mtime_ms, &cred).await,
        MirrorOp::Truncate { path, len, cred } => fs.truncate(&path, len, &cred).await,
    }
}

impl MirrorInner {
    fn check_ready(&self) -> FsResult<()> {
        if let Some(fault) = self.fault.lock().unwrap().as_ref() {
            return Err(fault.clone());
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(ApiError::new(
                crate::error::ErrorCode::EPERM,
                "mirror is not initialized; call initialize() before use",
            ));
        }
        Ok(())
    }

    fn enqueue(&self, op: MirrorOp) {
        // The receiver only goes away after a latched fault, which the
        // next check_ready reports.
        let _ = self.queue.send(op);
    }
}

#[async_trait]
impl FileSystem for AsyncMirrorFs {
    fn metadata(&self) -> FileSystemMetadata {
        let sync_md = self.inner.sync_fs.metadata();
        let async_md = self.inner.async_fs.metadata();
        FileSystemMetadata {
            name: "AsyncMirror".to_string(),
            readonly: false,
            synchronous: true,
            supports_properties: sync_md.supports_properties && async_md.supports_properties,
            supports_links: false,
            total_space: async_md.total_space,
            free_space: async_md.free_space,
        }
    }

    fn stat_sync(&self, p: &str, cred: &Credentials) -> FsResult<Stats> {
        self.inner.check_ready()?;
        self.inner.sync_fs.stat_sync(p, cred)
    }

    fn readdir_sync(&self, p: &str, cred: &Credentials) -> FsResult<Vec<String>> {
        self.inner.check_ready()?;
        self.inner.sync_fs.readdir_sync(p, cred)
    }

    fn exists_sync(&self, p: &str, cred: &Credentials) -> bool {
        if self.inner.check_ready().is_err() {
            return false;
        }
        self.inner.sync_fs.exists_sync(p, cred)
    }

    fn open_file_sync(
        &self,
        p: &str,
        flag: FileFlag,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        self.inner.check_ready()?;
        let stats = self.inner.sync_fs.stat_sync(p, cred)?;
        crate::file::check_open_access(p, &stats, flag, cred)?;
        let data = self.inner.sync_fs.read_file_sync(p, FileFlag::R, cred)?;
        Ok(Box::new(MirrorFile::new(
            self.inner.clone(),
            *cred,
            p.to_string(),
            flag,
            stats,
            data,
        )?))
    }

    fn create_file_sync(
        &self,
        p: &str,
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        self.inner.check_ready()?;
        let file = self.inner.sync_fs.create_file_sync(p, flag, mode, cred)?;
        let stats = file.stat()?;
        self.inner.enqueue(MirrorOp::CreateFile {
            path: p.to_string(),
            mode,
            cred: *cred,
        });
        Ok(Box::new(MirrorFile::new(
            self.inner.clone(),
            *cred,
            p.to_string(),
            flag,
            stats,
            Vec::new(),
        )?))
    }

    fn unlink_sync(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        self.inner.check_ready()?;
        self.inner.sync_fs.unlink_sync(p, cred)?;
        self.inner.enqueue(MirrorOp::Unlink {
            path: p.to_string(),
            cred: *cred,
        });
        Ok(())
    }

    fn rmdir_sync(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        self.inner.check_ready()?;
        self.inner.sync_fs.rmdir_sync(p, cred)?;
        self.inner.enqueue(MirrorOp::Rmdir {
            path: p.to_string(),
            cred: *cred,
        });
        Ok(())
    }

    fn mkdir_sync(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        self.inner.check_ready()?;
        self.inner.sync_fs.mkdir_sync(p, mode, cred)?;
        self.inner.enqueue(MirrorOp::Mkdir {
            path: p.to_string(),
            mode,
            cred: *cred,
        });
        Ok(())
    }

    fn rename_sync(&self, old_path: &str, new_path: &str, cred: &Credentials) -> FsResult<()> {
        self.inner.check_ready()?;
        self.inner.sync_fs.rename_sync(old_path, new_path, cred)?;
        self.inner.enqueue(MirrorOp::Rename {
            old_path: old_path.to_string(),
            new_path: new_path.to_string(),
            cred: *cred,
        });
        Ok(())
    }

    fn chmod_sync(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        self.inner.check_ready()?;
        self.inner.sync_fs.chmod_sync(p, mode, cred)?;
        self.inner.enqueue(MirrorOp::Chmod {
            path: p.to_string(),
            mode,
            cred: *cred,
        });
        Ok(())
    }

    fn chown_sync(&self, p: &str, uid: u32, gid: u32, cred: &Credentials) -> FsResult<()> {
        self.inner.check_ready()?;
        self.inner.sync_fs.chown_sync(p, uid, gid, cred)?;
        self.inner.enqueue(MirrorOp::Chown {
            path: p.to_string(),
            uid,
            gid,
            cred: *cred,
        });
        Ok(())
    }

    fn utimes_sync(
        &self,
        p: &str,
        atime_ms: f64,
        mtime_ms: f64,
        cred: &Credentials,
    ) -> FsResult<()> {
        self.inner.check_ready()?;
        self.inner.sync_fs.utimes_sync(p, atime_ms, mtime_ms, cred)?;
        self.inner.enqueue(MirrorOp::Utimes {
            path: p.to_string(),
            atime_ms,
            mtime_ms,
            cred: *cred,
        });
        Ok(())
    }

    fn truncate_sync(&self, p: &str, len: u64, cred: &Credentials) -> FsResult<()> {
        self.inner.check_ready()?;
        self.inner.sync_fs.truncate_sync(p, len, cred)?;
        self.inner.enqueue(MirrorOp::Truncate {
            path: p.to_string(),
            len,
            cred: *cred,
        });
        Ok(())
    }

    fn write_file_sync(
        &self,
        p: &str,
        data: &[u8],
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<()> {
        self.inner.check_ready()?;
        self.inner
            .sync_fs
            .write_file_sync(p, data, flag, mode, cred)?;
        self.inner.enqueue(MirrorOp::WriteFile {
            path: p.to_string(),
            data: data.to_vec(),
            mode,
            cred: *cred,
        });
        Ok(())
    }
}

/// A buffered handle whose `sync` writes through to the shadow and
/// enqueues the same write for the asynchronous side.
pub struct MirrorFile {
    inner: Arc<MirrorInner>,
    cred: Credentials,
    pre: PreloadFile,
}

impl MirrorFile {
    fn new(
        inner: Arc<MirrorInner>,
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
impl File for MirrorFile {
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
        self.write_sync(data, offset, length, position)
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
        self.truncate_sync(len)
    }

    fn truncate_sync(&mut self, len: u64) -> FsResult<()> {
        if self.pre.truncate_to(len)? {
            self.sync_sync()?;
        }
        Ok(())
    }

    async fn sync(&mut self) -> FsResult<()> {
        self.sync_sync()
    }

    fn sync_sync(&mut self) -> FsResult<()> {
        if self.pre.is_dirty() {
            self.inner.check_ready()?;
            let mode = self.pre.stat().mode & 0o7777;
            self.inner.sync_fs.write_file_sync(
                self.pre.path(),
                self.pre.buffer(),
                FileFlag::W,
                mode,
                &self.cred,
            )?;
            self.inner.enqueue(MirrorOp::WriteFile {
                path: self.pre.path().to_string(),
                data: self.pre.buffer().to_vec(),
                mode,
                cred: self.cred,
            });
            self.pre.mark_clean();
        }
        Ok(())
    }

    async fn chmod(&mut self, mode: u32) -> FsResult<()> {
        self.chmod_sync(mode)
    }

    fn chmod_sync(&mut self, mode: u32) -> FsResult<()> {
        self.pre.set_mode(mode);
        self.sync_sync()
    }

    async fn chown(&mut self, uid: u32, gid: u32) -> FsResult<()> {
        self.chown_sync(uid, gid)
    }

    fn chown_sync(&mut self, uid: u32, gid: u32) -> FsResult<()> {
        self.pre.set_owner(uid, gid);
        self.sync_sync()
    }

    async fn utimes(&mut self, atime_ms: f64, mtime_ms: f64) -> FsResult<()> {
        self.utimes_sync(atime_ms, mtime_ms)
    }

    fn utimes_sync(&mut self, atime_ms: f64, mtime_ms: f64) -> FsResult<()> {
        self.pre.set_times(atime_ms, mtime_ms);
        self.sync_sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::async_key_value::AsyncKeyValueFileSystem;
    use crate::backends::memory::in_memory_filesystem;
    use crate::testing::InMemoryAsyncStore;

    async fn mirror_pair() -> (AsyncMirrorFs, Arc<InMemoryAsyncStore>, Arc<dyn FileSystem>) {
        let store = Arc::new(InMemoryAsyncStore::new("mirror-async"));
        let async_fs: Arc<dyn FileSystem> =
            Arc::new(AsyncKeyValueFileSystem::new(store.clone()).await.unwrap());
        let sync_fs: Arc<dyn FileSystem> = Arc::new(in_memory_filesystem("shadow").unwrap());
        let fs = AsyncMirrorFs::new(sync_fs, async_fs.clone()).unwrap();
        fs.initialize().await.unwrap();
        (fs, store, async_fs)
    }

    async fn settle() {
        for _ in 0..512 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_initial_copy_in() {
        let store = Arc::new(InMemoryAsyncStore::new("mirror-async"));
        let async_fs: Arc<dyn FileSystem> =
            Arc::new(AsyncKeyValueFileSystem::new(store).await.unwrap());
        let root = Credentials::ROOT;
        async_fs.mkdir("/docs", 0o755, &root).await.unwrap();
        async_fs
            .write_file("/docs/readme", b"existing", FileFlag::W, 0o644, &root)
            .await
            .unwrap();

        let sync_fs: Arc<dyn FileSystem> = Arc::new(in_memory_filesystem("shadow").unwrap());
        let fs = AsyncMirrorFs::new(sync_fs, async_fs).unwrap();
        fs.initialize().await.unwrap();

        assert_eq!(
            fs.read_file_sync("/docs/readme", FileFlag::R, &root).unwrap(),
            b"existing"
        );
    }

    #[tokio::test]
    async fn test_mutations_replay_in_order() {
        let (fs, _, async_fs) = mirror_pair().await;
        let root = Credentials::ROOT;

        fs.mkdir_sync("/d", 0o755, &root).unwrap();
        fs.write_file_sync("/d/f", b"one", FileFlag::W, 0o644, &root)
            .unwrap();
        fs.write_file_sync("/d/f", b"two", FileFlag::W, 0o644, &root)
            .unwrap();
        fs.rename_sync("/d/f", "/d/g", &root).unwrap();

        settle().await;

        assert_eq!(
            async_fs.read_file("/d/g", FileFlag::R, &root).await.unwrap(),
            b"two"
        );
        assert!(!async_fs.exists("/d/f", &root).await);
    }

    #[tokio::test]
    async fn test_reads_served_from_shadow() {
        let (fs, _, _) = mirror_pair().await;
        let root = Credentials::ROOT;
        fs.write_file_sync("/f", b"data", FileFlag::W, 0o644, &root)
            .unwrap();
        // No settling needed: the shadow is already current.
        assert_eq!(fs.stat_sync("/f", &root).unwrap().size, 4);
        assert_eq!(fs.readdir_sync("/", &root).unwrap(), ["f"]);
    }

    #[tokio::test]
    async fn test_replay_failure_latches_desync_fault() {
        let (fs, store, _) = mirror_pair().await;
        let root = Credentials::ROOT;

        store.set_fail_writes(true);
        fs.write_file_sync("/f", b"doomed", FileFlag::W, 0o644, &root)
            .unwrap();
        settle().await;

        let err = fs.mkdir_sync("/d", 0o755, &root).unwrap_err();
        assert!(err.message.contains("desynchronized"));
    }

    #[tokio::test]
    async fn test_open_returns_mirror_file() {
        let (fs, _, async_fs) = mirror_pair().await;
        let root = Credentials::ROOT;
        let mut file = fs.open_sync("/f", FileFlag::WPlus, 0o644, &root).unwrap();
        file.write_sync(b"hello", 0, 5, Some(0)).unwrap();
        file.close_sync().unwrap();

        settle().await;
        assert_eq!(
            async_fs.read_file("/f", FileFlag::R, &root).await.unwrap(),
            b"hello"
        );
    }
}

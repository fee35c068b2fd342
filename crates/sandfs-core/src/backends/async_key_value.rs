// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The asynchronous key-value storage engine.
//!
//! Same on-store layout as the synchronous engine, awaited. Path
//! resolution is memoized in a small LRU cache; the cache is disabled
//! and cleared for the duration of a rename, since a rename can move a
//! whole subtree and path-keyed entries cannot be invalidated
//! selectively.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::backends::key_value::{decode_dir_listing, encode_dir_listing, generate_random_id, TxKind};
use crate::credentials::Credentials;
use crate::error::{ApiError, FsResult};
use crate::file::{File, PreloadFile, WriteOutcome};
use crate::filesystem::{FileSystem, FileSystemMetadata};
use crate::flag::FileFlag;
use crate::inode::{Inode, ROOT_NODE_ID};
use crate::path;
use crate::stats::{FileType, Stats};

/// An asynchronous key-value store.
#[async_trait]
pub trait AsyncKeyValueStore: Send + Sync {
    fn name(&self) -> String;
    async fn clear(&self) -> FsResult<()>;
    fn begin_transaction(&self, kind: TxKind) -> Box<dyn AsyncKvTransaction>;
}

/// A transaction over an asynchronous store.
#[async_trait]
pub trait AsyncKvTransaction: Send {
    async fn get(&mut self, key: &str) -> FsResult<Option<Vec<u8>>>;
    async fn put(&mut self, key: &str, data: &[u8], overwrite: bool) -> FsResult<bool>;
    async fn del(&mut self, key: &str) -> FsResult<()>;
    async fn commit(&mut self) -> FsResult<()>;
    async fn abort(&mut self) -> FsResult<()>;
}

/// Path → inode-id memo with least-recently-used eviction.
struct PathCache {
    enabled: bool,
    capacity: usize,
    map: HashMap<String, String>,
    order: VecDeque<String>,
}

impl PathCache {
    fn new(capacity: usize) -> Self {
        Self {
            enabled: capacity > 0,
            capacity,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, p: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let value = self.map.get(p).cloned()?;
        self.touch(p);
        Some(value)
    }

    fn set(&mut self, p: &str, id: String) {
        if !self.enabled {
            return;
        }
        if self.map.insert(p.to_string(), id).is_none() {
            self.order.push_back(p.to_string());
            if self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.map.remove(&evicted);
                }
            }
        } else {
            self.touch(p);
        }
    }

    fn remove(&mut self, p: &str) {
        self.map.remove(p);
        self.order.retain(|k| k != p);
    }

    fn touch(&mut self, p: &str) {
        self.order.retain(|k| k != p);
        self.order.push_back(p.to_string());
    }

    fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

/// A filesystem over an asynchronous key-value store.
///
/// Multi-step operations assume serialized access per path; wrap the
/// engine in a `LockedFs` before exposing it to concurrent callers.
#[derive(Clone)]
pub struct AsyncKeyValueFileSystem {
    store: Arc<dyn AsyncKeyValueStore>,
    cache: Arc<Mutex<PathCache>>,
}

const PATH_CACHE_CAPACITY: usize = 100;

impl AsyncKeyValueFileSystem {
    pub async fn new(store: Arc<dyn AsyncKeyValueStore>) -> FsResult<Self> {
        let fs = Self {
            store,
            cache: Arc::new(Mutex::new(PathCache::new(PATH_CACHE_CAPACITY))),
        };
        fs.make_root_directory().await?;
        Ok(fs)
    }

    async fn make_root_directory(&self) -> FsResult<()> {
        let mut tx = self.store.begin_transaction(TxKind::ReadWrite);
        if tx.get(ROOT_NODE_ID).await?.is_none() {
            let inode = Inode::new(
                generate_random_id(),
                4096,
                (0o777 | FileType::Directory.bits()) as u16,
                0,
                0,
            );
            tx.put(&inode.id, b"{}", false).await?;
            tx.put(ROOT_NODE_ID, &inode.serialize(), false).await?;
            tx.commit().await?;
        }
        Ok(())
    }

    async fn get_inode(
        &self,
        tx: &mut dyn AsyncKvTransaction,
        id: &str,
        p: &str,
    ) -> FsResult<Inode> {
        let data = tx.get(id).await?.ok_or_else(|| ApiError::not_found(p))?;
        Inode::deserialize(&data)
    }

    async fn get_dir_listing(
        &self,
        tx: &mut dyn AsyncKvTransaction,
        inode: &Inode,
        p: &str,
    ) -> FsResult<HashMap<String, String>> {
        if !inode.is_directory() {
            return Err(ApiError::not_a_directory(p));
        }
        let data = tx
            .get(&inode.id)
            .await?
            .ok_or_else(|| ApiError::not_found(p))?;
        decode_dir_listing(&data)
    }

    /// Recursive resolution of `parent/filename` to an inode id, with a
    /// cycle guard and the path cache consulted per level.
    fn find_inode_id<'a>(
        &'a self,
        tx: &'a mut dyn AsyncKvTransaction,
        parent: &'a str,
        filename: &'a str,
        visited: &'a mut HashSet<String>,
    ) -> Pin<Box<dyn Future<Output = FsResult<String>> + Send + 'a>> {
        Box::pin(async move {
            let current_path = path::join(parent, filename);
            if !visited.insert(current_path.clone()) {
                return Err(ApiError::io(
                    "Infinite loop detected while finding inode",
                ));
            }

            if let Some(id) = self.cache.lock().unwrap().get(&current_path) {
                return Ok(id);
            }

            let id = if parent == "/" && filename.is_empty() {
                ROOT_NODE_ID.to_string()
            } else {
                let parent_id = if parent == "/" {
                    ROOT_NODE_ID.to_string()
                } else {
                    self.find_inode_id(tx, &path::dirname(parent), path::basename(parent), visited)
                        .await?
                };
                let parent_inode = self.get_inode(tx, &parent_id, parent).await?;
                let listing = self.get_dir_listing(tx, &parent_inode, parent).await?;
                listing
                    .get(filename)
                    .cloned()
                    .ok_or_else(|| ApiError::not_found(&current_path))?
            };

            self.cache.lock().unwrap().set(&current_path, id.clone());
            Ok(id)
        })
    }

    async fn find_inode_id_for_path(
        &self,
        tx: &mut dyn AsyncKvTransaction,
        p: &str,
    ) -> FsResult<String> {
        let mut visited = HashSet::new();
        self.find_inode_id(tx, &path::dirname(p), path::basename(p), &mut visited)
            .await
    }

    async fn find_inode(&self, tx: &mut dyn AsyncKvTransaction, p: &str) -> FsResult<Inode> {
        let id = self.find_inode_id_for_path(tx, p).await?;
        self.get_inode(tx, &id, p).await
    }

    async fn add_new_node(
        &self,
        tx: &mut dyn AsyncKvTransaction,
        data: &[u8],
    ) -> FsResult<String> {
        let mut retries = 0;
        while retries < 5 {
            let id = generate_random_id();
            if tx.put(&id, data, false).await? {
                return Ok(id);
            }
            retries += 1;
        }
        Err(ApiError::io("unable to commit data to key-value store"))
    }

    async fn commit_new_node(
        &self,
        p: &str,
        file_type: FileType,
        mode: u32,
        cred: &Credentials,
        data: &[u8],
    ) -> FsResult<Inode> {
        let mut tx = self.store.begin_transaction(TxKind::ReadWrite);
        let result = self
            .commit_new_node_inner(tx.as_mut(), p, file_type, mode, cred, data)
            .await;
        match result {
            Ok(inode) => {
                tx.commit().await?;
                Ok(inode)
            }
            Err(e) => {
                let _ = tx.abort().await;
                Err(e)
            }
        }
    }

    async fn commit_new_node_inner(
        &self,
        tx: &mut dyn AsyncKvTransaction,
        p: &str,
        file_type: FileType,
        mode: u32,
        cred: &Credentials,
        data: &[u8],
    ) -> FsResult<Inode> {
        let parent_dir = path::dirname(p);
        let fname = path::basename(p);
        let parent_inode = self.find_inode(tx, &parent_dir).await?;
        let mut listing = self.get_dir_listing(tx, &parent_inode, &parent_dir).await?;

        if !parent_inode.to_stats().has_access(0o2, cred) {
            return Err(ApiError::access_denied(p));
        }
        if p == "/" {
            return Err(ApiError::exists(p));
        }
        if listing.contains_key(fname) {
            return Err(ApiError::exists(p));
        }

        let data_id = self.add_new_node(tx, data).await?;
        let inode = Inode::new(
            data_id,
            data.len() as u32,
            (mode | file_type.bits()) as u16,
            cred.uid,
            cred.gid,
        );
        let inode_id = self.add_new_node(tx, &inode.serialize()).await?;
        listing.insert(fname.to_string(), inode_id);
        tx.put(&parent_inode.id, &encode_dir_listing(&listing)?, true)
            .await?;
        Ok(inode)
    }

    async fn remove_entry(&self, p: &str, is_dir: bool, cred: &Credentials) -> FsResult<()> {
        let mut tx = self.store.begin_transaction(TxKind::ReadWrite);
        let result = self.remove_entry_inner(tx.as_mut(), p, is_dir, cred).await;
        match result {
            Ok(()) => {
                self.cache.lock().unwrap().remove(p);
                tx.commit().await
            }
            Err(e) => {
                let _ = tx.abort().await;
                Err(e)
            }
        }
    }

    async fn remove_entry_inner(
        &self,
        tx: &mut dyn AsyncKvTransaction,
        p: &str,
        is_dir: bool,
        cred: &Credentials,
    ) -> FsResult<()> {
        let parent_dir = path::dirname(p);
        let fname = path::basename(p);
        let parent_inode = self.find_inode(tx, &parent_dir).await?;
        let mut listing = self.get_dir_listing(tx, &parent_inode, &parent_dir).await?;

        // A missing target reports ENOENT even under a parent the
        // caller may not write to.
        let node_id = listing
            .remove(fname)
            .ok_or_else(|| ApiError::not_found(p))?;

        if !parent_inode.to_stats().has_access(0o2, cred) {
            return Err(ApiError::access_denied(p));
        }

        let node = self.get_inode(tx, &node_id, p).await?;
        if !is_dir && node.is_directory() {
            return Err(ApiError::is_directory(p));
        }
        if is_dir && !node.is_directory() {
            return Err(ApiError::not_a_directory(p));
        }

        tx.del(&node.id).await?;
        tx.del(&node_id).await?;
        tx.put(&parent_inode.id, &encode_dir_listing(&listing)?, true)
            .await?;
        Ok(())
    }

    pub(crate) async fn sync_file(&self, p: &str, data: &[u8], stats: &Stats) -> FsResult<()> {
        let mut tx = self.store.begin_transaction(TxKind::ReadWrite);
        let result: FsResult<()> = async {
            let inode_id = self.find_inode_id_for_path(tx.as_mut(), p).await?;
            let mut inode = self.get_inode(tx.as_mut(), &inode_id, p).await?;
            let inode_changed = inode.update(stats);
            tx.put(&inode.id, data, true).await?;
            if inode_changed {
                tx.put(&inode_id, &inode.serialize(), true).await?;
            }
            Ok(())
        }
        .await;
        match result {
            Ok(()) => tx.commit().await,
            Err(e) => {
                let _ = tx.abort().await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl FileSystem for AsyncKeyValueFileSystem {
    fn metadata(&self) -> FileSystemMetadata {
        FileSystemMetadata {
            name: self.store.name(),
            readonly: false,
            synchronous: false,
            supports_properties: true,
            supports_links: false,
            total_space: 0,
            free_space: 0,
        }
    }

    async fn stat(&self, p: &str, _cred: &Credentials) -> FsResult<Stats> {
        let mut tx = self.store.begin_transaction(TxKind::ReadOnly);
        let inode = self.find_inode(tx.as_mut(), p).await?;
        Ok(inode.to_stats())
    }

    async fn open_file(
        &self,
        p: &str,
        flag: FileFlag,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        let mut tx = self.store.begin_transaction(TxKind::ReadOnly);
        let inode_id = self.find_inode_id_for_path(tx.as_mut(), p).await?;
        let inode = self.get_inode(tx.as_mut(), &inode_id, p).await?;
        let data = tx
            .get(&inode.id)
            .await?
            .ok_or_else(|| ApiError::not_found(p))?;
        let stats = inode.to_stats();
        crate::file::check_open_access(p, &stats, flag, cred)?;
        Ok(Box::new(AsyncKvFile::new(
            self.clone(),
            p.to_string(),
            flag,
            stats,
            data,
        )?))
    }

    async fn create_file(
        &self,
        p: &str,
        flag: FileFlag,
        mode: u32,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        let inode = self
            .commit_new_node(p, FileType::File, mode, cred, &[])
            .await?;
        Ok(Box::new(AsyncKvFile::new(
            self.clone(),
            p.to_string(),
            flag,
            inode.to_stats(),
            Vec::new(),
        )?))
    }

    async fn unlink(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        self.remove_entry(p, false, cred).await
    }

    async fn rmdir(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        if !self.readdir(p, cred).await?.is_empty() {
            return Err(ApiError::not_empty(p));
        }
        self.remove_entry(p, true, cred).await
    }

    async fn mkdir(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        self.commit_new_node(p, FileType::Directory, mode, cred, b"{}")
            .await?;
        Ok(())
    }

    async fn readdir(&self, p: &str, _cred: &Credentials) -> FsResult<Vec<String>> {
        let mut tx = self.store.begin_transaction(TxKind::ReadOnly);
        let inode = self.find_inode(tx.as_mut(), p).await?;
        let listing = self.get_dir_listing(tx.as_mut(), &inode, p).await?;
        Ok(listing.into_keys().collect())
    }

    async fn rename(&self, old_path: &str, new_path: &str, cred: &Credentials) -> FsResult<()> {
        // Path-keyed cache entries cannot survive a subtree move; turn
        // the cache off for the duration and start cold afterwards.
        {
            let mut cache = self.cache.lock().unwrap();
            cache.enabled = false;
            cache.clear();
        }
        let result = self.rename_inner(old_path, new_path, cred).await;
        {
            let mut cache = self.cache.lock().unwrap();
            cache.enabled = cache.capacity > 0;
        }
        result
    }
}

impl AsyncKeyValueFileSystem {
    async fn rename_inner(
        &self,
        old_path: &str,
        new_path: &str,
        cred: &Credentials,
    ) -> FsResult<()> {
        let mut tx = self.store.begin_transaction(TxKind::ReadWrite);
        let result: FsResult<()> = async {
            let old_parent = path::dirname(old_path);
            let old_name = path::basename(old_path);
            let new_parent = path::dirname(new_path);
            let new_name = path::basename(new_path);

            let old_dir_inode = self.find_inode(tx.as_mut(), &old_parent).await?;
            let mut old_listing = self
                .get_dir_listing(tx.as_mut(), &old_dir_inode, &old_parent)
                .await?;
            if !old_dir_inode.to_stats().has_access(0o2, cred) {
                return Err(ApiError::access_denied(old_path));
            }

            let node_id = old_listing
                .remove(old_name)
                .ok_or_else(|| ApiError::not_found(old_path))?;

            if format!("{}/", new_parent).starts_with(&format!("{}/", old_path)) {
                return Err(ApiError::busy(old_parent));
            }

            let same_parent = new_parent == old_parent;
            let (new_dir_inode, mut new_listing) = if same_parent {
                (old_dir_inode.clone(), old_listing.clone())
            } else {
                let inode = self.find_inode(tx.as_mut(), &new_parent).await?;
                let listing = self.get_dir_listing(tx.as_mut(), &inode, &new_parent).await?;
                (inode, listing)
            };

            if let Some(existing_id) = new_listing.get(new_name).cloned() {
                let existing = self.get_inode(tx.as_mut(), &existing_id, new_path).await?;
                if existing.is_file() {
                    tx.del(&existing.id).await?;
                    tx.del(&existing_id).await?;
                } else {
                    return Err(ApiError::not_permitted(new_path));
                }
            }

            new_listing.insert(new_name.to_string(), node_id);
            if same_parent {
                tx.put(&old_dir_inode.id, &encode_dir_listing(&new_listing)?, true)
                    .await?;
            } else {
                tx.put(&old_dir_inode.id, &encode_dir_listing(&old_listing)?, true)
                    .await?;
                tx.put(&new_dir_inode.id, &encode_dir_listing(&new_listing)?, true)
                    .await?;
            }
            Ok(())
        }
        .await;
        match result {
            Ok(()) => tx.commit().await,
            Err(e) => {
                debug!(old = old_path, new = new_path, "rename aborted: {}", e);
                let _ = tx.abort().await;
                Err(e)
            }
        }
    }
}

/// A buffered handle over the asynchronous engine; `sync` awaits the
/// store write-back.
pub struct AsyncKvFile {
    fs: AsyncKeyValueFileSystem,
    pre: PreloadFile,
}

impl AsyncKvFile {
    fn new(
        fs: AsyncKeyValueFileSystem,
        path: String,
        flag: FileFlag,
        stats: Stats,
        data: Vec<u8>,
    ) -> FsResult<Self> {
        Ok(Self {
            fs,
            pre: PreloadFile::new(path, flag, stats, data)?,
        })
    }

    fn not_synchronous(&self) -> ApiError {
        ApiError::not_supported("file belongs to an asynchronous filesystem")
    }
}

#[async_trait]
impl File for AsyncKvFile {
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
        _data: &[u8],
        _offset: usize,
        _length: usize,
        _position: Option<u64>,
    ) -> FsResult<usize> {
        Err(self.not_synchronous())
    }

    async fn truncate(&mut self, len: u64) -> FsResult<()> {
        if self.pre.truncate_to(len)? {
            self.sync().await?;
        }
        Ok(())
    }

    fn truncate_sync(&mut self, _len: u64) -> FsResult<()> {
        Err(self.not_synchronous())
    }

    async fn sync(&mut self) -> FsResult<()> {
        if self.pre.is_dirty() {
            self.fs
                .sync_file(self.pre.path(), self.pre.buffer(), self.pre.stat())
                .await?;
            self.pre.mark_clean();
        }
        Ok(())
    }

    fn sync_sync(&mut self) -> FsResult<()> {
        Err(self.not_synchronous())
    }

    async fn chmod(&mut self, mode: u32) -> FsResult<()> {
        self.pre.set_mode(mode);
        self.sync().await
    }

    fn chmod_sync(&mut self, _mode: u32) -> FsResult<()> {
        Err(self.not_synchronous())
    }

    async fn chown(&mut self, uid: u32, gid: u32) -> FsResult<()> {
        self.pre.set_owner(uid, gid);
        self.sync().await
    }

    fn chown_sync(&mut self, _uid: u32, _gid: u32) -> FsResult<()> {
        Err(self.not_synchronous())
    }

    async fn utimes(&mut self, atime_ms: f64, mtime_ms: f64) -> FsResult<()> {
        self.pre.set_times(atime_ms, mtime_ms);
        self.sync().await
    }

    fn utimes_sync(&mut self, _atime_ms: f64, _mtime_ms: f64) -> FsResult<()> {
        Err(self.not_synchronous())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryAsyncStore;

    async fn new_fs() -> AsyncKeyValueFileSystem {
        AsyncKeyValueFileSystem::new(Arc::new(InMemoryAsyncStore::new("async-test")))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let fs = new_fs().await;
        let root = Credentials::ROOT;
        fs.mkdir("/a", 0o755, &root).await.unwrap();
        fs.write_file("/a/f", b"hello", FileFlag::W, 0o644, &root)
            .await
            .unwrap();
        assert_eq!(fs.stat("/a/f", &root).await.unwrap().size, 5);
        assert_eq!(
            fs.read_file("/a/f", FileFlag::R, &root).await.unwrap(),
            b"hello"
        );
        fs.unlink("/a/f", &root).await.unwrap();
        assert!(!fs.exists("/a/f", &root).await);
        fs.rmdir("/a", &root).await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_survives_rename_correctly() {
        let fs = new_fs().await;
        let root = Credentials::ROOT;
        fs.mkdir("/d", 0o755, &root).await.unwrap();
        fs.write_file("/d/f", b"data", FileFlag::W, 0o644, &root)
            .await
            .unwrap();
        // Warm the cache.
        fs.stat("/d/f", &root).await.unwrap();
        fs.rename("/d", "/e", &root).await.unwrap();
        assert!(!fs.exists("/d/f", &root).await);
        assert_eq!(
            fs.read_file("/e/f", FileFlag::R, &root).await.unwrap(),
            b"data"
        );
    }

    #[tokio::test]
    async fn test_rename_loop_prevention() {
        let fs = new_fs().await;
        let root = Credentials::ROOT;
        fs.mkdir("/d", 0o755, &root).await.unwrap();
        fs.mkdir("/d/e", 0o755, &root).await.unwrap();
        let err = fs.rename("/d", "/d/e/x", &root).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::EBUSY);
    }

    #[tokio::test]
    async fn test_remove_checks_existence_before_permission() {
        let fs = new_fs().await;
        let root = Credentials::ROOT;
        fs.mkdir("/locked", 0o555, &root).await.unwrap();
        fs.write_file("/locked/f", b"x", FileFlag::W, 0o644, &root)
            .await
            .unwrap();
        let user = Credentials::new(1000, 1000);

        let err = fs.unlink("/locked/nope", &user).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ENOENT);

        let err = fs.unlink("/locked/f", &user).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::EACCES);
    }

    #[tokio::test]
    async fn test_sync_twin_refused() {
        let fs = new_fs().await;
        let err = fs.stat_sync("/", &Credentials::ROOT).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ENOTSUP);
    }
}

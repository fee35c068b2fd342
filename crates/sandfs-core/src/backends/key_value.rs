// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The synchronous key-value storage engine.
//!
//! Turns any [`SyncKeyValueStore`] into a full filesystem: inodes live
//! under randomly allocated keys, each pointing at a companion data blob
//! (file bytes, or the JSON name→inode-id listing for directories). The
//! root inode lives under the fixed key `/`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::credentials::Credentials;
use crate::error::{ApiError, FsResult};
use crate::file::{File, PreloadFile, WriteOutcome};
use crate::filesystem::{FileSystem, FileSystemMetadata};
use crate::flag::FileFlag;
use crate::inode::{Inode, ROOT_NODE_ID};
use crate::path;
use crate::stats::{FileType, Stats};

/// Transaction scope requested from a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxKind {
    ReadOnly,
    ReadWrite,
}

/// A synchronous key-value store: named, clearable, transactional.
pub trait SyncKeyValueStore: Send + Sync {
    fn name(&self) -> String;
    fn clear(&self) -> FsResult<()>;
    fn begin_transaction(&self, kind: TxKind) -> Box<dyn SyncKvTransaction>;
}

/// A transaction over a synchronous store. `put` reports whether the key
/// was written (false when `overwrite` is off and the key exists).
pub trait SyncKvTransaction: Send {
    fn get(&mut self, key: &str) -> Option<Vec<u8>>;
    fn put(&mut self, key: &str, data: &[u8], overwrite: bool) -> FsResult<bool>;
    fn del(&mut self, key: &str) -> FsResult<()>;
    fn commit(&mut self) -> FsResult<()>;
    fn abort(&mut self) -> FsResult<()>;
}

/// A store too simple for native transactions: plain get/put/del.
/// [`SimpleSyncRwTransaction`] layers rollback on top.
pub trait SimpleSyncStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn put(&self, key: &str, data: &[u8], overwrite: bool) -> bool;
    fn del(&self, key: &str);
}

/// Read-write transaction over a [`SimpleSyncStore`] with in-memory
/// rollback: the pre-image of every touched key is stashed on first
/// touch, and `abort` restores it byte for byte.
///
/// `commit` is a no-op: durability relies on the store's `put` being
/// immediately visible.
pub struct SimpleSyncRwTransaction {
    store: Arc<dyn SimpleSyncStore>,
    original_data: HashMap<String, Option<Vec<u8>>>,
    modified_keys: HashSet<String>,
}

impl SimpleSyncRwTransaction {
    pub fn new(store: Arc<dyn SimpleSyncStore>) -> Self {
        Self {
            store,
            original_data: HashMap::new(),
            modified_keys: HashSet::new(),
        }
    }

    fn stash_old_value(&mut self, key: &str, value: Option<Vec<u8>>) {
        if !self.original_data.contains_key(key) {
            self.original_data.insert(key.to_string(), value);
        }
    }

    fn mark_modified(&mut self, key: &str) {
        self.modified_keys.insert(key.to_string());
        if !self.original_data.contains_key(key) {
            let value = self.store.get(key);
            self.original_data.insert(key.to_string(), value);
        }
    }
}

impl SyncKvTransaction for SimpleSyncRwTransaction {
    fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        let value = self.store.get(key);
        self.stash_old_value(key, value.clone());
        value
    }

    fn put(&mut self, key: &str, data: &[u8], overwrite: bool) -> FsResult<bool> {
        self.mark_modified(key);
        Ok(self.store.put(key, data, overwrite))
    }

    fn del(&mut self, key: &str) -> FsResult<()> {
        self.mark_modified(key);
        self.store.del(key);
        Ok(())
    }

    fn commit(&mut self) -> FsResult<()> {
        Ok(())
    }

    fn abort(&mut self) -> FsResult<()> {
        for key in &self.modified_keys {
            match self.original_data.get(key) {
                Some(Some(value)) => {
                    self.store.put(key, value, true);
                }
                _ => self.store.del(key),
            }
        }
        Ok(())
    }
}

pub(crate) fn encode_dir_listing(listing: &HashMap<String, String>) -> FsResult<Vec<u8>> {
    serde_json::to_vec(listing).map_err(|e| ApiError::io(format!("bad directory listing: {}", e)))
}

pub(crate) fn decode_dir_listing(data: &[u8]) -> FsResult<HashMap<String, String>> {
    serde_json::from_slice(data).map_err(|e| ApiError::io(format!("bad directory listing: {}", e)))
}

/// Generate a random key for a new store node.
pub(crate) fn generate_random_id() -> String {
    Uuid::new_v4().to_string()
}

/// A filesystem over a synchronous key-value store.
#[derive(Clone)]
pub struct SyncKeyValueFileSystem {
    store: Arc<dyn SyncKeyValueStore>,
}

impl SyncKeyValueFileSystem {
    pub fn new(store: Arc<dyn SyncKeyValueStore>) -> FsResult<Self> {
        let fs = Self { store };
        fs.make_root_directory()?;
        Ok(fs)
    }

    /// Wipe the store and recreate the root.
    pub fn empty(&self) -> FsResult<()> {
        self.store.clear()?;
        self.make_root_directory()
    }

    fn make_root_directory(&self) -> FsResult<()> {
        let mut tx = self.store.begin_transaction(TxKind::ReadWrite);
        if tx.get(ROOT_NODE_ID).is_none() {
            let inode = Inode::new(
                generate_random_id(),
                4096,
                (0o777 | FileType::Directory.bits()) as u16,
                0,
                0,
            );
            tx.put(&inode.id, b"{}", false)?;
            tx.put(ROOT_NODE_ID, &inode.serialize(), false)?;
            tx.commit()?;
        }
        Ok(())
    }

    fn get_inode(&self, tx: &mut dyn SyncKvTransaction, id: &str, p: &str) -> FsResult<Inode> {
        let data = tx.get(id).ok_or_else(|| ApiError::not_found(p))?;
        Inode::deserialize(&data)
    }

    fn get_dir_listing(
        &self,
        tx: &mut dyn SyncKvTransaction,
        inode: &Inode,
        p: &str,
    ) -> FsResult<HashMap<String, String>> {
        if !inode.is_directory() {
            return Err(ApiError::not_a_directory(p));
        }
        let data = tx.get(&inode.id).ok_or_else(|| ApiError::not_found(p))?;
        decode_dir_listing(&data)
    }

    /// Resolve `parent/filename` to the store key of its inode, guarding
    /// against resolution cycles with `visited`.
    fn find_inode_id(
        &self,
        tx: &mut dyn SyncKvTransaction,
        parent: &str,
        filename: &str,
        visited: &mut HashSet<String>,
    ) -> FsResult<String> {
        let current_path = path::join(parent, filename);
        if !visited.insert(current_path.clone()) {
            return Err(ApiError::io(
                "Infinite loop detected while finding inode",
            ));
        }

        if parent == "/" && filename.is_empty() {
            return Ok(ROOT_NODE_ID.to_string());
        }

        let parent_id = if parent == "/" {
            ROOT_NODE_ID.to_string()
        } else {
            self.find_inode_id(tx, &path::dirname(parent), path::basename(parent), visited)?
        };
        let parent_inode = self.get_inode(tx, &parent_id, parent)?;
        let listing = self.get_dir_listing(tx, &parent_inode, parent)?;
        listing
            .get(filename)
            .cloned()
            .ok_or_else(|| ApiError::not_found(&current_path))
    }

    fn find_inode(&self, tx: &mut dyn SyncKvTransaction, p: &str) -> FsResult<Inode> {
        let mut visited = HashSet::new();
        let id = self.find_inode_id(tx, &path::dirname(p), path::basename(p), &mut visited)?;
        self.get_inode(tx, &id, p)
    }

    /// Insert `data` under a freshly allocated random key, retrying a
    /// handful of times on the unlikely collision.
    fn add_new_node(&self, tx: &mut dyn SyncKvTransaction, data: &[u8]) -> FsResult<String> {
        let mut retries = 0;
        while retries < 5 {
            let id = generate_random_id();
            if tx.put(&id, data, false)? {
                return Ok(id);
            }
            retries += 1;
        }
        Err(ApiError::io("unable to commit data to key-value store"))
    }

    /// Create a new file or directory node under `p` and commit.
    fn commit_new_node(
        &self,
        p: &str,
        file_type: FileType,
        mode: u32,
        cred: &Credentials,
        data: &[u8],
    ) -> FsResult<Inode> {
        let mut tx = self.store.begin_transaction(TxKind::ReadWrite);
        let result: FsResult<Inode> = (|| {
            let parent_dir = path::dirname(p);
            let fname = path::basename(p);
            let parent_inode = self.find_inode(tx.as_mut(), &parent_dir)?;
            let mut listing = self.get_dir_listing(tx.as_mut(), &parent_inode, &parent_dir)?;

            if !parent_inode.to_stats().has_access(0o2, cred) {
                return Err(ApiError::access_denied(p));
            }
            if p == "/" {
                return Err(ApiError::exists(p));
            }
            if listing.contains_key(fname) {
                return Err(ApiError::exists(p));
            }

            let data_id = self.add_new_node(tx.as_mut(), data)?;
            let inode = Inode::new(
                data_id,
                data.len() as u32,
                (mode | file_type.bits()) as u16,
                cred.uid,
                cred.gid,
            );
            let inode_id = self.add_new_node(tx.as_mut(), &inode.serialize())?;
            listing.insert(fname.to_string(), inode_id);
            tx.put(&parent_inode.id, &encode_dir_listing(&listing)?, true)?;
            Ok(inode)
        })();
        match result {
            Ok(inode) => {
                tx.commit()?;
                Ok(inode)
            }
            Err(e) => {
                let _ = tx.abort();
                Err(e)
            }
        }
    }

    /// Drop the listing entry for `p` and delete its inode and data blob.
    fn remove_entry(&self, p: &str, is_dir: bool, cred: &Credentials) -> FsResult<()> {
        let mut tx = self.store.begin_transaction(TxKind::ReadWrite);
        let result: FsResult<()> = (|| {
            let parent_dir = path::dirname(p);
            let fname = path::basename(p);
            let parent_inode = self.find_inode(tx.as_mut(), &parent_dir)?;
            let mut listing = self.get_dir_listing(tx.as_mut(), &parent_inode, &parent_dir)?;

            // A missing target reports ENOENT even under a parent the
            // caller may not write to.
            let node_id = listing
                .remove(fname)
                .ok_or_else(|| ApiError::not_found(p))?;

            if !parent_inode.to_stats().has_access(0o2, cred) {
                return Err(ApiError::access_denied(p));
            }

            let node = self.get_inode(tx.as_mut(), &node_id, p)?;
            if !is_dir && node.is_directory() {
                return Err(ApiError::is_directory(p));
            }
            if is_dir && !node.is_directory() {
                return Err(ApiError::not_a_directory(p));
            }

            tx.del(&node.id)?;
            tx.del(&node_id)?;
            tx.put(&parent_inode.id, &encode_dir_listing(&listing)?, true)?;
            Ok(())
        })();
        match result {
            Ok(()) => tx.commit(),
            Err(e) => {
                let _ = tx.abort();
                Err(e)
            }
        }
    }

    /// Push a file's buffer and (when changed) metadata back to the
    /// store. The inode id is re-resolved through the parent listing, as
    /// a rename may have replaced it since the file was opened.
    pub(crate) fn sync_file(&self, p: &str, data: &[u8], stats: &Stats) -> FsResult<()> {
        let mut tx = self.store.begin_transaction(TxKind::ReadWrite);
        let result: FsResult<()> = (|| {
            let mut visited = HashSet::new();
            let inode_id =
                self.find_inode_id(tx.as_mut(), &path::dirname(p), path::basename(p), &mut visited)?;
            let mut inode = self.get_inode(tx.as_mut(), &inode_id, p)?;
            let inode_changed = inode.update(stats);
            tx.put(&inode.id, data, true)?;
            if inode_changed {
                tx.put(&inode_id, &inode.serialize(), true)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => tx.commit(),
            Err(e) => {
                let _ = tx.abort();
                Err(e)
            }
        }
    }
}

impl FileSystem for SyncKeyValueFileSystem {
    fn metadata(&self) -> FileSystemMetadata {
        FileSystemMetadata {
            name: self.store.name(),
            readonly: false,
            synchronous: true,
            supports_properties: true,
            supports_links: false,
            total_space: 0,
            free_space: 0,
        }
    }

    fn stat_sync(&self, p: &str, _cred: &Credentials) -> FsResult<Stats> {
        let mut tx = self.store.begin_transaction(TxKind::ReadOnly);
        let inode = self.find_inode(tx.as_mut(), p)?;
        Ok(inode.to_stats())
    }

    fn open_file_sync(
        &self,
        p: &str,
        flag: FileFlag,
        cred: &Credentials,
    ) -> FsResult<Box<dyn File>> {
        let mut tx = self.store.begin_transaction(TxKind::ReadOnly);
        let mut visited = HashSet::new();
        let inode_id =
            self.find_inode_id(tx.as_mut(), &path::dirname(p), path::basename(p), &mut visited)?;
        let inode = self.get_inode(tx.as_mut(), &inode_id, p)?;
        let data = tx
            .get(&inode.id)
            .ok_or_else(|| ApiError::not_found(p))?;
        let stats = inode.to_stats();
        crate::file::check_open_access(p, &stats, flag, cred)?;
        Ok(Box::new(SyncKvFile::new(
            self.clone(),
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
        let inode = self.commit_new_node(p, FileType::File, mode, cred, &[])?;
        Ok(Box::new(SyncKvFile::new(
            self.clone(),
            p.to_string(),
            flag,
            inode.to_stats(),
            Vec::new(),
        )?))
    }

    fn unlink_sync(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        self.remove_entry(p, false, cred)
    }

    fn rmdir_sync(&self, p: &str, cred: &Credentials) -> FsResult<()> {
        if !self.readdir_sync(p, cred)?.is_empty() {
            return Err(ApiError::not_empty(p));
        }
        self.remove_entry(p, true, cred)
    }

    fn mkdir_sync(&self, p: &str, mode: u32, cred: &Credentials) -> FsResult<()> {
        self.commit_new_node(p, FileType::Directory, mode, cred, b"{}")?;
        Ok(())
    }

    fn readdir_sync(&self, p: &str, _cred: &Credentials) -> FsResult<Vec<String>> {
        let mut tx = self.store.begin_transaction(TxKind::ReadOnly);
        let inode = self.find_inode(tx.as_mut(), p)?;
        let listing = self.get_dir_listing(tx.as_mut(), &inode, p)?;
        Ok(listing.into_keys().collect())
    }

    fn rename_sync(&self, old_path: &str, new_path: &str, cred: &Credentials) -> FsResult<()> {
        let mut tx = self.store.begin_transaction(TxKind::ReadWrite);
        let result: FsResult<()> = (|| {
            let old_parent = path::dirname(old_path);
            let old_name = path::basename(old_path);
            let new_parent = path::dirname(new_path);
            let new_name = path::basename(new_path);

            let old_dir_inode = self.find_inode(tx.as_mut(), &old_parent)?;
            let mut old_listing = self.get_dir_listing(tx.as_mut(), &old_dir_inode, &old_parent)?;
            if !old_dir_inode.to_stats().has_access(0o2, cred) {
                return Err(ApiError::access_denied(old_path));
            }

            let node_id = old_listing
                .remove(old_name)
                .ok_or_else(|| ApiError::not_found(old_path))?;

            // Moving a directory into itself or a descendant would orphan
            // the whole subtree.
            if format!("{}/", new_parent).starts_with(&format!("{}/", old_path)) {
                return Err(ApiError::busy(old_parent));
            }

            let same_parent = new_parent == old_parent;
            let (new_dir_inode, mut new_listing) = if same_parent {
                (old_dir_inode.clone(), old_listing.clone())
            } else {
                let inode = self.find_inode(tx.as_mut(), &new_parent)?;
                let listing = self.get_dir_listing(tx.as_mut(), &inode, &new_parent)?;
                (inode, listing)
            };

            if let Some(existing_id) = new_listing.get(new_name).cloned() {
                let existing = self.get_inode(tx.as_mut(), &existing_id, new_path)?;
                if existing.is_file() {
                    tx.del(&existing.id)?;
                    tx.del(&existing_id)?;
                } else {
                    return Err(ApiError::not_permitted(new_path));
                }
            }

            new_listing.insert(new_name.to_string(), node_id);
            if same_parent {
                tx.put(&old_dir_inode.id, &encode_dir_listing(&new_listing)?, true)?;
            } else {
                tx.put(&old_dir_inode.id, &encode_dir_listing(&old_listing)?, true)?;
                tx.put(&new_dir_inode.id, &encode_dir_listing(&new_listing)?, true)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => tx.commit(),
            Err(e) => {
                debug!(old = old_path, new = new_path, "rename aborted: {}", e);
                let _ = tx.abort();
                Err(e)
            }
        }
    }
}

/// A buffered handle whose `sync` writes the buffer and metadata back to
/// the owning key-value filesystem.
pub struct SyncKvFile {
    fs: SyncKeyValueFileSystem,
    pre: PreloadFile,
}

impl SyncKvFile {
    fn new(
        fs: SyncKeyValueFileSystem,
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
}

#[async_trait::async_trait]
impl File for SyncKvFile {
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
            self.fs
                .sync_file(self.pre.path(), self.pre.buffer(), self.pre.stat())?;
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
    use crate::backends::memory::InMemoryStore;
    use crate::error::ErrorCode;

    fn new_fs() -> SyncKeyValueFileSystem {
        SyncKeyValueFileSystem::new(Arc::new(InMemoryStore::new("test"))).unwrap()
    }

    fn expect_err<T>(result: crate::error::FsResult<T>) -> crate::error::ApiError {
        match result {
            Ok(_) => panic!("expected an error, got Ok"),
            Err(e) => e,
        }
    }

    #[test]
    fn test_root_exists() {
        let fs = new_fs();
        let stats = fs.stat_sync("/", &Credentials::ROOT).unwrap();
        assert!(stats.is_directory());
        assert_eq!(stats.mode & 0o777, 0o777);
    }

    #[test]
    fn test_mkdir_readdir() {
        let fs = new_fs();
        fs.mkdir_sync("/a", 0o755, &Credentials::ROOT).unwrap();
        assert_eq!(fs.readdir_sync("/", &Credentials::ROOT).unwrap(), ["a"]);
        assert!(fs.stat_sync("/a", &Credentials::ROOT).unwrap().is_directory());
    }

    #[test]
    fn test_mkdir_existing_fails() {
        let fs = new_fs();
        fs.mkdir_sync("/a", 0o755, &Credentials::ROOT).unwrap();
        let err = fs.mkdir_sync("/a", 0o755, &Credentials::ROOT).unwrap_err();
        assert_eq!(err.code, ErrorCode::EEXIST);
    }

    #[test]
    fn test_create_write_read() {
        let fs = new_fs();
        fs.write_file_sync(
            "/f.txt",
            b"hello",
            FileFlag::W,
            0o644,
            &Credentials::ROOT,
        )
        .unwrap();
        let stats = fs.stat_sync("/f.txt", &Credentials::ROOT).unwrap();
        assert_eq!(stats.size, 5);
        let data = fs
            .read_file_sync("/f.txt", FileFlag::R, &Credentials::ROOT)
            .unwrap();
        assert_eq!(data, b"hello");
    }

    #[test]
    fn test_unlink_removes_nodes() {
        let fs = new_fs();
        fs.write_file_sync("/f", b"x", FileFlag::W, 0o644, &Credentials::ROOT)
            .unwrap();
        fs.unlink_sync("/f", &Credentials::ROOT).unwrap();
        assert!(!fs.exists_sync("/f", &Credentials::ROOT));
        let err = fs
            .read_file_sync("/f", FileFlag::R, &Credentials::ROOT)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ENOENT);
    }

    #[test]
    fn test_rmdir_requires_empty() {
        let fs = new_fs();
        fs.mkdir_sync("/d", 0o755, &Credentials::ROOT).unwrap();
        fs.write_file_sync("/d/f", b"x", FileFlag::W, 0o644, &Credentials::ROOT)
            .unwrap();
        let err = fs.rmdir_sync("/d", &Credentials::ROOT).unwrap_err();
        assert_eq!(err.code, ErrorCode::ENOTEMPTY);
        fs.unlink_sync("/d/f", &Credentials::ROOT).unwrap();
        fs.rmdir_sync("/d", &Credentials::ROOT).unwrap();
    }

    #[test]
    fn test_unlink_of_dir_is_eisdir() {
        let fs = new_fs();
        fs.mkdir_sync("/d", 0o755, &Credentials::ROOT).unwrap();
        let err = fs.unlink_sync("/d", &Credentials::ROOT).unwrap_err();
        assert_eq!(err.code, ErrorCode::EISDIR);
    }

    #[test]
    fn test_rename_same_directory() {
        let fs = new_fs();
        fs.write_file_sync("/a", b"data", FileFlag::W, 0o644, &Credentials::ROOT)
            .unwrap();
        fs.rename_sync("/a", "/b", &Credentials::ROOT).unwrap();
        assert!(!fs.exists_sync("/a", &Credentials::ROOT));
        assert_eq!(
            fs.read_file_sync("/b", FileFlag::R, &Credentials::ROOT).unwrap(),
            b"data"
        );

        // And back again: the tree is restored.
        fs.rename_sync("/b", "/a", &Credentials::ROOT).unwrap();
        assert_eq!(
            fs.read_file_sync("/a", FileFlag::R, &Credentials::ROOT).unwrap(),
            b"data"
        );
    }

    #[test]
    fn test_rename_into_own_subtree_is_busy() {
        let fs = new_fs();
        fs.mkdir_sync("/d", 0o755, &Credentials::ROOT).unwrap();
        fs.mkdir_sync("/d/e", 0o755, &Credentials::ROOT).unwrap();
        let err = fs
            .rename_sync("/d", "/d/e/x", &Credentials::ROOT)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::EBUSY);
        // Tree unchanged.
        assert!(fs.exists_sync("/d/e", &Credentials::ROOT));
    }

    #[test]
    fn test_rename_over_existing_file_replaces_it() {
        let fs = new_fs();
        fs.write_file_sync("/a", b"AAA", FileFlag::W, 0o644, &Credentials::ROOT)
            .unwrap();
        fs.write_file_sync("/b", b"BBB", FileFlag::W, 0o644, &Credentials::ROOT)
            .unwrap();
        fs.rename_sync("/a", "/b", &Credentials::ROOT).unwrap();
        assert_eq!(
            fs.read_file_sync("/b", FileFlag::R, &Credentials::ROOT).unwrap(),
            b"AAA"
        );
        assert!(!fs.exists_sync("/a", &Credentials::ROOT));
    }

    #[test]
    fn test_rename_over_existing_directory_is_eperm() {
        let fs = new_fs();
        fs.write_file_sync("/a", b"AAA", FileFlag::W, 0o644, &Credentials::ROOT)
            .unwrap();
        fs.mkdir_sync("/d", 0o755, &Credentials::ROOT).unwrap();
        let err = fs.rename_sync("/a", "/d", &Credentials::ROOT).unwrap_err();
        assert_eq!(err.code, ErrorCode::EPERM);
    }

    #[test]
    fn test_append() {
        let fs = new_fs();
        fs.write_file_sync("/f", b"one", FileFlag::W, 0o644, &Credentials::ROOT)
            .unwrap();
        fs.append_file_sync("/f", b" two", FileFlag::A, 0o644, &Credentials::ROOT)
            .unwrap();
        assert_eq!(
            fs.read_file_sync("/f", FileFlag::R, &Credentials::ROOT).unwrap(),
            b"one two"
        );
    }

    #[test]
    fn test_truncate_grow_and_shrink() {
        let fs = new_fs();
        fs.write_file_sync("/f", b"abcdef", FileFlag::W, 0o644, &Credentials::ROOT)
            .unwrap();
        fs.truncate_sync("/f", 3, &Credentials::ROOT).unwrap();
        assert_eq!(
            fs.read_file_sync("/f", FileFlag::R, &Credentials::ROOT).unwrap(),
            b"abc"
        );
        fs.truncate_sync("/f", 5, &Credentials::ROOT).unwrap();
        assert_eq!(
            fs.read_file_sync("/f", FileFlag::R, &Credentials::ROOT).unwrap(),
            b"abc\0\0"
        );
    }

    #[test]
    fn test_chmod_preserves_type() {
        let fs = new_fs();
        fs.write_file_sync("/f", b"x", FileFlag::W, 0o644, &Credentials::ROOT)
            .unwrap();
        fs.chmod_sync("/f", 0o600, &Credentials::ROOT).unwrap();
        let stats = fs.stat_sync("/f", &Credentials::ROOT).unwrap();
        assert!(stats.is_file());
        assert_eq!(stats.mode & 0o777, 0o600);
    }

    #[test]
    fn test_exclusive_create_on_existing_fails() {
        let fs = new_fs();
        fs.write_file_sync("/f", b"x", FileFlag::W, 0o644, &Credentials::ROOT)
            .unwrap();
        let err = expect_err(fs.open_sync("/f", FileFlag::WExcl, 0o644, &Credentials::ROOT));
        assert_eq!(err.code, ErrorCode::EEXIST);
    }

    #[test]
    fn test_open_missing_readonly_is_enoent() {
        let fs = new_fs();
        let err = expect_err(fs.open_sync("/nope", FileFlag::R, 0o644, &Credentials::ROOT));
        assert_eq!(err.code, ErrorCode::ENOENT);
    }

    #[test]
    fn test_write_permission_enforced() {
        let fs = new_fs();
        fs.mkdir_sync("/locked", 0o555, &Credentials::ROOT).unwrap();
        let user = Credentials::new(1000, 1000);
        let err = fs
            .write_file_sync("/locked/f", b"x", FileFlag::W, 0o644, &user)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::EACCES);
    }

    #[test]
    fn test_remove_checks_existence_before_permission() {
        let fs = new_fs();
        fs.mkdir_sync("/locked", 0o555, &Credentials::ROOT).unwrap();
        fs.write_file_sync("/locked/f", b"x", FileFlag::W, 0o644, &Credentials::ROOT)
            .unwrap();
        let user = Credentials::new(1000, 1000);

        let err = fs.unlink_sync("/locked/nope", &user).unwrap_err();
        assert_eq!(err.code, ErrorCode::ENOENT);

        let err = fs.unlink_sync("/locked/f", &user).unwrap_err();
        assert_eq!(err.code, ErrorCode::EACCES);
    }

    #[test]
    fn test_transaction_abort_restores_preimage() {
        let store = Arc::new(InMemoryStore::new("test"));
        store.put("k", b"before", true);
        let mut tx = SimpleSyncRwTransaction::new(store.clone());
        tx.put("k", b"after", true).unwrap();
        tx.put("fresh", b"new", false).unwrap();
        tx.del("k2").unwrap();
        tx.abort().unwrap();
        assert_eq!(store.get("k").unwrap(), b"before");
        assert!(store.get("fresh").is_none());
    }
}

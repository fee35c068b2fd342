// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory key-value store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::backends::key_value::{
    SimpleSyncRwTransaction, SimpleSyncStore, SyncKeyValueFileSystem, SyncKeyValueStore,
    SyncKvTransaction, TxKind,
};
use crate::error::FsResult;

/// A [`SyncKeyValueStore`] holding everything in a process-local map.
/// Clones share the same map.
#[derive(Clone)]
pub struct InMemoryStore {
    name: String,
    data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl SimpleSyncStore for InMemoryStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.lock().unwrap().get(key).cloned()
    }

    fn put(&self, key: &str, data: &[u8], overwrite: bool) -> bool {
        let mut map = self.data.lock().unwrap();
        if !overwrite && map.contains_key(key) {
            return false;
        }
        map.insert(key.to_string(), data.to_vec());
        true
    }

    fn del(&self, key: &str) {
        self.data.lock().unwrap().remove(key);
    }
}

impl SyncKeyValueStore for InMemoryStore {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn clear(&self) -> FsResult<()> {
        self.data.lock().unwrap().clear();
        Ok(())
    }

    fn begin_transaction(&self, _kind: TxKind) -> Box<dyn SyncKvTransaction> {
        Box::new(SimpleSyncRwTransaction::new(Arc::new(self.clone())))
    }
}

/// The default backend: a key-value filesystem over an in-memory store.
pub fn in_memory_filesystem(name: impl Into<String>) -> FsResult<SyncKeyValueFileSystem> {
    SyncKeyValueFileSystem::new(Arc::new(InMemoryStore::new(name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_respects_overwrite() {
        let store = InMemoryStore::new("mem");
        assert!(store.put("k", b"one", false));
        assert!(!store.put("k", b"two", false));
        assert_eq!(store.get("k").unwrap(), b"one");
        assert!(store.put("k", b"two", true));
        assert_eq!(store.get("k").unwrap(), b"two");
    }

    #[test]
    fn test_del() {
        let store = InMemoryStore::new("mem");
        store.put("k", b"v", true);
        store.del("k");
        assert!(store.get("k").is_none());
    }

    #[test]
    fn test_clones_share_data() {
        let store = InMemoryStore::new("mem");
        let other = store.clone();
        store.put("k", b"v", true);
        assert_eq!(other.get("k").unwrap(), b"v");
        other.clear().unwrap();
        assert!(store.get("k").is_none());
    }
}

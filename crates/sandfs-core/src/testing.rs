// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test support: an in-memory asynchronous store with optional fault
//! injection, so asynchronous engines can be exercised without real
//! asynchronous storage. Every operation yields to the scheduler once,
//! which keeps interleaving bugs reproducible under the test runtime.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::backends::async_key_value::{AsyncKeyValueStore, AsyncKvTransaction};
use crate::backends::key_value::TxKind;
use crate::error::{ApiError, FsResult};

/// An [`AsyncKeyValueStore`] over a process-local map. Writes can be
/// made to fail on demand to drive error paths.
pub struct InMemoryAsyncStore {
    name: String,
    data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryAsyncStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Arc::new(Mutex::new(HashMap::new())),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every subsequent `put`/`del` fail with EIO.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AsyncKeyValueStore for InMemoryAsyncStore {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn clear(&self) -> FsResult<()> {
        tokio::task::yield_now().await;
        self.data.lock().unwrap().clear();
        Ok(())
    }

    fn begin_transaction(&self, _kind: TxKind) -> Box<dyn AsyncKvTransaction> {
        Box::new(InMemoryAsyncTransaction {
            data: self.data.clone(),
            fail_writes: self.fail_writes.clone(),
            original_data: HashMap::new(),
            modified_keys: HashSet::new(),
        })
    }
}

/// Transaction with the same pre-image stash rollback as the simple
/// synchronous adapter.
struct InMemoryAsyncTransaction {
    data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
    original_data: HashMap<String, Option<Vec<u8>>>,
    modified_keys: HashSet<String>,
}

impl InMemoryAsyncTransaction {
    fn stash(&mut self, key: &str) {
        if !self.original_data.contains_key(key) {
            let value = self.data.lock().unwrap().get(key).cloned();
            self.original_data.insert(key.to_string(), value);
        }
    }
}

#[async_trait]
impl AsyncKvTransaction for InMemoryAsyncTransaction {
    async fn get(&mut self, key: &str) -> FsResult<Option<Vec<u8>>> {
        tokio::task::yield_now().await;
        let value = self.data.lock().unwrap().get(key).cloned();
        self.stash(key);
        Ok(value)
    }

    async fn put(&mut self, key: &str, data: &[u8], overwrite: bool) -> FsResult<bool> {
        tokio::task::yield_now().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ApiError::io("injected write failure"));
        }
        self.stash(key);
        self.modified_keys.insert(key.to_string());
        let mut map = self.data.lock().unwrap();
        if !overwrite && map.contains_key(key) {
            return Ok(false);
        }
        map.insert(key.to_string(), data.to_vec());
        Ok(true)
    }

    async fn del(&mut self, key: &str) -> FsResult<()> {
        tokio::task::yield_now().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ApiError::io("injected write failure"));
        }
        self.stash(key);
        self.modified_keys.insert(key.to_string());
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    async fn commit(&mut self) -> FsResult<()> {
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn abort(&mut self) -> FsResult<()> {
        let mut map = self.data.lock().unwrap();
        for key in &self.modified_keys {
            match self.original_data.get(key) {
                Some(Some(value)) => {
                    map.insert(key.clone(), value.clone());
                }
                _ => {
                    map.remove(key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_del() {
        let store = InMemoryAsyncStore::new("t");
        let mut tx = store.begin_transaction(TxKind::ReadWrite);
        assert!(tx.put("k", b"v", false).await.unwrap());
        assert!(!tx.put("k", b"w", false).await.unwrap());
        assert_eq!(tx.get("k").await.unwrap().unwrap(), b"v");
        tx.del("k").await.unwrap();
        assert!(tx.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_abort_restores() {
        let store = InMemoryAsyncStore::new("t");
        {
            let mut tx = store.begin_transaction(TxKind::ReadWrite);
            tx.put("k", b"original", true).await.unwrap();
            tx.commit().await.unwrap();
        }
        let mut tx = store.begin_transaction(TxKind::ReadWrite);
        tx.put("k", b"changed", true).await.unwrap();
        tx.put("new", b"x", false).await.unwrap();
        tx.abort().await.unwrap();
        let mut check = store.begin_transaction(TxKind::ReadOnly);
        assert_eq!(check.get("k").await.unwrap().unwrap(), b"original");
        assert!(check.get("new").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = InMemoryAsyncStore::new("t");
        store.set_fail_writes(true);
        let mut tx = store.begin_transaction(TxKind::ReadWrite);
        assert!(tx.put("k", b"v", true).await.is_err());
    }
}

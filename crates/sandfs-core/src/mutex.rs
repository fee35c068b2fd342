// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path-keyed mutual exclusion.
//!
//! Asynchronous backends execute multi-step operations with suspension
//! points in the middle; the per-path mutex serializes them so two
//! operations on the same path cannot interleave. Waiters queue FIFO. A
//! release hands the lock to the next waiter through a channel send, so
//! the new holder resumes on a later scheduler poll rather than barging
//! in ahead of already-queued work.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::oneshot;

#[derive(Default)]
pub struct PathMutex {
    // Presence of an entry means the path is locked; the queue holds the
    // wakers of blocked acquirers in arrival order.
    queues: Mutex<HashMap<String, VecDeque<oneshot::Sender<()>>>>,
}

impl PathMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `p`, waiting in FIFO order if it is held.
    pub async fn lock(&self, p: &str) {
        let waiter = {
            let mut queues = self.queues.lock().unwrap();
            match queues.get_mut(p) {
                None => {
                    queues.insert(p.to_string(), VecDeque::new());
                    None
                }
                Some(queue) => {
                    let (tx, rx) = oneshot::channel();
                    queue.push_back(tx);
                    Some(rx)
                }
            }
        };
        if let Some(rx) = waiter {
            // The sender is never dropped while the entry exists, but a
            // lost sender must not deadlock the caller.
            let _ = rx.await;
        }
    }

    /// Release the lock for `p`, waking the next waiter if any.
    pub fn unlock(&self, p: &str) {
        let mut queues = self.queues.lock().unwrap();
        if let Some(queue) = queues.get_mut(p) {
            match queue.pop_front() {
                Some(next) => {
                    let _ = next.send(());
                }
                None => {
                    queues.remove(p);
                }
            }
        }
    }

    /// Acquire without waiting; fails if the path is locked.
    pub fn try_lock(&self, p: &str) -> bool {
        let mut queues = self.queues.lock().unwrap();
        if queues.contains_key(p) {
            return false;
        }
        queues.insert(p.to_string(), VecDeque::new());
        true
    }

    pub fn is_locked(&self, p: &str) -> bool {
        self.queues.lock().unwrap().contains_key(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_lock_unlock() {
        let mutex = PathMutex::new();
        mutex.lock("/a").await;
        assert!(mutex.is_locked("/a"));
        assert!(!mutex.is_locked("/b"));
        mutex.unlock("/a");
        assert!(!mutex.is_locked("/a"));
    }

    #[tokio::test]
    async fn test_try_lock() {
        let mutex = PathMutex::new();
        assert!(mutex.try_lock("/a"));
        assert!(!mutex.try_lock("/a"));
        mutex.unlock("/a");
        assert!(mutex.try_lock("/a"));
    }

    #[tokio::test]
    async fn test_waiters_run_fifo() {
        let mutex = Arc::new(PathMutex::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        mutex.lock("/p").await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let mutex = mutex.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                mutex.lock("/p").await;
                order.lock().unwrap().push(i);
                mutex.unlock("/p");
            }));
            // Make arrival order deterministic.
            tokio::task::yield_now().await;
        }

        mutex.unlock("/p");
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_independent_paths_do_not_block() {
        let mutex = PathMutex::new();
        mutex.lock("/a").await;
        mutex.lock("/b").await;
        assert!(mutex.is_locked("/a"));
        assert!(mutex.is_locked("/b"));
        mutex.unlock("/a");
        mutex.unlock("/b");
    }
}

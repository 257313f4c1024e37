//! Coalescing work queue keyed by object identity.
//!
//! At most one reconcile runs per key at a time; keys pushed while their
//! reconcile is in flight are marked dirty and re-queued on completion.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

use tokio::sync::Notify;

pub struct KeyQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
}

struct Inner<K> {
    order: VecDeque<K>,
    queued: HashSet<K>,
    active: HashSet<K>,
    dirty: HashSet<K>,
}

impl<K: Clone + Eq + Hash> KeyQueue<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                queued: HashSet::new(),
                active: HashSet::new(),
                dirty: HashSet::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue a key. Duplicate enqueues coalesce; keys whose reconcile is
    /// running are deferred until it finishes.
    pub fn push(&self, key: K) {
        let mut inner = self.inner.lock().unwrap();
        if inner.active.contains(&key) {
            inner.dirty.insert(key);
            return;
        }
        if inner.queued.insert(key.clone()) {
            inner.order.push_back(key);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Wait for the next key and mark it active.
    pub async fn pop(&self) -> K {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(key) = inner.order.pop_front() {
                    inner.queued.remove(&key);
                    inner.active.insert(key.clone());
                    if !inner.order.is_empty() {
                        self.notify.notify_one();
                    }
                    return key;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark a key's reconcile as finished. Returns true when the key was
    /// dirtied meanwhile and has been re-queued.
    pub fn done(&self, key: &K) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.active.remove(key);
        if inner.dirty.remove(key) && inner.queued.insert(key.clone()) {
            inner.order.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
            return true;
        }
        false
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Clone + Eq + Hash> Default for KeyQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_pushes_coalesce() {
        let q = KeyQueue::new();
        q.push("a");
        q.push("a");
        q.push("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().await, "a");
        assert_eq!(q.pop().await, "b");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn pushes_during_reconcile_requeue_on_done() {
        let q = KeyQueue::new();
        q.push("a");
        let key = q.pop().await;

        // Event arrives while "a" reconciles: deferred, not queued.
        q.push("a");
        assert!(q.is_empty());

        assert!(q.done(&key), "dirty key must be re-queued");
        assert_eq!(q.pop().await, "a");
        assert!(!q.done(&"a"));
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let q = std::sync::Arc::new(KeyQueue::new());
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop().await });
        tokio::task::yield_now().await;
        q.push("late");
        assert_eq!(waiter.await.unwrap(), "late");
    }
}

//! Keyed one-shot completions for request/response correlation.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// In-flight waits keyed by request id. Each key holds at most one waiter at
/// a time; completing or abandoning a wait frees the key. Dropping the map
/// (or calling [`clear`](Self::clear)) cancels every outstanding receiver.
pub struct PendingMap<K, V> {
    inner: Mutex<HashMap<K, oneshot::Sender<V>>>,
}

impl<K: Eq + Hash, V> PendingMap<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a waiter for `key`. Returns `None` when one is already in
    /// flight, leaving the existing waiter untouched.
    pub fn register(&self, key: K) -> Option<oneshot::Receiver<V>> {
        let mut inner = self.inner.lock();
        if inner.contains_key(&key) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        inner.insert(key, tx);
        Some(rx)
    }

    /// Complete the waiter for `key`. Returns false when no waiter was
    /// registered or the receiver is already gone.
    pub fn complete(&self, key: &K, value: V) -> bool {
        match self.inner.lock().remove(key) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Abandon the wait for `key` (e.g. after a timeout) so the key can be
    /// reused. Returns whether a waiter was present.
    pub fn remove(&self, key: &K) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Drop every waiter, cancelling their receivers.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl<K: Eq + Hash, V> Default for PendingMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_delivers_to_registered_waiter() {
        let map: PendingMap<String, u32> = PendingMap::new();
        let rx = map.register("a".to_string()).unwrap();

        assert!(map.complete(&"a".to_string(), 7));
        assert_eq!(rx.await.unwrap(), 7);
        assert!(map.is_empty());
    }

    #[test]
    fn second_register_for_same_key_is_rejected() {
        let map: PendingMap<&str, ()> = PendingMap::new();
        let _first = map.register("cid").unwrap();
        assert!(map.register("cid").is_none());

        // The original waiter survives the rejected attempt.
        assert!(map.complete(&"cid", ()));
    }

    #[tokio::test]
    async fn remove_cancels_the_receiver() {
        let map: PendingMap<u8, u8> = PendingMap::new();
        let rx = map.register(1).unwrap();
        assert!(map.remove(&1));
        assert!(rx.await.is_err());
        assert!(!map.complete(&1, 0));
    }

    #[tokio::test]
    async fn clear_cancels_everything() {
        let map: PendingMap<u8, u8> = PendingMap::new();
        let rx1 = map.register(1).unwrap();
        let rx2 = map.register(2).unwrap();
        map.clear();
        assert!(rx1.await.is_err());
        assert!(rx2.await.is_err());
    }
}

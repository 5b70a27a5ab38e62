//! In-memory store implementation for testing
//!
//! Fast, no side effects, no persistence across restarts. Supports
//! optimistic transactions and a change stream, and exposes raw access so
//! tests can simulate data loss behind the engine's back.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{KeyValueStore, StoreError, StoreEvent, StoreTransaction};

const EVENT_CAPACITY: usize = 4096;

#[derive(Debug)]
struct Inner {
    data: Mutex<HashMap<String, Vec<u8>>>,
    events: broadcast::Sender<StoreEvent>,
    transactions: bool,
}

impl Inner {
    fn publish(&self, key: &str, value: &[u8]) {
        // No subscribers is not an error
        let _ = self.events.send(StoreEvent {
            key: key.to_string(),
            value: value.to_vec(),
        });
    }
}

/// In-memory key-value store
///
/// Cloning yields another handle to the same data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an empty store with transaction support
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Create an empty store that rejects `begin()`
    pub fn without_transactions() -> Self {
        Self::build(false)
    }

    fn build(transactions: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        MemoryStore {
            inner: Arc::new(Inner {
                data: Mutex::new(HashMap::new()),
                events,
                transactions,
            }),
        }
    }

    /// Read a value without going through the async interface
    pub fn raw_get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.data.lock().get(key).cloned()
    }

    /// Overwrite a value without emitting a change event
    pub fn force_put(&self, key: &str, value: Vec<u8>) {
        self.inner.data.lock().insert(key.to_string(), value);
    }

    /// Drop a key as if the store had lost it
    pub fn force_remove(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.data.lock().remove(key)
    }

    /// All keys starting with `prefix`, sorted
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .data
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.inner.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.raw_get(key))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.inner.publish(key, &value);
        self.inner.data.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
        let mut data = self.inner.data.lock();
        if data.contains_key(key) {
            return Ok(false);
        }
        self.inner.publish(key, &value);
        data.insert(key.to_string(), value);
        Ok(true)
    }

    async fn replace(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
    ) -> Result<bool, StoreError> {
        let mut data = self.inner.data.lock();
        match data.get_mut(key) {
            Some(current) if current.as_slice() == expected => {
                self.inner.publish(key, &value);
                *current = value;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        let mut data = self.inner.data.lock();
        match data.get(key) {
            Some(current) if current.as_slice() == expected => {
                data.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn supports_transactions(&self) -> bool {
        self.inner.transactions
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        if !self.inner.transactions {
            return Err(StoreError::Unsupported("transactions"));
        }
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            state: Mutex::new(TxState::default()),
        }))
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<StoreEvent>> {
        Some(self.inner.events.subscribe())
    }
}

#[derive(Debug, Default)]
struct TxState {
    /// Committed value of each key the first time the transaction saw it
    reads: HashMap<String, Option<Vec<u8>>>,
    /// Staged writes; `None` stages a removal
    writes: HashMap<String, Option<Vec<u8>>>,
}

/// Optimistic transaction over a [`MemoryStore`]
///
/// Commit fails with [`StoreError::Conflict`] if any key read by the
/// transaction changed underneath it.
#[derive(Debug)]
pub struct MemoryTransaction {
    inner: Arc<Inner>,
    state: Mutex<TxState>,
}

impl MemoryTransaction {
    fn view(&self, state: &mut TxState, key: &str) -> Option<Vec<u8>> {
        if let Some(staged) = state.writes.get(key) {
            return staged.clone();
        }
        let current = self.inner.data.lock().get(key).cloned();
        state
            .reads
            .entry(key.to_string())
            .or_insert_with(|| current.clone());
        current
    }
}

#[async_trait]
impl KeyValueStore for MemoryTransaction {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut state = self.state.lock();
        Ok(self.view(&mut state, key))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.state.lock().writes.insert(key.to_string(), Some(value));
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        if self.view(&mut state, key).is_some() {
            return Ok(false);
        }
        state.writes.insert(key.to_string(), Some(value));
        Ok(true)
    }

    async fn replace(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        if self.view(&mut state, key).as_deref() != Some(expected) {
            return Ok(false);
        }
        state.writes.insert(key.to_string(), Some(value));
        Ok(true)
    }

    async fn remove(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        if self.view(&mut state, key).as_deref() != Some(expected) {
            return Ok(false);
        }
        state.writes.insert(key.to_string(), None);
        Ok(true)
    }

    fn supports_transactions(&self) -> bool {
        false
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    fn as_store(&self) -> &dyn KeyValueStore {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction { inner, state } = *self;
        let state = state.into_inner();
        let mut data = inner.data.lock();
        for (key, seen) in &state.reads {
            if data.get(key) != seen.as_ref() {
                return Err(StoreError::Conflict(key.clone()));
            }
        }
        for (key, staged) in state.writes {
            match staged {
                Some(value) => {
                    inner.publish(&key, &value);
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conditional_operations() {
        let store = MemoryStore::new();

        assert!(store.put_if_absent("k", b"a".to_vec()).await.unwrap());
        assert!(!store.put_if_absent("k", b"b".to_vec()).await.unwrap());

        assert!(!store.replace("k", b"x", b"c".to_vec()).await.unwrap());
        assert!(store.replace("k", b"a", b"c".to_vec()).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"c".to_vec()));

        assert!(!store.remove("k", b"a").await.unwrap());
        assert!(store.remove("k", b"c").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_replace_missing_key_fails() {
        let store = MemoryStore::new();
        assert!(!store.replace("k", b"a", b"b".to_vec()).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_transaction_read_your_writes() {
        let store = MemoryStore::new();
        let tx = store.begin().await.unwrap();

        tx.put("k", b"a".to_vec()).await.unwrap();
        assert_eq!(tx.get("k").await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(store.get("k").await.unwrap(), None);

        tx.commit().await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn test_transaction_rollback_discards_writes() {
        let store = MemoryStore::new();
        store.put("k", b"a".to_vec()).await.unwrap();

        let tx = store.begin().await.unwrap();
        assert!(tx.remove("k", b"a").await.unwrap());
        assert_eq!(tx.get("k").await.unwrap(), None);
        tx.rollback().await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn test_transaction_conflict_on_concurrent_write() {
        let store = MemoryStore::new();
        store.put("k", b"a".to_vec()).await.unwrap();

        let tx = store.begin().await.unwrap();
        assert_eq!(tx.get("k").await.unwrap(), Some(b"a".to_vec()));
        tx.put("other", b"x".to_vec()).await.unwrap();

        store.put("k", b"b".to_vec()).await.unwrap();

        let result = tx.commit().await;
        assert_eq!(result, Err(StoreError::Conflict("k".to_string())));
        assert_eq!(store.get("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_without_transactions() {
        let store = MemoryStore::without_transactions();
        assert!(!store.supports_transactions());
        assert!(matches!(
            store.begin().await,
            Err(StoreError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_change_stream() {
        let store = MemoryStore::new();
        let mut events = store.subscribe().unwrap();

        store.put("k", b"a".to_vec()).await.unwrap();
        store.force_put("silent", b"x".to_vec());
        assert!(store.replace("k", b"a", b"b".to_vec()).await.unwrap());

        assert_eq!(events.recv().await.unwrap().value, b"a".to_vec());
        let event = events.recv().await.unwrap();
        assert_eq!(event.key, "k");
        assert_eq!(event.value, b"b".to_vec());
    }

    #[test]
    fn test_force_remove_and_prefix_listing() {
        let store = MemoryStore::new();
        store.force_put("key_1", b"a".to_vec());
        store.force_put("key_2", b"b".to_vec());
        store.force_put("stressor_0", b"c".to_vec());

        assert_eq!(store.keys_with_prefix("key_"), vec!["key_1", "key_2"]);
        assert_eq!(store.force_remove("key_1"), Some(b"a".to_vec()));
        assert_eq!(store.len(), 2);
    }
}

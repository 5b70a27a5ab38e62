//! Shared log logic
//!
//! All writers address all keys. Either key of a pair may hold entries the
//! other lacks (a move between them can be interrupted by a crash or a
//! concurrent writer), so every step extends the join of both copies. The
//! write is a compare-and-swap against the exact copy that was read: PUT
//! targets the key, REMOVE moves the log to the backup key. Losing the race
//! simply retries the step with fresh reads.

use async_trait::async_trait;
use tracing::trace;

use super::{
    encode_log, read_log, DelayedRemoves, Logic, LogicContext, LogicError, Operation,
    OperationKind, Outcome, RetryReason, StoredLog,
};
use crate::core::keys::{backup_key_id, store_key};
use crate::core::{KeyId, LogMode, LogValue};
use crate::storage::{KeyValueStore, StoreError};

/// Logic for writers sharing the keyspace
pub struct SharedLogic {
    context: LogicContext,
}

impl SharedLogic {
    pub fn new(context: LogicContext) -> Self {
        SharedLogic { context }
    }
}

/// Conditionally replace `expected` (absent or the exact bytes read) at `key_id`
async fn compare_and_swap(
    store: &dyn KeyValueStore,
    key_id: KeyId,
    expected: Option<&StoredLog>,
    next: &LogValue,
) -> Result<bool, StoreError> {
    let key = store_key(key_id);
    let value = encode_log(next)?;
    match expected {
        None => store.put_if_absent(&key, value).await,
        Some(expected) => store.replace(&key, &expected.raw, value).await,
    }
}

#[async_trait]
impl Logic for SharedLogic {
    fn mode(&self) -> LogMode {
        LogMode::Shared
    }

    async fn invoke(
        &mut self,
        op: &Operation,
        store: &dyn KeyValueStore,
        removes: &mut DelayedRemoves,
    ) -> Result<Outcome, LogicError> {
        let (target_id, other_id) = match op.kind {
            OperationKind::Put => (op.key_id, backup_key_id(op.key_id)),
            OperationKind::Remove => (backup_key_id(op.key_id), op.key_id),
            OperationKind::Get => return Err(LogicError::Unsupported(op.kind)),
        };

        let target = read_log(store, target_id, removes).await?;
        let other = read_log(store, other_id, removes).await?;

        let next = match LogValue::join_opt(
            target.as_ref().map(|t| &t.value),
            other.as_ref().map(|o| &o.value),
        ) {
            None => LogValue::single(op.writer, op.id),
            Some(joined) => match self.context.extend(&joined, op.writer, op.id).await? {
                Some((next, _)) => next,
                None => return Ok(Outcome::Retry(RetryReason::LogFull)),
            },
        };

        if !compare_and_swap(store, target_id, target.as_ref(), &next).await? {
            trace!(writer = op.writer, op = op.id, key = target_id, "lost compare-and-swap");
            return Ok(Outcome::Retry(RetryReason::Conflict));
        }
        if let Some(other) = other {
            removes.stage(other_id, other.raw);
        }
        Ok(Outcome::Done)
    }

    /// A copy that changed since it was read now carries another writer's
    /// newer entries and must stay, so a failed conditional removal is
    /// final rather than retried.
    async fn remove_value(
        &self,
        store: &dyn KeyValueStore,
        key_id: KeyId,
        expected: &[u8],
    ) -> Result<bool, StoreError> {
        if !store.remove(&store_key(key_id), expected).await? {
            trace!(key = key_id, "copy changed since it was read, keeping it");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::core::checkpoint::{write_checker_progress, LastOperation};
    use crate::core::LogEntry;
    use crate::storage::codec::encode;
    use crate::storage::MemoryStore;

    fn log(entries: &[(u32, u64)]) -> LogValue {
        entries
            .iter()
            .map(|&(w, op)| LogEntry::new(w, op))
            .collect::<Vec<_>>()
            .into()
    }

    fn shared_config() -> crate::core::StressConfig {
        fast_config().with_threads_per_node(2).with_shared_keys(true)
    }

    #[tokio::test]
    async fn test_first_write_is_put_if_absent() {
        let store = MemoryStore::new();
        let mut logic = SharedLogic::new(context(&store, shared_config()));
        let mut removes = DelayedRemoves::new();

        let outcome = logic
            .invoke(&op(0, 0, 3, OperationKind::Put), &store, &mut removes)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(stored(&store, 3), Some(log(&[(0, 0)])));
        assert!(removes.is_empty());
    }

    #[tokio::test]
    async fn test_remove_joins_both_copies_into_backup() {
        let store = MemoryStore::new();
        store.force_put(&store_key(3), encode(&log(&[(0, 0), (1, 0)])).unwrap());
        store.force_put(&store_key(backup_key_id(3)), encode(&log(&[(1, 1)])).unwrap());
        let mut logic = SharedLogic::new(context(&store, shared_config()));
        let mut removes = DelayedRemoves::new();

        let outcome = logic
            .invoke(&op(0, 1, 3, OperationKind::Remove), &store, &mut removes)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(
            stored(&store, backup_key_id(3)),
            Some(log(&[(0, 0), (0, 1), (1, 0), (1, 1)]))
        );
        assert!(removes.is_pending(3));

        for (key_id, expected) in removes.drain() {
            assert!(logic.remove_value(&store, key_id, &expected).await.unwrap());
        }
        assert_eq!(stored(&store, 3), None);
    }

    #[tokio::test]
    async fn test_lost_race_retries() {
        let store = MemoryStore::new();
        let mut logic = SharedLogic::new(context(&store, shared_config()));
        let mut removes = DelayedRemoves::new();
        logic.invoke(&op(0, 0, 3, OperationKind::Put), &store, &mut removes).await.unwrap();

        // a store that changes the key between read and write
        struct Racing<'a> {
            inner: &'a MemoryStore,
        }

        #[async_trait]
        impl KeyValueStore for Racing<'_> {
            async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
                let value = self.inner.get(key).await?;
                if key == store_key(3) {
                    self.inner.force_put(key, encode(&log(&[(0, 0), (1, 0)])).unwrap());
                }
                Ok(value)
            }
            async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
                self.inner.put(key, value).await
            }
            async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
                self.inner.put_if_absent(key, value).await
            }
            async fn replace(&self, key: &str, expected: &[u8], value: Vec<u8>) -> Result<bool, StoreError> {
                self.inner.replace(key, expected, value).await
            }
            async fn remove(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
                self.inner.remove(key, expected).await
            }
        }

        let racing = Racing { inner: &store };
        let outcome = logic
            .invoke(&op(0, 1, 3, OperationKind::Put), &racing, &mut removes)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Retry(RetryReason::Conflict));

        let outcome = logic
            .invoke(&op(0, 1, 3, OperationKind::Put), &store, &mut removes)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(stored(&store, 3), Some(log(&[(0, 0), (0, 1), (1, 0)])));
    }

    #[tokio::test]
    async fn test_full_log_trims_confirmed_entries_of_all_writers() {
        let store = MemoryStore::new();
        store.force_put(
            &store_key(3),
            encode(&log(&[(0, 0), (0, 1), (1, 0), (1, 1)])).unwrap(),
        );
        let config = shared_config().with_value_max_size(4);
        let mut logic = SharedLogic::new(context(&store, config));
        let mut removes = DelayedRemoves::new();

        let outcome = logic
            .invoke(&op(0, 2, 3, OperationKind::Put), &store, &mut removes)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Retry(RetryReason::LogFull));

        write_checker_progress(&store, 0, 1, &LastOperation::now(0, 0)).await.unwrap();
        let outcome = logic
            .invoke(&op(0, 2, 3, OperationKind::Put), &store, &mut removes)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(stored(&store, 3), Some(log(&[(0, 0), (0, 1), (0, 2), (1, 1)])));
    }

    #[tokio::test]
    async fn test_changed_copy_is_kept() {
        let store = MemoryStore::new();
        let logic = SharedLogic::new(context(&store, shared_config()));
        store.force_put(&store_key(3), b"newer".to_vec());

        assert!(logic.remove_value(&store, 3, b"older").await.unwrap());
        assert_eq!(store.raw_get(&store_key(3)), Some(b"newer".to_vec()));
    }
}

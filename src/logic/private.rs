//! Private log logic
//!
//! Each writer owns a disjoint key range, so a log value has exactly one
//! writer and is replaced wholesale on every step. PUT extends the log at
//! the key; REMOVE moves the extended log to the backup key and schedules
//! removal of the key.
//!
//! The writer remembers the last operation it wrote to each key. Reading a
//! key later without finding that operation (in the key or its backup)
//! means the store returned an old value: a stale read.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, trace};

use super::{
    encode_log, read_log, DelayedRemoves, Logic, LogicContext, LogicError, Operation,
    OperationKind, Outcome, RetryReason, StoredLog,
};
use crate::core::checkpoint::now_millis;
use crate::core::keys::{backup_key_id, store_key};
use crate::core::{KeyId, LogMode, LogValue, OperationId};
use crate::storage::{KeyValueStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LastWrite {
    op: OperationId,
    timestamp: u64,
}

/// Logic for writers that own their keys
pub struct PrivateLogic {
    context: LogicContext,
    /// Last committed write per key id
    last_writes: HashMap<KeyId, LastWrite>,
    /// Writes of the open transaction, recorded in `last_writes` on commit
    tx_writes: Vec<(KeyId, OperationId)>,
    /// Highest operation trimmed from each key in the open transaction
    max_pruned: HashMap<KeyId, OperationId>,
}

impl PrivateLogic {
    pub fn new(context: LogicContext) -> Self {
        PrivateLogic {
            context,
            last_writes: HashMap::new(),
            tx_writes: Vec::new(),
            max_pruned: HashMap::new(),
        }
    }

    /// Wait out the apply delay of a recent write, or report a stale read
    async fn on_stale_read(&self, op: &Operation, last: LastWrite) -> Result<Outcome, LogicError> {
        let delay = self.context.config.write_apply_max_delay;
        let age = Duration::from_millis(now_millis().saturating_sub(last.timestamp));
        if age < delay {
            debug!(
                writer = op.writer,
                key = op.key_id,
                last = last.op,
                "last write may not be applied yet, waiting"
            );
            self.context.control.sleep(delay - age).await?;
            return Ok(Outcome::Retry(RetryReason::NotYetVisible));
        }
        self.context
            .failures
            .report_stale_read(op.writer, last.op, op.key_id);
        Err(LogicError::StaleRead {
            writer: op.writer,
            op: last.op,
            key_id: op.key_id,
        })
    }

    /// Extend `prev` with the current operation, `None` if the log is full
    async fn next_value(
        &mut self,
        op: &Operation,
        prev: &LogValue,
    ) -> Result<Option<LogValue>, StoreError> {
        let Some((next, watermarks)) = self.context.extend(prev, op.writer, op.id).await? else {
            debug!(writer = op.writer, key = op.key_id, size = prev.size(), "log is full");
            return Ok(None);
        };
        if self.context.config.transactional() {
            let pruned = prev
                .entries()
                .iter()
                .filter(|e| watermarks.covers(e))
                .map(|e| e.op)
                .max();
            if let Some(pruned) = pruned {
                let slot = self.max_pruned.entry(op.key_id).or_default();
                *slot = (*slot).max(pruned);
            }
        }
        Ok(Some(next))
    }

    fn record_write(&mut self, key_id: KeyId, op: OperationId) {
        if self.context.config.transactional() {
            self.tx_writes.push((key_id, op));
        } else {
            let timestamp = now_millis();
            trace!(key = key_id, op, timestamp, "write finished");
            self.last_writes.insert(key_id, LastWrite { op, timestamp });
        }
    }
}

#[async_trait]
impl Logic for PrivateLogic {
    fn mode(&self) -> LogMode {
        LogMode::Private
    }

    async fn invoke(
        &mut self,
        op: &Operation,
        store: &dyn KeyValueStore,
        removes: &mut DelayedRemoves,
    ) -> Result<Outcome, LogicError> {
        if op.kind == OperationKind::Get {
            return Err(LogicError::Unsupported(op.kind));
        }
        let key_id = op.key_id;
        let backup_id = backup_key_id(key_id);

        let mut prev = read_log(store, key_id, removes).await?;
        let mut backup: Option<StoredLog> = None;
        let mut backup_read = false;

        if let Some(last) = self.last_writes.get(&key_id).copied() {
            let in_prev = prev
                .as_ref()
                .is_some_and(|p| p.value.contains(op.writer, last.op));
            if !in_prev {
                backup = read_log(store, backup_id, removes).await?;
                backup_read = true;
                let in_backup = backup
                    .as_ref()
                    .is_some_and(|b| b.value.contains(op.writer, last.op));
                // Trimming within the open transaction may drop the last write
                let pruned = self.context.config.transactional()
                    && self.max_pruned.get(&key_id).is_some_and(|&m| m >= last.op);
                if !in_backup && !pruned {
                    return self.on_stale_read(op, last).await;
                }
                if !pruned {
                    // leftover of an unfinished move; the backup is current
                    prev = None;
                }
            }
        }

        match (op.kind, prev) {
            (OperationKind::Remove, Some(prev)) => {
                let Some(next) = self.next_value(op, &prev.value).await? else {
                    return Ok(Outcome::Retry(RetryReason::LogFull));
                };
                store.put(&store_key(backup_id), encode_log(&next)?).await?;
                removes.stage(key_id, prev.raw);
            }
            (_, prev) => {
                if prev.is_none() && !backup_read {
                    backup = read_log(store, backup_id, removes).await?;
                }
                let base = prev.as_ref().or(backup.as_ref());
                let next = match base {
                    None => LogValue::single(op.writer, op.id),
                    Some(base) => {
                        let base = base.value.clone();
                        match self.next_value(op, &base).await? {
                            Some(next) => next,
                            None => return Ok(Outcome::Retry(RetryReason::LogFull)),
                        }
                    }
                };
                store.put(&store_key(key_id), encode_log(&next)?).await?;
                if let Some(backup) = backup {
                    removes.stage(backup_id, backup.raw);
                }
            }
        }

        self.record_write(key_id, op.id);
        Ok(Outcome::Done)
    }

    async fn remove_value(
        &self,
        store: &dyn KeyValueStore,
        key_id: KeyId,
        expected: &[u8],
    ) -> Result<bool, StoreError> {
        let key = store_key(key_id);
        if !self.context.config.check_delayed_remove_expected_value {
            if let Some(current) = store.get(&key).await? {
                store.remove(&key, &current).await?;
            }
            return Ok(true);
        }
        if store.remove(&key, expected).await? {
            return Ok(true);
        }
        match store.get(&key).await? {
            None => error!(key = key_id, "expected to remove a log but the key is empty"),
            Some(_) => error!(key = key_id, "log to remove is not the expected one"),
        }
        Ok(false)
    }

    fn after_commit(&mut self) {
        let timestamp = now_millis();
        for (key_id, op) in self.tx_writes.drain(..) {
            self.last_writes.insert(key_id, LastWrite { op, timestamp });
        }
        self.max_pruned.clear();
    }

    fn after_rollback(&mut self) {
        self.tx_writes.clear();
        self.max_pruned.clear();
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

    fn log(writer: u32, ops: &[OperationId]) -> LogValue {
        ops.iter()
            .map(|&op| LogEntry::new(writer, op))
            .collect::<Vec<_>>()
            .into()
    }

    async fn flush(logic: &PrivateLogic, store: &MemoryStore, removes: &mut DelayedRemoves) {
        for (key_id, expected) in removes.drain() {
            assert!(logic.remove_value(store, key_id, &expected).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_put_put_remove_moves_log_to_backup() {
        let store = MemoryStore::new();
        let mut logic = PrivateLogic::new(context(&store, fast_config()));
        let mut removes = DelayedRemoves::new();

        for (id, kind) in [(0, OperationKind::Put), (1, OperationKind::Put)] {
            let outcome = logic.invoke(&op(0, id, 5, kind), &store, &mut removes).await.unwrap();
            assert_eq!(outcome, Outcome::Done);
            flush(&logic, &store, &mut removes).await;
        }
        assert_eq!(stored(&store, 5), Some(log(0, &[0, 1])));

        let outcome = logic
            .invoke(&op(0, 2, 5, OperationKind::Remove), &store, &mut removes)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Done);
        // the key keeps its log until the staged removal runs
        assert_eq!(stored(&store, 5), Some(log(0, &[0, 1])));
        assert_eq!(stored(&store, backup_key_id(5)), Some(log(0, &[0, 1, 2])));

        flush(&logic, &store, &mut removes).await;
        assert_eq!(stored(&store, 5), None);
    }

    #[tokio::test]
    async fn test_put_after_remove_restores_from_backup() {
        let store = MemoryStore::new();
        let mut logic = PrivateLogic::new(context(&store, fast_config()));
        let mut removes = DelayedRemoves::new();

        for (id, kind) in [(0, OperationKind::Put), (1, OperationKind::Remove), (2, OperationKind::Put)] {
            logic.invoke(&op(0, id, 5, kind), &store, &mut removes).await.unwrap();
            flush(&logic, &store, &mut removes).await;
        }

        assert_eq!(stored(&store, 5), Some(log(0, &[0, 1, 2])));
        assert_eq!(stored(&store, backup_key_id(5)), None);
    }

    #[tokio::test]
    async fn test_get_is_rejected() {
        let store = MemoryStore::new();
        let mut logic = PrivateLogic::new(context(&store, fast_config()));
        let result = logic
            .invoke(&op(0, 0, 5, OperationKind::Get), &store, &mut DelayedRemoves::new())
            .await;
        assert!(matches!(result, Err(LogicError::Unsupported(OperationKind::Get))));
    }

    #[tokio::test]
    async fn test_lost_write_is_stale_read() {
        let store = MemoryStore::new();
        let ctx = context(&store, fast_config());
        let failures = ctx.failures.clone();
        let mut logic = PrivateLogic::new(ctx);
        let mut removes = DelayedRemoves::new();

        logic.invoke(&op(0, 0, 5, OperationKind::Put), &store, &mut removes).await.unwrap();
        logic.invoke(&op(0, 1, 5, OperationKind::Put), &store, &mut removes).await.unwrap();
        store.force_put(&store_key(5), encode(&log(0, &[0])).unwrap());

        let result = logic.invoke(&op(0, 2, 5, OperationKind::Put), &store, &mut removes).await;
        assert!(matches!(result, Err(LogicError::StaleRead { op: 1, key_id: 5, .. })));
        assert_eq!(failures.counts().stale_reads, 1);
    }

    #[tokio::test]
    async fn test_recent_write_waits_instead_of_reporting() {
        let store = MemoryStore::new();
        let config = fast_config().with_write_apply_max_delay(Duration::from_millis(50));
        let ctx = context(&store, config);
        let failures = ctx.failures.clone();
        let mut logic = PrivateLogic::new(ctx);
        let mut removes = DelayedRemoves::new();

        logic.invoke(&op(0, 0, 5, OperationKind::Put), &store, &mut removes).await.unwrap();
        store.force_remove(&store_key(5));

        let outcome = logic
            .invoke(&op(0, 1, 5, OperationKind::Put), &store, &mut removes)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Retry(RetryReason::NotYetVisible));
        assert_eq!(failures.counts().stale_reads, 0);
    }

    #[tokio::test]
    async fn test_full_log_waits_for_checkers() {
        let store = MemoryStore::new();
        let mut logic = PrivateLogic::new(context(&store, fast_config().with_value_max_size(3)));
        let mut removes = DelayedRemoves::new();

        for id in 0..3 {
            logic.invoke(&op(0, id, 5, OperationKind::Put), &store, &mut removes).await.unwrap();
        }
        let outcome = logic
            .invoke(&op(0, 3, 5, OperationKind::Put), &store, &mut removes)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Retry(RetryReason::LogFull));

        write_checker_progress(&store, 0, 0, &LastOperation::now(1, 0)).await.unwrap();
        let outcome = logic
            .invoke(&op(0, 3, 5, OperationKind::Put), &store, &mut removes)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(stored(&store, 5), Some(log(0, &[2, 3])));
    }

    #[tokio::test]
    async fn test_trimming_inside_transaction_is_not_stale() {
        let store = MemoryStore::new();
        let config = fast_config().with_value_max_size(5).with_transaction_size(3);
        let mut logic = PrivateLogic::new(context(&store, config));
        let mut removes = DelayedRemoves::new();

        // first transaction: operations 0..=4
        let tx = store.begin().await.unwrap();
        for id in 0..5 {
            let outcome = logic
                .invoke(&op(0, id, 5, OperationKind::Put), tx.as_store(), &mut removes)
                .await
                .unwrap();
            assert_eq!(outcome, Outcome::Done);
        }
        tx.commit().await.unwrap();
        logic.after_commit();
        write_checker_progress(&store, 0, 0, &LastOperation::now(4, 0)).await.unwrap();

        // second transaction trims everything the first one wrote
        let tx = store.begin().await.unwrap();
        for id in 5..11 {
            let outcome = logic
                .invoke(&op(0, id, 5, OperationKind::Put), tx.as_store(), &mut removes)
                .await
                .unwrap();
            if id < 10 {
                assert_eq!(outcome, Outcome::Done, "operation {}", id);
            } else {
                assert_eq!(outcome, Outcome::Retry(RetryReason::LogFull));
            }
        }
        tx.commit().await.unwrap();
        logic.after_commit();

        assert_eq!(stored(&store, 5), Some(log(0, &[5, 6, 7, 8, 9])));
    }

    #[tokio::test]
    async fn test_remove_checks_expected_value() {
        let store = MemoryStore::new();
        let logic = PrivateLogic::new(context(&store, fast_config()));
        store.force_put(&store_key(5), b"other".to_vec());

        assert!(!logic.remove_value(&store, 5, b"expected").await.unwrap());
        assert!(!logic.remove_value(&store, 6, b"expected").await.unwrap());
        assert!(logic.remove_value(&store, 5, b"other").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_without_expected_value_check() {
        let store = MemoryStore::new();
        let config = fast_config().with_check_delayed_remove_expected_value(false);
        let logic = PrivateLogic::new(context(&store, config));
        store.force_put(&store_key(5), b"other".to_vec());

        assert!(logic.remove_value(&store, 5, b"expected").await.unwrap());
        assert!(logic.remove_value(&store, 5, b"expected").await.unwrap());
        assert_eq!(store.raw_get(&store_key(5)), None);
    }
}

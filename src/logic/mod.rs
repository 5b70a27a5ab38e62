//! Workload logic
//!
//! A [`Logic`] performs one logged operation at a time on behalf of a
//! writer. Two implementations exist, chosen once per run:
//!
//! - [`PrivateLogic`]: the writer owns its keys and replaces log values
//!   wholesale
//! - [`SharedLogic`]: writers share keys and extend the join of both copies
//!   of a key pair with compare-and-swap
//!
//! Both record every operation id in some log key. A "remove" moves the log
//! to the paired backup key; the emptied key is only removed after the
//! write that moved it has committed (see [`DelayedRemoves`]).

pub mod private;
pub mod shared;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::checkpoint::{raise_ignored, read_checker_progress};
use crate::core::keys::{backup_key_id, store_key};
use crate::core::{
    ConfigError, KeyId, LogMode, LogValue, OperationId, OperationMix, StressConfig, Watermarks, WriterId,
};
use crate::engine::control::{Control, Interrupted};
use crate::engine::failure::FailureManager;
use crate::engine::liveness::{LivenessTracker, Participant};
use crate::storage::codec::{decode, encode};
use crate::storage::{KeyValueStore, StoreError};

pub use private::PrivateLogic;
pub use shared::SharedLogic;

/// Kind of store operation a step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Get,
    Put,
    Remove,
}

/// One step of a writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub writer: WriterId,
    pub id: OperationId,
    pub key_id: KeyId,
    pub kind: OperationKind,
}

/// Why a step has to be repeated with the same operation id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// A conditional write lost against a concurrent writer
    Conflict,
    /// The log is full of entries checkers have not confirmed yet
    LogFull,
    /// A recent write may not be visible yet
    NotYetVisible,
}

/// Result of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Retry(RetryReason),
}

/// Errors of a logic step
#[derive(Debug, Error)]
pub enum LogicError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0:?} is not supported by the log logic")]
    Unsupported(OperationKind),
    #[error("stale read of key {key_id}: operation {op} of writer {writer} not found")]
    StaleRead {
        writer: WriterId,
        op: OperationId,
        key_id: KeyId,
    },
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

/// Picks the kind of each operation
pub trait OperationSource: Send + Sync {
    fn next_kind(&mut self) -> OperationKind;
}

/// Weighted random choice between operation kinds
pub struct RandomOperations {
    rng: StdRng,
    mix: OperationMix,
}

impl RandomOperations {
    pub fn new(mix: OperationMix) -> Self {
        RandomOperations {
            rng: StdRng::from_os_rng(),
            mix,
        }
    }
}

impl OperationSource for RandomOperations {
    fn next_kind(&mut self) -> OperationKind {
        let total = self.mix.puts + self.mix.removes + self.mix.gets;
        let pick = self.rng.random_range(0..total.max(1));
        if pick < self.mix.puts {
            OperationKind::Put
        } else if pick < self.mix.puts + self.mix.removes {
            OperationKind::Remove
        } else {
            OperationKind::Get
        }
    }
}

/// Fixed, repeating sequence of operation kinds
pub struct ScriptedOperations {
    script: Vec<OperationKind>,
    next: usize,
}

impl ScriptedOperations {
    pub fn new(script: Vec<OperationKind>) -> Result<Self, ConfigError> {
        if script.is_empty() {
            return Err(ConfigError::Invalid("empty operation script".to_string()));
        }
        Ok(ScriptedOperations { script, next: 0 })
    }
}

impl OperationSource for ScriptedOperations {
    fn next_kind(&mut self) -> OperationKind {
        let kind = self.script[self.next % self.script.len()];
        self.next += 1;
        kind
    }
}

/// Removals staged until the write that replaced the value is durable
///
/// Keyed by key id; the value is the exact encoded log the key held, so
/// the removal only happens if nobody changed the key since.
#[derive(Debug, Default)]
pub struct DelayedRemoves {
    pending: BTreeMap<KeyId, Vec<u8>>,
}

impl DelayedRemoves {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule removal of `key_id`, which currently holds `expected`
    ///
    /// A pending removal of the paired key is dropped: the log was just
    /// moved there.
    pub fn stage(&mut self, key_id: KeyId, expected: Vec<u8>) {
        self.pending.remove(&backup_key_id(key_id));
        self.pending.insert(key_id, expected);
    }

    pub fn is_pending(&self, key_id: KeyId) -> bool {
        self.pending.contains_key(&key_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn drain(&mut self) -> Vec<(KeyId, Vec<u8>)> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }
}

/// A log read from the store, with the bytes it was decoded from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLog {
    pub raw: Vec<u8>,
    pub value: LogValue,
}

/// Read the log at `key_id`; keys staged for removal read as absent
pub async fn read_log(
    store: &dyn KeyValueStore,
    key_id: KeyId,
    removes: &DelayedRemoves,
) -> Result<Option<StoredLog>, StoreError> {
    if removes.is_pending(key_id) {
        return Ok(None);
    }
    match store.get(&store_key(key_id)).await? {
        None => Ok(None),
        Some(raw) => {
            let value = decode(&raw)?;
            Ok(Some(StoredLog { raw, value }))
        }
    }
}

/// Encode a log for writing
pub fn encode_log(value: &LogValue) -> Result<Vec<u8>, StoreError> {
    Ok(encode(value)?)
}

/// Everything a logic needs besides the store handle of the current step
pub struct LogicContext {
    pub config: Arc<StressConfig>,
    /// Non-transactional handle, used for checkpoint reads and writes
    pub store: Arc<dyn KeyValueStore>,
    pub liveness: Arc<LivenessTracker>,
    pub failures: Arc<FailureManager>,
    pub control: Arc<Control>,
}

impl LogicContext {
    /// Highest operation of `writer` that every checker node confirmed
    ///
    /// `oldest` is the oldest entry of `writer` the caller wants to trim.
    /// With dead-checker ignoring enabled, a checker node whose keep-alive
    /// expired is bypassed by raising its ignored watermark to `oldest`.
    /// `None` when some checker has confirmed nothing yet.
    pub async fn checked_operation(
        &self,
        writer: WriterId,
        oldest: OperationId,
    ) -> Result<Option<OperationId>, StoreError> {
        let mut minimum: Option<OperationId> = None;
        for checker in self.config.all_checkers() {
            let confirmed = read_checker_progress(self.store.as_ref(), checker, writer)
                .await?
                .map(|last| last.operation_id);
            let behind = confirmed.map_or(true, |op| op < oldest);
            let effective = if behind
                && self.config.ignore_dead_checkers
                && !self.liveness.is_alive(Participant::Checker(checker)).await
            {
                let ignored = raise_ignored(self.store.as_ref(), checker, writer, oldest).await?;
                warn!(checker, writer, ignored, "checker is dead, no longer waiting for it");
                Some(oldest)
            } else {
                confirmed
            };
            match effective {
                None => return Ok(None),
                Some(op) => minimum = Some(minimum.map_or(op, |m| m.min(op))),
            }
        }
        Ok(minimum)
    }

    /// Confirmation watermarks of every writer present in `value`
    pub async fn watermarks(&self, value: &LogValue) -> Result<Watermarks, StoreError> {
        let mut watermarks = Watermarks::new();
        for writer in value.writers() {
            let oldest = value.min_from(writer).unwrap_or_default();
            if let Some(checked) = self.checked_operation(writer, oldest).await? {
                watermarks.set(writer, checked);
            }
        }
        debug!(?watermarks, "confirmation watermarks");
        Ok(watermarks)
    }

    /// Extend `value` with `(writer, op)` within the size bound, trimming
    /// confirmed entries if needed. `None` if the log is full.
    pub async fn extend(
        &self,
        value: &LogValue,
        writer: WriterId,
        op: OperationId,
    ) -> Result<Option<(LogValue, Watermarks)>, StoreError> {
        let max_size = self.config.value_max_size;
        if value.size() < max_size || value.contains(writer, op) {
            return Ok(value
                .append(writer, op, max_size, &Watermarks::new())
                .ok()
                .map(|next| (next, Watermarks::new())));
        }
        let watermarks = self.watermarks(value).await?;
        Ok(value
            .append(writer, op, max_size, &watermarks)
            .ok()
            .map(|next| (next, watermarks)))
    }
}

/// One workload strategy
#[async_trait]
pub trait Logic: Send + Sync {
    fn mode(&self) -> LogMode;

    /// Perform `op`, reading and writing through `store` (the open
    /// transaction, if any) and staging removals in `removes`
    async fn invoke(
        &mut self,
        op: &Operation,
        store: &dyn KeyValueStore,
        removes: &mut DelayedRemoves,
    ) -> Result<Outcome, LogicError>;

    /// Carry out one staged removal. `Ok(false)` asks for another attempt.
    async fn remove_value(
        &self,
        store: &dyn KeyValueStore,
        key_id: KeyId,
        expected: &[u8],
    ) -> Result<bool, StoreError>;

    /// The enclosing transaction committed
    fn after_commit(&mut self) {}

    /// The enclosing transaction rolled back
    fn after_rollback(&mut self) {}
}

/// Build the logic configured for this run
pub fn create_logic(context: LogicContext) -> Box<dyn Logic> {
    match context.config.mode() {
        LogMode::Private => Box::new(PrivateLogic::new(context)),
        LogMode::Shared => Box::new(SharedLogic::new(context)),
    }
}

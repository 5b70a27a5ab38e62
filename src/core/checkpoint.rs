//! Checkpoint keys
//!
//! Progress watermarks live in the store under test, next to the logs they
//! describe, so that every node (and a restarted process) sees the same
//! picture:
//!
//! - `stressor_<w>`: last operation writer `w` claims to have committed
//! - `checker_<c>_<w>`: last operation of `w` confirmed by checker node `c`
//! - `ignored_<c>_<w>`: operations of `w` checker node `c` no longer
//!   requires proof for
//! - `__keepAlive_writer_<w>` / `__keepAlive_checker_<c>`: liveness stamps

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::{CheckerId, OperationId, WriterId};
use crate::storage::codec::{decode, decode_opt, encode};
use crate::storage::{KeyValueStore, StoreError};

/// Watermark tuple stored under every checkpoint key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastOperation {
    pub operation_id: OperationId,
    pub seed: u64,
    /// Wall-clock milliseconds when the tuple was written
    pub timestamp: u64,
}

impl LastOperation {
    /// Tuple stamped with the current time
    pub fn now(operation_id: OperationId, seed: u64) -> Self {
        LastOperation {
            operation_id,
            seed,
            timestamp: now_millis(),
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn stressor_key(writer: WriterId) -> String {
    format!("stressor_{}", writer)
}

pub fn checker_key(checker: CheckerId, writer: WriterId) -> String {
    format!("checker_{}_{}", checker, writer)
}

pub fn ignored_key(checker: CheckerId, writer: WriterId) -> String {
    format!("ignored_{}_{}", checker, writer)
}

pub fn writer_keep_alive_key(writer: WriterId) -> String {
    format!("__keepAlive_writer_{}", writer)
}

pub fn checker_keep_alive_key(checker: CheckerId) -> String {
    format!("__keepAlive_checker_{}", checker)
}

/// Writer id encoded in a `stressor_<w>` key
pub fn parse_stressor_key(key: &str) -> Option<WriterId> {
    key.strip_prefix("stressor_")?.parse().ok()
}

async fn read(store: &dyn KeyValueStore, key: &str) -> Result<Option<LastOperation>, StoreError> {
    let raw = store.get(key).await?;
    Ok(decode_opt(raw.as_deref())?)
}

async fn write(store: &dyn KeyValueStore, key: &str, value: &LastOperation) -> Result<(), StoreError> {
    store.put(key, encode(value)?).await
}

pub async fn read_last_operation(
    store: &dyn KeyValueStore,
    writer: WriterId,
) -> Result<Option<LastOperation>, StoreError> {
    read(store, &stressor_key(writer)).await
}

pub async fn write_last_operation(
    store: &dyn KeyValueStore,
    writer: WriterId,
    value: &LastOperation,
) -> Result<(), StoreError> {
    write(store, &stressor_key(writer), value).await
}

pub async fn read_checker_progress(
    store: &dyn KeyValueStore,
    checker: CheckerId,
    writer: WriterId,
) -> Result<Option<LastOperation>, StoreError> {
    read(store, &checker_key(checker, writer)).await
}

pub async fn write_checker_progress(
    store: &dyn KeyValueStore,
    checker: CheckerId,
    writer: WriterId,
    value: &LastOperation,
) -> Result<(), StoreError> {
    write(store, &checker_key(checker, writer), value).await
}

pub async fn read_ignored(
    store: &dyn KeyValueStore,
    checker: CheckerId,
    writer: WriterId,
) -> Result<Option<LastOperation>, StoreError> {
    read(store, &ignored_key(checker, writer)).await
}

/// Raise `ignored_<c>_<w>` to at least `operation_id`
///
/// Both the writer (bypassing a dead checker) and the checker (forgiving a
/// dead writer) move this watermark, possibly from different machines, so
/// it only ever grows through conditional writes. Returns the value in the
/// store afterwards. The stored seed is unused.
pub async fn raise_ignored(
    store: &dyn KeyValueStore,
    checker: CheckerId,
    writer: WriterId,
    operation_id: OperationId,
) -> Result<OperationId, StoreError> {
    let key = ignored_key(checker, writer);
    loop {
        let raw = store.get(&key).await?;
        let proposed = encode(&LastOperation::now(operation_id, 0))?;
        let written = match raw {
            None => store.put_if_absent(&key, proposed).await?,
            Some(raw) => {
                let current: LastOperation = decode(&raw)?;
                if current.operation_id >= operation_id {
                    return Ok(current.operation_id);
                }
                store.replace(&key, &raw, proposed).await?
            }
        };
        if written {
            return Ok(operation_id);
        }
    }
}

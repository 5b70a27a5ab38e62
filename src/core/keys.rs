//! Key assignment
//!
//! Maps logical key ids to store keys and splits the keyspace between
//! writers. Private mode gives every writer a disjoint contiguous range;
//! shared mode gives every writer the whole range.
//!
//! Every key id `k` has a paired backup id `!k` (bitwise complement). The
//! backup holds the log while it is being moved, so at least one of the two
//! keys always carries the proof of every operation.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::config::ConfigError;
use super::{KeyId, OperationId, WriterId};

const KEY_PREFIX: &str = "key_";
const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// Half-open range of key ids `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange {
    start: KeyId,
    end: KeyId,
}

impl KeyRange {
    pub fn new(start: KeyId, end: KeyId) -> Result<Self, ConfigError> {
        if start > end {
            return Err(ConfigError::Invalid(format!(
                "key range start {} after end {}",
                start, end
            )));
        }
        Ok(KeyRange { start, end })
    }

    pub fn start(&self) -> KeyId {
        self.start
    }

    pub fn end(&self) -> KeyId {
        self.end
    }

    pub fn size(&self) -> u64 {
        (self.end - self.start) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, key_id: KeyId) -> bool {
        key_id >= self.start && key_id < self.end
    }

    /// Move the range by `offset`
    pub fn shifted(&self, offset: KeyId) -> Self {
        KeyRange {
            start: self.start + offset,
            end: self.end + offset,
        }
    }
}

/// Split `[0, num_entries)` into `parts` contiguous ranges and return the
/// `index`-th one. Sizes of any two parts differ by at most one.
pub fn divide_range(num_entries: u64, parts: u32, index: u32) -> Result<KeyRange, ConfigError> {
    if index >= parts {
        return Err(ConfigError::Invalid(format!("no part {} of {}", index, parts)));
    }
    let parts = parts as u64;
    let index = index as u64;
    let base = num_entries / parts;
    let remainder = num_entries % parts;
    let start = index * base + index.min(remainder);
    let len = base + u64::from(index < remainder);
    Ok(KeyRange {
        start: start as KeyId,
        end: (start + len) as KeyId,
    })
}

/// Id of the key that holds the log while it is moved away from `key_id`
pub fn backup_key_id(key_id: KeyId) -> KeyId {
    !key_id
}

/// Whether `key_id` is a backup id
pub fn is_backup(key_id: KeyId) -> bool {
    key_id < 0
}

/// The primary id of a key pair, whichever member is given
pub fn primary_key_id(key_id: KeyId) -> KeyId {
    if is_backup(key_id) {
        !key_id
    } else {
        key_id
    }
}

/// Store key for a logical key id
pub fn store_key(key_id: KeyId) -> String {
    format!("{}{}", KEY_PREFIX, key_id)
}

/// Inverse of [`store_key`]; `None` for keys that are not log keys
pub fn parse_store_key(key: &str) -> Option<KeyId> {
    key.strip_prefix(KEY_PREFIX)?.parse().ok()
}

/// Derive a per-writer seed from the run's base seed
pub fn writer_seed(base_seed: u64, writer: WriterId) -> u64 {
    base_seed ^ (u64::from(writer) + 1).wrapping_mul(GOLDEN_GAMMA)
}

/// Deterministic choice of key id per operation id
///
/// The choice depends only on the seed and the operation id, so a checker
/// that knows a writer's seed finds the key of any operation without
/// replaying the writer's history, and a restarted writer picks the same
/// keys it would have picked before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySelector {
    range: KeyRange,
    seed: u64,
}

impl KeySelector {
    pub fn new(range: KeyRange, seed: u64) -> Result<Self, ConfigError> {
        if range.is_empty() {
            return Err(ConfigError::Invalid(
                "cannot select keys from an empty range".to_string(),
            ));
        }
        Ok(KeySelector { range, seed })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn range(&self) -> KeyRange {
        self.range
    }

    /// Same range, different seed (used when resuming from a checkpoint)
    pub fn with_seed(&self, seed: u64) -> Self {
        KeySelector {
            range: self.range,
            seed,
        }
    }

    /// Key id targeted by operation `op`
    pub fn key_for(&self, op: OperationId) -> KeyId {
        let mut rng = StdRng::seed_from_u64(self.seed ^ op.wrapping_mul(GOLDEN_GAMMA));
        self.range.start + rng.random_range(0..self.range.size()) as KeyId
    }
}

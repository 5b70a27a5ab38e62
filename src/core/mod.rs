//! Leaf building blocks: configuration, key assignment, log values and
//! checkpoint keys.

pub mod checkpoint;
pub mod config;
pub mod keys;
pub mod log_value;

/// Globally unique writer id: `node_index * threads_per_node + thread`
pub type WriterId = u32;

/// Checker id, equal to the index of the node running the checker group
pub type CheckerId = u32;

/// Per-writer operation counter, starting at 0
pub type OperationId = u64;

/// Logical key id; negative ids are backups of `!id`
pub type KeyId = i64;

pub use checkpoint::LastOperation;
pub use config::{ConfigError, LogMode, OperationMix, StressConfig};
pub use keys::{KeyRange, KeySelector};
pub use log_value::{LogEntry, LogFull, LogValue, Watermarks};

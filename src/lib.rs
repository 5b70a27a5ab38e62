//! Operation-log stress testing for replicated key-value stores
//!
//! Writers record every operation id they perform in bounded logs stored
//! in the store under test; checkers on every node verify that each claimed
//! operation can be found again. Lost writes, stale reads and stalled
//! checking are counted and turned into a verdict.

pub mod core;
pub mod engine;
pub mod logic;
pub mod storage;

/// Testing utilities for integration tests.
pub mod testing;

pub use crate::core::{LogValue, StressConfig};
pub use crate::engine::{FailureCounts, ManagerError, StressManager};
pub use crate::storage::{KeyValueStore, MemoryStore, StoreError};

//! Stress run configuration

use std::time::Duration;

use thiserror::Error;

use super::keys::{divide_range, writer_seed, KeyRange, KeySelector};
use super::{CheckerId, WriterId};

/// Configuration rejected by [`StressConfig::validate`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How writers share the keyspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Every writer owns a disjoint key range
    Private,
    /// All writers address all keys
    Shared,
}

/// Relative weights of the operations a writer performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationMix {
    pub puts: u32,
    pub removes: u32,
    /// Must stay 0: a read leaves no durable trace to verify
    pub gets: u32,
}

impl Default for OperationMix {
    fn default() -> Self {
        OperationMix {
            puts: 2,
            removes: 1,
            gets: 0,
        }
    }
}

/// Configuration of one node's writers and checkers
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Index of this node in the cluster; also its checker id (default: 0)
    pub node_index: u32,
    /// Number of nodes, each running writers and a checker group (default: 1)
    pub node_count: u32,
    /// Writers per node (default: 4)
    pub threads_per_node: u32,
    /// Size of the logical keyspace (default: 1000)
    pub num_entries: u64,
    /// First key id of the keyspace (default: 0)
    pub key_id_offset: i64,
    /// Share the keyspace between all writers (default: false)
    pub shared_keys: bool,
    /// Operation weights (default: 2 puts to 1 remove)
    pub operations: OperationMix,
    /// Operations per transaction, 0 disables transactions (default: 0)
    pub transaction_size: u32,
    /// Base seed for per-writer key selection (default: 0)
    pub seed: u64,
    /// Maximum entries in one log value (default: 100)
    pub value_max_size: usize,
    /// Checkpoints are written every this many operations (default: 50)
    pub counter_update_period: u64,
    /// Checker tasks per node (default: 10)
    pub checking_threads: usize,
    /// Maximum time without a confirmed operation (default: 120s)
    pub no_progress_timeout: Duration,
    /// Stop requiring proof from participants that stopped their keep-alive (default: false)
    pub ignore_dead_checkers: bool,
    /// Age after which a keep-alive stamp means the participant is gone (default: 90s)
    pub dead_timeout: Duration,
    /// Interval between keep-alive writes (default: 1s)
    pub keep_alive_period: Duration,
    /// Time a confirmed write may take to become visible (default: 0)
    pub write_apply_max_delay: Duration,
    /// Attempts of one operation or transaction before the writer gives up (default: 100)
    pub max_operation_attempts: u32,
    /// Attempts of one delayed removal before it is reported (default: 10)
    pub max_delayed_remove_attempts: u32,
    /// Only remove a key if it still holds the value it was replaced from (default: true)
    pub check_delayed_remove_expected_value: bool,
    /// Require store change notifications for every operation (default: false)
    pub check_notifications: bool,
    /// Pause before retrying an append to a full log (default: 100ms)
    pub trim_retry_delay: Duration,
    /// Pause of a checker that found no record to work on (default: 100ms)
    pub checker_idle_delay: Duration,
    /// Minimum pause before re-checking a record whose last check failed (default: 10ms)
    pub unsuccessful_check_min_delay: Duration,
    /// Time between requesting termination and interrupting sleeps (default: 1s)
    pub stop_grace_period: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            node_index: 0,
            node_count: 1,
            threads_per_node: 4,
            num_entries: 1000,
            key_id_offset: 0,
            shared_keys: false,
            operations: OperationMix::default(),
            transaction_size: 0,
            seed: 0,
            value_max_size: 100,
            counter_update_period: 50,
            checking_threads: 10,
            no_progress_timeout: Duration::from_secs(120),
            ignore_dead_checkers: false,
            dead_timeout: Duration::from_secs(90),
            keep_alive_period: Duration::from_secs(1),
            write_apply_max_delay: Duration::ZERO,
            max_operation_attempts: 100,
            max_delayed_remove_attempts: 10,
            check_delayed_remove_expected_value: true,
            check_notifications: false,
            trim_retry_delay: Duration::from_millis(100),
            checker_idle_delay: Duration::from_millis(100),
            unsuccessful_check_min_delay: Duration::from_millis(10),
            stop_grace_period: Duration::from_secs(1),
        }
    }
}

impl StressConfig {
    /// Place this node in a cluster of `node_count` nodes
    pub fn with_node(mut self, node_index: u32, node_count: u32) -> Self {
        self.node_index = node_index;
        self.node_count = node_count;
        self
    }

    pub fn with_threads_per_node(mut self, threads: u32) -> Self {
        self.threads_per_node = threads;
        self
    }

    /// Keyspace `[offset, offset + num_entries)`
    pub fn with_keyspace(mut self, num_entries: u64, key_id_offset: i64) -> Self {
        self.num_entries = num_entries;
        self.key_id_offset = key_id_offset;
        self
    }

    pub fn with_shared_keys(mut self, shared: bool) -> Self {
        self.shared_keys = shared;
        self
    }

    pub fn with_operations(mut self, puts: u32, removes: u32, gets: u32) -> Self {
        self.operations = OperationMix { puts, removes, gets };
        self
    }

    /// Group operations into transactions of `size`; 0 disables transactions
    pub fn with_transaction_size(mut self, size: u32) -> Self {
        self.transaction_size = size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_value_max_size(mut self, size: usize) -> Self {
        self.value_max_size = size;
        self
    }

    pub fn with_counter_update_period(mut self, period: u64) -> Self {
        self.counter_update_period = period;
        self
    }

    pub fn with_checking_threads(mut self, threads: usize) -> Self {
        self.checking_threads = threads;
        self
    }

    pub fn with_no_progress_timeout(mut self, timeout: Duration) -> Self {
        self.no_progress_timeout = timeout;
        self
    }

    /// Excuse participants whose keep-alive is older than `dead_timeout`
    pub fn with_ignore_dead_checkers(mut self, ignore: bool, dead_timeout: Duration) -> Self {
        self.ignore_dead_checkers = ignore;
        self.dead_timeout = dead_timeout;
        self
    }

    pub fn with_keep_alive_period(mut self, period: Duration) -> Self {
        self.keep_alive_period = period;
        self
    }

    pub fn with_write_apply_max_delay(mut self, delay: Duration) -> Self {
        self.write_apply_max_delay = delay;
        self
    }

    pub fn with_max_operation_attempts(mut self, attempts: u32) -> Self {
        self.max_operation_attempts = attempts;
        self
    }

    pub fn with_max_delayed_remove_attempts(mut self, attempts: u32) -> Self {
        self.max_delayed_remove_attempts = attempts;
        self
    }

    pub fn with_check_delayed_remove_expected_value(mut self, check: bool) -> Self {
        self.check_delayed_remove_expected_value = check;
        self
    }

    pub fn with_check_notifications(mut self, check: bool) -> Self {
        self.check_notifications = check;
        self
    }

    /// Shorten every internal pause; meant for tests
    pub fn with_fast_timings(mut self) -> Self {
        self.trim_retry_delay = Duration::from_millis(5);
        self.checker_idle_delay = Duration::from_millis(5);
        self.unsuccessful_check_min_delay = Duration::from_millis(2);
        self.keep_alive_period = Duration::from_millis(50);
        self.stop_grace_period = Duration::from_millis(100);
        self
    }

    pub fn mode(&self) -> LogMode {
        if self.shared_keys {
            LogMode::Shared
        } else {
            LogMode::Private
        }
    }

    /// Checker id of this node
    pub fn checker_id(&self) -> CheckerId {
        self.node_index
    }

    /// Writers across the whole cluster
    pub fn total_writers(&self) -> u32 {
        self.node_count * self.threads_per_node
    }

    /// Ids of the writers running on this node
    pub fn local_writers(&self) -> std::ops::Range<WriterId> {
        let first = self.node_index * self.threads_per_node;
        first..first + self.threads_per_node
    }

    /// Ids of every writer in the cluster
    pub fn all_writers(&self) -> std::ops::Range<WriterId> {
        0..self.total_writers()
    }

    /// Ids of every checker node in the cluster
    pub fn all_checkers(&self) -> std::ops::Range<CheckerId> {
        0..self.node_count
    }

    pub fn transactional(&self) -> bool {
        self.transaction_size > 0
    }

    /// Key ids writer `writer` may touch
    pub fn writer_range(&self, writer: WriterId) -> Result<KeyRange, ConfigError> {
        let range = match self.mode() {
            LogMode::Private => divide_range(self.num_entries, self.total_writers(), writer)?,
            LogMode::Shared => KeyRange::new(0, self.num_entries as i64)?,
        };
        Ok(range.shifted(self.key_id_offset))
    }

    /// Key selection of `writer` for a fresh run
    pub fn key_selector(&self, writer: WriterId) -> Result<KeySelector, ConfigError> {
        KeySelector::new(self.writer_range(writer)?, writer_seed(self.seed, writer))
    }

    /// Check the configuration for combinations the engine cannot run
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.node_count == 0 || self.node_index >= self.node_count {
            return invalid(format!(
                "node index {} outside cluster of {}",
                self.node_index, self.node_count
            ));
        }
        if self.threads_per_node == 0 {
            return invalid("at least one writer per node is required".to_string());
        }
        if self.operations.gets > 0 {
            return invalid("reads leave no trace in the log; gets must be 0".to_string());
        }
        if self.operations.puts + self.operations.removes == 0 {
            return invalid("puts and removes cannot both be 0".to_string());
        }
        if self.value_max_size < 2 {
            return invalid(format!("value max size {} below 2", self.value_max_size));
        }
        if self.mode() == LogMode::Private && self.num_entries < u64::from(self.total_writers()) {
            return invalid(format!(
                "{} entries cannot be split between {} writers",
                self.num_entries,
                self.total_writers()
            ));
        }
        if self.num_entries == 0 {
            return invalid("keyspace is empty".to_string());
        }
        if self.counter_update_period == 0 {
            return invalid("counter update period must be positive".to_string());
        }
        if self.checking_threads == 0 {
            return invalid("at least one checking thread is required".to_string());
        }
        for writer in self.all_writers() {
            self.key_selector(writer)?;
        }
        Ok(())
    }
}

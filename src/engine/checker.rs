//! Log checkers
//!
//! Every node runs a group of checker tasks that verify the writes of all
//! writers in the cluster. The tasks share one [`RecordPool`] and work
//! through it round-robin: take a record, look for its current operation in
//! the log at the record's key pair, put the record back.
//!
//! An operation that is not found is only declared missing once its writer
//! claimed it (through `stressor_<w>`) and the claim is older than the
//! write-apply delay. Until then the check is merely unsuccessful and the
//! record backs off for a short while.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::control::{Control, Interrupted};
use super::failure::FailureManager;
use super::liveness::{LivenessTracker, Participant};
use super::pool::RecordPool;
use super::record::StressorRecord;
use crate::core::checkpoint::{
    now_millis, raise_ignored, read_checker_progress, read_ignored, read_last_operation,
    write_checker_progress, LastOperation,
};
use crate::core::keys::{backup_key_id, store_key};
use crate::core::{KeyId, LogValue, OperationId, StressConfig, WriterId};
use crate::storage::codec::decode_opt;
use crate::storage::{KeyValueStore, StoreError};

/// Errors of checking and of the checked barrier
#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no operation confirmed for {0:?}")]
    NoProgress(Duration),
    #[error("operations still unchecked after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

/// What one check of a record did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checked {
    /// The current operation was found
    Confirmed,
    /// The current operation was settled without being found (reported
    /// missing, or excused)
    Settled,
    /// Not found and not claimed yet; retry later
    Unsuccessful,
    /// The previous unsuccessful check was too recent
    Deferred,
}

/// Log values observed at a key pair
#[derive(Debug, Default)]
struct Observation {
    values: Vec<LogValue>,
}

impl Observation {
    fn contains(&self, writer: WriterId, op: OperationId) -> bool {
        self.values.iter().any(|v| v.contains(writer, op))
    }

    fn describe(&self) -> String {
        if self.values.is_empty() {
            "entry was completely lost".to_string()
        } else {
            format!("not found in {:?}", self.values)
        }
    }
}

/// State shared by the checker tasks of one node
pub struct CheckerGroup {
    config: Arc<StressConfig>,
    store: Arc<dyn KeyValueStore>,
    pool: Arc<RecordPool>,
    liveness: Arc<LivenessTracker>,
    failures: Arc<FailureManager>,
}

impl CheckerGroup {
    pub fn new(
        config: Arc<StressConfig>,
        store: Arc<dyn KeyValueStore>,
        pool: Arc<RecordPool>,
        liveness: Arc<LivenessTracker>,
        failures: Arc<FailureManager>,
    ) -> Self {
        CheckerGroup {
            config,
            store,
            pool,
            liveness,
            failures,
        }
    }

    pub fn pool(&self) -> &Arc<RecordPool> {
        &self.pool
    }

    fn checker_id(&self) -> u32 {
        self.config.checker_id()
    }

    /// Spawn `checking_threads` checker tasks
    pub fn spawn(self: &Arc<Self>, control: &Arc<Control>) -> Vec<JoinHandle<()>> {
        (0..self.config.checking_threads)
            .map(|index| {
                let group = self.clone();
                let control = control.clone();
                tokio::spawn(async move { group.run(index, control).await })
            })
            .collect()
    }

    async fn run(&self, index: usize, control: Arc<Control>) {
        let checker = self.checker_id();
        debug!(checker, index, "checker task started");
        while !control.should_stop() {
            let Some(mut record) = self.pool.take() else {
                if control.sleep(self.config.checker_idle_delay).await.is_err() {
                    break;
                }
                continue;
            };
            let result = self.check(&mut record).await;
            let writer = record.writer();
            if result.is_err() {
                record.mark_unsuccessful();
            }
            self.pool.put_back(record);

            match result {
                Ok(Checked::Confirmed | Checked::Settled | Checked::Unsuccessful) => {
                    tokio::task::yield_now().await
                }
                Ok(Checked::Deferred) => {
                    let threshold = self.config.checking_threads.min(self.pool.size());
                    if self.pool.delayed() >= threshold {
                        if control
                            .sleep(self.config.unsuccessful_check_min_delay)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    } else {
                        tokio::task::yield_now().await;
                    }
                }
                Err(CheckError::Interrupted(_)) => break,
                Err(e) => {
                    warn!(checker, writer, error = %e, "check failed");
                    self.failures.report_failed_check();
                }
            }
        }
        debug!(checker, index, "checker task finished");
    }

    /// Apply stored progress of this checker node to a fresh record
    async fn resume(&self, record: &mut StressorRecord) -> Result<(), StoreError> {
        let writer = record.writer();
        let progress = read_checker_progress(self.store.as_ref(), self.checker_id(), writer).await?;
        let seed = progress.map_or(record.seed(), |p| p.seed);
        record.resume(progress.map(|p| p.operation_id), seed);
        if self.config.ignore_dead_checkers {
            self.skip_ignored(record).await?;
        }
        if record.current_operation() > 0 {
            debug!(writer, op = record.current_operation(), "check continues from stored progress");
        }
        Ok(())
    }

    /// Skip operations writers no longer keep for this checker node
    async fn skip_ignored(&self, record: &mut StressorRecord) -> Result<bool, StoreError> {
        let writer = record.writer();
        let ignored = read_ignored(self.store.as_ref(), self.checker_id(), writer).await?;
        match ignored {
            Some(ignored) if ignored.operation_id >= record.current_operation() => {
                info!(
                    writer,
                    from = record.current_operation(),
                    to = ignored.operation_id,
                    "operations are ignored"
                );
                record.skip_through(ignored.operation_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Forgive the remaining claims of a writer that is gone
    async fn forgive_dead_writer(&self, record: &mut StressorRecord) -> Result<bool, StoreError> {
        let writer = record.writer();
        if !self.config.ignore_dead_checkers || self.liveness.is_alive(Participant::Writer(writer)).await {
            return Ok(false);
        }
        let Some(latest) = record.shared().latest_confirmation() else {
            return Ok(false);
        };
        let ignored =
            raise_ignored(self.store.as_ref(), self.checker_id(), writer, latest.operation_id).await?;
        warn!(
            writer,
            from = record.current_operation(),
            to = ignored,
            "writer is dead, forgiving its unconfirmed operations"
        );
        record.skip_through(ignored);
        Ok(true)
    }

    async fn read_value(&self, key_id: KeyId) -> Result<Option<LogValue>, StoreError> {
        let raw = self.store.get(&store_key(key_id)).await?;
        Ok(decode_opt(raw.as_deref())?)
    }

    /// Read the key, its backup and, if the operation was in neither, the
    /// key again: a log moving between the two during the first reads
    /// shows up in the last one.
    async fn observe(&self, record: &StressorRecord) -> Result<Observation, StoreError> {
        let key_id = record.current_key_id();
        let mut observation = Observation::default();
        for id in [key_id, backup_key_id(key_id), key_id] {
            if let Some(value) = self.read_value(id).await? {
                observation.values.push(value);
            }
            if observation.contains(record.writer(), record.current_operation()) {
                break;
            }
        }
        Ok(observation)
    }

    /// Record the writer's latest claim
    async fn refresh_confirmation(&self, writer: WriterId) -> Result<(), StoreError> {
        if let Some(last) = read_last_operation(self.store.as_ref(), writer).await? {
            self.pool.add_confirmation(writer, &last);
        }
        Ok(())
    }

    /// Check the current operation of `record` once
    pub async fn check(&self, record: &mut StressorRecord) -> Result<Checked, CheckError> {
        if let Some(at) = record.last_unsuccessful() {
            if at.elapsed() < self.config.unsuccessful_check_min_delay {
                self.persist_progress(record).await?;
                return Ok(Checked::Deferred);
            }
            // claims are read before the value, so a claim covers what the
            // value read afterwards must contain
            self.refresh_confirmation(record.writer()).await?;
        }
        if !record.is_resumed() {
            self.resume(record).await?;
        }

        let writer = record.writer();
        let op = record.current_operation();
        let key_id = record.current_key_id();
        trace!(writer, op, key = key_id, "checking operation");

        let notified = !self.config.check_notifications || record.has_notification();
        let observation = self.observe(record).await?;
        let contains = observation.contains(writer, op);
        if contains && notified {
            self.confirm(record).await?;
            return Ok(Checked::Confirmed);
        }

        let apply_delay = self.config.write_apply_max_delay.as_millis() as u64;
        let claimed = record
            .shared()
            .current_confirmation()
            .is_some_and(|c| now_millis() >= c.timestamp.saturating_add(apply_delay));
        if !claimed {
            debug!(writer, op, key = key_id, "check unsuccessful");
            record.mark_unsuccessful();
            self.persist_progress(record).await?;
            return Ok(Checked::Unsuccessful);
        }

        if self.config.ignore_dead_checkers && self.skip_ignored(record).await? {
            self.pool.report_progress();
            return Ok(Checked::Settled);
        }
        if self.forgive_dead_writer(record).await? {
            self.pool.report_progress();
            return Ok(Checked::Settled);
        }
        if !notified {
            self.failures.report_missing_notification(writer, op);
        }
        if !contains {
            warn!(writer, op, key = key_id, "{}", observation.describe());
            self.failures.report_missing_operation(writer, op, key_id);
        }
        record.skip();
        self.pool.report_progress();
        Ok(Checked::Settled)
    }

    async fn confirm(&self, record: &mut StressorRecord) -> Result<(), StoreError> {
        let op = record.current_operation();
        trace!(writer = record.writer(), op, "found operation");
        if op % self.config.counter_update_period == 0 {
            self.write_progress(record, op).await?;
        }
        record.confirm();
        self.pool.report_progress();
        Ok(())
    }

    async fn write_progress(&self, record: &mut StressorRecord, op: OperationId) -> Result<(), StoreError> {
        write_checker_progress(
            self.store.as_ref(),
            self.checker_id(),
            record.writer(),
            &LastOperation::now(op, record.seed()),
        )
        .await?;
        record.set_persisted(op);
        Ok(())
    }

    /// Store the last finished operation of a record that stopped advancing
    ///
    /// Writers only trim what `checker_<c>_<w>` covers, so a writer whose
    /// log filled up between two periodic writes would wait for this.
    async fn persist_progress(&self, record: &mut StressorRecord) -> Result<(), StoreError> {
        let Some(last) = record.current_operation().checked_sub(1) else {
            return Ok(());
        };
        if record.persisted().is_some_and(|p| p >= last) {
            return Ok(());
        }
        trace!(writer = record.writer(), op = last, "persisting progress of idle record");
        self.write_progress(record, last).await
    }

    /// Read the latest claim of every writer in the cluster
    pub async fn refresh_all_confirmations(&self) -> Result<(), StoreError> {
        for writer in self.config.all_writers() {
            self.refresh_confirmation(writer).await?;
        }
        Ok(())
    }

    /// Block until every claimed operation of every writer was checked
    ///
    /// Fails when no record advanced for the no-progress window, counted
    /// from the latest advance of any record, or when `timeout` elapses.
    pub async fn wait_until_checked(&self, timeout: Duration, control: &Control) -> Result<(), CheckError> {
        let started = Instant::now();
        let window = self.config.no_progress_timeout.as_millis() as u64;
        self.refresh_all_confirmations().await?;
        loop {
            if self.pool.all_checked() {
                info!(checker = self.checker_id(), "all operations checked");
                return Ok(());
            }
            if now_millis().saturating_sub(self.pool.last_progress()) > window {
                return Err(CheckError::NoProgress(self.config.no_progress_timeout));
            }
            if started.elapsed() > timeout {
                return Err(CheckError::Timeout(timeout));
            }
            control.sleep(self.config.checker_idle_delay).await?;
        }
    }

    /// Records that have not advanced within the no-progress window while
    /// holding an unchecked claim
    pub async fn stalled_records(&self) -> Vec<String> {
        let window = self.config.no_progress_timeout.as_millis() as u64;
        let stalled = self.pool.stalled(window);
        if !self.config.ignore_dead_checkers || stalled.is_empty() {
            return stalled;
        }
        let mut live = Vec::with_capacity(stalled.len());
        for record in self.pool.records() {
            let status = record.status();
            if stalled.contains(&status)
                && self.liveness.is_alive(Participant::Writer(record.writer())).await
            {
                live.push(status);
            }
        }
        live
    }
}

//! Writer driver loop
//!
//! A [`Stressor`] owns one writer id. It resumes from the writer's
//! published checkpoint, then performs one logged operation per step
//! through its [`Logic`], optionally batching steps into transactions, and
//! publishes how far it got to `stressor_<w>` so checkers know what must be
//! in the logs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use super::control::{Control, Interrupted};
use super::failure::FailureManager;
use super::liveness::{KeepAliveSet, Participant};
use crate::core::checkpoint::{read_last_operation, write_last_operation, LastOperation};
use crate::core::{KeyId, KeySelector, OperationId, StressConfig, WriterId};
use crate::logic::{
    DelayedRemoves, Logic, LogicError, Operation, OperationKind, OperationSource, Outcome,
    RetryReason,
};
use crate::storage::{KeyValueStore, StoreError, StoreTransaction};

/// Lifecycle of a writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StressorState {
    Init,
    Running,
    Terminated,
}

impl fmt::Display for StressorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StressorState::Init => write!(f, "INIT"),
            StressorState::Running => write!(f, "RUNNING"),
            StressorState::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Errors that end a writer
#[derive(Debug, Error)]
pub enum StressorError {
    #[error(transparent)]
    Logic(#[from] LogicError),
    #[error("operation {op} failed {attempts} times")]
    AttemptsExhausted { op: OperationId, attempts: u32 },
    #[error("delayed remove of key {key_id} failed")]
    DelayedRemove { key_id: KeyId },
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

/// Writer progress visible to the manager
#[derive(Debug)]
pub struct StressorStatus {
    writer: WriterId,
    state: Mutex<StressorState>,
    /// Next operation id
    operation: AtomicU64,
    error: Mutex<Option<String>>,
}

impl StressorStatus {
    pub fn new(writer: WriterId) -> Self {
        StressorStatus {
            writer,
            state: Mutex::new(StressorState::Init),
            operation: AtomicU64::new(0),
            error: Mutex::new(None),
        }
    }

    pub fn writer(&self) -> WriterId {
        self.writer
    }

    pub fn state(&self) -> StressorState {
        *self.state.lock()
    }

    pub fn operation(&self) -> OperationId {
        self.operation.load(Ordering::SeqCst)
    }

    /// Error that terminated the writer, if any
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    fn set_state(&self, state: StressorState) {
        *self.state.lock() = state;
    }

    pub fn describe(&self) -> String {
        match self.error() {
            Some(e) => format!("writer {}: {} at {} ({})", self.writer, self.state(), self.operation(), e),
            None => format!("writer {}: {} at {}", self.writer, self.state(), self.operation()),
        }
    }
}

/// Open transaction batch
struct Batch {
    tx: Box<dyn StoreTransaction>,
    start: OperationId,
    remaining: u32,
}

/// Drives one writer
pub struct Stressor {
    writer: WriterId,
    config: Arc<StressConfig>,
    store: Arc<dyn KeyValueStore>,
    logic: Box<dyn Logic>,
    operations: Box<dyn OperationSource>,
    selector: KeySelector,
    failures: Arc<FailureManager>,
    control: Arc<Control>,
    status: Arc<StressorStatus>,
    next_op: OperationId,
    /// Kind of `next_op`, kept across retries
    kind: Option<OperationKind>,
    batch: Option<Batch>,
    removes: DelayedRemoves,
    attempts: u32,
}

impl Stressor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        writer: WriterId,
        selector: KeySelector,
        config: Arc<StressConfig>,
        store: Arc<dyn KeyValueStore>,
        logic: Box<dyn Logic>,
        operations: Box<dyn OperationSource>,
        failures: Arc<FailureManager>,
        control: Arc<Control>,
    ) -> Self {
        Stressor {
            writer,
            selector,
            config,
            store,
            logic,
            operations,
            failures,
            control,
            status: Arc::new(StressorStatus::new(writer)),
            next_op: 0,
            kind: None,
            batch: None,
            removes: DelayedRemoves::new(),
            attempts: 0,
        }
    }

    pub fn status(&self) -> Arc<StressorStatus> {
        self.status.clone()
    }

    pub fn next_operation(&self) -> OperationId {
        self.next_op
    }

    /// Run until terminated or a fatal error, then deregister from the
    /// keep-alive set
    pub async fn run(mut self, keep_alive: KeepAliveSet) {
        let writer = self.writer;
        info!(writer, "stressor started");
        while !self.control.should_stop() {
            match self.init().await {
                Ok(()) => break,
                Err(e) => {
                    warn!(writer, error = %e, "cannot read published checkpoint, retrying");
                    if self.control.sleep(self.config.trim_retry_delay).await.is_err() {
                        break;
                    }
                }
            }
        }

        if self.status.state() == StressorState::Running {
            while !self.control.should_stop() {
                match self.step().await {
                    Ok(_) => tokio::task::yield_now().await,
                    Err(StressorError::Interrupted(_)) => break,
                    Err(e) => {
                        error!(writer, op = self.next_op, error = %e, "stressor failed");
                        *self.status.error.lock() = Some(e.to_string());
                        break;
                    }
                }
            }
            self.finish().await;
        }

        keep_alive.lock().remove(&Participant::Writer(writer));
        self.status.set_state(StressorState::Terminated);
        info!(writer, op = self.next_op, "stressor finished");
    }

    /// Continue after the published checkpoint, if any
    pub async fn init(&mut self) -> Result<(), StoreError> {
        if let Some(last) = read_last_operation(self.store.as_ref(), self.writer).await? {
            self.next_op = last.operation_id + 1;
            self.selector = self.selector.with_seed(last.seed);
            info!(writer = self.writer, op = self.next_op, "resuming after published operation");
        }
        self.status.operation.store(self.next_op, Ordering::SeqCst);
        self.status.set_state(StressorState::Running);
        Ok(())
    }

    /// Perform (or retry) one operation
    pub async fn step(&mut self) -> Result<Outcome, StressorError> {
        if self.config.transactional() && self.batch.is_none() {
            match self.store.begin().await {
                Ok(tx) => {
                    self.batch = Some(Batch {
                        tx,
                        start: self.next_op,
                        remaining: self.config.transaction_size,
                    });
                }
                Err(e) => {
                    warn!(writer = self.writer, error = %e, "cannot begin transaction");
                    self.count_attempt()?;
                    return Ok(Outcome::Retry(RetryReason::Conflict));
                }
            }
        }

        let kind = match self.kind {
            Some(kind) => kind,
            None => *self.kind.insert(self.operations.next_kind()),
        };
        let op = Operation {
            writer: self.writer,
            id: self.next_op,
            key_id: self.selector.key_for(self.next_op),
            kind,
        };
        trace!(writer = op.writer, op = op.id, key = op.key_id, ?kind, "invoking");

        let result = match &self.batch {
            Some(batch) => self.logic.invoke(&op, batch.tx.as_store(), &mut self.removes).await,
            None => self.logic.invoke(&op, self.store.as_ref(), &mut self.removes).await,
        };

        match result {
            Ok(Outcome::Done) => {
                self.attempts = 0;
                self.kind = None;
                self.next_op += 1;
                self.status.operation.store(self.next_op, Ordering::SeqCst);
                self.after_operation(op.id).await?;
                Ok(Outcome::Done)
            }
            Ok(Outcome::Retry(RetryReason::LogFull)) => {
                // uncommitted entries can never be trimmed
                if self.batch.as_ref().is_some_and(|b| b.start < self.next_op) {
                    debug!(writer = self.writer, op = op.id, "log full inside transaction, committing early");
                    self.kind = None;
                    self.commit().await?;
                    return Ok(Outcome::Retry(RetryReason::LogFull));
                }
                self.control.sleep(self.config.trim_retry_delay).await?;
                Ok(Outcome::Retry(RetryReason::LogFull))
            }
            Ok(Outcome::Retry(RetryReason::NotYetVisible)) => Ok(Outcome::Retry(RetryReason::NotYetVisible)),
            Ok(Outcome::Retry(RetryReason::Conflict)) => {
                self.count_attempt()?;
                Ok(Outcome::Retry(RetryReason::Conflict))
            }
            Err(LogicError::Store(e)) => {
                debug!(writer = self.writer, op = op.id, error = %e, "operation failed");
                self.rollback().await;
                self.count_attempt()?;
                Ok(Outcome::Retry(RetryReason::Conflict))
            }
            Err(LogicError::Interrupted(i)) => Err(StressorError::Interrupted(i)),
            Err(e) => Err(e.into()),
        }
    }

    async fn after_operation(&mut self, op: OperationId) -> Result<(), StressorError> {
        let Some(batch) = self.batch.as_mut() else {
            self.flush_removes().await?;
            if op % self.config.counter_update_period == 0 {
                self.publish(op).await;
            }
            return Ok(());
        };
        batch.remaining -= 1;
        if batch.remaining > 0 {
            return Ok(());
        }
        self.commit().await
    }

    async fn commit(&mut self) -> Result<(), StressorError> {
        let Some(batch) = self.batch.take() else {
            return Ok(());
        };
        let start = batch.start;
        match batch.tx.commit().await {
            Ok(()) => {
                self.logic.after_commit();
                debug!(writer = self.writer, from = start, to = self.next_op - 1, "transaction committed");
                self.flush_removes().await?;
                self.publish(self.next_op - 1).await;
                Ok(())
            }
            Err(e) => {
                warn!(writer = self.writer, from = start, error = %e, "commit failed");
                self.reset_batch(start);
                self.count_attempt()
            }
        }
    }

    /// Abandon the open batch, if any
    async fn rollback(&mut self) {
        let Some(batch) = self.batch.take() else {
            return;
        };
        let start = batch.start;
        if let Err(e) = batch.tx.rollback().await {
            warn!(writer = self.writer, error = %e, "rollback failed");
        }
        self.reset_batch(start);
    }

    fn reset_batch(&mut self, start: OperationId) {
        self.logic.after_rollback();
        self.removes.clear();
        self.kind = None;
        self.next_op = start;
        self.status.operation.store(start, Ordering::SeqCst);
    }

    fn count_attempt(&mut self) -> Result<(), StressorError> {
        self.attempts += 1;
        if self.attempts >= self.config.max_operation_attempts {
            self.failures
                .report_failed_attempts(self.writer, self.next_op, self.attempts);
            return Err(StressorError::AttemptsExhausted {
                op: self.next_op,
                attempts: self.attempts,
            });
        }
        Ok(())
    }

    /// Carry out staged removals outside of any transaction
    async fn flush_removes(&mut self) -> Result<(), StressorError> {
        for (key_id, expected) in self.removes.drain() {
            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.logic.remove_value(self.store.as_ref(), key_id, &expected).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => debug!(writer = self.writer, key = key_id, error = %e, "delayed remove failed"),
                }
                if attempt >= self.config.max_delayed_remove_attempts {
                    self.failures.report_delayed_remove_error(self.writer, key_id);
                    return Err(StressorError::DelayedRemove { key_id });
                }
                self.control.sleep(self.config.trim_retry_delay).await?;
            }
        }
        Ok(())
    }

    /// Claim everything up to `op`; a failed claim is covered by the next
    async fn publish(&self, op: OperationId) {
        let last = LastOperation::now(op, self.selector.seed());
        match write_last_operation(self.store.as_ref(), self.writer, &last).await {
            Ok(()) => trace!(writer = self.writer, op, "published"),
            Err(e) => warn!(writer = self.writer, op, error = %e, "cannot publish last operation"),
        }
    }

    /// Drop the open batch and claim the completed operations
    async fn finish(&mut self) {
        self.rollback().await;
        if self.next_op > 0 {
            self.publish(self.next_op - 1).await;
        }
    }
}

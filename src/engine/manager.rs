//! Orchestration of one node
//!
//! A [`StressManager`] owns the local writers, the local checker group and
//! the keep-alive task, and answers the questions a test driver asks: is
//! everything checked, is checking making progress, did anything fail.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::checker::{CheckError, CheckerGroup};
use super::control::Control;
use super::failure::{FailureCounts, FailureManager, ProgressView};
use super::liveness::{spawn_keep_alive, touch_all, KeepAliveSet, LivenessTracker, Participant};
use super::pool::{spawn_notification_listener, RecordPool};
use super::stressor::{Stressor, StressorStatus};
use crate::core::checkpoint::read_checker_progress;
use crate::core::{ConfigError, KeySelector, OperationId, StressConfig, WriterId};
use crate::logic::{create_logic, LogicContext, OperationSource, RandomOperations};
use crate::storage::{KeyValueStore, StoreError};

/// Builds the operation source of a writer
pub type OperationSourceFactory = Arc<dyn Fn(WriterId) -> Box<dyn OperationSource> + Send + Sync>;

/// Errors of the manager surface
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("transaction size {0} requires a store with transactions")]
    TransactionsUnsupported(u32),
    #[error("notification checking requires a store with a change stream")]
    NotificationsUnsupported,
    #[error("stressors are not running")]
    NotRunning,
    #[error("no progress within {0:?}")]
    NoProgress(Duration),
    #[error(transparent)]
    Check(#[from] CheckError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tasks stopped together
struct TaskGroup {
    name: &'static str,
    control: Arc<Control>,
    handles: Vec<JoinHandle<()>>,
}

impl TaskGroup {
    /// Ask the tasks to terminate, interrupt them after `grace`, join
    async fn stop(self, grace: Duration) {
        let TaskGroup {
            name,
            control,
            handles,
        } = self;
        control.request_terminate();
        let mut joined = Box::pin(join_all(handles));
        let results = match tokio::time::timeout(grace, &mut joined).await {
            Ok(results) => results,
            Err(_) => {
                info!(name, "tasks still running after grace period, interrupting");
                control.interrupt();
                joined.await
            }
        };
        for result in results {
            if let Err(e) = result {
                error!(name, error = %e, "task panicked");
            }
        }
        control.interrupt();
    }
}

/// Writers, checkers and keep-alive of one node
pub struct StressManager {
    config: Arc<StressConfig>,
    store: Arc<dyn KeyValueStore>,
    failures: Arc<FailureManager>,
    liveness: Arc<LivenessTracker>,
    keep_alive: KeepAliveSet,
    checkers: Arc<CheckerGroup>,
    operations: OperationSourceFactory,
    /// Key selection of every local writer
    selectors: Vec<(WriterId, KeySelector)>,
    statuses: Mutex<Vec<Arc<StressorStatus>>>,
    stressor_tasks: Mutex<Option<TaskGroup>>,
    checker_tasks: Mutex<Option<TaskGroup>>,
    keep_alive_task: Mutex<Option<TaskGroup>>,
}

impl StressManager {
    /// Validate `config` against the capabilities of `store`
    pub fn new(config: StressConfig, store: Arc<dyn KeyValueStore>) -> Result<Self, ManagerError> {
        config.validate()?;
        if config.transactional() && !store.supports_transactions() {
            return Err(ManagerError::TransactionsUnsupported(config.transaction_size));
        }
        if config.check_notifications && store.subscribe().is_none() {
            return Err(ManagerError::NotificationsUnsupported);
        }
        let config = Arc::new(config);
        let failures = Arc::new(FailureManager::new());
        let liveness = Arc::new(LivenessTracker::new(store.clone(), config.dead_timeout));
        let checkers = Arc::new(CheckerGroup::new(
            config.clone(),
            store.clone(),
            Arc::new(RecordPool::new(&config)?),
            liveness.clone(),
            failures.clone(),
        ));
        let selectors = config
            .local_writers()
            .map(|writer| Ok((writer, config.key_selector(writer)?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let mix = config.operations;
        Ok(StressManager {
            config,
            store,
            failures,
            liveness,
            keep_alive: KeepAliveSet::default(),
            checkers,
            operations: Arc::new(move |_| Box::new(RandomOperations::new(mix))),
            selectors,
            statuses: Mutex::new(Vec::new()),
            stressor_tasks: Mutex::new(None),
            checker_tasks: Mutex::new(None),
            keep_alive_task: Mutex::new(None),
        })
    }

    /// Use `factory` instead of the configured random mix
    pub fn with_operation_source(mut self, factory: OperationSourceFactory) -> Self {
        self.operations = factory;
        self
    }

    pub fn config(&self) -> &StressConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<RecordPool> {
        self.checkers.pool()
    }

    /// Start checkers, then writers
    pub async fn start(&self) {
        self.start_checkers().await;
        self.start_stressors().await;
    }

    pub async fn start_stressors(&self) {
        if self.stressor_tasks.lock().is_some() {
            warn!(node = self.config.node_index, "stressors already started");
            return;
        }
        let control = Arc::new(Control::new());
        for writer in self.config.local_writers() {
            self.keep_alive.lock().insert(Participant::Writer(writer));
        }
        touch_all(&self.liveness, &self.keep_alive).await;
        self.ensure_keep_alive();

        let mut statuses = Vec::new();
        let mut handles = Vec::new();
        for &(writer, selector) in &self.selectors {
            let logic = create_logic(LogicContext {
                config: self.config.clone(),
                store: self.store.clone(),
                liveness: self.liveness.clone(),
                failures: self.failures.clone(),
                control: control.clone(),
            });
            let stressor = Stressor::new(
                writer,
                selector,
                self.config.clone(),
                self.store.clone(),
                logic,
                (self.operations)(writer),
                self.failures.clone(),
                control.clone(),
            );
            statuses.push(stressor.status());
            handles.push(tokio::spawn(stressor.run(self.keep_alive.clone())));
        }
        *self.statuses.lock() = statuses;
        info!(node = self.config.node_index, writers = handles.len(), "stressors started");
        *self.stressor_tasks.lock() = Some(TaskGroup {
            name: "stressors",
            control,
            handles,
        });
    }

    pub async fn start_checkers(&self) {
        if self.checker_tasks.lock().is_some() {
            warn!(node = self.config.node_index, "checkers already started");
            return;
        }
        let control = Arc::new(Control::new());
        self.keep_alive
            .lock()
            .insert(Participant::Checker(self.config.checker_id()));
        touch_all(&self.liveness, &self.keep_alive).await;
        self.ensure_keep_alive();

        let mut handles = self.checkers.spawn(&control);
        if self.config.check_notifications {
            match self.store.subscribe() {
                Some(events) => handles.push(spawn_notification_listener(
                    self.pool().clone(),
                    events,
                    control.clone(),
                )),
                None => warn!("store stopped reporting changes"),
            }
        }
        info!(node = self.config.node_index, tasks = handles.len(), "checkers started");
        *self.checker_tasks.lock() = Some(TaskGroup {
            name: "checkers",
            control,
            handles,
        });
    }

    fn ensure_keep_alive(&self) {
        let mut task = self.keep_alive_task.lock();
        if task.is_some() {
            return;
        }
        let control = Arc::new(Control::new());
        let handle = spawn_keep_alive(
            self.liveness.clone(),
            self.keep_alive.clone(),
            self.config.keep_alive_period,
            control.clone(),
        );
        *task = Some(TaskGroup {
            name: "keep-alive",
            control,
            handles: vec![handle],
        });
    }

    pub async fn stop_stressors(&self) {
        let tasks = self.stressor_tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.stop(self.config.stop_grace_period).await;
            info!(node = self.config.node_index, "stressors stopped");
        }
    }

    pub async fn stop_checkers(&self) {
        let tasks = self.checker_tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.stop(self.config.stop_grace_period).await;
            self.keep_alive
                .lock()
                .remove(&Participant::Checker(self.config.checker_id()));
            info!(node = self.config.node_index, "checkers stopped");
        }
    }

    /// Stop everything; keep-alive stamps stop last
    pub async fn stop(&self) {
        self.stop_stressors().await;
        self.stop_checkers().await;
        let task = self.keep_alive_task.lock().take();
        if let Some(task) = task {
            task.stop(self.config.stop_grace_period).await;
        }
    }

    /// Stop the writers and block until checkers verified all their claims
    pub async fn wait_until_checked(&self, timeout: Duration) -> Result<(), ManagerError> {
        self.stop_stressors().await;
        self.start_checkers().await;
        let control = self
            .checker_tasks
            .lock()
            .as_ref()
            .map(|tasks| tasks.control.clone())
            .unwrap_or_default();
        let result = self.checkers.wait_until_checked(timeout, &control).await;
        self.stop_checkers().await;
        if let Err(e) = &result {
            error!(node = self.config.node_index, error = %e, "operations were not checked");
            error!("{}", self.diagnostics());
        }
        Ok(result?)
    }

    /// Lowest operation of `writer` confirmed by every checker node
    async fn confirmed_operation(&self, writer: WriterId) -> Result<Option<OperationId>, StoreError> {
        let mut minimum: Option<OperationId> = None;
        for checker in self.config.all_checkers() {
            match read_checker_progress(self.store.as_ref(), checker, writer).await? {
                None => return Ok(None),
                Some(last) => {
                    minimum = Some(minimum.map_or(last.operation_id, |m| m.min(last.operation_id)))
                }
            }
        }
        Ok(minimum)
    }

    /// Wait until every local writer had a new operation confirmed by all
    /// checker nodes, within the no-progress timeout
    pub async fn wait_for_progress(&self) -> Result<(), ManagerError> {
        if self.stressor_tasks.lock().is_none() {
            return Err(ManagerError::NotRunning);
        }
        let mut waiting = Vec::new();
        for writer in self.config.local_writers() {
            waiting.push((writer, self.confirmed_operation(writer).await?));
        }
        let deadline = Instant::now() + self.config.no_progress_timeout;
        while !waiting.is_empty() {
            let mut still = Vec::with_capacity(waiting.len());
            for (writer, before) in waiting {
                if self.confirmed_operation(writer).await? == before {
                    still.push((writer, before));
                }
            }
            waiting = still;
            if waiting.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                info!(?waiting, "no progress within timeout");
                return Err(ManagerError::NoProgress(self.config.no_progress_timeout));
            }
            tokio::time::sleep(self.config.checker_idle_delay).await;
        }
        Ok(())
    }

    /// Verdict so far, `None` while consistent
    pub async fn get_error(&self, failures_only: bool) -> Option<String> {
        self.failures.get_error(failures_only, self).await
    }

    /// Whether no failure was counted
    pub fn is_consistent(&self) -> bool {
        self.failures.counts().is_clean()
    }

    pub fn failures(&self) -> FailureCounts {
        self.failures.counts()
    }

    /// Status of every local writer and every record
    pub fn diagnostics(&self) -> String {
        let mut lines: Vec<String> = self.statuses.lock().iter().map(|s| s.describe()).collect();
        lines.extend(self.pool().records().map(|r| r.status()));
        lines.join("\n")
    }
}

#[async_trait]
impl ProgressView for StressManager {
    async fn stalled_records(&self) -> Vec<String> {
        self.checkers.stalled_records().await
    }

    fn diagnostics(&self) -> String {
        StressManager::diagnostics(self)
    }
}

//! Scenario runner for chaos testing
//!
//! Runs a stress cluster over a [`FaultyStore`] while a nemesis injects
//! faults, heals the store, waits until every claimed operation was checked
//! and collects the verdict.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use oplog_stress::core::checkpoint::read_last_operation;
use oplog_stress::core::keys::parse_store_key;
use oplog_stress::testing::TestCluster;
use oplog_stress::{FailureCounts, KeyValueStore, MemoryStore, StressConfig};

use crate::faults::{FaultHandle, FaultRates, FaultyStore};

/// Faults injected during a scenario
#[derive(Clone, Debug, PartialEq)]
pub enum Nemesis {
    /// Healthy store
    None,
    /// Random refused and ambiguous calls for the whole run
    Flaky(FaultRates),
    /// Store unreachable for `length`, starting `after` into the run
    Partition { after: Duration, length: Duration },
    /// Every stored log is wiped after the writers stop and before any
    /// checker looked at it
    DataLoss,
}

/// Configuration of a chaos scenario
#[derive(Clone, Debug)]
pub struct ScenarioConfig {
    /// Configuration of every stress node; `node_count` nodes are run
    pub stress: StressConfig,
    /// How long the writers run
    pub duration: Duration,
    /// How long checkers get to verify everything afterwards
    pub check_timeout: Duration,
    /// Time after which a call to a partitioned store fails
    pub request_timeout: Duration,
    pub nemesis: Nemesis,
    /// Seed of the fault schedule
    pub seed: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            stress: StressConfig::default()
                .with_node(0, 2)
                .with_threads_per_node(2)
                .with_keyspace(50, 0)
                .with_counter_update_period(1)
                .with_checking_threads(4)
                .with_value_max_size(10)
                .with_no_progress_timeout(Duration::from_secs(10))
                .with_fast_timings(),
            duration: Duration::from_millis(500),
            check_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_millis(200),
            nemesis: Nemesis::None,
            seed: 0,
        }
    }
}

/// Result of a chaos scenario
#[derive(Debug)]
pub struct ScenarioResult {
    /// Failure counters summed over all nodes
    pub failures: FailureCounts,
    /// Verdict of the run, `None` if consistent
    pub error: Option<String>,
    /// Error of the final checking phase, if it did not complete
    pub check_error: Option<String>,
    /// Sum of the last claimed operation id of every writer
    pub claimed_operations: u64,
    /// Store calls that failed or timed out because of a fault
    pub injected_faults: u64,
    /// Scenario duration
    pub duration: Duration,
}

impl ScenarioResult {
    /// Whether the run found no violation and checked everything
    pub fn is_consistent(&self) -> bool {
        self.error.is_none() && self.check_error.is_none()
    }
}

/// Run one scenario
///
/// # Example
///
/// ```ignore
/// use chaos_test::{run_scenario, Nemesis, ScenarioConfig};
///
/// let result = run_scenario(ScenarioConfig {
///     nemesis: Nemesis::Partition {
///         after: Duration::from_millis(100),
///         length: Duration::from_millis(100),
///     },
///     ..Default::default()
/// })
/// .await;
/// assert!(result.is_consistent());
/// ```
pub async fn run_scenario(config: ScenarioConfig) -> ScenarioResult {
    let start = Instant::now();

    let memory = Arc::new(MemoryStore::new());
    let faulty = FaultyStore::new(memory.clone(), config.seed, config.request_timeout);
    let faults = faulty.handle();
    let store: Arc<dyn KeyValueStore> = Arc::new(faulty);

    let cluster = match TestCluster::with_store(config.stress.clone(), store.clone()) {
        Ok(cluster) => cluster,
        Err(e) => {
            return ScenarioResult {
                failures: FailureCounts::default(),
                error: Some(e.to_string()),
                check_error: None,
                claimed_operations: 0,
                injected_faults: 0,
                duration: start.elapsed(),
            }
        }
    };

    if config.nemesis == Nemesis::DataLoss {
        for node in &cluster.nodes {
            node.start_stressors().await;
        }
    } else {
        cluster.start().await;
    }

    let nemesis = spawn_nemesis(config.nemesis.clone(), faults.clone());
    tokio::time::sleep(config.duration).await;
    if let Err(e) = nemesis.await {
        warn!(error = %e, "nemesis task failed");
    }
    faults.heal();

    for node in &cluster.nodes {
        node.stop_stressors().await;
    }
    if config.nemesis == Nemesis::DataLoss {
        let lost = lose_logs(&memory);
        info!(lost, "wiped stored logs");
    }

    let check_error = cluster
        .wait_until_checked(config.check_timeout)
        .await
        .err()
        .map(|e| e.to_string());
    cluster.stop().await;

    let mut claimed_operations = 0;
    for writer in config.stress.all_writers() {
        match read_last_operation(memory.as_ref(), writer).await {
            Ok(Some(last)) => claimed_operations += last.operation_id,
            Ok(None) => {}
            Err(e) => warn!(writer, error = %e, "cannot read claim"),
        }
    }

    let result = ScenarioResult {
        failures: cluster.failures(),
        error: cluster.get_error(true).await,
        check_error,
        claimed_operations,
        injected_faults: faults.injected(),
        duration: start.elapsed(),
    };
    info!(
        failures = ?result.failures,
        injected = result.injected_faults,
        claimed = result.claimed_operations,
        "scenario finished"
    );
    result
}

/// Apply the fault schedule of `nemesis`; the task ends with the schedule
fn spawn_nemesis(nemesis: Nemesis, faults: FaultHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        match nemesis {
            Nemesis::None | Nemesis::DataLoss => {}
            Nemesis::Flaky(rates) => faults.set_rates(rates),
            Nemesis::Partition { after, length } => {
                tokio::time::sleep(after).await;
                faults.partition();
                tokio::time::sleep(length).await;
                faults.heal();
            }
        }
    })
}

/// Remove every log key from the store, returning how many were removed
fn lose_logs(memory: &MemoryStore) -> usize {
    let mut lost = 0;
    for key in memory.keys_with_prefix("key_") {
        if parse_store_key(&key).is_some() && memory.force_remove(&key).is_some() {
            lost += 1;
        }
    }
    lost
}

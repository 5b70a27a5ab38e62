//! Stress run binary
//!
//! Runs a cluster of stress nodes against an in-memory store for a fixed
//! time, then waits until every claimed operation was verified and prints
//! the verdict.
//!
//! Example:
//!   oplog-stress --nodes 3 --threads 4 --entries 1000 --duration-secs 30
//!   oplog-stress --shared --tx-size 5 --max-size 20
//!
//! Set `RUST_LOG` to change the log level (default: info).

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use oplog_stress::storage::{KeyValueStore, MemoryStore};
use oplog_stress::testing::TestCluster;
use oplog_stress::StressConfig;

/// Operation-log stressor with online consistency checking.
#[derive(Parser, Debug)]
#[command(name = "oplog-stress")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of stress nodes sharing the store.
    #[arg(long, default_value_t = 1)]
    nodes: u32,

    /// Writers per node.
    #[arg(long, default_value_t = 4)]
    threads: u32,

    /// Size of the keyspace.
    #[arg(long, default_value_t = 1000)]
    entries: u64,

    /// First key id of the keyspace.
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    key_offset: i64,

    /// Let all writers address all keys.
    #[arg(long)]
    shared: bool,

    /// Relative weight of PUT operations.
    #[arg(long, default_value_t = 2)]
    puts: u32,

    /// Relative weight of REMOVE operations.
    #[arg(long, default_value_t = 1)]
    removes: u32,

    /// Operations per transaction; 0 disables transactions.
    #[arg(long, default_value_t = 0)]
    tx_size: u32,

    /// Maximum entries in one log value.
    #[arg(long, default_value_t = 100)]
    max_size: usize,

    /// Operations between progress checkpoints.
    #[arg(long, default_value_t = 50)]
    period: u64,

    /// Checker tasks per node.
    #[arg(long, default_value_t = 10)]
    checkers: usize,

    /// Base seed for key selection.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Seconds the writers run.
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,

    /// Seconds the checkers get to verify everything after the writers stop.
    #[arg(long, default_value_t = 60)]
    check_timeout_secs: u64,

    /// Seconds without a confirmed operation before the run is declared stuck.
    #[arg(long, default_value_t = 120)]
    no_progress_secs: u64,

    /// Require a change notification for every verified operation.
    #[arg(long)]
    notifications: bool,

    /// Run against a store without transactions.
    #[arg(long)]
    no_transactions: bool,
}

impl Args {
    fn config(&self) -> StressConfig {
        StressConfig::default()
            .with_node(0, self.nodes)
            .with_threads_per_node(self.threads)
            .with_keyspace(self.entries, self.key_offset)
            .with_shared_keys(self.shared)
            .with_operations(self.puts, self.removes, 0)
            .with_transaction_size(self.tx_size)
            .with_value_max_size(self.max_size)
            .with_counter_update_period(self.period)
            .with_checking_threads(self.checkers)
            .with_seed(self.seed)
            .with_no_progress_timeout(Duration::from_secs(self.no_progress_secs))
            .with_check_notifications(self.notifications)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let store: Arc<dyn KeyValueStore> = if args.no_transactions {
        Arc::new(MemoryStore::without_transactions())
    } else {
        Arc::new(MemoryStore::new())
    };

    let cluster = match TestCluster::with_store(args.config(), store) {
        Ok(cluster) => cluster,
        Err(e) => {
            error!(error = %e, "cannot start stress run");
            return ExitCode::from(2);
        }
    };

    info!(
        nodes = args.nodes,
        threads = args.threads,
        entries = args.entries,
        shared = args.shared,
        tx_size = args.tx_size,
        "starting stress run"
    );
    cluster.run_for(Duration::from_secs(args.duration_secs)).await;

    let checked = cluster
        .wait_until_checked(Duration::from_secs(args.check_timeout_secs))
        .await;
    cluster.stop().await;

    let counts = cluster.failures();
    info!(?counts, "run finished");
    if let Err(e) = checked {
        error!(error = %e, "checking did not complete");
        println!("FAILED: {}", e);
        return ExitCode::FAILURE;
    }
    match cluster.get_error(true).await {
        Some(message) => {
            println!("FAILED: {}", message);
            ExitCode::FAILURE
        }
        None => {
            println!("OK");
            ExitCode::SUCCESS
        }
    }
}

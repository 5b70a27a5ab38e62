//! End-to-end stress runs against the in-memory store.
//!
//! Each test runs real writers and checkers for a short while, stops the
//! writers, waits until every claimed operation was verified and inspects
//! the verdict and the checkpoints left in the store.

use std::sync::Arc;
use std::time::Duration;

use oplog_stress::core::checkpoint::{
    now_millis, read_checker_progress, read_ignored, read_last_operation, stressor_key,
    writer_keep_alive_key, LastOperation,
};
use oplog_stress::core::keys::{backup_key_id, store_key};
use oplog_stress::core::{KeyId, LogValue, WriterId};
use oplog_stress::engine::OperationSourceFactory;
use oplog_stress::logic::{OperationKind, OperationSource, ScriptedOperations};
use oplog_stress::storage::codec::{decode_opt, encode};
use oplog_stress::testing::TestCluster;
use oplog_stress::{KeyValueStore, MemoryStore, StressConfig};

const CHECK_TIMEOUT: Duration = Duration::from_secs(20);

fn base_config() -> StressConfig {
    StressConfig::default()
        .with_counter_update_period(1)
        .with_checking_threads(3)
        .with_no_progress_timeout(Duration::from_secs(10))
        .with_fast_timings()
}

fn scripted(script: Vec<OperationKind>) -> OperationSourceFactory {
    Arc::new(move |_| Box::new(ScriptedOperations::new(script.clone()).unwrap()) as Box<dyn OperationSource>)
}

async fn claimed(store: &dyn KeyValueStore, writer: WriterId) -> u64 {
    read_last_operation(store, writer)
        .await
        .unwrap()
        .expect("writer published no checkpoint")
        .operation_id
}

async fn pair(store: &dyn KeyValueStore, key_id: KeyId) -> LogValue {
    let mut joined = LogValue::new();
    for id in [key_id, backup_key_id(key_id)] {
        let raw = store.get(&store_key(id)).await.unwrap();
        if let Some(value) = decode_opt::<LogValue>(raw.as_deref()).unwrap() {
            joined = joined.join(&value);
        }
    }
    joined
}

/// A single writer cycling PUT, PUT, REMOVE on one key is fully verified.
#[tokio::test]
async fn test_private_put_put_remove_on_one_key() {
    let config = base_config().with_threads_per_node(1).with_keyspace(1, 5);
    let cluster = TestCluster::new(config)
        .unwrap()
        .with_operation_source(scripted(vec![
            OperationKind::Put,
            OperationKind::Put,
            OperationKind::Remove,
        ]));

    cluster.run_for(Duration::from_millis(300)).await;
    cluster.wait_until_checked(CHECK_TIMEOUT).await.unwrap();
    cluster.stop().await;

    assert_eq!(cluster.get_error(false).await, None);
    assert!(cluster.failures().is_clean());

    let last = claimed(cluster.store.as_ref(), 0).await;
    assert!(last >= 2, "writer should get past PUT, PUT, REMOVE, claimed {}", last);
    let record = cluster.nodes[0].pool().record(0).unwrap();
    assert_eq!(record.current_operation(), last + 1);

    let confirmed = read_checker_progress(cluster.store.as_ref(), 0, 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(confirmed.operation_id, last);

    // only the key pair of key 5 was ever written
    let log = pair(cluster.store.as_ref(), 5).await;
    assert_eq!(log.writers(), vec![0]);
    assert_eq!(log.max_from(0), Some(last));
}

/// Two writers racing on one shared key both end up in the log.
#[tokio::test]
async fn test_shared_writers_race_on_one_key() {
    let config = base_config()
        .with_threads_per_node(2)
        .with_keyspace(1, 0)
        .with_shared_keys(true)
        .with_value_max_size(20);
    let cluster = TestCluster::new(config).unwrap();

    cluster.run_for(Duration::from_millis(300)).await;
    cluster.wait_until_checked(CHECK_TIMEOUT).await.unwrap();
    cluster.stop().await;

    assert!(cluster.failures().is_clean(), "{:?}", cluster.failures());

    let log = pair(cluster.store.as_ref(), 0).await;
    assert!(log.size() <= 20);
    for writer in 0..2 {
        let last = claimed(cluster.store.as_ref(), writer).await;
        let confirmed = read_checker_progress(cluster.store.as_ref(), 0, writer)
            .await
            .unwrap()
            .map(|c| c.operation_id);
        // entries only leave the log once every checker confirmed them
        assert!(
            log.contains(writer, last) || confirmed.is_some_and(|c| c >= last),
            "latest operation {} of writer {} neither logged nor confirmed",
            last,
            writer
        );
    }
}

/// Transactions on tiny logs keep trimming without ever going back.
#[tokio::test]
async fn test_trimmed_transactions_have_no_stale_reads() {
    let config = base_config()
        .with_threads_per_node(2)
        .with_keyspace(4, 0)
        .with_transaction_size(3)
        .with_value_max_size(5);
    let cluster = TestCluster::new(config).unwrap();

    cluster.run_for(Duration::from_millis(400)).await;
    cluster.wait_until_checked(CHECK_TIMEOUT).await.unwrap();
    cluster.stop().await;

    let failures = cluster.failures();
    assert_eq!(failures.stale_reads, 0);
    assert!(failures.is_clean(), "{:?}", failures);
    for writer in 0..2 {
        assert!(claimed(cluster.store.as_ref(), writer).await >= 2);
    }
}

/// A log shorter than the progress period still gets trimmed.
#[tokio::test]
async fn test_small_log_with_sparse_progress_keeps_writing() {
    let config = base_config()
        .with_threads_per_node(1)
        .with_keyspace(1, 5)
        .with_transaction_size(6)
        .with_value_max_size(5)
        .with_counter_update_period(50);
    let cluster = TestCluster::new(config).unwrap();

    cluster.run_for(Duration::from_millis(800)).await;
    cluster.wait_until_checked(CHECK_TIMEOUT).await.unwrap();
    cluster.stop().await;

    let failures = cluster.failures();
    assert!(failures.is_clean(), "{:?}", failures);
    let last = claimed(cluster.store.as_ref(), 0).await;
    assert!(last > 10, "writer stalled on a full log, claimed {}", last);
}

/// No two checker tasks ever hold the record of one writer at once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_record_has_at_most_one_checker() {
    let config = base_config()
        .with_threads_per_node(2)
        .with_keyspace(10, 0)
        .with_checking_threads(8);
    let cluster = TestCluster::new(config).unwrap();

    cluster.run_for(Duration::from_millis(300)).await;
    cluster.wait_until_checked(CHECK_TIMEOUT).await.unwrap();
    cluster.stop().await;

    assert!(cluster.failures().is_clean());
    assert_eq!(cluster.nodes[0].pool().max_concurrent_holders(), 1);
}

/// A second run over the same store continues after the checkpoints of the
/// first one.
#[tokio::test]
async fn test_restart_resumes_from_checkpoints() {
    let config = base_config().with_threads_per_node(2).with_keyspace(8, 0);
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

    let first = TestCluster::with_store(config.clone(), store.clone()).unwrap();
    first.run_for(Duration::from_millis(200)).await;
    first.wait_until_checked(CHECK_TIMEOUT).await.unwrap();
    first.stop().await;
    assert!(first.failures().is_clean());
    let before = [claimed(store.as_ref(), 0).await, claimed(store.as_ref(), 1).await];

    let second = TestCluster::with_store(config, store.clone()).unwrap();
    second.run_for(Duration::from_millis(200)).await;
    second.wait_until_checked(CHECK_TIMEOUT).await.unwrap();
    second.stop().await;

    assert!(second.failures().is_clean(), "{:?}", second.failures());
    for writer in 0..2u32 {
        let after = claimed(store.as_ref(), writer).await;
        assert!(after > before[writer as usize]);
        let record = second.nodes[0].pool().record(writer).unwrap();
        assert_eq!(record.current_operation(), after + 1);
    }
}

/// With notification checking on, every verified operation was announced.
#[tokio::test]
async fn test_notifications_are_checked() {
    let config = base_config()
        .with_threads_per_node(1)
        .with_keyspace(4, 0)
        .with_write_apply_max_delay(Duration::from_millis(300))
        .with_check_notifications(true);
    let cluster = TestCluster::new(config).unwrap();

    cluster.run_for(Duration::from_millis(200)).await;
    cluster.wait_until_checked(CHECK_TIMEOUT).await.unwrap();
    cluster.stop().await;

    let failures = cluster.failures();
    assert_eq!(failures.missing_notifications, 0);
    assert!(failures.is_clean(), "{:?}", failures);
}

/// Claims of a writer that stopped stamping its keep-alive are forgiven
/// when ignoring is on.
#[tokio::test]
async fn test_dead_writer_is_forgiven() {
    let store = Arc::new(MemoryStore::new());
    store.force_put(&stressor_key(0), encode(&LastOperation::now(3, 0)).unwrap());
    store.force_put(
        &writer_keep_alive_key(0),
        encode(&(now_millis() - 10_000)).unwrap(),
    );

    let config = base_config()
        .with_threads_per_node(1)
        .with_ignore_dead_checkers(true, Duration::from_millis(200));
    let cluster = TestCluster::with_store(config, store.clone()).unwrap();

    cluster.nodes[0].wait_until_checked(CHECK_TIMEOUT).await.unwrap();
    cluster.stop().await;

    assert!(cluster.failures().is_clean(), "{:?}", cluster.failures());
    let ignored = read_ignored(store.as_ref(), 0, 0).await.unwrap().unwrap();
    assert_eq!(ignored.operation_id, 3);
    assert_eq!(cluster.nodes[0].pool().record(0).unwrap().current_operation(), 4);
}

/// Without ignoring, every claimed operation of a dead writer that is not
/// in the store is missing.
#[tokio::test]
async fn test_dead_writer_losses_are_reported() {
    let store = Arc::new(MemoryStore::new());
    store.force_put(&stressor_key(0), encode(&LastOperation::now(3, 0)).unwrap());
    store.force_put(
        &writer_keep_alive_key(0),
        encode(&(now_millis() - 10_000)).unwrap(),
    );

    let config = base_config().with_threads_per_node(1);
    let cluster = TestCluster::with_store(config, store.clone()).unwrap();

    cluster.nodes[0].wait_until_checked(CHECK_TIMEOUT).await.unwrap();
    cluster.stop().await;

    assert_eq!(cluster.failures().missing_operations, 4);
    let message = cluster.get_error(true).await.unwrap();
    assert!(message.contains("4 missing operations"), "{}", message);
    assert!(read_ignored(store.as_ref(), 0, 0).await.unwrap().is_none());
}

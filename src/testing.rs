//! Testing utilities for integration tests
//!
//! Provides `TestCluster` for running several stress nodes in one process,
//! all sharing the same store.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::core::StressConfig;
use crate::engine::{FailureCounts, ManagerError, OperationSourceFactory, StressManager};
use crate::storage::{KeyValueStore, MemoryStore};

/// A test cluster of stress nodes
pub struct TestCluster {
    /// Store shared by all nodes
    pub store: Arc<dyn KeyValueStore>,
    /// One manager per node, indexed by node index
    pub nodes: Vec<StressManager>,
}

impl TestCluster {
    /// Create a cluster of `config.node_count` nodes over a fresh in-memory
    /// store
    pub fn new(config: StressConfig) -> Result<Self, ManagerError> {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Create a cluster of `config.node_count` nodes over `store`
    pub fn with_store(config: StressConfig, store: Arc<dyn KeyValueStore>) -> Result<Self, ManagerError> {
        let count = config.node_count;
        let nodes = (0..count)
            .map(|index| StressManager::new(config.clone().with_node(index, count), store.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TestCluster { store, nodes })
    }

    /// Use `factory` for the writers of every node
    pub fn with_operation_source(self, factory: OperationSourceFactory) -> Self {
        let nodes = self
            .nodes
            .into_iter()
            .map(|node| node.with_operation_source(factory.clone()))
            .collect();
        TestCluster {
            store: self.store,
            nodes,
        }
    }

    /// Start checkers and writers on every node
    pub async fn start(&self) {
        for node in &self.nodes {
            node.start().await;
        }
    }

    /// Start and let the writers run for `duration`
    pub async fn run_for(&self, duration: Duration) {
        self.start().await;
        tokio::time::sleep(duration).await;
    }

    /// Stop the writers of every node, then wait on every node until its
    /// checkers verified everything
    pub async fn wait_until_checked(&self, timeout: Duration) -> Result<(), ManagerError> {
        for node in &self.nodes {
            node.stop_stressors().await;
        }
        let results = join_all(self.nodes.iter().map(|node| node.wait_until_checked(timeout))).await;
        results.into_iter().collect()
    }

    /// Stop everything on every node
    pub async fn stop(&self) {
        for node in &self.nodes {
            node.stop().await;
        }
    }

    /// Failure counters summed over all nodes
    pub fn failures(&self) -> FailureCounts {
        self.nodes
            .iter()
            .map(|node| node.failures())
            .fold(FailureCounts::default(), |acc, counts| acc + counts)
    }

    /// First verdict error of any node
    pub async fn get_error(&self, failures_only: bool) -> Option<String> {
        for node in &self.nodes {
            if let Some(error) = node.get_error(failures_only).await {
                return Some(error);
            }
        }
        None
    }
}

//! Fault injection for the store under test
//!
//! [`FaultyStore`] wraps any [`KeyValueStore`] and makes its calls fail the
//! way a remote store fails:
//!
//! - a call can be refused before it reaches the store (`Unavailable`)
//! - a call can be applied and still report `Timeout` (ambiguous outcome)
//! - while partitioned, calls hang until the partition heals or the request
//!   timeout expires
//!
//! Faults are switched at runtime through [`FaultHandle`], which the
//! nemesis of a scenario holds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use oplog_stress::storage::{KeyValueStore, StoreError, StoreEvent, StoreTransaction};

/// Fault rates; both are probabilities per call
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultRates {
    /// Calls refused without reaching the store
    pub failure_rate: f64,
    /// Calls applied but reported as timed out
    pub ambiguous_rate: f64,
}

/// What happens to one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fate {
    Apply,
    Refuse,
    ApplyThenTimeout,
}

struct FaultState {
    rates: Mutex<FaultRates>,
    rng: Mutex<StdRng>,
    partitioned: watch::Sender<bool>,
    request_timeout: Duration,
    injected: AtomicU64,
}

impl FaultState {
    /// Wait out a partition, or fail once the request timeout expires
    async fn reach(&self) -> Result<(), StoreError> {
        let mut partitioned = self.partitioned.subscribe();
        if !*partitioned.borrow() {
            return Ok(());
        }
        let waited = tokio::time::timeout(self.request_timeout, partitioned.wait_for(|p| !*p)).await;
        match waited {
            Ok(_) => Ok(()),
            Err(_) => {
                self.injected.fetch_add(1, Ordering::Relaxed);
                Err(StoreError::Timeout)
            }
        }
    }

    async fn fate(&self) -> Result<Fate, StoreError> {
        self.reach().await?;
        let rates = *self.rates.lock();
        let roll: f64 = self.rng.lock().random();
        let fate = if roll < rates.failure_rate {
            Fate::Refuse
        } else if roll < rates.failure_rate + rates.ambiguous_rate {
            Fate::ApplyThenTimeout
        } else {
            Fate::Apply
        };
        if fate != Fate::Apply {
            self.injected.fetch_add(1, Ordering::Relaxed);
        }
        Ok(fate)
    }

    /// Run `call` according to the fate of this call
    async fn run<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        match self.fate().await? {
            Fate::Apply => call.await,
            Fate::Refuse => Err(StoreError::Unavailable("injected failure".to_string())),
            Fate::ApplyThenTimeout => {
                call.await?;
                Err(StoreError::Timeout)
            }
        }
    }
}

/// Switches the faults of a [`FaultyStore`]
#[derive(Clone)]
pub struct FaultHandle {
    state: Arc<FaultState>,
}

impl FaultHandle {
    pub fn set_rates(&self, rates: FaultRates) {
        info!(?rates, "fault rates changed");
        *self.state.rates.lock() = rates;
    }

    /// Cut the store off until [`FaultHandle::heal`]
    pub fn partition(&self) {
        info!("store partitioned");
        self.state.partitioned.send_replace(true);
    }

    /// Remove every fault
    pub fn heal(&self) {
        info!("store healed");
        *self.state.rates.lock() = FaultRates::default();
        self.state.partitioned.send_replace(false);
    }

    pub fn is_partitioned(&self) -> bool {
        *self.state.partitioned.borrow()
    }

    /// Number of calls that failed or timed out because of a fault
    pub fn injected(&self) -> u64 {
        self.state.injected.load(Ordering::Relaxed)
    }
}

/// A store whose calls fail on demand
pub struct FaultyStore {
    inner: Arc<dyn KeyValueStore>,
    state: Arc<FaultState>,
}

impl FaultyStore {
    /// Wrap `inner` without any fault active
    pub fn new(inner: Arc<dyn KeyValueStore>, seed: u64, request_timeout: Duration) -> Self {
        let (partitioned, _) = watch::channel(false);
        FaultyStore {
            inner,
            state: Arc::new(FaultState {
                rates: Mutex::new(FaultRates::default()),
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
                partitioned,
                request_timeout,
                injected: AtomicU64::new(0),
            }),
        }
    }

    pub fn handle(&self) -> FaultHandle {
        FaultHandle {
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl KeyValueStore for FaultyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.state.run(self.inner.get(key)).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.state.run(self.inner.put(key, value)).await
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
        self.state.run(self.inner.put_if_absent(key, value)).await
    }

    async fn replace(&self, key: &str, expected: &[u8], value: Vec<u8>) -> Result<bool, StoreError> {
        self.state.run(self.inner.replace(key, expected, value)).await
    }

    async fn remove(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        self.state.run(self.inner.remove(key, expected)).await
    }

    fn supports_transactions(&self) -> bool {
        self.inner.supports_transactions()
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.state.run(self.inner.begin()).await?;
        Ok(Box::new(FaultyTransaction {
            inner: tx,
            state: self.state.clone(),
        }))
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<StoreEvent>> {
        self.inner.subscribe()
    }
}

/// Transaction of a [`FaultyStore`]
///
/// Staged reads and writes stay local to the client and never fail; the
/// commit is the call that crosses the network.
struct FaultyTransaction {
    inner: Box<dyn StoreTransaction>,
    state: Arc<FaultState>,
}

#[async_trait]
impl KeyValueStore for FaultyTransaction {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.inner.put(key, value).await
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
        self.inner.put_if_absent(key, value).await
    }

    async fn replace(&self, key: &str, expected: &[u8], value: Vec<u8>) -> Result<bool, StoreError> {
        self.inner.replace(key, expected, value).await
    }

    async fn remove(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        self.inner.remove(key, expected).await
    }
}

#[async_trait]
impl StoreTransaction for FaultyTransaction {
    fn as_store(&self) -> &dyn KeyValueStore {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let FaultyTransaction { inner, state } = *self;
        match state.fate().await {
            Ok(Fate::Apply) => inner.commit().await,
            Ok(Fate::ApplyThenTimeout) => {
                inner.commit().await?;
                debug!("commit applied, reporting timeout");
                Err(StoreError::Timeout)
            }
            Ok(Fate::Refuse) => {
                inner.rollback().await?;
                Err(StoreError::Unavailable("injected failure".to_string()))
            }
            Err(e) => {
                inner.rollback().await?;
                Err(e)
            }
        }
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}

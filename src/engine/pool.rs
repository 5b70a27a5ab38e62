//! Pool of stressor records shared by the checker tasks of a node
//!
//! Checkers take a record, check its current operation and put it back.
//! A record taken by one checker is invisible to the others until returned,
//! so no two checkers ever work on the same writer at once.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::control::Control;
use super::record::{RecordShared, StressorRecord};
use crate::core::checkpoint::{now_millis, parse_stressor_key, LastOperation};
use crate::core::keys::parse_store_key;
use crate::core::{ConfigError, LogValue, StressConfig, WriterId};
use crate::storage::codec::decode;
use crate::storage::StoreEvent;

/// Records of every writer, waiting for a checker
pub struct RecordPool {
    available: Mutex<VecDeque<StressorRecord>>,
    shared: BTreeMap<WriterId, Arc<RecordShared>>,
    /// Records returned after an unsuccessful check
    delayed: AtomicUsize,
    last_progress: AtomicU64,
}

impl RecordPool {
    /// One record per writer of the whole cluster
    pub fn new(config: &StressConfig) -> Result<Self, ConfigError> {
        let records = config
            .all_writers()
            .map(|writer| Ok(StressorRecord::new(writer, config.key_selector(writer)?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self::from_records(records))
    }

    pub fn from_records(records: Vec<StressorRecord>) -> Self {
        let shared = records
            .iter()
            .map(|r| (r.writer(), r.shared().clone()))
            .collect();
        RecordPool {
            available: Mutex::new(records.into()),
            shared,
            delayed: AtomicUsize::new(0),
            last_progress: AtomicU64::new(now_millis()),
        }
    }

    /// Take the record that waited longest, if any is free
    pub fn take(&self) -> Option<StressorRecord> {
        let record = self.available.lock().pop_front()?;
        record.shared().acquire();
        if record.last_unsuccessful().is_some() {
            self.delayed.fetch_sub(1, Ordering::SeqCst);
        }
        Some(record)
    }

    /// Return a record to the back of the queue
    pub fn put_back(&self, record: StressorRecord) {
        if record.last_unsuccessful().is_some() {
            self.delayed.fetch_add(1, Ordering::SeqCst);
        }
        record.shared().release();
        self.available.lock().push_back(record);
    }

    /// Number of records whose last check was unsuccessful
    pub fn delayed(&self) -> usize {
        self.delayed.load(Ordering::SeqCst)
    }

    /// Number of records, taken or not
    pub fn size(&self) -> usize {
        self.shared.len()
    }

    pub fn record(&self, writer: WriterId) -> Option<&Arc<RecordShared>> {
        self.shared.get(&writer)
    }

    pub fn records(&self) -> impl Iterator<Item = &Arc<RecordShared>> {
        self.shared.values()
    }

    /// Some checker confirmed an operation
    pub fn report_progress(&self) {
        self.last_progress.store(now_millis(), Ordering::SeqCst);
    }

    /// Wall-clock milliseconds of the latest confirmation by any checker
    pub fn last_progress(&self) -> u64 {
        self.last_progress.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn set_last_progress(&self, millis: u64) {
        self.last_progress.store(millis, Ordering::SeqCst);
    }

    /// Record a writer claim read from its `stressor_` key
    pub fn add_confirmation(&self, writer: WriterId, last: &LastOperation) {
        if let Some(record) = self.record(writer) {
            record.add_confirmation(last.operation_id, last.timestamp);
        }
    }

    /// Whether every claim of every writer was verified
    pub fn all_checked(&self) -> bool {
        self.records().all(|r| !r.has_unchecked_confirmation())
    }

    /// Records with a claim older than `timeout_ms` that checkers have not
    /// caught up with
    pub fn stalled(&self, timeout_ms: u64) -> Vec<String> {
        let now = now_millis();
        self.records()
            .filter(|r| {
                r.current_confirmation()
                    .is_some_and(|c| now.saturating_sub(c.timestamp) > timeout_ms)
                    && now.saturating_sub(r.last_success()) > timeout_ms
            })
            .map(|r| r.status())
            .collect()
    }

    /// Most checkers that held one record simultaneously
    pub fn max_concurrent_holders(&self) -> usize {
        self.records()
            .map(|r| r.max_concurrent_holders())
            .max()
            .unwrap_or_default()
    }

    /// Feed one change event into the notification bookkeeping
    ///
    /// A log value announces every operation it holds. A `stressor_`
    /// checkpoint starts the requirement: from the operation after it on,
    /// each found operation must also have been announced.
    pub fn on_event(&self, event: &StoreEvent) {
        if let Some(writer) = parse_stressor_key(&event.key) {
            match decode::<LastOperation>(&event.value) {
                Ok(last) => {
                    if let Some(record) = self.record(writer) {
                        record.require_notifications_from(last.operation_id + 1);
                    }
                }
                Err(e) => warn!(key = %event.key, error = %e, "malformed checkpoint event"),
            }
            return;
        }
        if parse_store_key(&event.key).is_none() {
            return;
        }
        match decode::<LogValue>(&event.value) {
            Ok(value) => {
                for entry in value.entries() {
                    if let Some(record) = self.record(entry.writer) {
                        record.notify(entry.op);
                    }
                }
            }
            Err(e) => warn!(key = %event.key, error = %e, "malformed log event"),
        }
    }
}

/// Spawn the task that feeds store change events into `pool`
pub fn spawn_notification_listener(
    pool: Arc<RecordPool>,
    mut events: broadcast::Receiver<StoreEvent>,
    control: Arc<Control>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("notification listener started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => pool.on_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification listener lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = control.interrupted() => break,
            }
            trace!("notification processed");
        }
        debug!("notification listener finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checkpoint::stressor_key;
    use crate::core::keys::store_key;
    use crate::storage::codec::encode;

    fn config() -> StressConfig {
        StressConfig::default().with_threads_per_node(3)
    }

    #[test]
    fn test_taken_record_is_exclusive() {
        let pool = RecordPool::new(&config()).unwrap();
        let a = pool.take().unwrap();
        let b = pool.take().unwrap();
        let c = pool.take().unwrap();
        assert!(pool.take().is_none());
        assert_ne!(a.writer(), b.writer());

        pool.put_back(a);
        let again = pool.take().unwrap();
        assert_eq!(again.shared().max_concurrent_holders(), 1);
        pool.put_back(again);
        pool.put_back(b);
        pool.put_back(c);
        assert_eq!(pool.max_concurrent_holders(), 1);
    }

    #[test]
    fn test_delayed_counts_unsuccessful_records() {
        let pool = RecordPool::new(&config()).unwrap();
        let mut record = pool.take().unwrap();
        record.mark_unsuccessful();
        pool.put_back(record);
        assert_eq!(pool.delayed(), 1);

        // the returned record is at the back of the queue
        let mut taken = Vec::new();
        while let Some(record) = pool.take() {
            taken.push(record);
        }
        assert_eq!(pool.delayed(), 0);
        for record in taken {
            pool.put_back(record);
        }
    }

    #[test]
    fn test_all_checked_follows_confirmations() {
        let pool = RecordPool::new(&config()).unwrap();
        assert!(pool.all_checked());

        pool.add_confirmation(1, &LastOperation::now(0, 0));
        assert!(!pool.all_checked());
        assert!(pool.stalled(60_000).is_empty());

        let mut taken = Vec::new();
        while let Some(record) = pool.take() {
            taken.push(record);
        }
        for mut record in taken {
            if record.writer() == 1 {
                record.confirm();
            }
            pool.put_back(record);
        }
        assert!(pool.all_checked());
    }

    #[test]
    fn test_events_feed_notifications() {
        let pool = RecordPool::new(&config()).unwrap();
        pool.on_event(&StoreEvent {
            key: stressor_key(2),
            value: encode(&LastOperation::now(0, 0)).unwrap(),
        });
        let value = LogValue::single(2, 1).with(0, 7);
        pool.on_event(&StoreEvent {
            key: store_key(4),
            value: encode(&value).unwrap(),
        });

        let mut record = loop {
            let record = pool.take().unwrap();
            if record.writer() == 2 {
                break record;
            }
            pool.put_back(record);
        };
        assert!(record.has_notification());
        record.confirm();
        assert!(record.has_notification());
        record.confirm();
        assert!(!record.has_notification());
    }
}

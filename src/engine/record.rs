//! Per-writer checking state
//!
//! A [`StressorRecord`] tracks which operation of one writer a checker
//! expects to find next. Records live in the [`RecordPool`] and are held by
//! at most one checker task at a time; the parts other tasks need to see
//! (progress, confirmations, notifications) sit in [`RecordShared`].
//!
//! [`RecordPool`]: super::pool::RecordPool

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::core::checkpoint::now_millis;
use crate::core::{KeyId, KeySelector, OperationId, WriterId};

/// The writer claimed to have committed everything up to `operation_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub operation_id: OperationId,
    /// Wall-clock milliseconds of the claim
    pub timestamp: u64,
}

#[derive(Debug, Default)]
struct Notifications {
    /// Operations from this id on must be announced by the change stream
    required_from: Option<OperationId>,
    seen: BTreeSet<OperationId>,
}

/// Record state visible outside the checker holding the record
#[derive(Debug)]
pub struct RecordShared {
    writer: WriterId,
    current_op: AtomicU64,
    last_success: AtomicU64,
    /// Pending confirmations, sorted by operation id
    confirmations: Mutex<VecDeque<Confirmation>>,
    notifications: Mutex<Notifications>,
    holders: AtomicUsize,
    max_holders: AtomicUsize,
}

impl RecordShared {
    fn new(writer: WriterId) -> Self {
        RecordShared {
            writer,
            current_op: AtomicU64::new(0),
            last_success: AtomicU64::new(now_millis()),
            confirmations: Mutex::new(VecDeque::new()),
            notifications: Mutex::new(Notifications::default()),
            holders: AtomicUsize::new(0),
            max_holders: AtomicUsize::new(0),
        }
    }

    pub fn writer(&self) -> WriterId {
        self.writer
    }

    /// Next operation the checker expects
    pub fn current_operation(&self) -> OperationId {
        self.current_op.load(Ordering::SeqCst)
    }

    /// Wall-clock milliseconds of the last confirmed operation (or creation)
    pub fn last_success(&self) -> u64 {
        self.last_success.load(Ordering::SeqCst)
    }

    /// Queue a claim of the writer; claims below the current operation are
    /// already settled
    pub fn add_confirmation(&self, operation_id: OperationId, timestamp: u64) {
        if operation_id < self.current_operation() {
            return;
        }
        let mut confirmations = self.confirmations.lock();
        let pos = confirmations.partition_point(|c| c.operation_id < operation_id);
        if confirmations
            .get(pos)
            .is_some_and(|c| c.operation_id == operation_id)
        {
            return;
        }
        confirmations.insert(
            pos,
            Confirmation {
                operation_id,
                timestamp,
            },
        );
    }

    /// Earliest claim covering the current operation
    pub fn current_confirmation(&self) -> Option<Confirmation> {
        let current = self.current_operation();
        self.confirmations
            .lock()
            .iter()
            .find(|c| c.operation_id >= current)
            .copied()
    }

    /// Latest claim of the writer
    pub fn latest_confirmation(&self) -> Option<Confirmation> {
        self.confirmations.lock().back().copied()
    }

    /// Whether a checker still has to verify a claimed operation
    pub fn has_unchecked_confirmation(&self) -> bool {
        self.current_confirmation().is_some()
    }

    /// The change stream announced `op`
    pub fn notify(&self, op: OperationId) {
        if op >= self.current_operation() {
            self.notifications.lock().seen.insert(op);
        }
    }

    /// Require announcements for operations from `op` on
    pub fn require_notifications_from(&self, op: OperationId) {
        let mut notifications = self.notifications.lock();
        if notifications.required_from.is_none() {
            notifications.required_from = Some(op);
        }
    }

    fn has_notification(&self, op: OperationId) -> bool {
        let notifications = self.notifications.lock();
        match notifications.required_from {
            Some(from) if op >= from => notifications.seen.contains(&op),
            _ => true,
        }
    }

    fn finish(&self, finished: OperationId, next: OperationId) {
        self.confirmations
            .lock()
            .retain(|c| c.operation_id > finished);
        let mut notifications = self.notifications.lock();
        notifications.seen = notifications.seen.split_off(&next);
        drop(notifications);
        self.current_op.store(next, Ordering::SeqCst);
    }

    pub(super) fn acquire(&self) {
        let holders = self.holders.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_holders.fetch_max(holders, Ordering::SeqCst);
    }

    pub(super) fn release(&self) {
        self.holders.fetch_sub(1, Ordering::SeqCst);
    }

    /// Most checkers that ever held this record at the same time
    pub fn max_concurrent_holders(&self) -> usize {
        self.max_holders.load(Ordering::SeqCst)
    }

    /// One-line status for diagnostics
    pub fn status(&self) -> String {
        format!(
            "record of writer {}: expecting {}, last success {} ms ago, latest claim {:?}",
            self.writer,
            self.current_operation(),
            now_millis().saturating_sub(self.last_success()),
            self.latest_confirmation().map(|c| c.operation_id),
        )
    }
}

/// Checking state of one writer, owned by one checker at a time
#[derive(Debug)]
pub struct StressorRecord {
    shared: std::sync::Arc<RecordShared>,
    selector: KeySelector,
    current_op: OperationId,
    key_id: KeyId,
    resumed: bool,
    last_unsuccessful: Option<Instant>,
    /// Latest operation written to this node's checker progress key
    persisted: Option<OperationId>,
}

impl StressorRecord {
    pub fn new(writer: WriterId, selector: KeySelector) -> Self {
        StressorRecord {
            shared: std::sync::Arc::new(RecordShared::new(writer)),
            key_id: selector.key_for(0),
            selector,
            current_op: 0,
            resumed: false,
            last_unsuccessful: None,
            persisted: None,
        }
    }

    pub fn shared(&self) -> &std::sync::Arc<RecordShared> {
        &self.shared
    }

    pub fn writer(&self) -> WriterId {
        self.shared.writer
    }

    pub fn current_operation(&self) -> OperationId {
        self.current_op
    }

    /// Key expected to hold the current operation (or its backup)
    pub fn current_key_id(&self) -> KeyId {
        self.key_id
    }

    pub fn seed(&self) -> u64 {
        self.selector.seed()
    }

    /// Whether stored checker progress was already applied
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Continue after `last_checked` using the writer's `seed`
    ///
    /// Never moves backwards.
    pub fn resume(&mut self, last_checked: Option<OperationId>, seed: u64) {
        self.resumed = true;
        self.selector = self.selector.with_seed(seed);
        if let Some(op) = last_checked {
            self.persisted = self.persisted.max(Some(op));
        }
        match last_checked {
            Some(op) if op + 1 > self.current_op => self.move_to(op + 1),
            _ => self.key_id = self.selector.key_for(self.current_op),
        }
    }

    fn move_to(&mut self, next: OperationId) {
        let finished = next.saturating_sub(1);
        self.current_op = next;
        self.key_id = self.selector.key_for(next);
        self.shared.finish(finished, next);
    }

    /// The current operation was found; expect the next one
    pub fn confirm(&mut self) {
        self.move_to(self.current_op + 1);
        self.last_unsuccessful = None;
        self.shared.last_success.store(now_millis(), Ordering::SeqCst);
    }

    /// The current operation is settled without proof (reported or
    /// excused); expect the next one
    pub fn skip(&mut self) {
        self.move_to(self.current_op + 1);
    }

    /// Skip everything up to and including `op`
    pub fn skip_through(&mut self, op: OperationId) {
        if op >= self.current_op {
            self.move_to(op + 1);
        }
    }

    pub fn persisted(&self) -> Option<OperationId> {
        self.persisted
    }

    pub fn set_persisted(&mut self, op: OperationId) {
        self.persisted = self.persisted.max(Some(op));
    }

    pub fn has_notification(&self) -> bool {
        self.shared.has_notification(self.current_op)
    }

    pub fn last_unsuccessful(&self) -> Option<Instant> {
        self.last_unsuccessful
    }

    pub fn mark_unsuccessful(&mut self) {
        self.last_unsuccessful = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::KeyRange;

    fn record() -> StressorRecord {
        StressorRecord::new(0, KeySelector::new(KeyRange::new(0, 10).unwrap(), 1).unwrap())
    }

    #[test]
    fn test_confirm_advances_and_follows_selector() {
        let mut record = record();
        let selector = KeySelector::new(KeyRange::new(0, 10).unwrap(), 1).unwrap();
        assert_eq!(record.current_key_id(), selector.key_for(0));

        record.confirm();
        record.confirm();
        assert_eq!(record.current_operation(), 2);
        assert_eq!(record.shared().current_operation(), 2);
        assert_eq!(record.current_key_id(), selector.key_for(2));
        assert_eq!(record.last_unsuccessful(), None);
    }

    #[test]
    fn test_confirmations_settle_as_record_advances() {
        let mut record = record();
        let shared = record.shared().clone();
        shared.add_confirmation(3, 300);
        shared.add_confirmation(1, 100);
        shared.add_confirmation(1, 150);

        assert_eq!(shared.current_confirmation().map(|c| c.timestamp), Some(100));
        record.confirm();
        assert_eq!(shared.current_confirmation().map(|c| c.timestamp), Some(100));
        record.confirm();
        assert_eq!(shared.current_confirmation().map(|c| c.timestamp), Some(300));
        record.skip_through(3);
        assert_eq!(shared.current_confirmation(), None);
        assert!(!shared.has_unchecked_confirmation());

        shared.add_confirmation(2, 500);
        assert_eq!(shared.latest_confirmation(), None);
    }

    #[test]
    fn test_resume_never_moves_backwards() {
        let mut record = record();
        record.resume(Some(9), 1);
        assert_eq!(record.current_operation(), 10);
        assert!(record.is_resumed());

        record.resume(Some(4), 1);
        assert_eq!(record.current_operation(), 10);
        record.resume(None, 1);
        assert_eq!(record.current_operation(), 10);
    }

    #[test]
    fn test_notifications_required_only_after_first_checkpoint() {
        let mut record = record();
        let shared = record.shared().clone();
        assert!(record.has_notification());

        shared.require_notifications_from(1);
        assert!(record.has_notification());
        record.confirm();
        assert!(!record.has_notification());

        shared.notify(1);
        assert!(record.has_notification());
    }
}

//! Failure aggregation
//!
//! Writers and checkers report every detected violation here. The verdict
//! of a run is the union of these counters and the progress check.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::error;

use crate::core::{KeyId, OperationId, WriterId};

/// Source of progress information for [`FailureManager::get_error`]
#[async_trait]
pub trait ProgressView: Send + Sync {
    /// Descriptions of records that confirmed nothing within the
    /// no-progress window; empty when everything moves
    async fn stalled_records(&self) -> Vec<String>;

    /// Status of every writer and record, for diagnosis
    fn diagnostics(&self) -> String;
}

/// Point-in-time copy of the failure counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureCounts {
    pub missing_operations: u64,
    pub missing_notifications: u64,
    pub stale_reads: u64,
    pub failed_attempts: u64,
    pub delayed_remove_errors: u64,
    /// Checks that hit an error and were retried; not a verdict failure
    pub failed_checks: u64,
}

impl FailureCounts {
    /// Whether no violation was detected
    pub fn is_clean(&self) -> bool {
        self.missing_operations == 0
            && self.missing_notifications == 0
            && self.stale_reads == 0
            && self.failed_attempts == 0
            && self.delayed_remove_errors == 0
    }
}

impl std::ops::Add for FailureCounts {
    type Output = FailureCounts;

    fn add(self, other: FailureCounts) -> FailureCounts {
        FailureCounts {
            missing_operations: self.missing_operations + other.missing_operations,
            missing_notifications: self.missing_notifications + other.missing_notifications,
            stale_reads: self.stale_reads + other.stale_reads,
            failed_attempts: self.failed_attempts + other.failed_attempts,
            delayed_remove_errors: self.delayed_remove_errors + other.delayed_remove_errors,
            failed_checks: self.failed_checks + other.failed_checks,
        }
    }
}

/// Atomic failure counters shared by all writers and checkers of a node
#[derive(Debug, Default)]
pub struct FailureManager {
    missing_operations: AtomicU64,
    missing_notifications: AtomicU64,
    stale_reads: AtomicU64,
    failed_attempts: AtomicU64,
    delayed_remove_errors: AtomicU64,
    failed_checks: AtomicU64,
}

impl FailureManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report_missing_operation(&self, writer: WriterId, op: OperationId, key_id: KeyId) {
        error!(writer, op, key = key_id, "missing operation");
        self.missing_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report_missing_notification(&self, writer: WriterId, op: OperationId) {
        error!(writer, op, "operation found without a change notification");
        self.missing_notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report_stale_read(&self, writer: WriterId, op: OperationId, key_id: KeyId) {
        error!(writer, op, key = key_id, "stale read");
        self.stale_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report_failed_attempts(&self, writer: WriterId, op: OperationId, attempts: u32) {
        error!(writer, op, attempts, "operation failed too many times");
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report_delayed_remove_error(&self, writer: WriterId, key_id: KeyId) {
        error!(writer, key = key_id, "delayed remove failed");
        self.delayed_remove_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report_failed_check(&self) {
        self.failed_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counts(&self) -> FailureCounts {
        FailureCounts {
            missing_operations: self.missing_operations.load(Ordering::Relaxed),
            missing_notifications: self.missing_notifications.load(Ordering::Relaxed),
            stale_reads: self.stale_reads.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            delayed_remove_errors: self.delayed_remove_errors.load(Ordering::Relaxed),
            failed_checks: self.failed_checks.load(Ordering::Relaxed),
        }
    }

    /// Message describing detected violations, `None` while there are none
    pub fn failure_message(&self) -> Option<String> {
        let counts = self.counts();
        if counts.is_clean() {
            return None;
        }
        let parts: Vec<String> = [
            (counts.missing_operations, "missing operations"),
            (counts.missing_notifications, "missing notifications"),
            (counts.stale_reads, "stale reads"),
            (counts.failed_attempts, "failed operation attempts"),
            (counts.delayed_remove_errors, "failed delayed removes"),
        ]
        .iter()
        .filter(|(count, _)| *count > 0)
        .map(|(count, what)| format!("{} {}", count, what))
        .collect();
        Some(format!("Background stressors report {}", parts.join(", ")))
    }

    /// Verdict so far: `None` while consistent
    ///
    /// Counters come first. Unless `failures_only` is set, stalled checking
    /// is reported too, together with a status dump.
    pub async fn get_error(&self, failures_only: bool, view: &dyn ProgressView) -> Option<String> {
        if let Some(message) = self.failure_message() {
            return Some(message);
        }
        if failures_only {
            return None;
        }
        let stalled = view.stalled_records().await;
        if stalled.is_empty() {
            return None;
        }
        let diagnostics = view.diagnostics();
        error!(stalled = ?stalled, "no progress in checkers\n{}", diagnostics);
        Some(format!(
            "No progress in checkers! Stalled: {}\n{}",
            stalled.join("; "),
            diagnostics
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedView(Vec<String>);

    #[async_trait]
    impl ProgressView for FixedView {
        async fn stalled_records(&self) -> Vec<String> {
            self.0.clone()
        }

        fn diagnostics(&self) -> String {
            "writer 0: RUNNING".to_string()
        }
    }

    #[tokio::test]
    async fn test_clean_run_has_no_error() {
        let failures = FailureManager::new();
        failures.report_failed_check();
        assert!(failures.counts().is_clean());
        assert_eq!(failures.get_error(false, &FixedView(vec![])).await, None);
    }

    #[tokio::test]
    async fn test_counters_produce_message() {
        let failures = FailureManager::new();
        failures.report_missing_operation(0, 3, 5);
        failures.report_missing_operation(0, 4, 5);
        failures.report_stale_read(1, 9, 2);

        let counts = failures.counts();
        assert_eq!(counts.missing_operations, 2);
        assert_eq!(counts.stale_reads, 1);

        let message = failures.get_error(true, &FixedView(vec![])).await.unwrap();
        assert!(message.contains("2 missing operations"));
        assert!(message.contains("1 stale reads"));
        assert!(!message.contains("delayed"));
    }

    #[tokio::test]
    async fn test_no_progress_reported_unless_failures_only() {
        let failures = FailureManager::new();
        let view = FixedView(vec!["writer 0 at 12".to_string()]);

        assert_eq!(failures.get_error(true, &view).await, None);
        let message = failures.get_error(false, &view).await.unwrap();
        assert!(message.starts_with("No progress in checkers!"));
        assert!(message.contains("writer 0: RUNNING"));
    }
}

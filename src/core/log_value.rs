//! Log values
//!
//! A [`LogValue`] is the content of a log key: a bounded set of
//! `(writer, operation)` entries. Entries are kept sorted by writer, then
//! operation, with no duplicates. That canonical order makes the encoded
//! bytes a function of the set alone, so conditional writes can compare
//! values byte-for-byte, and per-writer ids are strictly increasing.
//!
//! Entries may only be trimmed once every checker has confirmed them (see
//! [`Watermarks`]). A value that is full of unconfirmed entries cannot grow.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{OperationId, WriterId};

/// One logged operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogEntry {
    pub writer: WriterId,
    pub op: OperationId,
}

impl LogEntry {
    pub fn new(writer: WriterId, op: OperationId) -> Self {
        LogEntry { writer, op }
    }
}

/// Appending would exceed the size bound and nothing could be trimmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFull;

/// Highest operation id confirmed by all checkers, per writer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watermarks(HashMap<WriterId, OperationId>);

impl Watermarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, writer: WriterId, checked: OperationId) {
        self.0.insert(writer, checked);
    }

    pub fn get(&self, writer: WriterId) -> Option<OperationId> {
        self.0.get(&writer).copied()
    }

    /// Whether every checker has already confirmed this entry
    pub fn covers(&self, entry: &LogEntry) -> bool {
        self.get(entry.writer).is_some_and(|checked| entry.op <= checked)
    }
}

/// Bounded history of operations stored under one key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<LogEntry>", into = "Vec<LogEntry>")]
pub struct LogValue {
    entries: Vec<LogEntry>,
}

impl From<Vec<LogEntry>> for LogValue {
    fn from(mut entries: Vec<LogEntry>) -> Self {
        entries.sort_unstable();
        entries.dedup();
        LogValue { entries }
    }
}

impl From<LogValue> for Vec<LogEntry> {
    fn from(value: LogValue) -> Self {
        value.entries
    }
}

impl LogValue {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Log holding a single operation
    pub fn single(writer: WriterId, op: OperationId) -> Self {
        LogValue {
            entries: vec![LogEntry::new(writer, op)],
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, writer: WriterId, op: OperationId) -> bool {
        self.entries.binary_search(&LogEntry::new(writer, op)).is_ok()
    }

    fn writer_slice(&self, writer: WriterId) -> &[LogEntry] {
        let start = self.entries.partition_point(|e| e.writer < writer);
        let end = self.entries.partition_point(|e| e.writer <= writer);
        &self.entries[start..end]
    }

    /// Oldest operation still present for `writer`
    pub fn min_from(&self, writer: WriterId) -> Option<OperationId> {
        self.writer_slice(writer).first().map(|e| e.op)
    }

    /// Newest operation present for `writer`
    pub fn max_from(&self, writer: WriterId) -> Option<OperationId> {
        self.writer_slice(writer).last().map(|e| e.op)
    }

    /// Distinct writers with at least one entry
    pub fn writers(&self) -> Vec<WriterId> {
        let mut writers: Vec<WriterId> = self.entries.iter().map(|e| e.writer).collect();
        writers.dedup();
        writers
    }

    /// Copy with the entry added, ignoring the size bound
    pub fn with(&self, writer: WriterId, op: OperationId) -> LogValue {
        let entry = LogEntry::new(writer, op);
        let mut entries = self.entries.clone();
        if let Err(pos) = entries.binary_search(&entry) {
            entries.insert(pos, entry);
        }
        LogValue { entries }
    }

    /// Copy without the entries every checker has confirmed
    pub fn filtered(&self, checked: &Watermarks) -> LogValue {
        LogValue {
            entries: self
                .entries
                .iter()
                .filter(|e| !checked.covers(e))
                .copied()
                .collect(),
        }
    }

    /// Copy with the entry added, keeping the size at most `max_size`
    ///
    /// When the log is full, confirmed entries are dropped first. If that
    /// frees no room the append fails with [`LogFull`]: dropping an
    /// unconfirmed entry would hide its loss from the checkers. Appending an
    /// entry that is already present returns an equal value.
    pub fn append(
        &self,
        writer: WriterId,
        op: OperationId,
        max_size: usize,
        checked: &Watermarks,
    ) -> Result<LogValue, LogFull> {
        if self.contains(writer, op) {
            return Ok(self.clone());
        }
        if self.size() < max_size {
            return Ok(self.with(writer, op));
        }
        let trimmed = self.filtered(checked);
        if trimmed.size() < max_size {
            Ok(trimmed.with(writer, op))
        } else {
            Err(LogFull)
        }
    }

    /// Union of two logs
    ///
    /// Either key of a pair may hold entries the other lacks after an
    /// interrupted move, so writers in shared mode always extend the join.
    pub fn join(&self, other: &LogValue) -> LogValue {
        let mut entries = Vec::with_capacity(self.size().max(other.size()));
        let (mut a, mut b) = (self.entries.iter().peekable(), other.entries.iter().peekable());
        loop {
            let entry = match (a.peek().copied(), b.peek().copied()) {
                (Some(x), Some(y)) => {
                    if x <= y {
                        a.next();
                    }
                    if y <= x {
                        b.next();
                    }
                    x.min(y)
                }
                (Some(x), None) => {
                    a.next();
                    x
                }
                (None, Some(y)) => {
                    b.next();
                    y
                }
                (None, None) => break,
            };
            entries.push(*entry);
        }
        LogValue { entries }
    }

    /// Join of two optional logs, `None` if both are absent
    pub fn join_opt(a: Option<&LogValue>, b: Option<&LogValue>) -> Option<LogValue> {
        match (a, b) {
            (Some(a), Some(b)) => Some(a.join(b)),
            (Some(v), None) | (None, Some(v)) => Some(v.clone()),
            (None, None) => None,
        }
    }
}

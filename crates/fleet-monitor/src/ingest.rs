use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use fleet_core::{LogEntry, LogEvent};

pub const DEFAULT_LOG_CAPACITY: usize = 5_000;

/// Append-only run log bounded to `capacity` entries; the oldest entries are
/// evicted first. Order is ingestion order, tracked by `seq`.
#[derive(Debug, Clone)]
pub struct RunLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_seq: u64,
    evicted: u64,
}

impl Default for RunLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl RunLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1_024)),
            capacity,
            next_seq: 0,
            evicted: 0,
        }
    }

    pub fn append(&mut self, event: LogEvent, received_at: DateTime<Utc>) -> &LogEntry {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
        let entry = LogEntry {
            seq: self.next_seq,
            entity_id: event.entity_id,
            message: event.message,
            severity: event.severity,
            received_at,
            emitted_at_ms: event.emitted_at_ms,
        };
        self.next_seq += 1;
        self.entries.push_back(entry);
        &self.entries[self.entries.len() - 1]
    }

    /// Empties the log for a new run. Sequence numbers keep counting.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.evicted = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// The newest `limit` entries, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<LogEntry> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }
}

//! Terminal store for rows that exhausted their attempts

use catalog_common::types::{epoch_millis, RowIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use super::FailedRow;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub failed_row: FailedRow,
    pub dead_lettered_at_ms: i64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<DeadLetterEntry>,
    indices: HashSet<RowIndex>,
}

/// Dead-letter set; each row index is stored at most once
#[derive(Debug, Default)]
pub struct DeadLetterQueue {
    inner: Mutex<Inner>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Store a row; returns `false` if it was already dead-lettered
    pub fn push(&self, failed_row: FailedRow) -> bool {
        let mut inner = self.lock();
        if !inner.indices.insert(failed_row.row_index) {
            return false;
        }
        inner.entries.push(DeadLetterEntry {
            failed_row,
            dead_lettered_at_ms: epoch_millis(),
        });
        true
    }

    /// Reload entries from a checkpoint, replacing the current contents
    pub fn restore(&self, entries: Vec<DeadLetterEntry>) {
        let mut inner = self.lock();
        inner.indices = entries.iter().map(|e| e.failed_row.row_index).collect();
        inner.entries = entries;
    }

    pub fn contains(&self, row_index: RowIndex) -> bool {
        self.lock().indices.contains(&row_index)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.lock().entries.clone()
    }
}

//! Row lifecycle ledger
//!
//! Each row index is in exactly one state at a time. Transitions outside the
//! lifecycle are rejected instead of silently overwriting the state.

use catalog_common::types::RowIndex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{ImportError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowState {
    Pending,
    InFlight,
    Failed,
    DeadLettered,
    Succeeded,
}

impl RowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowState::Pending => "pending",
            RowState::InFlight => "in_flight",
            RowState::Failed => "failed",
            RowState::DeadLettered => "dead_lettered",
            RowState::Succeeded => "succeeded",
        }
    }

    fn can_move_to(self, next: RowState) -> bool {
        use RowState::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (Pending, Failed)
                | (InFlight, Succeeded)
                | (InFlight, Failed)
                | (Failed, InFlight)
                | (Failed, DeadLettered)
        )
    }
}

/// Row states for one job
///
/// Succeeded rows are terminal and make up most of a job, so they are kept as
/// merged `start..=end` ranges instead of one map entry per row.
#[derive(Debug, Default)]
pub struct RowLedger {
    states: HashMap<RowIndex, RowState>,
    succeeded: BTreeMap<RowIndex, RowIndex>,
    succeeded_rows: usize,
}

impl RowLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, row_index: RowIndex) -> Option<RowState> {
        match self.states.get(&row_index) {
            Some(state) => Some(*state),
            None if self.is_succeeded(row_index) => Some(RowState::Succeeded),
            None => None,
        }
    }

    /// Register a newly admitted row as pending
    pub fn admit(&mut self, row_index: RowIndex) -> Result<()> {
        match self.state(row_index) {
            None => {
                self.states.insert(row_index, RowState::Pending);
                Ok(())
            }
            Some(existing) => Err(ImportError::InvalidTransition {
                row_index,
                from: existing.as_str(),
                to: RowState::Pending.as_str(),
            }),
        }
    }

    /// Place a row directly into a state, used when restoring a checkpoint
    pub fn restore(&mut self, row_index: RowIndex, state: RowState) {
        if state == RowState::Succeeded {
            self.states.remove(&row_index);
            self.mark_succeeded(row_index);
        } else {
            self.states.insert(row_index, state);
        }
    }

    pub fn transition(&mut self, row_index: RowIndex, next: RowState) -> Result<()> {
        match self.state(row_index) {
            Some(from) if from.can_move_to(next) => {
                if next == RowState::Succeeded {
                    self.states.remove(&row_index);
                    self.mark_succeeded(row_index);
                } else {
                    self.states.insert(row_index, next);
                }
                Ok(())
            }
            Some(from) => Err(ImportError::InvalidTransition {
                row_index,
                from: from.as_str(),
                to: next.as_str(),
            }),
            None => Err(ImportError::InvalidTransition {
                row_index,
                from: "unseen",
                to: next.as_str(),
            }),
        }
    }

    fn is_succeeded(&self, row_index: RowIndex) -> bool {
        self.succeeded
            .range(..=row_index)
            .next_back()
            .is_some_and(|(_, end)| *end >= row_index)
    }

    fn mark_succeeded(&mut self, row_index: RowIndex) {
        let before = self
            .succeeded
            .range(..=row_index)
            .next_back()
            .map(|(start, end)| (*start, *end));
        if matches!(before, Some((_, end)) if end >= row_index) {
            return;
        }
        let end = row_index
            .checked_add(1)
            .and_then(|next| self.succeeded.remove(&next))
            .unwrap_or(row_index);
        match before {
            Some((start, prev_end)) if prev_end + 1 == row_index => {
                self.succeeded.insert(start, end);
            }
            _ => {
                self.succeeded.insert(row_index, end);
            }
        }
        self.succeeded_rows += 1;
    }

    pub fn counts(&self) -> BTreeMap<RowState, usize> {
        let mut counts = BTreeMap::new();
        for state in self.states.values() {
            *counts.entry(*state).or_insert(0) += 1;
        }
        if self.succeeded_rows > 0 {
            counts.insert(RowState::Succeeded, self.succeeded_rows);
        }
        counts
    }

    /// Rows known to the ledger in any state
    pub fn len(&self) -> usize {
        self.states.len() + self.succeeded_rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Map entries plus succeeded ranges actually held in memory
    pub fn tracked_entries(&self) -> usize {
        self.states.len() + self.succeeded.len()
    }

    pub fn clear(&mut self) {
        self.states.clear();
        self.succeeded.clear();
        self.succeeded_rows = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut ledger = RowLedger::new();
        ledger.admit(1).unwrap();
        ledger.transition(1, RowState::InFlight).unwrap();
        ledger.transition(1, RowState::Failed).unwrap();
        ledger.transition(1, RowState::InFlight).unwrap();
        ledger.transition(1, RowState::Succeeded).unwrap();
        assert_eq!(ledger.state(1), Some(RowState::Succeeded));
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut ledger = RowLedger::new();
        ledger.admit(2).unwrap();
        ledger.transition(2, RowState::Failed).unwrap();
        ledger.transition(2, RowState::DeadLettered).unwrap();

        let err = ledger.transition(2, RowState::InFlight).unwrap_err();
        assert!(matches!(
            err,
            ImportError::InvalidTransition {
                from: "dead_lettered",
                to: "in_flight",
                ..
            }
        ));
        assert_eq!(ledger.state(2), Some(RowState::DeadLettered));
    }

    #[test]
    fn test_double_admit_and_unseen_rows_are_rejected() {
        let mut ledger = RowLedger::new();
        ledger.admit(3).unwrap();
        assert!(ledger.admit(3).is_err());
        assert!(ledger.transition(99, RowState::InFlight).is_err());
    }

    #[test]
    fn test_counts() {
        let mut ledger = RowLedger::new();
        for i in 1..=3 {
            ledger.admit(i).unwrap();
        }
        ledger.transition(1, RowState::InFlight).unwrap();
        let counts = ledger.counts();
        assert_eq!(counts.get(&RowState::Pending), Some(&2));
        assert_eq!(counts.get(&RowState::InFlight), Some(&1));
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_succeeded_rows_compact_into_ranges() {
        let mut ledger = RowLedger::new();
        for batch in 0..100u64 {
            let rows = batch * 10 + 1..=batch * 10 + 10;
            for i in rows.clone() {
                ledger.admit(i).unwrap();
            }
            // finish out of order within the batch
            for i in rows.rev() {
                ledger.transition(i, RowState::InFlight).unwrap();
                ledger.transition(i, RowState::Succeeded).unwrap();
            }
            assert_eq!(ledger.tracked_entries(), 1);
        }

        assert_eq!(ledger.len(), 1000);
        assert_eq!(ledger.counts().get(&RowState::Succeeded), Some(&1000));
        assert_eq!(ledger.state(517), Some(RowState::Succeeded));
        assert_eq!(ledger.state(1001), None);
        assert!(ledger.admit(517).is_err());
        assert!(ledger.transition(517, RowState::Failed).is_err());
    }

    #[test]
    fn test_failed_rows_split_succeeded_ranges() {
        let mut ledger = RowLedger::new();
        for i in 1..=5 {
            ledger.admit(i).unwrap();
            ledger.transition(i, RowState::InFlight).unwrap();
        }
        for i in [1, 2, 4, 5] {
            ledger.transition(i, RowState::Succeeded).unwrap();
        }
        ledger.transition(3, RowState::Failed).unwrap();
        assert_eq!(ledger.tracked_entries(), 3);
        assert_eq!(ledger.state(3), Some(RowState::Failed));

        ledger.transition(3, RowState::InFlight).unwrap();
        ledger.transition(3, RowState::Succeeded).unwrap();
        assert_eq!(ledger.tracked_entries(), 1);
        assert_eq!(ledger.counts().get(&RowState::Succeeded), Some(&5));
    }
}

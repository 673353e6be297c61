//! Per-batch dependency map and job-wide entity registry
//!
//! A row *defines* the value of the configured key column and *references*
//! every value found in the reference columns. Rows referencing a key defined
//! inside the same batch are ordered after its definer. Cycles are not
//! resolved: the closing edge is dropped and the rows keep input order.

use catalog_common::types::RowIndex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use tracing::warn;

use crate::config::DependencyRules;
use crate::types::ValidatedRow;

/// Key defined by a row, if any
pub fn defined_key(row: &ValidatedRow, rules: &DependencyRules) -> Option<String> {
    rules
        .key_field
        .as_deref()
        .and_then(|field| row.value(field))
        .map(str::to_string)
}

/// Keys referenced by a row; multi-valued cells are split on `,` and `|`
pub fn referenced_keys(row: &ValidatedRow, rules: &DependencyRules) -> BTreeSet<String> {
    let own = defined_key(row, rules);
    rules
        .reference_fields
        .iter()
        .filter_map(|field| row.value(field))
        .flat_map(|value| value.split([',', '|']))
        .map(str::trim)
        .filter(|key| !key.is_empty() && own.as_deref() != Some(*key))
        .map(str::to_string)
        .collect()
}

/// Dependency structure of one batch, indexed by position in `Batch::rows`
#[derive(Debug, Clone, Default)]
pub struct DependencyMap {
    references: Vec<BTreeSet<String>>,
    definers: HashMap<String, usize>,
    /// key -> row indices referencing it
    adjacency: BTreeMap<String, Vec<RowIndex>>,
}

impl DependencyMap {
    pub fn build(rows: &[ValidatedRow], rules: &DependencyRules) -> Self {
        let mut map = Self::default();
        for (pos, row) in rows.iter().enumerate() {
            if let Some(key) = defined_key(row, rules) {
                map.definers.entry(key).or_insert(pos);
            }
            let refs = referenced_keys(row, rules);
            for key in &refs {
                map.adjacency.entry(key.clone()).or_default().push(row.row_index);
            }
            map.references.push(refs);
        }
        map
    }

    pub fn references(&self, pos: usize) -> &BTreeSet<String> {
        static EMPTY: BTreeSet<String> = BTreeSet::new();
        self.references.get(pos).unwrap_or(&EMPTY)
    }

    /// Position of the row in this batch that defines `key`
    pub fn definer_of(&self, key: &str) -> Option<usize> {
        self.definers.get(key).copied()
    }

    /// In-batch definers a row waits for, excluding itself
    pub fn in_batch_definers(&self, pos: usize) -> Vec<(String, usize)> {
        self.references(pos)
            .iter()
            .filter_map(|key| {
                self.definer_of(key)
                    .filter(|&d| d != pos)
                    .map(|d| (key.clone(), d))
            })
            .collect()
    }

    fn definers_to_visit(&self, pos: usize) -> Vec<(String, usize)> {
        let mut definers = self.in_batch_definers(pos);
        definers.reverse();
        definers
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<RowIndex>> {
        self.adjacency.clone()
    }

    /// Stable dependency-respecting order of row positions
    ///
    /// Depth-first in input order: a row is emitted right after the in-batch
    /// rows defining the keys it references.
    pub fn processing_order(&self) -> Vec<usize> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Visiting,
            Done,
        }

        let len = self.references.len();
        let mut marks = vec![Mark::New; len];
        let mut order = Vec::with_capacity(len);

        for root in 0..len {
            if marks[root] != Mark::New {
                continue;
            }
            // (position, definers still to visit, popped from the back)
            let mut stack = vec![(root, self.definers_to_visit(root))];
            marks[root] = Mark::Visiting;
            while let Some((pos, pending)) = stack.last_mut() {
                let pos = *pos;
                match pending.pop() {
                    Some((key, definer)) => match marks[definer] {
                        Mark::New => {
                            marks[definer] = Mark::Visiting;
                            stack.push((definer, self.definers_to_visit(definer)));
                        }
                        Mark::Visiting => {
                            warn!(
                                key = %key,
                                position = pos,
                                definer,
                                "Dependency cycle detected, keeping input order for the cycle"
                            );
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks[pos] = Mark::Done;
                        order.push(pos);
                        stack.pop();
                    }
                }
            }
        }
        order
    }
}

/// Keys known to exist for the current job
///
/// Seeded with externally known entities and extended as rows are written.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    keys: Mutex<HashSet<String>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_known<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: Mutex::new(keys.into_iter().map(Into::into).collect()),
        }
    }

    pub fn register(&self, key: impl Into<String>) {
        self.keys
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(key)
    }

    /// Sorted copy of every known key
    pub fn snapshot(&self) -> Vec<String> {
        let keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<String> = keys.iter().cloned().collect();
        out.sort();
        out
    }
}

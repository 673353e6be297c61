//! Shared helpers for catalog-ingest integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use catalog_ingest::writer::{DomainWriter, WriteResult};
use catalog_ingest::{RawRecord, ValidatedRow, WriteError};
use std::collections::HashMap;
use std::sync::Mutex;

/// Writer that fails scripted rows a fixed number of times, then succeeds
#[derive(Default)]
pub struct FlakyWriter {
    script: Mutex<HashMap<u64, (usize, String)>>,
    calls: Mutex<Vec<u64>>,
}

impl FlakyWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(self, row_index: u64, times: usize, message: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(row_index, (times, message.to_string()));
        self
    }

    pub fn fail_always(self, row_index: u64, message: &str) -> Self {
        self.fail(row_index, usize::MAX, message)
    }

    pub fn calls(&self) -> Vec<u64> {
        self.calls.lock().unwrap().clone()
    }

    pub fn written(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl DomainWriter for FlakyWriter {
    async fn write(&self, row: &ValidatedRow) -> Result<WriteResult, WriteError> {
        self.calls.lock().unwrap().push(row.row_index);
        let mut script = self.script.lock().unwrap();
        if let Some((remaining, message)) = script.get_mut(&row.row_index) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(WriteError::new(message.clone()));
            }
        }
        Ok(WriteResult::created(format!("entity-{}", row.row_index)))
    }
}

/// Product row; even rows reference the previous row's sku as parent
pub fn product(row_index: u64) -> RawRecord {
    let mut fields = vec![
        ("sku".to_string(), format!("SKU-{}", row_index)),
        ("name".to_string(), format!("Product {}", row_index)),
        ("price".to_string(), format!("{}.50", row_index)),
    ];
    if row_index % 2 == 0 {
        fields.push(("parent_sku".to_string(), format!("SKU-{}", row_index - 1)));
    }
    RawRecord::new(row_index, fields)
}

pub fn products(rows: std::ops::RangeInclusive<u64>) -> Vec<anyhow::Result<RawRecord>> {
    rows.map(|i| Ok(product(i))).collect()
}

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{DbResult, Layout, Schema, TableScan, Transaction};

/// Hands out unique names for temporary tables
/// The file manager deletes files with the `temp` prefix when it opens the directory
#[derive(Debug)]
pub struct TempNameGenerator {
    next_table_num: AtomicUsize,
}

impl TempNameGenerator {
    pub const PREFIX: &str = "temp";

    pub fn new() -> Self {
        Self {
            next_table_num: AtomicUsize::new(1),
        }
    }

    pub fn next_name(&self) -> String {
        let num = self.next_table_num.fetch_add(1, Ordering::SeqCst);
        format!("{}{num}", Self::PREFIX)
    }
}

impl Default for TempNameGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A table that lives for the duration of a query and is never cataloged
pub struct TempTable {
    txn: Arc<Transaction>,
    table_name: String,
    layout: Layout,
}

impl TempTable {
    pub fn new(txn: Arc<Transaction>, schema: Schema, names: &TempNameGenerator) -> Self {
        Self {
            txn,
            table_name: names.next_name(),
            layout: Layout::new(schema),
        }
    }

    pub fn open(&self) -> DbResult<TableScan> {
        TableScan::new(Arc::clone(&self.txn), &self.table_name, self.layout.clone())
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }
}

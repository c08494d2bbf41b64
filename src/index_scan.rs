use crate::{Constant, DbResult, Index, Scan, TableScan, UpdateScan};

/// Scans the records of a table whose indexed field equals a constant
/// The index supplies the rids and the table scan jumps straight to each one
pub struct IndexSelectScan {
    table_scan: TableScan,
    index: Box<dyn Index>,
    value: Constant,
}

impl IndexSelectScan {
    pub fn new(table_scan: TableScan, index: Box<dyn Index>, value: Constant) -> DbResult<Self> {
        let mut scan = Self {
            table_scan,
            index,
            value,
        };
        scan.before_first()?;
        Ok(scan)
    }
}

impl Scan for IndexSelectScan {
    fn before_first(&mut self) -> DbResult<()> {
        self.index.before_first(&self.value)
    }

    fn next(&mut self) -> DbResult<bool> {
        if !self.index.next()? {
            return Ok(false);
        }
        let rid = self.index.get_data_rid()?;
        self.table_scan.move_to_rid(rid)?;
        Ok(true)
    }

    fn get_int(&self, field_name: &str) -> DbResult<i32> {
        self.table_scan.get_int(field_name)
    }

    fn get_string(&self, field_name: &str) -> DbResult<String> {
        self.table_scan.get_string(field_name)
    }

    fn get_value(&self, field_name: &str) -> DbResult<Constant> {
        self.table_scan.get_value(field_name)
    }

    fn has_field(&self, field_name: &str) -> bool {
        self.table_scan.has_field(field_name)
    }

    fn close(&mut self) {
        self.index.close();
        self.table_scan.close();
    }
}

#[cfg(test)]
mod index_select_scan_tests {
    use std::sync::Arc;

    use super::*;
    use crate::{IndexInfo, Schema, SimpleDB, StatInfo};

    #[test]
    fn test_index_select_scan_finds_matching_records() {
        let (db, _dir) = SimpleDB::new_for_test(400, 8, 1_000);
        let tx = db.new_tx().unwrap();
        let mut schema = Schema::new();
        schema.add_int_field("id");
        schema.add_string_field("dept", 8);
        db.metadata_manager()
            .create_table("emp", &schema, &tx)
            .unwrap();
        let layout = db.metadata_manager().get_layout("emp", &tx).unwrap();

        let index_info =
            IndexInfo::new("empdept", "dept", &schema, Arc::clone(&tx), StatInfo::new(0, 0))
                .unwrap();
        let mut index = index_info.open().unwrap();
        let mut table_scan = TableScan::new(Arc::clone(&tx), "emp", layout.clone()).unwrap();
        for i in 0..30 {
            let dept = if i % 3 == 0 { "sales" } else { "eng" };
            table_scan.insert().unwrap();
            table_scan.set_int("id", i).unwrap();
            table_scan.set_string("dept", dept).unwrap();
            index
                .insert(&Constant::String(dept.to_string()), table_scan.get_rid())
                .unwrap();
        }
        table_scan.close();
        index.close();

        let table_scan = TableScan::new(Arc::clone(&tx), "emp", layout).unwrap();
        let index = Box::new(index_info.open().unwrap());
        let mut scan =
            IndexSelectScan::new(table_scan, index, Constant::String("sales".to_string()))
                .unwrap();
        let mut ids = Vec::new();
        while scan.next().unwrap() {
            assert_eq!(scan.get_string("dept").unwrap(), "sales");
            ids.push(scan.get_int("id").unwrap());
        }
        scan.close();
        ids.sort();
        assert_eq!(ids, (0..30).filter(|i| i % 3 == 0).collect::<Vec<_>>());
        tx.commit().unwrap();
    }
}

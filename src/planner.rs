use std::sync::Arc;

use tracing::debug;

use crate::{
    CreateIndexData, CreateTableData, CreateViewData, DbError, DbResult, DeleteData, Index,
    IndexSelectPlan, InsertData, MaterializePlan, MetadataManager, ModifyData, Parser, Plan,
    ProductPlan, ProjectPlan, QueryData, SQLStatement, Scan, SelectPlan, SelectScan, TablePlan,
    TempNameGenerator, Transaction, UpdateScan,
};

pub trait QueryPlanner: Send + Sync {
    fn create_plan(&self, data: QueryData, txn: &Arc<Transaction>) -> DbResult<Box<dyn Plan>>;
}

/// Each method returns the number of records affected
pub trait UpdatePlanner: Send + Sync {
    fn execute_insert(&self, data: &InsertData, txn: &Arc<Transaction>) -> DbResult<usize>;
    fn execute_delete(&self, data: &DeleteData, txn: &Arc<Transaction>) -> DbResult<usize>;
    fn execute_modify(&self, data: &ModifyData, txn: &Arc<Transaction>) -> DbResult<usize>;
    fn execute_create_table(&self, data: &CreateTableData, txn: &Arc<Transaction>)
        -> DbResult<usize>;
    fn execute_create_view(&self, data: &CreateViewData, txn: &Arc<Transaction>) -> DbResult<usize>;
    fn execute_create_index(
        &self,
        data: &CreateIndexData,
        txn: &Arc<Transaction>,
    ) -> DbResult<usize>;
}

/// Parses SQL and hands the statement to the configured planners
pub struct Planner {
    query_planner: Box<dyn QueryPlanner>,
    update_planner: Box<dyn UpdatePlanner>,
}

impl Planner {
    pub fn new(
        query_planner: Box<dyn QueryPlanner>,
        update_planner: Box<dyn UpdatePlanner>,
    ) -> Self {
        Self {
            query_planner,
            update_planner,
        }
    }

    pub fn create_query_plan(&self, sql: &str, txn: &Arc<Transaction>) -> DbResult<Box<dyn Plan>> {
        let data = Parser::new(sql)?.parse_query()?;
        debug!(tx = txn.id(), query = %data, "planning query");
        self.query_planner.create_plan(data, txn)
    }

    pub fn execute_update(&self, sql: &str, txn: &Arc<Transaction>) -> DbResult<usize> {
        let statement = Parser::new(sql)?.parse_update()?;
        debug!(tx = txn.id(), ?statement, "executing update");
        match statement {
            SQLStatement::InsertData(data) => self.update_planner.execute_insert(&data, txn),
            SQLStatement::DeleteData(data) => self.update_planner.execute_delete(&data, txn),
            SQLStatement::ModifyData(data) => self.update_planner.execute_modify(&data, txn),
            SQLStatement::CreateTableData(data) => {
                self.update_planner.execute_create_table(&data, txn)
            }
            SQLStatement::CreateViewData(data) => {
                self.update_planner.execute_create_view(&data, txn)
            }
            SQLStatement::CreateIndexData(data) => {
                self.update_planner.execute_create_index(&data, txn)
            }
        }
    }
}

/// Builds the product of the tables in the from clause, then selects and projects
/// A table with an index on a field the predicate pins to a constant is read through that index
/// The right side of a product is copied into a temporary table when rescanning the copy is cheaper
pub struct BasicQueryPlanner {
    metadata_manager: Arc<MetadataManager>,
    temp_names: Arc<TempNameGenerator>,
}

impl BasicQueryPlanner {
    pub fn new(metadata_manager: Arc<MetadataManager>, temp_names: Arc<TempNameGenerator>) -> Self {
        Self {
            metadata_manager,
            temp_names,
        }
    }

    fn product_plan(
        &self,
        left: Box<dyn Plan>,
        right: Box<dyn Plan>,
        txn: &Arc<Transaction>,
    ) -> DbResult<Box<dyn Plan>> {
        let rescans = left.records_output();
        let direct = rescans.saturating_mul(right.blocks_accessed());
        let copied = MaterializePlan::materialized_blocks(right.as_ref(), txn.block_size());
        let materialized = right
            .blocks_accessed()
            .saturating_add(rescans.saturating_mul(copied));
        if materialized < direct {
            debug!(direct, materialized, "materializing right side of product");
            let right = MaterializePlan::new(Arc::clone(txn), right, Arc::clone(&self.temp_names));
            return Ok(Box::new(ProductPlan::new(left, Box::new(right))?));
        }
        Ok(Box::new(ProductPlan::new(left, right)?))
    }

    fn table_plan(
        &self,
        table_name: &str,
        data: &QueryData,
        txn: &Arc<Transaction>,
    ) -> DbResult<Box<dyn Plan>> {
        if let Some(view_def) = self.metadata_manager.get_view_def(table_name, txn)? {
            let view_data = Parser::new(&view_def)?.parse_query()?;
            return self.create_plan(view_data, txn);
        }
        let table_plan = TablePlan::new(Arc::clone(txn), table_name, &self.metadata_manager)?;
        let indexes = self.metadata_manager.get_index_info(table_name, txn)?;
        for (field_name, index_info) in indexes {
            if let Some(value) = data.predicate.equates_with_constant(&field_name) {
                debug!(table = table_name, index = index_info.index_name(), "using index");
                return Ok(Box::new(IndexSelectPlan::new(
                    table_plan,
                    index_info,
                    value.clone(),
                )));
            }
        }
        Ok(Box::new(table_plan))
    }
}

impl QueryPlanner for BasicQueryPlanner {
    fn create_plan(&self, data: QueryData, txn: &Arc<Transaction>) -> DbResult<Box<dyn Plan>> {
        let mut plans = Vec::with_capacity(data.tables.len());
        for table_name in &data.tables {
            plans.push(self.table_plan(table_name, &data, txn)?);
        }

        let mut plans = plans.into_iter();
        let Some(mut plan) = plans.next() else {
            return Err(DbError::BadSyntax("query names no tables".to_string()));
        };
        for next in plans {
            plan = self.product_plan(plan, next, txn)?;
        }
        plan = Box::new(SelectPlan::new(plan, data.predicate));
        Ok(Box::new(ProjectPlan::new(plan, &data.fields)?))
    }
}

fn create_table(
    metadata_manager: &MetadataManager,
    data: &CreateTableData,
    txn: &Arc<Transaction>,
) -> DbResult<usize> {
    metadata_manager.create_table(&data.table_name, &data.schema, txn)?;
    Ok(0)
}

fn create_view(
    metadata_manager: &MetadataManager,
    data: &CreateViewData,
    txn: &Arc<Transaction>,
) -> DbResult<usize> {
    metadata_manager.create_view(&data.view_name, &data.view_def(), txn)?;
    Ok(0)
}

/// Updates tables without touching their indexes
pub struct BasicUpdatePlanner {
    metadata_manager: Arc<MetadataManager>,
}

impl BasicUpdatePlanner {
    pub fn new(metadata_manager: Arc<MetadataManager>) -> Self {
        Self { metadata_manager }
    }
}

impl UpdatePlanner for BasicUpdatePlanner {
    fn execute_insert(&self, data: &InsertData, txn: &Arc<Transaction>) -> DbResult<usize> {
        let plan = TablePlan::new(Arc::clone(txn), &data.table_name, &self.metadata_manager)?;
        let mut scan = plan.open_table_scan()?;
        let result = (|| -> DbResult<usize> {
            scan.insert()?;
            for (field, value) in data.fields.iter().zip(&data.values) {
                scan.set_value(field, value)?;
            }
            Ok(1)
        })();
        scan.close();
        result
    }

    fn execute_delete(&self, data: &DeleteData, txn: &Arc<Transaction>) -> DbResult<usize> {
        let plan = TablePlan::new(Arc::clone(txn), &data.table_name, &self.metadata_manager)?;
        let mut scan = SelectScan::new(plan.open_table_scan()?, data.predicate.clone());
        let result = (|| -> DbResult<usize> {
            let mut count = 0;
            while scan.next()? {
                scan.delete()?;
                count += 1;
            }
            Ok(count)
        })();
        scan.close();
        result
    }

    fn execute_modify(&self, data: &ModifyData, txn: &Arc<Transaction>) -> DbResult<usize> {
        let plan = TablePlan::new(Arc::clone(txn), &data.table_name, &self.metadata_manager)?;
        let mut scan = SelectScan::new(plan.open_table_scan()?, data.predicate.clone());
        let result = (|| -> DbResult<usize> {
            let mut count = 0;
            while scan.next()? {
                let value = data.new_value.evaluate(&scan)?;
                scan.set_value(&data.field_name, &value)?;
                count += 1;
            }
            Ok(count)
        })();
        scan.close();
        result
    }

    fn execute_create_table(
        &self,
        data: &CreateTableData,
        txn: &Arc<Transaction>,
    ) -> DbResult<usize> {
        create_table(&self.metadata_manager, data, txn)
    }

    fn execute_create_view(&self, data: &CreateViewData, txn: &Arc<Transaction>) -> DbResult<usize> {
        create_view(&self.metadata_manager, data, txn)
    }

    fn execute_create_index(
        &self,
        data: &CreateIndexData,
        txn: &Arc<Transaction>,
    ) -> DbResult<usize> {
        self.metadata_manager.create_index(
            &data.index_name,
            &data.table_name,
            &data.field_name,
            txn,
        )?;
        Ok(0)
    }
}

/// Updates tables and keeps every index on them in step
pub struct IndexUpdatePlanner {
    metadata_manager: Arc<MetadataManager>,
}

impl IndexUpdatePlanner {
    pub fn new(metadata_manager: Arc<MetadataManager>) -> Self {
        Self { metadata_manager }
    }
}

impl UpdatePlanner for IndexUpdatePlanner {
    fn execute_insert(&self, data: &InsertData, txn: &Arc<Transaction>) -> DbResult<usize> {
        let plan = TablePlan::new(Arc::clone(txn), &data.table_name, &self.metadata_manager)?;
        let indexes = self.metadata_manager.get_index_info(&data.table_name, txn)?;
        let mut scan = plan.open_table_scan()?;
        let result = (|| -> DbResult<usize> {
            scan.insert()?;
            let rid = scan.get_rid();
            for (field, value) in data.fields.iter().zip(&data.values) {
                scan.set_value(field, value)?;
                if let Some(index_info) = indexes.get(field) {
                    let mut index = index_info.open()?;
                    let inserted = index.insert(value, rid);
                    index.close();
                    inserted?;
                }
            }
            Ok(1)
        })();
        scan.close();
        result
    }

    fn execute_delete(&self, data: &DeleteData, txn: &Arc<Transaction>) -> DbResult<usize> {
        let plan = TablePlan::new(Arc::clone(txn), &data.table_name, &self.metadata_manager)?;
        let indexes = self.metadata_manager.get_index_info(&data.table_name, txn)?;
        let mut scan = SelectScan::new(plan.open_table_scan()?, data.predicate.clone());
        let result = (|| -> DbResult<usize> {
            let mut count = 0;
            while scan.next()? {
                let rid = scan.get_rid();
                for (field, index_info) in &indexes {
                    let value = scan.get_value(field)?;
                    let mut index = index_info.open()?;
                    let deleted = index.delete(&value, rid);
                    index.close();
                    deleted?;
                }
                scan.delete()?;
                count += 1;
            }
            Ok(count)
        })();
        scan.close();
        result
    }

    fn execute_modify(&self, data: &ModifyData, txn: &Arc<Transaction>) -> DbResult<usize> {
        let plan = TablePlan::new(Arc::clone(txn), &data.table_name, &self.metadata_manager)?;
        let indexes = self.metadata_manager.get_index_info(&data.table_name, txn)?;
        let mut index = match indexes.get(&data.field_name) {
            Some(index_info) => Some(index_info.open()?),
            None => None,
        };
        let mut scan = SelectScan::new(plan.open_table_scan()?, data.predicate.clone());
        let result = (|| -> DbResult<usize> {
            let mut count = 0;
            while scan.next()? {
                let new_value = data.new_value.evaluate(&scan)?;
                let old_value = scan.get_value(&data.field_name)?;
                scan.set_value(&data.field_name, &new_value)?;
                if let Some(index) = index.as_mut() {
                    let rid = scan.get_rid();
                    index.delete(&old_value, rid)?;
                    index.insert(&new_value, rid)?;
                }
                count += 1;
            }
            Ok(count)
        })();
        scan.close();
        if let Some(mut index) = index {
            index.close();
        }
        result
    }

    fn execute_create_table(
        &self,
        data: &CreateTableData,
        txn: &Arc<Transaction>,
    ) -> DbResult<usize> {
        create_table(&self.metadata_manager, data, txn)
    }

    fn execute_create_view(&self, data: &CreateViewData, txn: &Arc<Transaction>) -> DbResult<usize> {
        create_view(&self.metadata_manager, data, txn)
    }

    /// Catalog the index and fill it with the records already in the table
    fn execute_create_index(
        &self,
        data: &CreateIndexData,
        txn: &Arc<Transaction>,
    ) -> DbResult<usize> {
        self.metadata_manager.create_index(
            &data.index_name,
            &data.table_name,
            &data.field_name,
            txn,
        )?;
        let indexes = self.metadata_manager.get_index_info(&data.table_name, txn)?;
        let Some(index_info) = indexes
            .values()
            .find(|info| info.index_name() == data.index_name)
        else {
            return Ok(0);
        };

        let plan = TablePlan::new(Arc::clone(txn), &data.table_name, &self.metadata_manager)?;
        let mut scan = plan.open_table_scan()?;
        let mut index = index_info.open()?;
        let result = (|| -> DbResult<()> {
            while scan.next()? {
                let value = scan.get_value(&data.field_name)?;
                index.insert(&value, scan.get_rid())?;
            }
            Ok(())
        })();
        index.close();
        scan.close();
        result?;
        Ok(0)
    }
}

#[cfg(test)]
mod planner_tests {
    use std::sync::Arc;

    use super::*;
    use crate::{DbError, SimpleDB};

    fn query_ints(db: &SimpleDB, sql: &str, field: &str, tx: &Arc<Transaction>) -> Vec<i32> {
        let plan = db.planner().create_query_plan(sql, tx).unwrap();
        let mut scan = plan.open().unwrap();
        let mut values = Vec::new();
        while scan.next().unwrap() {
            values.push(scan.get_int(field).unwrap());
        }
        scan.close();
        values.sort();
        values
    }

    fn setup(db: &SimpleDB, tx: &Arc<Transaction>) {
        let planner = db.planner();
        planner
            .execute_update("create table emp (id int, name varchar(10), dept int)", tx)
            .unwrap();
        planner
            .execute_update("create index empdept on emp (dept)", tx)
            .unwrap();
        for i in 0..12 {
            let sql = format!("insert into emp (id, name, dept) values ({i}, 'e{i}', {})", i % 3);
            assert_eq!(planner.execute_update(&sql, tx).unwrap(), 1);
        }
    }

    #[test]
    fn test_insert_and_select() {
        let (db, _dir) = SimpleDB::new_for_test(400, 8, 1_000);
        let tx = db.new_tx().unwrap();
        setup(&db, &tx);
        assert_eq!(
            query_ints(&db, "select id from emp where dept = 1", "id", &tx),
            vec![1, 4, 7, 10]
        );
        assert_eq!(query_ints(&db, "select id from emp", "id", &tx).len(), 12);
        tx.commit().unwrap();
    }

    #[test]
    fn test_delete_and_modify_keep_index_in_step() {
        let (db, _dir) = SimpleDB::new_for_test(400, 8, 1_000);
        let tx = db.new_tx().unwrap();
        setup(&db, &tx);
        let planner = db.planner();
        assert_eq!(
            planner
                .execute_update("delete from emp where dept = 2", &tx)
                .unwrap(),
            4
        );
        assert_eq!(
            planner
                .execute_update("update emp set dept = 2 where id = 3", &tx)
                .unwrap(),
            1
        );
        assert_eq!(
            query_ints(&db, "select id from emp where dept = 2", "id", &tx),
            vec![3]
        );
        assert_eq!(
            query_ints(&db, "select id from emp where dept = 0", "id", &tx),
            vec![0, 6, 9]
        );
        tx.commit().unwrap();
    }

    #[test]
    fn test_join_through_view() {
        let (db, _dir) = SimpleDB::new_for_test(400, 8, 1_000);
        let tx = db.new_tx().unwrap();
        setup(&db, &tx);
        let planner = db.planner();
        planner
            .execute_update("create table dept (did int, dname varchar(8))", &tx)
            .unwrap();
        planner
            .execute_update("insert into dept (did, dname) values (1, 'sales')", &tx)
            .unwrap();
        planner
            .execute_update(
                "create view sales as select id, dname from emp, dept where dept = did",
                &tx,
            )
            .unwrap();
        assert_eq!(
            query_ints(&db, "select id from sales where dname = 'sales'", "id", &tx),
            vec![1, 4, 7, 10]
        );
        tx.commit().unwrap();
    }

    fn setup_events_and_labels(db: &SimpleDB, tx: &Arc<Transaction>) {
        let planner = db.planner();
        planner
            .execute_update("create table events (eid int, kind int)", tx)
            .unwrap();
        planner
            .execute_update("create table labels (lid int, lkind int)", tx)
            .unwrap();
        planner
            .execute_update(
                "create view picks as select lid, lkind from labels where lkind = 3",
                tx,
            )
            .unwrap();
        for i in 0..100 {
            let sql = format!("insert into events (eid, kind) values ({i}, {})", i % 10);
            planner.execute_update(&sql, tx).unwrap();
        }
        for i in 0..200 {
            let sql = format!("insert into labels (lid, lkind) values ({i}, {})", i % 50);
            planner.execute_update(&sql, tx).unwrap();
        }
        db.metadata_manager().refresh_statistics(tx).unwrap();
    }

    #[test]
    fn test_selective_right_side_is_materialized() {
        let (db, _dir) = SimpleDB::new_for_test(400, 8, 1_000);
        let tx = db.new_tx().unwrap();
        setup_events_and_labels(&db, &tx);

        let sql = "select eid, lid from events, picks where kind = lkind";
        let eids = query_ints(&db, sql, "eid", &tx);
        let expected: Vec<i32> = (0..100)
            .filter(|i| i % 10 == 3)
            .flat_map(|i| [i; 4])
            .collect();
        assert_eq!(eids, expected);
        let mut lids = query_ints(&db, sql, "lid", &tx);
        lids.dedup();
        assert_eq!(lids, vec![3, 53, 103, 153]);

        // both queries copied the view's rows into a temporary table
        assert_eq!(db.temp_names().next_name(), "temp3");
        tx.commit().unwrap();
    }

    #[test]
    fn test_table_right_side_is_scanned_directly() {
        let (db, _dir) = SimpleDB::new_for_test(400, 8, 1_000);
        let tx = db.new_tx().unwrap();
        setup_events_and_labels(&db, &tx);

        let sql = "select eid, lid from events, labels where kind = lkind and lkind = 3";
        assert_eq!(query_ints(&db, sql, "eid", &tx).len(), 40);
        assert_eq!(db.temp_names().next_name(), "temp1");
        tx.commit().unwrap();
    }

    #[test]
    fn test_errors() {
        let (db, _dir) = SimpleDB::new_for_test(400, 8, 1_000);
        let tx = db.new_tx().unwrap();
        setup(&db, &tx);
        let planner = db.planner();
        assert!(matches!(
            planner.create_query_plan("select id from nowhere", &tx),
            Err(DbError::Catalog(_))
        ));
        assert!(matches!(
            planner.create_query_plan("select salary from emp", &tx),
            Err(DbError::SchemaViolation(_))
        ));
        assert!(matches!(
            planner.execute_update("insert into emp (id) values ('x')", &tx),
            Err(DbError::SchemaViolation(_))
        ));
        assert!(matches!(
            planner.execute_update("create table averyveryverylongname (a int)", &tx),
            Err(DbError::SchemaViolation(_))
        ));
        tx.rollback().unwrap();
    }

    #[test]
    fn test_basic_update_planner_ignores_indexes() {
        let (db, _dir) = SimpleDB::new_for_test(400, 8, 1_000);
        let tx = db.new_tx().unwrap();
        let mdm = Arc::clone(db.metadata_manager());
        let planner = Planner::new(
            Box::new(BasicQueryPlanner::new(
                Arc::clone(&mdm),
                Arc::clone(db.temp_names()),
            )),
            Box::new(BasicUpdatePlanner::new(mdm)),
        );
        planner
            .execute_update("create table t (a int, b varchar(4))", &tx)
            .unwrap();
        for a in 0..5 {
            let sql = format!("insert into t (a, b) values ({a}, 'x')");
            planner.execute_update(&sql, &tx).unwrap();
        }
        assert_eq!(
            planner
                .execute_update("update t set b = 'y' where a = 2", &tx)
                .unwrap(),
            1
        );
        assert_eq!(planner.execute_update("delete from t", &tx).unwrap(), 5);
        let plan = planner.create_query_plan("select a from t", &tx).unwrap();
        let mut scan = plan.open().unwrap();
        assert!(!scan.next().unwrap());
        scan.close();
        tx.commit().unwrap();
    }
}

use std::sync::Arc;

use crate::{
    Constant, DbResult, IndexInfo, IndexSelectScan, Layout, MetadataManager, Predicate,
    ProductScan, ProjectScan, Scan, Schema, SelectScan, StatInfo, TableScan, TempNameGenerator,
    TempTable, Transaction, UpdateScan,
};

/// A node of a query tree that knows its output schema and estimated cost
/// Opening a plan yields the scan that computes it
pub trait Plan {
    fn open(&self) -> DbResult<Box<dyn Scan>>;
    fn blocks_accessed(&self) -> usize;
    fn records_output(&self) -> usize;
    fn distinct_values(&self, field_name: &str) -> usize;
    fn schema(&self) -> &Schema;
}

/// Reads a stored table
pub struct TablePlan {
    txn: Arc<Transaction>,
    table_name: String,
    layout: Layout,
    stat_info: StatInfo,
}

impl TablePlan {
    pub fn new(
        txn: Arc<Transaction>,
        table_name: &str,
        metadata_manager: &MetadataManager,
    ) -> DbResult<Self> {
        let layout = metadata_manager.get_layout(table_name, &txn)?;
        let stat_info = metadata_manager.get_stat_info(table_name, &layout, &txn)?;
        Ok(Self {
            txn,
            table_name: table_name.to_string(),
            layout,
            stat_info,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// The concrete scan, for callers that need to update through it
    pub fn open_table_scan(&self) -> DbResult<TableScan> {
        TableScan::new(Arc::clone(&self.txn), &self.table_name, self.layout.clone())
    }
}

impl Plan for TablePlan {
    fn open(&self) -> DbResult<Box<dyn Scan>> {
        Ok(Box::new(self.open_table_scan()?))
    }

    fn blocks_accessed(&self) -> usize {
        self.stat_info.blocks_accessed()
    }

    fn records_output(&self) -> usize {
        self.stat_info.records_output()
    }

    fn distinct_values(&self, field_name: &str) -> usize {
        self.stat_info.distinct_values(field_name)
    }

    fn schema(&self) -> &Schema {
        &self.layout.schema
    }
}

pub struct SelectPlan {
    plan: Box<dyn Plan>,
    predicate: Predicate,
}

impl SelectPlan {
    pub fn new(plan: Box<dyn Plan>, predicate: Predicate) -> Self {
        Self { plan, predicate }
    }
}

impl Plan for SelectPlan {
    fn open(&self) -> DbResult<Box<dyn Scan>> {
        let scan = self.plan.open()?;
        Ok(Box::new(SelectScan::new(scan, self.predicate.clone())))
    }

    fn blocks_accessed(&self) -> usize {
        self.plan.blocks_accessed()
    }

    fn records_output(&self) -> usize {
        self.plan.records_output() / self.predicate.reduction_factor(self.plan.as_ref()).max(1)
    }

    fn distinct_values(&self, field_name: &str) -> usize {
        if self.predicate.equates_with_constant(field_name).is_some() {
            return 1;
        }
        match self.predicate.equates_with_field(field_name) {
            Some(other) => self
                .plan
                .distinct_values(field_name)
                .min(self.plan.distinct_values(other)),
            None => self.plan.distinct_values(field_name),
        }
    }

    fn schema(&self) -> &Schema {
        self.plan.schema()
    }
}

pub struct ProjectPlan {
    plan: Box<dyn Plan>,
    schema: Schema,
}

impl ProjectPlan {
    /// Fails with a schema violation when a field is not produced by `plan`
    pub fn new(plan: Box<dyn Plan>, fields: &[String]) -> DbResult<Self> {
        let mut schema = Schema::new();
        for field in fields {
            schema.add_from_schema(field, plan.schema())?;
        }
        Ok(Self { plan, schema })
    }
}

impl Plan for ProjectPlan {
    fn open(&self) -> DbResult<Box<dyn Scan>> {
        let scan = self.plan.open()?;
        Ok(Box::new(ProjectScan::new(scan, self.schema.fields.clone())))
    }

    fn blocks_accessed(&self) -> usize {
        self.plan.blocks_accessed()
    }

    fn records_output(&self) -> usize {
        self.plan.records_output()
    }

    fn distinct_values(&self, field_name: &str) -> usize {
        self.plan.distinct_values(field_name)
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}

pub struct ProductPlan {
    left: Box<dyn Plan>,
    right: Box<dyn Plan>,
    schema: Schema,
}

impl ProductPlan {
    pub fn new(left: Box<dyn Plan>, right: Box<dyn Plan>) -> DbResult<Self> {
        let mut schema = Schema::new();
        schema.add_all_from_schema(left.schema())?;
        schema.add_all_from_schema(right.schema())?;
        Ok(Self {
            left,
            right,
            schema,
        })
    }
}

impl Plan for ProductPlan {
    fn open(&self) -> DbResult<Box<dyn Scan>> {
        let left = self.left.open()?;
        let right = self.right.open()?;
        Ok(Box::new(ProductScan::new(left, right)?))
    }

    /// The right side is rescanned once per left record
    fn blocks_accessed(&self) -> usize {
        self.left.blocks_accessed().saturating_add(
            self.left
                .records_output()
                .saturating_mul(self.right.blocks_accessed()),
        )
    }

    fn records_output(&self) -> usize {
        self.left
            .records_output()
            .saturating_mul(self.right.records_output())
    }

    fn distinct_values(&self, field_name: &str) -> usize {
        if self.left.schema().has_field(field_name) {
            self.left.distinct_values(field_name)
        } else {
            self.right.distinct_values(field_name)
        }
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}

/// Looks up the records of a table through an index on one of its fields
pub struct IndexSelectPlan {
    plan: TablePlan,
    index_info: IndexInfo,
    value: Constant,
}

impl IndexSelectPlan {
    pub fn new(plan: TablePlan, index_info: IndexInfo, value: Constant) -> Self {
        Self {
            plan,
            index_info,
            value,
        }
    }
}

impl Plan for IndexSelectPlan {
    fn open(&self) -> DbResult<Box<dyn Scan>> {
        let mut table_scan = self.plan.open_table_scan()?;
        match self.index_info.open() {
            Ok(index) => Ok(Box::new(IndexSelectScan::new(
                table_scan,
                Box::new(index),
                self.value.clone(),
            )?)),
            Err(e) => {
                table_scan.close();
                Err(e)
            }
        }
    }

    fn blocks_accessed(&self) -> usize {
        self.index_info.blocks_accessed() + self.records_output()
    }

    fn records_output(&self) -> usize {
        self.index_info.records_output()
    }

    fn distinct_values(&self, field_name: &str) -> usize {
        self.index_info.distinct_values(field_name)
    }

    fn schema(&self) -> &Schema {
        self.plan.schema()
    }
}

/// Copies the output of its input plan into a temporary table and scans that
pub struct MaterializePlan {
    txn: Arc<Transaction>,
    plan: Box<dyn Plan>,
    temp_names: Arc<TempNameGenerator>,
}

impl MaterializePlan {
    pub fn new(txn: Arc<Transaction>, plan: Box<dyn Plan>, temp_names: Arc<TempNameGenerator>) -> Self {
        Self {
            txn,
            plan,
            temp_names,
        }
    }

    /// Blocks needed to hold the output of `plan` in a temporary table
    pub fn materialized_blocks(plan: &dyn Plan, block_size: usize) -> usize {
        let layout = Layout::new(plan.schema().clone());
        let records_per_block = (block_size / layout.slot_size()).max(1);
        plan.records_output().div_ceil(records_per_block)
    }

    fn copy_into(&self, source: &mut dyn Scan, dest: &mut TableScan) -> DbResult<()> {
        while source.next()? {
            dest.insert()?;
            for field in &self.plan.schema().fields {
                dest.set_value(field, &source.get_value(field)?)?;
            }
        }
        dest.before_first()
    }
}

impl Plan for MaterializePlan {
    fn open(&self) -> DbResult<Box<dyn Scan>> {
        let temp = TempTable::new(
            Arc::clone(&self.txn),
            self.plan.schema().clone(),
            &self.temp_names,
        );
        let mut source = self.plan.open()?;
        let mut dest = temp.open()?;
        let result = self.copy_into(source.as_mut(), &mut dest);
        source.close();
        if let Err(e) = result {
            dest.close();
            return Err(e);
        }
        Ok(Box::new(dest))
    }

    /// The cost of reading the materialized copy, not of building it
    fn blocks_accessed(&self) -> usize {
        Self::materialized_blocks(self.plan.as_ref(), self.txn.block_size())
    }

    fn records_output(&self) -> usize {
        self.plan.records_output()
    }

    fn distinct_values(&self, field_name: &str) -> usize {
        self.plan.distinct_values(field_name)
    }

    fn schema(&self) -> &Schema {
        self.plan.schema()
    }
}

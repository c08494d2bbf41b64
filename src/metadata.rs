use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::{debug, info};

use crate::{
    BTreeIndex, DbError, DbResult, FieldType, Layout, Scan, Schema, TableScan,
    TempNameGenerator, Transaction, UpdateScan,
};

/// Longest table, field, view or index name the catalog stores
pub const MAX_NAME: usize = 16;

fn check_name(kind: &str, name: &str) -> DbResult<()> {
    if name.len() > MAX_NAME {
        return Err(DbError::SchemaViolation(format!(
            "{kind} name {name} is longer than {MAX_NAME} characters"
        )));
    }
    Ok(())
}

/// Tables and indexes own files, and files with the temporary prefix are removed on open
fn check_file_name(kind: &str, name: &str) -> DbResult<()> {
    check_name(kind, name)?;
    if name.starts_with(TempNameGenerator::PREFIX) {
        return Err(DbError::SchemaViolation(format!(
            "{kind} name {name} may not start with {}",
            TempNameGenerator::PREFIX
        )));
    }
    Ok(())
}

/// Stores table schemas in `tblcat` (one row per table) and `fldcat` (one row per field)
pub struct TableManager {
    table_catalog_layout: Layout,
    field_catalog_layout: Layout,
}

impl TableManager {
    const TABLE_CATALOG: &str = "tblcat";
    const FIELD_CATALOG: &str = "fldcat";

    pub fn new(is_new: bool, txn: &Arc<Transaction>) -> DbResult<Self> {
        let mut table_catalog_schema = Schema::new();
        table_catalog_schema.add_string_field("tblname", MAX_NAME);
        table_catalog_schema.add_int_field("slotsize");

        let mut field_catalog_schema = Schema::new();
        field_catalog_schema.add_string_field("tblname", MAX_NAME);
        field_catalog_schema.add_string_field("fldname", MAX_NAME);
        field_catalog_schema.add_int_field("type");
        field_catalog_schema.add_int_field("length");
        field_catalog_schema.add_int_field("offset");

        let table_manager = Self {
            table_catalog_layout: Layout::new(table_catalog_schema.clone()),
            field_catalog_layout: Layout::new(field_catalog_schema.clone()),
        };
        if is_new {
            table_manager.create_table(Self::TABLE_CATALOG, &table_catalog_schema, txn)?;
            table_manager.create_table(Self::FIELD_CATALOG, &field_catalog_schema, txn)?;
        }
        Ok(table_manager)
    }

    pub fn create_table(
        &self,
        table_name: &str,
        schema: &Schema,
        txn: &Arc<Transaction>,
    ) -> DbResult<()> {
        check_file_name("table", table_name)?;
        for field in &schema.fields {
            check_name("field", field)?;
        }
        let layout = Layout::new(schema.clone());

        let mut table_catalog = TableScan::new(
            Arc::clone(txn),
            Self::TABLE_CATALOG,
            self.table_catalog_layout.clone(),
        )?;
        let result = (|| -> DbResult<()> {
            table_catalog.insert()?;
            table_catalog.set_string("tblname", table_name)?;
            table_catalog.set_int("slotsize", layout.slot_size() as i32)
        })();
        table_catalog.close();
        result?;

        let mut field_catalog = TableScan::new(
            Arc::clone(txn),
            Self::FIELD_CATALOG,
            self.field_catalog_layout.clone(),
        )?;
        let result = (|| -> DbResult<()> {
            for field in &schema.fields {
                let info = &schema.info[field];
                field_catalog.insert()?;
                field_catalog.set_string("tblname", table_name)?;
                field_catalog.set_string("fldname", field)?;
                field_catalog.set_int("type", info.field_type.code())?;
                field_catalog.set_int("length", info.length as i32)?;
                let offset = layout.offset(field).unwrap_or_default();
                field_catalog.set_int("offset", offset as i32)?;
            }
            Ok(())
        })();
        field_catalog.close();
        result?;
        debug!(table = table_name, fields = schema.fields.len(), "created table");
        Ok(())
    }

    /// Rebuild the layout of a table from the catalog rows
    pub fn get_layout(&self, table_name: &str, txn: &Arc<Transaction>) -> DbResult<Layout> {
        let mut table_catalog = TableScan::new(
            Arc::clone(txn),
            Self::TABLE_CATALOG,
            self.table_catalog_layout.clone(),
        )?;
        let slot_size = (|| -> DbResult<Option<usize>> {
            while table_catalog.next()? {
                if table_catalog.get_string("tblname")? == table_name {
                    return Ok(Some(table_catalog.get_int("slotsize")? as usize));
                }
            }
            Ok(None)
        })();
        table_catalog.close();
        let slot_size = slot_size?
            .ok_or_else(|| DbError::Catalog(format!("table {table_name} not found")))?;

        let mut schema = Schema::new();
        let mut offsets = HashMap::new();
        let mut field_catalog = TableScan::new(
            Arc::clone(txn),
            Self::FIELD_CATALOG,
            self.field_catalog_layout.clone(),
        )?;
        let result = (|| -> DbResult<()> {
            while field_catalog.next()? {
                if field_catalog.get_string("tblname")? != table_name {
                    continue;
                }
                let field_name = field_catalog.get_string("fldname")?;
                let field_type = FieldType::from_code(field_catalog.get_int("type")?)?;
                let length = field_catalog.get_int("length")? as usize;
                let offset = field_catalog.get_int("offset")? as usize;
                offsets.insert(field_name.clone(), offset);
                schema.add_field(&field_name, field_type, length);
            }
            Ok(())
        })();
        field_catalog.close();
        result?;
        Ok(Layout::from_metadata(schema, offsets, slot_size))
    }

    pub fn get_table_names(&self, txn: &Arc<Transaction>) -> DbResult<Vec<String>> {
        let mut table_catalog = TableScan::new(
            Arc::clone(txn),
            Self::TABLE_CATALOG,
            self.table_catalog_layout.clone(),
        )?;
        let result = (|| -> DbResult<Vec<String>> {
            let mut names = Vec::new();
            while table_catalog.next()? {
                names.push(table_catalog.get_string("tblname")?);
            }
            Ok(names)
        })();
        table_catalog.close();
        result
    }
}

/// Stores view definitions as SQL text in `viewcat`
pub struct ViewManager {
    layout: Layout,
}

impl ViewManager {
    pub const MAX_VIEWDEF: usize = 100;
    const VIEW_CATALOG: &str = "viewcat";

    pub fn new(
        is_new: bool,
        table_manager: &TableManager,
        txn: &Arc<Transaction>,
    ) -> DbResult<Self> {
        let mut schema = Schema::new();
        schema.add_string_field("viewname", MAX_NAME);
        schema.add_string_field("viewdef", Self::MAX_VIEWDEF);
        if is_new {
            table_manager.create_table(Self::VIEW_CATALOG, &schema, txn)?;
        }
        Ok(Self {
            layout: Layout::new(schema),
        })
    }

    pub fn create_view(
        &self,
        view_name: &str,
        view_def: &str,
        txn: &Arc<Transaction>,
    ) -> DbResult<()> {
        check_name("view", view_name)?;
        if view_def.len() > Self::MAX_VIEWDEF {
            return Err(DbError::SchemaViolation(format!(
                "definition of view {view_name} is longer than {} characters",
                Self::MAX_VIEWDEF
            )));
        }
        let mut scan = TableScan::new(Arc::clone(txn), Self::VIEW_CATALOG, self.layout.clone())?;
        let result = (|| -> DbResult<()> {
            scan.insert()?;
            scan.set_string("viewname", view_name)?;
            scan.set_string("viewdef", view_def)
        })();
        scan.close();
        result
    }

    pub fn get_view_def(&self, view_name: &str, txn: &Arc<Transaction>) -> DbResult<Option<String>> {
        let mut scan = TableScan::new(Arc::clone(txn), Self::VIEW_CATALOG, self.layout.clone())?;
        let result = (|| -> DbResult<Option<String>> {
            while scan.next()? {
                if scan.get_string("viewname")? == view_name {
                    return Ok(Some(scan.get_string("viewdef")?));
                }
            }
            Ok(None)
        })();
        scan.close();
        result
    }
}

/// Size statistics for one table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatInfo {
    num_blocks: usize,
    num_records: usize,
}

impl StatInfo {
    pub fn new(num_blocks: usize, num_records: usize) -> Self {
        Self {
            num_blocks,
            num_records,
        }
    }

    pub fn blocks_accessed(&self) -> usize {
        self.num_blocks
    }

    pub fn records_output(&self) -> usize {
        self.num_records
    }

    /// A rough guess; the catalog keeps no per-field statistics
    pub fn distinct_values(&self, _field_name: &str) -> usize {
        1 + self.num_records / 3
    }
}

#[derive(Debug, Default)]
struct StatCache {
    table_stats: HashMap<String, StatInfo>,
    num_calls: usize,
}

/// Caches table statistics in memory, recomputing all of them every so often
pub struct StatManager {
    table_manager: Arc<TableManager>,
    cache: Mutex<StatCache>,
}

impl StatManager {
    const REFRESH_EVERY: usize = 100;

    pub fn new(table_manager: Arc<TableManager>, txn: &Arc<Transaction>) -> DbResult<Self> {
        let stat_manager = Self {
            table_manager,
            cache: Mutex::new(StatCache::default()),
        };
        {
            let mut cache = stat_manager.cache.lock().unwrap();
            stat_manager.refresh_statistics(&mut cache, txn)?;
        }
        Ok(stat_manager)
    }

    pub fn get_stat_info(
        &self,
        table_name: &str,
        layout: &Layout,
        txn: &Arc<Transaction>,
    ) -> DbResult<StatInfo> {
        let mut cache = self.cache.lock().unwrap();
        cache.num_calls += 1;
        if cache.num_calls > Self::REFRESH_EVERY {
            self.refresh_statistics(&mut cache, txn)?;
        }
        if let Some(stat_info) = cache.table_stats.get(table_name) {
            return Ok(*stat_info);
        }
        let stat_info = Self::calc_table_stats(table_name, layout, txn)?;
        cache.table_stats.insert(table_name.to_string(), stat_info);
        Ok(stat_info)
    }

    /// Drop every cached entry and recompute statistics for all cataloged tables
    pub fn refresh(&self, txn: &Arc<Transaction>) -> DbResult<()> {
        let mut cache = self.cache.lock().unwrap();
        self.refresh_statistics(&mut cache, txn)
    }

    fn refresh_statistics(&self, cache: &mut StatCache, txn: &Arc<Transaction>) -> DbResult<()> {
        cache.table_stats.clear();
        cache.num_calls = 0;
        for table_name in self.table_manager.get_table_names(txn)? {
            let layout = self.table_manager.get_layout(&table_name, txn)?;
            let stat_info = Self::calc_table_stats(&table_name, &layout, txn)?;
            cache.table_stats.insert(table_name, stat_info);
        }
        info!(tables = cache.table_stats.len(), "refreshed table statistics");
        Ok(())
    }

    fn calc_table_stats(
        table_name: &str,
        layout: &Layout,
        txn: &Arc<Transaction>,
    ) -> DbResult<StatInfo> {
        let mut scan = TableScan::new(Arc::clone(txn), table_name, layout.clone())?;
        let result = (|| -> DbResult<StatInfo> {
            let mut num_records = 0;
            let mut num_blocks = 0;
            while scan.next()? {
                num_records += 1;
                num_blocks = scan.get_rid().block_num + 1;
            }
            Ok(StatInfo::new(num_blocks, num_records))
        })();
        scan.close();
        result
    }
}

/// Everything the planner needs to know about one index
#[derive(Clone)]
pub struct IndexInfo {
    index_name: String,
    field_name: String,
    txn: Arc<Transaction>,
    index_layout: Layout,
    stat_info: StatInfo,
}

impl IndexInfo {
    pub const BLOCK_FIELD: &str = "block";
    pub const ID_FIELD: &str = "id";
    pub const DATA_FIELD: &str = "dataval";

    pub fn new(
        index_name: &str,
        field_name: &str,
        table_schema: &Schema,
        txn: Arc<Transaction>,
        stat_info: StatInfo,
    ) -> DbResult<Self> {
        let field_type = table_schema.field_type(field_name).ok_or_else(|| {
            DbError::Catalog(format!(
                "index {index_name} is on unknown field {field_name}"
            ))
        })?;
        let length = table_schema.length(field_name).unwrap_or_default();
        Ok(Self {
            index_name: index_name.to_string(),
            field_name: field_name.to_string(),
            txn,
            index_layout: Self::leaf_layout(field_type, length),
            stat_info,
        })
    }

    /// The layout of a leaf record: the rid of the data record and the indexed value
    pub fn leaf_layout(field_type: FieldType, length: usize) -> Layout {
        let mut schema = Schema::new();
        schema.add_int_field(Self::BLOCK_FIELD);
        schema.add_int_field(Self::ID_FIELD);
        schema.add_field(Self::DATA_FIELD, field_type, length);
        Layout::new(schema)
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    pub fn open(&self) -> DbResult<BTreeIndex> {
        BTreeIndex::new(
            Arc::clone(&self.txn),
            &self.index_name,
            self.index_layout.clone(),
        )
    }

    pub fn blocks_accessed(&self) -> usize {
        let records_per_block = self.txn.block_size() / self.index_layout.slot_size();
        let num_blocks = self.stat_info.records_output() / records_per_block.max(1);
        BTreeIndex::search_cost(num_blocks, records_per_block)
    }

    pub fn records_output(&self) -> usize {
        self.stat_info.records_output() / self.stat_info.distinct_values(&self.field_name)
    }

    pub fn distinct_values(&self, field_name: &str) -> usize {
        if self.field_name == field_name {
            1
        } else {
            self.stat_info.distinct_values(field_name)
        }
    }
}

/// Stores index definitions in `idxcat`
pub struct IndexManager {
    layout: Layout,
    table_manager: Arc<TableManager>,
    stat_manager: Arc<StatManager>,
}

impl IndexManager {
    const INDEX_CATALOG: &str = "idxcat";

    pub fn new(
        is_new: bool,
        table_manager: Arc<TableManager>,
        stat_manager: Arc<StatManager>,
        txn: &Arc<Transaction>,
    ) -> DbResult<Self> {
        let mut schema = Schema::new();
        schema.add_string_field("indexname", MAX_NAME);
        schema.add_string_field("tablename", MAX_NAME);
        schema.add_string_field("fieldname", MAX_NAME);
        if is_new {
            table_manager.create_table(Self::INDEX_CATALOG, &schema, txn)?;
        }
        Ok(Self {
            layout: Layout::new(schema),
            table_manager,
            stat_manager,
        })
    }

    pub fn create_index(
        &self,
        index_name: &str,
        table_name: &str,
        field_name: &str,
        txn: &Arc<Transaction>,
    ) -> DbResult<()> {
        check_file_name("index", index_name)?;
        let layout = self.table_manager.get_layout(table_name, txn)?;
        if !layout.schema.has_field(field_name) {
            return Err(DbError::Catalog(format!(
                "table {table_name} has no field {field_name}"
            )));
        }
        let mut scan = TableScan::new(Arc::clone(txn), Self::INDEX_CATALOG, self.layout.clone())?;
        let result = (|| -> DbResult<()> {
            scan.insert()?;
            scan.set_string("indexname", index_name)?;
            scan.set_string("tablename", table_name)?;
            scan.set_string("fieldname", field_name)
        })();
        scan.close();
        result
    }

    /// The indexes on a table, keyed by the indexed field
    pub fn get_index_info(
        &self,
        table_name: &str,
        txn: &Arc<Transaction>,
    ) -> DbResult<HashMap<String, IndexInfo>> {
        let mut entries = Vec::new();
        let mut scan = TableScan::new(Arc::clone(txn), Self::INDEX_CATALOG, self.layout.clone())?;
        let result = (|| -> DbResult<()> {
            while scan.next()? {
                if scan.get_string("tablename")? == table_name {
                    entries.push((scan.get_string("indexname")?, scan.get_string("fieldname")?));
                }
            }
            Ok(())
        })();
        scan.close();
        result?;

        let mut indexes = HashMap::new();
        if entries.is_empty() {
            return Ok(indexes);
        }
        let layout = self.table_manager.get_layout(table_name, txn)?;
        let stat_info = self.stat_manager.get_stat_info(table_name, &layout, txn)?;
        for (index_name, field_name) in entries {
            let index_info = IndexInfo::new(
                &index_name,
                &field_name,
                &layout.schema,
                Arc::clone(txn),
                stat_info,
            )?;
            indexes.insert(field_name, index_info);
        }
        Ok(indexes)
    }
}

/// One entry point for the table, view, statistics and index catalogs
pub struct MetadataManager {
    table_manager: Arc<TableManager>,
    view_manager: ViewManager,
    stat_manager: Arc<StatManager>,
    index_manager: IndexManager,
}

impl MetadataManager {
    pub fn new(is_new: bool, txn: &Arc<Transaction>) -> DbResult<Self> {
        let table_manager = Arc::new(TableManager::new(is_new, txn)?);
        let view_manager = ViewManager::new(is_new, &table_manager, txn)?;
        let stat_manager = Arc::new(StatManager::new(Arc::clone(&table_manager), txn)?);
        let index_manager = IndexManager::new(
            is_new,
            Arc::clone(&table_manager),
            Arc::clone(&stat_manager),
            txn,
        )?;
        Ok(Self {
            table_manager,
            view_manager,
            stat_manager,
            index_manager,
        })
    }

    pub fn create_table(
        &self,
        table_name: &str,
        schema: &Schema,
        txn: &Arc<Transaction>,
    ) -> DbResult<()> {
        self.table_manager.create_table(table_name, schema, txn)
    }

    pub fn get_layout(&self, table_name: &str, txn: &Arc<Transaction>) -> DbResult<Layout> {
        self.table_manager.get_layout(table_name, txn)
    }

    pub fn get_table_names(&self, txn: &Arc<Transaction>) -> DbResult<Vec<String>> {
        self.table_manager.get_table_names(txn)
    }

    pub fn create_view(
        &self,
        view_name: &str,
        view_def: &str,
        txn: &Arc<Transaction>,
    ) -> DbResult<()> {
        self.view_manager.create_view(view_name, view_def, txn)
    }

    pub fn get_view_def(&self, view_name: &str, txn: &Arc<Transaction>) -> DbResult<Option<String>> {
        self.view_manager.get_view_def(view_name, txn)
    }

    pub fn create_index(
        &self,
        index_name: &str,
        table_name: &str,
        field_name: &str,
        txn: &Arc<Transaction>,
    ) -> DbResult<()> {
        self.index_manager
            .create_index(index_name, table_name, field_name, txn)
    }

    pub fn get_index_info(
        &self,
        table_name: &str,
        txn: &Arc<Transaction>,
    ) -> DbResult<HashMap<String, IndexInfo>> {
        self.index_manager.get_index_info(table_name, txn)
    }

    pub fn get_stat_info(
        &self,
        table_name: &str,
        layout: &Layout,
        txn: &Arc<Transaction>,
    ) -> DbResult<StatInfo> {
        self.stat_manager.get_stat_info(table_name, layout, txn)
    }

    pub fn refresh_statistics(&self, txn: &Arc<Transaction>) -> DbResult<()> {
        self.stat_manager.refresh(txn)
    }
}

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use tracing::info;

mod btree;
mod buffer_manager;
mod concurrency;
mod config;
mod error;
mod file_manager;
mod index_scan;
mod log_manager;
mod metadata;
mod parser;
mod plan;
mod planner;
mod record;
mod recovery;
mod scan;
mod temp_table;
#[cfg(test)]
mod test_utils;
mod transaction;

pub use btree::{BTreeDir, BTreeIndex, BTreeLeaf, BTreePage, DirEntry, Index};
pub use buffer_manager::{Buffer, BufferManager, BufferStats, FrameInfo};
pub use concurrency::{ConcurrencyManager, LockTable, LockType};
pub use config::DbConfig;
pub use error::{DbError, DbResult};
pub use file_manager::{BlockId, FileManager, Page};
pub use index_scan::IndexSelectScan;
pub use log_manager::{LogIterator, LogManager, Lsn};
pub use metadata::{
    IndexInfo, IndexManager, MetadataManager, StatInfo, StatManager, TableManager, ViewManager,
    MAX_NAME,
};
pub use parser::{
    CreateIndexData, CreateTableData, CreateViewData, DeleteData, InsertData, Lexer, ModifyData,
    Parser, QueryData, SQLStatement, Token,
};
pub use plan::{
    IndexSelectPlan, MaterializePlan, Plan, ProductPlan, ProjectPlan, SelectPlan, TablePlan,
};
pub use planner::{
    BasicQueryPlanner, BasicUpdatePlanner, IndexUpdatePlanner, Planner, QueryPlanner,
    UpdatePlanner,
};
pub use record::{FieldInfo, FieldType, Layout, RecordPage, Schema, TableScan, RID};
pub use recovery::{LogRecord, RecoveryManager};
pub use scan::{
    Constant, Expression, Predicate, ProductScan, ProjectScan, Scan, SelectScan, Term, UpdateScan,
};
pub use temp_table::{TempNameGenerator, TempTable};
pub use transaction::{
    BufferList, Transaction, TransactionID, TransactionOperations, TxIdGenerator,
};

#[cfg(test)]
use test_utils::TestDir;

/// The database struct
/// Owns the process-wide managers and hands out transactions over them
pub struct SimpleDB {
    file_manager: Arc<FileManager>,
    log_manager: Arc<Mutex<LogManager>>,
    buffer_manager: Arc<BufferManager>,
    lock_table: Arc<LockTable>,
    tx_id_generator: Arc<TxIdGenerator>,
    temp_names: Arc<TempNameGenerator>,
    metadata_manager: Arc<MetadataManager>,
    planner: Planner,
}

impl SimpleDB {
    pub fn new<P: AsRef<Path>>(path: P, block_size: usize, num_buffers: usize) -> DbResult<Self> {
        Self::with_config(path, DbConfig::new(block_size, num_buffers))
    }

    /// Open the database in `path`, creating it if the directory does not exist
    /// An existing database is recovered before anything else touches it
    pub fn with_config<P: AsRef<Path>>(path: P, config: DbConfig) -> DbResult<Self> {
        let file_manager = Arc::new(FileManager::new(path.as_ref(), config.block_size)?);
        let log_manager = Arc::new(Mutex::new(LogManager::new(
            Arc::clone(&file_manager),
            &config.log_file,
        )?));
        let buffer_manager = Arc::new(BufferManager::new(
            Arc::clone(&file_manager),
            Arc::clone(&log_manager),
            config.num_buffers,
            config.buffer_wait,
        ));
        let lock_table = Arc::new(LockTable::new(config.lock_timeout));
        let tx_id_generator = Arc::new(TxIdGenerator::new());

        let is_new = file_manager.is_new();
        let tx = Arc::new(Transaction::new(
            Arc::clone(&file_manager),
            Arc::clone(&log_manager),
            Arc::clone(&buffer_manager),
            Arc::clone(&lock_table),
            &tx_id_generator,
        )?);
        let boot = || -> DbResult<MetadataManager> {
            if is_new {
                info!(path = %file_manager.db_directory().display(), "creating new database");
            } else {
                info!(path = %file_manager.db_directory().display(), "recovering existing database");
                tx.recover()?;
            }
            MetadataManager::new(is_new, &tx)
        };
        let metadata_manager = match boot() {
            Ok(metadata_manager) => Arc::new(metadata_manager),
            Err(e) => {
                tx.rollback()?;
                return Err(e);
            }
        };
        tx.commit()?;

        let temp_names = Arc::new(TempNameGenerator::new());
        let planner = Planner::new(
            Box::new(BasicQueryPlanner::new(
                Arc::clone(&metadata_manager),
                Arc::clone(&temp_names),
            )),
            Box::new(IndexUpdatePlanner::new(Arc::clone(&metadata_manager))),
        );
        Ok(Self {
            file_manager,
            log_manager,
            buffer_manager,
            lock_table,
            tx_id_generator,
            temp_names,
            metadata_manager,
            planner,
        })
    }

    /// A database in a fresh temporary directory that is removed when the [`TestDir`] drops
    #[cfg(test)]
    pub fn new_for_test(
        block_size: usize,
        num_buffers: usize,
        lock_timeout_ms: u64,
    ) -> (Self, TestDir) {
        let test_dir = TestDir::new();
        let wait = std::time::Duration::from_millis(lock_timeout_ms);
        let config = DbConfig::new(block_size, num_buffers)
            .with_lock_timeout(wait)
            .with_buffer_wait(wait);
        let db = Self::with_config(test_dir.path().join("db"), config).unwrap();
        (db, test_dir)
    }

    pub fn new_tx(&self) -> DbResult<Arc<Transaction>> {
        Ok(Arc::new(Transaction::new(
            Arc::clone(&self.file_manager),
            Arc::clone(&self.log_manager),
            Arc::clone(&self.buffer_manager),
            Arc::clone(&self.lock_table),
            &self.tx_id_generator,
        )?))
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn metadata_manager(&self) -> &Arc<MetadataManager> {
        &self.metadata_manager
    }

    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.buffer_manager
    }

    pub fn file_manager(&self) -> &Arc<FileManager> {
        &self.file_manager
    }

    pub fn log_manager(&self) -> &Arc<Mutex<LogManager>> {
        &self.log_manager
    }

    pub fn temp_names(&self) -> &Arc<TempNameGenerator> {
        &self.temp_names
    }

    pub fn db_directory(&self) -> &Path {
        self.file_manager.db_directory()
    }
}

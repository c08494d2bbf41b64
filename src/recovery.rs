use std::{
    collections::HashSet,
    fmt::Display,
    sync::{Arc, Mutex},
};

use tracing::{debug, info};

use crate::{
    BlockId, Buffer, BufferManager, DbError, DbResult, LogManager, Lsn, Page, TransactionID,
    TransactionOperations,
};

/// The container for all the different types of log records that are written to the WAL
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Start(TransactionID),
    Commit(TransactionID),
    Rollback(TransactionID),
    Checkpoint,
    SetInt {
        txnum: TransactionID,
        block_id: BlockId,
        offset: usize,
        old_val: i32,
    },
    SetString {
        txnum: TransactionID,
        block_id: BlockId,
        offset: usize,
        old_val: String,
    },
}

impl Display for LogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogRecord::Start(txnum) => write!(f, "Start({})", txnum),
            LogRecord::Commit(txnum) => write!(f, "Commit({})", txnum),
            LogRecord::Rollback(txnum) => write!(f, "Rollback({})", txnum),
            LogRecord::Checkpoint => write!(f, "Checkpoint"),
            LogRecord::SetInt {
                txnum,
                block_id,
                offset,
                old_val,
            } => write!(
                f,
                "SetInt(txnum: {}, block_id: {}, offset: {}, old_val: {})",
                txnum, block_id, offset, old_val
            ),
            LogRecord::SetString {
                txnum,
                block_id,
                offset,
                old_val,
            } => write!(
                f,
                "SetString(txnum: {}, block_id: {}, offset: {}, old_val: {})",
                txnum, block_id, offset, old_val
            ),
        }
    }
}

/// Bounds-checked cursor over the bytes of one log record
struct RecordReader {
    page: Page,
    pos: usize,
}

impl RecordReader {
    fn int(&mut self) -> DbResult<i32> {
        if self.pos + Page::INT_BYTES > self.page.size() {
            return Err(DbError::LogCorruption(format!(
                "record truncated at byte {}",
                self.pos
            )));
        }
        let value = self.page.get_int(self.pos);
        self.pos += Page::INT_BYTES;
        Ok(value)
    }

    fn non_negative(&mut self) -> DbResult<usize> {
        let value = self.int()?;
        usize::try_from(value)
            .map_err(|_| DbError::LogCorruption(format!("negative field {value} in record")))
    }

    fn string(&mut self) -> DbResult<String> {
        let start = self.pos;
        let len = self.non_negative()?;
        if self.pos + len > self.page.size() {
            return Err(DbError::LogCorruption(format!(
                "string of {len} bytes overruns record"
            )));
        }
        self.pos += len;
        Ok(self.page.get_string(start))
    }

    fn block_id(&mut self) -> DbResult<BlockId> {
        let filename = self.string()?;
        let block_num = self.non_negative()?;
        Ok(BlockId::new(filename, block_num))
    }
}

impl LogRecord {
    pub const START: i32 = 0;
    pub const COMMIT: i32 = 1;
    pub const ROLLBACK: i32 = 2;
    pub const CHECKPOINT: i32 = 3;
    pub const SETINT: i32 = 4;
    pub const SETSTRING: i32 = 5;

    /// The discriminator written in the first int of the record
    pub fn op(&self) -> i32 {
        match self {
            LogRecord::Start(_) => Self::START,
            LogRecord::Commit(_) => Self::COMMIT,
            LogRecord::Rollback(_) => Self::ROLLBACK,
            LogRecord::Checkpoint => Self::CHECKPOINT,
            LogRecord::SetInt { .. } => Self::SETINT,
            LogRecord::SetString { .. } => Self::SETSTRING,
        }
    }

    /// Get the transaction number associated with this log record
    pub fn tx_number(&self) -> Option<TransactionID> {
        match self {
            LogRecord::Checkpoint => None,
            LogRecord::Start(txnum) | LogRecord::Commit(txnum) | LogRecord::Rollback(txnum) => {
                Some(*txnum)
            }
            LogRecord::SetInt { txnum, .. } | LogRecord::SetString { txnum, .. } => Some(*txnum),
        }
    }

    fn size(&self) -> usize {
        let location_size =
            |block_id: &BlockId| Page::max_length(block_id.filename.len()) + Page::INT_BYTES;
        Page::INT_BYTES
            + match self {
                LogRecord::Checkpoint => 0,
                LogRecord::Start(_) | LogRecord::Commit(_) | LogRecord::Rollback(_) => {
                    Page::INT_BYTES
                }
                LogRecord::SetInt { block_id, .. } => {
                    Page::INT_BYTES + location_size(block_id) + 2 * Page::INT_BYTES
                }
                LogRecord::SetString {
                    block_id, old_val, ..
                } => {
                    Page::INT_BYTES
                        + location_size(block_id)
                        + Page::INT_BYTES
                        + Page::max_length(old_val.len())
                }
            }
    }

    pub fn to_bytes(&self) -> DbResult<Vec<u8>> {
        let mut page = Page::new(self.size());
        page.set_int(0, self.op());
        let mut pos = Page::INT_BYTES;
        match self {
            LogRecord::Checkpoint => {}
            LogRecord::Start(txnum) | LogRecord::Commit(txnum) | LogRecord::Rollback(txnum) => {
                page.set_int(pos, *txnum as i32);
            }
            LogRecord::SetInt {
                txnum,
                block_id,
                offset,
                old_val,
            } => {
                pos = Self::write_location(&mut page, pos, *txnum, block_id, *offset)?;
                page.set_int(pos, *old_val);
            }
            LogRecord::SetString {
                txnum,
                block_id,
                offset,
                old_val,
            } => {
                pos = Self::write_location(&mut page, pos, *txnum, block_id, *offset)?;
                page.set_string(pos, old_val)?;
            }
        }
        Ok(page.contents)
    }

    fn write_location(
        page: &mut Page,
        mut pos: usize,
        txnum: TransactionID,
        block_id: &BlockId,
        offset: usize,
    ) -> DbResult<usize> {
        page.set_int(pos, txnum as i32);
        pos += Page::INT_BYTES;
        page.set_string(pos, &block_id.filename)?;
        pos += Page::max_length(block_id.filename.len());
        page.set_int(pos, block_id.block_num as i32);
        pos += Page::INT_BYTES;
        page.set_int(pos, offset as i32);
        Ok(pos + Page::INT_BYTES)
    }

    /// Read the bytes from the log file and deserialize them into a [`LogRecord`]
    pub fn from_bytes(bytes: Vec<u8>) -> DbResult<LogRecord> {
        let mut reader = RecordReader {
            page: Page::from_bytes(bytes),
            pos: 0,
        };
        let record = match reader.int()? {
            Self::START => LogRecord::Start(reader.non_negative()? as TransactionID),
            Self::COMMIT => LogRecord::Commit(reader.non_negative()? as TransactionID),
            Self::ROLLBACK => LogRecord::Rollback(reader.non_negative()? as TransactionID),
            Self::CHECKPOINT => LogRecord::Checkpoint,
            Self::SETINT => LogRecord::SetInt {
                txnum: reader.non_negative()? as TransactionID,
                block_id: reader.block_id()?,
                offset: reader.non_negative()?,
                old_val: reader.int()?,
            },
            Self::SETSTRING => LogRecord::SetString {
                txnum: reader.non_negative()? as TransactionID,
                block_id: reader.block_id()?,
                offset: reader.non_negative()?,
                old_val: reader.string()?,
            },
            other => {
                return Err(DbError::LogCorruption(format!(
                    "unknown log record type {other}"
                )))
            }
        };
        Ok(record)
    }

    /// Serialize the log record to bytes and write it to the log file
    pub fn write_log_record(&self, log_manager: &Mutex<LogManager>) -> DbResult<Lsn> {
        log_manager.lock().unwrap().append(&self.to_bytes()?)
    }

    /// Undo the operation performed by this log record
    /// Only value-setting records carry anything to undo
    pub fn undo(&self, tx: &dyn TransactionOperations) -> DbResult<()> {
        match self {
            LogRecord::Start(_)
            | LogRecord::Commit(_)
            | LogRecord::Rollback(_)
            | LogRecord::Checkpoint => Ok(()),
            LogRecord::SetInt {
                block_id,
                offset,
                old_val,
                ..
            } => {
                tx.pin(block_id)?;
                tx.set_int(block_id, *offset, *old_val, false)?;
                tx.unpin(block_id);
                Ok(())
            }
            LogRecord::SetString {
                block_id,
                offset,
                old_val,
                ..
            } => {
                tx.pin(block_id)?;
                tx.set_string(block_id, *offset, old_val, false)?;
                tx.unpin(block_id);
                Ok(())
            }
        }
    }
}


/// The container for the recovery manager - a [`Transaction`](crate::Transaction) uses a unique instance of this to
/// manage writing records to WAL and handling recovery & rollback
#[derive(Debug)]
pub struct RecoveryManager {
    tx_num: TransactionID,
    log_manager: Arc<Mutex<LogManager>>,
    buffer_manager: Arc<BufferManager>,
}

impl RecoveryManager {
    /// Creating a recovery manager logs the start of its transaction
    pub fn new(
        tx_num: TransactionID,
        log_manager: Arc<Mutex<LogManager>>,
        buffer_manager: Arc<BufferManager>,
    ) -> DbResult<Self> {
        LogRecord::Start(tx_num).write_log_record(&log_manager)?;
        Ok(Self {
            tx_num,
            log_manager,
            buffer_manager,
        })
    }

    /// Commit the transaction
    /// It flushes all the buffers associated with this transaction
    /// It creates and writes a new [`LogRecord::Commit`] record to the WAL
    /// It then forces a flush on the WAL to ensure logs are committed
    pub fn commit(&self) -> DbResult<()> {
        self.buffer_manager.flush_all(self.tx_num)?;
        self.write_and_flush(LogRecord::Commit(self.tx_num))
    }

    /// Rollback the transaction associated with this [`RecoveryManager`] instance
    /// Iterate over the WAL records in reverse order and undo any modifications done for this transaction,
    /// stopping at its start record. Then flush its buffers and log the rollback
    pub fn rollback(&self, tx: &dyn TransactionOperations) -> DbResult<()> {
        let log_iter = self.log_manager.lock().unwrap().iterator()?;
        for bytes in log_iter {
            let record = LogRecord::from_bytes(bytes?)?;
            if record.tx_number() != Some(self.tx_num) {
                continue;
            }
            if let LogRecord::Start(_) = record {
                break;
            }
            debug!(%record, "undoing");
            record.undo(tx)?;
        }
        self.buffer_manager.flush_all(self.tx_num)?;
        self.write_and_flush(LogRecord::Rollback(self.tx_num))
    }

    /// Recover the database from the last [`LogRecord::Checkpoint`]
    /// Find all the incomplete transactions and undo their operations
    /// Write a quiescent [`LogRecord::Checkpoint`] to the log and flush it
    pub fn recover(&self, tx: &dyn TransactionOperations) -> DbResult<()> {
        let log_iter = self.log_manager.lock().unwrap().iterator()?;
        let mut finished_txns: HashSet<TransactionID> = HashSet::new();
        let mut undone = 0;
        for bytes in log_iter {
            let record = LogRecord::from_bytes(bytes?)?;
            match &record {
                LogRecord::Checkpoint => break,
                LogRecord::Commit(txnum) | LogRecord::Rollback(txnum) => {
                    finished_txns.insert(*txnum);
                }
                LogRecord::Start(_) => {}
                LogRecord::SetInt { txnum, .. } | LogRecord::SetString { txnum, .. } => {
                    if !finished_txns.contains(txnum) {
                        record.undo(tx)?;
                        undone += 1;
                    }
                }
            }
        }
        info!(undone, "recovery undo pass finished");
        self.buffer_manager.flush_all(self.tx_num)?;
        self.write_and_flush(LogRecord::Checkpoint)
    }

    /// Write the [`LogRecord`] holding the before-image of an int in a [`Buffer`]
    pub fn set_int(&self, buffer: &Buffer, offset: usize) -> DbResult<Lsn> {
        let record = LogRecord::SetInt {
            txnum: self.tx_num,
            block_id: Self::assigned_block(buffer),
            offset,
            old_val: buffer.contents().get_int(offset),
        };
        record.write_log_record(&self.log_manager)
    }

    /// Write the [`LogRecord`] holding the before-image of a string in a [`Buffer`]
    pub fn set_string(&self, buffer: &Buffer, offset: usize) -> DbResult<Lsn> {
        let record = LogRecord::SetString {
            txnum: self.tx_num,
            block_id: Self::assigned_block(buffer),
            offset,
            old_val: buffer.contents().get_string(offset),
        };
        record.write_log_record(&self.log_manager)
    }

    fn assigned_block(buffer: &Buffer) -> BlockId {
        buffer
            .block_id()
            .cloned()
            .unwrap_or_else(|| panic!("logging a write to a buffer with no block"))
    }

    fn write_and_flush(&self, record: LogRecord) -> DbResult<()> {
        let lsn = record.write_log_record(&self.log_manager)?;
        self.log_manager.lock().unwrap().flush_lsn(lsn)
    }
}

#[cfg(test)]
mod recovery_manager_tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use crate::{
        test_utils::TestDir, BlockId, BufferManager, DbResult, FileManager, LogManager, LogRecord,
        RecoveryManager, TransactionOperations,
    };

    struct MockTransaction {
        modified_ints: Mutex<Vec<(BlockId, usize, i32)>>,
        modified_strings: Mutex<Vec<(BlockId, usize, String)>>,
    }

    impl MockTransaction {
        fn new() -> Self {
            Self {
                modified_ints: Mutex::new(Vec::new()),
                modified_strings: Mutex::new(Vec::new()),
            }
        }
    }

    impl TransactionOperations for MockTransaction {
        fn pin(&self, _block_id: &BlockId) -> DbResult<()> {
            Ok(())
        }

        fn unpin(&self, _block_id: &BlockId) {}

        fn set_int(&self, block_id: &BlockId, offset: usize, val: i32, log: bool) -> DbResult<()> {
            assert!(!log, "undo must not log");
            self.modified_ints
                .lock()
                .unwrap()
                .push((block_id.clone(), offset, val));
            Ok(())
        }

        fn set_string(
            &self,
            block_id: &BlockId,
            offset: usize,
            val: &str,
            log: bool,
        ) -> DbResult<()> {
            assert!(!log, "undo must not log");
            self.modified_strings
                .lock()
                .unwrap()
                .push((block_id.clone(), offset, val.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        _dir: TestDir,
        log_manager: Arc<Mutex<LogManager>>,
        buffer_manager: Arc<BufferManager>,
    }

    fn setup() -> Fixture {
        let dir = TestDir::new();
        let file_manager = Arc::new(FileManager::new(&dir.path().join("db"), 400).unwrap());
        let log_manager = Arc::new(Mutex::new(
            LogManager::new(Arc::clone(&file_manager), "simpledb.log").unwrap(),
        ));
        let buffer_manager = Arc::new(BufferManager::new(
            file_manager,
            Arc::clone(&log_manager),
            3,
            Duration::from_millis(100),
        ));
        Fixture {
            _dir: dir,
            log_manager,
            buffer_manager,
        }
    }

    fn set_int(txnum: u64, block: usize, offset: usize, old_val: i32) -> LogRecord {
        LogRecord::SetInt {
            txnum,
            block_id: BlockId::new("test.tbl".to_string(), block),
            offset,
            old_val,
        }
    }

    fn records(log_manager: &Mutex<LogManager>) -> Vec<LogRecord> {
        log_manager
            .lock()
            .unwrap()
            .iterator()
            .unwrap()
            .map(|bytes| LogRecord::from_bytes(bytes.unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn test_new_writes_start_record() {
        let fx = setup();
        let _rm = RecoveryManager::new(
            5,
            Arc::clone(&fx.log_manager),
            Arc::clone(&fx.buffer_manager),
        )
        .unwrap();
        assert_eq!(records(&fx.log_manager), vec![LogRecord::Start(5)]);
    }

    #[test]
    fn test_rollback_undoes_own_records_newest_first() {
        let fx = setup();
        let other = RecoveryManager::new(
            2,
            Arc::clone(&fx.log_manager),
            Arc::clone(&fx.buffer_manager),
        )
        .unwrap();
        let rm = RecoveryManager::new(
            1,
            Arc::clone(&fx.log_manager),
            Arc::clone(&fx.buffer_manager),
        )
        .unwrap();
        set_int(1, 1, 0, 100).write_log_record(&fx.log_manager).unwrap();
        set_int(2, 1, 8, 555).write_log_record(&fx.log_manager).unwrap();
        set_int(1, 1, 0, 200).write_log_record(&fx.log_manager).unwrap();
        LogRecord::SetString {
            txnum: 1,
            block_id: BlockId::new("test.tbl".to_string(), 2),
            offset: 40,
            old_val: "Hello World".to_string(),
        }
        .write_log_record(&fx.log_manager)
        .unwrap();

        let mock_tx = MockTransaction::new();
        rm.rollback(&mock_tx).unwrap();

        let block_1 = BlockId::new("test.tbl".to_string(), 1);
        assert_eq!(
            *mock_tx.modified_ints.lock().unwrap(),
            vec![(block_1.clone(), 0, 200), (block_1, 0, 100)]
        );
        assert_eq!(
            *mock_tx.modified_strings.lock().unwrap(),
            vec![(
                BlockId::new("test.tbl".to_string(), 2),
                40,
                "Hello World".to_string()
            )]
        );
        assert_eq!(records(&fx.log_manager)[0], LogRecord::Rollback(1));
        drop(other);
    }

    #[test]
    fn test_recover_skips_finished_and_stops_at_checkpoint() {
        let fx = setup();
        set_int(9, 1, 0, -1).write_log_record(&fx.log_manager).unwrap();
        LogRecord::Checkpoint
            .write_log_record(&fx.log_manager)
            .unwrap();
        //  committed
        set_int(1, 1, 0, 10).write_log_record(&fx.log_manager).unwrap();
        LogRecord::Commit(1).write_log_record(&fx.log_manager).unwrap();
        //  rolled back
        set_int(2, 1, 4, 20).write_log_record(&fx.log_manager).unwrap();
        LogRecord::Rollback(2)
            .write_log_record(&fx.log_manager)
            .unwrap();
        //  never finished
        set_int(3, 1, 8, 30).write_log_record(&fx.log_manager).unwrap();

        let rm = RecoveryManager::new(
            4,
            Arc::clone(&fx.log_manager),
            Arc::clone(&fx.buffer_manager),
        )
        .unwrap();
        let mock_tx = MockTransaction::new();
        rm.recover(&mock_tx).unwrap();

        assert_eq!(
            *mock_tx.modified_ints.lock().unwrap(),
            vec![(BlockId::new("test.tbl".to_string(), 1), 8, 30)]
        );
        assert_eq!(records(&fx.log_manager)[0], LogRecord::Checkpoint);
    }

    #[test]
    fn test_commit_flushes_log() {
        let fx = setup();
        let rm = RecoveryManager::new(
            1,
            Arc::clone(&fx.log_manager),
            Arc::clone(&fx.buffer_manager),
        )
        .unwrap();
        rm.commit().unwrap();
        let log_manager = fx.log_manager.lock().unwrap();
        assert_eq!(log_manager.last_saved_lsn(), log_manager.latest_lsn());
    }
}

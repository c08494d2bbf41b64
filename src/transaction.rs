use std::{
    cell::RefCell,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tracing::{debug, info};

use crate::{
    BlockId, Buffer, BufferManager, ConcurrencyManager, DbError, DbResult, FileManager,
    LockTable, LogManager, Page, RecoveryManager,
};

pub type TransactionID = u64;

/// The operations log records need in order to undo themselves
pub trait TransactionOperations {
    fn pin(&self, block_id: &BlockId) -> DbResult<()>;
    fn unpin(&self, block_id: &BlockId);
    fn set_int(&self, block_id: &BlockId, offset: usize, val: i32, log: bool) -> DbResult<()>;
    fn set_string(&self, block_id: &BlockId, offset: usize, val: &str, log: bool)
        -> DbResult<()>;
}

impl TransactionOperations for Transaction {
    fn pin(&self, block_id: &BlockId) -> DbResult<()> {
        Transaction::pin(self, block_id)
    }

    fn unpin(&self, block_id: &BlockId) {
        Transaction::unpin(self, block_id);
    }

    fn set_int(&self, block_id: &BlockId, offset: usize, val: i32, log: bool) -> DbResult<()> {
        Transaction::set_int(self, block_id, offset, val, log)
    }

    fn set_string(
        &self,
        block_id: &BlockId,
        offset: usize,
        val: &str,
        log: bool,
    ) -> DbResult<()> {
        Transaction::set_string(self, block_id, offset, val, log)
    }
}

/// The timestamp oracle which will generate unique timestamps for each transaction
/// in a monotonically increasing fashion, starting at 1
#[derive(Debug)]
pub struct TxIdGenerator {
    next_id: AtomicU64,
}

impl TxIdGenerator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> TransactionID {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for TxIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrapper for the value contained in the hash map of the [`BufferList`]
#[derive(Debug)]
struct HashMapValue {
    buffer: Arc<Mutex<Buffer>>,
    count: usize,
}

/// A wrapper to maintain the list of [`Buffer`] being used by the [`Transaction`]
/// It uses the [`BufferManager`] internally to maintain metadata
#[derive(Debug)]
pub struct BufferList {
    buffers: RefCell<HashMap<BlockId, HashMapValue>>,
    buffer_manager: Arc<BufferManager>,
}

impl BufferList {
    pub fn new(buffer_manager: Arc<BufferManager>) -> Self {
        Self {
            buffers: RefCell::new(HashMap::new()),
            buffer_manager,
        }
    }

    /// Get the buffer associated with the provided block_id
    pub fn get_buffer(&self, block_id: &BlockId) -> Option<Arc<Mutex<Buffer>>> {
        self.buffers
            .borrow()
            .get(block_id)
            .map(|v| Arc::clone(&v.buffer))
    }

    /// How many times this transaction has pinned the block
    pub fn pin_count(&self, block_id: &BlockId) -> usize {
        self.buffers.borrow().get(block_id).map_or(0, |v| v.count)
    }

    /// Pin the buffer associated with the provided [`BlockId`]
    pub fn pin(&self, block_id: &BlockId) -> DbResult<()> {
        let buffer = self.buffer_manager.pin(block_id)?;
        self.buffers
            .borrow_mut()
            .entry(block_id.clone())
            .and_modify(|v| v.count += 1)
            .or_insert(HashMapValue { buffer, count: 1 });
        Ok(())
    }

    /// Unpin the buffer associated with the provided [`BlockId`]
    /// Unpinning a block this transaction never pinned is a bug in the caller
    pub fn unpin(&self, block_id: &BlockId) {
        let mut buffers = self.buffers.borrow_mut();
        let value = buffers
            .get_mut(block_id)
            .unwrap_or_else(|| panic!("unpin of {block_id} which this transaction never pinned"));
        self.buffer_manager.unpin(&value.buffer);
        value.count -= 1;
        if value.count == 0 {
            buffers.remove(block_id);
        }
    }

    /// Unpin all the buffers in this [`BufferList`]
    pub fn unpin_all(&self) {
        let mut buffers = self.buffers.borrow_mut();
        for value in buffers.values() {
            for _ in 0..value.count {
                self.buffer_manager.unpin(&value.buffer);
            }
        }
        buffers.clear();
    }
}

#[cfg(test)]
mod buffer_list_tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use crate::{test_utils::TestDir, BlockId, BufferList, BufferManager, FileManager, LogManager};

    #[test]
    fn test_buffer_list_functionality() {
        let dir = TestDir::new();
        let file_manager = Arc::new(FileManager::new(&dir.path().join("db"), 400).unwrap());
        let log_manager = Arc::new(Mutex::new(
            LogManager::new(Arc::clone(&file_manager), "buffer_list_tests_log_file").unwrap(),
        ));
        let buffer_manager = Arc::new(BufferManager::new(
            file_manager,
            log_manager,
            4,
            Duration::from_millis(100),
        ));
        let buffer_list = BufferList::new(Arc::clone(&buffer_manager));

        //  check that there are no buffers in the buffer list initially
        let block_id = BlockId::new("testfile".to_string(), 1);
        assert!(buffer_list.get_buffer(&block_id).is_none());

        //  pinning twice keeps one entry with a count of two
        buffer_list.pin(&block_id).unwrap();
        buffer_list.pin(&block_id).unwrap();
        assert!(buffer_list.get_buffer(&block_id).is_some());
        assert_eq!(buffer_list.pin_count(&block_id), 2);
        assert_eq!(buffer_manager.available(), 3);

        buffer_list.unpin(&block_id);
        assert_eq!(buffer_list.pin_count(&block_id), 1);

        //  unpinning all buffers will empty the buffer list and free the frame
        buffer_list.unpin_all();
        assert!(buffer_list.buffers.borrow().is_empty());
        assert_eq!(buffer_manager.available(), 4);
    }

    #[test]
    #[should_panic(expected = "never pinned")]
    fn test_unpin_of_unknown_block_panics() {
        let dir = TestDir::new();
        let file_manager = Arc::new(FileManager::new(&dir.path().join("db"), 400).unwrap());
        let log_manager = Arc::new(Mutex::new(
            LogManager::new(Arc::clone(&file_manager), "log").unwrap(),
        ));
        let buffer_manager = Arc::new(BufferManager::new(
            file_manager,
            log_manager,
            1,
            Duration::from_millis(10),
        ));
        BufferList::new(buffer_manager).unpin(&BlockId::new("f".to_string(), 0));
    }
}

/// A unit of work that sees a serializable view of the database
///
/// Reads take shared locks and writes take exclusive locks. Both are held until
/// [`Transaction::commit`] or [`Transaction::rollback`].
#[derive(Debug)]
pub struct Transaction {
    file_manager: Arc<FileManager>,
    buffer_manager: Arc<BufferManager>,
    recovery_manager: RecoveryManager,
    concurrency_manager: ConcurrencyManager,
    buffer_list: BufferList,
    tx_id: TransactionID,
}

impl Transaction {
    pub fn new(
        file_manager: Arc<FileManager>,
        log_manager: Arc<Mutex<LogManager>>,
        buffer_manager: Arc<BufferManager>,
        lock_table: Arc<LockTable>,
        id_generator: &TxIdGenerator,
    ) -> DbResult<Self> {
        let tx_id = id_generator.next_id();
        let recovery_manager =
            RecoveryManager::new(tx_id, log_manager, Arc::clone(&buffer_manager))?;
        debug!(tx_id, "transaction started");
        Ok(Self {
            tx_id,
            recovery_manager,
            buffer_list: BufferList::new(Arc::clone(&buffer_manager)),
            buffer_manager,
            concurrency_manager: ConcurrencyManager::new(lock_table),
            file_manager,
        })
    }

    pub fn id(&self) -> TransactionID {
        self.tx_id
    }

    /// Commit this transaction
    /// This will write all data associated with this transaction out to disk and append a [`LogRecord::Commit`](crate::LogRecord::Commit) to the WAL
    /// It will release all locks that are currently held by this transaction
    /// It will also handle meta operations like unpinning buffers
    pub fn commit(&self) -> DbResult<()> {
        self.recovery_manager.commit()?;
        info!(tx_id = self.tx_id, "transaction committed");
        self.concurrency_manager.release();
        self.buffer_list.unpin_all();
        Ok(())
    }

    /// Rollback this transaction
    /// This will undo all operations performed by this transaction and append a [`LogRecord::Rollback`](crate::LogRecord::Rollback) to the WAL
    /// It will also handle meta operations like unpinning buffers
    pub fn rollback(&self) -> DbResult<()> {
        self.recovery_manager.rollback(self)?;
        info!(tx_id = self.tx_id, "transaction rolled back");
        self.concurrency_manager.release();
        self.buffer_list.unpin_all();
        Ok(())
    }

    /// Recover the database on start-up or after a crash
    pub fn recover(&self) -> DbResult<()> {
        self.buffer_manager.flush_all(self.tx_id)?;
        self.recovery_manager.recover(self)
    }

    /// Pin this [`BlockId`] to be used in this transaction
    pub fn pin(&self, block_id: &BlockId) -> DbResult<()> {
        self.buffer_list.pin(block_id)
    }

    /// Unpin this [`BlockId`] since it is no longer needed by this transaction
    pub fn unpin(&self, block_id: &BlockId) {
        self.buffer_list.unpin(block_id);
    }

    fn pinned_buffer(&self, block_id: &BlockId) -> Arc<Mutex<Buffer>> {
        self.buffer_list
            .get_buffer(block_id)
            .unwrap_or_else(|| panic!("{block_id} accessed without being pinned"))
    }

    /// Get an integer value in a [`Buffer`] associated with this transaction
    pub fn get_int(&self, block_id: &BlockId, offset: usize) -> DbResult<i32> {
        self.concurrency_manager.s_lock(block_id)?;
        let buffer = self.pinned_buffer(block_id);
        let guard = buffer.lock().unwrap();
        Ok(guard.contents().get_int(offset))
    }

    /// Get a string value in a [`Buffer`] associated with this transaction
    pub fn get_string(&self, block_id: &BlockId, offset: usize) -> DbResult<String> {
        self.concurrency_manager.s_lock(block_id)?;
        let buffer = self.pinned_buffer(block_id);
        let guard = buffer.lock().unwrap();
        Ok(guard.contents().get_string(offset))
    }

    /// Set an integer value in a [`Buffer`] associated with this transaction
    /// With `log` set, the previous value is written to the WAL first
    pub fn set_int(&self, block_id: &BlockId, offset: usize, value: i32, log: bool) -> DbResult<()> {
        self.concurrency_manager.x_lock(block_id)?;
        let buffer = self.pinned_buffer(block_id);
        let mut guard = buffer.lock().unwrap();
        let lsn = if log {
            Some(self.recovery_manager.set_int(&guard, offset)?)
        } else {
            None
        };
        guard.contents_mut().set_int(offset, value);
        guard.set_modified(self.tx_id, lsn);
        Ok(())
    }

    /// Set a string value in a [`Buffer`] associated with this transaction
    pub fn set_string(
        &self,
        block_id: &BlockId,
        offset: usize,
        value: &str,
        log: bool,
    ) -> DbResult<()> {
        let len = Page::max_length(value.len());
        if offset + len > self.block_size() {
            return Err(DbError::PageOverflow {
                offset,
                len,
                size: self.block_size(),
            });
        }
        self.concurrency_manager.x_lock(block_id)?;
        let buffer = self.pinned_buffer(block_id);
        let mut guard = buffer.lock().unwrap();
        let lsn = if log {
            Some(self.recovery_manager.set_string(&guard, offset)?)
        } else {
            None
        };
        guard.contents_mut().set_string(offset, value)?;
        guard.set_modified(self.tx_id, lsn);
        Ok(())
    }

    /// Get the available buffers for this transaction
    pub fn available_buffs(&self) -> usize {
        self.buffer_manager.available()
    }

    /// Get the size of this file in blocks
    /// A shared lock on the end-of-file marker keeps concurrent appends out until this transaction ends
    pub fn size(&self, file_name: &str) -> DbResult<usize> {
        self.concurrency_manager
            .s_lock(&BlockId::end_of_file(file_name))?;
        self.file_manager.length(file_name)
    }

    /// Append a block to the file
    pub fn append(&self, file_name: &str) -> DbResult<BlockId> {
        self.concurrency_manager
            .x_lock(&BlockId::end_of_file(file_name))?;
        self.file_manager.append(file_name)
    }

    pub fn block_size(&self) -> usize {
        self.file_manager.block_size()
    }
}

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{BlockId, DbError, DbResult, FileManager, LogManager, Lsn, Page, TransactionID};

/// A frame in the buffer pool
#[derive(Debug)]
pub struct Buffer {
    file_manager: Arc<FileManager>,
    log_manager: Arc<Mutex<LogManager>>,
    contents: Page,
    block_id: Option<BlockId>,
    pins: usize,
    txn: Option<TransactionID>,
    lsn: Option<Lsn>,
}

impl Buffer {
    pub fn new(file_manager: Arc<FileManager>, log_manager: Arc<Mutex<LogManager>>) -> Self {
        let size = file_manager.block_size();
        Self {
            file_manager,
            log_manager,
            contents: Page::new(size),
            block_id: None,
            pins: 0,
            txn: None,
            lsn: None,
        }
    }

    pub fn contents(&self) -> &Page {
        &self.contents
    }

    pub fn contents_mut(&mut self) -> &mut Page {
        &mut self.contents
    }

    pub fn block_id(&self) -> Option<&BlockId> {
        self.block_id.as_ref()
    }

    /// Mark that this buffer has been modified and set associated metadata for the modifying transaction
    /// A write that was not logged keeps the LSN of the previous logged write
    pub fn set_modified(&mut self, txn_num: TransactionID, lsn: Option<Lsn>) {
        self.txn = Some(txn_num);
        if lsn.is_some() {
            self.lsn = lsn;
        }
    }

    /// The transaction that dirtied this frame, if any
    pub fn modifying_tx(&self) -> Option<TransactionID> {
        self.txn
    }

    pub fn last_lsn(&self) -> Option<Lsn> {
        self.lsn
    }

    /// Check whether the buffer is pinned in memory
    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }

    pub fn pin_count(&self) -> usize {
        self.pins
    }

    /// Modify this buffer to hold the contents of a different block
    /// This requires flushing the existing page contents, if any, to disk if dirty
    fn assign_to_block(&mut self, block_id: &BlockId) -> DbResult<()> {
        self.flush()?;
        self.file_manager.read(block_id, &mut self.contents)?;
        self.block_id = Some(block_id.clone());
        self.pins = 0;
        self.lsn = None;
        Ok(())
    }

    /// Write the current buffer contents to disk if dirty
    /// The log is forced up to this frame's last LSN before the page goes out
    fn flush(&mut self) -> DbResult<()> {
        if self.txn.is_none() {
            return Ok(());
        }
        if let Some(lsn) = self.lsn {
            self.log_manager.lock().unwrap().flush_lsn(lsn)?;
        }
        if let Some(block_id) = &self.block_id {
            self.file_manager.write(block_id, &self.contents)?;
        }
        self.txn = None;
        Ok(())
    }

    fn pin(&mut self) {
        self.pins += 1;
    }

    fn unpin(&mut self) {
        assert!(self.pins > 0, "unpin on a buffer with no pins");
        self.pins -= 1;
    }
}

#[derive(Debug, Default)]
pub struct BufferStats {
    pub hits: AtomicUsize,
    pub misses: AtomicUsize,
}

impl BufferStats {
    pub fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn hit_rate(&self) -> f64 {
        let (hits, misses) = self.get();
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}

/// Point-in-time view of one frame, used by the CLI
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    pub block_id: Option<BlockId>,
    pub pins: usize,
    pub modified_by: Option<TransactionID>,
}

/// Fixed pool of frames shared by every transaction
///
/// Lock order is `num_available`, then a single frame, then the log, then the file manager.
#[derive(Debug)]
pub struct BufferManager {
    buffer_pool: Vec<Arc<Mutex<Buffer>>>,
    num_available: Mutex<usize>,
    cond: Condvar,
    max_wait: Duration,
    stats: BufferStats,
}

impl BufferManager {
    pub fn new(
        file_manager: Arc<FileManager>,
        log_manager: Arc<Mutex<LogManager>>,
        num_buffers: usize,
        max_wait: Duration,
    ) -> Self {
        let buffer_pool = (0..num_buffers)
            .map(|_| {
                Arc::new(Mutex::new(Buffer::new(
                    Arc::clone(&file_manager),
                    Arc::clone(&log_manager),
                )))
            })
            .collect();
        Self {
            buffer_pool,
            num_available: Mutex::new(num_buffers),
            cond: Condvar::new(),
            max_wait,
            stats: BufferStats::default(),
        }
    }

    /// Returns the number of unpinned buffers, that is buffers with no pages pinned to them
    pub fn available(&self) -> usize {
        *self.num_available.lock().unwrap()
    }

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    /// Flushes the dirty buffers modified by this specific transaction
    pub fn flush_all(&self, txn_num: TransactionID) -> DbResult<()> {
        for buffer in &self.buffer_pool {
            let mut buffer = buffer.lock().unwrap();
            if buffer.txn == Some(txn_num) {
                buffer.flush()?;
            }
        }
        Ok(())
    }

    /// Pin the buffer associated with the provided block_id
    /// Waits up to the configured bound for a frame to free up, then fails with [`DbError::BufferAbort`]
    pub fn pin(&self, block_id: &BlockId) -> DbResult<Arc<Mutex<Buffer>>> {
        let deadline = Instant::now() + self.max_wait;
        let mut num_available = self.num_available.lock().unwrap();
        loop {
            if let Some(buffer) = self.try_to_pin(block_id)? {
                {
                    let mut buffer_guard = buffer.lock().unwrap();
                    if !buffer_guard.is_pinned() {
                        *num_available -= 1;
                    }
                    buffer_guard.pin();
                }
                return Ok(buffer);
            }
            let timeout = deadline.saturating_duration_since(Instant::now());
            if timeout.is_zero() {
                warn!(block = %block_id, "buffer pool exhausted");
                return Err(DbError::BufferAbort);
            }
            let (guard, _) = self.cond.wait_timeout(num_available, timeout).unwrap();
            num_available = guard;
        }
    }

    /// Find a buffer to pin this block to
    /// First check to see if there is an existing buffer for this block
    /// If not, try to find an unpinned buffer and read the block into it
    fn try_to_pin(&self, block_id: &BlockId) -> DbResult<Option<Arc<Mutex<Buffer>>>> {
        if let Some(buffer) = self.find_existing_buffer(block_id) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(buffer));
        }
        let Some(buffer) = self.choose_unpinned_buffer() else {
            return Ok(None);
        };
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        {
            let mut guard = buffer.lock().unwrap();
            if let Some(old) = guard.block_id() {
                debug!(evicted = %old, loaded = %block_id, "replacing buffer");
            }
            guard.assign_to_block(block_id)?;
        }
        Ok(Some(buffer))
    }

    /// Decrement the pin count for the provided buffer
    /// If all of the pins have been removed, managed metadata & notify waiting threads
    pub fn unpin(&self, buffer: &Arc<Mutex<Buffer>>) {
        let mut num_available = self.num_available.lock().unwrap();
        let mut buffer_guard = buffer.lock().unwrap();
        buffer_guard.unpin();
        if !buffer_guard.is_pinned() {
            *num_available += 1;
            self.cond.notify_all();
        }
    }

    /// Look for a buffer associated with this specific [`BlockId`]
    fn find_existing_buffer(&self, block_id: &BlockId) -> Option<Arc<Mutex<Buffer>>> {
        self.buffer_pool
            .iter()
            .find(|buffer| buffer.lock().unwrap().block_id() == Some(block_id))
            .map(Arc::clone)
    }

    /// Try to find an unpinned buffer and return pointer to that, if present
    fn choose_unpinned_buffer(&self) -> Option<Arc<Mutex<Buffer>>> {
        self.buffer_pool
            .iter()
            .find(|buffer| !buffer.lock().unwrap().is_pinned())
            .map(Arc::clone)
    }

    pub fn frames(&self) -> Vec<FrameInfo> {
        self.buffer_pool
            .iter()
            .map(|buffer| {
                let guard = buffer.lock().unwrap();
                FrameInfo {
                    block_id: guard.block_id.clone(),
                    pins: guard.pins,
                    modified_by: guard.txn,
                }
            })
            .collect()
    }
}

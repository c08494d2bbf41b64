use std::sync::Arc;

use tracing::debug;

use crate::{BlockId, DbResult, FileManager, Page};

pub type Lsn = usize;

/// Append-only log over a single file
///
/// Records are packed back-to-front inside each block. The first int of a block is the
/// boundary, the offset of the earliest record written to that block.
#[derive(Debug)]
pub struct LogManager {
    file_manager: Arc<FileManager>,
    log_file: String,
    log_page: Page,
    current_block: BlockId,
    latest_lsn: Lsn,
    last_saved_lsn: Lsn,
}

impl LogManager {
    pub fn new(file_manager: Arc<FileManager>, log_file: &str) -> DbResult<Self> {
        let mut log_page = Page::new(file_manager.block_size());
        let log_size = file_manager.length(log_file)?;
        let current_block = if log_size == 0 {
            LogManager::append_new_block(&file_manager, log_file, &mut log_page)?
        } else {
            let block = BlockId::new(log_file.to_string(), log_size - 1);
            file_manager.read(&block, &mut log_page)?;
            block
        };
        Ok(Self {
            file_manager,
            log_file: log_file.to_string(),
            log_page,
            current_block,
            latest_lsn: 0,
            last_saved_lsn: 0,
        })
    }

    /// Make sure the record with this LSN is on disk
    pub fn flush_lsn(&mut self, lsn: Lsn) -> DbResult<()> {
        if lsn >= self.last_saved_lsn {
            self.flush_to_disk()?;
        }
        Ok(())
    }

    /// Write the bytes from log_page to disk for the current_block
    /// Update the last_saved_lsn before returning
    fn flush_to_disk(&mut self) -> DbResult<()> {
        self.file_manager
            .write(&self.current_block, &self.log_page)?;
        self.last_saved_lsn = self.latest_lsn;
        Ok(())
    }

    /// Write the log_record to the log page and return its LSN
    /// A record that does not leave room for the boundary int goes to a fresh block
    pub fn append(&mut self, log_record: &[u8]) -> DbResult<Lsn> {
        let mut boundary = self.log_page.get_int(0) as usize;
        let bytes_needed = log_record.len() + Page::INT_BYTES;
        if bytes_needed + Page::INT_BYTES > self.file_manager.block_size() {
            return Err(crate::DbError::LogCorruption(format!(
                "log record of {} bytes does not fit in a block",
                log_record.len()
            )));
        }
        if boundary.saturating_sub(bytes_needed) < Page::INT_BYTES {
            self.flush_to_disk()?;
            self.current_block =
                LogManager::append_new_block(&self.file_manager, &self.log_file, &mut self.log_page)?;
            debug!(block = %self.current_block, "log moved to a new block");
            boundary = self.log_page.get_int(0) as usize;
        }

        let record_pos = boundary - bytes_needed;
        self.log_page.set_bytes(record_pos, log_record)?;
        self.log_page.set_int(0, record_pos as i32);
        self.latest_lsn += 1;
        Ok(self.latest_lsn)
    }

    /// Append a new block to the file maintained by the log manager
    /// This involves initializing a new block, writing a boundary pointer to it and writing the block to disk
    fn append_new_block(
        file_manager: &FileManager,
        log_file: &str,
        log_page: &mut Page,
    ) -> DbResult<BlockId> {
        let block_id = file_manager.append(log_file)?;
        log_page.contents.fill(0);
        log_page.set_int(0, file_manager.block_size() as i32);
        file_manager.write(&block_id, log_page)?;
        Ok(block_id)
    }

    /// Flush the log and iterate over it from the newest record to the oldest
    /// The iterator reads blocks from disk, so later appends do not disturb it
    pub fn iterator(&mut self) -> DbResult<LogIterator> {
        self.flush_to_disk()?;
        LogIterator::new(Arc::clone(&self.file_manager), self.current_block.clone())
    }

    pub fn latest_lsn(&self) -> Lsn {
        self.latest_lsn
    }

    pub fn last_saved_lsn(&self) -> Lsn {
        self.last_saved_lsn
    }

    #[cfg(test)]
    fn boundary(&self) -> usize {
        self.log_page.get_int(0) as usize
    }
}

pub struct LogIterator {
    file_manager: Arc<FileManager>,
    current_block: BlockId,
    page: Page,
    current_pos: usize,
}

impl LogIterator {
    fn new(file_manager: Arc<FileManager>, current_block: BlockId) -> DbResult<Self> {
        let mut page = Page::new(file_manager.block_size());
        file_manager.read(&current_block, &mut page)?;
        let boundary = page.get_int(0) as usize;
        Ok(Self {
            file_manager,
            current_block,
            page,
            current_pos: boundary,
        })
    }

    fn move_to_block(&mut self) -> DbResult<()> {
        self.file_manager.read(&self.current_block, &mut self.page)?;
        self.current_pos = self.page.get_int(0) as usize;
        Ok(())
    }
}

impl Iterator for LogIterator {
    type Item = DbResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.current_pos >= self.file_manager.block_size() {
            if self.current_block.block_num == 0 {
                return None;
            }
            self.current_block = BlockId::new(
                self.current_block.filename.clone(),
                self.current_block.block_num - 1,
            );
            if let Err(e) = self.move_to_block() {
                return Some(Err(e));
            }
        }
        let record = self.page.get_bytes(self.current_pos);
        self.current_pos += Page::INT_BYTES + record.len();
        Some(Ok(record))
    }
}

#[cfg(test)]
mod log_manager_tests {
    use std::sync::Arc;

    use crate::{test_utils::TestDir, FileManager, LogManager, Page};

    fn setup(block_size: usize) -> (TestDir, LogManager) {
        let dir = TestDir::new();
        let file_manager = Arc::new(FileManager::new(&dir.path().join("db"), block_size).unwrap());
        let log_manager = LogManager::new(file_manager, "test.log").unwrap();
        (dir, log_manager)
    }

    fn create_log_record(s: &str, n: i32) -> Vec<u8> {
        let mut page = Page::new(Page::max_length(s.len()) + Page::INT_BYTES);
        page.set_string(0, s).unwrap();
        page.set_int(Page::max_length(s.len()), n);
        page.contents
    }

    fn read_log_record(bytes: Vec<u8>) -> (String, i32) {
        let page = Page::from_bytes(bytes);
        let s = page.get_string(0);
        let n = page.get_int(Page::max_length(s.len()));
        (s, n)
    }

    #[test]
    fn test_lsns_are_dense_and_start_at_one() {
        let (_dir, mut log_manager) = setup(400);
        for expected in 1..=70 {
            let lsn = log_manager
                .append(&create_log_record(&format!("record{expected}"), expected as i32))
                .unwrap();
            assert_eq!(lsn, expected);
        }
    }

    #[test]
    fn test_iterates_newest_first_across_blocks() {
        let (_dir, mut log_manager) = setup(400);
        for i in 1..=70 {
            log_manager
                .append(&create_log_record(&format!("record{i}"), i + 100))
                .unwrap();
        }
        let records: Vec<(String, i32)> = log_manager
            .iterator()
            .unwrap()
            .map(|r| read_log_record(r.unwrap()))
            .collect();
        assert_eq!(records.len(), 70);
        for (idx, (s, n)) in records.iter().enumerate() {
            let i = 70 - idx as i32;
            assert_eq!(s, &format!("record{i}"));
            assert_eq!(*n, i + 100);
        }
    }

    #[test]
    fn test_flush_lsn_advances_saved_lsn() {
        let (_dir, mut log_manager) = setup(400);
        for i in 1..=5 {
            log_manager.append(&create_log_record("x", i)).unwrap();
        }
        assert_eq!(log_manager.last_saved_lsn(), 0);
        log_manager.flush_lsn(3).unwrap();
        assert_eq!(log_manager.last_saved_lsn(), 5);
    }

    #[test]
    fn test_record_exactly_filling_boundary_moves_to_new_block() {
        let (_dir, mut log_manager) = setup(400);
        //  the boundary starts at 400, a record needing all 400 bytes cannot keep the header
        let oversized = vec![7u8; 400 - 2 * Page::INT_BYTES + 1];
        assert!(log_manager.append(&oversized).is_err());

        //  bytes needed == boundary - 4 still fits in the first block
        let fits = vec![1u8; 400 - 2 * Page::INT_BYTES];
        log_manager.append(&fits).unwrap();
        assert_eq!(log_manager.current_block.block_num, 0);
        assert_eq!(log_manager.boundary(), Page::INT_BYTES);

        //  the next record needs more than what is left before the boundary
        log_manager.append(&[2u8; 1]).unwrap();
        assert_eq!(log_manager.current_block.block_num, 1);
    }

    #[test]
    fn test_reopen_continues_last_block() {
        let dir = TestDir::new();
        let path = dir.path().join("db");
        {
            let file_manager = Arc::new(FileManager::new(&path, 400).unwrap());
            let mut log_manager = LogManager::new(file_manager, "test.log").unwrap();
            log_manager.append(&create_log_record("first", 1)).unwrap();
            log_manager.flush_lsn(1).unwrap();
        }
        let file_manager = Arc::new(FileManager::new(&path, 400).unwrap());
        let mut log_manager = LogManager::new(file_manager, "test.log").unwrap();
        log_manager.append(&create_log_record("second", 2)).unwrap();
        let records: Vec<(String, i32)> = log_manager
            .iterator()
            .unwrap()
            .map(|r| read_log_record(r.unwrap()))
            .collect();
        assert_eq!(
            records,
            vec![("second".to_string(), 2), ("first".to_string(), 1)]
        );
    }
}

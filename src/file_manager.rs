use std::{
    collections::{hash_map::Entry, HashMap},
    fmt::Display,
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::debug;

use crate::{DbError, DbResult};

/// The block id container that contains a specific block number for a specific file
#[derive(Debug, Eq, PartialEq, Clone, Hash)]
pub struct BlockId {
    pub filename: String,
    pub block_num: usize,
}

impl BlockId {
    /// Sentinel block number standing for the end of a file, only ever used as a lock target
    pub const EOF: usize = usize::MAX;

    pub fn new(filename: String, block_num: usize) -> Self {
        Self {
            filename,
            block_num,
        }
    }

    /// The block id that guards the length of `filename`
    pub fn end_of_file(filename: &str) -> Self {
        Self::new(filename.to_string(), Self::EOF)
    }

    pub fn is_end_of_file(&self) -> bool {
        self.block_num == Self::EOF
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_end_of_file() {
            write!(f, "[file {}, block EOF]", self.filename)
        } else {
            write!(f, "[file {}, block {}]", self.filename, self.block_num)
        }
    }
}

/// The page struct that contains the contents of a page
#[derive(Debug, Clone)]
pub struct Page {
    pub contents: Vec<u8>,
}

impl Page {
    pub const INT_BYTES: usize = 4;

    pub fn new(blocksize: usize) -> Self {
        Self {
            contents: vec![0; blocksize],
        }
    }

    /// Create a new page from the given bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { contents: bytes }
    }

    /// The number of bytes a string of `strlen` characters occupies on a page
    pub fn max_length(strlen: usize) -> usize {
        Self::INT_BYTES + strlen
    }

    pub fn size(&self) -> usize {
        self.contents.len()
    }

    /// Get an integer from the page at the given offset
    pub fn get_int(&self, offset: usize) -> i32 {
        let mut bytes = [0u8; Self::INT_BYTES];
        bytes.copy_from_slice(&self.contents[offset..offset + Self::INT_BYTES]);
        i32::from_be_bytes(bytes)
    }

    /// Set an integer at the given offset
    pub fn set_int(&mut self, offset: usize, n: i32) {
        self.contents[offset..offset + Self::INT_BYTES].copy_from_slice(&n.to_be_bytes());
    }

    /// Get a slice of bytes from the page at the given offset. Read the length and then the bytes
    pub fn get_bytes(&self, offset: usize) -> Vec<u8> {
        let length = self.get_int(offset) as u32 as usize;
        let start = offset + Self::INT_BYTES;
        let end = (start + length).min(self.contents.len());
        self.contents[start..end].to_vec()
    }

    /// Set a slice of bytes at the given offset. Write the length and then the bytes
    /// A write that would run past the end of the page leaves the page untouched
    pub fn set_bytes(&mut self, offset: usize, bytes: &[u8]) -> DbResult<()> {
        let end = offset
            .checked_add(Self::max_length(bytes.len()))
            .filter(|&end| end <= self.contents.len())
            .ok_or(DbError::PageOverflow {
                offset,
                len: Self::max_length(bytes.len()),
                size: self.contents.len(),
            })?;
        self.set_int(offset, bytes.len() as i32);
        self.contents[offset + Self::INT_BYTES..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Get a string from the page at the given offset
    pub fn get_string(&self, offset: usize) -> String {
        String::from_utf8_lossy(&self.get_bytes(offset)).into_owned()
    }

    /// Set a string at the given offset
    pub fn set_string(&mut self, offset: usize, string: &str) -> DbResult<()> {
        self.set_bytes(offset, string.as_bytes())
    }
}


/// The file manager struct that manages the files in the database
#[derive(Debug)]
pub struct FileManager {
    db_directory: PathBuf,
    blocksize: usize,
    is_new: bool,
    open_files: Mutex<HashMap<String, File>>,
}

impl FileManager {
    const TEMP_PREFIX: &'static str = "temp";

    pub fn new<P>(db_directory: &P, blocksize: usize) -> DbResult<Self>
    where
        P: AsRef<Path> + ?Sized,
    {
        let db_path = db_directory.as_ref().to_path_buf();
        let is_new = !db_path.exists();
        fs::create_dir_all(&db_path)?;

        //  temporary tables never survive a restart
        for entry in fs::read_dir(&db_path)? {
            let entry = entry?;
            if entry.file_type()?.is_file()
                && entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(Self::TEMP_PREFIX)
            {
                debug!(path = %entry.path().display(), "removing leftover temporary file");
                fs::remove_file(entry.path())?;
            }
        }

        Ok(Self {
            db_directory: db_path,
            blocksize,
            is_new,
            open_files: Mutex::new(HashMap::new()),
        })
    }

    pub fn block_size(&self) -> usize {
        self.blocksize
    }

    /// Whether the database directory was created by this file manager
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn db_directory(&self) -> &Path {
        &self.db_directory
    }

    /// Get the length of the file in blocks
    pub fn length(&self, filename: &str) -> DbResult<usize> {
        let mut open_files = self.open_files.lock().unwrap();
        let file = self.get_file(&mut open_files, filename)?;
        let len = file.metadata()?.len() as usize;
        Ok(len / self.blocksize)
    }

    /// Read the block provided by the block_id into the provided page
    /// Blocks past the end of the file read back as zeroes
    pub fn read(&self, block_id: &BlockId, page: &mut Page) -> DbResult<()> {
        let mut open_files = self.open_files.lock().unwrap();
        let file = self.get_file(&mut open_files, &block_id.filename)?;
        file.seek(SeekFrom::Start(self.offset_of(block_id)))?;
        let mut filled = 0;
        while filled < page.contents.len() {
            match file.read(&mut page.contents[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        page.contents[filled..].fill(0);
        Ok(())
    }

    /// Write the page to the block provided by the block_id
    pub fn write(&self, block_id: &BlockId, page: &Page) -> DbResult<()> {
        let mut open_files = self.open_files.lock().unwrap();
        let file = self.get_file(&mut open_files, &block_id.filename)?;
        file.seek(SeekFrom::Start(self.offset_of(block_id)))?;
        file.write_all(&page.contents)?;
        file.sync_data()?;
        Ok(())
    }

    /// Append a new, empty block to the file and return
    pub fn append(&self, filename: &str) -> DbResult<BlockId> {
        let mut open_files = self.open_files.lock().unwrap();
        let file = self.get_file(&mut open_files, filename)?;
        let new_blk_num = file.metadata()?.len() as usize / self.blocksize;
        let block_id = BlockId::new(filename.to_string(), new_blk_num);
        file.seek(SeekFrom::Start(self.offset_of(&block_id)))?;
        file.write_all(&vec![0; self.blocksize])?;
        file.sync_data()?;
        Ok(block_id)
    }

    fn offset_of(&self, block_id: &BlockId) -> u64 {
        (block_id.block_num * self.blocksize) as u64
    }

    /// Get the file handle for the file with the given filename, opening it lazily
    fn get_file<'a>(
        &self,
        open_files: &'a mut HashMap<String, File>,
        filename: &str,
    ) -> DbResult<&'a mut File> {
        match open_files.entry(filename.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(self.db_directory.join(filename))?;
                Ok(entry.insert(file))
            }
        }
    }
}

#[cfg(test)]
mod file_manager_tests {
    use crate::{test_utils::TestDir, BlockId, FileManager, Page};

    fn setup() -> (TestDir, FileManager) {
        let dir = TestDir::new();
        let file_manager = FileManager::new(&dir.path().join("db"), 400).unwrap();
        (dir, file_manager)
    }

    #[test]
    fn test_file_creation() {
        let (_dir, file_manager) = setup();
        assert!(file_manager.is_new());
        assert_eq!(file_manager.length("test_file").unwrap(), 0);
        assert!(file_manager.db_directory().join("test_file").exists());
    }

    #[test]
    fn test_append_and_length() {
        let (_dir, file_manager) = setup();

        let filename = "testfile";
        assert_eq!(file_manager.length(filename).unwrap(), 0);

        let block_id = file_manager.append(filename).unwrap();
        assert_eq!(block_id.block_num, 0);
        assert_eq!(file_manager.length(filename).unwrap(), 1);

        let block_id_2 = file_manager.append(filename).unwrap();
        assert_eq!(block_id_2.block_num, 1);
        assert_eq!(file_manager.length(filename).unwrap(), 2);
    }

    #[test]
    fn test_round_trip_string_and_int() {
        let (_dir, file_manager) = setup();
        let block_id = BlockId::new("testfile".to_string(), 2);

        let mut page = Page::new(file_manager.block_size());
        let pos1 = 88;
        page.set_string(pos1, "abcdefghijklm").unwrap();
        let pos2 = pos1 + Page::max_length("abcdefghijklm".len());
        page.set_int(pos2, 345);
        file_manager.write(&block_id, &page).unwrap();

        let mut read_back = Page::new(file_manager.block_size());
        file_manager.read(&block_id, &mut read_back).unwrap();
        assert_eq!(pos2, 105);
        assert_eq!(read_back.get_string(pos1), "abcdefghijklm");
        assert_eq!(read_back.get_int(pos2), 345);
    }

    #[test]
    fn test_read_past_end_is_zeroed() {
        let (_dir, file_manager) = setup();
        let mut page = Page::new(file_manager.block_size());
        page.set_int(0, 77);
        file_manager
            .read(&BlockId::new("empty".to_string(), 5), &mut page)
            .unwrap();
        assert_eq!(page.get_int(0), 0);
    }

    #[test]
    fn test_reopen_removes_temp_files_only() {
        let dir = TestDir::new();
        let path = dir.path().join("db");
        {
            let file_manager = FileManager::new(&path, 400).unwrap();
            file_manager.append("temp3").unwrap();
            file_manager.append("students.tbl").unwrap();
        }
        let file_manager = FileManager::new(&path, 400).unwrap();
        assert!(!file_manager.is_new());
        assert!(!path.join("temp3").exists());
        assert_eq!(file_manager.length("students.tbl").unwrap(), 1);
    }

    #[test]
    fn test_end_of_file_block_display() {
        let eof = BlockId::end_of_file("students.tbl");
        assert!(eof.is_end_of_file());
        assert_eq!(eof.to_string(), "[file students.tbl, block EOF]");
        assert_eq!(
            BlockId::new("a".to_string(), 2).to_string(),
            "[file a, block 2]"
        );
    }
}

use std::time::Duration;

/// Construction parameters for a [`crate::SimpleDB`] instance
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub block_size: usize,
    pub num_buffers: usize,
    pub log_file: String,
    /// How long a transaction waits on the lock table before giving up
    pub lock_timeout: Duration,
    /// How long a pin waits for a frame to be unpinned before giving up
    pub buffer_wait: Duration,
}

impl DbConfig {
    pub const BLOCK_SIZE: usize = 400;
    pub const NUM_BUFFERS: usize = 8;
    pub const LOG_FILE: &'static str = "simpledb.log";
    pub const LOCK_TIMEOUT_MS: u64 = 10_000;
    pub const BUFFER_WAIT_MS: u64 = 10_000;

    pub fn new(block_size: usize, num_buffers: usize) -> Self {
        Self {
            block_size,
            num_buffers,
            ..Self::default()
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn with_buffer_wait(mut self, buffer_wait: Duration) -> Self {
        self.buffer_wait = buffer_wait;
        self
    }

    pub fn with_log_file(mut self, log_file: &str) -> Self {
        self.log_file = log_file.to_string();
        self
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            block_size: Self::BLOCK_SIZE,
            num_buffers: Self::NUM_BUFFERS,
            log_file: Self::LOG_FILE.to_string(),
            lock_timeout: Duration::from_millis(Self::LOCK_TIMEOUT_MS),
            buffer_wait: Duration::from_millis(Self::BUFFER_WAIT_MS),
        }
    }
}

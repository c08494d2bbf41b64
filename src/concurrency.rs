use std::{
    cell::RefCell,
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{BlockId, DbError, DbResult};

/// Process-wide lock table shared by every transaction
///
/// Each locked block maps to a counter: a positive value is the number of shared holders and
/// `-1` marks an exclusive holder. Unlocked blocks are absent.
#[derive(Debug)]
pub struct LockTable {
    locks: Mutex<HashMap<BlockId, i32>>,
    cond_var: Condvar,
    timeout: Duration,
}

impl LockTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            cond_var: Condvar::new(),
            timeout,
        }
    }

    /// Acquire a shared lock on a [`BlockId`], waiting while some transaction holds it exclusively
    pub fn s_lock(&self, block_id: &BlockId) -> DbResult<()> {
        let guard = self.locks.lock().unwrap();
        let mut guard = self.wait_while(guard, block_id, |count| count < 0)?;
        *guard.entry(block_id.clone()).or_insert(0) += 1;
        Ok(())
    }

    /// Acquire an exclusive lock on a [`BlockId`]
    /// The caller must already hold a shared lock, so this waits while any other shared holder remains
    pub fn x_lock(&self, block_id: &BlockId) -> DbResult<()> {
        let guard = self.locks.lock().unwrap();
        let mut guard = self.wait_while(guard, block_id, |count| count > 1)?;
        guard.insert(block_id.clone(), -1);
        Ok(())
    }

    /// Release one hold on a [`BlockId`] and wake any waiters once it is free
    pub fn unlock(&self, block_id: &BlockId) {
        let mut guard = self.locks.lock().unwrap();
        match guard.get_mut(block_id) {
            Some(count) if *count > 1 => *count -= 1,
            _ => {
                guard.remove(block_id);
                self.cond_var.notify_all();
            }
        }
    }

    fn wait_while<'a>(
        &self,
        mut guard: MutexGuard<'a, HashMap<BlockId, i32>>,
        block_id: &BlockId,
        should_wait: impl Fn(i32) -> bool,
    ) -> DbResult<MutexGuard<'a, HashMap<BlockId, i32>>> {
        let deadline = Instant::now() + self.timeout;
        while should_wait(guard.get(block_id).copied().unwrap_or(0)) {
            let timeout = deadline.saturating_duration_since(Instant::now());
            if timeout.is_zero() {
                warn!(block = %block_id, "lock wait timed out");
                return Err(DbError::LockTimeout {
                    block: block_id.clone(),
                });
            }
            let (next, _) = self.cond_var.wait_timeout(guard, timeout).unwrap();
            guard = next;
        }
        Ok(guard)
    }

    #[cfg(test)]
    fn count(&self, block_id: &BlockId) -> i32 {
        self.locks
            .lock()
            .unwrap()
            .get(block_id)
            .copied()
            .unwrap_or(0)
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Shared,
    Exclusive,
}

/// The per-transaction view of the lock table
/// Locks are only released together, at commit or rollback
#[derive(Debug)]
pub struct ConcurrencyManager {
    lock_table: Arc<LockTable>,
    locks: RefCell<HashMap<BlockId, LockType>>,
}

impl ConcurrencyManager {
    pub fn new(lock_table: Arc<LockTable>) -> Self {
        Self {
            lock_table,
            locks: RefCell::new(HashMap::new()),
        }
    }

    /// Acquire a shared lock on a [`BlockId`] unless this transaction already holds any lock on it
    pub fn s_lock(&self, block_id: &BlockId) -> DbResult<()> {
        if self.locks.borrow().contains_key(block_id) {
            return Ok(());
        }
        self.lock_table.s_lock(block_id)?;
        self.locks
            .borrow_mut()
            .insert(block_id.clone(), LockType::Shared);
        Ok(())
    }

    /// Acquire an exclusive lock on a [`BlockId`]
    /// A shared lock is taken first if this transaction has none, then upgraded
    pub fn x_lock(&self, block_id: &BlockId) -> DbResult<()> {
        if self.lock_type(block_id) == Some(LockType::Exclusive) {
            return Ok(());
        }
        self.s_lock(block_id)?;
        self.lock_table.x_lock(block_id)?;
        self.locks
            .borrow_mut()
            .insert(block_id.clone(), LockType::Exclusive);
        Ok(())
    }

    /// Release all locks associated with a [`Transaction`](crate::Transaction)
    pub fn release(&self) {
        let mut locks = self.locks.borrow_mut();
        for block in locks.keys() {
            self.lock_table.unlock(block);
        }
        debug!(count = locks.len(), "released locks");
        locks.clear();
    }

    pub fn lock_type(&self, block_id: &BlockId) -> Option<LockType> {
        self.locks.borrow().get(block_id).copied()
    }
}

#[cfg(test)]
mod concurrency_manager_tests {
    use std::{sync::Arc, time::Duration};

    use crate::{test_utils::generate_filename, BlockId, ConcurrencyManager, LockTable, LockType};

    #[test]
    fn test_xlock_after_slock_upgrades() {
        let lock_table = Arc::new(LockTable::new(Duration::from_millis(10)));
        let cm = ConcurrencyManager::new(Arc::clone(&lock_table));
        let block_id = BlockId::new(generate_filename(), 0);

        cm.s_lock(&block_id).unwrap();
        assert_eq!(cm.lock_type(&block_id), Some(LockType::Shared));
        cm.x_lock(&block_id).unwrap();
        assert_eq!(cm.lock_type(&block_id), Some(LockType::Exclusive));

        //  repeated requests are no-ops
        cm.s_lock(&block_id).unwrap();
        cm.x_lock(&block_id).unwrap();
        assert_eq!(lock_table.count(&block_id), -1);

        cm.release();
        assert_eq!(lock_table.count(&block_id), 0);
        assert_eq!(cm.lock_type(&block_id), None);
    }

    #[test]
    fn test_two_readers_then_release() {
        let lock_table = Arc::new(LockTable::new(Duration::from_millis(10)));
        let cm1 = ConcurrencyManager::new(Arc::clone(&lock_table));
        let cm2 = ConcurrencyManager::new(Arc::clone(&lock_table));
        let block_id = BlockId::new(generate_filename(), 0);

        cm1.s_lock(&block_id).unwrap();
        cm2.s_lock(&block_id).unwrap();
        assert!(cm2.x_lock(&block_id).is_err());

        cm1.release();
        cm2.x_lock(&block_id).unwrap();
        assert_eq!(lock_table.count(&block_id), -1);
        cm2.release();
        assert_eq!(lock_table.count(&block_id), 0);
    }
}

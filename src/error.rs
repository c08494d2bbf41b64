use std::io;

use thiserror::Error;

use crate::BlockId;

/// Every failure the engine can surface to a transaction boundary
#[derive(Debug, Error)]
pub enum DbError {
    #[error("timed out waiting for a lock on {block}")]
    LockTimeout { block: BlockId },

    #[error("no buffer became available in time")]
    BufferAbort,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("bad syntax: {0}")]
    BadSyntax(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("log corruption: {0}")]
    LogCorruption(String),

    #[error("writing {len} bytes at offset {offset} overruns a page of {size} bytes")]
    PageOverflow {
        offset: usize,
        len: usize,
        size: usize,
    },
}

impl DbError {
    /// Lock and buffer failures leave the transaction usable only for a rollback
    pub fn requires_rollback(&self) -> bool {
        matches!(self, DbError::LockTimeout { .. } | DbError::BufferAbort)
    }
}

pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn test_rollback_classification() {
        let block = BlockId::new("t.tbl".to_string(), 3);
        assert!(DbError::LockTimeout { block }.requires_rollback());
        assert!(DbError::BufferAbort.requires_rollback());
        assert!(!DbError::Catalog("missing".to_string()).requires_rollback());
    }

    #[test]
    fn test_lock_timeout_names_the_block() {
        let err = DbError::LockTimeout {
            block: BlockId::end_of_file("t.tbl"),
        };
        assert_eq!(
            err.to_string(),
            "timed out waiting for a lock on [file t.tbl, block EOF]"
        );
    }

    #[test]
    fn test_io_error_converts() {
        let err: DbError = io::Error::new(io::ErrorKind::Other, "disk on fire").into();
        assert!(matches!(err, DbError::Io(_)));
        assert_eq!(err.to_string(), "I/O error: disk on fire");
    }
}

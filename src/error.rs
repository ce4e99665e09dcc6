use thiserror::Error;

use crate::common::{Lsn, PageId};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt database file: {0}")]
    CorruptFile(String),

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("short read: {0}")]
    ShortRead(String),

    #[error("no free frame available in buffer pool")]
    NoFreeFrame,

    #[error("invalid page id: {0}")]
    InvalidPageId(PageId),

    #[error("unknown log record kind: {0}")]
    UnknownKind(i32),

    #[error("gap in log sequence at LSN {0}")]
    LsnGap(Lsn),

    #[error("timestamp {0} is in the future")]
    FutureTimestamp(u64),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("deadlock detected")]
    Deadlock,

    #[error("transaction aborted: {0}")]
    Aborted(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

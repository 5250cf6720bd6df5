//! Error types shared by every layer of the store.

use thiserror::Error;

use crate::lock_manager::LockError;
use crate::page_id::PageId;
use crate::{Lsn, TxId};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("page {0} does not exist")]
    PageNotFound(PageId),

    #[error("page {0} is already allocated")]
    PageAlreadyAllocated(PageId),

    #[error("page {0} is not latched in the required mode")]
    NotLatched(PageId),

    #[error("container {0} has no free pages left")]
    ContainerFull(u16),

    #[error("container {0} is not open")]
    UnknownContainer(u16),

    #[error("buffer pool exhausted: all frames are pinned")]
    BufferPoolExhausted,

    #[error("checksum mismatch on page {0}")]
    Checksum(PageId),

    #[error("corrupt log record at LSN {lsn}: {reason}")]
    CorruptLog { lsn: Lsn, reason: String },

    /// The store found itself in a state its own protocol rules out.
    /// Never handled locally.
    #[error("consistency violation on page {page}: {reason}")]
    FatalConsistency { page: PageId, reason: String },

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("index operation failed on page {page}: {reason}")]
    Index {
        page: PageId,
        reason: String,
        #[source]
        source: Box<StoreError>,
    },

    #[error("overflow store failure for record on page {page}")]
    Blob {
        page: PageId,
        #[source]
        source: Box<StoreError>,
    },

    #[error("duplicate key")]
    DuplicateKey,

    #[error("key of {len} bytes exceeds the maximum of {max} bytes")]
    KeyTooLarge { len: usize, max: usize },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("transaction {0} is no longer active")]
    TxNotActive(TxId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    /// Lock contention is the only failure a caller may retry after rolling
    /// back. The core itself never retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Lock(_) => true,
            StoreError::Index { source, .. } | StoreError::Blob { source, .. } => {
                source.is_retryable()
            }
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            StoreError::FatalConsistency { .. } | StoreError::Unsupported(_) => true,
            StoreError::Index { source, .. } | StoreError::Blob { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// Wraps a page-local failure with the page it happened on.
    pub fn on_page(self, page: PageId, reason: impl Into<String>) -> StoreError {
        StoreError::Index {
            page,
            reason: reason.into(),
            source: Box::new(self),
        }
    }

    pub(crate) fn corrupt(lsn: Lsn, reason: impl Into<String>) -> StoreError {
        StoreError::CorruptLog {
            lsn,
            reason: reason.into(),
        }
    }

    pub(crate) fn fatal(page: PageId, reason: impl Into<String>) -> StoreError {
        StoreError::FatalConsistency {
            page,
            reason: reason.into(),
        }
    }
}

/// Outcome of replaying a log operation during redo. A page that already
/// reflects the logged change is an expected condition, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoOutcome {
    Applied,
    AlreadySatisfied,
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

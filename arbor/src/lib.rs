//! Storage kernel of a native XML store: B-link tree pages, write-ahead
//! logging with ARIES-style recovery, and node/edge locking.

pub mod bitmap;

pub mod blink;

pub mod blob;

pub mod buffer_pool;

pub mod config;

pub mod dewey;

pub mod edge_lock;

pub mod error;

pub mod failpoint;

pub mod field;

pub mod latch;

pub mod lock_manager;

pub mod log_op;

pub mod meta;

pub mod page;

pub mod page_id;

pub mod pager;

pub mod recovery;

pub mod search;

pub mod store;

pub mod transaction;

pub mod wal;

pub const PAGE_SIZE: usize = 8192;

/// Log sequence number: the byte offset of a record in the log file.
pub type Lsn = u64;

/// Terminates undo chains. The log file starts with a magic header, so no
/// record ever lives at offset zero.
pub const NO_LSN: Lsn = 0;

pub type TxId = u32;

pub use blink::{BlinkIndex, PageContext};
pub use buffer_pool::{BufferManager, Handle};
pub use config::StoreConfig;
pub use dewey::DeweyId;
pub use error::{RedoOutcome, Result, StoreError};
pub use field::Field;
pub use latch::LatchMode;
pub use page::Page;
pub use page_id::PageId;
pub use search::SearchMode;
pub use store::Store;
pub use transaction::{Tx, TxManager};

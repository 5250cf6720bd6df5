//! B-link tree index over slotted pages.
//!
//! Pages of one level form a chain through their `prev_page` header field,
//! which points to the right sibling. A split links the new sibling into the
//! chain before the parent learns about it, so a traversal holding a stale
//! parent pointer reaches the right page by walking right.

pub mod context;
pub mod navigation;
pub mod tree;

pub use context::PageContext;
pub use navigation::{ChildStream, HintPageInformation, NavigationMode, NavigationResult, NavigationStatus};
pub use tree::{BlinkIndex, IndexScan, VerifyReport};

use crate::page::USABLE_SPACE;

/// Values longer than this are stored in the overflow store.
pub const MAX_INLINE_VALUE: usize = USABLE_SPACE / 6;

/// Largest key an index accepts. Any two records then fit on one page,
/// so a split always makes room.
pub const MAX_KEY_SIZE: usize = USABLE_SPACE / 6;

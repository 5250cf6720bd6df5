//! Overflow storage for values too large to keep inline in a B-link page.
//!
//! A blob is a singly linked chain of pages. Each page stores the id of the
//! next page and one chunk of the value:
//!
//! ```text
//! | header (30) | next PageId (6) | chunk len u16 | chunk bytes ... |
//! ```
//!
//! A chain is owned by exactly one record. Writing allocates every page of
//! the chain before the first chunk is logged, so a failed write leaves only
//! allocations that rollback undoes.

use std::sync::Arc;

use tracing::debug;

use crate::buffer_pool::{BufferManager, MAX_PAGES_PER_CONTAINER};
use crate::error::{Result, StoreError};
use crate::failpoint::{self, Failpoint};
use crate::latch::LatchMode;
use crate::log_op::LogOperation;
use crate::page::{Page, PageKind, HEADER_SIZE};
use crate::page_id::PageId;
use crate::transaction::Tx;
use crate::PAGE_SIZE;

const NEXT_OFFSET: usize = HEADER_SIZE;
const LEN_OFFSET: usize = NEXT_OFFSET + PageId::SIZE;
const DATA_OFFSET: usize = LEN_OFFSET + 2;

/// Bytes of value data one overflow page holds.
pub const CHUNK_CAPACITY: usize = PAGE_SIZE - DATA_OFFSET;

/// Formats `page` as one link of a chain.
pub(crate) fn apply_chunk(page: &mut Page, unit: u32, next: PageId, data: &[u8]) -> Result<()> {
    if data.len() > CHUNK_CAPACITY {
        return Err(StoreError::fatal(page.id, "blob chunk exceeds page capacity"));
    }
    page.reset(PageKind::Blob);
    page.set_unit(unit);
    page.write_bytes(NEXT_OFFSET, &next.to_bytes())?;
    page.write_bytes(LEN_OFFSET, &(data.len() as u16).to_be_bytes())?;
    page.write_bytes(DATA_OFFSET, data)
}

fn read_chunk(page: &Page) -> Result<(PageId, &[u8])> {
    if page.kind() != Some(PageKind::Blob) {
        return Err(StoreError::fatal(page.id, "not an overflow page"));
    }
    let next = PageId::from_bytes(page.read_bytes(NEXT_OFFSET, PageId::SIZE)?)?;
    let raw = page.read_bytes(LEN_OFFSET, 2)?;
    let len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
    Ok((next, page.read_bytes(DATA_OFFSET, len)?))
}

fn log_chunk(tx: &Tx, page_id: PageId, unit: u32, next: PageId, data: &[u8]) -> Result<()> {
    let mut handle = tx.buffer_manager().fix(page_id, LatchMode::Exclusive)?;
    let (old_next, old_data) = match handle.page()?.kind() {
        Some(PageKind::Blob) => {
            let (old_next, old_data) = read_chunk(handle.page()?)?;
            (old_next, old_data.to_vec())
        }
        _ => (PageId::NONE, Vec::new()),
    };
    let op = LogOperation::BlobChunk {
        page: page_id,
        unit,
        next,
        data: data.to_vec(),
        old_next,
        old_data,
    };
    let lsn = tx.log_update(op.clone())?;
    op.apply(handle.page_mut()?)?;
    handle.set_lsn(lsn)
}

/// Creates an empty blob and returns the id of its first page.
pub fn create(tx: &Tx, container: u16, unit: u32) -> Result<PageId> {
    let handle = tx
        .buffer_manager()
        .allocate_page(tx, container, unit, None, true, None)?;
    let first = handle.page_id();
    drop(handle);
    log_chunk(tx, first, unit, PageId::NONE, &[])?;
    Ok(first)
}

/// Replaces the content of the blob starting at `first`. Surplus pages of
/// the old chain are released at commit.
pub fn write(tx: &Tx, first: PageId, data: &[u8]) -> Result<()> {
    let bm = tx.buffer_manager();
    let old_chain = chain(bm, first)?;
    let unit = bm.fix(first, LatchMode::Shared)?.page()?.unit();
    let chunks: Vec<&[u8]> = if data.is_empty() {
        vec![data]
    } else {
        data.chunks(CHUNK_CAPACITY).collect()
    };

    let mut pages = Vec::with_capacity(chunks.len());
    for i in 0..chunks.len() {
        match old_chain.get(i) {
            Some(&page) => pages.push(page),
            None => {
                let handle = bm.allocate_page(tx, first.container(), unit, None, true, None)?;
                pages.push(handle.page_id());
            }
        }
    }

    for (i, chunk) in chunks.iter().enumerate() {
        failpoint::check(Failpoint::BlobWrite)?;
        let next = pages.get(i + 1).copied().unwrap_or(PageId::NONE);
        log_chunk(tx, pages[i], unit, next, chunk)?;
    }
    for &surplus in old_chain.iter().skip(pages.len()) {
        bm.delete_page(tx, surplus, Some(unit), true, None)?;
    }
    debug!(first = %first, len = data.len(), pages = pages.len(), "wrote blob");
    Ok(())
}

/// Creates a blob holding `data`.
pub fn store(tx: &Tx, container: u16, unit: u32, data: &[u8]) -> Result<PageId> {
    let first = create(tx, container, unit)?;
    write(tx, first, data)?;
    Ok(first)
}

/// Reads the whole value of a blob.
pub fn read(bm: &Arc<BufferManager>, first: PageId) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut current = first;
    let mut hops = 0usize;
    while current.is_some() {
        let handle = bm.fix(current, LatchMode::Shared)?;
        let (next, data) = read_chunk(handle.page()?)?;
        out.extend_from_slice(data);
        current = next;
        hops += 1;
        if hops > MAX_PAGES_PER_CONTAINER {
            return Err(StoreError::fatal(first, "overflow chain does not terminate"));
        }
    }
    Ok(out)
}

/// Releases every page of the blob when the transaction commits.
pub fn remove(tx: &Tx, first: PageId) -> Result<()> {
    let bm = tx.buffer_manager();
    for page in chain(bm, first)? {
        bm.delete_page(tx, page, None, true, None)?;
    }
    Ok(())
}

/// Page ids of the chain, first page first.
pub fn chain(bm: &Arc<BufferManager>, first: PageId) -> Result<Vec<PageId>> {
    let mut pages = Vec::new();
    let mut current = first;
    while current.is_some() {
        if pages.len() > MAX_PAGES_PER_CONTAINER {
            return Err(StoreError::fatal(first, "overflow chain does not terminate"));
        }
        pages.push(current);
        let handle = bm.fix(current, LatchMode::Shared)?;
        current = read_chunk(handle.page()?)?.0;
    }
    Ok(pages)
}

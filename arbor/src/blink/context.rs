//! A cursor over one fixed B-link page.
//!
//! External positions are 1-based: position 0 is "before the first entry"
//! and `entry_count() + 1` is "after the last entry". Inserts go after the
//! current position.

use std::cell::Cell;
use std::cmp::Ordering;
use std::fmt::Write as _;

use tracing::trace;

use crate::blink::MAX_INLINE_VALUE;
use crate::blob;
use crate::buffer_pool::Handle;
use crate::error::{Result, StoreError};
use crate::field::Field;
use crate::latch::LatchMode;
use crate::log_op::{LogOperation, PageFormat, PointerKind, RecordAction, RecordOp};
use crate::page::{Page, PageKind, PageType, FLAG_LAST_IN_LEVEL, FLAG_UNIQUE, SLOT_EXTERNALIZED};
use crate::page_id::PageId;
use crate::search::SearchMode;
use crate::transaction::Tx;
use crate::Lsn;

#[derive(Debug, Clone, Copy)]
struct Header {
    page_type: PageType,
    key_type: Field,
    value_type: Field,
    unique: bool,
    root: PageId,
    unit: u32,
}

pub struct PageContext<'a> {
    tx: &'a Tx,
    handle: Handle,
    current_pos: usize,
    header: Cell<Option<Header>>,
}

/// First index in `lo..hi` for which `before` is false.
fn partition(lo: usize, hi: usize, mut before: impl FnMut(usize) -> Result<bool>) -> Result<usize> {
    let (mut lo, mut hi) = (lo, hi);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if before(mid)? {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

impl<'a> PageContext<'a> {
    pub fn new(tx: &'a Tx, handle: Handle) -> Self {
        Self {
            tx,
            handle,
            current_pos: 0,
            header: Cell::new(None),
        }
    }

    pub fn tx(&self) -> &'a Tx {
        self.tx
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut Handle {
        &mut self.handle
    }

    pub fn into_handle(self) -> Handle {
        self.handle
    }

    pub fn page_id(&self) -> PageId {
        self.handle.page_id()
    }

    pub fn page(&self) -> Result<&Page> {
        self.handle.page()
    }

    pub fn lsn(&self) -> Result<Lsn> {
        self.handle.lsn()
    }

    fn header(&self) -> Result<Header> {
        if let Some(header) = self.header.get() {
            return Ok(header);
        }
        let page = self.page()?;
        if page.kind() != Some(PageKind::Blink) {
            return Err(StoreError::fatal(page.id, "not a B-link page"));
        }
        let header = Header {
            page_type: page
                .page_type()
                .ok_or_else(|| StoreError::fatal(page.id, "invalid page type"))?,
            key_type: Field::from_id(page.key_type_id())?,
            value_type: Field::from_id(page.value_type_id())?,
            unique: page.flags() & FLAG_UNIQUE != 0,
            root: page.base_page(),
            unit: page.unit(),
        };
        self.header.set(Some(header));
        Ok(header)
    }

    pub fn page_type(&self) -> Result<PageType> {
        Ok(self.header()?.page_type)
    }

    pub fn is_leaf(&self) -> Result<bool> {
        Ok(self.header()?.page_type == PageType::Leaf)
    }

    pub fn key_type(&self) -> Result<Field> {
        Ok(self.header()?.key_type)
    }

    pub fn value_type(&self) -> Result<Field> {
        Ok(self.header()?.value_type)
    }

    pub fn is_unique(&self) -> Result<bool> {
        Ok(self.header()?.unique)
    }

    pub fn root_page_id(&self) -> Result<PageId> {
        Ok(self.header()?.root)
    }

    pub fn unit(&self) -> Result<u32> {
        Ok(self.header()?.unit)
    }

    pub fn height(&self) -> Result<u8> {
        Ok(self.page()?.height())
    }

    /// The right sibling.
    pub fn prev_page_id(&self) -> Result<PageId> {
        Ok(self.page()?.prev_page())
    }

    pub fn low_page_id(&self) -> Result<PageId> {
        Ok(self.page()?.low_page())
    }

    pub fn is_last_in_level(&self) -> Result<bool> {
        Ok(self.page()?.flags() & FLAG_LAST_IN_LEVEL != 0)
    }

    pub fn entry_count(&self) -> Result<usize> {
        Ok(self.page()?.record_count())
    }

    pub fn free_space(&self) -> Result<usize> {
        Ok(self.page()?.free_space())
    }

    // ---- cursor ----

    pub fn position(&self) -> usize {
        self.current_pos
    }

    pub fn move_to(&mut self, pos: usize) -> Result<()> {
        let count = self.entry_count()?;
        if pos > count + 1 {
            return Err(StoreError::InvalidArgument(format!(
                "position {pos} on a page with {count} entries"
            )));
        }
        self.current_pos = pos;
        Ok(())
    }

    pub fn has_next(&self) -> Result<bool> {
        Ok(self.current_pos < self.entry_count()?)
    }

    pub fn move_next(&mut self) -> Result<bool> {
        let count = self.entry_count()?;
        if self.current_pos < count {
            self.current_pos += 1;
            return Ok(true);
        }
        self.current_pos = count + 1;
        Ok(false)
    }

    pub fn has_previous(&self) -> bool {
        self.current_pos > 1
    }

    pub fn move_previous(&mut self) -> bool {
        if self.current_pos > 1 {
            self.current_pos -= 1;
            return true;
        }
        self.current_pos = 0;
        false
    }

    pub fn move_first(&mut self) -> Result<bool> {
        let count = self.entry_count()?;
        self.current_pos = usize::from(count > 0);
        Ok(count > 0)
    }

    pub fn move_last(&mut self) -> Result<bool> {
        self.current_pos = self.entry_count()?;
        Ok(self.current_pos > 0)
    }

    pub fn move_after_last(&mut self) -> Result<()> {
        self.current_pos = self.entry_count()? + 1;
        Ok(())
    }

    pub fn is_after_last(&self) -> Result<bool> {
        Ok(self.current_pos > self.entry_count()?)
    }

    pub fn is_before_first(&self) -> bool {
        self.current_pos == 0
    }

    /// 0-based slot of the entry under the cursor.
    fn slot_index(&self) -> Result<usize> {
        let count = self.entry_count()?;
        if self.current_pos == 0 || self.current_pos > count {
            return Err(StoreError::fatal(
                self.page_id(),
                format!("cursor at {} is not on one of {count} entries", self.current_pos),
            ));
        }
        Ok(self.current_pos - 1)
    }

    // ---- reads ----

    pub fn key(&self) -> Result<&[u8]> {
        self.page()?.key(self.slot_index()?)
    }

    /// The stored value bytes: for an externalized value, the id of its
    /// first overflow page.
    pub fn stored_value(&self) -> Result<&[u8]> {
        self.page()?.value(self.slot_index()?)
    }

    pub fn is_externalized(&self) -> Result<bool> {
        Ok(self.page()?.slot_flags(self.slot_index()?)? & SLOT_EXTERNALIZED != 0)
    }

    /// The logical value, read from the overflow store when externalized.
    pub fn value(&self) -> Result<Vec<u8>> {
        if self.is_externalized()? {
            let first = PageId::from_bytes(self.stored_value()?)?;
            return blob::read(self.tx.buffer_manager(), first).map_err(|source| StoreError::Blob {
                page: self.page_id(),
                source: Box::new(source),
            });
        }
        Ok(self.stored_value()?.to_vec())
    }

    pub fn value_as_page_id(&self) -> Result<PageId> {
        PageId::from_bytes(self.stored_value()?)
    }

    /// Key and stored value at a 1-based position.
    pub fn entry_at(&self, pos: usize) -> Result<(&[u8], &[u8])> {
        let page = self.page()?;
        if pos == 0 {
            return Err(StoreError::fatal(page.id, "position 0 holds no entry"));
        }
        Ok((page.key(pos - 1)?, page.value(pos - 1)?))
    }

    pub fn calc_max_inline_value_size(&self) -> usize {
        MAX_INLINE_VALUE
    }

    pub fn calc_max_key_size(&self) -> Result<usize> {
        Err(StoreError::Unsupported("maximum key size of a page context"))
    }

    // ---- mutation ----

    fn require_exclusive(&self) -> Result<()> {
        if self.handle.latch_mode() != Some(LatchMode::Exclusive) {
            return Err(StoreError::NotLatched(self.page_id()));
        }
        Ok(())
    }

    fn log_and_apply(&mut self, op: LogOperation, logged: bool, undo_next: Option<Lsn>) -> Result<()> {
        let lsn = if logged {
            Some(match undo_next {
                Some(undo_next) => self.tx.log_clr(op.clone(), undo_next)?,
                None => self.tx.log_update(op.clone())?,
            })
        } else {
            None
        };
        op.apply(self.handle.page_mut()?)?;
        if let Some(lsn) = lsn {
            self.handle.set_lsn(lsn)?;
        }
        Ok(())
    }

    fn blob_error(&self, source: StoreError) -> StoreError {
        StoreError::Blob {
            page: self.page_id(),
            source: Box::new(source),
        }
    }

    /// Inserts a record after the current position and moves the cursor
    /// onto it. Returns false without touching the page when it does not fit.
    pub fn insert(
        &mut self,
        key: &[u8],
        value: &[u8],
        smo: bool,
        logged: bool,
        undo_next: Option<Lsn>,
    ) -> Result<bool> {
        self.require_exclusive()?;
        let externalize = value.len() > MAX_INLINE_VALUE;
        let stored_len = if externalize { PageId::SIZE } else { value.len() };
        if !self.page()?.fits(key.len(), stored_len) {
            return Ok(false);
        }
        if !externalize {
            return self.insert_stored(key, value, false, smo, logged, undo_next);
        }
        let unit = self.unit()?;
        let first = blob::store(self.tx, self.page_id().container(), unit, value)
            .map_err(|e| self.blob_error(e))?;
        self.insert_stored(key, &first.to_bytes(), true, smo, logged, undo_next)
    }

    /// Inserts a record whose value is already in stored form.
    pub fn insert_stored(
        &mut self,
        key: &[u8],
        stored: &[u8],
        externalized: bool,
        smo: bool,
        logged: bool,
        undo_next: Option<Lsn>,
    ) -> Result<bool> {
        self.require_exclusive()?;
        let header = self.header()?;
        let page = self.page()?;
        if !page.fits(key.len(), stored.len()) {
            return Ok(false);
        }
        let idx = self.current_pos.min(page.record_count());
        let op = LogOperation::Record(RecordOp {
            action: RecordAction::Insert,
            smo,
            page: self.page_id(),
            root: header.root,
            pos: idx as u16,
            key: key.to_vec(),
            value: stored.to_vec(),
            externalized,
            old_value: Vec::new(),
            old_externalized: false,
        });
        self.log_and_apply(op, logged, undo_next)?;
        self.current_pos = idx + 1;
        Ok(true)
    }

    /// Replaces the value under the cursor. Returns false without touching
    /// the page when the new value does not fit. A replaced overflow chain
    /// is released when the transaction commits.
    pub fn set_value(&mut self, value: &[u8], smo: bool, logged: bool, undo_next: Option<Lsn>) -> Result<bool> {
        self.require_exclusive()?;
        let old_externalized = self.is_externalized()?;
        let old_stored = self.stored_value()?.to_vec();
        let externalize = value.len() > MAX_INLINE_VALUE;
        let stored_len = if externalize { PageId::SIZE } else { value.len() };
        if stored_len > old_stored.len() && self.free_space()? + old_stored.len() < stored_len {
            return Ok(false);
        }

        let replaced = if externalize {
            let unit = self.unit()?;
            let first = blob::store(self.tx, self.page_id().container(), unit, value)
                .map_err(|e| self.blob_error(e))?;
            self.set_stored_value(&first.to_bytes(), true, smo, logged, undo_next)?
        } else {
            self.set_stored_value(value, false, smo, logged, undo_next)?
        };
        if replaced && old_externalized && !smo && logged && undo_next.is_none() {
            blob::remove(self.tx, PageId::from_bytes(&old_stored)?).map_err(|e| self.blob_error(e))?;
        }
        Ok(replaced)
    }

    /// Replaces the stored value under the cursor without any overflow
    /// store work.
    pub fn set_stored_value(
        &mut self,
        stored: &[u8],
        externalized: bool,
        smo: bool,
        logged: bool,
        undo_next: Option<Lsn>,
    ) -> Result<bool> {
        self.require_exclusive()?;
        let header = self.header()?;
        let idx = self.slot_index()?;
        let old_stored = self.stored_value()?.to_vec();
        if stored.len() > old_stored.len() && self.free_space()? + old_stored.len() < stored.len() {
            return Ok(false);
        }
        let op = LogOperation::Record(RecordOp {
            action: RecordAction::Update,
            smo,
            page: self.page_id(),
            root: header.root,
            pos: idx as u16,
            key: self.key()?.to_vec(),
            value: stored.to_vec(),
            externalized,
            old_value: old_stored,
            old_externalized: self.is_externalized()?,
        });
        self.log_and_apply(op, logged, undo_next)?;
        Ok(true)
    }

    pub fn set_page_id_as_value(
        &mut self,
        page_id: PageId,
        smo: bool,
        logged: bool,
        undo_next: Option<Lsn>,
    ) -> Result<bool> {
        self.set_stored_value(&page_id.to_bytes(), false, smo, logged, undo_next)
    }

    /// Removes the entry under the cursor. The cursor stays at the same
    /// position, which now holds the following entry.
    pub fn delete(&mut self, smo: bool, logged: bool, undo_next: Option<Lsn>) -> Result<()> {
        self.require_exclusive()?;
        let header = self.header()?;
        let idx = self.slot_index()?;
        let externalized = self.is_externalized()?;
        let stored = self.stored_value()?.to_vec();
        let op = LogOperation::Record(RecordOp {
            action: RecordAction::Delete,
            smo,
            page: self.page_id(),
            root: header.root,
            pos: idx as u16,
            key: self.key()?.to_vec(),
            value: stored.clone(),
            externalized,
            old_value: Vec::new(),
            old_externalized: false,
        });
        self.log_and_apply(op, logged, undo_next)?;
        if externalized && !smo && logged && undo_next.is_none() {
            blob::remove(self.tx, PageId::from_bytes(&stored)?).map_err(|e| self.blob_error(e))?;
        }
        Ok(())
    }

    /// Resets the page to an empty B-link page described by `format`.
    pub fn format(&mut self, format: &PageFormat, logged: bool, undo_next: Option<Lsn>) -> Result<()> {
        self.require_exclusive()?;
        let op = LogOperation::Format {
            page: self.page_id(),
            before: PageFormat::read(self.page()?),
            after: *format,
        };
        self.log_and_apply(op, logged, undo_next)?;
        self.header.set(None);
        self.current_pos = 0;
        Ok(())
    }

    fn set_pointer(&mut self, kind: PointerKind, new: PageId, logged: bool, undo_next: Option<Lsn>) -> Result<()> {
        self.require_exclusive()?;
        let old = match kind {
            PointerKind::Prev => self.prev_page_id()?,
            PointerKind::Low => self.low_page_id()?,
        };
        let op = LogOperation::Pointer {
            kind,
            page: self.page_id(),
            root: self.root_page_id()?,
            old,
            new,
        };
        self.log_and_apply(op, logged, undo_next)
    }

    pub fn set_prev_page_id(&mut self, page_id: PageId, logged: bool, undo_next: Option<Lsn>) -> Result<()> {
        self.set_pointer(PointerKind::Prev, page_id, logged, undo_next)
    }

    pub fn set_low_page_id(&mut self, page_id: PageId, logged: bool, undo_next: Option<Lsn>) -> Result<()> {
        self.set_pointer(PointerKind::Low, page_id, logged, undo_next)
    }

    pub fn set_last_in_level(&mut self, last: bool, logged: bool, undo_next: Option<Lsn>) -> Result<()> {
        self.require_exclusive()?;
        let op = LogOperation::LastInLevel {
            page: self.page_id(),
            root: self.root_page_id()?,
            old: self.is_last_in_level()?,
            new: last,
        };
        self.log_and_apply(op, logged, undo_next)
    }

    // ---- search ----

    /// Positions the cursor for `mode` relative to `key` and, on non-unique
    /// pages, `value`, comparing (key, value) pairs.
    ///
    /// Returns 0 when the cursor entry equals the target, a negative number
    /// when it is the greatest entry below the target and a positive number
    /// when it is the smallest entry above it or the page is empty.
    pub fn search(&mut self, mode: SearchMode, key: &[u8], value: Option<&[u8]>) -> Result<i32> {
        let header = self.header()?;
        let page = self.page()?;
        let count = page.record_count();
        let (kf, vf) = (header.key_type, header.value_type);

        let (lt, le) = match mode {
            SearchMode::First | SearchMode::Last | SearchMode::Random => (0, 0),
            _ => {
                let lt = partition(0, count, |i| Ok(kf.compare(page.key(i)?, key) == Ordering::Less))?;
                let le = partition(lt, count, |i| Ok(kf.compare(page.key(i)?, key) != Ordering::Greater))?;
                match value {
                    Some(value) if !header.unique && lt < le => {
                        let vlt = partition(lt, le, |i| Ok(vf.compare(page.value(i)?, value) == Ordering::Less))?;
                        let vle = partition(vlt, le, |i| {
                            Ok(vf.compare(page.value(i)?, value) != Ordering::Greater)
                        })?;
                        trace!(page = %page.id, lt, le, vlt, vle, "value search inside key run");
                        (vlt, vle)
                    }
                    _ => (lt, le),
                }
            }
        };

        let (pos, result) = match mode {
            _ if count == 0 => (0, 1),
            SearchMode::First => (1, 0),
            SearchMode::Last => (count, 0),
            SearchMode::Random => (SearchMode::random_index(count) + 1, 0),
            SearchMode::LessOrEqual if le > 0 => (le, if le > lt { 0 } else { -1 }),
            SearchMode::LessOrEqual => (1, 1),
            SearchMode::Less if lt > 0 => (lt, -1),
            SearchMode::Less => (1, if le > 0 { 0 } else { 1 }),
            SearchMode::GreaterOrEqual if lt < count => (lt + 1, if le > lt { 0 } else { 1 }),
            SearchMode::GreaterOrEqual => (count, -1),
            SearchMode::Greater if le < count => (le + 1, 1),
            SearchMode::Greater => (count, if lt < count { 0 } else { -1 }),
        };
        trace!(page = %self.page_id(), ?mode, count, pos, result, "search");
        self.current_pos = pos;
        Ok(result)
    }

    /// Positions the cursor after which `key` (and `value`) would be
    /// inserted. Returns true if an equal entry already exists.
    pub fn find_pos(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        let result = self.search(SearchMode::LessOrEqual, key, value)?;
        if result > 0 {
            self.current_pos = 0;
        }
        Ok(result == 0)
    }

    /// Resolves the child of an index page to descend into for `key`. The
    /// cursor is left on the chosen entry, or at 0 for the low page.
    pub fn search_next_page_id(&mut self, mode: SearchMode, key: &[u8]) -> Result<PageId> {
        if self.page_type()? != PageType::Index {
            return Err(StoreError::fatal(self.page_id(), "child search on a leaf page"));
        }
        let count = self.entry_count()?;
        let low = self.low_page_id()?;
        let pos = if mode == SearchMode::Random {
            let children = count + usize::from(low.is_some());
            if children == 0 {
                0
            } else {
                SearchMode::random_index(children) + usize::from(low.is_none())
            }
        } else {
            let result = self.search(mode, key, None)?;
            if result > 0 || (mode == SearchMode::Less && result == 0) {
                0
            } else {
                self.current_pos
            }
        };

        if pos == 0 {
            if low.is_some() {
                self.current_pos = 0;
                return Ok(low);
            }
            if count == 0 {
                return Err(StoreError::fatal(self.page_id(), "index page without children"));
            }
            self.current_pos = 1;
        } else {
            self.current_pos = pos;
        }
        self.value_as_page_id()
    }

    /// Renders the page header and entries for debugging.
    pub fn dump(&self) -> Result<String> {
        let header = self.header()?;
        let page = self.page()?;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "page {} {:?} root={} height={} unique={} last={} prev={} low={} lsn={} entries={} free={}",
            page.id,
            header.page_type,
            header.root,
            page.height(),
            header.unique,
            page.flags() & FLAG_LAST_IN_LEVEL != 0,
            page.prev_page(),
            page.low_page(),
            page.lsn(),
            page.record_count(),
            page.free_space(),
        );
        for i in 0..page.record_count() {
            let key = header.key_type.display(page.key(i)?);
            let value = if page.slot_flags(i)? & SLOT_EXTERNALIZED != 0 {
                format!("-> {}", PageId::from_bytes(page.value(i)?)?)
            } else if header.page_type == PageType::Index {
                PageId::from_bytes(page.value(i)?)?.to_string()
            } else {
                header.value_type.display(page.value(i)?)
            };
            let _ = writeln!(out, "  {:>4}: {key} = {value}", i + 1);
        }
        Ok(out)
    }
}

//! B-link tree operations: descent, move-right, splits, cursors, and the
//! logical undo of user record changes.
//!
//! The root page id never changes. A descent carries, for the page it is on,
//! the right neighbours and separators its parent knew about. A page whose
//! right sibling differs from that expectation was split after the parent
//! was read; the traversal then walks right when the sibling's first entry
//! proves the target lies there, and otherwise restarts from the root.
//! A split keeps both halves latched until the parent holds the separator,
//! so a restart always finds the separator in place.

use std::cmp::Ordering;

use tracing::{debug, error, trace};

use crate::blink::context::PageContext;
use crate::blink::navigation::HintPageInformation;
use crate::blink::{MAX_INLINE_VALUE, MAX_KEY_SIZE};
use crate::buffer_pool::BufferManager;
use crate::error::{Result, StoreError};
use crate::field::Field;
use crate::latch::LatchMode;
use crate::log_op::{PageFormat, RecordAction, RecordOp};
use crate::meta::IndexStatistics;
use crate::page::{PageKind, PageType};
use crate::page_id::PageId;
use crate::search::SearchMode;
use crate::transaction::Tx;
use crate::{Lsn, NO_LSN};

const MAX_RESTARTS: usize = 64;

/// Right neighbours of a page with the separators that bound them, the
/// nearest neighbour last.
type Neighbors = Vec<(PageId, Vec<u8>)>;

#[derive(Debug, Clone, Copy)]
struct Target<'k> {
    key: &'k [u8],
    value: Option<&'k [u8]>,
}

enum Step {
    Stay,
    Right,
    Peek,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub height: u8,
    /// Pages per level, root level first.
    pub pages_per_level: Vec<usize>,
    pub leaf_records: u64,
}

impl VerifyReport {
    pub fn pages(&self) -> usize {
        self.pages_per_level.iter().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlinkIndex {
    root: PageId,
    key_type: Field,
    value_type: Field,
    unique: bool,
    unit: u32,
}

impl BlinkIndex {
    /// Creates an empty index whose root is a fresh leaf.
    pub fn create(
        tx: &Tx,
        container: u16,
        unit: u32,
        key_type: Field,
        value_type: Field,
        unique: bool,
    ) -> Result<Self> {
        let handle = tx
            .buffer_manager()
            .allocate_page(tx, container, unit, None, true, None)?;
        let root = handle.page_id();
        let mut ctx = PageContext::new(tx, handle);
        ctx.format(
            &PageFormat::blink(unit, PageType::Leaf, root, key_type, value_type, unique),
            true,
            None,
        )?;
        debug!(root = %root, ?key_type, ?value_type, unique, "created index");
        Ok(Self {
            root,
            key_type,
            value_type,
            unique,
            unit,
        })
    }

    pub fn open(bm: &std::sync::Arc<BufferManager>, root: PageId) -> Result<Self> {
        let handle = bm.fix(root, LatchMode::Shared)?;
        let page = handle.page()?;
        if page.kind() != Some(PageKind::Blink) || page.base_page() != root {
            return Err(StoreError::InvalidArgument(format!("page {root} is not an index root")));
        }
        let format = PageFormat::read(page);
        Ok(Self {
            root,
            key_type: format.key_type,
            value_type: format.value_type,
            unique: format.unique,
            unit: format.unit,
        })
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    pub fn key_type(&self) -> Field {
        self.key_type
    }

    pub fn value_type(&self) -> Field {
        self.value_type
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn unit(&self) -> u32 {
        self.unit
    }

    pub fn container(&self) -> u16 {
        self.root.container()
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_SIZE {
            return Err(StoreError::KeyTooLarge {
                len: key.len(),
                max: MAX_KEY_SIZE,
            });
        }
        Ok(())
    }

    fn check_value(&self, value: &[u8]) -> Result<()> {
        if !self.unique && value.len() > MAX_INLINE_VALUE {
            return Err(StoreError::InvalidArgument(format!(
                "values of a non-unique index are compared and must stay inline ({} > {MAX_INLINE_VALUE} bytes)",
                value.len()
            )));
        }
        Ok(())
    }

    // ---- comparisons ----

    fn first_is_right(&self, sibling: &PageContext<'_>, target: &Target<'_>, leaf: bool) -> Result<bool> {
        if sibling.entry_count()? == 0 {
            return Ok(false);
        }
        let (key, value) = sibling.entry_at(1)?;
        let ordering = self.key_type.compare(key, target.key);
        if self.unique {
            return Ok(ordering != Ordering::Greater);
        }
        Ok(match ordering {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => {
                leaf && target
                    .value
                    .is_some_and(|v| self.value_type.compare(value, v) != Ordering::Greater)
            }
        })
    }

    fn beyond_separator(&self, separator: &[u8], target: &Target<'_>, leaf: bool) -> Step {
        let ordering = self.key_type.compare(separator, target.key);
        if self.unique {
            return if ordering == Ordering::Greater { Step::Stay } else { Step::Right };
        }
        match ordering {
            Ordering::Less => Step::Right,
            Ordering::Equal if leaf && target.value.is_some() => Step::Peek,
            _ => Step::Stay,
        }
    }

    // ---- traversal ----

    pub(crate) fn fix_ctx<'a>(&self, tx: &'a Tx, page_id: PageId, mode: LatchMode) -> Result<PageContext<'a>> {
        let ctx = PageContext::new(tx, tx.buffer_manager().fix(page_id, mode)?);
        if ctx.root_page_id()? != self.root {
            return Err(StoreError::fatal(page_id, format!("page does not belong to index {}", self.root)));
        }
        Ok(ctx)
    }

    /// Walks right from `ctx` until it covers the target. Returns None when
    /// the descent has to restart.
    fn move_right<'a>(
        &self,
        tx: &'a Tx,
        mut ctx: PageContext<'a>,
        target: &Target<'_>,
        neighbors: &mut Neighbors,
        mode: LatchMode,
    ) -> Result<Option<PageContext<'a>>> {
        loop {
            if ctx.is_last_in_level()? {
                return Ok(Some(ctx));
            }
            let right = ctx.prev_page_id()?;
            if right.is_none() {
                return Err(StoreError::fatal(ctx.page_id(), "no right sibling below the last in level"));
            }
            let leaf = ctx.is_leaf()?;
            let step = neighbors
                .last()
                .filter(|(id, _)| *id == right)
                .map(|(_, separator)| self.beyond_separator(separator, target, leaf));
            match step {
                Some(Step::Stay) => return Ok(Some(ctx)),
                Some(Step::Right) => {
                    let sibling = self.fix_ctx(tx, right, mode)?;
                    neighbors.pop();
                    ctx = sibling;
                }
                Some(Step::Peek) => {
                    let sibling = self.fix_ctx(tx, right, mode)?;
                    if !self.first_is_right(&sibling, target, leaf)? {
                        return Ok(Some(ctx));
                    }
                    neighbors.pop();
                    ctx = sibling;
                }
                None => {
                    let sibling = self.fix_ctx(tx, right, mode)?;
                    if self.first_is_right(&sibling, target, leaf)? {
                        trace!(from = %ctx.page_id(), to = %right, "moved right past a split");
                        ctx = sibling;
                        continue;
                    }
                    // A page still holding the target key covers it.
                    if !self.unique && neighbors.is_empty() && ctx.move_last()? {
                        if self.key_type.compare(ctx.key()?, target.key) == Ordering::Equal {
                            return Ok(Some(ctx));
                        }
                    }
                    trace!(page = %ctx.page_id(), sibling = %right, "ambiguous sibling, restarting");
                    return Ok(None);
                }
            }
        }
    }

    /// Leftmost child of an index page.
    fn first_child(ctx: &mut PageContext<'_>) -> Result<PageId> {
        let low = ctx.low_page_id()?;
        if low.is_some() {
            return Ok(low);
        }
        if !ctx.move_first()? {
            return Err(StoreError::fatal(ctx.page_id(), "index page without children"));
        }
        ctx.value_as_page_id()
    }

    fn leftmost_child(&self, tx: &Tx, page_id: PageId) -> Result<PageId> {
        Self::first_child(&mut self.fix_ctx(tx, page_id, LatchMode::Shared)?)
    }

    /// Picks the child for `target` and what the child's level looks like
    /// to its right, as far as this page knows. The neighbour beyond this
    /// page is returned as the right sibling whose leftmost child it is,
    /// resolved once the latch on this page is gone.
    fn route(
        &self,
        ctx: &mut PageContext<'_>,
        target: &Target<'_>,
        neighbors: &Neighbors,
    ) -> Result<(PageId, Neighbors, Option<(PageId, Vec<u8>)>)> {
        let mode = if self.unique {
            SearchMode::LessOrEqual
        } else {
            SearchMode::Less
        };
        let child = ctx.search_next_page_id(mode, target.key)?;
        let mut beyond = None;
        if !ctx.is_last_in_level()? {
            let right = ctx.prev_page_id()?;
            beyond = neighbors
                .last()
                .filter(|(id, _)| *id == right)
                .map(|(id, separator)| (*id, separator.clone()));
        }
        let mut next = Neighbors::new();
        for pos in (ctx.position() + 1..=ctx.entry_count()?).rev() {
            let (key, value) = ctx.entry_at(pos)?;
            next.push((PageId::from_bytes(value)?, key.to_vec()));
        }
        Ok((child, next, beyond))
    }

    fn try_descend<'a>(
        &self,
        tx: &'a Tx,
        target: &Target<'_>,
        level: u8,
        mode: LatchMode,
    ) -> Result<Option<PageContext<'a>>> {
        let root_height = tx.buffer_manager().fix(self.root, LatchMode::Shared)?.page()?.height();
        if root_height < level {
            return Err(StoreError::InvalidArgument(format!(
                "level {level} is above the root at height {root_height}"
            )));
        }
        let mut page_id = self.root;
        let mut height = root_height;
        let mut neighbors = Neighbors::new();
        loop {
            let latch = if height == level { mode } else { LatchMode::Shared };
            let ctx = self.fix_ctx(tx, page_id, latch)?;
            if ctx.height()? != height {
                return Ok(None);
            }
            let Some(mut ctx) = self.move_right(tx, ctx, target, &mut neighbors, latch)? else {
                return Ok(None);
            };
            if height == level {
                return Ok(Some(ctx));
            }
            let (child, mut child_neighbors, beyond) = self.route(&mut ctx, target, &neighbors)?;
            drop(ctx);
            if let Some((right, separator)) = beyond {
                child_neighbors.insert(0, (self.leftmost_child(tx, right)?, separator));
            }
            page_id = child;
            neighbors = child_neighbors;
            height -= 1;
        }
    }

    /// Finds the page at `level` covering the target, latched in `mode`.
    fn descend<'a>(&self, tx: &'a Tx, target: &Target<'_>, level: u8, mode: LatchMode) -> Result<PageContext<'a>> {
        for attempt in 0..MAX_RESTARTS {
            if attempt > 0 {
                std::thread::yield_now();
            }
            if let Some(ctx) = self.try_descend(tx, target, level, mode)? {
                return Ok(ctx);
            }
        }
        error!(root = %self.root, "descent did not converge");
        Err(StoreError::fatal(self.root, "descent did not converge"))
    }

    /// The leaf a lookup of `key` starts at.
    pub fn find_leaf<'a>(&self, tx: &'a Tx, key: &[u8], mode: LatchMode) -> Result<PageContext<'a>> {
        self.descend(tx, &Target { key, value: None }, 0, mode)
    }

    /// Walks the sibling chain from `start` to the page of the same level
    /// covering `key`: right while the sibling's first key is not above it.
    pub fn move_right_from<'a>(
        &self,
        tx: &'a Tx,
        start: PageId,
        key: &[u8],
        mode: LatchMode,
    ) -> Result<PageContext<'a>> {
        let target = Target { key, value: None };
        let mut ctx = self.fix_ctx(tx, start, mode)?;
        loop {
            if ctx.is_last_in_level()? {
                return Ok(ctx);
            }
            let sibling = self.fix_ctx(tx, ctx.prev_page_id()?, mode)?;
            if !self.first_is_right(&sibling, &target, false)? {
                return Ok(ctx);
            }
            ctx = sibling;
        }
    }

    fn leftmost_leaf<'a>(&self, tx: &'a Tx) -> Result<PageContext<'a>> {
        let mut page_id = self.root;
        loop {
            let mut ctx = self.fix_ctx(tx, page_id, LatchMode::Shared)?;
            if ctx.is_leaf()? {
                return Ok(ctx);
            }
            page_id = Self::first_child(&mut ctx)?;
        }
    }

    // ---- splits ----

    /// First 1-based position of the upper half, balancing bytes.
    fn split_point(&self, ctx: &PageContext<'_>) -> Result<usize> {
        let count = ctx.entry_count()?;
        if count < 2 {
            return Err(StoreError::fatal(ctx.page_id(), "cannot split a page with fewer than two entries"));
        }
        let sizes = (1..=count)
            .map(|pos| ctx.entry_at(pos).map(|(k, v)| k.len() + v.len()))
            .collect::<Result<Vec<_>>>()?;
        let total: usize = sizes.iter().sum();
        let mut moved = 0;
        let mut from = count + 1;
        while from > 2 && moved * 2 < total {
            from -= 1;
            moved += sizes[from - 1];
        }
        Ok(from.min(count))
    }

    /// Copies entries `range` of `src` behind the cursor of `dst`, then
    /// removes them from `src`. Both changes are logged as SMO records.
    fn move_entries(
        &self,
        src: &mut PageContext<'_>,
        dst: &mut PageContext<'_>,
        range: std::ops::RangeInclusive<usize>,
    ) -> Result<()> {
        for pos in range.clone() {
            src.move_to(pos)?;
            let externalized = src.is_externalized()?;
            let (key, value) = src.entry_at(pos)?;
            let (key, value) = (key.to_vec(), value.to_vec());
            if !dst.insert_stored(&key, &value, externalized, true, true, None)? {
                return Err(StoreError::fatal(dst.page_id(), "split target overflow"));
            }
        }
        for pos in range.rev() {
            src.move_to(pos)?;
            src.delete(true, true, None)?;
        }
        Ok(())
    }

    /// Splits a full page. Both halves stay latched until the separator is
    /// in the parent, and the whole change is one nested top action.
    fn split(&self, tx: &Tx, mut ctx: PageContext<'_>) -> Result<()> {
        if ctx.page_id() == self.root {
            return self.split_root(tx, ctx);
        }
        let bm = tx.buffer_manager();
        let format = PageFormat::read(ctx.page()?);
        let count = ctx.entry_count()?;
        let from = self.split_point(&ctx)?;

        let saved = tx.begin_nested_top_action();
        let handle = bm.allocate_page(tx, self.container(), self.unit, None, true, None)?;
        let right_id = handle.page_id();
        let mut right = PageContext::new(tx, handle);
        right.format(
            &PageFormat {
                low: PageId::NONE,
                ..format
            },
            true,
            None,
        )?;
        self.move_entries(&mut ctx, &mut right, from..=count)?;
        ctx.set_prev_page_id(right_id, true, None)?;
        if format.last_in_level {
            ctx.set_last_in_level(false, true, None)?;
        }
        let separator = right.entry_at(1)?.0.to_vec();
        self.post_separator(tx, format.height + 1, ctx.page_id(), &separator, right_id)?;
        tx.end_nested_top_action(saved)?;
        debug!(
            page = %ctx.page_id(),
            right = %right_id,
            height = format.height,
            moved = count + 1 - from,
            "split page"
        );
        Ok(())
    }

    /// Moves the root's entries into two new children and reformats the
    /// root one level higher.
    fn split_root(&self, tx: &Tx, mut root: PageContext<'_>) -> Result<()> {
        let bm = tx.buffer_manager();
        let format = PageFormat::read(root.page()?);
        let count = root.entry_count()?;
        let from = self.split_point(&root)?;

        let saved = tx.begin_nested_top_action();
        let left_handle = bm.allocate_page(tx, self.container(), self.unit, None, true, None)?;
        let right_handle = bm.allocate_page(tx, self.container(), self.unit, None, true, None)?;
        let (left_id, right_id) = (left_handle.page_id(), right_handle.page_id());
        let mut left = PageContext::new(tx, left_handle);
        let mut right = PageContext::new(tx, right_handle);
        left.format(
            &PageFormat {
                prev: right_id,
                last_in_level: false,
                ..format
            },
            true,
            None,
        )?;
        right.format(
            &PageFormat {
                prev: PageId::NONE,
                low: PageId::NONE,
                last_in_level: true,
                ..format
            },
            true,
            None,
        )?;
        self.move_entries(&mut root, &mut right, from..=count)?;
        self.move_entries(&mut root, &mut left, 1..=from - 1)?;
        let separator = right.entry_at(1)?.0.to_vec();

        root.format(
            &PageFormat {
                page_type: PageType::Index,
                height: format.height + 1,
                low: left_id,
                prev: PageId::NONE,
                last_in_level: true,
                ..format
            },
            true,
            None,
        )?;
        if !root.insert_stored(&separator, &right_id.to_bytes(), false, true, true, None)? {
            return Err(StoreError::fatal(self.root, "separator does not fit a fresh root"));
        }
        tx.end_nested_top_action(saved)?;
        debug!(root = %self.root, left = %left_id, right = %right_id, height = format.height + 1, "split root");
        Ok(())
    }

    /// Position of the entry pointing at `child`, 0 for the low page.
    fn child_position(&self, ctx: &PageContext<'_>, child: PageId) -> Result<Option<usize>> {
        if ctx.low_page_id()? == child {
            return Ok(Some(0));
        }
        for pos in 1..=ctx.entry_count()? {
            if PageId::from_bytes(ctx.entry_at(pos)?.1)? == child {
                return Ok(Some(pos));
            }
        }
        Ok(None)
    }

    /// Inserts the separator for a split of `left` into the level above,
    /// right after the entry for `left`.
    fn post_separator(&self, tx: &Tx, level: u8, left: PageId, separator: &[u8], right: PageId) -> Result<()> {
        let target = Target {
            key: separator,
            value: None,
        };
        loop {
            let mut ctx = self.descend(tx, &target, level, LatchMode::Exclusive)?;
            let pos = loop {
                if let Some(pos) = self.child_position(&ctx, left)? {
                    break pos;
                }
                if ctx.is_last_in_level()? {
                    error!(parent_level = level, child = %left, "parent entry of split page not found");
                    return Err(StoreError::fatal(left, "parent entry of split page not found"));
                }
                let next = self.fix_ctx(tx, ctx.prev_page_id()?, LatchMode::Exclusive)?;
                ctx = next;
            };
            ctx.move_to(pos)?;
            if ctx.insert_stored(separator, &right.to_bytes(), false, true, true, None)? {
                trace!(parent = %ctx.page_id(), left = %left, right = %right, "posted separator");
                return Ok(());
            }
            self.split(tx, ctx)?;
        }
    }

    // ---- record operations ----

    /// Inserts a record. A unique index rejects an existing key; a non-unique
    /// one rejects an existing (key, value) pair.
    pub fn insert(&self, tx: &Tx, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_key(key)?;
        self.check_value(value)?;
        let target = Target {
            key,
            value: Some(value),
        };
        loop {
            let mut ctx = self.descend(tx, &target, 0, LatchMode::Exclusive)?;
            if ctx.find_pos(key, Some(value))? {
                return Err(StoreError::DuplicateKey);
            }
            let page = ctx.page_id();
            if ctx
                .insert(key, value, false, true, None)
                .map_err(|e| local(e, page, "insert"))?
            {
                return Ok(());
            }
            self.split(tx, ctx)?;
        }
    }

    /// Value of the first record with `key`.
    pub fn get(&self, tx: &Tx, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.scan(tx, Some(key)).next().transpose()? {
            Some((found, value)) if self.key_type.compare(&found, key) == Ordering::Equal => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    /// Values of every record with `key`, in value order.
    pub fn get_all(&self, tx: &Tx, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut values = Vec::new();
        for entry in self.scan(tx, Some(key)) {
            let (found, value) = entry?;
            if self.key_type.compare(&found, key) != Ordering::Equal {
                break;
            }
            values.push(value);
        }
        Ok(values)
    }

    /// Replaces the value of an existing key. Unique indexes only.
    pub fn update(&self, tx: &Tx, key: &[u8], value: &[u8]) -> Result<bool> {
        if !self.unique {
            return Err(StoreError::InvalidArgument("update on a non-unique index".into()));
        }
        self.check_key(key)?;
        let target = Target { key, value: None };
        loop {
            let mut ctx = self.descend(tx, &target, 0, LatchMode::Exclusive)?;
            if !ctx.find_pos(key, None)? {
                return Ok(false);
            }
            let page = ctx.page_id();
            if ctx
                .set_value(value, false, true, None)
                .map_err(|e| local(e, page, "update"))?
            {
                return Ok(true);
            }
            self.split(tx, ctx)?;
        }
    }

    /// Removes a record. A non-unique index needs the value to pick the
    /// record.
    pub fn delete(&self, tx: &Tx, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        if !self.unique && value.is_none() {
            return Err(StoreError::InvalidArgument("delete on a non-unique index needs a value".into()));
        }
        let value = if self.unique { None } else { value };
        let mut ctx = self.descend(tx, &Target { key, value }, 0, LatchMode::Exclusive)?;
        if !ctx.find_pos(key, value)? {
            return Ok(false);
        }
        let page = ctx.page_id();
        ctx.delete(false, true, None).map_err(|e| local(e, page, "delete"))?;
        Ok(true)
    }

    /// Forward cursor over (key, value) pairs starting at the first key not
    /// below `from`.
    pub fn scan<'a>(&'a self, tx: &'a Tx, from: Option<&[u8]>) -> IndexScan<'a> {
        IndexScan {
            index: self,
            tx,
            start: from.map(<[u8]>::to_vec),
            page: PageId::NONE,
            lsn: NO_LSN,
            pos: 0,
            last: None,
            done: false,
        }
    }

    // ---- diagnostics ----

    /// Checks every level: page ownership and height, key order inside
    /// pages and across siblings, and the last-in-level flag.
    pub fn verify(&self, tx: &Tx) -> Result<VerifyReport> {
        let root_height = self.fix_ctx(tx, self.root, LatchMode::Shared)?.height()?;
        let mut report = VerifyReport {
            height: root_height,
            pages_per_level: Vec::new(),
            leaf_records: 0,
        };
        let mut first = self.root;
        for height in (0..=root_height).rev() {
            let mut page_id = first;
            let mut previous_last: Option<(Vec<u8>, Vec<u8>)> = None;
            let mut pages = 0;
            loop {
                let ctx = self.fix_ctx(tx, page_id, LatchMode::Shared)?;
                pages += 1;
                if ctx.height()? != height || ctx.is_leaf()? != (height == 0) {
                    return Err(StoreError::fatal(page_id, format!("page misplaced at level {height}")));
                }
                let count = ctx.entry_count()?;
                for pos in 1..=count {
                    let (key, value) = ctx.entry_at(pos)?;
                    if let Some((prev_key, prev_value)) = &previous_last {
                        if !self.in_order(prev_key, prev_value, key, value, height == 0) {
                            return Err(StoreError::fatal(
                                page_id,
                                format!("entry {pos} out of order: {}", self.key_type.display(key)),
                            ));
                        }
                    }
                    previous_last = Some((key.to_vec(), value.to_vec()));
                }
                if height == 0 {
                    report.leaf_records += count as u64;
                }
                if ctx.is_last_in_level()? {
                    break;
                }
                page_id = ctx.prev_page_id()?;
                if page_id.is_none() {
                    return Err(StoreError::fatal(ctx.page_id(), "level ends without the last-in-level flag"));
                }
            }
            report.pages_per_level.push(pages);
            if height > 0 {
                first = self.leftmost_child(tx, first)?;
            }
        }
        Ok(report)
    }

    fn in_order(&self, prev_key: &[u8], prev_value: &[u8], key: &[u8], value: &[u8], leaf: bool) -> bool {
        let ordering = self.key_type.compare(prev_key, key);
        if self.unique {
            return ordering == Ordering::Less;
        }
        match ordering {
            Ordering::Equal if leaf => self.value_type.compare(prev_value, value) != Ordering::Greater,
            ordering => ordering != Ordering::Greater,
        }
    }

    /// Estimates the shape of the tree from `probes` random root-to-leaf
    /// walks.
    pub fn sample(&self, tx: &Tx, probes: usize) -> Result<IndexStatistics> {
        let probes = probes.max(1);
        let mut height = 0;
        let (mut fanout_sum, mut index_pages) = (0usize, 0usize);
        let mut leaf_entries = 0usize;
        for _ in 0..probes {
            let mut page_id = self.root;
            loop {
                let mut ctx = self.fix_ctx(tx, page_id, LatchMode::Shared)?;
                if ctx.is_leaf()? {
                    leaf_entries += ctx.entry_count()?;
                    break;
                }
                height = height.max(ctx.height()?);
                fanout_sum += ctx.entry_count()? + usize::from(ctx.low_page_id()?.is_some());
                index_pages += 1;
                page_id = ctx.search_next_page_id(SearchMode::Random, &[])?;
            }
        }
        let avg_leaf_entries = leaf_entries as f64 / probes as f64;
        let avg_fanout = if index_pages == 0 {
            1.0
        } else {
            fanout_sum as f64 / index_pages as f64
        };
        let estimated_leaf_pages = avg_fanout.powi(i32::from(height)).round().max(1.0) as u64;
        Ok(IndexStatistics {
            height,
            probes,
            avg_fanout,
            avg_leaf_entries,
            estimated_leaf_pages,
            estimated_records: (estimated_leaf_pages as f64 * avg_leaf_entries).round() as u64,
        })
    }

    // ---- logical undo ----

    /// The leaf to undo `op` on: the logged page while it still covers the
    /// record, the page a descent finds otherwise.
    fn locate_for_undo<'a>(&self, tx: &'a Tx, op: &RecordOp, value: &[u8]) -> Result<PageContext<'a>> {
        let bm = tx.buffer_manager();
        if bm.is_allocated(op.page)? {
            let handle = bm.fix(op.page, LatchMode::Exclusive)?;
            let format = PageFormat::read(handle.page()?);
            if format.kind == PageKind::Blink && format.page_type == PageType::Leaf && format.root == self.root {
                let mut ctx = PageContext::new(tx, handle);
                if self.covers(&mut ctx, op, value)? {
                    return Ok(ctx);
                }
            }
        }
        trace!(page = %op.page, "record moved, undoing through the tree");
        self.descend(
            tx,
            &Target {
                key: &op.key,
                value: Some(value),
            },
            0,
            LatchMode::Exclusive,
        )
    }

    fn covers(&self, ctx: &mut PageContext<'_>, op: &RecordOp, value: &[u8]) -> Result<bool> {
        let exists = ctx.find_pos(&op.key, Some(value))?;
        if op.action != RecordAction::Delete {
            return Ok(exists);
        }
        let count = ctx.entry_count()?;
        if exists || count == 0 {
            return Ok(false);
        }
        // Strictly between the first and the last entry.
        Ok(ctx.position() >= 1 && ctx.position() < count)
    }

    fn undo_record(&self, tx: &Tx, op: &RecordOp, undo_next: Lsn) -> Result<()> {
        match op.action {
            RecordAction::Insert => {
                let mut ctx = self.locate_for_undo(tx, op, &op.value)?;
                if !ctx.find_pos(&op.key, Some(&op.value))? {
                    return Err(StoreError::fatal(ctx.page_id(), "inserted record to undo is missing"));
                }
                ctx.delete(false, true, Some(undo_next))
            }
            RecordAction::Delete => loop {
                let mut ctx = self.locate_for_undo(tx, op, &op.value)?;
                if ctx.find_pos(&op.key, Some(&op.value))? {
                    return Err(StoreError::fatal(ctx.page_id(), "deleted record to restore is present"));
                }
                if ctx.insert_stored(&op.key, &op.value, op.externalized, false, true, Some(undo_next))? {
                    return Ok(());
                }
                self.split(tx, ctx)?;
            },
            RecordAction::Update => loop {
                let mut ctx = self.locate_for_undo(tx, op, &op.value)?;
                if !ctx.find_pos(&op.key, Some(&op.value))? {
                    return Err(StoreError::fatal(ctx.page_id(), "updated record to undo is missing"));
                }
                if ctx.set_stored_value(&op.old_value, op.old_externalized, false, true, Some(undo_next))? {
                    return Ok(());
                }
                self.split(tx, ctx)?;
            },
        }
    }
}

/// Wraps a page-local failure with the page it happened on.
fn local(error: StoreError, page: PageId, operation: &str) -> StoreError {
    match error {
        StoreError::Blob { .. } | StoreError::Index { .. } | StoreError::Lock(_) => error,
        error => error.on_page(page, operation),
    }
}

/// Undoes a user record change logically, through the index it belongs to.
pub(crate) fn undo_user_record(tx: &Tx, op: &RecordOp, undo_next: Lsn) -> Result<()> {
    BlinkIndex::open(tx.buffer_manager(), op.root)?.undo_record(tx, op, undo_next)
}

/// Forward cursor over an index. It holds no latch between items and
/// revalidates its position through the page LSN.
pub struct IndexScan<'a> {
    index: &'a BlinkIndex,
    tx: &'a Tx,
    start: Option<Vec<u8>>,
    page: PageId,
    lsn: Lsn,
    /// Position of the last returned entry, 1-based.
    pos: usize,
    /// Key and stored value of the last returned entry.
    last: Option<(Vec<u8>, Vec<u8>)>,
    done: bool,
}

impl<'a> IndexScan<'a> {
    /// Page and LSN the last item was read from.
    pub fn hint(&self) -> Option<HintPageInformation> {
        self.last.as_ref().map(|_| HintPageInformation {
            page_id: self.page,
            lsn: self.lsn,
        })
    }

    /// Positions the cursor on the leaf where the scan continues.
    fn seek(&mut self) -> Result<PageContext<'a>> {
        let index = self.index;
        let mut ctx = match (&self.last, &self.start) {
            (Some((key, value)), _) => {
                let value = (!index.unique).then_some(value.as_slice());
                let mut ctx = index.descend(self.tx, &Target { key, value }, 0, LatchMode::Shared)?;
                let result = ctx.search(SearchMode::Greater, key, value)?;
                self.pos = if result > 0 {
                    ctx.position().saturating_sub(1)
                } else {
                    ctx.entry_count()?
                };
                ctx
            }
            (None, Some(start)) => {
                let mut ctx = index.find_leaf(self.tx, start, LatchMode::Shared)?;
                let result = ctx.search(SearchMode::GreaterOrEqual, start, None)?;
                self.pos = if result >= 0 {
                    ctx.position().saturating_sub(1)
                } else {
                    ctx.entry_count()?
                };
                ctx
            }
            (None, None) => {
                self.pos = 0;
                index.leftmost_leaf(self.tx)?
            }
        };
        self.page = ctx.page_id();
        self.lsn = ctx.lsn()?;
        ctx.move_to(self.pos)?;
        Ok(ctx)
    }

    fn step(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut ctx = if self.page.is_none() {
            self.seek()?
        } else {
            let ctx = self.index.fix_ctx(self.tx, self.page, LatchMode::Shared)?;
            if ctx.lsn()? == self.lsn {
                ctx
            } else {
                drop(ctx);
                self.seek()?
            }
        };
        loop {
            if self.pos < ctx.entry_count()? {
                self.pos += 1;
                ctx.move_to(self.pos)?;
                let key = ctx.key()?.to_vec();
                let stored = ctx.stored_value()?.to_vec();
                let value = ctx.value()?;
                self.last = Some((key.clone(), stored));
                self.page = ctx.page_id();
                self.lsn = ctx.lsn()?;
                return Ok(Some((key, value)));
            }
            if ctx.is_last_in_level()? {
                return Ok(None);
            }
            let next = self.index.fix_ctx(self.tx, ctx.prev_page_id()?, LatchMode::Shared)?;
            ctx = next;
            self.pos = 0;
            self.page = ctx.page_id();
            self.lsn = ctx.lsn()?;
        }
    }
}

impl Iterator for IndexScan<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

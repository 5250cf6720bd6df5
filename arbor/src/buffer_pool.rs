//! Manages the buffer pool, a collection of in-memory frames that cache
//! disk pages, together with the allocation maps of the open containers.
//!
//! Page 0 of every container is a meta page holding the allocation bitmap.
//! The bitmap is kept in memory and written back by `flush_all`, which runs
//! as part of every checkpoint; redo of allocations and deallocations after
//! the checkpoint brings it up to date on restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::bitmap::BitVector;
use crate::error::{Result, StoreError};
use crate::failpoint::{self, Failpoint};
use crate::latch::{Latch, LatchMode};
use crate::log_op::LogOperation;
use crate::page::{Page, PageKind, HEADER_SIZE};
use crate::page_id::PageId;
use crate::pager::Pager;
use crate::transaction::Tx;
use crate::wal::WalManager;
use crate::{Lsn, NO_LSN, PAGE_SIZE};

const META_PAGE: u32 = 0;

/// Pages a single allocation bitmap can describe.
pub const MAX_PAGES_PER_CONTAINER: usize = (PAGE_SIZE - HEADER_SIZE - 4) * 8;

/// A single frame in the buffer pool.
struct Frame {
    page: Arc<RwLock<Page>>,
    dirty: AtomicBool,
    pin_count: AtomicU32,
    recently_used: AtomicBool,
    /// Set while an evicting thread writes the frame back outside the pool
    /// lock. The page stays mapped and can be fixed meanwhile.
    writing: AtomicBool,
}

/// Outcome of the clock sweep.
enum Victim {
    /// A free frame, already unmapped.
    Ready(usize),
    /// A dirty frame pinned for write-back, with the image to write.
    Dirty { frame: usize, page: Page },
}

struct PoolState {
    page_table: HashMap<PageId, usize>,
    frame_pages: Vec<Option<PageId>>,
    free_list: Vec<usize>,
    clock_hand: usize,
}

struct Container {
    pager: Mutex<Pager>,
    allocated: Mutex<BitVector>,
}

pub struct BufferManager {
    frames: Vec<Frame>,
    state: Mutex<PoolState>,
    containers: RwLock<HashMap<u16, Arc<Container>>>,
    wal: Arc<WalManager>,
    data_dir: PathBuf,
}

impl BufferManager {
    pub fn new(data_dir: impl Into<PathBuf>, pool_size: usize, wal: Arc<WalManager>) -> Self {
        let pool_size = pool_size.max(1);
        let frames = (0..pool_size)
            .map(|_| Frame {
                page: Arc::new(RwLock::new(Page::new(PageId::NONE))),
                dirty: AtomicBool::new(false),
                pin_count: AtomicU32::new(0),
                recently_used: AtomicBool::new(false),
                writing: AtomicBool::new(false),
            })
            .collect();
        Self {
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                frame_pages: vec![None; pool_size],
                free_list: (0..pool_size).rev().collect(),
                clock_hand: 0,
            }),
            containers: RwLock::new(HashMap::new()),
            wal,
            data_dir: data_dir.into(),
        }
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.wal
    }

    pub fn container_path(data_dir: &Path, container: u16) -> PathBuf {
        data_dir.join(format!("container-{container}.db"))
    }

    /// Opens a container file, formatting its meta page on first use.
    pub fn open_container(&self, container: u16) -> Result<()> {
        if self.containers.read().contains_key(&container) {
            return Ok(());
        }
        let mut pager = Pager::open(Self::container_path(&self.data_dir, container), container)?;
        let allocated = if pager.num_pages() == 0 {
            let mut bits = BitVector::new(0);
            bits.set(META_PAGE as usize);
            write_meta(&mut pager, &bits)?;
            bits
        } else {
            let meta = pager.read_page(META_PAGE)?;
            if meta.kind() != Some(PageKind::Meta) {
                return Err(StoreError::fatal(meta.id, "container meta page missing"));
            }
            BitVector::from_bytes(meta.read_bytes(HEADER_SIZE, PAGE_SIZE - HEADER_SIZE)?)?
        };
        debug!(container, allocated = allocated.count_ones(), "container ready");
        self.containers.write().insert(
            container,
            Arc::new(Container {
                pager: Mutex::new(pager),
                allocated: Mutex::new(allocated),
            }),
        );
        Ok(())
    }

    pub fn containers(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.containers.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn container(&self, container: u16) -> Result<Arc<Container>> {
        self.containers
            .read()
            .get(&container)
            .cloned()
            .ok_or(StoreError::UnknownContainer(container))
    }

    pub fn is_allocated(&self, page_id: PageId) -> Result<bool> {
        if page_id.is_none() {
            return Ok(false);
        }
        let container = self.container(page_id.container())?;
        let allocated = container.allocated.lock().get(page_id.number() as usize);
        Ok(allocated)
    }

    /// Number of allocated pages in a container, meta page included.
    pub fn allocated_count(&self, container: u16) -> Result<usize> {
        Ok(self.container(container)?.allocated.lock().count_ones())
    }

    /// Highest allocation unit tagged on an allocated page of `container`,
    /// or 0 when only the meta page is allocated.
    pub fn max_unit(self: &Arc<Self>, container: u16) -> Result<u32> {
        let allocated = self.container(container)?.allocated.lock().clone();
        let mut max = 0;
        for number in (META_PAGE as usize + 1)..allocated.logical_size() {
            if !allocated.get(number) {
                continue;
            }
            let handle = self.fix(PageId::new(container, number as u32), LatchMode::Shared)?;
            max = max.max(handle.page()?.unit());
        }
        Ok(max)
    }

    /// Pins an allocated page into the pool. The handle starts unlatched.
    pub fn fix_page(self: &Arc<Self>, page_id: PageId) -> Result<Handle> {
        if !self.is_allocated(page_id)? {
            return Err(StoreError::PageNotFound(page_id));
        }
        let frame = self.pin(page_id)?;
        Ok(Handle::new(self.clone(), page_id, frame))
    }

    /// Pins and latches a page.
    pub fn fix(self: &Arc<Self>, page_id: PageId, mode: LatchMode) -> Result<Handle> {
        let mut handle = self.fix_page(page_id)?;
        handle.latch(mode);
        Ok(handle)
    }

    pub fn unfix_page(&self, handle: Handle) {
        drop(handle);
    }

    /// Allocates a page, optionally at a chosen id, and returns it
    /// exclusively latched. A logged allocation becomes a compensation
    /// record when `undo_next` is given.
    pub fn allocate_page(
        self: &Arc<Self>,
        tx: &Tx,
        container: u16,
        unit: u32,
        page_id: Option<PageId>,
        logged: bool,
        undo_next: Option<Lsn>,
    ) -> Result<Handle> {
        let c = self.container(container)?;
        let id = {
            let mut bits = c.allocated.lock();
            let number = match page_id {
                Some(id) if id.container() != container => {
                    return Err(StoreError::InvalidArgument(format!(
                        "page {id} requested from container {container}"
                    )))
                }
                Some(id) if bits.get(id.number() as usize) => {
                    return Err(StoreError::PageAlreadyAllocated(id))
                }
                Some(id) => id.number() as usize,
                None => bits.next_clear_bit(META_PAGE as usize + 1),
            };
            if number >= MAX_PAGES_PER_CONTAINER {
                return Err(StoreError::ContainerFull(container));
            }
            bits.set(number);
            PageId::new(container, number as u32)
        };

        let lsn = if logged {
            let op = LogOperation::AllocatePage { page: id, unit };
            let logged = match undo_next {
                Some(undo_next) => tx.log_clr(op, undo_next),
                None => tx.log_update(op),
            };
            match logged {
                Ok(lsn) => lsn,
                Err(e) => {
                    c.allocated.lock().clear(id.number() as usize);
                    return Err(e);
                }
            }
        } else {
            NO_LSN
        };
        debug!(page = %id, unit, lsn, "allocated page");
        self.materialize(id, unit, lsn)
    }

    /// Marks a page allocated without logging and installs a fresh image.
    /// Redo uses this after checking the page is not allocated yet.
    pub(crate) fn allocate_at(self: &Arc<Self>, page_id: PageId, unit: u32, lsn: Lsn) -> Result<Handle> {
        let c = self.container(page_id.container())?;
        {
            let mut bits = c.allocated.lock();
            if bits.get(page_id.number() as usize) {
                return Err(StoreError::PageAlreadyAllocated(page_id));
            }
            bits.set(page_id.number() as usize);
        }
        self.materialize(page_id, unit, lsn)
    }

    fn materialize(self: &Arc<Self>, page_id: PageId, unit: u32, lsn: Lsn) -> Result<Handle> {
        let mut page = Page::new(page_id);
        page.set_unit(unit);
        page.set_lsn(lsn);
        let frame = self.install(page)?;
        let mut handle = Handle::new(self.clone(), page_id, frame);
        handle.latch(LatchMode::Exclusive);
        Ok(handle)
    }

    /// Deallocates a page.
    ///
    /// * logged with `undo_next`: a compensation during undo, applied at once
    ///   and logged as a deallocation CLR;
    /// * logged without it: deferred until the transaction commits, so a
    ///   rollback never has to resurrect a freed page;
    /// * unlogged: applied at once.
    pub fn delete_page(
        self: &Arc<Self>,
        tx: &Tx,
        page_id: PageId,
        unit: Option<u32>,
        logged: bool,
        undo_next: Option<Lsn>,
    ) -> Result<()> {
        if !self.is_allocated(page_id)? {
            return Err(StoreError::PageNotFound(page_id));
        }
        let unit = match unit {
            Some(unit) => unit,
            None => self.fix(page_id, LatchMode::Shared)?.page()?.unit(),
        };
        match (logged, undo_next) {
            (true, Some(undo_next)) => {
                tx.log_clr(LogOperation::DeallocatePage { page: page_id, unit }, undo_next)?;
                self.delete_page_immediately(page_id)
            }
            (true, None) => {
                tx.defer_deallocation(page_id, unit)?;
                Ok(())
            }
            (false, _) => self.delete_page_immediately(page_id),
        }
    }

    /// Frees a page without logging. Only redo and compensation call this.
    pub fn delete_page_immediately(&self, page_id: PageId) -> Result<()> {
        let c = self.container(page_id.container())?;
        loop {
            let mut state = self.state.lock();
            if let Some(&f) = state.page_table.get(&page_id) {
                let frame = &self.frames[f];
                if frame.writing.load(Ordering::Acquire) {
                    drop(state);
                    std::thread::yield_now();
                    continue;
                }
                if frame.pin_count.load(Ordering::Acquire) > 0 {
                    return Err(StoreError::fatal(page_id, "deallocating a fixed page"));
                }
                state.page_table.remove(&page_id);
                state.frame_pages[f] = None;
                state.free_list.push(f);
                frame.dirty.store(false, Ordering::Release);
                frame.recently_used.store(false, Ordering::Release);
            }
            break;
        }
        c.allocated.lock().clear(page_id.number() as usize);
        debug!(page = %page_id, "deallocated page");
        Ok(())
    }

    fn pin(&self, page_id: PageId) -> Result<usize> {
        let (mut state, f) = loop {
            let mut state = self.state.lock();
            if let Some(&f) = state.page_table.get(&page_id) {
                self.pin_frame(f);
                return Ok(f);
            }
            match self.find_victim(&mut state)? {
                Victim::Ready(f) => break (state, f),
                Victim::Dirty { frame, page } => {
                    drop(state);
                    self.write_back(frame, &page)?;
                }
            }
        };
        let loaded = self.container(page_id.container()).and_then(|c| {
            let page = c.pager.lock().read_page(page_id.number());
            page
        });
        let page = match loaded {
            Ok(page) => page,
            Err(e) => {
                state.free_list.push(f);
                return Err(e);
            }
        };
        *self.frames[f].page.write() = page;
        self.frames[f].dirty.store(false, Ordering::Release);
        self.map_frame(&mut state, f, page_id);
        trace!(page = %page_id, frame = f, "loaded page");
        Ok(f)
    }

    /// Installs a fresh page image, replacing whatever the pool held for it.
    fn install(&self, page: Page) -> Result<usize> {
        let page_id = page.id;
        let (mut state, f) = loop {
            let mut state = self.state.lock();
            let victim = match state.page_table.get(&page_id) {
                Some(&f) if self.frames[f].pin_count.load(Ordering::Acquire) > 0 => {
                    return Err(StoreError::fatal(page_id, "fresh page is still fixed"));
                }
                Some(&f) => {
                    state.page_table.remove(&page_id);
                    state.frame_pages[f] = None;
                    Victim::Ready(f)
                }
                None => self.find_victim(&mut state)?,
            };
            match victim {
                Victim::Ready(f) => break (state, f),
                Victim::Dirty { frame, page } => {
                    drop(state);
                    self.write_back(frame, &page)?;
                }
            }
        };
        *self.frames[f].page.write() = page;
        self.frames[f].dirty.store(true, Ordering::Release);
        self.map_frame(&mut state, f, page_id);
        Ok(f)
    }

    fn map_frame(&self, state: &mut PoolState, f: usize, page_id: PageId) {
        state.page_table.insert(page_id, f);
        state.frame_pages[f] = Some(page_id);
        self.pin_frame(f);
    }

    fn pin_frame(&self, f: usize) {
        self.frames[f].pin_count.fetch_add(1, Ordering::AcqRel);
        self.frames[f].recently_used.store(true, Ordering::Release);
    }

    fn unpin_frame(&self, f: usize) {
        self.frames[f].pin_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Finds a free or evictable frame. A clean victim is unmapped at once; a
    /// dirty one is pinned and handed back for `write_back`, which the
    /// caller runs after releasing the pool lock.
    fn find_victim(&self, state: &mut PoolState) -> Result<Victim> {
        if let Some(f) = state.free_list.pop() {
            return Ok(Victim::Ready(f));
        }
        let frame_count = self.frames.len();
        // Two full passes: the first can clear second-chance bits, the second picks a victim.
        for _ in 0..(frame_count * 2) {
            let f = state.clock_hand;
            state.clock_hand = (state.clock_hand + 1) % frame_count;
            let frame = &self.frames[f];
            if frame.pin_count.load(Ordering::Acquire) > 0 {
                continue;
            }
            if frame.recently_used.swap(false, Ordering::AcqRel) {
                continue;
            }
            if frame.dirty.swap(false, Ordering::AcqRel) {
                frame.pin_count.fetch_add(1, Ordering::AcqRel);
                frame.writing.store(true, Ordering::Release);
                // Revisit this frame first once it is written.
                state.clock_hand = f;
                let page = frame.page.read().clone();
                return Ok(Victim::Dirty { frame: f, page });
            }
            if let Some(old) = state.frame_pages[f].take() {
                state.page_table.remove(&old);
                trace!(page = %old, frame = f, "evicted page");
            }
            return Ok(Victim::Ready(f));
        }
        Err(StoreError::BufferPoolExhausted)
    }

    /// Writes back a victim picked by `find_victim`. The frame stays mapped,
    /// so the next sweep can evict it once it is still clean and unpinned.
    fn write_back(&self, f: usize, page: &Page) -> Result<()> {
        let frame = &self.frames[f];
        let result = self.write_out(page);
        if result.is_err() {
            frame.dirty.store(true, Ordering::Release);
        }
        frame.pin_count.fetch_sub(1, Ordering::AcqRel);
        frame.writing.store(false, Ordering::Release);
        trace!(page = %page.id, frame = f, ok = result.is_ok(), "wrote back victim");
        result
    }

    /// Writes a page image, forcing the log up to its LSN first.
    fn write_out(&self, page: &Page) -> Result<()> {
        self.wal.flush(page.lsn())?;
        failpoint::check(Failpoint::PageWrite)?;
        self.container(page.id.container())?
            .pager
            .lock()
            .write_page(page)
    }

    /// Writes one frame if dirty. The frame must be pinned by the caller.
    fn flush_frame(&self, f: usize) -> Result<()> {
        let frame = &self.frames[f];
        let page = {
            let guard = frame.page.read();
            if !frame.dirty.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            guard.clone()
        };
        if let Err(e) = self.write_out(&page) {
            frame.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// The caller must not hold a latch on the page.
    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        let f = {
            let state = self.state.lock();
            match state.page_table.get(&page_id) {
                Some(&f) => {
                    self.pin_frame(f);
                    f
                }
                None => return Ok(()),
            }
        };
        let result = self.flush_frame(f);
        self.unpin_frame(f);
        result
    }

    /// Writes every dirty page and the allocation maps, then syncs the
    /// container files. The caller must not hold any page latch.
    pub fn flush_all(&self) -> Result<()> {
        self.wal.flush_all()?;
        let pinned: Vec<usize> = {
            let state = self.state.lock();
            (0..self.frames.len())
                .filter(|&f| {
                    state.frame_pages[f].is_some() && self.frames[f].dirty.load(Ordering::Acquire)
                })
                .inspect(|&f| self.pin_frame(f))
                .collect()
        };
        let mut result = Ok(());
        for &f in &pinned {
            if result.is_ok() {
                result = self.flush_frame(f);
            }
            self.unpin_frame(f);
        }
        result?;

        let containers: Vec<Arc<Container>> = self.containers.read().values().cloned().collect();
        for container in containers {
            let bits = container.allocated.lock().clone();
            let mut pager = container.pager.lock();
            write_meta(&mut pager, &bits)?;
        }
        Ok(())
    }

    /// Pages currently cached and dirty, for diagnostics.
    pub fn dirty_pages(&self) -> Vec<PageId> {
        let state = self.state.lock();
        state
            .frame_pages
            .iter()
            .enumerate()
            .filter_map(|(f, id)| id.filter(|_| self.frames[f].dirty.load(Ordering::Acquire)))
            .collect()
    }
}

fn write_meta(pager: &mut Pager, bits: &BitVector) -> Result<()> {
    let mut meta = Page::new(PageId::new(pager.container(), META_PAGE));
    meta.set_kind(PageKind::Meta);
    meta.write_bytes(HEADER_SIZE, &bits.to_bytes())?;
    pager.write_page(&meta)?;
    pager.sync()
}

/// A pinned page. Latching is explicit; dropping the handle releases the
/// latch and then the pin.
pub struct Handle {
    bm: Arc<BufferManager>,
    page_id: PageId,
    frame: usize,
    latch: Latch,
}

impl Handle {
    fn new(bm: Arc<BufferManager>, page_id: PageId, frame: usize) -> Self {
        let latch = Latch::new(bm.frames[frame].page.clone());
        Self {
            bm,
            page_id,
            frame,
            latch,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.bm
    }

    pub fn latch_mode(&self) -> Option<LatchMode> {
        self.latch.mode()
    }

    pub fn latch(&mut self, mode: LatchMode) -> bool {
        self.latch.acquire(mode)
    }

    pub fn try_latch(&mut self, mode: LatchMode) -> bool {
        self.latch.try_acquire(mode)
    }

    pub fn upgrade(&mut self) -> bool {
        self.latch.upgrade()
    }

    pub fn downgrade(&mut self) -> bool {
        self.latch.downgrade()
    }

    pub fn unlatch(&mut self) -> bool {
        self.latch.release()
    }

    pub fn page(&self) -> Result<&Page> {
        self.latch
            .page()
            .ok_or(StoreError::NotLatched(self.page_id))
    }

    /// Mutable access requires an exclusive latch and marks the frame dirty.
    pub fn page_mut(&mut self) -> Result<&mut Page> {
        match self.latch.page_mut() {
            Some(page) => {
                self.bm.frames[self.frame].dirty.store(true, Ordering::Release);
                Ok(page)
            }
            None => Err(StoreError::NotLatched(self.page_id)),
        }
    }

    pub fn lsn(&self) -> Result<Lsn> {
        Ok(self.page()?.lsn())
    }

    pub fn set_lsn(&mut self, lsn: Lsn) -> Result<()> {
        self.page_mut()?.set_lsn(lsn);
        Ok(())
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.latch.release();
        self.bm.unpin_frame(self.frame);
    }
}

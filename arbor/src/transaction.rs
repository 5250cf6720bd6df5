//! Transaction management: log chaining, nested top actions, commit with
//! deferred deallocation, and rollback along the undo chain.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::buffer_pool::BufferManager;
use crate::error::{Result, StoreError};
use crate::lock_manager::LockManager;
use crate::log_op::LogOperation;
use crate::page_id::PageId;
use crate::wal::{LogBody, LogRecord, WalManager};
use crate::{Lsn, TxId, NO_LSN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Active,
    /// The commit record is durable; deferred work is being finished.
    Committing,
    Aborting,
    Finished,
}

struct TxInner {
    status: TxStatus,
    last_lsn: Lsn,
    deferred: Vec<(PageId, u32)>,
}

/// A transaction. Every logged change of the store runs on behalf of one.
pub struct Tx {
    id: TxId,
    bm: Arc<BufferManager>,
    locks: Arc<LockManager>,
    inner: Mutex<TxInner>,
}

impl fmt::Debug for Tx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Tx")
            .field("id", &self.id)
            .field("status", &inner.status)
            .field("last_lsn", &inner.last_lsn)
            .finish()
    }
}

impl Tx {
    fn new(id: TxId, bm: Arc<BufferManager>, locks: Arc<LockManager>, status: TxStatus, last_lsn: Lsn) -> Self {
        Self {
            id,
            bm,
            locks,
            inner: Mutex::new(TxInner {
                status,
                last_lsn,
                deferred: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.bm
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        self.bm.wal()
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn status(&self) -> TxStatus {
        self.inner.lock().status
    }

    pub fn last_lsn(&self) -> Lsn {
        self.inner.lock().last_lsn
    }

    fn append(&self, inner: &mut TxInner, undo_next: Lsn, body: &LogBody) -> Result<Lsn> {
        let lsn = self.wal().append(self.id, inner.last_lsn, undo_next, body)?;
        inner.last_lsn = lsn;
        Ok(lsn)
    }

    /// Logs a forward change and returns its LSN. A rolling back
    /// transaction still logs the structure modifications its undo needs.
    pub fn log_update(&self, op: LogOperation) -> Result<Lsn> {
        let mut inner = self.inner.lock();
        if !matches!(inner.status, TxStatus::Active | TxStatus::Aborting) {
            return Err(StoreError::TxNotActive(self.id));
        }
        self.append(&mut inner, NO_LSN, &LogBody::Update(op))
    }

    /// Logs a compensation record. `undo_next` is the next record of this
    /// transaction that still needs undoing.
    pub fn log_clr(&self, op: LogOperation, undo_next: Lsn) -> Result<Lsn> {
        let mut inner = self.inner.lock();
        if inner.status == TxStatus::Finished {
            return Err(StoreError::TxNotActive(self.id));
        }
        self.append(&mut inner, undo_next, &LogBody::Compensation(op))
    }

    /// Starts a nested top action. The returned LSN must be handed back to
    /// [`Tx::end_nested_top_action`].
    pub fn begin_nested_top_action(&self) -> Lsn {
        self.last_lsn()
    }

    /// Ends a nested top action: a rollback of the enclosing transaction
    /// skips everything logged since `saved`.
    pub fn end_nested_top_action(&self, saved: Lsn) -> Result<Lsn> {
        let mut inner = self.inner.lock();
        if inner.status == TxStatus::Finished {
            return Err(StoreError::TxNotActive(self.id));
        }
        self.append(&mut inner, saved, &LogBody::Skip)
    }

    /// Registers a page to free once the transaction has committed.
    pub fn defer_deallocation(&self, page: PageId, unit: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.status != TxStatus::Active {
            return Err(StoreError::TxNotActive(self.id));
        }
        if !inner.deferred.iter().any(|(p, _)| *p == page) {
            inner.deferred.push((page, unit));
        }
        Ok(())
    }

    pub fn deferred_deallocations(&self) -> Vec<(PageId, u32)> {
        self.inner.lock().deferred.clone()
    }

    pub(crate) fn set_status(&self, status: TxStatus) {
        self.inner.lock().status = status;
    }
}

/// Undoes one record of a rolling back transaction and returns the LSN of
/// the next record to visit.
pub(crate) fn undo_step(tx: &Tx, record: &LogRecord) -> Result<Lsn> {
    match &record.body {
        LogBody::Update(op) => {
            op.undo(tx, record.lsn, record.prev_lsn)?;
            Ok(record.prev_lsn)
        }
        LogBody::Compensation(_) | LogBody::Skip => Ok(record.undo_next),
        _ => Ok(record.prev_lsn),
    }
}

/// Frees the pages a committed transaction deferred. Pages already freed
/// by an earlier attempt are skipped.
pub(crate) fn finish_deallocations(tx: &Tx, deferred: &[(PageId, u32)]) -> Result<()> {
    let bm = tx.buffer_manager();
    for &(page, unit) in deferred {
        if bm.is_allocated(page)? {
            bm.delete_page(tx, page, Some(unit), true, Some(NO_LSN))?;
        }
    }
    Ok(())
}

pub struct TxManager {
    bm: Arc<BufferManager>,
    locks: Arc<LockManager>,
    next_tx: AtomicU32,
    active: Mutex<HashSet<TxId>>,
}

impl TxManager {
    pub fn new(bm: Arc<BufferManager>, locks: Arc<LockManager>, first_tx: TxId) -> Self {
        Self {
            bm,
            locks,
            next_tx: AtomicU32::new(first_tx.max(1)),
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.bm
    }

    pub fn begin(&self) -> Tx {
        let id = self.next_tx.fetch_add(1, Ordering::SeqCst);
        self.active.lock().insert(id);
        debug!(tx = id, "begin");
        Tx::new(id, self.bm.clone(), self.locks.clone(), TxStatus::Active, NO_LSN)
    }

    /// A transaction reconstructed by restart analysis.
    pub(crate) fn recovered(&self, id: TxId, last_lsn: Lsn, status: TxStatus) -> Tx {
        Tx::new(id, self.bm.clone(), self.locks.clone(), status, last_lsn)
    }

    /// Restart bookkeeping so new transactions never reuse a logged id.
    pub(crate) fn advance_past(&self, id: TxId) {
        self.next_tx.fetch_max(id.saturating_add(1), Ordering::SeqCst);
    }

    pub fn active_transactions(&self) -> Vec<TxId> {
        let mut ids: Vec<TxId> = self.active.lock().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Makes the transaction durable, then frees its deferred pages and
    /// releases its locks.
    pub fn commit(&self, tx: &Tx) -> Result<()> {
        let deferred = {
            let mut inner = tx.inner.lock();
            if inner.status != TxStatus::Active {
                return Err(StoreError::TxNotActive(tx.id));
            }
            let deferred = std::mem::take(&mut inner.deferred);
            let lsn = tx.append(
                &mut inner,
                NO_LSN,
                &LogBody::Commit {
                    deferred: deferred.clone(),
                },
            )?;
            inner.status = TxStatus::Committing;
            drop(inner);
            tx.wal().flush(lsn)?;
            deferred
        };
        finish_deallocations(tx, &deferred)?;
        self.end(tx)?;
        info!(tx = tx.id, freed = deferred.len(), "committed");
        Ok(())
    }

    /// Undoes every change of the transaction, then releases its locks.
    pub fn rollback(&self, tx: &Tx) -> Result<()> {
        {
            let mut inner = tx.inner.lock();
            match inner.status {
                TxStatus::Active | TxStatus::Aborting => {}
                _ => return Err(StoreError::TxNotActive(tx.id)),
            }
            inner.status = TxStatus::Aborting;
            tx.append(&mut inner, NO_LSN, &LogBody::Abort)?;
            inner.deferred.clear();
        }
        let undone = rollback_chain(tx)?;
        self.end(tx)?;
        info!(tx = tx.id, undone, "rolled back");
        Ok(())
    }

    /// Writes the end record and forgets the transaction.
    pub(crate) fn end(&self, tx: &Tx) -> Result<()> {
        {
            let mut inner = tx.inner.lock();
            tx.append(&mut inner, NO_LSN, &LogBody::End)?;
            inner.status = TxStatus::Finished;
        }
        self.locks.unlock_all(tx.id);
        self.active.lock().remove(&tx.id);
        Ok(())
    }
}

/// Walks the undo chain from the transaction's last record. Returns the
/// number of changes undone.
pub(crate) fn rollback_chain(tx: &Tx) -> Result<usize> {
    let wal = tx.wal().clone();
    let mut next = tx.last_lsn();
    let mut undone = 0;
    while next != NO_LSN {
        let record = wal.read_record(next)?;
        if record.tx_id != tx.id {
            return Err(StoreError::corrupt(next, format!("record belongs to tx {}", record.tx_id)));
        }
        if matches!(record.body, LogBody::Update(_)) {
            undone += 1;
        }
        next = undo_step(tx, &record)?;
    }
    Ok(undone)
}

//! Restart recovery and checkpoints.
//!
//! Restart runs three passes over the log:
//!
//! 1. Analysis finds the last checkpoint and the state of every logged
//!    transaction.
//! 2. Redo replays every page change from the checkpoint's redo start. The
//!    page LSN and the allocation bitmap tell which changes already reached
//!    disk.
//! 3. Undo rolls back transactions that never committed, newest record
//!    first across all of them, and finishes commits that crashed before
//!    their end record.
//!
//! Checkpoints are taken only while no transaction is active, so a
//! checkpoint record needs nothing beyond the LSN redo starts from.

use std::collections::{BTreeMap, BinaryHeap};

use tracing::{debug, error, info};

use crate::buffer_pool::BufferManager;
use crate::error::{RedoOutcome, Result, StoreError};
use crate::page_id::PageId;
use crate::transaction::{finish_deallocations, undo_step, TxManager, TxStatus};
use crate::wal::{LogBody, FIRST_LSN};
use crate::{Lsn, TxId, NO_LSN};

/// Transaction id of records written outside any transaction.
pub const SYSTEM_TX: TxId = 0;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub records_scanned: usize,
    pub redo_start: Lsn,
    pub redone: usize,
    pub already_satisfied: usize,
    /// Transactions that committed but crashed before their end record.
    pub completed_commits: usize,
    pub losers: Vec<TxId>,
    pub undone: usize,
    pub max_tx_id: TxId,
}

#[derive(Debug)]
enum Outcome {
    InFlight,
    Aborting,
    Committed(Vec<(PageId, u32)>),
}

#[derive(Debug)]
struct TxEntry {
    last_lsn: Lsn,
    outcome: Outcome,
}

struct Analysis {
    records: usize,
    redo_start: Lsn,
    transactions: BTreeMap<TxId, TxEntry>,
    max_tx_id: TxId,
}

fn analyze(bm: &BufferManager) -> Result<Analysis> {
    let mut analysis = Analysis {
        records: 0,
        redo_start: FIRST_LSN,
        transactions: BTreeMap::new(),
        max_tx_id: 0,
    };
    for record in bm.wal().records(FIRST_LSN) {
        let record = record?;
        analysis.records += 1;
        if let LogBody::Checkpoint { redo_start } = record.body {
            analysis.redo_start = redo_start;
            continue;
        }
        if record.tx_id == SYSTEM_TX {
            continue;
        }
        analysis.max_tx_id = analysis.max_tx_id.max(record.tx_id);
        if matches!(record.body, LogBody::End) {
            analysis.transactions.remove(&record.tx_id);
            continue;
        }
        let entry = analysis
            .transactions
            .entry(record.tx_id)
            .or_insert(TxEntry {
                last_lsn: NO_LSN,
                outcome: Outcome::InFlight,
            });
        entry.last_lsn = record.lsn;
        match record.body {
            LogBody::Commit { deferred } => entry.outcome = Outcome::Committed(deferred),
            LogBody::Abort => entry.outcome = Outcome::Aborting,
            _ => {}
        }
    }
    Ok(analysis)
}

/// Brings the store back to a state holding exactly the committed changes.
pub fn recover(txm: &TxManager) -> Result<RecoveryReport> {
    let bm = txm.buffer_manager();
    let analysis = analyze(bm)?;
    let mut report = RecoveryReport {
        records_scanned: analysis.records,
        redo_start: analysis.redo_start,
        max_tx_id: analysis.max_tx_id,
        ..RecoveryReport::default()
    };
    debug!(
        records = analysis.records,
        redo_start = analysis.redo_start,
        open = analysis.transactions.len(),
        "analysis done"
    );

    let system = txm.recovered(SYSTEM_TX, NO_LSN, TxStatus::Finished);
    for record in bm.wal().records(analysis.redo_start) {
        let record = record?;
        let Some(op) = record.body.operation() else {
            continue;
        };
        match op.redo(&system, record.lsn) {
            Ok(RedoOutcome::Applied) => report.redone += 1,
            Ok(RedoOutcome::AlreadySatisfied) => report.already_satisfied += 1,
            Err(e) => {
                error!(lsn = record.lsn, page = %op.page_id(), error = %e, "redo failed");
                return Err(e);
            }
        }
    }
    debug!(redone = report.redone, skipped = report.already_satisfied, "redo done");

    let mut losers = Vec::new();
    for (id, entry) in analysis.transactions {
        match entry.outcome {
            Outcome::Committed(deferred) => {
                let tx = txm.recovered(id, entry.last_lsn, TxStatus::Committing);
                finish_deallocations(&tx, &deferred)?;
                txm.end(&tx)?;
                report.completed_commits += 1;
            }
            Outcome::InFlight | Outcome::Aborting => {
                report.losers.push(id);
                losers.push(txm.recovered(id, entry.last_lsn, TxStatus::Aborting));
            }
        }
    }

    let mut pending: BinaryHeap<(Lsn, usize)> = losers
        .iter()
        .enumerate()
        .filter(|(_, tx)| tx.last_lsn() != NO_LSN)
        .map(|(i, tx)| (tx.last_lsn(), i))
        .collect();
    while let Some((lsn, i)) = pending.pop() {
        let tx = &losers[i];
        let record = bm.wal().read_record(lsn)?;
        if record.tx_id != tx.id() {
            return Err(StoreError::corrupt(lsn, format!("undo chain of tx {} left the transaction", tx.id())));
        }
        if matches!(record.body, LogBody::Update(_)) {
            report.undone += 1;
        }
        let next = undo_step(tx, &record)?;
        if next != NO_LSN {
            pending.push((next, i));
        }
    }
    for tx in &losers {
        txm.end(tx)?;
    }

    txm.advance_past(analysis.max_tx_id);
    bm.flush_all()?;
    checkpoint(bm)?;
    info!(
        records = report.records_scanned,
        redone = report.redone,
        already_satisfied = report.already_satisfied,
        losers = report.losers.len(),
        undone = report.undone,
        "recovery complete"
    );
    Ok(report)
}

/// Writes every dirty page and logs a checkpoint. The caller guarantees that
/// no transaction is active.
pub fn checkpoint(bm: &BufferManager) -> Result<Lsn> {
    let wal = bm.wal();
    let redo_start = wal.next_lsn();
    bm.flush_all()?;
    let lsn = wal.append(SYSTEM_TX, NO_LSN, NO_LSN, &LogBody::Checkpoint { redo_start })?;
    wal.flush_all()?;
    debug!(lsn, redo_start, "checkpoint");
    Ok(lsn)
}

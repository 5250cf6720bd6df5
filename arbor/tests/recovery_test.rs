mod common;

use arbor::error::RedoOutcome;
use arbor::failpoint::{Failpoint, FailpointGuard};
use arbor::wal::{LogBody, FIRST_LSN};
use arbor::{Field, StoreError};
use common::{int_index, key, keys, open_store, value};
use tempfile::tempdir;

#[test]
fn test_committed_work_survives_a_crash() {
    let dir = tempdir().unwrap();
    let root = {
        let store = open_store(dir.path());
        let tx = store.begin();
        let index = int_index(&store, &tx, true);
        for k in 0..1500 {
            index.insert(&tx, &key(k), &value(k)).unwrap();
        }
        store.commit(&tx).unwrap();
        index.root()
        // Dropped without close: only the log reached the disk.
    };

    let store = open_store(dir.path());
    let report = store.recovery_report();
    assert!(report.redone > 0);
    assert!(report.losers.is_empty());

    let index = store.open_index(root).unwrap();
    let tx = store.begin();
    assert_eq!(keys(&index, &tx), (0..1500).collect::<Vec<_>>());
    assert_eq!(index.get(&tx, &key(1234)).unwrap(), Some(value(1234)));
    index.verify(&tx).unwrap();
    store.commit(&tx).unwrap();
}

#[test]
fn test_uncommitted_work_is_undone_at_restart() {
    let dir = tempdir().unwrap();
    let (root, loser) = {
        let store = open_store(dir.path());
        let setup = store.begin();
        let index = int_index(&store, &setup, true);
        for k in 0..500 {
            index.insert(&setup, &key(k), &value(k)).unwrap();
        }
        store.commit(&setup).unwrap();

        let tx = store.begin();
        for k in 500..2500 {
            index.insert(&tx, &key(k), &value(k)).unwrap();
        }
        for k in 0..50 {
            assert!(index.delete(&tx, &key(k), None).unwrap());
        }
        assert!(index.update(&tx, &key(100), b"changed").unwrap());

        // The loser's changes reach the disk, its outcome never does.
        store.buffer_manager().flush_all().unwrap();
        (index.root(), tx.id())
    };

    let store = open_store(dir.path());
    let report = store.recovery_report();
    assert_eq!(report.losers, vec![loser]);
    assert!(report.undone >= 2051, "undone {}", report.undone);

    let index = store.open_index(root).unwrap();
    let tx = store.begin();
    assert!(tx.id() > loser);
    assert_eq!(keys(&index, &tx), (0..500).collect::<Vec<_>>());
    assert_eq!(index.get(&tx, &key(100)).unwrap(), Some(value(100)));
    index.verify(&tx).unwrap();
    store.commit(&tx).unwrap();
}

#[test]
fn test_restart_after_flush_redoes_nothing() {
    let dir = tempdir().unwrap();
    {
        let store = open_store(dir.path());
        let tx = store.begin();
        let index = int_index(&store, &tx, false);
        for k in 0..800 {
            index.insert(&tx, &key(k % 100), &value(k)).unwrap();
        }
        store.commit(&tx).unwrap();
        store.buffer_manager().flush_all().unwrap();
    }

    let store = open_store(dir.path());
    let report = store.recovery_report();
    assert_eq!(report.redone, 0);
    assert!(report.already_satisfied > 0);
    assert!(report.losers.is_empty());
}

#[test]
fn test_redo_of_applied_records_is_a_no_op() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let tx = store.begin();
    let index = int_index(&store, &tx, true);
    for k in (0..2000).rev() {
        index.insert(&tx, &key(k), &value(k)).unwrap();
    }
    store.commit(&tx).unwrap();

    let replay = store.begin();
    let wal = store.buffer_manager().wal().clone();
    let mut replayed = 0;
    for record in wal.records(FIRST_LSN) {
        let record = record.unwrap();
        if let Some(op) = record.body.operation() {
            assert_eq!(op.redo(&replay, record.lsn).unwrap(), RedoOutcome::AlreadySatisfied);
            replayed += 1;
        }
    }
    assert!(replayed > 2000);
    store.commit(&replay).unwrap();

    let check = store.begin();
    assert_eq!(keys(&index, &check).len(), 2000);
    store.commit(&check).unwrap();
}

#[test]
fn test_rollback_restores_the_key_set() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let setup = store.begin();
    let index = int_index(&store, &setup, true);
    for k in (0..3000).step_by(3) {
        index.insert(&setup, &key(k), &value(k)).unwrap();
    }
    store.commit(&setup).unwrap();

    let tx = store.begin();
    let before = keys(&index, &tx);
    for k in (1..3000).step_by(3) {
        index.insert(&tx, &key(k), &value(k)).unwrap();
    }
    for k in (0..3000).step_by(9) {
        assert!(index.delete(&tx, &key(k), None).unwrap());
    }
    for k in (3..3000).step_by(9) {
        assert!(index.update(&tx, &key(k), &vec![b'u'; 700]).unwrap());
    }
    store.rollback(&tx).unwrap();

    let check = store.begin();
    assert_eq!(keys(&index, &check), before);
    assert_eq!(index.get(&check, &key(3)).unwrap(), Some(value(3)));
    assert_eq!(index.get(&check, &key(9)).unwrap(), Some(value(9)));
    index.verify(&check).unwrap();
    store.commit(&check).unwrap();
    assert!(store.tx_manager().active_transactions().is_empty());
}

#[test]
fn test_rollback_of_allocation_frees_the_page() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let bm = store.buffer_manager();
    let before = bm.allocated_count(0).unwrap();

    let tx = store.begin();
    let page = bm.allocate_page(&tx, 0, 77, None, true, None).unwrap().page_id();
    assert!(bm.is_allocated(page).unwrap());
    assert_eq!(bm.allocated_count(0).unwrap(), before + 1);
    store.rollback(&tx).unwrap();

    assert!(!bm.is_allocated(page).unwrap());
    assert_eq!(bm.allocated_count(0).unwrap(), before);
}

#[test]
fn test_failed_overflow_write_leaves_the_leaf_untouched() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let bm = store.buffer_manager();
    let tx = store.begin();
    let index = store
        .create_index(&tx, "docs", Field::Int, Field::Bytes, true)
        .unwrap();
    index.insert(&tx, &key(1), b"small").unwrap();
    store.commit(&tx).unwrap();
    let allocated = bm.allocated_count(0).unwrap();

    let tx = store.begin();
    {
        let _failing = FailpointGuard::new(Failpoint::BlobWrite);
        let err = index.insert(&tx, &key(2), &vec![7u8; 20_000]).unwrap_err();
        assert!(matches!(err, StoreError::Blob { .. }), "{err:?}");
    }
    assert_eq!(index.get(&tx, &key(2)).unwrap(), None);
    assert_eq!(keys(&index, &tx), vec![1]);
    store.rollback(&tx).unwrap();
    assert_eq!(bm.allocated_count(0).unwrap(), allocated);
}

#[test]
fn test_checkpoint_needs_quiescence() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let tx = store.begin();
    let index = int_index(&store, &tx, true);
    index.insert(&tx, &key(1), &value(1)).unwrap();
    assert!(matches!(store.checkpoint(), Err(StoreError::InvalidArgument(_))));
    store.commit(&tx).unwrap();

    let lsn = store.checkpoint().unwrap();
    let record = store.buffer_manager().wal().read_record(lsn).unwrap();
    assert!(matches!(record.body, LogBody::Checkpoint { .. }));
    store.close().unwrap();

    let store = open_store(dir.path());
    assert_eq!(store.recovery_report().redone, 0);
    assert!(store.recovery_report().redo_start > lsn);
}

#[test]
fn test_allocation_units_are_not_reused_after_restart() {
    let dir = tempdir().unwrap();
    let first = {
        let store = open_store(dir.path());
        let tx = store.begin();
        let index = int_index(&store, &tx, true);
        store.commit(&tx).unwrap();
        let unit = index.unit();
        store.close().unwrap();
        unit
    };

    let second = {
        let store = open_store(dir.path());
        let tx = store.begin();
        let index = int_index(&store, &tx, true);
        index.insert(&tx, &key(1), &value(1)).unwrap();
        store.commit(&tx).unwrap();
        index.unit()
        // Dropped without close: the new index comes back through redo.
    };
    assert!(second > first);

    let store = open_store(dir.path());
    let tx = store.begin();
    let third = int_index(&store, &tx, true);
    assert!(third.unit() > second);
    store.commit(&tx).unwrap();
}

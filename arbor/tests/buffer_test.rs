mod common;

use arbor::failpoint::{Failpoint, FailpointGuard};
use arbor::{LatchMode, PageId, Store, StoreError};
use common::{config, int_index, key, keys, value};
use tempfile::tempdir;

#[test]
fn test_page_write_forces_the_log_first() {
    let dir = tempdir().unwrap();
    let store = Store::open(config(dir.path())).unwrap();
    let tx = store.begin();
    let index = int_index(&store, &tx, true);
    for k in 0..100 {
        index.insert(&tx, &key(k), &value(k)).unwrap();
    }
    let bm = store.buffer_manager();
    let page_lsn = bm.fix(index.root(), LatchMode::Shared).unwrap().lsn().unwrap();
    assert!(bm.wal().flushed_lsn() <= page_lsn);

    bm.flush_page(index.root()).unwrap();
    assert!(bm.wal().flushed_lsn() > page_lsn);
    assert!(!bm.dirty_pages().contains(&index.root()));
    store.commit(&tx).unwrap();
}

#[test]
fn test_small_pool_evicts_and_reloads() {
    let dir = tempdir().unwrap();
    let store = Store::open(config(dir.path()).with_buffer_pool_size(16)).unwrap();
    let tx = store.begin();
    let index = int_index(&store, &tx, true);
    for k in (0..6000).rev() {
        index.insert(&tx, &key(k), &value(k)).unwrap();
    }
    store.commit(&tx).unwrap();

    let tx = store.begin();
    let report = index.verify(&tx).unwrap();
    assert!(report.pages() > 16, "{report:?}");
    assert_eq!(keys(&index, &tx), (0..6000).collect::<Vec<_>>());
    assert_eq!(index.get(&tx, &key(4321)).unwrap(), Some(value(4321)));
    store.commit(&tx).unwrap();
}

#[test]
fn test_unallocated_page_is_not_found() {
    let dir = tempdir().unwrap();
    let store = Store::open(config(dir.path())).unwrap();
    let bm = store.buffer_manager();
    assert!(matches!(
        bm.fix(PageId::new(0, 4000), LatchMode::Shared),
        Err(StoreError::PageNotFound(_))
    ));
    assert!(matches!(bm.fix_page(PageId::new(9, 1)), Err(StoreError::UnknownContainer(9))));
}

#[test]
fn test_failed_page_write_keeps_the_page_dirty() {
    let dir = tempdir().unwrap();
    let store = Store::open(config(dir.path())).unwrap();
    let tx = store.begin();
    let index = int_index(&store, &tx, true);
    index.insert(&tx, &key(1), &value(1)).unwrap();
    store.commit(&tx).unwrap();

    let bm = store.buffer_manager();
    {
        let _failing = FailpointGuard::new(Failpoint::PageWrite);
        assert!(bm.flush_page(index.root()).is_err());
    }
    assert!(bm.dirty_pages().contains(&index.root()));
    bm.flush_page(index.root()).unwrap();
    assert!(!bm.dirty_pages().contains(&index.root()));
}

#[test]
fn test_failed_eviction_keeps_the_victim_dirty() {
    let dir = tempdir().unwrap();
    let store = Store::open(config(dir.path()).with_buffer_pool_size(16)).unwrap();
    let bm = store.buffer_manager();
    let tx = store.begin();
    for _ in 0..16 {
        bm.allocate_page(&tx, 0, 1, None, true, None).unwrap();
    }
    assert_eq!(bm.dirty_pages().len(), 16);
    {
        let _failing = FailpointGuard::new(Failpoint::PageWrite);
        assert!(bm.allocate_page(&tx, 0, 1, None, true, None).is_err());
    }
    assert_eq!(bm.dirty_pages().len(), 16);

    let fresh = bm.allocate_page(&tx, 0, 1, None, true, None).unwrap().page_id();
    let dirty = bm.dirty_pages();
    assert_eq!(dirty.len(), 16);
    assert!(dirty.contains(&fresh));
    store.commit(&tx).unwrap();
}

#[test]
fn test_concurrent_readers_share_a_small_pool() {
    let dir = tempdir().unwrap();
    let store = Store::open(config(dir.path()).with_buffer_pool_size(16)).unwrap();
    let tx = store.begin();
    let index = int_index(&store, &tx, true);
    for k in 0..4000 {
        index.insert(&tx, &key(k), &value(k)).unwrap();
    }
    store.commit(&tx).unwrap();

    std::thread::scope(|s| {
        for t in 0..4 {
            let (store, index) = (&store, &index);
            s.spawn(move || {
                let tx = store.begin();
                for i in 0..1000 {
                    let k = (i * 7919 + t * 1000) % 4000;
                    assert_eq!(index.get(&tx, &key(k)).unwrap(), Some(value(k)));
                }
                store.commit(&tx).unwrap();
            });
        }
    });

    let tx = store.begin();
    assert_eq!(keys(&index, &tx), (0..4000).collect::<Vec<_>>());
    store.commit(&tx).unwrap();
}

#[test]
fn test_pages_persist_across_close_and_open() {
    let dir = tempdir().unwrap();
    let root = {
        let store = Store::open(config(dir.path())).unwrap();
        store.add_container(3).unwrap();
        let tx = store.begin();
        let index = int_index(&store, &tx, false);
        for k in 0..2000 {
            index.insert(&tx, &key(k / 4), &value(k)).unwrap();
        }
        store.commit(&tx).unwrap();
        let root = index.root();
        store.close().unwrap();
        root
    };

    let store = Store::open(config(dir.path())).unwrap();
    assert_eq!(store.buffer_manager().containers(), vec![0, 3]);
    assert_eq!(store.recovery_report().redone, 0);
    let index = store.open_index(root).unwrap();
    assert!(!index.is_unique());
    let tx = store.begin();
    assert_eq!(index.get_all(&tx, &key(7)).unwrap(), (28..32).map(value).collect::<Vec<_>>());
    index.verify(&tx).unwrap();
    store.commit(&tx).unwrap();
}

mod common;

use arbor::blob::{self, CHUNK_CAPACITY};
use arbor::failpoint::{Failpoint, FailpointGuard};
use arbor::{BlinkIndex, Field, LatchMode, SearchMode, Store, Tx};
use common::{key, open_store};
use tempfile::tempdir;

fn document(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

fn pages_for(len: usize) -> usize {
    len.div_ceil(CHUNK_CAPACITY).max(1)
}

fn doc_index(store: &Store, tx: &Tx) -> BlinkIndex {
    store
        .create_index(tx, "documents", Field::Int, Field::Bytes, true)
        .unwrap()
}

fn is_externalized(index: &BlinkIndex, tx: &Tx, k: i32) -> bool {
    let mut leaf = index.find_leaf(tx, &key(k), LatchMode::Shared).unwrap();
    assert_eq!(leaf.search(SearchMode::LessOrEqual, &key(k), None).unwrap(), 0);
    leaf.is_externalized().unwrap()
}

#[test]
fn test_large_values_move_to_overflow_pages() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let bm = store.buffer_manager();
    let tx = store.begin();
    let index = doc_index(&store, &tx);
    index.insert(&tx, &key(1), b"inline").unwrap();
    let before = bm.allocated_count(0).unwrap();

    let big = document(20_000, 3);
    index.insert(&tx, &key(2), &big).unwrap();
    assert_eq!(bm.allocated_count(0).unwrap(), before + pages_for(big.len()));
    store.commit(&tx).unwrap();

    let tx = store.begin();
    assert!(!is_externalized(&index, &tx, 1));
    assert!(is_externalized(&index, &tx, 2));
    assert_eq!(index.get(&tx, &key(2)).unwrap(), Some(big));
    assert_eq!(index.get(&tx, &key(1)).unwrap(), Some(b"inline".to_vec()));
    store.commit(&tx).unwrap();
}

#[test]
fn test_delete_releases_the_chain_at_commit() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let bm = store.buffer_manager();
    let tx = store.begin();
    let index = doc_index(&store, &tx);
    let big = document(30_000, 9);
    index.insert(&tx, &key(5), &big).unwrap();
    store.commit(&tx).unwrap();
    let allocated = bm.allocated_count(0).unwrap();

    let tx = store.begin();
    assert!(index.delete(&tx, &key(5), None).unwrap());
    assert_eq!(bm.allocated_count(0).unwrap(), allocated);
    assert_eq!(tx.deferred_deallocations().len(), pages_for(big.len()));
    store.commit(&tx).unwrap();
    assert_eq!(bm.allocated_count(0).unwrap(), allocated - pages_for(big.len()));
}

#[test]
fn test_rollback_of_insert_frees_the_chain() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let bm = store.buffer_manager();
    let setup = store.begin();
    let index = doc_index(&store, &setup);
    store.commit(&setup).unwrap();
    let allocated = bm.allocated_count(0).unwrap();

    let tx = store.begin();
    index.insert(&tx, &key(1), &document(50_000, 1)).unwrap();
    assert!(bm.allocated_count(0).unwrap() > allocated);
    store.rollback(&tx).unwrap();

    assert_eq!(bm.allocated_count(0).unwrap(), allocated);
    let tx = store.begin();
    assert_eq!(index.get(&tx, &key(1)).unwrap(), None);
    store.commit(&tx).unwrap();
}

#[test]
fn test_rollback_of_rewrite_restores_old_content() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let bm = store.buffer_manager();
    let tx = store.begin();
    let original = document(5_000, 40);
    let first = blob::store(&tx, 0, 11, &original).unwrap();
    store.commit(&tx).unwrap();
    let allocated = bm.allocated_count(0).unwrap();

    let tx = store.begin();
    let longer = document(3 * CHUNK_CAPACITY + 10, 90);
    blob::write(&tx, first, &longer).unwrap();
    assert_eq!(blob::read(bm, first).unwrap(), longer);
    assert_eq!(blob::chain(bm, first).unwrap().len(), 4);
    store.rollback(&tx).unwrap();

    assert_eq!(blob::read(bm, first).unwrap(), original);
    assert_eq!(blob::chain(bm, first).unwrap(), vec![first]);
    assert_eq!(bm.allocated_count(0).unwrap(), allocated);
}

#[test]
fn test_shrinking_rewrite_frees_surplus_pages_at_commit() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let bm = store.buffer_manager();
    let tx = store.begin();
    let first = blob::store(&tx, 0, 11, &document(2 * CHUNK_CAPACITY + 1, 0)).unwrap();
    store.commit(&tx).unwrap();
    let allocated = bm.allocated_count(0).unwrap();

    let tx = store.begin();
    blob::write(&tx, first, b"short").unwrap();
    assert_eq!(bm.allocated_count(0).unwrap(), allocated);
    store.commit(&tx).unwrap();
    assert_eq!(bm.allocated_count(0).unwrap(), allocated - 2);
    assert_eq!(blob::read(bm, first).unwrap(), b"short".to_vec());
}

#[test]
fn test_update_replaces_the_chain() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let bm = store.buffer_manager();
    let tx = store.begin();
    let index = doc_index(&store, &tx);
    let big = document(20_000, 7);
    index.insert(&tx, &key(3), &big).unwrap();
    store.commit(&tx).unwrap();
    let allocated = bm.allocated_count(0).unwrap();

    let tx = store.begin();
    assert!(index.update(&tx, &key(3), b"tiny").unwrap());
    store.commit(&tx).unwrap();
    assert_eq!(bm.allocated_count(0).unwrap(), allocated - pages_for(big.len()));

    let tx = store.begin();
    assert!(!is_externalized(&index, &tx, 3));
    assert_eq!(index.get(&tx, &key(3)).unwrap(), Some(b"tiny".to_vec()));

    // And back to an overflow value, rolled back.
    assert!(index.update(&tx, &key(3), &big).unwrap());
    assert_eq!(index.get(&tx, &key(3)).unwrap(), Some(big.clone()));
    store.rollback(&tx).unwrap();

    let tx = store.begin();
    assert_eq!(index.get(&tx, &key(3)).unwrap(), Some(b"tiny".to_vec()));
    store.commit(&tx).unwrap();
    assert_eq!(bm.allocated_count(0).unwrap(), allocated - pages_for(big.len()));
}

#[test]
fn test_rewrite_failing_mid_chain_rolls_back() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let bm = store.buffer_manager();
    let tx = store.begin();
    let old = document(3 * CHUNK_CAPACITY, 1);
    let first = blob::store(&tx, 0, 1, &old).unwrap();
    store.commit(&tx).unwrap();
    let allocated = bm.allocated_count(0).unwrap();

    let tx = store.begin();
    {
        // Two chunks reach their pages before the third write fails.
        let _failing = FailpointGuard::after(Failpoint::BlobWrite, 2);
        assert!(blob::write(&tx, first, &document(5 * CHUNK_CAPACITY, 2)).is_err());
    }
    store.rollback(&tx).unwrap();
    assert_eq!(bm.allocated_count(0).unwrap(), allocated);
    assert_eq!(blob::read(bm, first).unwrap(), old);
    assert_eq!(blob::chain(bm, first).unwrap().len(), 3);
}

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use arbor::edge_lock::EdgeLockService;
use arbor::lock_manager::{Edge, LockError, LockMode};
use arbor::DeweyId;
use common::open_store;
use tempfile::tempdir;

#[test]
fn test_update_lock_admits_readers_only() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let locks = store.locks();
    let node: DeweyId = "1.3.5".parse().unwrap();
    let (writer, reader, other) = (store.begin(), store.begin(), store.begin());

    locks.lock_node_update(writer.id(), &node).unwrap();
    locks.lock_node_shared(reader.id(), &node).unwrap();
    assert!(matches!(
        locks.lock_node_update(other.id(), &node),
        Err(LockError::Timeout { mode: LockMode::Update, .. })
    ));

    store.commit(&reader).unwrap();
    store.commit(&other).unwrap();
    // Alone now, the update lock converts.
    locks.lock_node_exclusive(writer.id(), &node).unwrap();
    assert_eq!(locks.get_node_locks(&node), vec![(writer.id(), LockMode::Exclusive)]);
    store.commit(&writer).unwrap();
    assert!(locks.get_node_locks(&node).is_empty());
}

#[test]
fn test_commit_wakes_a_blocked_writer() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let node: DeweyId = "1.2".parse().unwrap();
    let holder = store.begin();
    store.locks().lock_edge_exclusive(holder.id(), &node, Edge::NextSibling).unwrap();

    let (started, waiting) = mpsc::channel();
    std::thread::scope(|s| {
        let (store, node) = (&store, &node);
        let waiter = s.spawn(move || {
            let tx = store.begin();
            started.send(()).unwrap();
            let begun = Instant::now();
            store.locks().lock_edge_exclusive(tx.id(), node, Edge::NextSibling).unwrap();
            let waited = begun.elapsed();
            store.commit(&tx).unwrap();
            waited
        });
        waiting.recv().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        store.commit(&holder).unwrap();
        assert!(waiter.join().unwrap() >= Duration::from_millis(20));
    });
    assert!(store.locks().get_edge_locks(&node, Edge::NextSibling).is_empty());
}

#[test]
fn test_rollback_releases_path_locks() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let locks = store.locks();
    let node: DeweyId = "4.2.6.3".parse().unwrap();
    let tx = store.begin();
    locks.lock_path(tx.id(), &node, LockMode::Exclusive).unwrap();
    locks.lock_edge_shared(tx.id(), &node, Edge::FirstChild).unwrap();
    assert_eq!(locks.locks_of(tx.id()).len(), 5);

    let other = store.begin();
    locks.lock_node_shared(other.id(), &"4.2".parse().unwrap()).unwrap();
    assert!(locks.lock_node_shared(other.id(), &node).is_err());

    store.rollback(&tx).unwrap();
    assert!(locks.locks_of(tx.id()).is_empty());
    locks.lock_node_exclusive(other.id(), &node).unwrap();
    store.commit(&other).unwrap();
}

/// Holds `held` on a node and checks that an exclusive request from another
/// transaction waits until the holder unlocks it.
fn writer_waits_for(held: LockMode) {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let locks = store.locks();
    let node: DeweyId = "1.4.2".parse().unwrap();
    let holder = store.begin();
    locks.lock_node(holder.id(), &node, held).unwrap();

    let granted = AtomicBool::new(false);
    std::thread::scope(|s| {
        let (store, node, granted) = (&store, &node, &granted);
        let writer = s.spawn(move || {
            let tx = store.begin();
            let result = store.locks().lock_node_exclusive(tx.id(), node);
            granted.store(true, Ordering::SeqCst);
            let holders = store.locks().get_node_locks(node);
            store.commit(&tx).unwrap();
            (tx.id(), result, holders)
        });
        std::thread::sleep(Duration::from_millis(100));
        assert!(!granted.load(Ordering::SeqCst));
        assert_eq!(locks.get_node_locks(node), vec![(holder.id(), held)]);

        locks.unlock_node(holder.id(), node);
        let (writer_id, result, holders) = writer.join().unwrap();
        result.unwrap();
        assert_eq!(holders, vec![(writer_id, LockMode::Exclusive)]);
    });
    store.commit(&holder).unwrap();
    assert!(locks.get_node_locks(&node).is_empty());
}

#[test]
fn test_update_lock_blocks_a_writer_until_unlock() {
    writer_waits_for(LockMode::Update);
}

#[test]
fn test_shared_lock_blocks_a_writer_until_unlock() {
    writer_waits_for(LockMode::Shared);
}

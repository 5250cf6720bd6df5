//! Manages transaction locks on tree nodes and on the edges between them.
//!
//! Locks are two-phase and released by [`LockManager::unlock_all`] at
//! transaction end, unless a caller unlocks one early. Waiting requests are
//! served in FIFO order, except that a holder converting to a stronger mode
//! goes ahead of new requests. Blocked requests feed a waits-for graph; a
//! request that closes a cycle fails with [`LockError::Deadlock`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, trace};

use crate::dewey::DeweyId;
use crate::TxId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    Shared,
    Update,
    Exclusive,
}

impl LockMode {
    /// S/S and S/U are compatible; U/U and anything with X are not.
    pub fn is_compatible(self, other: LockMode) -> bool {
        matches!(
            (self, other),
            (LockMode::Shared, LockMode::Shared)
                | (LockMode::Shared, LockMode::Update)
                | (LockMode::Update, LockMode::Shared)
        )
    }

    /// Whether holding `self` already grants `requested`.
    pub fn covers(self, requested: LockMode) -> bool {
        self >= requested
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockMode::Shared => "S",
            LockMode::Update => "U",
            LockMode::Exclusive => "X",
        })
    }
}

/// A relationship of a node that can be locked separately from the node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Edge {
    FirstChild,
    LastChild,
    PrevSibling,
    NextSibling,
    Attribute,
    Named(String),
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::FirstChild => f.write_str("first-child"),
            Edge::LastChild => f.write_str("last-child"),
            Edge::PrevSibling => f.write_str("prev-sibling"),
            Edge::NextSibling => f.write_str("next-sibling"),
            Edge::Attribute => f.write_str("attribute"),
            Edge::Named(name) => write!(f, "edge '{name}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockResource {
    Node(DeweyId),
    Edge(DeweyId, Edge),
}

impl LockResource {
    fn is_edge(&self) -> bool {
        matches!(self, LockResource::Edge(..))
    }
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockResource::Node(node) => write!(f, "node {node}"),
            LockResource::Edge(node, edge) => write!(f, "{edge} of node {node}"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("timed out waiting for {mode} lock on {resource}")]
    Timeout { resource: String, mode: LockMode },

    #[error("deadlock detected: transaction {tx} chosen as victim")]
    Deadlock { tx: TxId },
}

#[derive(Debug)]
struct LockRequest {
    tx_id: TxId,
    mode: LockMode,
}

#[derive(Debug, Default)]
struct LockQueue {
    waiting: VecDeque<LockRequest>,
    granted: HashMap<TxId, LockMode>,
    /// Set once the queue is dropped from the table. A request that raced
    /// with the removal must look the resource up again.
    retired: bool,
}

impl LockQueue {
    /// Transactions holding a lock that conflicts with `mode`.
    fn conflicting_holders(&self, tx_id: TxId, mode: LockMode) -> Vec<TxId> {
        self.granted
            .iter()
            .filter(|&(&holder, &held)| holder != tx_id && !held.is_compatible(mode))
            .map(|(&holder, _)| holder)
            .collect()
    }

    /// Waiting requests queued ahead of `tx_id` that conflict with `mode`.
    fn conflicting_waiters(&self, tx_id: TxId, mode: LockMode) -> Vec<TxId> {
        self.waiting
            .iter()
            .take_while(|req| req.tx_id != tx_id)
            .filter(|req| !req.mode.is_compatible(mode))
            .map(|req| req.tx_id)
            .collect()
    }

    fn is_grantable(&self, tx_id: TxId, mode: LockMode, conversion: bool) -> bool {
        if !self.conflicting_holders(tx_id, mode).is_empty() {
            return false;
        }
        conversion || self.waiting.front().map_or(true, |req| req.tx_id == tx_id)
    }
}

#[derive(Debug, Default)]
struct WaitQueue {
    queue: Mutex<LockQueue>,
    cvar: Condvar,
}

#[derive(Debug, Default)]
struct TypeCounters {
    requests: AtomicU64,
}

/// Lock and request counts for one kind of lock resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTypeStats {
    pub name: &'static str,
    /// Locks currently granted.
    pub lock_count: usize,
    /// Lock requests since the manager was created.
    pub request_count: u64,
}

pub struct LockManager {
    table: Mutex<HashMap<LockResource, Arc<WaitQueue>>>,
    waits_for: Mutex<HashMap<TxId, Vec<TxId>>>,
    held: Mutex<HashMap<TxId, HashSet<LockResource>>>,
    timeout: Duration,
    node_counters: TypeCounters,
    edge_counters: TypeCounters,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            waits_for: Mutex::new(HashMap::new()),
            held: Mutex::new(HashMap::new()),
            timeout,
            node_counters: TypeCounters::default(),
            edge_counters: TypeCounters::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn counters(&self, resource: &LockResource) -> &TypeCounters {
        if resource.is_edge() {
            &self.edge_counters
        } else {
            &self.node_counters
        }
    }

    fn wait_queue(&self, resource: &LockResource) -> Arc<WaitQueue> {
        self.table.lock().entry(resource.clone()).or_default().clone()
    }

    /// Acquires `resource` in `mode`, blocking until it is compatible with
    /// the other holders. A holder requesting a stronger mode converts.
    pub fn lock(&self, tx_id: TxId, resource: &LockResource, mode: LockMode) -> Result<(), LockError> {
        self.counters(resource).requests.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.timeout;
        loop {
            let wait_queue = self.wait_queue(resource);
            let mut guard = wait_queue.queue.lock();
            if guard.retired {
                continue;
            }

            let held = guard.granted.get(&tx_id).copied();
            if held.is_some_and(|held| held.covers(mode)) {
                return Ok(());
            }
            let target = held.map_or(mode, |held| held.max(mode));
            let conversion = held.is_some();

            if conversion {
                guard.waiting.push_front(LockRequest { tx_id, mode: target });
            } else {
                guard.waiting.push_back(LockRequest { tx_id, mode: target });
            }

            loop {
                if guard.is_grantable(tx_id, target, conversion) {
                    guard.waiting.retain(|req| req.tx_id != tx_id);
                    guard.granted.insert(tx_id, target);
                    drop(guard);
                    self.waits_for.lock().remove(&tx_id);
                    self.held.lock().entry(tx_id).or_default().insert(resource.clone());
                    trace!(tx = tx_id, %resource, mode = %target, "lock granted");
                    return Ok(());
                }

                let mut blockers = guard.conflicting_holders(tx_id, target);
                if !conversion {
                    blockers.extend(guard.conflicting_waiters(tx_id, target));
                }
                if self.closes_cycle(tx_id, blockers) {
                    guard.waiting.retain(|req| req.tx_id != tx_id);
                    drop(guard);
                    wait_queue.cvar.notify_all();
                    debug!(tx = tx_id, %resource, "deadlock victim");
                    return Err(LockError::Deadlock { tx: tx_id });
                }

                if wait_queue.cvar.wait_until(&mut guard, deadline).timed_out()
                    && !guard.is_grantable(tx_id, target, conversion)
                {
                    guard.waiting.retain(|req| req.tx_id != tx_id);
                    drop(guard);
                    self.waits_for.lock().remove(&tx_id);
                    wait_queue.cvar.notify_all();
                    debug!(tx = tx_id, %resource, mode = %target, "lock wait timed out");
                    return Err(LockError::Timeout {
                        resource: resource.to_string(),
                        mode: target,
                    });
                }
            }
        }
    }

    /// Records that `tx_id` waits for `blockers` and reports whether that
    /// closes a cycle through `tx_id`.
    fn closes_cycle(&self, tx_id: TxId, blockers: Vec<TxId>) -> bool {
        let mut waits_for = self.waits_for.lock();
        if blockers.is_empty() {
            waits_for.remove(&tx_id);
            return false;
        }
        waits_for.insert(tx_id, blockers);

        let mut visited = HashSet::new();
        let mut stack: Vec<TxId> = waits_for.get(&tx_id).cloned().unwrap_or_default();
        while let Some(tx) = stack.pop() {
            if tx == tx_id {
                waits_for.remove(&tx_id);
                return true;
            }
            if visited.insert(tx) {
                if let Some(next) = waits_for.get(&tx) {
                    stack.extend(next.iter().copied());
                }
            }
        }
        false
    }

    /// Releases one lock early.
    pub fn unlock(&self, tx_id: TxId, resource: &LockResource) {
        if let Some(resources) = self.held.lock().get_mut(&tx_id) {
            resources.remove(resource);
        }
        self.release(tx_id, resource);
    }

    fn release(&self, tx_id: TxId, resource: &LockResource) {
        let mut table = self.table.lock();
        let Some(wait_queue) = table.get(resource).cloned() else {
            return;
        };
        let mut queue = wait_queue.queue.lock();
        let changed = queue.granted.remove(&tx_id).is_some();
        queue.waiting.retain(|req| req.tx_id != tx_id);
        if changed && !queue.waiting.is_empty() {
            // The waiters no longer wait for `tx_id`, even before they wake.
            let mut waits_for = self.waits_for.lock();
            for req in &queue.waiting {
                if let Some(blockers) = waits_for.get_mut(&req.tx_id) {
                    blockers.retain(|&blocker| blocker != tx_id);
                }
            }
        }
        if queue.granted.is_empty() && queue.waiting.is_empty() {
            queue.retired = true;
            table.remove(resource);
        }
        drop(queue);
        drop(table);
        if changed {
            wait_queue.cvar.notify_all();
        }
    }

    /// Releases every lock of a transaction.
    pub fn unlock_all(&self, tx_id: TxId) {
        self.waits_for.lock().remove(&tx_id);
        let resources = self.held.lock().remove(&tx_id).unwrap_or_default();
        for resource in &resources {
            self.release(tx_id, resource);
        }
        if !resources.is_empty() {
            trace!(tx = tx_id, count = resources.len(), "released locks");
        }
    }

    /// Current holders of a resource.
    pub fn get_locks(&self, resource: &LockResource) -> Vec<(TxId, LockMode)> {
        let Some(wait_queue) = self.table.lock().get(resource).cloned() else {
            return Vec::new();
        };
        let queue = wait_queue.queue.lock();
        let mut holders: Vec<(TxId, LockMode)> = queue.granted.iter().map(|(&tx, &mode)| (tx, mode)).collect();
        holders.sort_unstable();
        holders
    }

    /// Resources a transaction holds.
    pub fn locks_of(&self, tx_id: TxId) -> Vec<LockResource> {
        self.held
            .lock()
            .get(&tx_id)
            .map(|resources| resources.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> Vec<LockTypeStats> {
        let (mut nodes, mut edges) = (0, 0);
        for resources in self.held.lock().values() {
            for resource in resources {
                if resource.is_edge() {
                    edges += 1;
                } else {
                    nodes += 1;
                }
            }
        }
        vec![
            LockTypeStats {
                name: "node",
                lock_count: nodes,
                request_count: self.node_counters.requests.load(Ordering::Relaxed),
            },
            LockTypeStats {
                name: "edge",
                lock_count: edges,
                request_count: self.edge_counters.requests.load(Ordering::Relaxed),
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(division: u32) -> LockResource {
        LockResource::Node(DeweyId::document(1).child(division))
    }

    #[test]
    fn compatibility_matrix() {
        use LockMode::*;
        assert!(Shared.is_compatible(Shared));
        assert!(Shared.is_compatible(Update));
        assert!(Update.is_compatible(Shared));
        assert!(!Update.is_compatible(Update));
        assert!(!Exclusive.is_compatible(Shared));
        assert!(!Shared.is_compatible(Exclusive));
        assert!(Exclusive.covers(Update));
        assert!(!Shared.covers(Update));
    }

    #[test]
    fn reentrant_and_conversion() {
        let lm = LockManager::default();
        let r = node(3);
        lm.lock(1, &r, LockMode::Shared).unwrap();
        lm.lock(1, &r, LockMode::Shared).unwrap();
        lm.lock(1, &r, LockMode::Exclusive).unwrap();
        assert_eq!(lm.get_locks(&r), vec![(1, LockMode::Exclusive)]);
        lm.unlock_all(1);
        assert!(lm.get_locks(&r).is_empty());
    }

    #[test]
    fn conflicting_request_times_out() {
        let lm = LockManager::new(Duration::from_millis(50));
        let r = node(2);
        lm.lock(1, &r, LockMode::Update).unwrap();
        let err = lm.lock(2, &r, LockMode::Update).unwrap_err();
        assert!(matches!(err, LockError::Timeout { mode: LockMode::Update, .. }));
        lm.lock(2, &r, LockMode::Shared).unwrap();
    }

    #[test]
    fn deadlock_is_detected() {
        let lm = Arc::new(LockManager::new(Duration::from_secs(5)));
        let (a, b) = (node(2), node(4));
        lm.lock(1, &a, LockMode::Exclusive).unwrap();
        lm.lock(2, &b, LockMode::Exclusive).unwrap();

        let lm2 = lm.clone();
        let b2 = b.clone();
        let waiter = std::thread::spawn(move || lm2.lock(1, &b2, LockMode::Exclusive));
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(lm.lock(2, &a, LockMode::Exclusive), Err(LockError::Deadlock { tx: 2 }));
        lm.unlock_all(2);
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn released_lock_is_not_a_wait_edge() {
        let lm = Arc::new(LockManager::new(Duration::from_secs(5)));
        let (a, b) = (node(2), node(4));
        lm.lock(1, &a, LockMode::Exclusive).unwrap();
        lm.lock(2, &b, LockMode::Exclusive).unwrap();

        let lm2 = lm.clone();
        let a2 = a.clone();
        let waiter = std::thread::spawn(move || {
            let granted = lm2.lock(2, &a2, LockMode::Exclusive);
            lm2.unlock_all(2);
            granted
        });
        std::thread::sleep(Duration::from_millis(100));

        // Transaction 2 may not have woken yet, but it no longer waits for 1.
        lm.unlock(1, &a);
        assert_eq!(lm.lock(1, &b, LockMode::Exclusive), Ok(()));
        waiter.join().unwrap().unwrap();
        lm.unlock_all(1);
    }

    #[test]
    fn stats_split_nodes_and_edges() {
        let lm = LockManager::default();
        let id = DeweyId::document(1).child(2);
        lm.lock(7, &LockResource::Node(id.clone()), LockMode::Shared).unwrap();
        lm.lock(7, &LockResource::Edge(id, Edge::FirstChild), LockMode::Shared).unwrap();
        let stats = lm.stats();
        assert_eq!(stats[0].name, "node");
        assert_eq!((stats[0].lock_count, stats[0].request_count), (1, 1));
        assert_eq!((stats[1].lock_count, stats[1].request_count), (1, 1));
        lm.unlock_all(7);
        assert_eq!(lm.stats()[1].lock_count, 0);
    }
}

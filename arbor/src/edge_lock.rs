//! Node and edge locking for hierarchical documents.
//!
//! An edge lock protects one relationship of a node (its first child, its
//! next sibling, ...) without locking the node itself, so inserting a
//! sibling does not block readers of the node's content.

use crate::dewey::DeweyId;
use crate::lock_manager::{Edge, LockError, LockManager, LockMode, LockResource};
use crate::TxId;

pub trait EdgeLockService {
    fn lock_node(&self, tx: TxId, node: &DeweyId, mode: LockMode) -> Result<(), LockError>;

    fn lock_edge(&self, tx: TxId, node: &DeweyId, edge: Edge, mode: LockMode) -> Result<(), LockError>;

    fn unlock_node(&self, tx: TxId, node: &DeweyId);

    fn unlock_edge(&self, tx: TxId, node: &DeweyId, edge: Edge);

    fn get_node_locks(&self, node: &DeweyId) -> Vec<(TxId, LockMode)>;

    fn get_edge_locks(&self, node: &DeweyId, edge: Edge) -> Vec<(TxId, LockMode)>;

    fn lock_node_shared(&self, tx: TxId, node: &DeweyId) -> Result<(), LockError> {
        self.lock_node(tx, node, LockMode::Shared)
    }

    fn lock_node_update(&self, tx: TxId, node: &DeweyId) -> Result<(), LockError> {
        self.lock_node(tx, node, LockMode::Update)
    }

    fn lock_node_exclusive(&self, tx: TxId, node: &DeweyId) -> Result<(), LockError> {
        self.lock_node(tx, node, LockMode::Exclusive)
    }

    fn lock_edge_shared(&self, tx: TxId, node: &DeweyId, edge: Edge) -> Result<(), LockError> {
        self.lock_edge(tx, node, edge, LockMode::Shared)
    }

    fn lock_edge_update(&self, tx: TxId, node: &DeweyId, edge: Edge) -> Result<(), LockError> {
        self.lock_edge(tx, node, edge, LockMode::Update)
    }

    fn lock_edge_exclusive(&self, tx: TxId, node: &DeweyId, edge: Edge) -> Result<(), LockError> {
        self.lock_edge(tx, node, edge, LockMode::Exclusive)
    }

    /// Locks a node and every ancestor up to the document root, ancestors
    /// first and in `Shared` mode.
    fn lock_path(&self, tx: TxId, node: &DeweyId, mode: LockMode) -> Result<(), LockError> {
        let mut ancestors = Vec::new();
        let mut current = node.parent();
        while let Some(ancestor) = current {
            current = ancestor.parent();
            ancestors.push(ancestor);
        }
        for ancestor in ancestors.iter().rev() {
            self.lock_node(tx, ancestor, LockMode::Shared)?;
        }
        self.lock_node(tx, node, mode)
    }
}

impl EdgeLockService for LockManager {
    fn lock_node(&self, tx: TxId, node: &DeweyId, mode: LockMode) -> Result<(), LockError> {
        self.lock(tx, &LockResource::Node(node.clone()), mode)
    }

    fn lock_edge(&self, tx: TxId, node: &DeweyId, edge: Edge, mode: LockMode) -> Result<(), LockError> {
        self.lock(tx, &LockResource::Edge(node.clone(), edge), mode)
    }

    fn unlock_node(&self, tx: TxId, node: &DeweyId) {
        self.unlock(tx, &LockResource::Node(node.clone()));
    }

    fn unlock_edge(&self, tx: TxId, node: &DeweyId, edge: Edge) {
        self.unlock(tx, &LockResource::Edge(node.clone(), edge));
    }

    fn get_node_locks(&self, node: &DeweyId) -> Vec<(TxId, LockMode)> {
        self.get_locks(&LockResource::Node(node.clone()))
    }

    fn get_edge_locks(&self, node: &DeweyId, edge: Edge) -> Vec<(TxId, LockMode)> {
        self.get_locks(&LockResource::Edge(node.clone(), edge))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn edge_locks_are_independent_of_node_locks() {
        let lm = LockManager::new(Duration::from_millis(50));
        let node = DeweyId::document(1).child(2);
        lm.lock_node_exclusive(1, &node).unwrap();
        lm.lock_edge_exclusive(2, &node, Edge::NextSibling).unwrap();
        assert!(lm.lock_edge_shared(3, &node, Edge::NextSibling).is_err());
        lm.lock_edge_shared(3, &node, Edge::FirstChild).unwrap();
        assert_eq!(lm.get_edge_locks(&node, Edge::NextSibling), vec![(2, LockMode::Exclusive)]);
        lm.unlock_edge(2, &node, Edge::NextSibling);
        lm.lock_edge_shared(3, &node, Edge::NextSibling).unwrap();
    }

    #[test]
    fn path_locks_cover_ancestors() {
        let lm = LockManager::default();
        let node = DeweyId::document(4).child(2).child(6);
        lm.lock_path(9, &node, LockMode::Exclusive).unwrap();
        assert_eq!(lm.get_node_locks(&DeweyId::document(4)), vec![(9, LockMode::Shared)]);
        assert_eq!(lm.get_node_locks(&node), vec![(9, LockMode::Exclusive)]);
        assert_eq!(lm.locks_of(9).len(), 3);
    }
}

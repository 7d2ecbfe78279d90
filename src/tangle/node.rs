//! A transaction installed in the tangle, together with its graph edges.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::transaction::Transaction;
use crate::TxHash;

use super::{read, write};

/// A node of the tangle graph.
///
/// Ownership runs downward: a parent's child list holds `Arc`s, so the
/// genesis transitively owns the whole DAG. The upward edges are `Weak`
/// back-references, which keeps the parent/child double-link acyclic for the
/// allocator — dropping the genesis releases everything.
///
/// The cumulative weight is a bit-cast `f32` in an atomic so background
/// propagation passes never block readers.
pub struct TangleNode {
    tx: Transaction,
    is_genesis: bool,
    parents: RwLock<Vec<Weak<TangleNode>>>,
    children: RwLock<Vec<Arc<TangleNode>>>,
    weight: AtomicU32,
}

impl TangleNode {
    /// Wrap a transaction with edges to already-installed parent nodes.
    pub fn new(tx: Transaction, parents: &[Arc<TangleNode>]) -> Arc<TangleNode> {
        let own = Self::own_weight_of(&tx);
        Arc::new(TangleNode {
            tx,
            is_genesis: false,
            parents: RwLock::new(parents.iter().map(Arc::downgrade).collect()),
            children: RwLock::new(Vec::new()),
            weight: AtomicU32::new(own.to_bits()),
        })
    }

    /// Wrap a transaction as a genesis node: no parents, roots the DAG.
    pub fn new_genesis(tx: Transaction) -> Arc<TangleNode> {
        let own = Self::own_weight_of(&tx);
        Arc::new(TangleNode {
            tx,
            is_genesis: true,
            parents: RwLock::new(Vec::new()),
            children: RwLock::new(Vec::new()),
            weight: AtomicU32::new(own.to_bits()),
        })
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    pub fn hash(&self) -> &TxHash {
        self.tx.hash()
    }

    pub fn is_genesis(&self) -> bool {
        self.is_genesis
    }

    fn own_weight_of(tx: &Transaction) -> f32 {
        (tx.difficulty() as f32 / 5.0).min(1.0)
    }

    /// A node's own weight grows with mining difficulty, capped at 1.
    pub fn own_weight(&self) -> f32 {
        Self::own_weight_of(&self.tx)
    }

    pub fn cumulative_weight(&self) -> f32 {
        f32::from_bits(self.weight.load(Ordering::Acquire))
    }

    pub(crate) fn store_cumulative_weight(&self, weight: f32) {
        self.weight.store(weight.to_bits(), Ordering::Release);
    }

    /// Live parent nodes (pruned parents simply drop out).
    pub fn parents(&self) -> Vec<Arc<TangleNode>> {
        read(&self.parents).iter().filter_map(Weak::upgrade).collect()
    }

    /// Snapshot of the child list in insertion order.
    pub fn children(&self) -> Vec<Arc<TangleNode>> {
        read(&self.children).clone()
    }

    pub fn is_tip(&self) -> bool {
        read(&self.children).is_empty()
    }

    pub(crate) fn add_child(&self, child: Arc<TangleNode>) {
        write(&self.children).push(child);
    }

    pub(crate) fn remove_child(&self, hash: &TxHash) {
        write(&self.children).retain(|c| c.hash() != hash);
    }

    /// Detach and return the whole child list (pruning splice).
    pub(crate) fn take_children(&self) -> Vec<Arc<TangleNode>> {
        std::mem::take(&mut *write(&self.children))
    }

    pub(crate) fn set_parents(&self, parents: Vec<Weak<TangleNode>>) {
        *write(&self.parents) = parents;
    }

    pub(crate) fn clear_parents(&self) {
        write(&self.parents).clear();
    }

    /// Longest path to the genesis. Left-behind tip detection compares this
    /// against the average height of freshly chosen parents.
    pub fn height(&self) -> u64 {
        self.parents()
            .iter()
            .map(|p| p.height())
            .max()
            .map(|h| h + 1)
            .unwrap_or(0)
    }

    /// Whether `other` is this node or one of its descendants.
    pub fn is_ancestor_of(&self, other: &Arc<TangleNode>) -> bool {
        if self.hash() == other.hash() {
            return true;
        }
        let mut visited = HashSet::new();
        let mut queue: VecDeque<Arc<TangleNode>> = self.children().into();
        while let Some(node) = queue.pop_front() {
            if node.hash() == other.hash() {
                return true;
            }
            if !visited.insert(node.hash().clone()) {
                continue;
            }
            queue.extend(node.children());
        }
        false
    }
}

impl std::fmt::Debug for TangleNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TangleNode")
            .field("hash", self.hash())
            .field("is_genesis", &self.is_genesis)
            .field("children", &read(&self.children).len())
            .field("cumulative_weight", &self.cumulative_weight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;

    fn chain(len: usize) -> Vec<Arc<TangleNode>> {
        let mut nodes = vec![TangleNode::new_genesis(Transaction::genesis(vec![]))];
        for i in 1..len {
            let parent = nodes[i - 1].clone();
            let tx = Transaction::new(vec![parent.hash().clone()], vec![], vec![], 1);
            let node = TangleNode::new(tx, &[parent.clone()]);
            parent.add_child(node.clone());
            nodes.push(node);
        }
        nodes
    }

    #[test]
    fn own_weight_scales_with_difficulty_capped() {
        let low = TangleNode::new_genesis(Transaction::new(vec![], vec![], vec![], 1));
        let high = TangleNode::new_genesis(Transaction::new(vec![], vec![], vec![], 10));
        assert!((low.own_weight() - 0.2).abs() < f32::EPSILON);
        assert!((high.own_weight() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn height_counts_longest_path() {
        let nodes = chain(4);
        assert_eq!(nodes[0].height(), 0);
        assert_eq!(nodes[3].height(), 3);
    }

    #[test]
    fn ancestor_includes_self_and_descendants() {
        let nodes = chain(3);
        assert!(nodes[0].is_ancestor_of(&nodes[2]));
        assert!(nodes[1].is_ancestor_of(&nodes[1]));
        assert!(!nodes[2].is_ancestor_of(&nodes[0]));
    }

    #[test]
    fn weak_parents_drop_with_the_root() {
        let tail = {
            let nodes = chain(3);
            nodes[2].clone()
        };
        // The only strong path to the ancestors went through the dropped
        // root, so the upward links are gone.
        assert!(tail.parents().is_empty());
        assert_eq!(tail.height(), 0);
    }
}

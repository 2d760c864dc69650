//! Storage strategies for B+Tree nodes.

use super::node::{Node, NodeRef, ValueRef};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;

/// Storage backend of a [`BTree`](super::BTree).
///
/// The tree algorithm only builds new nodes in memory and hands the new root
/// to [`set_root`](NodeManager::set_root); the manager decides how nodes and
/// values are persisted and how lazy references are resolved.
pub trait NodeManager<K, V>: Send + Sync {
    /// Returns the current root node.
    fn get_root(&self) -> Result<Arc<Node<K, V>>>;

    /// Publishes `root` as the new root.
    ///
    /// For persistent managers this writes every resident node and value
    /// reachable from `root`, then the new root pointer.
    fn set_root(&self, root: Node<K, V>) -> Result<()>;

    /// Resolves a child reference into the node it points to.
    fn unwrap_node(&self, node: &NodeRef<K, V>) -> Result<Arc<Node<K, V>>>;

    /// Resolves a value reference into the value it points to.
    fn unwrap_value(&self, value: &ValueRef<V>) -> Result<Arc<V>>;

    /// Wraps a freshly built node into a child reference.
    fn wrap_node(&self, node: Node<K, V>) -> NodeRef<K, V> {
        NodeRef::Resident(Arc::new(node))
    }

    /// Wraps a pair of freshly built siblings.
    fn wrap_nodes(&self, left: Node<K, V>, right: Node<K, V>) -> (NodeRef<K, V>, NodeRef<K, V>) {
        (self.wrap_node(left), self.wrap_node(right))
    }

    /// Wraps a value into a leaf entry reference.
    fn wrap_value(&self, value: V) -> ValueRef<V> {
        ValueRef::Resident(Arc::new(value))
    }
}

/// Node manager keeping the whole tree in memory.
///
/// The root is published through an `RwLock<Arc<_>>`, so readers never
/// observe a half-built tree while a writer swaps in a new root.
pub struct InMemoryNodeManager<K, V> {
    root: RwLock<Arc<Node<K, V>>>,
}

impl<K: Ord + Clone, V> InMemoryNodeManager<K, V> {
    /// Creates a manager holding an empty tree.
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Arc::new(Node::empty())),
        }
    }
}

impl<K: Ord + Clone, V> Default for InMemoryNodeManager<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> NodeManager<K, V> for InMemoryNodeManager<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
    fn get_root(&self) -> Result<Arc<Node<K, V>>> {
        Ok(Arc::clone(&self.root.read()))
    }

    fn set_root(&self, root: Node<K, V>) -> Result<()> {
        *self.root.write() = Arc::new(root);
        Ok(())
    }

    fn unwrap_node(&self, node: &NodeRef<K, V>) -> Result<Arc<Node<K, V>>> {
        match node {
            NodeRef::Resident(node) => Ok(Arc::clone(node)),
            NodeRef::OnDisk { position, .. } => Err(Error::Internal(format!(
                "in-memory tree holds an on-disk node reference at {position}"
            ))),
        }
    }

    fn unwrap_value(&self, value: &ValueRef<V>) -> Result<Arc<V>> {
        match value {
            ValueRef::Resident(value) => Ok(Arc::clone(value)),
            ValueRef::OnDisk { position, .. } => Err(Error::Internal(format!(
                "in-memory tree holds an on-disk value reference at {position}"
            ))),
        }
    }
}

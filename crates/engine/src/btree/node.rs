//! B+Tree nodes and the references between them.

use super::block_file::RecordPointer;
use crate::error::{Error, Result};
use std::sync::Arc;

/// Type code of a serialized leaf node.
pub const LEAF_NODE: u8 = 1;

/// Type code of a serialized internal node.
pub const INTERNAL_NODE: u8 = 2;

/// Reference from an internal node to one of its children.
///
/// A child is either resident in memory (freshly built, not yet written) or
/// a lazy pointer to a node record that is only read when resolved through
/// the node manager.
#[derive(Debug)]
pub enum NodeRef<K, V> {
    /// The node is held in memory.
    Resident(Arc<Node<K, V>>),
    /// The node is persisted at the given location.
    OnDisk {
        /// Logical position of the node record.
        position: u64,
        /// Length of the node payload.
        length: u64,
    },
}

impl<K, V> NodeRef<K, V> {
    /// Creates an on-disk reference from a record pointer.
    pub fn on_disk(pointer: RecordPointer) -> Self {
        NodeRef::OnDisk {
            position: pointer.position,
            length: pointer.length,
        }
    }

    /// Returns `true` if the node still has to be written.
    pub fn is_resident(&self) -> bool {
        matches!(self, NodeRef::Resident(_))
    }
}

impl<K, V> Clone for NodeRef<K, V> {
    fn clone(&self) -> Self {
        match self {
            NodeRef::Resident(node) => NodeRef::Resident(Arc::clone(node)),
            NodeRef::OnDisk { position, length } => NodeRef::OnDisk {
                position: *position,
                length: *length,
            },
        }
    }
}

/// Reference from a leaf entry to its value.
#[derive(Debug)]
pub enum ValueRef<V> {
    /// The value is held in memory.
    Resident(Arc<V>),
    /// The value is persisted at the given location.
    OnDisk {
        /// Logical position of the value record.
        position: u64,
        /// Length of the value payload.
        length: u64,
    },
}

impl<V> ValueRef<V> {
    /// Creates an on-disk reference from a record pointer.
    pub fn on_disk(pointer: RecordPointer) -> Self {
        ValueRef::OnDisk {
            position: pointer.position,
            length: pointer.length,
        }
    }

    /// Returns `true` if the value still has to be written.
    pub fn is_resident(&self) -> bool {
        matches!(self, ValueRef::Resident(_))
    }
}

impl<V> Clone for ValueRef<V> {
    fn clone(&self) -> Self {
        match self {
            ValueRef::Resident(value) => ValueRef::Resident(Arc::clone(value)),
            ValueRef::OnDisk { position, length } => ValueRef::OnDisk {
                position: *position,
                length: *length,
            },
        }
    }
}

/// A B+Tree node.
#[derive(Debug)]
pub enum Node<K, V> {
    /// Sorted keys mapped to values.
    Leaf(Vec<(K, ValueRef<V>)>),
    /// Sorted first keys of each child subtree mapped to the child.
    Internal(Vec<(K, NodeRef<K, V>)>),
}

impl<K: Clone, V> Clone for Node<K, V> {
    fn clone(&self) -> Self {
        match self {
            Node::Leaf(entries) => Node::Leaf(entries.clone()),
            Node::Internal(children) => Node::Internal(children.clone()),
        }
    }
}

impl<K: Ord + Clone, V> Node<K, V> {
    /// An empty leaf, the root of an empty tree.
    pub fn empty() -> Self {
        Node::Leaf(Vec::new())
    }

    /// Serialized type code.
    pub fn type_code(&self) -> u8 {
        match self {
            Node::Leaf(_) => LEAF_NODE,
            Node::Internal(_) => INTERNAL_NODE,
        }
    }

    /// Number of entries (values for a leaf, children for an internal node).
    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(entries) => entries.len(),
            Node::Internal(children) => children.len(),
        }
    }

    /// Returns `true` if the node holds no entry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` for leaf nodes.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Smallest key of the subtree rooted at this node.
    pub fn first_key(&self) -> Result<&K> {
        let key = match self {
            Node::Leaf(entries) => entries.first().map(|(k, _)| k),
            Node::Internal(children) => children.first().map(|(k, _)| k),
        };
        key.ok_or_else(|| Error::Internal("empty node has no first key".to_string()))
    }

    /// Index of the child whose key range contains `key`.
    ///
    /// Routes by floor key; keys smaller than every separator go to the first
    /// child.
    pub(crate) fn route(children: &[(K, NodeRef<K, V>)], key: &K) -> usize {
        match children.binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(index) => index,
            Err(0) => 0,
            Err(index) => index - 1,
        }
    }

    /// Splits the node into two halves, the left one receiving the smaller half.
    pub(crate) fn split(self) -> (Node<K, V>, Node<K, V>) {
        match self {
            Node::Leaf(mut entries) => {
                let right = entries.split_off(entries.len() / 2);
                (Node::Leaf(entries), Node::Leaf(right))
            }
            Node::Internal(mut children) => {
                let right = children.split_off(children.len() / 2);
                (Node::Internal(children), Node::Internal(right))
            }
        }
    }

    /// Concatenates two adjacent siblings of the same kind.
    pub(crate) fn merge(self, right: Node<K, V>) -> Result<Node<K, V>> {
        match (self, right) {
            (Node::Leaf(mut left), Node::Leaf(right)) => {
                left.extend(right);
                Ok(Node::Leaf(left))
            }
            (Node::Internal(mut left), Node::Internal(right)) => {
                left.extend(right);
                Ok(Node::Internal(left))
            }
            _ => Err(Error::Internal(
                "cannot merge a leaf with an internal node".to_string(),
            )),
        }
    }

    /// Evens out the entries of two adjacent siblings.
    pub(crate) fn redistribute(self, right: Node<K, V>) -> Result<(Node<K, V>, Node<K, V>)> {
        Ok(self.merge(right)?.split())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(keys: &[u32]) -> Node<u32, u32> {
        Node::Leaf(
            keys.iter()
                .map(|k| (*k, ValueRef::Resident(Arc::new(*k * 10))))
                .collect(),
        )
    }

    #[test]
    fn test_route_by_floor_key() {
        let children: Vec<(u32, NodeRef<u32, u32>)> = [10, 20, 30]
            .iter()
            .map(|k| (*k, NodeRef::OnDisk { position: *k as u64, length: 1 }))
            .collect();
        assert_eq!(Node::route(&children, &5), 0);
        assert_eq!(Node::route(&children, &10), 0);
        assert_eq!(Node::route(&children, &19), 0);
        assert_eq!(Node::route(&children, &20), 1);
        assert_eq!(Node::route(&children, &99), 2);
    }

    #[test]
    fn test_split_halves() {
        let (left, right) = leaf(&[1, 2, 3, 4, 5]).split();
        assert_eq!(left.len(), 2);
        assert_eq!(right.len(), 3);
        assert_eq!(*right.first_key().unwrap(), 3);
    }

    #[test]
    fn test_redistribute() {
        let (left, right) = leaf(&[1, 2]).redistribute(leaf(&[3, 4, 5, 6])).unwrap();
        assert_eq!(left.len(), 3);
        assert_eq!(right.len(), 3);
        assert_eq!(*right.first_key().unwrap(), 4);
    }

    #[test]
    fn test_merge_mismatched_kinds() {
        let internal: Node<u32, u32> = Node::Internal(vec![]);
        assert!(leaf(&[1]).merge(internal).is_err());
    }

    #[test]
    fn test_empty_node_has_no_first_key() {
        assert!(Node::<u32, u32>::empty().first_key().is_err());
    }
}

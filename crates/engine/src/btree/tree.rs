//! The B+Tree algorithm, independent of where nodes are stored.

use super::manager::NodeManager;
use super::node::{Node, ValueRef};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Default maximum number of entries per node.
pub const DEFAULT_BRANCHING_FACTOR: usize = 64;

/// Smallest supported branching factor.
pub const MIN_BRANCHING_FACTOR: usize = 3;

enum InsertOutcome<K, V> {
    Unchanged,
    Updated(Node<K, V>),
    Split(Node<K, V>, Node<K, V>),
}

/// Depth and size of a tree, as reported by [`BTree::check_invariants`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeShape {
    /// Number of levels, 1 for a tree made of a single leaf.
    pub depth: usize,
    /// Number of nodes.
    pub nodes: usize,
    /// Number of key/value entries.
    pub entries: usize,
}

/// Ordered map stored in a B+Tree.
///
/// Every mutation builds a new root-to-leaf path and publishes it through the
/// [`NodeManager`]; untouched subtrees are shared with the previous version.
/// Mutations are serialized by an internal lock while readers work on the
/// root they observed.
pub struct BTree<K, V> {
    manager: Arc<dyn NodeManager<K, V>>,
    branching_factor: usize,
    write_lock: Mutex<()>,
}

impl<K, V> BTree<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    /// Creates a tree over `manager`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `branching_factor` is below
    /// [`MIN_BRANCHING_FACTOR`].
    pub fn new(manager: Arc<dyn NodeManager<K, V>>, branching_factor: usize) -> Result<Self> {
        if branching_factor < MIN_BRANCHING_FACTOR {
            return Err(Error::InvalidConfig(format!(
                "branching factor {branching_factor} is below {MIN_BRANCHING_FACTOR}"
            )));
        }
        Ok(Self {
            manager,
            branching_factor,
            write_lock: Mutex::new(()),
        })
    }

    /// Maximum number of entries per node.
    pub fn branching_factor(&self) -> usize {
        self.branching_factor
    }

    fn min_entries(&self) -> usize {
        self.branching_factor.div_ceil(2)
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let mut node = self.manager.get_root()?;
        loop {
            let next = match node.as_ref() {
                Node::Leaf(entries) => {
                    return match entries.binary_search_by(|(k, _)| k.cmp(key)) {
                        Ok(index) => {
                            let value = self.manager.unwrap_value(&entries[index].1)?;
                            Ok(Some(V::clone(&value)))
                        }
                        Err(_) => Ok(None),
                    };
                }
                Node::Internal(children) => {
                    let index = Node::route(children, key);
                    self.manager.unwrap_node(&children[index].1)?
                }
            };
            node = next;
        }
    }

    /// Returns `true` if `key` is present.
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        self.insert_with(key, value, true).map(|_| ())
    }

    /// Stores `value` under `key` unless the key is already present.
    ///
    /// Returns `true` if the entry was inserted.
    pub fn insert_if_absent(&self, key: K, value: V) -> Result<bool> {
        self.insert_with(key, value, false)
    }

    fn insert_with(&self, key: K, value: V, overwrite: bool) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let root = self.manager.get_root()?;
        let value = self.manager.wrap_value(value);
        let new_root = match self.insert_into(&root, key, value, overwrite)? {
            InsertOutcome::Unchanged => return Ok(false),
            InsertOutcome::Updated(node) => node,
            InsertOutcome::Split(left, right) => {
                let left_key = left.first_key()?.clone();
                let right_key = right.first_key()?.clone();
                let (left, right) = self.manager.wrap_nodes(left, right);
                Node::Internal(vec![(left_key, left), (right_key, right)])
            }
        };
        self.manager.set_root(new_root)?;
        Ok(true)
    }

    fn insert_into(
        &self,
        node: &Node<K, V>,
        key: K,
        value: ValueRef<V>,
        overwrite: bool,
    ) -> Result<InsertOutcome<K, V>> {
        match node {
            Node::Leaf(entries) => {
                let mut entries = entries.clone();
                match entries.binary_search_by(|(k, _)| k.cmp(&key)) {
                    Ok(_) if !overwrite => return Ok(InsertOutcome::Unchanged),
                    Ok(index) => entries[index].1 = value,
                    Err(index) => entries.insert(index, (key, value)),
                }
                Ok(self.maybe_split(Node::Leaf(entries)))
            }
            Node::Internal(children) => {
                let index = Node::route(children, &key);
                let child = self.manager.unwrap_node(&children[index].1)?;
                let outcome = self.insert_into(&child, key, value, overwrite)?;
                let mut children = children.clone();
                match outcome {
                    InsertOutcome::Unchanged => return Ok(InsertOutcome::Unchanged),
                    InsertOutcome::Updated(child) => {
                        children[index] = (child.first_key()?.clone(), self.manager.wrap_node(child));
                    }
                    InsertOutcome::Split(left, right) => {
                        let left_key = left.first_key()?.clone();
                        let right_key = right.first_key()?.clone();
                        let (left, right) = self.manager.wrap_nodes(left, right);
                        children[index] = (left_key, left);
                        children.insert(index + 1, (right_key, right));
                    }
                }
                Ok(self.maybe_split(Node::Internal(children)))
            }
        }
    }

    fn maybe_split(&self, node: Node<K, V>) -> InsertOutcome<K, V> {
        if node.len() > self.branching_factor {
            let (left, right) = node.split();
            InsertOutcome::Split(left, right)
        } else {
            InsertOutcome::Updated(node)
        }
    }

    /// Removes `key` if present.
    ///
    /// Returns `true` if an entry was removed.
    pub fn delete_if_present(&self, key: &K) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let root = self.manager.get_root()?;
        let mut new_root = match self.delete_from(&root, key)? {
            Some(node) => node,
            None => return Ok(false),
        };

        // An internal root left with a single child is replaced by that child.
        loop {
            let only_child = match &new_root {
                Node::Internal(children) if children.len() == 1 => {
                    self.manager.unwrap_node(&children[0].1)?
                }
                _ => break,
            };
            new_root = Node::clone(&only_child);
        }

        self.manager.set_root(new_root)?;
        Ok(true)
    }

    fn delete_from(&self, node: &Node<K, V>, key: &K) -> Result<Option<Node<K, V>>> {
        match node {
            Node::Leaf(entries) => match entries.binary_search_by(|(k, _)| k.cmp(key)) {
                Ok(index) => {
                    let mut entries = entries.clone();
                    entries.remove(index);
                    Ok(Some(Node::Leaf(entries)))
                }
                Err(_) => Ok(None),
            },
            Node::Internal(children) => {
                let index = Node::route(children, key);
                let child = self.manager.unwrap_node(&children[index].1)?;
                let child = match self.delete_from(&child, key)? {
                    Some(child) => child,
                    None => return Ok(None),
                };

                let mut children = children.clone();
                if child.len() >= self.min_entries() || children.len() == 1 {
                    children[index] = (child.first_key()?.clone(), self.manager.wrap_node(child));
                    return Ok(Some(Node::Internal(children)));
                }

                // Rebalance with the left sibling when there is one.
                let (left_index, left, right) = if index > 0 {
                    let sibling = self.manager.unwrap_node(&children[index - 1].1)?;
                    (index - 1, Node::clone(&sibling), child)
                } else {
                    let sibling = self.manager.unwrap_node(&children[index + 1].1)?;
                    (index, child, Node::clone(&sibling))
                };

                if left.len() + right.len() > 2 * self.min_entries() - 1 {
                    let (left, right) = left.redistribute(right)?;
                    let left_key = left.first_key()?.clone();
                    let right_key = right.first_key()?.clone();
                    let (left, right) = self.manager.wrap_nodes(left, right);
                    children[left_index] = (left_key, left);
                    children[left_index + 1] = (right_key, right);
                } else {
                    let merged = left.merge(right)?;
                    let merged_key = merged.first_key()?.clone();
                    children[left_index] = (merged_key, self.manager.wrap_node(merged));
                    children.remove(left_index + 1);
                }
                Ok(Some(Node::Internal(children)))
            }
        }
    }

    /// Returns every entry in key order.
    pub fn entries(&self) -> Result<Vec<(K, V)>> {
        self.range(None, None)
    }

    /// Returns the entries with `start <= key < end` in key order.
    ///
    /// A missing bound leaves that side open.
    pub fn range(&self, start: Option<&K>, end: Option<&K>) -> Result<Vec<(K, V)>> {
        let root = self.manager.get_root()?;
        let mut out = Vec::new();
        self.collect(&root, start, end, &mut out)?;
        Ok(out)
    }

    fn collect(
        &self,
        node: &Node<K, V>,
        start: Option<&K>,
        end: Option<&K>,
        out: &mut Vec<(K, V)>,
    ) -> Result<()> {
        match node {
            Node::Leaf(entries) => {
                for (key, value) in entries {
                    if start.is_some_and(|s| key < s) {
                        continue;
                    }
                    if end.is_some_and(|e| key >= e) {
                        break;
                    }
                    let value = self.manager.unwrap_value(value)?;
                    out.push((key.clone(), V::clone(&value)));
                }
            }
            Node::Internal(children) => {
                let first = start.map_or(0, |s| Node::route(children, s));
                for (key, child) in &children[first..] {
                    if end.is_some_and(|e| key >= e) {
                        break;
                    }
                    let child = self.manager.unwrap_node(child)?;
                    self.collect(&child, start, end, out)?;
                }
            }
        }
        Ok(())
    }

    /// Walks the whole tree and checks its structural invariants: sorted keys,
    /// separators equal to their subtree's first key, node sizes within
    /// bounds and leaves at a uniform depth.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] describing the first violation found.
    pub fn check_invariants(&self) -> Result<TreeShape> {
        let root = self.manager.get_root()?;
        let mut shape = TreeShape {
            depth: 0,
            nodes: 0,
            entries: 0,
        };
        let mut leaf_depth = None;
        self.check_node(&root, true, 1, &mut leaf_depth, &mut shape)?;
        shape.depth = leaf_depth.unwrap_or(1);
        Ok(shape)
    }

    fn check_node(
        &self,
        node: &Node<K, V>,
        is_root: bool,
        depth: usize,
        leaf_depth: &mut Option<usize>,
        shape: &mut TreeShape,
    ) -> Result<()> {
        shape.nodes += 1;
        let len = node.len();
        if len > self.branching_factor {
            return Err(Error::Internal(format!(
                "node at depth {depth} has {len} entries, above {}",
                self.branching_factor
            )));
        }
        if !is_root && len < self.min_entries() {
            return Err(Error::Internal(format!(
                "node at depth {depth} has {len} entries, below {}",
                self.min_entries()
            )));
        }
        if is_root && !node.is_leaf() && len < 2 {
            return Err(Error::Internal("internal root with a single child".to_string()));
        }

        match node {
            Node::Leaf(entries) => {
                if entries.windows(2).any(|w| w[0].0 >= w[1].0) {
                    return Err(Error::Internal(format!("unsorted leaf at depth {depth}")));
                }
                shape.entries += len;
                match leaf_depth {
                    Some(expected) if *expected != depth => {
                        return Err(Error::Internal(format!(
                            "leaf at depth {depth}, expected {expected}"
                        )));
                    }
                    Some(_) => {}
                    None => *leaf_depth = Some(depth),
                }
            }
            Node::Internal(children) => {
                if children.windows(2).any(|w| w[0].0 >= w[1].0) {
                    return Err(Error::Internal(format!(
                        "unsorted internal node at depth {depth}"
                    )));
                }
                for (key, child) in children {
                    let child = self.manager.unwrap_node(child)?;
                    if child.first_key()? != key {
                        return Err(Error::Internal(format!(
                            "separator at depth {depth} differs from its subtree's first key"
                        )));
                    }
                    self.check_node(&child, false, depth + 1, leaf_depth, shape)?;
                }
            }
        }
        Ok(())
    }
}

impl<K, V> std::fmt::Debug for BTree<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("branching_factor", &self.branching_factor)
            .finish()
    }
}

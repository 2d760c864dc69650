//! Disk-backed node manager.
//!
//! Nodes and values are written as checksummed records into the DATA blocks of
//! a block-organized file. A mutation never overwrites anything: the rewritten
//! root-to-leaf path is appended, then a new HEADER block pointing at the new
//! root commits the generation. A crash before the header block is complete
//! leaves the previous generation in place.

use super::block_file::{BlockFileInput, BlockFileOutput, RecordPointer};
use super::manager::NodeManager;
use super::node::{Node, NodeRef, ValueRef, INTERNAL_NODE, LEAF_NODE};
use crate::error::{Error, Result};
use crate::io::{varint, ByteReader, ByteWriter, ReadBuffer, WriteBuffer};
use bytes::Bytes;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Default number of decoded nodes kept in memory per tree.
pub const DEFAULT_NODE_CACHE_SIZE: usize = 256;

/// Serialization of the keys and values stored in a tree.
///
/// This is the only schema-specific part of a persistent B+Tree.
pub trait KeyValueCodec<K, V>: Send + Sync {
    /// Number of bytes [`write_key`](Self::write_key) produces for `key`.
    fn compute_key_size(&self, key: &K) -> usize;

    /// Serializes `key`.
    fn write_key(&self, writer: &mut dyn ByteWriter, key: &K) -> Result<()>;

    /// Deserializes a key.
    fn read_key(&self, reader: &mut dyn ByteReader) -> Result<K>;

    /// Number of bytes [`write_value`](Self::write_value) produces for `value`.
    fn compute_value_size(&self, value: &V) -> usize;

    /// Serializes `value`.
    fn write_value(&self, writer: &mut dyn ByteWriter, value: &V) -> Result<()>;

    /// Deserializes a value.
    fn read_value(&self, reader: &mut dyn ByteReader) -> Result<V>;
}

/// Encodes nodes whose references are all on disk.
pub struct NodeWriter<'a, K, V> {
    codec: &'a dyn KeyValueCodec<K, V>,
}

impl<'a, K: Ord + Clone, V> NodeWriter<'a, K, V> {
    /// Creates a writer using `codec` for keys.
    pub fn new(codec: &'a dyn KeyValueCodec<K, V>) -> Self {
        Self { codec }
    }

    /// Number of bytes [`write_node`](Self::write_node) produces.
    pub fn compute_node_size(&self, node: &Node<K, V>) -> Result<usize> {
        let mut size = 1 + varint::compute_u64_size(node.len() as u64);
        match node {
            Node::Leaf(entries) => {
                for (key, value) in entries {
                    let (position, length) = value_pointer(value)?;
                    size += self.codec.compute_key_size(key) + pointer_size(position, length);
                }
            }
            Node::Internal(children) => {
                for (key, child) in children {
                    let (position, length) = node_pointer(child)?;
                    size += self.codec.compute_key_size(key) + pointer_size(position, length);
                }
            }
        }
        Ok(size)
    }

    /// Serializes `node`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if a child or value is still resident.
    pub fn write_node(&self, writer: &mut dyn ByteWriter, node: &Node<K, V>) -> Result<()> {
        writer.write_u8(node.type_code())?;
        writer.write_var_usize(node.len())?;
        match node {
            Node::Leaf(entries) => {
                for (key, value) in entries {
                    let (position, length) = value_pointer(value)?;
                    self.codec.write_key(writer, key)?;
                    writer.write_var_u64(position)?;
                    writer.write_var_u64(length)?;
                }
            }
            Node::Internal(children) => {
                for (key, child) in children {
                    let (position, length) = node_pointer(child)?;
                    self.codec.write_key(writer, key)?;
                    writer.write_var_u64(position)?;
                    writer.write_var_u64(length)?;
                }
            }
        }
        Ok(())
    }
}

/// Decodes nodes written by [`NodeWriter`].
pub struct NodeReader<'a, K, V> {
    codec: &'a dyn KeyValueCodec<K, V>,
}

impl<'a, K: Ord + Clone, V> NodeReader<'a, K, V> {
    /// Creates a reader using `codec` for keys.
    pub fn new(codec: &'a dyn KeyValueCodec<K, V>) -> Self {
        Self { codec }
    }

    /// Deserializes a node. Its children and values stay lazy.
    pub fn read_node(&self, reader: &mut dyn ByteReader) -> Result<Node<K, V>> {
        let type_code = reader.read_u8()?;
        let count = reader.read_var_usize()?;
        match type_code {
            LEAF_NODE => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = self.codec.read_key(reader)?;
                    let position = reader.read_var_u64()?;
                    let length = reader.read_var_u64()?;
                    entries.push((key, ValueRef::OnDisk { position, length }));
                }
                Ok(Node::Leaf(entries))
            }
            INTERNAL_NODE => {
                let mut children = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = self.codec.read_key(reader)?;
                    let position = reader.read_var_u64()?;
                    let length = reader.read_var_u64()?;
                    children.push((key, NodeRef::OnDisk { position, length }));
                }
                Ok(Node::Internal(children))
            }
            other => Err(Error::corrupted(format!("unknown node type {other}"))),
        }
    }
}

fn pointer_size(position: u64, length: u64) -> usize {
    varint::compute_u64_size(position) + varint::compute_u64_size(length)
}

fn node_pointer<K, V>(node: &NodeRef<K, V>) -> Result<(u64, u64)> {
    match node {
        NodeRef::OnDisk { position, length } => Ok((*position, *length)),
        NodeRef::Resident(_) => Err(Error::Internal(
            "cannot serialize a reference to an unwritten node".to_string(),
        )),
    }
}

fn value_pointer<V>(value: &ValueRef<V>) -> Result<(u64, u64)> {
    match value {
        ValueRef::OnDisk { position, length } => Ok((*position, *length)),
        ValueRef::Resident(_) => Err(Error::Internal(
            "cannot serialize a reference to an unwritten value".to_string(),
        )),
    }
}

/// Node manager persisting the tree into a block-organized file.
pub struct OnDiskNodeManager<K, V> {
    codec: Arc<dyn KeyValueCodec<K, V>>,
    output: Mutex<BlockFileOutput>,
    input: Mutex<BlockFileInput>,
    root: RwLock<Arc<Node<K, V>>>,
    cache: Mutex<LruCache<u64, Arc<Node<K, V>>>>,
}

impl<K, V> OnDiskNodeManager<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Send + Sync,
{
    /// Opens the tree file at `path`, creating it if needed.
    ///
    /// The root is loaded from the most recent valid header; a file without
    /// header holds an empty tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or if the root node
    /// referenced by the header fails validation.
    pub fn open(
        path: impl AsRef<Path>,
        block_size: usize,
        codec: Arc<dyn KeyValueCodec<K, V>>,
    ) -> Result<Self> {
        Self::open_with_cache(path, block_size, codec, DEFAULT_NODE_CACHE_SIZE)
    }

    /// Like [`open`](Self::open) with an explicit node cache capacity.
    pub fn open_with_cache(
        path: impl AsRef<Path>,
        block_size: usize,
        codec: Arc<dyn KeyValueCodec<K, V>>,
        cache_size: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        let output = BlockFileOutput::open(path, block_size)?;
        let mut input = BlockFileInput::open(path, block_size)?;

        let root = match input.read_header()? {
            Some(header) => {
                let mut reader = ReadBuffer::new(header);
                let pointer = RecordPointer {
                    position: reader.read_var_u64()?,
                    length: reader.read_var_u64()?,
                };
                let payload = input.read_record(pointer)?;
                let root = NodeReader::new(codec.as_ref()).read_node(&mut ReadBuffer::new(payload))?;
                debug!(
                    "Loaded root node at {} from {}",
                    pointer.position,
                    path.display()
                );
                root
            }
            None => Node::empty(),
        };

        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            codec,
            output: Mutex::new(output),
            input: Mutex::new(input),
            root: RwLock::new(Arc::new(root)),
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    fn read_payload(&self, position: u64, length: u64) -> Result<Bytes> {
        self.input
            .lock()
            .read_record(RecordPointer { position, length })
    }

    fn write_value(&self, output: &mut BlockFileOutput, value: &V) -> Result<RecordPointer> {
        let mut buffer = WriteBuffer::with_capacity(self.codec.compute_value_size(value));
        self.codec.write_value(&mut buffer, value)?;
        output.write_record(buffer.as_slice())
    }

    fn write_node(&self, output: &mut BlockFileOutput, node: &Node<K, V>) -> Result<RecordPointer> {
        let writer = NodeWriter::new(self.codec.as_ref());
        let mut buffer = WriteBuffer::with_capacity(writer.compute_node_size(node)?);
        writer.write_node(&mut buffer, node)?;
        output.write_record(buffer.as_slice())
    }

    /// Writes every resident value and child of `node`, depth first, and
    /// returns the node with all its references on disk.
    fn persist_children(
        &self,
        output: &mut BlockFileOutput,
        node: Node<K, V>,
        written: &mut Vec<(u64, Arc<Node<K, V>>)>,
    ) -> Result<Node<K, V>> {
        match node {
            Node::Leaf(entries) => {
                let mut persisted = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    let value = match value {
                        ValueRef::Resident(value) => {
                            ValueRef::on_disk(self.write_value(output, &value)?)
                        }
                        on_disk => on_disk,
                    };
                    persisted.push((key, value));
                }
                Ok(Node::Leaf(persisted))
            }
            Node::Internal(children) => {
                let mut persisted = Vec::with_capacity(children.len());
                for (key, child) in children {
                    let child = match child {
                        NodeRef::Resident(child) => {
                            let child = Arc::try_unwrap(child).unwrap_or_else(|c| (*c).clone());
                            let child = self.persist_children(output, child, written)?;
                            let pointer = self.write_node(output, &child)?;
                            written.push((pointer.position, Arc::new(child)));
                            NodeRef::on_disk(pointer)
                        }
                        on_disk => on_disk,
                    };
                    persisted.push((key, child));
                }
                Ok(Node::Internal(persisted))
            }
        }
    }
}

impl<K, V> NodeManager<K, V> for OnDiskNodeManager<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Send + Sync,
{
    fn get_root(&self) -> Result<Arc<Node<K, V>>> {
        Ok(Arc::clone(&self.root.read()))
    }

    fn set_root(&self, root: Node<K, V>) -> Result<()> {
        let mut output = self.output.lock();
        let mut written = Vec::new();
        let root = self.persist_children(&mut output, root, &mut written)?;
        let pointer = self.write_node(&mut output, &root)?;

        let mut header = WriteBuffer::new();
        header.write_var_u64(pointer.position)?;
        header.write_var_u64(pointer.length)?;
        output.write_header(header.as_slice())?;

        let root = Arc::new(root);
        {
            let mut cache = self.cache.lock();
            for (position, node) in written {
                cache.put(position, node);
            }
            cache.put(pointer.position, Arc::clone(&root));
        }
        *self.root.write() = root;
        Ok(())
    }

    fn unwrap_node(&self, node: &NodeRef<K, V>) -> Result<Arc<Node<K, V>>> {
        let (position, length) = match node {
            NodeRef::Resident(node) => return Ok(Arc::clone(node)),
            NodeRef::OnDisk { position, length } => (*position, *length),
        };
        if let Some(node) = self.cache.lock().get(&position) {
            return Ok(Arc::clone(node));
        }

        let payload = self.read_payload(position, length)?;
        let node = Arc::new(
            NodeReader::new(self.codec.as_ref()).read_node(&mut ReadBuffer::new(payload))?,
        );
        self.cache.lock().put(position, Arc::clone(&node));
        Ok(node)
    }

    fn unwrap_value(&self, value: &ValueRef<V>) -> Result<Arc<V>> {
        match value {
            ValueRef::Resident(value) => Ok(Arc::clone(value)),
            ValueRef::OnDisk { position, length } => {
                let payload = self.read_payload(*position, *length)?;
                Ok(Arc::new(self.codec.read_value(&mut ReadBuffer::new(payload))?))
            }
        }
    }
}

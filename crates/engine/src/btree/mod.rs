//! Persistent B+Tree.
//!
//! The tree algorithm ([`BTree`]) is written once against the
//! [`NodeManager`] capability. [`InMemoryNodeManager`] keeps every node in
//! memory; [`OnDiskNodeManager`] persists nodes into a block-organized file
//! ([`block_file`]) with copy-on-write path updates and a trailing header
//! block as the commit point of each generation.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = OnDiskNodeManager::open("databases.b3", 4096, codec)?;
//! let tree = BTree::new(Arc::new(manager), 64)?;
//! tree.insert_if_absent("metrics".to_string(), definition)?;
//! ```

pub mod block_file;
pub mod disk;
pub mod manager;
pub mod node;
pub mod tree;

pub use block_file::{BlockFileInput, BlockFileOutput, BlockType, RecordPointer};
pub use disk::{KeyValueCodec, NodeReader, NodeWriter, OnDiskNodeManager};
pub use manager::{InMemoryNodeManager, NodeManager};
pub use node::{Node, NodeRef, ValueRef};
pub use tree::{BTree, TreeShape, DEFAULT_BRANCHING_FACTOR, MIN_BRANCHING_FACTOR};

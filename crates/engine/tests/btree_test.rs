//! B+Tree behaviour against an ordered map model, in memory and on disk.

use horizondb_engine::btree::{BTree, InMemoryNodeManager, KeyValueCodec, NodeManager, OnDiskNodeManager};
use horizondb_engine::io::{compute_string_size, varint, ByteReader, ByteWriter};
use horizondb_engine::Result;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

struct Codec;

impl KeyValueCodec<u64, String> for Codec {
    fn compute_key_size(&self, key: &u64) -> usize {
        varint::compute_u64_size(*key)
    }

    fn write_key(&self, writer: &mut dyn ByteWriter, key: &u64) -> Result<()> {
        writer.write_var_u64(*key)
    }

    fn read_key(&self, reader: &mut dyn ByteReader) -> Result<u64> {
        reader.read_var_u64()
    }

    fn compute_value_size(&self, value: &String) -> usize {
        compute_string_size(value)
    }

    fn write_value(&self, writer: &mut dyn ByteWriter, value: &String) -> Result<()> {
        writer.write_string(value)
    }

    fn read_value(&self, reader: &mut dyn ByteReader) -> Result<String> {
        reader.read_string()
    }
}

#[derive(Debug, Clone)]
enum Op {
    Insert(u64, String),
    Delete(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u64..200, "[a-z]{0,12}").prop_map(|(k, v)| Op::Insert(k, v)),
        1 => (0u64..200).prop_map(Op::Delete),
    ]
}

fn apply(tree: &BTree<u64, String>, model: &mut BTreeMap<u64, String>, op: &Op) {
    match op {
        Op::Insert(key, value) => {
            tree.insert(*key, value.clone()).unwrap();
            model.insert(*key, value.clone());
        }
        Op::Delete(key) => {
            let deleted = tree.delete_if_present(key).unwrap();
            assert_eq!(deleted, model.remove(key).is_some());
        }
    }
}

fn assert_matches_model(tree: &BTree<u64, String>, model: &BTreeMap<u64, String>) {
    let shape = tree.check_invariants().unwrap();
    assert_eq!(shape.entries, model.len());
    let entries = tree.entries().unwrap();
    let expected: Vec<(u64, String)> = model.iter().map(|(k, v)| (*k, v.clone())).collect();
    assert_eq!(entries, expected);
}

fn open_on_disk(path: &std::path::Path, branching_factor: usize) -> BTree<u64, String> {
    let manager: Arc<dyn NodeManager<u64, String>> =
        Arc::new(OnDiskNodeManager::open(path, 256, Arc::new(Codec)).unwrap());
    BTree::new(manager, branching_factor).unwrap()
}

proptest! {
    #[test]
    fn in_memory_tree_matches_model(
        branching_factor in 3usize..8,
        ops in prop::collection::vec(op(), 1..300),
    ) {
        let tree: BTree<u64, String> =
            BTree::new(Arc::new(InMemoryNodeManager::new()), branching_factor).unwrap();
        let mut model = BTreeMap::new();
        for op in &ops {
            apply(&tree, &mut model, op);
        }
        assert_matches_model(&tree, &model);

        let (low, high) = (50, 120);
        let range: Vec<u64> = tree
            .range(Some(&low), Some(&high))
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        let expected: Vec<u64> = model.range(low..high).map(|(k, _)| *k).collect();
        prop_assert_eq!(range, expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn on_disk_tree_survives_reopen(
        branching_factor in 3usize..6,
        ops in prop::collection::vec(op(), 1..120),
    ) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tree.b3");
        let mut model = BTreeMap::new();
        {
            let tree = open_on_disk(&path, branching_factor);
            for op in &ops {
                apply(&tree, &mut model, op);
            }
            assert_matches_model(&tree, &model);
        }
        let tree = open_on_disk(&path, branching_factor);
        assert_matches_model(&tree, &model);
    }
}

#[test]
fn test_reopen_after_torn_write_keeps_last_header() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("tree.b3");
    {
        let tree = open_on_disk(&path, 4);
        for key in 0..50u64 {
            tree.insert(key, format!("v{key}")).unwrap();
        }
    }
    let mut raw = std::fs::read(&path).unwrap();
    raw.extend_from_slice(&[0, 5, 1, 2, 3]);
    std::fs::write(&path, &raw).unwrap();

    let tree = open_on_disk(&path, 4);
    assert_eq!(tree.entries().unwrap().len(), 50);
    tree.insert(50, "v50".to_string()).unwrap();
    assert_eq!(tree.get(&50).unwrap(), Some("v50".to_string()));
    tree.check_invariants().unwrap();
}

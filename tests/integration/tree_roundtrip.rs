//! End-to-end persistence tests: build a tree on disk, reopen it, and check
//! that point and range queries agree with a reference map.

use std::collections::BTreeMap;
use std::path::Path;

use baobab::{BTree, FileStorage, Result, DEFAULT_BLOCK_SIZE};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

fn assert_matches_reference(
    tree: &mut BTree<String, u32, FileStorage>,
    reference: &BTreeMap<String, u32>,
) -> Result<()> {
    for (key, value) in reference {
        assert_eq!(tree.get(key)?.as_ref(), Some(value), "missing {key}");
    }
    let scanned: Vec<(String, u32)> = tree.range(None, None)?.collect::<Result<_>>()?;
    let expected: Vec<(String, u32)> = reference.iter().map(|(k, v)| (k.clone(), *v)).collect();
    assert_eq!(scanned, expected);
    Ok(())
}

fn assert_subrange_matches(
    tree: &mut BTree<String, u32, FileStorage>,
    reference: &BTreeMap<String, u32>,
    from: &str,
    to: &str,
) -> Result<()> {
    let scanned: Vec<(String, u32)> = tree
        .range(Some(from.to_string()), Some(to.to_string()))?
        .collect::<Result<_>>()?;
    let expected: Vec<(String, u32)> = reference
        .range(from.to_string()..=to.to_string())
        .map(|(k, v)| (k.clone(), *v))
        .collect();
    assert_eq!(scanned, expected, "range {from}..{to}");
    Ok(())
}

fn build_tree(path: &Path, count: u32, seed: u64) -> Result<BTreeMap<String, u32>> {
    let mut tree: BTree<String, u32, FileStorage> =
        BTree::create(FileStorage::create(path, DEFAULT_BLOCK_SIZE)?)?;
    let mut reference = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for _ in 0..count {
        let key = format!("{:08x}", rng.gen::<u32>());
        let value = rng.gen();
        tree.put(&key, &value)?;
        reference.insert(key, value);
    }
    assert_matches_reference(&mut tree, &reference)?;
    tree.flush()?;
    Ok(reference)
}

#[test]
fn trees_of_every_size_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    for (i, count) in [0u32, 1, 2, 3, 10, 100, 1_000].into_iter().enumerate() {
        let path = dir.path().join(format!("tree-{count}.db"));
        let reference = build_tree(&path, count, i as u64)?;
        let mut tree: BTree<String, u32, FileStorage> = BTree::open(FileStorage::open(&path)?)?;
        assert_matches_reference(&mut tree, &reference)?;
        assert_eq!(tree.get(&"not there".to_string())?, None);
    }
    Ok(())
}

#[test]
fn large_tree_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("large.db");
    let reference = build_tree(&path, 100_000, 99)?;
    let mut tree: BTree<String, u32, FileStorage> = BTree::open(FileStorage::open(&path)?)?;
    assert_matches_reference(&mut tree, &reference)?;
    assert_subrange_matches(&mut tree, &reference, "10000000", "1fffffff")?;
    assert_subrange_matches(&mut tree, &reference, "00000000", "00ffffff")?;
    assert_subrange_matches(&mut tree, &reference, "ffff0000", "ffffffff")?;
    Ok(())
}

#[test]
fn updates_and_removals_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("churn.db");
    let mut reference = build_tree(&path, 5_000, 7)?;
    {
        let mut tree: BTree<String, u32, FileStorage> = BTree::open(FileStorage::open(&path)?)?;
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let keys: Vec<String> = reference.keys().cloned().collect();
        for key in &keys {
            if rng.gen_bool(0.5) {
                assert_eq!(tree.remove(key)?, reference.remove(key));
            } else {
                let value = rng.gen();
                tree.put(key, &value)?;
                reference.insert(key.clone(), value);
            }
        }
        tree.flush()?;
    }
    let mut tree: BTree<String, u32, FileStorage> = BTree::open(FileStorage::open(&path)?)?;
    assert_matches_reference(&mut tree, &reference)?;
    Ok(())
}

#[test]
fn emptied_tree_can_be_refilled_after_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("refill.db");
    let reference = build_tree(&path, 2_000, 13)?;
    {
        let mut tree: BTree<String, u32, FileStorage> = BTree::open(FileStorage::open(&path)?)?;
        for key in reference.keys() {
            assert!(tree.remove(key)?.is_some());
        }
        assert_eq!(tree.range(None, None)?.count(), 0);
        tree.flush()?;
    }
    let mut tree: BTree<String, u32, FileStorage> = BTree::open(FileStorage::open(&path)?)?;
    let mut refilled = BTreeMap::new();
    for i in 0..500u32 {
        let key = format!("fresh-{i:04}");
        tree.put(&key, &i)?;
        refilled.insert(key, i);
    }
    assert_matches_reference(&mut tree, &refilled)?;
    Ok(())
}

#[test]
fn integer_keyed_tree_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("by-id.db");
    let mut reference = BTreeMap::new();
    {
        let mut tree: BTree<u32, String, FileStorage> =
            BTree::create(FileStorage::create(&path, DEFAULT_BLOCK_SIZE)?)?;
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        for _ in 0..100_000 {
            let key: u32 = rng.gen();
            let value = format!("row #{key}");
            tree.put(&key, &value)?;
            reference.insert(key, value);
        }
        tree.flush()?;
    }
    let mut tree: BTree<u32, String, FileStorage> = BTree::open(FileStorage::open(&path)?)?;
    for (key, value) in &reference {
        assert_eq!(tree.get(key)?.as_ref(), Some(value));
    }
    let mid = u32::MAX / 2;
    let scanned: Vec<(u32, String)> = tree
        .range(Some(mid), None)?
        .collect::<Result<_>>()?;
    let expected: Vec<(u32, String)> = reference
        .range(mid..)
        .map(|(k, v)| (*k, v.clone()))
        .collect();
    assert_eq!(scanned, expected);
    Ok(())
}

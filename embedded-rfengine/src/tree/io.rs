//! Tree and forest release/load.
//!
//! Two layouts share the node encoding: per-tree files
//! (`[magic "TREE"][node_count u32][u32 x node_count]`) and the unified
//! forest file (`[magic "FORS"][tree_count u8]` then
//! `[index u8][node_count u32][u32 x node_count]` per tree). Writes are
//! all-or-nothing: a failed write removes the file before the error is
//! returned, so observers never see a partial artifact.

use std::io::Write;

use aligned_vec::AVec;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::IntoBytes;

use crate::store::{
    read_all, HeapMonitor, ObjectStore, OpenMode, LOAD_HEAP_HEADROOM, RELEASE_STORAGE_SLACK,
};
use crate::tree::{PackedNode, Tree};
use crate::{Error, Result, MAX_NODES_PER_TREE, MAX_TREES};

pub const TREE_MAGIC: u32 = 0x5452_4545; // "TREE"
pub const FOREST_MAGIC: u32 = 0x464F_5253; // "FORS"

fn check_storage<S: ObjectStore>(store: &S, node_count: usize) -> Result<()> {
    let needed = node_count as u64 * 4 + RELEASE_STORAGE_SLACK;
    if store.free_space() < needed {
        return Err(Error::InsufficientStorage);
    }
    Ok(())
}

/// Heap pre-flight for a tree or forest load. Run this before calling the
/// readers; they assume the check has passed.
pub fn preflight_load<H: HeapMonitor>(heap: &H, estimated_ram: u32) -> Result<()> {
    if heap.free_heap() < estimated_ram as usize + LOAD_HEAP_HEADROOM {
        return Err(Error::InsufficientMemory);
    }
    Ok(())
}

fn check_node_count(count: u32) -> Result<()> {
    if count == 0 {
        return Err(Error::HeaderMismatch);
    }
    if count > MAX_NODES_PER_TREE as u32 {
        return Err(Error::CapacityExceeded);
    }
    Ok(())
}

fn write_or_remove<S: ObjectStore>(store: &mut S, path: &str, bytes: &[u8]) -> Result<()> {
    let result = store
        .open(path, OpenMode::Write)
        .and_then(|mut f| Ok(f.write_all(bytes)?));
    if result.is_err() {
        if let Err(e) = store.remove(path) {
            log::warn!("tree store {path}: cleanup after failed write: {e}");
        }
    }
    result
}

/// Decode `count` packed nodes, validating that every branch points inside
/// the tree.
fn decode_nodes(payload: &[u8], count: usize) -> Result<Vec<PackedNode>> {
    let mut nodes = Vec::with_capacity(count);
    for chunk in payload.chunks_exact(4) {
        let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        nodes.push(PackedNode::from_raw(raw));
    }
    for node in &nodes {
        if !node.is_leaf() && node.left_child() as usize + 1 >= count {
            return Err(Error::HeaderMismatch);
        }
    }
    Ok(nodes)
}

/// Release one tree to its own file.
pub fn write_tree<S: ObjectStore>(store: &mut S, path: &str, tree: &Tree) -> Result<()> {
    if !tree.is_loaded() {
        return Err(Error::NotLoaded);
    }
    check_node_count(tree.node_count() as u32)?;
    check_storage(store, tree.node_count())?;

    let mut bytes = AVec::<u8>::with_capacity(4, 8 + tree.node_count() * 4);
    bytes.extend_from_slice(&U32::new(TREE_MAGIC).to_bytes());
    bytes.extend_from_slice(&U32::new(tree.node_count() as u32).to_bytes());
    for node in tree.nodes() {
        bytes.extend_from_slice(node.as_bytes());
    }
    write_or_remove(store, path, &bytes)
}

/// Load one tree from its own file.
pub fn read_tree<S: ObjectStore>(store: &mut S, path: &str, index: u8) -> Result<Tree> {
    let bytes = read_all(store, path)?;
    if bytes.len() < 8 {
        return Err(Error::Truncated);
    }
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != TREE_MAGIC {
        return Err(Error::HeaderMismatch);
    }
    let count = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    check_node_count(count)?;
    let payload = &bytes[8..];
    if payload.len() < count as usize * 4 {
        return Err(Error::Truncated);
    }
    if payload.len() > count as usize * 4 {
        return Err(Error::HeaderMismatch);
    }
    let nodes = decode_nodes(payload, count as usize)?;
    Ok(Tree::from_nodes(index, nodes))
}

/// Release all trees into one unified forest file.
pub fn write_forest<S: ObjectStore>(store: &mut S, path: &str, trees: &[Tree]) -> Result<()> {
    if trees.len() > MAX_TREES {
        return Err(Error::CapacityExceeded);
    }
    let total_nodes: usize = trees.iter().map(Tree::node_count).sum();
    for tree in trees {
        if !tree.is_loaded() {
            return Err(Error::NotLoaded);
        }
        check_node_count(tree.node_count() as u32)?;
    }
    check_storage(store, total_nodes)?;

    let mut bytes = AVec::<u8>::with_capacity(4, 5 + trees.len() * 5 + total_nodes * 4);
    bytes.extend_from_slice(&U32::new(FOREST_MAGIC).to_bytes());
    bytes.push(trees.len() as u8);
    for tree in trees {
        bytes.push(tree.index);
        bytes.extend_from_slice(&U32::new(tree.node_count() as u32).to_bytes());
        for node in tree.nodes() {
            bytes.extend_from_slice(node.as_bytes());
        }
    }
    write_or_remove(store, path, &bytes)
}

/// Load a unified forest file. Trees whose index is not below `claimed` are
/// skipped (their payload is stepped over) and loading continues.
pub fn read_forest<S: ObjectStore>(store: &mut S, path: &str, claimed: u8) -> Result<Vec<Tree>> {
    let bytes = read_all(store, path)?;
    if bytes.len() < 5 {
        return Err(Error::Truncated);
    }
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != FOREST_MAGIC {
        return Err(Error::HeaderMismatch);
    }
    let tree_count = bytes[4];
    if tree_count as usize > MAX_TREES {
        return Err(Error::CapacityExceeded);
    }

    let mut trees = Vec::new();
    let mut pos = 5usize;
    for _ in 0..tree_count {
        if pos + 5 > bytes.len() {
            return Err(Error::Truncated);
        }
        let index = bytes[pos];
        let count = u32::from_le_bytes([
            bytes[pos + 1],
            bytes[pos + 2],
            bytes[pos + 3],
            bytes[pos + 4],
        ]);
        pos += 5;
        check_node_count(count)?;
        let payload_len = count as usize * 4;
        if pos + payload_len > bytes.len() {
            return Err(Error::Truncated);
        }
        if index >= claimed {
            log::warn!("forest {path}: skipping unclaimed tree {index}");
            pos += payload_len;
            continue;
        }
        let nodes = decode_nodes(&bytes[pos..pos + payload_len], count as usize)?;
        trees.push(Tree::from_nodes(index, nodes));
        pos += payload_len;
    }
    if pos != bytes.len() {
        return Err(Error::HeaderMismatch);
    }
    Ok(trees)
}

//! B-tree engine shared by the catalog and extents overflow files.
//!
//! Node 0 is the header node: the header record, a 128-byte user record and
//! the node allocation map. Every other node is an index or leaf node whose
//! records are addressed through the offset table at the end of the node.
//!
//! A record is its key length byte, the key, a pad byte when needed to
//! bring the data to an even offset, then the data. Index records carry a
//! child node number as data and their keys are zero-padded to the tree's
//! maximum key length. The key of an index record is always the first key
//! of its child.

use crate::error::{FsError, Result};
use deku::prelude::*;
use hfs_types::{HeaderRecord, NODE_SIZE, NodeDescriptor, NodeKind, USER_RECORD_SIZE};
use itertools::Itertools;
use log::{debug, trace};
use std::cmp::Ordering;

/// Orders two keys, given without their length bytes.
pub type KeyCompare = fn(&[u8], &[u8]) -> Ordering;

/// Node-granular storage behind a B-tree.
pub trait NodeStore {
    fn read_node(&mut self, node: u32, buf: &mut [u8]) -> Result<()>;
    fn write_node(&mut self, node: u32, buf: &[u8]) -> Result<()>;

    /// Make room for at least `nodes` nodes, returning the new capacity.
    fn grow(&mut self, nodes: u32) -> Result<u32>;
}

impl<S: NodeStore + ?Sized> NodeStore for &mut S {
    fn read_node(&mut self, node: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read_node(node, buf)
    }

    fn write_node(&mut self, node: u32, buf: &[u8]) -> Result<()> {
        (**self).write_node(node, buf)
    }

    fn grow(&mut self, nodes: u32) -> Result<u32> {
        (**self).grow(nodes)
    }
}

/// Bytes of the header node left for the allocation map.
const MAP_RECORD_SIZE: usize =
    NODE_SIZE - NodeDescriptor::SIZE - HeaderRecord::SIZE - USER_RECORD_SIZE - 2 * 4;

/// Nodes addressable by the header node's map. Map nodes are not used.
pub const MAX_NODES: u32 = (MAP_RECORD_SIZE * 8) as u32;

/// Largest record, offset included, that still lets a node split in two.
const MAX_RECORD_COST: usize = (NODE_SIZE - NodeDescriptor::SIZE - 2) / 2;

fn key_of(record: &[u8]) -> &[u8] {
    let len = record[0] as usize;
    &record[1..1 + len]
}

fn data_of(record: &[u8]) -> &[u8] {
    let start = (2 + record[0] as usize) & !1;
    &record[start.min(record.len())..]
}

fn build_record(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(2 + key.len() + data.len());
    record.push(key.len() as u8);
    record.extend_from_slice(key);
    if record.len() % 2 == 1 {
        record.push(0);
    }
    record.extend_from_slice(data);
    record
}

fn child_of(record: &[u8]) -> Result<u32> {
    let data = data_of(record);
    let bytes: [u8; 4] = data
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(FsError::Corrupt)?;
    Ok(u32::from_be_bytes(bytes))
}

/// Bytes a record occupies in a node, including its offset table entry.
fn cost(record: &[u8]) -> usize {
    record.len() + 2
}

/// Split point of `records` that keeps the larger half smallest.
fn balanced_split(records: &[Vec<u8>]) -> usize {
    let total: usize = records.iter().map(|r| cost(r)).sum();
    let mut left = 0;
    let mut best = (usize::MAX, records.len() / 2);
    for (i, record) in records.iter().enumerate().take(records.len().saturating_sub(1)) {
        left += cost(record);
        let larger = left.max(total - left);
        if larger < best.0 {
            best = (larger, i + 1);
        }
    }
    best.1
}

#[derive(Debug, Clone)]
struct Node {
    num: u32,
    desc: NodeDescriptor,
    records: Vec<Vec<u8>>,
}

impl Node {
    fn new(num: u32, kind: NodeKind, height: u8) -> Self {
        Self {
            num,
            desc: NodeDescriptor::new(kind, height),
            records: Vec::new(),
        }
    }

    fn parse(num: u32, buf: &[u8]) -> Result<Self> {
        let (_rest, desc) = NodeDescriptor::from_bytes((buf, 0))?;
        let count = desc.num_records as usize;
        let table = 2 * (count + 1);
        if NodeDescriptor::SIZE + table > buf.len() {
            return Err(FsError::Corrupt);
        }

        let offsets: Vec<usize> = (0..=count)
            .map(|i| {
                let at = buf.len() - 2 * (i + 1);
                u16::from_be_bytes([buf[at], buf[at + 1]]) as usize
            })
            .collect();

        let records = offsets
            .iter()
            .tuple_windows()
            .map(|(&start, &end)| {
                if start < NodeDescriptor::SIZE || end <= start || end > buf.len() - table {
                    return Err(FsError::Corrupt);
                }
                let record = &buf[start..end];
                if desc.kind != NodeKind::Header && 1 + record[0] as usize > record.len() {
                    return Err(FsError::Corrupt);
                }
                Ok(record.to_vec())
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { num, desc, records })
    }

    fn used(&self) -> usize {
        NodeDescriptor::SIZE + self.records.iter().map(|r| cost(r)).sum::<usize>() + 2
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        if self.used() > NODE_SIZE {
            return Err(FsError::Corrupt);
        }
        let mut buf = vec![0u8; NODE_SIZE];
        let mut desc = self.desc.clone();
        desc.num_records = self.records.len() as u16;
        buf[..NodeDescriptor::SIZE].copy_from_slice(&desc.to_bytes()?);

        let mut offset = NodeDescriptor::SIZE;
        for (i, record) in self.records.iter().enumerate() {
            let at = NODE_SIZE - 2 * (i + 1);
            buf[at..at + 2].copy_from_slice(&(offset as u16).to_be_bytes());
            buf[offset..offset + record.len()].copy_from_slice(record);
            offset += record.len();
        }
        let at = NODE_SIZE - 2 * (self.records.len() + 1);
        buf[at..at + 2].copy_from_slice(&(offset as u16).to_be_bytes());
        Ok(buf)
    }

    fn is_leaf(&self) -> bool {
        self.desc.kind == NodeKind::Leaf
    }

    fn first_key(&self) -> Result<&[u8]> {
        self.records
            .first()
            .map(|r| key_of(r))
            .ok_or(FsError::Corrupt)
    }
}

/// One level of a root-to-leaf descent. For index nodes `index` is the
/// record that was followed.
struct Step {
    node: Node,
    index: usize,
}

/// In-memory B-tree control block.
#[derive(Debug, Clone)]
pub struct BTree {
    header: HeaderRecord,
    map: Vec<u8>,
    compare: KeyCompare,
}

impl BTree {
    /// Write an empty tree of `total_nodes` nodes to `store`.
    pub fn create<S: NodeStore>(
        store: &mut S,
        max_key_len: u16,
        total_nodes: u32,
        compare: KeyCompare,
    ) -> Result<Self> {
        let total_nodes = total_nodes.clamp(1, MAX_NODES);
        let mut tree = Self {
            header: HeaderRecord::empty(max_key_len, total_nodes),
            map: vec![0u8; MAP_RECORD_SIZE],
            compare,
        };
        tree.map[0] = 0x80;
        tree.write_header(store)?;
        Ok(tree)
    }

    /// Load the control block from the header node.
    pub fn open<S: NodeStore>(store: &mut S, compare: KeyCompare) -> Result<Self> {
        let node = Self::read_raw(store, 0)?;
        if node.desc.kind != NodeKind::Header || node.records.len() < 3 {
            return Err(FsError::Corrupt);
        }
        let (_rest, header) = HeaderRecord::from_bytes((&node.records[0], 0))?;
        if header.node_size as usize != NODE_SIZE
            || header.max_key_len == 0
            || header.total_nodes > MAX_NODES
        {
            debug!("unsupported B-tree header {header:?}");
            return Err(FsError::Corrupt);
        }

        let mut map = node.records[2].clone();
        map.resize(MAP_RECORD_SIZE, 0);
        Ok(Self {
            header,
            map,
            compare,
        })
    }

    pub fn header(&self) -> &HeaderRecord {
        &self.header
    }

    pub fn record_count(&self) -> u32 {
        self.header.leaf_records
    }

    pub fn depth(&self) -> u16 {
        self.header.depth
    }

    fn read_raw<S: NodeStore>(store: &mut S, num: u32) -> Result<Node> {
        let mut buf = vec![0u8; NODE_SIZE];
        store.read_node(num, &mut buf)?;
        Node::parse(num, &buf)
    }

    fn read<S: NodeStore>(&self, store: &mut S, num: u32) -> Result<Node> {
        if num == 0 || num >= self.header.total_nodes {
            return Err(FsError::Corrupt);
        }
        Self::read_raw(store, num)
    }

    fn write<S: NodeStore>(&self, store: &mut S, node: &Node) -> Result<()> {
        store.write_node(node.num, &node.serialize()?)
    }

    fn write_header<S: NodeStore>(&self, store: &mut S) -> Result<()> {
        let mut node = Node::new(0, NodeKind::Header, 0);
        node.records.push(self.header.to_bytes()?);
        node.records.push(vec![0u8; USER_RECORD_SIZE]);
        node.records.push(self.map.clone());
        self.write(store, &node)
    }

    fn node_in_use(&self, num: u32) -> bool {
        self.map[(num / 8) as usize] & (0x80 >> (num % 8)) != 0
    }

    /// Ensure at least `count` free nodes, growing the store if needed.
    fn reserve_nodes<S: NodeStore>(&mut self, store: &mut S, count: u32) -> Result<()> {
        if self.header.free_nodes >= count {
            return Ok(());
        }
        let wanted = self.header.total_nodes + (count - self.header.free_nodes);
        if wanted > MAX_NODES {
            return Err(FsError::DiskFull);
        }
        let capacity = store.grow(wanted)?.min(MAX_NODES);
        if capacity < wanted {
            return Err(FsError::DiskFull);
        }
        trace!(
            "B-tree grew from {} to {capacity} nodes",
            self.header.total_nodes
        );
        self.header.free_nodes += capacity - self.header.total_nodes;
        self.header.total_nodes = capacity;
        Ok(())
    }

    fn allocate_node<S: NodeStore>(&mut self, store: &mut S) -> Result<u32> {
        self.reserve_nodes(store, 1)?;
        let num = (1..self.header.total_nodes)
            .find(|&n| !self.node_in_use(n))
            .ok_or(FsError::Corrupt)?;
        self.map[(num / 8) as usize] |= 0x80 >> (num % 8);
        self.header.free_nodes -= 1;
        Ok(num)
    }

    fn free_node(&mut self, num: u32) {
        if self.node_in_use(num) {
            self.map[(num / 8) as usize] &= !(0x80 >> (num % 8));
            self.header.free_nodes += 1;
        }
    }

    fn index_record(&self, key: &[u8], child: u32) -> Result<Vec<u8>> {
        let max = self.header.max_key_len as usize;
        if key.len() > max {
            return Err(FsError::Corrupt);
        }
        let mut padded = key.to_vec();
        padded.resize(max, 0);
        Ok(build_record(&padded, &child.to_be_bytes()))
    }

    fn find_in(&self, node: &Node, key: &[u8]) -> std::result::Result<usize, usize> {
        node.records
            .binary_search_by(|record| (self.compare)(key_of(record), key))
    }

    /// Walk from the root to the leaf that holds or would hold `key`.
    fn descend<S: NodeStore>(
        &self,
        store: &mut S,
        key: &[u8],
    ) -> Result<(Vec<Step>, std::result::Result<usize, usize>)> {
        let mut path = Vec::with_capacity(self.header.depth as usize);
        let mut num = self.header.root_node;
        loop {
            if path.len() >= self.header.depth as usize {
                return Err(FsError::Corrupt);
            }
            let node = self.read(store, num)?;
            match node.desc.kind {
                NodeKind::Leaf => {
                    let found = self.find_in(&node, key);
                    path.push(Step { node, index: 0 });
                    return Ok((path, found));
                }
                NodeKind::Index if !node.records.is_empty() => {
                    let index = match self.find_in(&node, key) {
                        Ok(i) => i,
                        Err(0) => 0,
                        Err(i) => i - 1,
                    };
                    num = child_of(&node.records[index])?;
                    path.push(Step { node, index });
                }
                _ => return Err(FsError::Corrupt),
            }
        }
    }

    /// Data of the record with `key`.
    pub fn search<S: NodeStore>(&self, store: &mut S, key: &[u8]) -> Result<Vec<u8>> {
        if self.header.root_node == 0 {
            return Err(FsError::RecordNotFound);
        }
        let (path, found) = self.descend(store, key)?;
        let leaf = &path.last().ok_or(FsError::Corrupt)?.node;
        match found {
            Ok(i) => Ok(data_of(&leaf.records[i]).to_vec()),
            Err(_) => Err(FsError::RecordNotFound),
        }
    }

    pub fn insert<S: NodeStore>(&mut self, store: &mut S, key: &[u8], data: &[u8]) -> Result<()> {
        if key.len() > self.header.max_key_len as usize {
            return Err(FsError::Param);
        }
        let record = build_record(key, data);
        if cost(&record) > MAX_RECORD_COST {
            return Err(FsError::Param);
        }

        // Worst case every level splits and the root grows.
        self.reserve_nodes(store, self.header.depth as u32 + 1)?;

        if self.header.root_node == 0 {
            let num = self.allocate_node(store)?;
            let mut leaf = Node::new(num, NodeKind::Leaf, 1);
            leaf.records.push(record);
            self.write(store, &leaf)?;
            self.header.root_node = num;
            self.header.first_leaf = num;
            self.header.last_leaf = num;
            self.header.depth = 1;
            self.header.leaf_records = 1;
            return self.write_header(store);
        }

        let (mut path, found) = self.descend(store, key)?;
        let position = match found {
            Ok(_) => return Err(FsError::DuplicateName),
            Err(position) => position,
        };
        let leaf = path.last_mut().ok_or(FsError::Corrupt)?;
        leaf.node.records.insert(position, record);
        self.header.leaf_records += 1;

        self.propagate_insert(store, path)?;
        self.write_header(store)
    }

    /// Write the modified path back bottom-up, splitting overfull nodes and
    /// keeping parent keys equal to their children's first keys.
    fn propagate_insert<S: NodeStore>(&mut self, store: &mut S, mut path: Vec<Step>) -> Result<()> {
        let mut pending: Option<(Vec<u8>, u32)> = None;

        while let Some(mut step) = path.pop() {
            if let Some((key, child)) = pending.take() {
                let record = self.index_record(&key, child)?;
                step.node.records.insert(step.index + 1, record);
            }

            if step.node.used() > NODE_SIZE {
                let right = self.split(store, &mut step.node)?;
                pending = Some((right.first_key()?.to_vec(), right.num));
            } else {
                self.write(store, &step.node)?;
            }

            match path.last_mut() {
                Some(parent) => {
                    let record = self.index_record(step.node.first_key()?, step.node.num)?;
                    let changed = parent.node.records[parent.index] != record;
                    if changed {
                        parent.node.records[parent.index] = record;
                    }
                    if !changed && pending.is_none() {
                        break;
                    }
                }
                None => {
                    if let Some((key, child)) = pending.take() {
                        self.grow_root(store, &step.node, &key, child)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Move the upper half of `node` into a new right sibling. Both nodes are
    /// written; the sibling is returned for linking into the parent.
    fn split<S: NodeStore>(&mut self, store: &mut S, node: &mut Node) -> Result<Node> {
        let at = balanced_split(&node.records);
        let num = self.allocate_node(store)?;
        let mut right = Node::new(num, node.desc.kind, node.desc.height);
        right.records = node.records.split_off(at);

        right.desc.forward_link = node.desc.forward_link;
        right.desc.backward_link = node.num;
        node.desc.forward_link = num;
        if right.desc.forward_link != 0 {
            let mut next = self.read(store, right.desc.forward_link)?;
            next.desc.backward_link = num;
            self.write(store, &next)?;
        } else if node.is_leaf() {
            self.header.last_leaf = num;
        }

        trace!(
            "split node {} at height {}: {} + {} records",
            node.num,
            node.desc.height,
            node.records.len(),
            right.records.len()
        );
        self.write(store, node)?;
        self.write(store, &right)?;
        Ok(right)
    }

    fn grow_root<S: NodeStore>(
        &mut self,
        store: &mut S,
        old_root: &Node,
        right_key: &[u8],
        right: u32,
    ) -> Result<()> {
        let num = self.allocate_node(store)?;
        let mut root = Node::new(num, NodeKind::Index, old_root.desc.height + 1);
        root.records
            .push(self.index_record(old_root.first_key()?, old_root.num)?);
        root.records.push(self.index_record(right_key, right)?);
        self.write(store, &root)?;
        self.header.root_node = num;
        self.header.depth += 1;
        debug!("B-tree root is now node {num}, depth {}", self.header.depth);
        Ok(())
    }

    pub fn delete<S: NodeStore>(&mut self, store: &mut S, key: &[u8]) -> Result<()> {
        if self.header.root_node == 0 {
            return Err(FsError::RecordNotFound);
        }
        let (mut path, found) = self.descend(store, key)?;
        let Ok(position) = found else {
            return Err(FsError::RecordNotFound);
        };
        let leaf = path.last_mut().ok_or(FsError::Corrupt)?;
        leaf.node.records.remove(position);
        self.header.leaf_records -= 1;

        self.rebalance(store, path)?;
        self.write_header(store)
    }

    /// Write the modified path back bottom-up after a removal, dropping empty
    /// nodes and merging or redistributing underfull ones with a sibling.
    fn rebalance<S: NodeStore>(&mut self, store: &mut S, mut path: Vec<Step>) -> Result<()> {
        while let Some(step) = path.pop() {
            let Some(parent) = path.last_mut() else {
                return self.settle_root(store, step.node);
            };
            let slot = parent.index;

            if step.node.records.is_empty() {
                self.unlink(store, &step.node)?;
                self.free_node(step.node.num);
                parent.node.records.remove(slot);
                continue;
            }

            if step.node.used() < NODE_SIZE / 2 && parent.node.records.len() > 1 {
                let (left_slot, node_is_left) = if slot + 1 < parent.node.records.len() {
                    (slot, true)
                } else {
                    (slot - 1, false)
                };
                let sibling_slot = if node_is_left { slot + 1 } else { slot - 1 };
                let sibling = self.read(store, child_of(&parent.node.records[sibling_slot])?)?;
                let (mut left, mut right) = if node_is_left {
                    (step.node, sibling)
                } else {
                    (sibling, step.node)
                };

                if self.merge_or_redistribute(store, &mut left, &mut right)? {
                    parent.node.records.remove(left_slot + 1);
                } else {
                    parent.node.records[left_slot + 1] =
                        self.index_record(right.first_key()?, right.num)?;
                }
                parent.node.records[left_slot] = self.index_record(left.first_key()?, left.num)?;
                continue;
            }

            self.write(store, &step.node)?;
            parent.node.records[slot] = self.index_record(step.node.first_key()?, step.node.num)?;
        }
        Ok(())
    }

    /// Merge `right` into `left` when both fit in one node, otherwise share
    /// their records evenly. Returns whether a merge happened.
    fn merge_or_redistribute<S: NodeStore>(
        &mut self,
        store: &mut S,
        left: &mut Node,
        right: &mut Node,
    ) -> Result<bool> {
        let merged_size = left.used() + right.used() - NodeDescriptor::SIZE - 2;
        if merged_size <= NODE_SIZE {
            trace!("merging node {} into {}", right.num, left.num);
            left.records.append(&mut right.records);
            left.desc.forward_link = right.desc.forward_link;
            if right.desc.forward_link != 0 {
                let mut next = self.read(store, right.desc.forward_link)?;
                next.desc.backward_link = left.num;
                self.write(store, &next)?;
            } else if left.is_leaf() {
                self.header.last_leaf = left.num;
            }
            self.free_node(right.num);
            self.write(store, left)?;
            return Ok(true);
        }

        let mut all = std::mem::take(&mut left.records);
        all.append(&mut right.records);
        let at = balanced_split(&all);
        right.records = all.split_off(at);
        left.records = all;
        trace!(
            "redistributed nodes {} and {}: {} + {} records",
            left.num,
            right.num,
            left.records.len(),
            right.records.len()
        );
        self.write(store, left)?;
        self.write(store, right)?;
        Ok(false)
    }

    /// Detach an empty node from its siblings.
    fn unlink<S: NodeStore>(&mut self, store: &mut S, node: &Node) -> Result<()> {
        let (prev, next) = (node.desc.backward_link, node.desc.forward_link);
        if prev != 0 {
            let mut p = self.read(store, prev)?;
            p.desc.forward_link = next;
            self.write(store, &p)?;
        }
        if next != 0 {
            let mut n = self.read(store, next)?;
            n.desc.backward_link = prev;
            self.write(store, &n)?;
        }
        if node.is_leaf() {
            if self.header.first_leaf == node.num {
                self.header.first_leaf = next;
            }
            if self.header.last_leaf == node.num {
                self.header.last_leaf = prev;
            }
        }
        Ok(())
    }

    /// Write the root back, emptying the tree or dropping index roots with a
    /// single child.
    fn settle_root<S: NodeStore>(&mut self, store: &mut S, mut root: Node) -> Result<()> {
        loop {
            if root.records.is_empty() {
                self.free_node(root.num);
                self.header.root_node = 0;
                self.header.first_leaf = 0;
                self.header.last_leaf = 0;
                self.header.depth = 0;
                return Ok(());
            }
            if root.is_leaf() || root.records.len() > 1 {
                return self.write(store, &root);
            }
            let child = child_of(&root.records[0])?;
            self.free_node(root.num);
            self.header.root_node = child;
            self.header.depth -= 1;
            debug!("B-tree root collapsed to node {child}, depth {}", self.header.depth);
            root = self.read(store, child)?;
        }
    }

    /// Replace the data of an existing record.
    pub fn replace<S: NodeStore>(&mut self, store: &mut S, key: &[u8], data: &[u8]) -> Result<()> {
        if self.header.root_node == 0 {
            return Err(FsError::RecordNotFound);
        }
        let (mut path, found) = self.descend(store, key)?;
        let Ok(position) = found else {
            return Err(FsError::RecordNotFound);
        };
        let leaf = &mut path.last_mut().ok_or(FsError::Corrupt)?.node;
        let record = build_record(key_of(&leaf.records[position]), data);
        if leaf.used() - leaf.records[position].len() + record.len() <= NODE_SIZE {
            leaf.records[position] = record;
            return self.write(store, leaf);
        }

        if cost(&record) > MAX_RECORD_COST {
            return Err(FsError::Param);
        }
        let previous = data_of(&leaf.records[position]).to_vec();

        // Room for the reinsert is claimed before the record is removed.
        self.reserve_nodes(store, self.header.depth as u32 + 1)?;
        self.delete(store, key)?;
        if let Err(err) = self.insert(store, key, data) {
            let _ = self.insert(store, key, &previous);
            return Err(err);
        }
        Ok(())
    }

    /// Visit leaf records in key order, starting at the first key not less
    /// than `key`, until `visit` returns `false`.
    pub fn scan_from<S: NodeStore>(
        &self,
        store: &mut S,
        key: &[u8],
        mut visit: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        if self.header.root_node == 0 {
            return Ok(());
        }
        let (mut path, found) = self.descend(store, key)?;
        let mut node = path.pop().ok_or(FsError::Corrupt)?.node;
        let mut index = match found {
            Ok(i) | Err(i) => i,
        };

        for _ in 0..self.header.total_nodes {
            for record in &node.records[index..] {
                if !visit(key_of(record), data_of(record)) {
                    return Ok(());
                }
            }
            if node.desc.forward_link == 0 {
                return Ok(());
            }
            node = self.read(store, node.desc.forward_link)?;
            index = 0;
        }
        Err(FsError::Corrupt)
    }

    /// Every leaf record in key order.
    pub fn scan_all<S: NodeStore>(
        &self,
        store: &mut S,
        mut visit: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let mut num = self.header.first_leaf;
        for _ in 0..self.header.total_nodes {
            if num == 0 {
                return Ok(());
            }
            let node = self.read(store, num)?;
            for record in &node.records {
                if !visit(key_of(record), data_of(record)) {
                    return Ok(());
                }
            }
            num = node.desc.forward_link;
        }
        Err(FsError::Corrupt)
    }

    /// Check the leaf chain, key order, record count and free node count.
    pub fn verify<S: NodeStore>(&self, store: &mut S) -> Result<()> {
        let mut count = 0u32;
        let mut previous: Option<Vec<u8>> = None;
        let mut ordered = true;
        self.scan_all(store, |key, _| {
            if let Some(prev) = &previous {
                ordered &= (self.compare)(prev, key) == Ordering::Less;
            }
            previous = Some(key.to_vec());
            count += 1;
            true
        })?;

        let used = (0..self.header.total_nodes)
            .filter(|&n| self.node_in_use(n))
            .count() as u32;
        if !ordered
            || count != self.header.leaf_records
            || used + self.header.free_nodes != self.header.total_nodes
        {
            debug!(
                "B-tree check failed: ordered={ordered} records={count}/{} nodes={used}+{}/{}",
                self.header.leaf_records, self.header.free_nodes, self.header.total_nodes
            );
            return Err(FsError::Corrupt);
        }

        if self.header.last_leaf != 0 {
            let last = self.read(store, self.header.last_leaf)?;
            if last.desc.forward_link != 0 || !last.is_leaf() {
                return Err(FsError::Corrupt);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Node store backed by a vector, growable up to `limit` nodes.
    pub(crate) struct MemStore {
        pub nodes: Vec<Vec<u8>>,
        pub limit: u32,
    }

    impl MemStore {
        pub fn new(nodes: u32, limit: u32) -> Self {
            Self {
                nodes: vec![vec![0u8; NODE_SIZE]; nodes as usize],
                limit,
            }
        }
    }

    impl NodeStore for MemStore {
        fn read_node(&mut self, node: u32, buf: &mut [u8]) -> Result<()> {
            let src = self.nodes.get(node as usize).ok_or(FsError::Io)?;
            buf.copy_from_slice(src);
            Ok(())
        }

        fn write_node(&mut self, node: u32, buf: &[u8]) -> Result<()> {
            let dst = self.nodes.get_mut(node as usize).ok_or(FsError::Io)?;
            dst.copy_from_slice(buf);
            Ok(())
        }

        fn grow(&mut self, nodes: u32) -> Result<u32> {
            if nodes > self.limit {
                return Err(FsError::DiskFull);
            }
            // Grow in clumps of four nodes.
            let target = nodes.div_ceil(4) * 4;
            let target = target.min(self.limit);
            self.nodes.resize(target as usize, vec![0u8; NODE_SIZE]);
            Ok(target)
        }
    }

    fn compare(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn key(i: u32) -> [u8; 4] {
        i.to_be_bytes()
    }

    fn value(i: u32) -> Vec<u8> {
        vec![(i % 251) as u8; 40]
    }

    /// A permutation of `0..n` that is far from sorted.
    fn shuffled(n: u32) -> Vec<u32> {
        (0..n).map(|i| (i * 7919) % n).collect()
    }

    fn tree() -> (BTree, MemStore) {
        let mut store = MemStore::new(4, 1024);
        let tree = BTree::create(&mut store, 4, 4, compare).unwrap();
        (tree, store)
    }

    #[test]
    fn empty_tree_misses() {
        let (mut tree, mut store) = tree();
        assert_eq!(tree.search(&mut store, &key(1)), Err(FsError::RecordNotFound));
        assert_eq!(tree.delete(&mut store, &key(1)), Err(FsError::RecordNotFound));
        assert_eq!(tree.depth(), 0);
        tree.verify(&mut store).unwrap();
    }

    #[test]
    fn insert_splits_and_everything_is_found() {
        let (mut tree, mut store) = tree();
        for i in shuffled(500) {
            tree.insert(&mut store, &key(i), &value(i)).unwrap();
        }
        assert_eq!(tree.record_count(), 500);
        assert!(tree.depth() >= 3, "depth {}", tree.depth());
        tree.verify(&mut store).unwrap();

        for i in 0..500 {
            assert_eq!(tree.search(&mut store, &key(i)).unwrap(), value(i));
        }
        assert_eq!(tree.search(&mut store, &key(500)), Err(FsError::RecordNotFound));
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let (mut tree, mut store) = tree();
        tree.insert(&mut store, &key(7), b"a").unwrap();
        assert_eq!(
            tree.insert(&mut store, &key(7), b"b"),
            Err(FsError::DuplicateName)
        );
        assert_eq!(tree.search(&mut store, &key(7)).unwrap(), b"a");
    }

    #[test]
    fn delete_merges_back_to_empty() {
        let (mut tree, mut store) = tree();
        for i in 0..400 {
            tree.insert(&mut store, &key(i), &value(i)).unwrap();
        }
        for (n, i) in shuffled(400).into_iter().enumerate() {
            tree.delete(&mut store, &key(i)).unwrap();
            if n % 50 == 0 {
                tree.verify(&mut store).unwrap();
                assert_eq!(tree.search(&mut store, &key(i)), Err(FsError::RecordNotFound));
            }
        }

        let header = tree.header();
        assert_eq!(header.root_node, 0);
        assert_eq!(header.depth, 0);
        assert_eq!(header.first_leaf, 0);
        assert_eq!(header.free_nodes, header.total_nodes - 1);
    }

    #[test]
    fn partial_delete_keeps_remaining_records() {
        let (mut tree, mut store) = tree();
        for i in 0..300 {
            tree.insert(&mut store, &key(i), &value(i)).unwrap();
        }
        for i in (0..300).filter(|i| i % 3 != 0) {
            tree.delete(&mut store, &key(i)).unwrap();
        }
        tree.verify(&mut store).unwrap();

        let mut seen = Vec::new();
        tree.scan_all(&mut store, |k, _| {
            seen.push(u32::from_be_bytes(k.try_into().unwrap()));
            true
        })
        .unwrap();
        assert_eq!(seen, (0..300).step_by(3).collect::<Vec<_>>());
    }

    #[test]
    fn scan_from_starts_at_first_key_not_less() {
        let (mut tree, mut store) = tree();
        for i in (0..200).map(|i| i * 2) {
            tree.insert(&mut store, &key(i), &value(i)).unwrap();
        }
        let mut seen = Vec::new();
        tree.scan_from(&mut store, &key(101), |k, _| {
            seen.push(u32::from_be_bytes(k.try_into().unwrap()));
            seen.len() < 3
        })
        .unwrap();
        assert_eq!(seen, [102, 104, 106]);
    }

    #[test]
    fn replace_updates_in_place() {
        let (mut tree, mut store) = tree();
        for i in 0..50 {
            tree.insert(&mut store, &key(i), &value(i)).unwrap();
        }
        tree.replace(&mut store, &key(20), b"fresh").unwrap();
        assert_eq!(tree.search(&mut store, &key(20)).unwrap(), b"fresh");
        assert_eq!(tree.record_count(), 50);
        assert_eq!(
            tree.replace(&mut store, &key(99), b"x"),
            Err(FsError::RecordNotFound)
        );
    }

    #[test]
    fn replace_that_cannot_grow_keeps_old_record() {
        let mut store = MemStore::new(4, 4);
        let mut tree = BTree::create(&mut store, 4, 4, compare).unwrap();
        tree.insert(&mut store, &key(0), b"").unwrap();
        for i in 1..5 {
            tree.insert(&mut store, &key(i), &[i as u8; 100]).unwrap();
        }
        for i in 5..7 {
            tree.insert(&mut store, &key(i), &value(i)).unwrap();
        }
        // The split used the last free nodes.
        assert_eq!(tree.depth(), 2);
        assert_eq!(tree.header().free_nodes, 0);

        assert_eq!(
            tree.replace(&mut store, &key(5), &[0xAB; 240]),
            Err(FsError::DiskFull)
        );
        assert_eq!(tree.search(&mut store, &key(5)).unwrap(), value(5));
        assert_eq!(tree.record_count(), 7);
        tree.verify(&mut store).unwrap();

        assert_eq!(
            tree.replace(&mut store, &key(5), &[0xAB; 300]),
            Err(FsError::Param)
        );
        assert_eq!(tree.search(&mut store, &key(5)).unwrap(), value(5));
    }

    #[test]
    fn reopen_reads_header_node() {
        let (mut tree, mut store) = tree();
        for i in shuffled(120) {
            tree.insert(&mut store, &key(i), &value(i)).unwrap();
        }
        let reopened = BTree::open(&mut store, compare).unwrap();
        assert_eq!(reopened.header(), tree.header());
        assert_eq!(reopened.search(&mut store, &key(33)).unwrap(), value(33));
        reopened.verify(&mut store).unwrap();
    }

    #[test]
    fn full_store_fails_cleanly() {
        let mut store = MemStore::new(4, 4);
        let mut tree = BTree::create(&mut store, 4, 4, compare).unwrap();
        let mut inserted = 0;
        for i in 0..1000 {
            match tree.insert(&mut store, &key(i), &value(i)) {
                Ok(()) => inserted += 1,
                Err(err) => {
                    assert_eq!(err, FsError::DiskFull);
                    break;
                }
            }
        }
        assert!(inserted > 0);
        assert_eq!(tree.record_count(), inserted);
        tree.verify(&mut store).unwrap();
    }

    #[test]
    fn oversized_keys_are_rejected() {
        let (mut tree, mut store) = tree();
        assert_eq!(
            tree.insert(&mut store, b"too long", b""),
            Err(FsError::Param)
        );
    }

    #[test]
    fn node_layout_round_trips() {
        let mut node = Node::new(3, NodeKind::Leaf, 1);
        node.records.push(build_record(b"abc", b"data"));
        node.records.push(build_record(b"ab", b"xy"));
        let buf = node.serialize().unwrap();
        // Offsets are stored from the end of the node.
        assert_eq!(&buf[NODE_SIZE - 2..], &[0, 14]);
        assert_eq!(&buf[NODE_SIZE - 4..NODE_SIZE - 2], &[0, 22]);

        let parsed = Node::parse(3, &buf).unwrap();
        assert_eq!(parsed.records, node.records);
        assert_eq!(key_of(&parsed.records[0]), b"abc");
        assert_eq!(data_of(&parsed.records[0]), b"data");
        assert_eq!(data_of(&parsed.records[1]), b"xy");
    }
}

// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeMap;

use super::{Generation, NodeEntry, TreeGeometry, TreeRoot, Type1Node};
use crate::prelude::*;

/// Identifies a node by its level and its index within the level.
pub(crate) type NodeKey = (u32, u64);

struct LoadedNode {
    /// How the parent (or the root) referenced the node when it was loaded.
    reference: Type1Node,
    block: Block,
    dirty: bool,
    new_pba: Option<Pba>,
}

/// The in-memory part of a tree that one request works on.
///
/// Nodes are loaded top-down and verified against the hash stored in their
/// parent. Modified nodes are written back bottom-up, each write updating
/// the reference in its parent, so the root changes last.
pub(crate) struct TreeWalk {
    root: TreeRoot,
    nodes: BTreeMap<NodeKey, LoadedNode>,
}

impl TreeWalk {
    pub fn new(root: TreeRoot) -> Self {
        Self {
            root,
            nodes: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &TreeRoot {
        &self.root
    }

    pub fn geometry(&self) -> &TreeGeometry {
        &self.root.geometry
    }

    pub fn set_nr_of_leaves(&mut self, nr_of_leaves: u64) {
        self.root.geometry.nr_of_leaves = nr_of_leaves;
    }

    fn degree(&self) -> u64 {
        self.root.geometry.degree as u64
    }

    /// The node of `level` on the path to leaf `unit`.
    pub fn key_of(&self, level: u32, unit: u64) -> NodeKey {
        (level, unit / self.geometry().span(level))
    }

    /// The keys on the path to leaf `unit`, top-down.
    pub fn path(&self, unit: u64) -> Vec<NodeKey> {
        (1..=self.geometry().max_level_idx)
            .rev()
            .map(|level| self.key_of(level, unit))
            .collect()
    }

    fn parent_of(&self, key: NodeKey) -> Option<(NodeKey, usize)> {
        if key.0 >= self.geometry().max_level_idx {
            return None;
        }
        let degree = self.degree();
        Some(((key.0 + 1, key.1 / degree), (key.1 % degree) as usize))
    }

    fn reference_of(&self, key: NodeKey) -> Result<Type1Node> {
        let Some((parent, slot)) = self.parent_of(key) else {
            return Ok(self.root.root);
        };
        let Some(parent) = self.nodes.get(&parent) else {
            return_errno_with_msg!(NotFound, "parent node is not loaded");
        };
        Type1Node::load(&parent.block, slot)
    }

    /// Returns the next node on the path to `unit` that must be read.
    ///
    /// A reference to no block is a node that does not exist yet. It is
    /// created empty if `create_missing` is set, and is an integrity error
    /// otherwise.
    pub fn next_to_load(
        &mut self,
        unit: u64,
        create_missing: bool,
    ) -> Result<Option<(NodeKey, Type1Node)>> {
        for key in self.path(unit) {
            if self.nodes.contains_key(&key) {
                continue;
            }
            let reference = self.reference_of(key)?;
            if reference.is_valid() {
                return Ok(Some((key, reference)));
            }
            if !create_missing {
                return_errno_with_msg!(IntegrityViolation, "path leads to a missing node");
            }
            self.insert_new(key);
        }
        Ok(None)
    }

    /// Returns the next node of the whole tree that must be read.
    pub fn next_to_load_all(&mut self) -> Result<Option<(NodeKey, Type1Node)>> {
        let degree = self.degree();
        for index in 0..self.geometry().nodes_at_level(1) {
            if let Some(next) = self.next_to_load(index * degree, false)? {
                return Ok(Some(next));
            }
        }
        Ok(None)
    }

    pub fn insert_loaded(&mut self, key: NodeKey, reference: Type1Node, block: Block) -> Result<()> {
        if block.hash() != reference.hash {
            return_errno_with_msg!(IntegrityViolation, "node does not match its hash");
        }
        self.nodes.insert(
            key,
            LoadedNode {
                reference,
                block,
                dirty: false,
                new_pba: None,
            },
        );
        Ok(())
    }

    pub fn insert_new(&mut self, key: NodeKey) {
        self.nodes.insert(
            key,
            LoadedNode {
                reference: Type1Node::default(),
                block: Block::new_zeroed(),
                dirty: true,
                new_pba: None,
            },
        );
    }

    fn leaf_node(&self, unit: u64) -> Result<(&LoadedNode, usize)> {
        let key = self.key_of(1, unit);
        let Some(node) = self.nodes.get(&key) else {
            return_errno_with_msg!(NotFound, "leaf node is not loaded");
        };
        Ok((node, (unit % self.degree()) as usize))
    }

    /// Reads the leaf entry of `unit`.
    pub fn entry<T: NodeEntry>(&self, unit: u64) -> Result<T> {
        let (node, slot) = self.leaf_node(unit)?;
        T::load(&node.block, slot)
    }

    /// Overwrites the leaf entry of `unit` and marks its node dirty.
    pub fn set_entry<T: NodeEntry>(&mut self, unit: u64, entry: &T) -> Result<()> {
        let key = self.key_of(1, unit);
        let slot = (unit % self.degree()) as usize;
        let Some(node) = self.nodes.get_mut(&key) else {
            return_errno_with_msg!(NotFound, "leaf node is not loaded");
        };
        entry.store(&mut node.block, slot)?;
        node.dirty = true;
        Ok(())
    }

    pub fn mark_path_dirty(&mut self, unit: u64) {
        for key in self.path(unit) {
            if let Some(node) = self.nodes.get_mut(&key) {
                node.dirty = true;
            }
        }
    }

    fn needs_block(node: &LoadedNode, curr: Generation) -> bool {
        node.new_pba.is_none()
            && (!node.reference.is_valid() || node.reference.generation != curr)
    }

    /// The number of nodes on the path to `unit` that would need a new
    /// block if the path was modified.
    pub fn path_cost(&self, unit: u64, curr: Generation) -> usize {
        self.path(unit)
            .iter()
            .filter_map(|key| self.nodes.get(key))
            .filter(|node| Self::needs_block(node, curr))
            .count()
    }

    /// The dirty nodes that cannot be rewritten in place, bottom-up.
    ///
    /// A node written in the open generation is referenced by no committed
    /// state and keeps its block.
    pub fn nodes_needing_blocks(&self, curr: Generation) -> Vec<NodeKey> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.dirty && Self::needs_block(node, curr))
            .map(|(key, _)| *key)
            .collect()
    }

    /// The block a node occupied before it was modified, if any.
    pub fn obsolete(&self, key: NodeKey) -> Option<(Pba, Generation)> {
        self.nodes
            .get(&key)
            .map(|node| node.reference)
            .filter(Type1Node::is_valid)
            .map(|reference| (reference.pba, reference.generation))
    }

    pub fn assign_block(&mut self, key: NodeKey, pba: Pba) {
        if let Some(node) = self.nodes.get_mut(&key) {
            node.new_pba = Some(pba);
        }
    }

    /// Finalizes the lowest dirty node and returns the block to write.
    ///
    /// The node's new reference is stored in its parent, or in the root for
    /// the top node.
    pub fn next_write(&mut self, curr: Generation) -> Result<Option<(Pba, Block)>> {
        let Some((&key, node)) = self.nodes.iter_mut().find(|(_, node)| node.dirty) else {
            return Ok(None);
        };
        let pba = match node.new_pba {
            Some(pba) => pba,
            None if node.reference.is_valid() && node.reference.generation == curr => {
                node.reference.pba
            }
            None => return_errno_with_msg!(OutOfDisk, "modified node has no block"),
        };
        let reference = Type1Node::new(pba, curr, node.block.hash());
        node.reference = reference;
        node.dirty = false;
        node.new_pba = None;
        let block = node.block.clone();

        match self.parent_of(key) {
            Some((parent, slot)) => {
                let Some(parent) = self.nodes.get_mut(&parent) else {
                    return_errno_with_msg!(NotFound, "parent node is not loaded");
                };
                reference.store(&mut parent.block, slot)?;
                parent.dirty = true;
            }
            None => self.root.root = reference,
        }
        Ok(Some((pba, block)))
    }

    /// Adds a level on top. The old top node becomes the first child of a
    /// new, empty top node.
    pub fn grow(&mut self) -> Result<()> {
        let geometry = self.geometry();
        if geometry.max_level_idx >= TreeGeometry::MAX_LEVEL_IDX {
            return_errno_with_msg!(Unsupported, "tree cannot grow any higher");
        }
        let level = geometry.max_level_idx + 1;
        let mut block = Block::new_zeroed();
        self.root.root.store(&mut block, 0)?;
        self.root.geometry.max_level_idx = level;
        self.root.root = Type1Node::default();
        self.nodes.insert(
            (level, 0),
            LoadedNode {
                reference: Type1Node::default(),
                block,
                dirty: true,
                new_pba: None,
            },
        );
        Ok(())
    }
}

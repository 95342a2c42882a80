// SPDX-License-Identifier: MPL-2.0

use super::{NodeEntry, TreeGeometry, TreeRoot, Type1Node};
use crate::prelude::*;

/// Lays out a complete tree of generation 0 over given leaf entries.
///
/// Nodes occupy consecutive blocks from `first_pba` on, level by level from
/// the leaf nodes up, so the top node takes the last block.
pub struct TreeBuilder {
    geometry: TreeGeometry,
    first_pba: Pba,
}

impl TreeBuilder {
    pub fn new(geometry: TreeGeometry, first_pba: Pba) -> Self {
        Self {
            geometry,
            first_pba,
        }
    }

    /// The number of blocks the tree occupies.
    pub fn nr_of_blocks(&self) -> u64 {
        self.geometry.nr_of_nodes()
    }

    /// Returns the root and every node block with its PBA.
    pub fn build<T: NodeEntry>(
        &self,
        entry: impl Fn(u64) -> T,
    ) -> Result<(TreeRoot, Vec<(Pba, Block)>)> {
        self.geometry.validate()?;
        let degree = self.geometry.degree as u64;
        let nr_of_leaves = self.geometry.nr_of_leaves;
        let mut blocks = Vec::new();
        let mut next_pba = self.first_pba;
        let mut place = |block: Block| {
            let reference = Type1Node::new(next_pba, 0, block.hash());
            blocks.push((next_pba, block));
            next_pba += 1;
            reference
        };

        let mut references = Vec::new();
        for index in 0..self.geometry.nodes_at_level(1) {
            let first = index * degree;
            let mut block = Block::new_zeroed();
            for unit in first..(first + degree).min(nr_of_leaves) {
                entry(unit).store(&mut block, (unit - first) as usize)?;
            }
            references.push(place(block));
        }
        for _ in 2..=self.geometry.max_level_idx {
            let mut upper = Vec::new();
            for children in references.chunks(degree as usize) {
                let mut block = Block::new_zeroed();
                for (slot, child) in children.iter().enumerate() {
                    child.store(&mut block, slot)?;
                }
                upper.push(place(block));
            }
            references = upper;
        }

        let [root] = references[..] else {
            return_errno_with_msg!(InvalidArgs, "tree has more than one top node");
        };
        Ok((
            TreeRoot {
                root,
                geometry: self.geometry,
            },
            blocks,
        ))
    }
}

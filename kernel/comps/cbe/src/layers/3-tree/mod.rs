// SPDX-License-Identifier: MPL-2.0

//! The layer of hash trees: the virtual block device, the free tree and the
//! meta tree, plus the bump allocator used while formatting.

mod block_alloc;
mod builder;
mod free_tree;
mod meta_tree;
mod node;
#[cfg(test)]
pub(crate) mod testing;
mod vbd;
mod walk;

use serde::{Deserialize, Serialize};

pub use self::{
    block_alloc::{AllocRequest, BlockAllocator},
    builder::TreeBuilder,
    free_tree::{FreeTree, FtOp, FtRequest},
    meta_tree::{MetaTree, MtRequest},
    node::{NodeEntry, Type1Node, Type2Node},
    vbd::{Vbd, VbdOp, VbdRequest},
};
pub(crate) use self::walk::{NodeKey, TreeWalk};
use crate::{dispatch::expect_response, layers::cache::CacheRequest, prelude::*};

/// A virtual block address, i.e., the client-visible block index.
pub type Vba = u64;

/// A commit counter of the superblock.
pub type Generation = u64;

/// The free generation of a block that is in use.
pub const INVALID_GENERATION: Generation = Generation::MAX;

/// The last VBA of a block that never held client data.
pub const INVALID_VBA: Vba = Vba::MAX;

/// The generation being built and the last one the trust anchor secured.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Generations {
    pub curr: Generation,
    pub last_secured: Generation,
}

/// The shape of a tree.
///
/// Level 1 holds the leaf entries, level `max_level_idx` is the single top
/// node referenced by the root.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct TreeGeometry {
    pub max_level_idx: u32,
    pub degree: u32,
    pub nr_of_leaves: u64,
}

impl TreeGeometry {
    pub const MAX_LEVEL_IDX: u32 = 6;
    pub const MIN_DEGREE: u32 = 2;
    /// As many Type-1 entries as fit in one block.
    pub const MAX_DEGREE: u32 = (BLOCK_SIZE / Type1Node::SIZE) as u32;

    pub const fn new(max_level_idx: u32, degree: u32, nr_of_leaves: u64) -> Self {
        Self {
            max_level_idx,
            degree,
            nr_of_leaves,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.degree < Self::MIN_DEGREE || self.degree > Self::MAX_DEGREE {
            return_errno_with_msg!(InvalidArgs, "tree degree out of range");
        }
        if self.max_level_idx == 0 || self.max_level_idx > Self::MAX_LEVEL_IDX {
            return_errno_with_msg!(InvalidArgs, "tree height out of range");
        }
        if self.nr_of_leaves == 0 || self.nr_of_leaves > self.capacity() {
            return_errno_with_msg!(InvalidArgs, "leaf count does not fit the tree");
        }
        Ok(())
    }

    /// The number of leaves below one node of `level`.
    pub fn span(&self, level: u32) -> u64 {
        (self.degree as u64).saturating_pow(level)
    }

    pub fn capacity(&self) -> u64 {
        self.span(self.max_level_idx)
    }

    pub fn nodes_at_level(&self, level: u32) -> u64 {
        self.nr_of_leaves.div_ceil(self.span(level))
    }

    pub fn nr_of_nodes(&self) -> u64 {
        (1..=self.max_level_idx)
            .map(|level| self.nodes_at_level(level))
            .sum()
    }
}

/// The reference to the top node of a tree together with its shape.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct TreeRoot {
    pub root: Type1Node,
    pub geometry: TreeGeometry,
}

/// The allocation state a copy-on-write update works against.
///
/// The tree roots are updated in place when the request completes.
#[derive(Clone, Debug, Default)]
pub struct AllocContext {
    pub free_tree: TreeRoot,
    pub meta_tree: TreeRoot,
    pub gens: Generations,
    /// Generations pinned by kept snapshots.
    pub snapshots: Vec<Generation>,
}

/// Issues the cache read of a node.
fn read_node(pba: Pba) -> Action {
    Action::Generate(Payload::Cache(CacheRequest::read(pba)))
}

/// Issues the cache write of a node.
fn write_node(pba: Pba, block: Block) -> Action {
    Action::Generate(Payload::Cache(CacheRequest::write(pba, block)))
}

/// Takes the node block out of a completed cache read.
fn node_read(response: Option<Payload>) -> Result<Block> {
    payload_of!(expect_response(response), Cache)
        .into_result()?
        .ok_or(Error::with_msg(IoFailed, "cache read returned no block"))
}

fn node_written(response: Option<Payload>) -> Result<()> {
    payload_of!(expect_response(response), Cache)
        .into_result()
        .map(|_| ())
}

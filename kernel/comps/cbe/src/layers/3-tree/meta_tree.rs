// SPDX-License-Identifier: MPL-2.0

use super::{
    Generation, Generations, NodeKey, TreeRoot, TreeWalk, Type1Node, Type2Node, node_read,
    node_written, read_node, write_node,
};
use crate::prelude::*;

/// A request to exchange a block that held a free-tree node.
///
/// The meta tree takes `old` (none for a brand-new node) and grants a
/// fresh block in `pba`. `old` becomes reusable once the open generation
/// is secured.
#[derive(Debug)]
pub struct MtRequest {
    pub old: Option<(Pba, Generation)>,
    pub meta_tree: TreeRoot,
    pub gens: Generations,
    pub pba: Pba,
    pub success: bool,
}

impl MtRequest {
    pub fn exchange(old: Option<(Pba, Generation)>, meta_tree: TreeRoot, gens: Generations) -> Self {
        Self {
            old,
            meta_tree,
            gens,
            pba: INVALID_PBA,
            success: false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum MtStage {
    Start,
    Loading(NodeKey, Type1Node),
    Writing,
}

pub(crate) struct MtState {
    walk: TreeWalk,
    stage: MtStage,
    exchanged: bool,
}

/// The tree that tracks the blocks holding free-tree nodes.
///
/// Its own nodes are copied on write with blocks taken from spare entries
/// of the very leaf node being modified, so an exchange never needs another
/// module's blocks.
pub struct MetaTree {
    channels: Channels<MtState>,
}

impl MetaTree {
    pub const NR_OF_CHANNELS: usize = 1;

    pub fn new() -> Self {
        Self {
            channels: Channels::new(ModuleId::MetaTree, Self::NR_OF_CHANNELS),
        }
    }

    fn advance(
        request: &mut MtRequest,
        state: &mut MtState,
        response: Option<Payload>,
    ) -> Result<Action> {
        let gens = request.gens;
        match state.stage {
            MtStage::Start => {}
            MtStage::Loading(key, reference) => {
                state.walk.insert_loaded(key, reference, node_read(response)?)?;
            }
            MtStage::Writing => node_written(response)?,
        }

        if !state.exchanged {
            if let Some((key, reference)) = state.walk.next_to_load_all()? {
                state.stage = MtStage::Loading(key, reference);
                return Ok(read_node(reference.pba));
            }
            request.pba = Self::exchange(&mut state.walk, request.old, gens)?;
            state.exchanged = true;
            trace!("[MetaTree] granted pba {} for {:?}", request.pba, request.old);
        }

        if let Some((pba, block)) = state.walk.next_write(gens.curr)? {
            state.stage = MtStage::Writing;
            return Ok(write_node(pba, block));
        }
        request.meta_tree = *state.walk.root();
        Ok(Action::Complete)
    }

    /// Finds a leaf node with a spare entry for the caller and one for each
    /// of its path nodes that must move, and swaps the obsolete blocks in.
    fn exchange(
        walk: &mut TreeWalk,
        old: Option<(Pba, Generation)>,
        gens: Generations,
    ) -> Result<Pba> {
        let geometry = *walk.geometry();
        let degree = geometry.degree as u64;
        let retired = |block: Option<(Pba, Generation)>| match block {
            Some((pba, alloc_gen)) => Type2Node::free(pba, alloc_gen, gens.curr),
            None => Type2Node::empty(),
        };

        for index in 0..geometry.nodes_at_level(1) {
            let first = index * degree;
            let end = (first + degree).min(geometry.nr_of_leaves);
            let needed = 1 + walk.path_cost(first, gens.curr);
            let mut spare = Vec::with_capacity(needed);
            for unit in first..end {
                if walk
                    .entry::<Type2Node>(unit)?
                    .is_reclaimable(gens.last_secured, &[])
                {
                    spare.push(unit);
                    if spare.len() == needed {
                        break;
                    }
                }
            }
            if spare.len() < needed {
                continue;
            }

            walk.mark_path_dirty(first);
            let granted = walk.entry::<Type2Node>(spare[0])?.pba;
            walk.set_entry(spare[0], &retired(old))?;
            for (key, unit) in walk.nodes_needing_blocks(gens.curr).into_iter().zip(&spare[1..]) {
                let pba = walk.entry::<Type2Node>(*unit)?.pba;
                let obsolete = walk.obsolete(key);
                walk.assign_block(key, pba);
                walk.set_entry(*unit, &retired(obsolete))?;
            }
            return Ok(granted);
        }
        return_errno_with_msg!(OutOfDisk, "meta tree has no spare blocks")
    }
}

impl Default for MetaTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelModule for MetaTree {
    type State = MtState;

    const ID: ModuleId = ModuleId::MetaTree;

    fn channels(&self) -> &Channels<MtState> {
        &self.channels
    }

    fn channels_mut(&mut self) -> &mut Channels<MtState> {
        &mut self.channels
    }

    fn accept(&mut self, request: &mut ModuleRequest) -> MtState {
        let meta_tree = payload_of!(request.payload(), MetaTree).meta_tree;
        MtState {
            walk: TreeWalk::new(meta_tree),
            stage: MtStage::Start,
            exchanged: false,
        }
    }

    fn step(&mut self, channel: &mut Channel<MtState>) -> bool {
        channel.resume(
            |payload, state, response| {
                Self::advance(payload_of!(payload, MetaTree), state, response)
            },
            |payload, result| {
                let request = payload_of!(payload, MetaTree);
                if let Err(err) = &result {
                    warn!("[MetaTree] exchange of {:?} failed: {}", request.old, err);
                }
                request.success = result.is_ok();
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::tree::{TreeGeometry, testing::Rig};

    #[test]
    fn exchange_moves_the_leaf_with_its_own_spares() -> Result<()> {
        let mut rig = Rig::new();
        let spares: Vec<Pba> = (100..104).collect();
        let meta_tree = rig.build_free_list(TreeGeometry::new(1, 4, 4), &spares, &[])?;
        let gens = Generations {
            curr: 1,
            last_secured: 0,
        };

        let first = rig.exchange(MtRequest::exchange(None, meta_tree, gens))?;
        // One spare for the caller and one for the leaf node itself.
        assert_eq!(first.pba, 100);
        assert_ne!(first.meta_tree.root.pba, meta_tree.root.pba);
        assert_eq!(first.meta_tree.root.pba, 101);

        // The leaf now lives in the open generation and stays in place.
        let second = rig.exchange(MtRequest::exchange(Some((7, 0)), first.meta_tree, gens))?;
        assert_eq!(second.pba, 102);
        assert_eq!(second.meta_tree.root.pba, 101);

        let entries = rig.free_list(&second.meta_tree)?;
        assert_eq!(entries[0], Type2Node::empty());
        assert_eq!(entries[1], Type2Node::free(meta_tree.root.pba, 0, 1));
        assert_eq!(entries[2], Type2Node::free(7, 0, 1));
        assert!(entries[3].is_reclaimable(0, &[]));

        // Blocks retired in generation 1 are not reusable before it is
        // secured.
        let third = rig.exchange(MtRequest::exchange(None, second.meta_tree, gens))?;
        assert_eq!(third.pba, 103);
        assert!(
            rig.exchange(MtRequest::exchange(None, third.meta_tree, gens))
                .is_err()
        );
        Ok(())
    }
}

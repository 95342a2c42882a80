// SPDX-License-Identifier: MPL-2.0

use hashbrown::HashSet;

use super::{
    AllocContext, INVALID_GENERATION, INVALID_VBA, MtRequest, NodeKey, TreeWalk, Type1Node,
    Type2Node, Vba, node_read, node_written, read_node, write_node,
};
use crate::{
    dispatch::expect_response,
    layers::crypto::{INVALID_KEY_ID, KeyId},
    prelude::*,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FtOp {
    /// Frees obsolete blocks and grants reclaimable ones.
    Alloc,
    /// Appends free PBAs, at most up to the end of one leaf node.
    ExtendStep,
}

/// A request to the Free Tree module.
///
/// The roots in `ctx` are replaced with the updated ones on completion.
#[derive(Debug)]
pub struct FtRequest {
    pub op: FtOp,
    pub ctx: AllocContext,
    pub nr_of_blocks: usize,
    /// Blocks that stop being referenced in the open generation.
    pub freed: Vec<Pba>,
    /// The client data going to the first granted block, if any.
    pub data: Option<(Vba, KeyId)>,
    pub first_pba: Pba,
    /// The number of PBAs to append. Holds the number appended on
    /// completion.
    pub nr_of_pbas: u64,
    pub pbas: Vec<Pba>,
    pub success: bool,
}

impl FtRequest {
    pub fn alloc(
        ctx: AllocContext,
        nr_of_blocks: usize,
        freed: Vec<Pba>,
        data: Option<(Vba, KeyId)>,
    ) -> Self {
        Self {
            op: FtOp::Alloc,
            ctx,
            nr_of_blocks,
            freed,
            data,
            first_pba: INVALID_PBA,
            nr_of_pbas: 0,
            pbas: Vec::new(),
            success: false,
        }
    }

    pub fn extend_step(ctx: AllocContext, first_pba: Pba, nr_of_pbas: u64) -> Self {
        Self {
            op: FtOp::ExtendStep,
            first_pba,
            nr_of_pbas,
            ..Self::alloc(ctx, 0, Vec::new(), None)
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum FtStage {
    Start,
    Loading(NodeKey, Type1Node),
    Exchanging(NodeKey),
    Writing,
}

pub(crate) struct FtState {
    walk: TreeWalk,
    stage: FtStage,
    /// The first leaf an extension step appends.
    unit: u64,
    updated: bool,
}

/// The tree of Type-2 entries that tracks every block of the data pool.
///
/// It hands out blocks for copy-on-write updates of the VBD and records the
/// blocks those updates leave behind. The blocks of its own nodes are
/// exchanged with the meta tree.
pub struct FreeTree {
    channels: Channels<FtState>,
}

impl FreeTree {
    pub const NR_OF_CHANNELS: usize = 1;

    pub fn new() -> Self {
        Self {
            channels: Channels::new(ModuleId::FreeTree, Self::NR_OF_CHANNELS),
        }
    }

    fn advance(
        request: &mut FtRequest,
        state: &mut FtState,
        response: Option<Payload>,
    ) -> Result<Action> {
        let gens = request.ctx.gens;
        match state.stage {
            FtStage::Start if request.op == FtOp::ExtendStep => {
                if request.nr_of_pbas == 0 {
                    return Ok(Action::Complete);
                }
                let geometry = *state.walk.geometry();
                if geometry.nr_of_leaves == geometry.capacity() {
                    state.walk.grow()?;
                }
            }
            FtStage::Start => {}
            FtStage::Loading(key, reference) => {
                state.walk.insert_loaded(key, reference, node_read(response)?)?;
            }
            FtStage::Exchanging(key) => {
                let exchanged = payload_of!(expect_response(response), MetaTree);
                if !exchanged.success {
                    return_errno_with_msg!(OutOfDisk, "meta tree refused a node block");
                }
                state.walk.assign_block(key, exchanged.pba);
                request.ctx.meta_tree = exchanged.meta_tree;
            }
            FtStage::Writing => node_written(response)?,
        }

        if !state.updated {
            let next = match request.op {
                FtOp::Alloc => state.walk.next_to_load_all()?,
                FtOp::ExtendStep => state.walk.next_to_load(state.unit, true)?,
            };
            if let Some((key, reference)) = next {
                state.stage = FtStage::Loading(key, reference);
                return Ok(read_node(reference.pba));
            }
            match request.op {
                FtOp::Alloc => Self::allocate(&mut state.walk, request)?,
                FtOp::ExtendStep => Self::extend(&mut state.walk, request)?,
            }
            state.updated = true;
        }

        if let Some(&key) = state.walk.nodes_needing_blocks(gens.curr).first() {
            state.stage = FtStage::Exchanging(key);
            let old = state.walk.obsolete(key);
            return Ok(Action::Generate(Payload::MetaTree(MtRequest::exchange(
                old,
                request.ctx.meta_tree,
                gens,
            ))));
        }
        if let Some((pba, block)) = state.walk.next_write(gens.curr)? {
            state.stage = FtStage::Writing;
            return Ok(write_node(pba, block));
        }
        request.ctx.free_tree = *state.walk.root();
        Ok(Action::Complete)
    }

    fn allocate(walk: &mut TreeWalk, request: &mut FtRequest) -> Result<()> {
        let gens = request.ctx.gens;
        let mut freed: HashSet<Pba> = request.freed.iter().copied().collect();
        let mut granted = Vec::with_capacity(request.nr_of_blocks);

        for unit in 0..walk.geometry().nr_of_leaves {
            let mut entry = walk.entry::<Type2Node>(unit)?;
            if entry.free_gen == INVALID_GENERATION && freed.remove(&entry.pba) {
                entry.free_gen = gens.curr;
            } else if granted.len() < request.nr_of_blocks
                && entry.is_reclaimable(gens.last_secured, &request.ctx.snapshots)
            {
                let (last_vba, last_key_id) = match request.data {
                    Some(data) if granted.is_empty() => data,
                    _ => (INVALID_VBA, INVALID_KEY_ID),
                };
                entry.alloc_gen = gens.curr;
                entry.free_gen = INVALID_GENERATION;
                entry.last_vba = last_vba;
                entry.last_key_id = last_key_id;
                granted.push(entry.pba);
            } else {
                continue;
            }
            walk.set_entry(unit, &entry)?;
            walk.mark_path_dirty(unit);
        }

        if !freed.is_empty() {
            return_errno_with_msg!(NotFound, "freed block is not tracked");
        }
        if granted.len() < request.nr_of_blocks {
            return_errno_with_msg!(OutOfDisk, "too few reclaimable blocks");
        }
        trace!(
            "[FreeTree] granted {:?}, freed {:?} in generation {}",
            granted, request.freed, gens.curr
        );
        request.pbas = granted;
        Ok(())
    }

    fn extend(walk: &mut TreeWalk, request: &mut FtRequest) -> Result<()> {
        let geometry = *walk.geometry();
        let first_unit = geometry.nr_of_leaves;
        let degree = geometry.degree as u64;
        let added = request.nr_of_pbas.min(degree - first_unit % degree);
        // Appended blocks were never part of any generation.
        let secured = request.ctx.gens.last_secured;
        for index in 0..added {
            let entry = Type2Node::free(request.first_pba + index, secured, secured);
            walk.set_entry(first_unit + index, &entry)?;
        }
        walk.mark_path_dirty(first_unit);
        walk.set_nr_of_leaves(first_unit + added);
        debug!(
            "[FreeTree] appended pbas {}..{}",
            request.first_pba,
            request.first_pba + added
        );
        request.nr_of_pbas = added;
        Ok(())
    }
}

impl Default for FreeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelModule for FreeTree {
    type State = FtState;

    const ID: ModuleId = ModuleId::FreeTree;

    fn channels(&self) -> &Channels<FtState> {
        &self.channels
    }

    fn channels_mut(&mut self) -> &mut Channels<FtState> {
        &mut self.channels
    }

    fn accept(&mut self, request: &mut ModuleRequest) -> FtState {
        let free_tree = payload_of!(request.payload(), FreeTree).ctx.free_tree;
        FtState {
            walk: TreeWalk::new(free_tree),
            stage: FtStage::Start,
            unit: free_tree.geometry.nr_of_leaves,
            updated: false,
        }
    }

    fn step(&mut self, channel: &mut Channel<FtState>) -> bool {
        channel.resume(
            |payload, state, response| {
                Self::advance(payload_of!(payload, FreeTree), state, response)
            },
            |payload, result| {
                let request = payload_of!(payload, FreeTree);
                if let Err(err) = &result {
                    warn!("[FreeTree] {:?} failed: {}", request.op, err);
                }
                request.success = result.is_ok();
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::tree::{Generations, TreeGeometry, testing::Rig};

    fn context(rig: &mut Rig, free: &[Pba], in_use: &[Pba]) -> Result<AllocContext> {
        let free_tree = rig.build_free_list(TreeGeometry::new(2, 4, 8), free, in_use)?;
        let spares: Vec<Pba> = (3000..3032).collect();
        let meta_tree = rig.build_free_list(TreeGeometry::new(1, 32, 32), &spares, &[])?;
        Ok(AllocContext {
            free_tree,
            meta_tree,
            gens: Generations {
                curr: 1,
                last_secured: 0,
            },
            snapshots: Vec::new(),
        })
    }

    fn entry_of(rig: &Rig, ctx: &AllocContext, pba: Pba) -> Result<Type2Node> {
        rig.free_list(&ctx.free_tree)?
            .into_iter()
            .find(|entry| entry.pba == pba)
            .ok_or(Error::new(NotFound))
    }

    #[test]
    fn alloc_records_data_and_frees() -> Result<()> {
        let mut rig = Rig::new();
        let ctx = context(&mut rig, &[10, 11, 12], &[20])?;

        let done = rig.free_tree(FtRequest::alloc(ctx.clone(), 2, vec![20], Some((5, 1))))?;
        assert_eq!(done.pbas, vec![10, 11]);
        // Both touched leaf nodes and the top node moved to exchanged blocks.
        assert_ne!(done.ctx.free_tree.root.pba, ctx.free_tree.root.pba);
        assert_ne!(done.ctx.meta_tree, ctx.meta_tree);

        let data = entry_of(&rig, &done.ctx, 10)?;
        assert_eq!((data.last_vba, data.last_key_id, data.alloc_gen), (5, 1, 1));
        let node = entry_of(&rig, &done.ctx, 11)?;
        assert_eq!(node.last_vba, INVALID_VBA);
        assert_eq!(entry_of(&rig, &done.ctx, 20)?.free_gen, 1);

        // Only one reclaimable block is left.
        assert!(
            rig.free_tree(FtRequest::alloc(done.ctx.clone(), 2, Vec::new(), None))
                .is_err()
        );
        assert!(
            rig.free_tree(FtRequest::alloc(done.ctx.clone(), 1, vec![99], None))
                .is_err()
        );
        Ok(())
    }

    #[test]
    fn reclamation_waits_for_secured_generations_and_snapshots() -> Result<()> {
        let mut rig = Rig::new();
        let mut ctx = context(&mut rig, &[10], &[20])?;
        ctx = rig
            .free_tree(FtRequest::alloc(ctx, 1, vec![20], None))?
            .ctx;

        // 20 was freed in generation 1, which is not secured yet.
        ctx.gens = Generations {
            curr: 2,
            last_secured: 1,
        };
        ctx.snapshots = vec![0];
        assert!(
            rig.free_tree(FtRequest::alloc(ctx.clone(), 1, Vec::new(), None))
                .is_err()
        );

        ctx.snapshots.clear();
        let done = rig.free_tree(FtRequest::alloc(ctx, 1, Vec::new(), None))?;
        assert_eq!(done.pbas, vec![20]);
        let reused = entry_of(&rig, &done.ctx, 20)?;
        assert_eq!((reused.alloc_gen, reused.free_gen), (2, INVALID_GENERATION));
        Ok(())
    }

    #[test]
    fn extension_fills_the_leaf_node_then_grows() -> Result<()> {
        let mut rig = Rig::new();
        let mut ctx = context(&mut rig, &[10, 11, 12], &[])?;
        ctx.free_tree = rig.build_free_list(TreeGeometry::new(1, 4, 3), &[10, 11, 12], &[])?;

        let step = rig.free_tree(FtRequest::extend_step(ctx, 50, 6))?;
        assert_eq!(step.nr_of_pbas, 1);
        assert_eq!(step.ctx.free_tree.geometry.nr_of_leaves, 4);

        let step = rig.free_tree(FtRequest::extend_step(step.ctx, 51, 5))?;
        assert_eq!(step.nr_of_pbas, 4);
        let geometry = step.ctx.free_tree.geometry;
        assert_eq!((geometry.max_level_idx, geometry.nr_of_leaves), (2, 8));

        let entries = rig.free_list(&step.ctx.free_tree)?;
        let pbas: Vec<Pba> = entries.iter().map(|entry| entry.pba).collect();
        assert_eq!(pbas, vec![10, 11, 12, 50, 51, 52, 53, 54]);
        assert!(entries.iter().all(|entry| entry.is_reclaimable(0, &[])));

        let done = rig.free_tree(FtRequest::alloc(step.ctx, 8, Vec::new(), None))?;
        assert_eq!(done.pbas.len(), 8);
        Ok(())
    }
}

// SPDX-License-Identifier: MPL-2.0

use super::{
    AllocContext, FtRequest, NodeKey, TreeRoot, TreeWalk, Type1Node, Vba, node_read,
    node_written, read_node, write_node,
};
use crate::{
    dispatch::expect_response,
    layers::{
        bio::BlockIoRequest,
        crypto::{INVALID_KEY_ID, KeyId},
    },
    prelude::*,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VbdOp {
    ReadVba,
    WriteVba,
    /// Appends unwritten leaves, at most up to the end of one leaf node.
    ExtendStep,
}

/// A request to the VBD module.
///
/// Reads return the leaf entry and the verified data block, or no block if
/// the VBA was never written. Writes consume `block`, which is already
/// encrypted, and return the new leaf entry. Updating requests replace
/// `vbd` and the roots in `ctx` on completion.
#[derive(Debug)]
pub struct VbdRequest {
    pub op: VbdOp,
    pub vbd: TreeRoot,
    pub ctx: AllocContext,
    pub vba: Vba,
    pub key_id: KeyId,
    /// Moves the data to a fresh block even if it was written in the open
    /// generation.
    pub relocate: bool,
    pub block: Option<Block>,
    pub leaf: Type1Node,
    /// The number of leaves to append. Holds the number appended on
    /// completion.
    pub nr_of_leaves: u64,
    pub success: bool,
}

impl VbdRequest {
    pub fn read(vbd: TreeRoot, vba: Vba) -> Self {
        Self {
            op: VbdOp::ReadVba,
            vbd,
            ctx: AllocContext::default(),
            vba,
            key_id: INVALID_KEY_ID,
            relocate: false,
            block: None,
            leaf: Type1Node::default(),
            nr_of_leaves: 0,
            success: false,
        }
    }

    pub fn write(
        vbd: TreeRoot,
        ctx: AllocContext,
        vba: Vba,
        key_id: KeyId,
        block: Block,
        relocate: bool,
    ) -> Self {
        Self {
            op: VbdOp::WriteVba,
            ctx,
            key_id,
            relocate,
            block: Some(block),
            ..Self::read(vbd, vba)
        }
    }

    pub fn extend_step(vbd: TreeRoot, ctx: AllocContext, nr_of_leaves: u64) -> Self {
        Self {
            op: VbdOp::ExtendStep,
            ctx,
            nr_of_leaves,
            ..Self::read(vbd, 0)
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum VbdStage {
    Start,
    Loading(NodeKey, Type1Node),
    ReadingData,
    Allocating,
    WritingData,
    WritingNodes,
}

pub(crate) struct VbdState {
    walk: TreeWalk,
    stage: VbdStage,
    unit: u64,
    updated: bool,
    /// The nodes that wait for a block from the free tree, bottom-up.
    nodes: Vec<NodeKey>,
    data_pba: Option<Pba>,
    data_written: bool,
}

/// The Merkle tree that maps VBAs to the blocks holding their data.
pub struct Vbd {
    channels: Channels<VbdState>,
}

impl Vbd {
    pub const NR_OF_CHANNELS: usize = 1;

    pub fn new() -> Self {
        Self {
            channels: Channels::new(ModuleId::Vbd, Self::NR_OF_CHANNELS),
        }
    }

    fn advance(
        request: &mut VbdRequest,
        state: &mut VbdState,
        response: Option<Payload>,
    ) -> Result<Action> {
        let curr = request.ctx.gens.curr;
        match state.stage {
            VbdStage::Start => {
                let geometry = *state.walk.geometry();
                if request.op != VbdOp::ExtendStep {
                    if request.vba >= geometry.nr_of_leaves {
                        return_errno_with_msg!(InvalidArgs, "vba beyond the end of the device");
                    }
                } else if request.nr_of_leaves == 0 {
                    return Ok(Action::Complete);
                } else if geometry.nr_of_leaves == geometry.capacity() {
                    state.walk.grow()?;
                }
            }
            VbdStage::Loading(key, reference) => {
                state.walk.insert_loaded(key, reference, node_read(response)?)?;
            }
            VbdStage::ReadingData => {
                let block = payload_of!(expect_response(response), BlockIo)
                    .into_result()?
                    .ok_or(Error::with_msg(IoFailed, "data read returned no block"))?;
                if block.hash() != request.leaf.hash {
                    return_errno_with_msg!(IntegrityViolation, "data block does not match its hash");
                }
                request.block = Some(block);
                return Ok(Action::Complete);
            }
            VbdStage::Allocating => {
                let allocated = payload_of!(expect_response(response), FreeTree);
                if !allocated.success {
                    return_errno_with_msg!(OutOfDisk, "no blocks for the update");
                }
                request.ctx = allocated.ctx;
                let mut pbas = allocated.pbas.into_iter();
                if request.op == VbdOp::WriteVba && state.data_pba.is_none() {
                    state.data_pba = pbas.next();
                }
                for (key, pba) in state.nodes.iter().zip(pbas) {
                    state.walk.assign_block(*key, pba);
                }
            }
            VbdStage::WritingData => {
                payload_of!(expect_response(response), BlockIo).into_result()?;
                state.data_written = true;
            }
            VbdStage::WritingNodes => node_written(response)?,
        }

        if !state.updated {
            let create_missing = request.op == VbdOp::ExtendStep;
            if let Some((key, reference)) = state.walk.next_to_load(state.unit, create_missing)? {
                state.stage = VbdStage::Loading(key, reference);
                return Ok(read_node(reference.pba));
            }
            state.updated = true;
            let (nr_of_blocks, freed, data) = match request.op {
                VbdOp::ReadVba => {
                    request.leaf = state.walk.entry(state.unit)?;
                    if !request.leaf.is_valid() {
                        return Ok(Action::Complete);
                    }
                    state.stage = VbdStage::ReadingData;
                    return Ok(Action::Generate(Payload::BlockIo(BlockIoRequest::read(
                        request.leaf.pba,
                    ))));
                }
                VbdOp::WriteVba => Self::prepare_write(request, state)?,
                VbdOp::ExtendStep => Self::prepare_extend(request, state),
            };
            if nr_of_blocks > 0 {
                state.stage = VbdStage::Allocating;
                return Ok(Action::Generate(Payload::FreeTree(FtRequest::alloc(
                    request.ctx.clone(),
                    nr_of_blocks,
                    freed,
                    data,
                ))));
            }
        }

        if request.op == VbdOp::WriteVba && !state.data_written {
            let Some(pba) = state.data_pba else {
                return_errno_with_msg!(OutOfDisk, "no block for the data");
            };
            let Some(block) = request.block.take() else {
                return_errno_with_msg!(InvalidArgs, "write without data");
            };
            request.leaf = Type1Node::new(pba, curr, block.hash());
            state.walk.set_entry(state.unit, &request.leaf)?;
            state.stage = VbdStage::WritingData;
            return Ok(Action::Generate(Payload::BlockIo(BlockIoRequest::write(
                pba, block,
            ))));
        }
        if let Some((pba, block)) = state.walk.next_write(curr)? {
            state.stage = VbdStage::WritingNodes;
            return Ok(write_node(pba, block));
        }
        request.vbd = *state.walk.root();
        Ok(Action::Complete)
    }

    /// Decides where the data goes and which blocks the write leaves
    /// behind. Returns the number of blocks to allocate, the freed blocks
    /// and the data the first block will hold.
    fn prepare_write(
        request: &VbdRequest,
        state: &mut VbdState,
    ) -> Result<(usize, Vec<Pba>, Option<(Vba, KeyId)>)> {
        let curr = request.ctx.gens.curr;
        let leaf = state.walk.entry::<Type1Node>(request.vba)?;
        let in_place = !request.relocate && leaf.is_valid() && leaf.generation == curr;

        state.walk.mark_path_dirty(request.vba);
        state.nodes = state.walk.nodes_needing_blocks(curr);
        let mut freed: Vec<Pba> = state
            .nodes
            .iter()
            .filter_map(|key| state.walk.obsolete(*key))
            .map(|(pba, _)| pba)
            .collect();
        if in_place {
            state.data_pba = Some(leaf.pba);
        } else if leaf.is_valid() {
            freed.push(leaf.pba);
        }
        trace!(
            "[Vbd] write vba {}: {} nodes to move, in place {}",
            request.vba,
            state.nodes.len(),
            in_place
        );
        Ok((
            state.nodes.len() + usize::from(!in_place),
            freed,
            (!in_place).then_some((request.vba, request.key_id)),
        ))
    }

    fn prepare_extend(
        request: &mut VbdRequest,
        state: &mut VbdState,
    ) -> (usize, Vec<Pba>, Option<(Vba, KeyId)>) {
        let curr = request.ctx.gens.curr;
        let geometry = *state.walk.geometry();
        let first = geometry.nr_of_leaves;
        let degree = geometry.degree as u64;
        let added = request.nr_of_leaves.min(degree - first % degree);

        // Leaves appended to an existing leaf node change no node.
        if first % degree == 0 {
            state.walk.mark_path_dirty(first);
        }
        state.walk.set_nr_of_leaves(first + added);
        request.nr_of_leaves = added;
        state.nodes = state.walk.nodes_needing_blocks(curr);
        let freed = state
            .nodes
            .iter()
            .filter_map(|key| state.walk.obsolete(*key))
            .map(|(pba, _)| pba)
            .collect();
        debug!("[Vbd] appended leaves {}..{}", first, first + added);
        (state.nodes.len(), freed, None)
    }
}

impl Default for Vbd {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelModule for Vbd {
    type State = VbdState;

    const ID: ModuleId = ModuleId::Vbd;

    fn channels(&self) -> &Channels<VbdState> {
        &self.channels
    }

    fn channels_mut(&mut self) -> &mut Channels<VbdState> {
        &mut self.channels
    }

    fn accept(&mut self, request: &mut ModuleRequest) -> VbdState {
        let request = payload_of!(request.payload(), Vbd);
        let unit = match request.op {
            VbdOp::ExtendStep => request.vbd.geometry.nr_of_leaves,
            VbdOp::ReadVba | VbdOp::WriteVba => request.vba,
        };
        VbdState {
            walk: TreeWalk::new(request.vbd),
            stage: VbdStage::Start,
            unit,
            updated: false,
            nodes: Vec::new(),
            data_pba: None,
            data_written: false,
        }
    }

    fn step(&mut self, channel: &mut Channel<VbdState>) -> bool {
        channel.resume(
            |payload, state, response| Self::advance(payload_of!(payload, Vbd), state, response),
            |payload, result| {
                let request = payload_of!(payload, Vbd);
                if let Err(err) = &result {
                    warn!("[Vbd] {:?} of vba {} failed: {}", request.op, request.vba, err);
                }
                request.success = result.is_ok();
            },
        )
    }
}

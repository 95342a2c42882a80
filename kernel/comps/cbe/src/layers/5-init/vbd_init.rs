// SPDX-License-Identifier: MPL-2.0

use super::{alloc, allocated, block_written, write_next};
use crate::{
    layers::tree::{TreeBuilder, TreeGeometry, TreeRoot, Type1Node},
    prelude::*,
};

/// A request to lay out an empty VBD of `geometry`.
#[derive(Debug)]
pub struct VbdInitRequest {
    pub geometry: TreeGeometry,
    pub root: TreeRoot,
    /// The node blocks occupy `nr_of_blocks` PBAs from here on.
    pub first_pba: Pba,
    pub nr_of_blocks: u64,
    pub success: bool,
    pub error: Option<Error>,
}

impl VbdInitRequest {
    pub fn new(geometry: TreeGeometry) -> Self {
        Self {
            geometry,
            root: TreeRoot::default(),
            first_pba: INVALID_PBA,
            nr_of_blocks: 0,
            success: false,
            error: None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum VbdInitStage {
    Start,
    Allocating,
    Writing,
}

pub(crate) struct VbdInitState {
    stage: VbdInitStage,
    blocks: Vec<(Pba, Block)>,
}

/// Builds a VBD whose leaves are all unwritten.
pub struct VbdInitializer {
    channels: Channels<VbdInitState>,
}

impl VbdInitializer {
    pub const NR_OF_CHANNELS: usize = 1;

    pub fn new() -> Self {
        Self {
            channels: Channels::new(ModuleId::VbdInitializer, Self::NR_OF_CHANNELS),
        }
    }

    fn advance(
        request: &mut VbdInitRequest,
        state: &mut VbdInitState,
        response: Option<Payload>,
    ) -> Result<Action> {
        match state.stage {
            VbdInitStage::Start => {
                request.geometry.validate()?;
                request.nr_of_blocks = request.geometry.nr_of_nodes();
                state.stage = VbdInitStage::Allocating;
                Ok(alloc(request.nr_of_blocks))
            }
            VbdInitStage::Allocating => {
                request.first_pba = allocated(response)?;
                let builder = TreeBuilder::new(request.geometry, request.first_pba);
                let (root, blocks) = builder.build(|_| Type1Node::default())?;
                request.root = root;
                state.blocks = blocks;
                state.stage = VbdInitStage::Writing;
                Ok(write_next(&mut state.blocks))
            }
            VbdInitStage::Writing => {
                block_written(response)?;
                Ok(write_next(&mut state.blocks))
            }
        }
    }
}

impl Default for VbdInitializer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelModule for VbdInitializer {
    type State = VbdInitState;

    const ID: ModuleId = ModuleId::VbdInitializer;

    fn channels(&self) -> &Channels<VbdInitState> {
        &self.channels
    }

    fn channels_mut(&mut self) -> &mut Channels<VbdInitState> {
        &mut self.channels
    }

    fn accept(&mut self, _request: &mut ModuleRequest) -> VbdInitState {
        VbdInitState {
            stage: VbdInitStage::Start,
            blocks: Vec::new(),
        }
    }

    fn step(&mut self, channel: &mut Channel<VbdInitState>) -> bool {
        channel.resume(
            |payload, state, response| {
                Self::advance(payload_of!(payload, VbdInitializer), state, response)
            },
            |payload, result| {
                let request = payload_of!(payload, VbdInitializer);
                match &result {
                    Ok(()) => debug!(
                        "[VbdInitializer] {} nodes at pba {}",
                        request.nr_of_blocks, request.first_pba
                    ),
                    Err(err) => warn!("[VbdInitializer] {:?}: {}", request.geometry, err),
                }
                request.success = result.is_ok();
                request.error = result.err();
            },
        )
    }
}

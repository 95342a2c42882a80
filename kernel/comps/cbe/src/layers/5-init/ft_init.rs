// SPDX-License-Identifier: MPL-2.0

use super::{alloc, allocated, block_written, write_next};
use crate::{
    layers::tree::{TreeBuilder, TreeGeometry, TreeRoot, Type2Node},
    prelude::*,
};

/// A request to lay out a free list with `geometry.nr_of_leaves` spare
/// blocks.
///
/// The first `in_use_count` entries track the blocks from `in_use_first`
/// on as in use. The spare entries follow, each with a freshly allocated
/// block.
#[derive(Debug)]
pub struct FtInitRequest {
    pub geometry: TreeGeometry,
    pub in_use_first: Pba,
    pub in_use_count: u64,
    pub root: TreeRoot,
    pub success: bool,
    pub error: Option<Error>,
}

impl FtInitRequest {
    pub fn new(geometry: TreeGeometry, in_use_first: Pba, in_use_count: u64) -> Self {
        Self {
            geometry,
            in_use_first,
            in_use_count,
            root: TreeRoot::default(),
            success: false,
            error: None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FtInitStage {
    Start,
    AllocatingNodes(TreeGeometry),
    AllocatingSpares {
        layout: TreeGeometry,
        first_node: Pba,
    },
    Writing,
}

pub(crate) struct FtInitState {
    stage: FtInitStage,
    blocks: Vec<(Pba, Block)>,
}

/// Builds the free tree or the meta tree of a new volume.
pub struct FtInitializer {
    channels: Channels<FtInitState>,
}

impl FtInitializer {
    pub const NR_OF_CHANNELS: usize = 1;

    pub fn new() -> Self {
        Self {
            channels: Channels::new(ModuleId::FtInitializer, Self::NR_OF_CHANNELS),
        }
    }

    fn advance(
        request: &mut FtInitRequest,
        state: &mut FtInitState,
        response: Option<Payload>,
    ) -> Result<Action> {
        match state.stage {
            FtInitStage::Start => {
                request.geometry.validate()?;
                let layout = TreeGeometry {
                    nr_of_leaves: request.geometry.nr_of_leaves + request.in_use_count,
                    ..request.geometry
                };
                layout.validate()?;
                state.stage = FtInitStage::AllocatingNodes(layout);
                Ok(alloc(layout.nr_of_nodes()))
            }
            FtInitStage::AllocatingNodes(layout) => {
                let first_node = allocated(response)?;
                state.stage = FtInitStage::AllocatingSpares { layout, first_node };
                Ok(alloc(request.geometry.nr_of_leaves))
            }
            FtInitStage::AllocatingSpares { layout, first_node } => {
                let first_spare = allocated(response)?;
                let (in_use_first, in_use_count) = (request.in_use_first, request.in_use_count);
                let (root, blocks) =
                    TreeBuilder::new(layout, first_node).build(|unit| {
                        match unit < in_use_count {
                            true => Type2Node::in_use(in_use_first + unit, 0),
                            false => Type2Node::free(first_spare + unit - in_use_count, 0, 0),
                        }
                    })?;
                request.root = root;
                state.blocks = blocks;
                state.stage = FtInitStage::Writing;
                Ok(write_next(&mut state.blocks))
            }
            FtInitStage::Writing => {
                block_written(response)?;
                Ok(write_next(&mut state.blocks))
            }
        }
    }
}

impl Default for FtInitializer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelModule for FtInitializer {
    type State = FtInitState;

    const ID: ModuleId = ModuleId::FtInitializer;

    fn channels(&self) -> &Channels<FtInitState> {
        &self.channels
    }

    fn channels_mut(&mut self) -> &mut Channels<FtInitState> {
        &mut self.channels
    }

    fn accept(&mut self, _request: &mut ModuleRequest) -> FtInitState {
        FtInitState {
            stage: FtInitStage::Start,
            blocks: Vec::new(),
        }
    }

    fn step(&mut self, channel: &mut Channel<FtInitState>) -> bool {
        channel.resume(
            |payload, state, response| {
                Self::advance(payload_of!(payload, FtInitializer), state, response)
            },
            |payload, result| {
                let request = payload_of!(payload, FtInitializer);
                if let Err(err) = &result {
                    warn!("[FtInitializer] {:?}: {}", request.geometry, err);
                }
                request.success = result.is_ok();
                request.error = result.err();
            },
        )
    }
}

// SPDX-License-Identifier: MPL-2.0

use super::{alloc, allocated, block_written};
use crate::{
    dispatch::expect_response,
    layers::{
        bio::BlockIoRequest,
        control::{KeyEntry, Superblock, SuperblockState},
        crypto::{KeyId, TrustAnchorRequest},
        init::{FtInitRequest, VbdInitRequest},
        tree::TreeGeometry,
    },
    prelude::*,
};

/// A request to format a blank volume.
///
/// The superblock slots take the PBAs from 0 to `nr_of_superblock_slots`.
/// The trees and their spare blocks follow.
#[derive(Debug)]
pub struct FormatRequest {
    pub vbd: TreeGeometry,
    pub free_tree: TreeGeometry,
    pub meta_tree: TreeGeometry,
    pub nr_of_superblock_slots: u64,
    /// The superblock sealed in slot 0.
    pub superblock: Option<Superblock>,
    pub success: bool,
    /// Why the format failed.
    pub error: Option<Error>,
}

impl FormatRequest {
    pub fn new(
        vbd: TreeGeometry,
        free_tree: TreeGeometry,
        meta_tree: TreeGeometry,
        nr_of_superblock_slots: u64,
    ) -> Self {
        Self {
            vbd,
            free_tree,
            meta_tree,
            nr_of_superblock_slots,
            superblock: None,
            success: false,
            error: None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SbInitStage {
    Start,
    InitializingVbd,
    InitializingFt,
    InitializingMt,
    CreatingKey,
    WrappingKey,
    QueryingWatermark,
    WritingSlot(u64),
    Syncing,
    Securing,
}

pub(crate) struct SbInitState {
    stage: SbInitStage,
    sb: Superblock,
    hash: Hash,
}

/// Formats a volume by driving the other initializers, then seals the
/// first superblock.
pub struct SbInitializer {
    channels: Channels<SbInitState>,
}

impl SbInitializer {
    pub const NR_OF_CHANNELS: usize = 1;

    /// The id of the key a new volume is encrypted with.
    pub const FIRST_KEY_ID: KeyId = 1;

    pub fn new() -> Self {
        Self {
            channels: Channels::new(ModuleId::SbInitializer, Self::NR_OF_CHANNELS),
        }
    }

    fn advance(
        request: &mut FormatRequest,
        state: &mut SbInitState,
        response: Option<Payload>,
    ) -> Result<Action> {
        match state.stage {
            SbInitStage::Start => {
                if request.nr_of_superblock_slots < 2 {
                    return_errno_with_msg!(InvalidArgs, "at least two superblock slots needed");
                }
                state.stage = SbInitStage::InitializingVbd;
                Ok(Action::Generate(Payload::VbdInitializer(VbdInitRequest::new(
                    request.vbd,
                ))))
            }
            SbInitStage::InitializingVbd => {
                let vbd = payload_of!(expect_response(response), VbdInitializer);
                if !vbd.success {
                    return Err(vbd
                        .error
                        .unwrap_or(Error::with_msg(OutOfDisk, "vbd initialization failed")));
                }
                state.sb.vbd = vbd.root;
                state.stage = SbInitStage::InitializingFt;
                Ok(Action::Generate(Payload::FtInitializer(FtInitRequest::new(
                    request.free_tree,
                    vbd.first_pba,
                    vbd.nr_of_blocks,
                ))))
            }
            SbInitStage::InitializingFt => {
                let free_tree = payload_of!(expect_response(response), FtInitializer);
                if !free_tree.success {
                    return Err(free_tree
                        .error
                        .unwrap_or(Error::with_msg(OutOfDisk, "free tree initialization failed")));
                }
                state.sb.free_tree = free_tree.root;
                state.stage = SbInitStage::InitializingMt;
                Ok(Action::Generate(Payload::FtInitializer(FtInitRequest::new(
                    request.meta_tree,
                    INVALID_PBA,
                    0,
                ))))
            }
            SbInitStage::InitializingMt => {
                let meta_tree = payload_of!(expect_response(response), FtInitializer);
                if !meta_tree.success {
                    return Err(meta_tree
                        .error
                        .unwrap_or(Error::with_msg(OutOfDisk, "meta tree initialization failed")));
                }
                state.sb.meta_tree = meta_tree.root;
                state.stage = SbInitStage::CreatingKey;
                Ok(Action::Generate(Payload::TrustAnchor(
                    TrustAnchorRequest::create_key(),
                )))
            }
            SbInitStage::CreatingKey => {
                let answer = payload_of!(expect_response(response), TrustAnchor);
                let Some(key) = answer.key.filter(|_| answer.success) else {
                    return_errno_with_msg!(InvalidArgs, "trust anchor created no key");
                };
                state.stage = SbInitStage::WrappingKey;
                Ok(Action::Generate(Payload::TrustAnchor(
                    TrustAnchorRequest::encrypt_key(key),
                )))
            }
            SbInitStage::WrappingKey => {
                let answer = payload_of!(expect_response(response), TrustAnchor);
                let Some(sealed) = answer.sealed_key.filter(|_| answer.success) else {
                    return_errno_with_msg!(EncryptFailed, "trust anchor cannot wrap the key");
                };
                state.sb.current_key = KeyEntry {
                    id: Self::FIRST_KEY_ID,
                    sealed,
                };
                state.stage = SbInitStage::QueryingWatermark;
                Ok(alloc(0))
            }
            SbInitStage::QueryingWatermark => {
                state.sb.nr_of_pbas = allocated(response)?;
                state.sb.state = SuperblockState::Normal;
                state.sb.generation = 0;
                let block = state.sb.encode()?;
                state.hash = block.hash();
                state.stage = SbInitStage::WritingSlot(0);
                Ok(Action::Generate(Payload::BlockIo(BlockIoRequest::write(
                    0, block,
                ))))
            }
            SbInitStage::WritingSlot(slot) => {
                block_written(response)?;
                let next = slot + 1;
                if next < request.nr_of_superblock_slots {
                    state.stage = SbInitStage::WritingSlot(next);
                    return Ok(Action::Generate(Payload::BlockIo(BlockIoRequest::write(
                        next,
                        Block::new_zeroed(),
                    ))));
                }
                state.stage = SbInitStage::Syncing;
                Ok(Action::Generate(Payload::BlockIo(BlockIoRequest::sync())))
            }
            SbInitStage::Syncing => {
                block_written(response)?;
                state.stage = SbInitStage::Securing;
                Ok(Action::Generate(Payload::TrustAnchor(
                    TrustAnchorRequest::secure_superblock(state.hash),
                )))
            }
            SbInitStage::Securing => {
                if !payload_of!(expect_response(response), TrustAnchor).success {
                    return_errno_with_msg!(IoFailed, "trust anchor did not secure the superblock");
                }
                request.superblock = Some(state.sb.clone());
                Ok(Action::Complete)
            }
        }
    }
}

impl Default for SbInitializer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelModule for SbInitializer {
    type State = SbInitState;

    const ID: ModuleId = ModuleId::SbInitializer;

    fn channels(&self) -> &Channels<SbInitState> {
        &self.channels
    }

    fn channels_mut(&mut self) -> &mut Channels<SbInitState> {
        &mut self.channels
    }

    fn accept(&mut self, _request: &mut ModuleRequest) -> SbInitState {
        SbInitState {
            stage: SbInitStage::Start,
            sb: Superblock::default(),
            hash: Hash::default(),
        }
    }

    fn step(&mut self, channel: &mut Channel<SbInitState>) -> bool {
        channel.resume(
            |payload, state, response| {
                Self::advance(payload_of!(payload, SbInitializer), state, response)
            },
            |payload, result| {
                let request = payload_of!(payload, SbInitializer);
                match &result {
                    Ok(()) => info!(
                        "[SbInitializer] volume formatted with {} leaves",
                        request.vbd.nr_of_leaves
                    ),
                    Err(err) => warn!("[SbInitializer] format failed: {}", err),
                }
                request.success = result.is_ok();
                request.error = result.err();
            },
        )
    }
}

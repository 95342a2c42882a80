// SPDX-License-Identifier: MPL-2.0

use super::BlockDevice;
use crate::prelude::*;

/// The type of a Block I/O request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockIoOp {
    Read,
    Write,
    Sync,
    /// Reports the size of the device.
    Size,
}

/// A request to the Block I/O module.
///
/// A read returns the block in `block`; a write consumes it.
#[derive(Debug)]
pub struct BlockIoRequest {
    pub op: BlockIoOp,
    pub pba: Pba,
    pub block: Option<Block>,
    /// The number of blocks of the device, set by `Size`.
    pub nr_of_blocks: u64,
    pub success: bool,
}

impl BlockIoRequest {
    pub fn read(pba: Pba) -> Self {
        Self {
            op: BlockIoOp::Read,
            pba,
            block: None,
            nr_of_blocks: 0,
            success: false,
        }
    }

    pub fn write(pba: Pba, block: Block) -> Self {
        Self {
            op: BlockIoOp::Write,
            pba,
            block: Some(block),
            nr_of_blocks: 0,
            success: false,
        }
    }

    pub fn sync() -> Self {
        Self {
            op: BlockIoOp::Sync,
            ..Self::read(INVALID_PBA)
        }
    }

    pub fn size() -> Self {
        Self {
            op: BlockIoOp::Size,
            ..Self::read(INVALID_PBA)
        }
    }

    /// Turns a completed request into its outcome, the block read if any.
    pub(crate) fn into_result(self) -> Result<Option<Block>> {
        if !self.success {
            return_errno_with_msg!(IoFailed, "block I/O failed");
        }
        Ok(self.block)
    }
}

/// The module that wraps the external block device.
///
/// The device is driven synchronously, so every request completes in the
/// step that picks it up.
pub struct BlockIo<D> {
    device: D,
    channels: Channels<()>,
}

impl<D: BlockDevice> BlockIo<D> {
    pub const NR_OF_CHANNELS: usize = 8;

    pub fn new(device: D) -> Self {
        Self {
            device,
            channels: Channels::new(ModuleId::BlockIo, Self::NR_OF_CHANNELS),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }

    fn handle(&mut self, request: &mut BlockIoRequest) -> Result<()> {
        match request.op {
            BlockIoOp::Read => {
                let mut block = Block::new_zeroed();
                self.device.read(request.pba, block.as_mut_slice())?;
                request.block = Some(block);
            }
            BlockIoOp::Write => {
                let Some(block) = request.block.take() else {
                    return_errno_with_msg!(InvalidArgs, "write without a block");
                };
                self.device.write(request.pba, block.as_slice())?;
            }
            BlockIoOp::Sync => self.device.sync()?,
            BlockIoOp::Size => request.nr_of_blocks = self.device.nr_of_blocks(),
        }
        Ok(())
    }
}

impl<D: BlockDevice> ChannelModule for BlockIo<D> {
    type State = ();

    const ID: ModuleId = ModuleId::BlockIo;

    fn channels(&self) -> &Channels<()> {
        &self.channels
    }

    fn channels_mut(&mut self) -> &mut Channels<()> {
        &mut self.channels
    }

    fn accept(&mut self, _request: &mut ModuleRequest) {}

    fn step(&mut self, channel: &mut Channel<()>) -> bool {
        let request = payload_of!(channel.payload_mut(), BlockIo);
        match self.handle(request) {
            Ok(()) => request.success = true,
            Err(err) => {
                warn!(
                    "[BlockIo] {:?} of pba {} failed: {}",
                    request.op, request.pba, err
                );
                request.success = false;
            }
        }
        channel.complete();
        true
    }
}

// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

/// A request for `nr_of_blocks` contiguous blocks. The first one is
/// returned in `first_pba`. Asking for zero blocks returns the watermark.
#[derive(Debug)]
pub struct AllocRequest {
    pub nr_of_blocks: u64,
    pub first_pba: Pba,
    pub success: bool,
}

impl AllocRequest {
    pub fn new(nr_of_blocks: u64) -> Self {
        Self {
            nr_of_blocks,
            first_pba: INVALID_PBA,
            success: false,
        }
    }
}

/// Hands out the blocks of a blank device in ascending order while a
/// volume is formatted. Blocks are never given back.
pub struct BlockAllocator {
    next: Pba,
    limit: Pba,
    channels: Channels<()>,
}

impl BlockAllocator {
    pub const NR_OF_CHANNELS: usize = 1;

    /// Allocates from `first` up to, excluding, `limit`.
    pub fn new(first: Pba, limit: Pba) -> Self {
        Self {
            next: first,
            limit,
            channels: Channels::new(ModuleId::BlockAllocator, Self::NR_OF_CHANNELS),
        }
    }

    /// The first block that was never handed out.
    pub fn watermark(&self) -> Pba {
        self.next
    }

    fn alloc(&mut self, nr_of_blocks: u64) -> Result<Pba> {
        let first = self.next;
        match first.checked_add(nr_of_blocks) {
            Some(end) if end <= self.limit => {
                self.next = end;
                Ok(first)
            }
            _ => return_errno_with_msg!(OutOfDisk, "device too small for the volume"),
        }
    }
}

impl ChannelModule for BlockAllocator {
    type State = ();

    const ID: ModuleId = ModuleId::BlockAllocator;

    fn channels(&self) -> &Channels<()> {
        &self.channels
    }

    fn channels_mut(&mut self) -> &mut Channels<()> {
        &mut self.channels
    }

    fn accept(&mut self, _request: &mut ModuleRequest) {}

    fn step(&mut self, channel: &mut Channel<()>) -> bool {
        let nr_of_blocks = payload_of!(channel.payload(), BlockAllocator).nr_of_blocks;
        let result = self.alloc(nr_of_blocks);
        let request = payload_of!(channel.payload_mut(), BlockAllocator);
        match result {
            Ok(first) => {
                trace!("[BlockAllocator] {} blocks at pba {}", nr_of_blocks, first);
                request.first_pba = first;
                request.success = true;
            }
            Err(err) => {
                warn!("[BlockAllocator] {} blocks: {}", nr_of_blocks, err);
                request.success = false;
            }
        }
        channel.complete();
        true
    }
}

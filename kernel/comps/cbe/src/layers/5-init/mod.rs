// SPDX-License-Identifier: MPL-2.0

//! The layer of one-shot initializers that format a blank volume.

mod ft_init;
mod sb_init;
mod vbd_init;

pub use self::{
    ft_init::{FtInitRequest, FtInitializer},
    sb_init::{FormatRequest, SbInitializer},
    vbd_init::{VbdInitRequest, VbdInitializer},
};
use crate::{
    dispatch::expect_response,
    layers::{bio::BlockIoRequest, tree::AllocRequest},
    prelude::*,
};

fn alloc(nr_of_blocks: u64) -> Action {
    Action::Generate(Payload::BlockAllocator(AllocRequest::new(nr_of_blocks)))
}

/// Takes the first PBA out of a completed allocation.
fn allocated(response: Option<Payload>) -> Result<Pba> {
    let allocated = payload_of!(expect_response(response), BlockAllocator);
    if !allocated.success {
        return_errno_with_msg!(OutOfDisk, "device too small for the volume");
    }
    Ok(allocated.first_pba)
}

/// Writes the next of `blocks` straight to the device, or completes.
fn write_next(blocks: &mut Vec<(Pba, Block)>) -> Action {
    match blocks.pop() {
        Some((pba, block)) => Action::Generate(Payload::BlockIo(BlockIoRequest::write(pba, block))),
        None => Action::Complete,
    }
}

fn block_written(response: Option<Payload>) -> Result<()> {
    payload_of!(expect_response(response), BlockIo)
        .into_result()
        .map(|_| ())
}

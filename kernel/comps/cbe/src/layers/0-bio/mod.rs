// SPDX-License-Identifier: MPL-2.0

//! The layer of untrusted block I/O.

mod block;
mod block_io;
mod device;

pub use self::{
    block::{BLOCK_SIZE, Block, INVALID_PBA, Pba},
    block_io::{BlockIo, BlockIoOp, BlockIoRequest},
    device::{BlockDevice, MemDisk},
};

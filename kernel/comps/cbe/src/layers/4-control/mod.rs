// SPDX-License-Identifier: MPL-2.0

//! The layer of control: client requests and the superblock.

mod request;
mod request_pool;
mod sb_control;
mod superblock;

pub use self::{
    request::{Operation, Request, Tag},
    request_pool::RequestPool,
    sb_control::{SbControl, SbControlOp, SbControlRequest},
    superblock::{KeyEntry, Snapshot, SnapshotId, Superblock, SuperblockState},
};

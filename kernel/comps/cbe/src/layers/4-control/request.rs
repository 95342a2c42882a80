// SPDX-License-Identifier: MPL-2.0

use super::SnapshotId;
use crate::{
    layers::{crypto::KeyId, tree::Vba},
    prelude::*,
};

/// The operation of a client request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Operation {
    Read,
    Write,
    Sync,
    CreateSnapshot,
    DiscardSnapshot,
    Rekey,
    ExtendVbd,
    ExtendFt,
    ResumeRekeying,
    /// Mounts a formatted volume.
    Initialize,
    Deinitialize,
}

/// Matches a completed request to the one submitted.
pub type Tag = u64;

/// A client request.
///
/// Reads and writes cover `count` blocks from `block_number` on, with
/// `data` holding `count * BLOCK_SIZE` bytes. The extensions take the
/// number of leaves or PBAs to add in `count`.
#[derive(Debug)]
pub struct Request {
    pub operation: Operation,
    pub block_number: Vba,
    pub count: u64,
    /// The key the volume is encrypted with after a completed rekeying.
    pub key_id: KeyId,
    pub tag: Tag,
    pub success: bool,
    pub data: Vec<u8>,
    pub snapshot_id: Option<SnapshotId>,
}

impl Request {
    pub fn new(operation: Operation, tag: Tag) -> Self {
        Self {
            operation,
            block_number: 0,
            count: 0,
            key_id: 0,
            tag,
            success: false,
            data: Vec::new(),
            snapshot_id: None,
        }
    }

    pub fn read(block_number: Vba, count: u64, tag: Tag) -> Self {
        Self {
            block_number,
            count,
            ..Self::new(Operation::Read, tag)
        }
    }

    /// Reads through the retained root of a snapshot.
    pub fn read_snapshot(snapshot_id: SnapshotId, block_number: Vba, count: u64, tag: Tag) -> Self {
        Self {
            snapshot_id: Some(snapshot_id),
            ..Self::read(block_number, count, tag)
        }
    }

    /// Writes `data`, which must be a whole number of blocks.
    pub fn write(block_number: Vba, data: Vec<u8>, tag: Tag) -> Self {
        Self {
            block_number,
            count: (data.len() / BLOCK_SIZE) as u64,
            data,
            ..Self::new(Operation::Write, tag)
        }
    }

    pub fn discard_snapshot(snapshot_id: SnapshotId, tag: Tag) -> Self {
        Self {
            snapshot_id: Some(snapshot_id),
            ..Self::new(Operation::DiscardSnapshot, tag)
        }
    }

    pub fn extend_vbd(nr_of_leaves: u64, tag: Tag) -> Self {
        Self {
            count: nr_of_leaves,
            ..Self::new(Operation::ExtendVbd, tag)
        }
    }

    pub fn extend_ft(nr_of_pbas: u64, tag: Tag) -> Self {
        Self {
            count: nr_of_pbas,
            ..Self::new(Operation::ExtendFt, tag)
        }
    }

    /// The bytes of the `index`-th block of `data`.
    pub(crate) fn block_data(&self, index: u64) -> Result<&[u8]> {
        usize::try_from(index)
            .ok()
            .and_then(|index| index.checked_mul(BLOCK_SIZE))
            .and_then(|start| self.data.get(start..start.checked_add(BLOCK_SIZE)?))
            .ok_or(Error::with_msg(NotBlockSizeAligned, "request data is too short"))
    }
}

// SPDX-License-Identifier: MPL-2.0

use core::mem::size_of;

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{Generation, INVALID_GENERATION, INVALID_VBA, Vba};
use crate::{
    layers::crypto::{INVALID_KEY_ID, KeyId},
    prelude::*,
};

/// An inner-node entry: the reference to a child block.
///
/// The hash covers the whole child block, which chains the integrity of
/// every block up to the superblock.
#[repr(C)]
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Debug,
    Default,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Serialize,
    Deserialize,
)]
pub struct Type1Node {
    pub pba: Pba,
    pub generation: Generation,
    pub hash: Hash,
}

impl Type1Node {
    pub fn new(pba: Pba, generation: Generation, hash: Hash) -> Self {
        Self {
            pba,
            generation,
            hash,
        }
    }

    /// Whether the entry references a block. Unwritten VBD leaves do not.
    pub fn is_valid(&self) -> bool {
        self.pba != INVALID_PBA
    }
}

/// A free-tree leaf entry: the life cycle of one physical block.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Type2Node {
    pub pba: Pba,
    pub last_vba: Vba,
    pub alloc_gen: Generation,
    /// `INVALID_GENERATION` while the block is in use.
    pub free_gen: Generation,
    pub last_key_id: KeyId,
    reserved: u32,
}

impl Type2Node {
    /// An entry for a block that is in use since `alloc_gen`.
    pub fn in_use(pba: Pba, alloc_gen: Generation) -> Self {
        Self {
            pba,
            last_vba: INVALID_VBA,
            alloc_gen,
            free_gen: INVALID_GENERATION,
            last_key_id: INVALID_KEY_ID,
            reserved: 0,
        }
    }

    /// An entry for a block that has been free since `free_gen`.
    pub fn free(pba: Pba, alloc_gen: Generation, free_gen: Generation) -> Self {
        Self {
            free_gen,
            ..Self::in_use(pba, alloc_gen)
        }
    }

    /// An entry that tracks no block.
    pub fn empty() -> Self {
        Self::in_use(INVALID_PBA, 0)
    }

    pub fn is_free(&self) -> bool {
        self.pba != INVALID_PBA && self.free_gen != INVALID_GENERATION
    }

    /// Whether the block may be handed out again.
    ///
    /// A block freed in a generation that is not secured yet is still part
    /// of the last committed state. A block that was alive in the
    /// generation of a kept snapshot is still reachable from it.
    pub fn is_reclaimable(&self, last_secured: Generation, snapshots: &[Generation]) -> bool {
        self.is_free()
            && self.free_gen <= last_secured
            && !snapshots
                .iter()
                .any(|snapshot| self.alloc_gen <= *snapshot && *snapshot < self.free_gen)
    }
}

/// A fixed-layout entry stored in the slots of a tree node block.
pub trait NodeEntry: Sized + Copy + FromBytes + IntoBytes + Immutable + KnownLayout {
    const SIZE: usize = size_of::<Self>();

    /// Reads the entry at `slot` of `block`.
    fn load(block: &Block, slot: usize) -> Result<Self> {
        let offset = slot * Self::SIZE;
        let Some(bytes) = block.as_slice().get(offset..offset + Self::SIZE) else {
            return_errno_with_msg!(InvalidArgs, "node slot out of range");
        };
        Self::read_from_bytes(bytes)
            .map_err(|_| Error::with_msg(InvalidArgs, "malformed node entry"))
    }

    /// Writes the entry to `slot` of `block`.
    fn store(&self, block: &mut Block, slot: usize) -> Result<()> {
        let offset = slot * Self::SIZE;
        let Some(bytes) = block.as_mut_slice().get_mut(offset..offset + Self::SIZE) else {
            return_errno_with_msg!(InvalidArgs, "node slot out of range");
        };
        self.write_to(bytes)
            .map_err(|_| Error::with_msg(InvalidArgs, "malformed node entry"))
    }
}

impl NodeEntry for Type1Node {}
impl NodeEntry for Type2Node {}

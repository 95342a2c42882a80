// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

/// A physical block address, i.e., an index into the raw device.
pub type Pba = u64;

pub const BLOCK_SIZE: usize = 0x1000;

/// PBA 0 always holds superblock slot 0, so no tree ever points at it.
pub const INVALID_PBA: Pba = 0;

/// An owned, heap-allocated buffer of exactly one block.
#[derive(Clone, PartialEq, Eq)]
pub struct Block(Box<[u8; BLOCK_SIZE]>);

impl Block {
    pub fn new_zeroed() -> Self {
        Self(Box::new([0; BLOCK_SIZE]))
    }

    /// Copies a block out of `buf`, which must be exactly one block long.
    pub fn from_slice(buf: &[u8]) -> Result<Self> {
        if buf.len() != BLOCK_SIZE {
            return_errno_with_msg!(NotBlockSizeAligned, "buffer is not one block long");
        }
        let mut block = Self::new_zeroed();
        block.0.copy_from_slice(buf);
        Ok(block)
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.0.as_mut_slice()
    }

    /// The SHA-256 digest of the whole block.
    pub fn hash(&self) -> Hash {
        Hash::of(self.as_slice())
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

impl Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block").field("hash", &self.hash()).finish()
    }
}

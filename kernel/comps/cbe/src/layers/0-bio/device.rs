// SPDX-License-Identifier: MPL-2.0

use core::ops::Range;

use crate::prelude::*;

/// A raw, unreliable block device addressed by PBA.
///
/// Buffers passed to `read` and `write` must cover a whole number of
/// blocks. Retrying failed I/O is up to the implementation; the engine
/// reports every error to the originating request.
pub trait BlockDevice {
    /// Reads one or multiple blocks starting at `pba`.
    fn read(&mut self, pba: Pba, buf: &mut [u8]) -> Result<()>;

    /// Writes one or multiple blocks starting at `pba`.
    fn write(&mut self, pba: Pba, buf: &[u8]) -> Result<()>;

    /// Ensures that written blocks are persisted.
    fn sync(&mut self) -> Result<()>;

    /// Returns the number of blocks.
    fn nr_of_blocks(&self) -> u64;
}

impl<T: BlockDevice + ?Sized> BlockDevice for Box<T> {
    fn read(&mut self, pba: Pba, buf: &mut [u8]) -> Result<()> {
        (**self).read(pba, buf)
    }

    fn write(&mut self, pba: Pba, buf: &[u8]) -> Result<()> {
        (**self).write(pba, buf)
    }

    fn sync(&mut self) -> Result<()> {
        (**self).sync()
    }

    fn nr_of_blocks(&self) -> u64 {
        (**self).nr_of_blocks()
    }
}

/// An in-memory disk that impls `BlockDevice`.
pub struct MemDisk {
    blocks: Vec<u8>,
    fail_next_write: bool,
}

impl MemDisk {
    pub fn create(nr_of_blocks: u64) -> Result<Self> {
        let len = Self::offset(nr_of_blocks)?;
        Ok(Self {
            blocks: vec![0; len],
            fail_next_write: false,
        })
    }

    /// Grows or shrinks the disk. New blocks are zeroed.
    pub fn resize(&mut self, nr_of_blocks: u64) -> Result<()> {
        let len = Self::offset(nr_of_blocks)?;
        self.blocks.resize(len, 0);
        Ok(())
    }

    /// Makes the next write fail with `IoFailed`.
    pub fn fail_next_write(&mut self) {
        self.fail_next_write = true;
    }

    fn offset(pba: Pba) -> Result<usize> {
        usize::try_from(pba)
            .ok()
            .and_then(|pba| pba.checked_mul(BLOCK_SIZE))
            .ok_or(Error::with_msg(InvalidArgs, "block address overflows"))
    }

    fn range(&self, pba: Pba, len: usize) -> Result<Range<usize>> {
        if len % BLOCK_SIZE != 0 {
            return_errno_with_msg!(NotBlockSizeAligned, "buffer is not block aligned");
        }
        let start = Self::offset(pba)?;
        let end = start + len;
        if end > self.blocks.len() {
            return_errno_with_msg!(InvalidArgs, "I/O range out of bound");
        }
        Ok(start..end)
    }
}

impl BlockDevice for MemDisk {
    fn read(&mut self, pba: Pba, buf: &mut [u8]) -> Result<()> {
        let range = self.range(pba, buf.len())?;
        buf.copy_from_slice(&self.blocks[range]);
        Ok(())
    }

    fn write(&mut self, pba: Pba, buf: &[u8]) -> Result<()> {
        if self.fail_next_write {
            self.fail_next_write = false;
            return_errno_with_msg!(IoFailed, "injected write failure");
        }
        let range = self.range(pba, buf.len())?;
        self.blocks[range].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn nr_of_blocks(&self) -> u64 {
        (self.blocks.len() / BLOCK_SIZE) as u64
    }
}

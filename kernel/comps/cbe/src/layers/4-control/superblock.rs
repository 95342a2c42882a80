// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::{
    layers::{
        crypto::{KeyId, SealedKey},
        tree::{Generation, TreeRoot, Vba},
    },
    prelude::*,
};

/// The operation a superblock is in the middle of.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub enum SuperblockState {
    /// A slot that never held a superblock.
    #[default]
    Invalid,
    Normal,
    Rekeying,
    ExtendingVbd,
    ExtendingFt,
}

/// A key as the superblock stores it, wrapped by the trust anchor.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct KeyEntry {
    pub id: KeyId,
    pub sealed: SealedKey,
}

pub type SnapshotId = u32;

/// A retained VBD root of a committed generation.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub generation: Generation,
    pub vbd: TreeRoot,
    pub keep: bool,
}

/// The root of trust of a volume.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Superblock {
    pub state: SuperblockState,
    pub generation: Generation,
    pub current_key: KeyEntry,
    /// The key being replaced while rekeying.
    pub previous_key: Option<KeyEntry>,
    pub vbd: TreeRoot,
    pub free_tree: TreeRoot,
    pub meta_tree: TreeRoot,
    pub snapshots: Vec<Snapshot>,
    pub last_snapshot_id: SnapshotId,
    /// The first VBA not yet encrypted with the current key.
    pub rekeying_vba: Vba,
    /// The leaves an ongoing VBD extension has still to add.
    pub resizing_nr_of_leaves: u64,
    /// The next PBA an ongoing free-tree extension appends.
    pub extending_first_pba: Pba,
    pub extending_nr_of_pbas: u64,
    /// The number of PBAs the volume spans, superblock slots included.
    pub nr_of_pbas: u64,
}

impl Superblock {
    pub const MAX_SNAPSHOTS: usize = 32;

    pub fn valid(&self) -> bool {
        self.state != SuperblockState::Invalid
    }

    /// Serializes the superblock into a zero-padded slot block.
    pub fn encode(&self) -> Result<Block> {
        let mut block = Block::new_zeroed();
        postcard::to_slice(self, block.as_mut_slice())
            .map_err(|_| Error::with_msg(InvalidArgs, "superblock does not fit a block"))?;
        Ok(block)
    }

    pub fn decode(block: &Block) -> Result<Self> {
        postcard::from_bytes(block.as_slice())
            .map_err(|_| Error::with_msg(InvalidArgs, "malformed superblock"))
    }

    /// The key the data of `vba` is encrypted with.
    pub fn key_for(&self, vba: Vba) -> KeyId {
        match self.previous_key {
            Some(previous) if self.state == SuperblockState::Rekeying && vba >= self.rekeying_vba => {
                previous.id
            }
            _ => self.current_key.id,
        }
    }

    /// The generations whose blocks must not be reclaimed.
    pub fn kept_generations(&self) -> Vec<Generation> {
        self.snapshots
            .iter()
            .filter(|snapshot| snapshot.keep)
            .map(|snapshot| snapshot.generation)
            .collect()
    }

    pub fn snapshot(&self, id: SnapshotId) -> Option<&Snapshot> {
        self.snapshots
            .iter()
            .find(|snapshot| snapshot.id == id && snapshot.keep)
    }
}

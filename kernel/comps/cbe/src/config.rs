// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::{layers::tree::TreeGeometry, prelude::*};

/// The shape of a volume and the resources of the engine that serves it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Config {
    pub nr_of_superblock_slots: u64,
    /// The number of metadata blocks the cache holds.
    pub cache_capacity: usize,
    pub vbd: TreeGeometry,
    /// Its leaf count is the number of spare data blocks. The free tree
    /// tracks the VBD nodes in further leaves.
    pub free_tree: TreeGeometry,
    /// Its leaf count is the number of spare blocks for free tree nodes.
    pub meta_tree: TreeGeometry,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nr_of_superblock_slots: 8,
            cache_capacity: 64,
            vbd: TreeGeometry::new(2, 64, 1024),
            free_tree: TreeGeometry::new(2, 64, 2048),
            meta_tree: TreeGeometry::new(2, 64, 256),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.nr_of_superblock_slots < 2 {
            return_errno_with_msg!(InvalidArgs, "at least two superblock slots needed");
        }
        if self.cache_capacity == 0 {
            return_errno_with_msg!(InvalidArgs, "cache needs room for one block");
        }
        self.vbd.validate()?;
        self.free_tree.validate()?;
        self.meta_tree.validate()?;
        if self.formatted_free_tree().nr_of_leaves > self.free_tree.capacity() {
            return_errno_with_msg!(InvalidArgs, "free tree cannot hold the vbd nodes");
        }
        Ok(())
    }

    /// The shape of the free tree of a new volume, whose first leaves
    /// track the VBD nodes.
    pub fn formatted_free_tree(&self) -> TreeGeometry {
        TreeGeometry {
            nr_of_leaves: self.free_tree.nr_of_leaves + self.vbd.nr_of_nodes(),
            ..self.free_tree
        }
    }

    /// The number of blocks a formatted volume occupies.
    pub fn nr_of_required_blocks(&self) -> u64 {
        self.nr_of_superblock_slots
            + self.vbd.nr_of_nodes()
            + self.formatted_free_tree().nr_of_nodes()
            + self.free_tree.nr_of_leaves
            + self.meta_tree.nr_of_nodes()
            + self.meta_tree.nr_of_leaves
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() -> Result<()> {
        let config = Config::default();
        config.validate()?;
        assert_eq!(config.formatted_free_tree().nr_of_leaves, 2048 + 17);
        assert_eq!(config.nr_of_required_blocks(), 8 + 17 + 34 + 2048 + 5 + 256);
        Ok(())
    }

    #[test]
    fn single_leaf_trees_are_valid() -> Result<()> {
        let config = Config {
            nr_of_superblock_slots: 2,
            vbd: TreeGeometry::new(1, 2, 1),
            free_tree: TreeGeometry::new(1, 2, 1),
            meta_tree: TreeGeometry::new(1, 4, 4),
            ..Config::default()
        };
        config.validate()?;
        assert_eq!(config.nr_of_required_blocks(), 2 + 1 + 1 + 1 + 1 + 4);
        Ok(())
    }

    #[test]
    fn invalid_shapes_are_rejected() {
        let config = Config::default();
        let one_slot = Config {
            nr_of_superblock_slots: 1,
            ..config
        };
        assert!(one_slot.validate().is_err());

        let wide = Config {
            vbd: TreeGeometry::new(2, 86, 64),
            ..config
        };
        assert!(wide.validate().is_err());

        // Five spares and five vbd nodes need ten leaves.
        let small_free_tree = Config {
            vbd: TreeGeometry::new(2, 4, 16),
            free_tree: TreeGeometry::new(1, 5, 5),
            ..config
        };
        assert!(small_free_tree.validate().is_err());
    }
}

// SPDX-License-Identifier: MPL-2.0

//! A consistent block encrypter.
//!
//! Client blocks are encrypted one by one and stored copy-on-write below
//! hash trees whose root is a superblock sealed by a trust anchor. Every
//! committed generation is crash consistent. Snapshots, online rekeying and
//! online extension work on top of the same copy-on-write machinery.
//!
//! The engine is made of modules that exchange requests through a
//! cooperative dispatch protocol, see [`dispatch`].

#![deny(unsafe_code)]

mod config;
pub mod dispatch;
mod engine;
mod error;
pub mod layers;
mod prelude;
mod util;

pub use self::{
    config::Config,
    engine::Engine,
    error::{Errno, Error},
    layers::{
        bio::{BLOCK_SIZE, BlockDevice, MemDisk, Pba},
        control::{Operation, Request, SnapshotId, Superblock, SuperblockState, Tag},
        crypto::{Key, KeyId, SealedKey, SoftTrustAnchor, TrustAnchorDevice},
        tree::{TreeGeometry, Vba},
    },
    util::Hash,
};

// SPDX-License-Identifier: MPL-2.0

#[path = "0-bio/mod.rs"]
pub mod bio;
#[path = "1-cache/mod.rs"]
pub mod cache;
#[path = "4-control/mod.rs"]
pub mod control;
#[path = "2-crypto/mod.rs"]
pub mod crypto;
#[path = "5-init/mod.rs"]
pub mod init;
#[path = "3-tree/mod.rs"]
pub mod tree;

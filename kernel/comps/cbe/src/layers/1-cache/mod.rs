// SPDX-License-Identifier: MPL-2.0

//! The layer of cached metadata blocks.

mod cache;

pub use self::cache::{Cache, CacheOp, CacheRequest};

// SPDX-License-Identifier: MPL-2.0

use core::ops::Deref;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::prelude::Result;

/// Random initialization for Key, Iv and Mac.
pub trait RandomInit: Default {
    fn random() -> Self;
}

/// Authenticated Encryption with Associated Data (AEAD) algorithm.
pub trait Aead {
    type Key: Deref<Target = [u8]> + RandomInit;
    type Iv: Deref<Target = [u8]> + RandomInit;
    type Mac: Deref<Target = [u8]> + RandomInit;

    /// Encrypt plaintext referred by `input`, with a secret `Key`,
    /// initialization vector `Iv` and additional associated data `aad`.
    ///
    /// If the operation succeed, the ciphertext will be written to `output`
    /// and a message authentication code `Mac` will be returned. Or else,
    /// return an `Error` on any fault.
    fn encrypt(
        &self,
        input: &[u8],
        key: &Self::Key,
        iv: &Self::Iv,
        aad: &[u8],
        output: &mut [u8],
    ) -> Result<Self::Mac>;

    /// Decrypt ciphertext referred by `input`, with a secret `Key` and
    /// message authentication code `Mac`, initialization vector `Iv` and
    /// additional associated data `aad`.
    ///
    /// If the operation succeed, the plaintext will be written to `output`.
    /// Or else, return an `Error` on any fault.
    fn decrypt(
        &self,
        input: &[u8],
        key: &Self::Key,
        iv: &Self::Iv,
        aad: &[u8],
        mac: &Self::Mac,
        output: &mut [u8],
    ) -> Result<()>;
}

/// Symmetric key cipher algorithm.
///
/// The cipher must be deterministic for a given `(key, iv, input)`, which
/// is what makes ciphertext position-bound when the `Iv` is derived from
/// a block address.
pub trait Skcipher {
    type Key: Deref<Target = [u8]> + RandomInit;
    type Iv: Deref<Target = [u8]> + RandomInit;

    /// Encrypt plaintext referred by `input`, with a secret `Key` and
    /// initialization vector `Iv`.
    ///
    /// If the operation succeed, the ciphertext will be written to `output`.
    /// Or else, return an `Error` on any fault.
    fn encrypt(
        &self,
        input: &[u8],
        key: &Self::Key,
        iv: &Self::Iv,
        output: &mut [u8],
    ) -> Result<()>;

    /// Decrypt ciphertext referred by `input` with a secret `Key` and
    /// initialization vector `Iv`.
    ///
    /// If the operation succeed, the plaintext will be written to `output`.
    /// Or else, return an `Error` on any fault.
    fn decrypt(
        &self,
        input: &[u8],
        key: &Self::Key,
        iv: &Self::Iv,
        output: &mut [u8],
    ) -> Result<()>;
}

/// A SHA-256 digest.
#[repr(transparent)]
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Serialize,
    Deserialize,
)]
pub struct Hash([u8; 32]);

impl Hash {
    pub const SIZE: usize = 32;

    /// Computes the digest of `data`.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl core::fmt::Debug for Hash {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

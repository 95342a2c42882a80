// SPDX-License-Identifier: MPL-2.0

//! The layer of block encryption and key management.

mod cipher;
mod crypto;
mod trust_anchor;

pub use self::{
    cipher::{AesCtr, AesGcm, Iv, Key, KeyId, Mac, INVALID_KEY_ID},
    crypto::{Crypto, CryptoOp, CryptoRequest},
    trust_anchor::{
        SealedKey, Signature, SoftTrustAnchor, TrustAnchor, TrustAnchorDevice, TrustAnchorOp,
        TrustAnchorRequest,
    },
};

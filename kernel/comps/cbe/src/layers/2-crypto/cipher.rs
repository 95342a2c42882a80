// SPDX-License-Identifier: MPL-2.0

use core::ops::Deref;

use aes_gcm::{
    aead::{generic_array::GenericArray, AeadInPlace, NewAead},
    Aes128Gcm,
};
use ctr::cipher::{NewCipher, StreamCipher};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{
    prelude::*,
    util::{Aead, RandomInit, Skcipher},
};

type Aes128Ctr = ctr::Ctr128LE<aes_gcm::aes::Aes128>;

/// Identifies a key installed in Crypto.
pub type KeyId = u32;

/// No key ever gets this id.
pub const INVALID_KEY_ID: KeyId = 0;

macro_rules! new_byte_array_type {
    ($(#[$attr:meta])* $name: ident, $len: expr) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const SIZE: usize = $len;

            pub fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self([0; $len])
            }
        }

        impl Deref for $name {
            type Target = [u8];

            fn deref(&self) -> &[u8] {
                &self.0
            }
        }

        impl RandomInit for $name {
            fn random() -> Self {
                let mut bytes = [0; $len];
                rand::rng().fill_bytes(&mut bytes);
                Self(bytes)
            }
        }
    };
}

new_byte_array_type!(
    /// A 128-bit plaintext key.
    Key,
    16
);
new_byte_array_type!(
    /// The IV of AES-CTR, or the nonce of AES-GCM in its first 12 bytes.
    Iv,
    16
);
new_byte_array_type!(
    /// The authentication tag of AES-GCM.
    Mac,
    16
);

impl Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key { .. }")
    }
}

impl Debug for Iv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Iv").field(&self.0).finish()
    }
}

impl Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Mac").field(&self.0).finish()
    }
}

impl Iv {
    /// Builds the IV for the block at `position`.
    ///
    /// The low 8 bytes are the block counter of CTR mode, which never
    /// exceeds 255 inside a block, so IVs of different positions never
    /// produce overlapping key streams.
    pub fn for_position(position: u64, domain: u8) -> Self {
        let mut bytes = [0; 16];
        bytes[8..15].copy_from_slice(&position.to_le_bytes()[..7]);
        bytes[15] = domain;
        Self(bytes)
    }
}

/// AES-128 in counter mode.
#[derive(Debug, Default)]
pub struct AesCtr;

impl AesCtr {
    fn apply(input: &[u8], key: &Key, iv: &Iv, output: &mut [u8]) -> Result<()> {
        if input.len() != output.len() {
            return_errno_with_msg!(InvalidArgs, "input and output lengths differ");
        }
        let mut cipher = Aes128Ctr::new_from_slices(key, iv)
            .map_err(|_| Error::with_msg(EncryptFailed, "invalid key or iv length"))?;
        output.copy_from_slice(input);
        cipher.apply_keystream(output);
        Ok(())
    }
}

impl Skcipher for AesCtr {
    type Key = Key;
    type Iv = Iv;

    fn encrypt(&self, input: &[u8], key: &Key, iv: &Iv, output: &mut [u8]) -> Result<()> {
        Self::apply(input, key, iv, output)
    }

    fn decrypt(&self, input: &[u8], key: &Key, iv: &Iv, output: &mut [u8]) -> Result<()> {
        Self::apply(input, key, iv, output)
            .map_err(|_| Error::with_msg(DecryptFailed, "AES-CTR decryption failed"))
    }
}

/// AES-128 in Galois/counter mode.
#[derive(Debug, Default)]
pub struct AesGcm;

impl AesGcm {
    const NONCE_SIZE: usize = 12;
}

impl Aead for AesGcm {
    type Key = Key;
    type Iv = Iv;
    type Mac = Mac;

    fn encrypt(
        &self,
        input: &[u8],
        key: &Key,
        iv: &Iv,
        aad: &[u8],
        output: &mut [u8],
    ) -> Result<Mac> {
        if input.len() != output.len() {
            return_errno_with_msg!(InvalidArgs, "input and output lengths differ");
        }
        let cipher = Aes128Gcm::new(GenericArray::from_slice(key));
        let nonce = GenericArray::from_slice(&iv[..Self::NONCE_SIZE]);
        output.copy_from_slice(input);
        let tag = cipher
            .encrypt_in_place_detached(nonce, aad, output)
            .map_err(|_| Error::with_msg(EncryptFailed, "AES-GCM encryption failed"))?;
        let mut mac = [0; Mac::SIZE];
        mac.copy_from_slice(tag.as_slice());
        Ok(Mac::new(mac))
    }

    fn decrypt(
        &self,
        input: &[u8],
        key: &Key,
        iv: &Iv,
        aad: &[u8],
        mac: &Mac,
        output: &mut [u8],
    ) -> Result<()> {
        if input.len() != output.len() {
            return_errno_with_msg!(InvalidArgs, "input and output lengths differ");
        }
        let cipher = Aes128Gcm::new(GenericArray::from_slice(key));
        let nonce = GenericArray::from_slice(&iv[..Self::NONCE_SIZE]);
        output.copy_from_slice(input);
        cipher
            .decrypt_in_place_detached(nonce, aad, output, GenericArray::from_slice(mac))
            .map_err(|_| Error::with_msg(MacMismatched, "AES-GCM authentication failed"))
    }
}

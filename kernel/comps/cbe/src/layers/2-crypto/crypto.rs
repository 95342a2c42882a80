// SPDX-License-Identifier: MPL-2.0

use super::{AesCtr, Iv, Key, KeyId};
use crate::{
    layers::tree::Vba,
    prelude::*,
    util::Skcipher,
};

/// Separates metadata positions (PBAs) from client-data positions (VBAs).
const METADATA_DOMAIN: u8 = 0;
const CLIENT_DATA_DOMAIN: u8 = 1;

/// The operation of a crypto request.
#[derive(Debug)]
pub enum CryptoOp {
    AddKey { key_id: KeyId, key: Key },
    RemoveKey { key_id: KeyId },
    /// Encrypts a metadata block bound to its PBA.
    ///
    /// The engine stores tree nodes unencrypted under the protection of
    /// the hash chain and never issues this.
    Encrypt { key_id: KeyId, pba: Pba },
    Decrypt { key_id: KeyId, pba: Pba },
    /// Encrypts a payload block bound to its VBA.
    EncryptClientData { key_id: KeyId, vba: Vba },
    DecryptClientData { key_id: KeyId, vba: Vba },
}

/// A request to the Crypto module. En- and decryption transform `block`
/// in place.
#[derive(Debug)]
pub struct CryptoRequest {
    pub op: CryptoOp,
    pub block: Option<Block>,
    pub success: bool,
}

impl CryptoRequest {
    pub fn new(op: CryptoOp, block: Option<Block>) -> Self {
        Self {
            op,
            block,
            success: false,
        }
    }
}

struct KeySlot {
    id: KeyId,
    key: Key,
}

/// The block-encryption module.
///
/// It holds at most two keys, the current one and, while rekeying, the
/// previous one. A single channel makes it process one primitive at a time.
pub struct Crypto {
    slots: [Option<KeySlot>; 2],
    cipher: AesCtr,
    channels: Channels<()>,
}

impl Crypto {
    pub const NR_OF_CHANNELS: usize = 1;

    pub fn new() -> Self {
        Self {
            slots: [None, None],
            cipher: AesCtr,
            channels: Channels::new(ModuleId::Crypto, Self::NR_OF_CHANNELS),
        }
    }

    /// Returns the ids of the installed keys.
    pub fn key_ids(&self) -> Vec<KeyId> {
        self.slots.iter().flatten().map(|slot| slot.id).collect()
    }

    fn key(&self, key_id: KeyId) -> Result<&Key> {
        self.slots
            .iter()
            .flatten()
            .find(|slot| slot.id == key_id)
            .map(|slot| &slot.key)
            .ok_or(Error::with_msg(UnknownKey, "key is not installed"))
    }

    fn add_key(&mut self, key_id: KeyId, key: Key) -> Result<()> {
        if self.key(key_id).is_ok() {
            return_errno_with_msg!(InvalidArgs, "key id already installed");
        }
        let Some(free) = self.slots.iter_mut().find(|slot| slot.is_none()) else {
            return_errno_with_msg!(InvalidArgs, "both key slots are in use");
        };
        *free = Some(KeySlot { id: key_id, key });
        Ok(())
    }

    fn remove_key(&mut self, key_id: KeyId) -> Result<()> {
        let Some(slot) = self
            .slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|slot| slot.id == key_id))
        else {
            return_errno_with_msg!(UnknownKey, "removing a key that is not installed");
        };
        *slot = None;
        Ok(())
    }

    fn transform(&self, block: &mut Option<Block>, key_id: KeyId, iv: Iv, encrypt: bool) -> Result<()> {
        let Some(input) = block.as_ref() else {
            return_errno_with_msg!(InvalidArgs, "crypto request without a block");
        };
        let key = self.key(key_id)?;
        let mut output = Block::new_zeroed();
        if encrypt {
            self.cipher
                .encrypt(input.as_slice(), key, &iv, output.as_mut_slice())?;
        } else {
            self.cipher
                .decrypt(input.as_slice(), key, &iv, output.as_mut_slice())?;
        }
        *block = Some(output);
        Ok(())
    }

    fn handle(&mut self, request: &mut CryptoRequest) -> Result<()> {
        match request.op {
            CryptoOp::AddKey { key_id, key } => self.add_key(key_id, key),
            CryptoOp::RemoveKey { key_id } => self.remove_key(key_id),
            CryptoOp::Encrypt { key_id, pba } => self.transform(
                &mut request.block,
                key_id,
                Iv::for_position(pba, METADATA_DOMAIN),
                true,
            ),
            CryptoOp::Decrypt { key_id, pba } => self.transform(
                &mut request.block,
                key_id,
                Iv::for_position(pba, METADATA_DOMAIN),
                false,
            ),
            CryptoOp::EncryptClientData { key_id, vba } => self.transform(
                &mut request.block,
                key_id,
                Iv::for_position(vba, CLIENT_DATA_DOMAIN),
                true,
            ),
            CryptoOp::DecryptClientData { key_id, vba } => self.transform(
                &mut request.block,
                key_id,
                Iv::for_position(vba, CLIENT_DATA_DOMAIN),
                false,
            ),
        }
    }
}

impl Default for Crypto {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelModule for Crypto {
    type State = ();

    const ID: ModuleId = ModuleId::Crypto;

    fn channels(&self) -> &Channels<()> {
        &self.channels
    }

    fn channels_mut(&mut self) -> &mut Channels<()> {
        &mut self.channels
    }

    fn accept(&mut self, _request: &mut ModuleRequest) {}

    fn step(&mut self, channel: &mut Channel<()>) -> bool {
        let request = payload_of!(channel.payload_mut(), Crypto);
        match self.handle(request) {
            Ok(()) => {
                trace!("[Crypto] {:?} done", request.op);
                request.success = true;
            }
            Err(err) => {
                warn!("[Crypto] {:?} failed: {}", request.op, err);
                request.success = false;
            }
        }
        channel.complete();
        true
    }
}

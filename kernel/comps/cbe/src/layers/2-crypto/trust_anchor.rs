// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use super::{AesGcm, Iv, Key, Mac};
use crate::{
    prelude::*,
    util::{Aead, RandomInit},
};

/// A key wrapped by the trust anchor. Only the trust anchor that sealed it
/// can unwrap it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct SealedKey {
    pub iv: Iv,
    pub ciphertext: Key,
    pub mac: Mac,
}

/// The trust anchor's attestation of a superblock hash.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Signature(pub Mac);

/// The external secure key store.
///
/// It never reveals its private key. It remembers the hash of the last
/// superblock it secured, which decides the current superblock slot on
/// mount.
pub trait TrustAnchorDevice {
    /// Mints a fresh plaintext key.
    fn create_key(&mut self) -> Result<Key>;

    /// Wraps `key` under the private key.
    fn encrypt_key(&mut self, key: &Key) -> Result<SealedKey>;

    /// Unwraps a key wrapped by `encrypt_key`.
    fn decrypt_key(&mut self, sealed: &SealedKey) -> Result<Key>;

    /// Records `hash` as the last secured superblock and signs it.
    fn secure_superblock(&mut self, hash: &Hash) -> Result<Signature>;

    /// Returns the hash of the last secured superblock.
    fn last_superblock_hash(&self) -> Result<Hash>;
}

impl<T: TrustAnchorDevice + ?Sized> TrustAnchorDevice for Box<T> {
    fn create_key(&mut self) -> Result<Key> {
        (**self).create_key()
    }

    fn encrypt_key(&mut self, key: &Key) -> Result<SealedKey> {
        (**self).encrypt_key(key)
    }

    fn decrypt_key(&mut self, sealed: &SealedKey) -> Result<Key> {
        (**self).decrypt_key(sealed)
    }

    fn secure_superblock(&mut self, hash: &Hash) -> Result<Signature> {
        (**self).secure_superblock(hash)
    }

    fn last_superblock_hash(&self) -> Result<Hash> {
        (**self).last_superblock_hash()
    }
}

/// A software trust anchor keeping its private key in memory.
pub struct SoftTrustAnchor {
    private_key: Key,
    last_hash: Option<Hash>,
    aead: AesGcm,
    fail_next_secure: bool,
}

impl SoftTrustAnchor {
    const KEY_AAD: &'static [u8] = b"cbe-key";

    pub fn new() -> Self {
        Self::with_private_key(Key::random())
    }

    pub fn with_private_key(private_key: Key) -> Self {
        Self {
            private_key,
            last_hash: None,
            aead: AesGcm,
            fail_next_secure: false,
        }
    }

    /// Makes the next `secure_superblock` fail and keep the last hash.
    pub fn fail_next_secure(&mut self) {
        self.fail_next_secure = true;
    }

    /// Checks a signature produced by `secure_superblock`.
    pub fn verify(&self, hash: &Hash, signature: &Signature) -> bool {
        self.sign(hash)
            .is_ok_and(|expected| expected == *signature)
    }

    fn sign(&self, hash: &Hash) -> Result<Signature> {
        // A GMAC over the hash under a fixed nonce.
        let mac = self
            .aead
            .encrypt(&[], &self.private_key, &Iv::default(), hash.as_bytes(), &mut [])?;
        Ok(Signature(mac))
    }
}

impl Default for SoftTrustAnchor {
    fn default() -> Self {
        Self::new()
    }
}

impl TrustAnchorDevice for SoftTrustAnchor {
    fn create_key(&mut self) -> Result<Key> {
        Ok(Key::random())
    }

    fn encrypt_key(&mut self, key: &Key) -> Result<SealedKey> {
        let iv = Iv::random();
        let mut ciphertext = [0; Key::SIZE];
        let mac = self
            .aead
            .encrypt(key, &self.private_key, &iv, Self::KEY_AAD, &mut ciphertext)?;
        Ok(SealedKey {
            iv,
            ciphertext: Key::new(ciphertext),
            mac,
        })
    }

    fn decrypt_key(&mut self, sealed: &SealedKey) -> Result<Key> {
        let mut plaintext = [0; Key::SIZE];
        self.aead.decrypt(
            &sealed.ciphertext,
            &self.private_key,
            &sealed.iv,
            Self::KEY_AAD,
            &sealed.mac,
            &mut plaintext,
        )?;
        Ok(Key::new(plaintext))
    }

    fn secure_superblock(&mut self, hash: &Hash) -> Result<Signature> {
        if self.fail_next_secure {
            self.fail_next_secure = false;
            return_errno_with_msg!(IoFailed, "injected secure failure");
        }
        let signature = self.sign(hash)?;
        self.last_hash = Some(*hash);
        Ok(signature)
    }

    fn last_superblock_hash(&self) -> Result<Hash> {
        self.last_hash
            .ok_or(Error::with_msg(NotFound, "no superblock secured yet"))
    }
}

/// The operation of a trust anchor request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TrustAnchorOp {
    CreateKey,
    EncryptKey,
    DecryptKey,
    SecureSuperblock,
    LastSuperblockHash,
}

/// A request to the Trust Anchor module.
///
/// Inputs and outputs share the optional fields: `EncryptKey` takes `key`
/// and returns `sealed_key`, `DecryptKey` the other way round,
/// `SecureSuperblock` takes `hash` and returns `signature`, and
/// `LastSuperblockHash` returns `hash`.
#[derive(Debug)]
pub struct TrustAnchorRequest {
    pub op: TrustAnchorOp,
    pub key: Option<Key>,
    pub sealed_key: Option<SealedKey>,
    pub hash: Option<Hash>,
    pub signature: Option<Signature>,
    pub success: bool,
}

impl TrustAnchorRequest {
    fn new(op: TrustAnchorOp) -> Self {
        Self {
            op,
            key: None,
            sealed_key: None,
            hash: None,
            signature: None,
            success: false,
        }
    }

    pub fn create_key() -> Self {
        Self::new(TrustAnchorOp::CreateKey)
    }

    pub fn encrypt_key(key: Key) -> Self {
        Self {
            key: Some(key),
            ..Self::new(TrustAnchorOp::EncryptKey)
        }
    }

    pub fn decrypt_key(sealed_key: SealedKey) -> Self {
        Self {
            sealed_key: Some(sealed_key),
            ..Self::new(TrustAnchorOp::DecryptKey)
        }
    }

    pub fn secure_superblock(hash: Hash) -> Self {
        Self {
            hash: Some(hash),
            ..Self::new(TrustAnchorOp::SecureSuperblock)
        }
    }

    pub fn last_superblock_hash() -> Self {
        Self::new(TrustAnchorOp::LastSuperblockHash)
    }
}

/// The module that wraps the external trust anchor.
pub struct TrustAnchor<T> {
    device: T,
    channels: Channels<()>,
}

impl<T: TrustAnchorDevice> TrustAnchor<T> {
    pub const NR_OF_CHANNELS: usize = 1;

    pub fn new(device: T) -> Self {
        Self {
            device,
            channels: Channels::new(ModuleId::TrustAnchor, Self::NR_OF_CHANNELS),
        }
    }

    pub fn device(&self) -> &T {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut T {
        &mut self.device
    }

    pub fn into_device(self) -> T {
        self.device
    }

    fn handle(&mut self, request: &mut TrustAnchorRequest) -> Result<()> {
        match request.op {
            TrustAnchorOp::CreateKey => request.key = Some(self.device.create_key()?),
            TrustAnchorOp::EncryptKey => {
                let Some(key) = request.key.take() else {
                    return_errno_with_msg!(InvalidArgs, "no key to encrypt");
                };
                request.sealed_key = Some(self.device.encrypt_key(&key)?);
            }
            TrustAnchorOp::DecryptKey => {
                let Some(sealed) = request.sealed_key.as_ref() else {
                    return_errno_with_msg!(InvalidArgs, "no key to decrypt");
                };
                request.key = Some(self.device.decrypt_key(sealed)?);
            }
            TrustAnchorOp::SecureSuperblock => {
                let Some(hash) = request.hash.as_ref() else {
                    return_errno_with_msg!(InvalidArgs, "no superblock hash to secure");
                };
                request.signature = Some(self.device.secure_superblock(hash)?);
            }
            TrustAnchorOp::LastSuperblockHash => {
                request.hash = Some(self.device.last_superblock_hash()?);
            }
        }
        Ok(())
    }
}

impl<T: TrustAnchorDevice> ChannelModule for TrustAnchor<T> {
    type State = ();

    const ID: ModuleId = ModuleId::TrustAnchor;

    fn channels(&self) -> &Channels<()> {
        &self.channels
    }

    fn channels_mut(&mut self) -> &mut Channels<()> {
        &mut self.channels
    }

    fn accept(&mut self, _request: &mut ModuleRequest) {}

    fn step(&mut self, channel: &mut Channel<()>) -> bool {
        let request = payload_of!(channel.payload_mut(), TrustAnchor);
        match self.handle(request) {
            Ok(()) => request.success = true,
            Err(err) => {
                warn!("[TrustAnchor] {:?} failed: {}", request.op, err);
                request.success = false;
            }
        }
        channel.complete();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Module;

    fn run<T: TrustAnchorDevice>(
        anchor: &mut TrustAnchor<T>,
        request: TrustAnchorRequest,
    ) -> TrustAnchorRequest {
        anchor.submit_request(ModuleRequest::new(
            ModuleId::Client,
            0,
            Payload::TrustAnchor(request),
        ));
        let mut progress = false;
        anchor.execute(&mut progress);
        payload_of!(anchor.drop_completed_request().into_payload(), TrustAnchor)
    }

    #[test]
    fn key_wrapping() -> Result<()> {
        let mut device = SoftTrustAnchor::new();
        let key = device.create_key()?;
        let sealed = device.encrypt_key(&key)?;
        assert_ne!(sealed.ciphertext, key);
        assert_eq!(device.decrypt_key(&sealed)?, key);

        let mut forged = sealed;
        forged.ciphertext = Key::random();
        assert_eq!(device.decrypt_key(&forged).unwrap_err().errno(), MacMismatched);

        let stranger = SoftTrustAnchor::new().decrypt_key(&sealed);
        assert!(stranger.is_err());
        Ok(())
    }

    #[test]
    fn secured_hash_is_remembered() -> Result<()> {
        let mut anchor = TrustAnchor::new(SoftTrustAnchor::new());
        assert!(!run(&mut anchor, TrustAnchorRequest::last_superblock_hash()).success);

        let hash = Hash::of(b"superblock");
        let secured = run(&mut anchor, TrustAnchorRequest::secure_superblock(hash));
        assert!(secured.success);
        let signature = secured.signature.unwrap();
        assert!(anchor.device().verify(&hash, &signature));
        assert!(!anchor.device().verify(&Hash::of(b"other"), &signature));

        let last = run(&mut anchor, TrustAnchorRequest::last_superblock_hash());
        assert_eq!(last.hash, Some(hash));

        anchor.device_mut().fail_next_secure();
        let other = Hash::of(b"other");
        assert!(!run(&mut anchor, TrustAnchorRequest::secure_superblock(other)).success);
        let last = run(&mut anchor, TrustAnchorRequest::last_superblock_hash());
        assert_eq!(last.hash, Some(hash));
        Ok(())
    }

    #[test]
    fn module_round_trip() -> Result<()> {
        let mut anchor = TrustAnchor::new(SoftTrustAnchor::new());
        let created = run(&mut anchor, TrustAnchorRequest::create_key());
        let key = created.key.unwrap();
        let sealed = run(&mut anchor, TrustAnchorRequest::encrypt_key(key))
            .sealed_key
            .unwrap();
        let unwrapped = run(&mut anchor, TrustAnchorRequest::decrypt_key(sealed));
        assert!(unwrapped.success);
        assert_eq!(unwrapped.key, Some(key));
        Ok(())
    }
}

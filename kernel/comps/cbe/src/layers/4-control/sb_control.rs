// SPDX-License-Identifier: MPL-2.0

use super::{KeyEntry, SnapshotId, Snapshot, Superblock, SuperblockState};
use crate::{
    dispatch::expect_response,
    layers::{
        bio::BlockIoRequest,
        cache::CacheRequest,
        crypto::{CryptoOp, CryptoRequest, Key, KeyId, TrustAnchorRequest},
        tree::{AllocContext, FtRequest, Generations, Vba, VbdRequest},
    },
    prelude::*,
};

/// The primitives Superblock Control performs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SbControlOp {
    /// Mounts the volume.
    Initialize,
    ReadVba,
    WriteVba,
    Sync,
    CreateSnapshot,
    DiscardSnapshot,
    InitializeRekeying,
    /// Re-encrypts the VBA at the rekeying cursor, or finishes rekeying.
    RekeyVba,
    /// Starts a VBD extension, or performs one step of the running one.
    ExtendVbd,
    ExtendFt,
    Deinitialize,
}

/// A request to the Superblock Control module.
#[derive(Debug)]
pub struct SbControlRequest {
    pub op: SbControlOp,
    pub vba: Vba,
    /// The plaintext block written or read.
    pub block: Option<Block>,
    /// Reads resolve through this snapshot if set. Holds the new id after
    /// `CreateSnapshot`.
    pub snapshot_id: Option<SnapshotId>,
    /// The size of an extension that is started.
    pub nr_of_blocks: u64,
    /// The key `InitializeRekeying` installed.
    pub key_id: KeyId,
    /// Set when a stepwise operation has nothing left to do.
    pub done: bool,
    pub success: bool,
}

impl SbControlRequest {
    pub fn new(op: SbControlOp) -> Self {
        Self {
            op,
            vba: 0,
            block: None,
            snapshot_id: None,
            nr_of_blocks: 0,
            key_id: 0,
            done: false,
            success: false,
        }
    }

    pub fn read(vba: Vba, snapshot_id: Option<SnapshotId>) -> Self {
        Self {
            vba,
            snapshot_id,
            ..Self::new(SbControlOp::ReadVba)
        }
    }

    pub fn write(vba: Vba, block: Block) -> Self {
        Self {
            vba,
            block: Some(block),
            ..Self::new(SbControlOp::WriteVba)
        }
    }

    pub fn extend(op: SbControlOp, nr_of_blocks: u64) -> Self {
        Self {
            nr_of_blocks,
            ..Self::new(op)
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SbStage {
    Start,
    ReadingSlot(u64),
    QueryingHash,
    UnwrappingKey { previous: bool },
    InstallingKey { previous: bool },
    ReadingVba,
    DecryptingData,
    EncryptingData,
    WritingVba,
    CreatingKey,
    WrappingKey,
    InstallingNewKey,
    RemovingKey(KeyId),
    ExtendingVbd,
    QueryingDeviceSize,
    ExtendingFt,
    Checkpointing,
    RollingBack,
    Releasing,
    Flushing,
    SyncingData,
    WritingSlot,
    SyncingSlot,
    Securing,
}

/// What happens once the superblock is secured.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AfterCommit {
    Complete,
    RemoveKeys,
}

/// What follows a tree update that succeeded.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AfterRelease {
    Complete,
    Commit,
}

pub(crate) struct SbState {
    stage: SbStage,
    after_commit: AfterCommit,
    /// Slots read while mounting.
    slots: Vec<(u64, Block)>,
    /// The superblock being mounted and its slot.
    mounting: Option<(u64, Superblock)>,
    new_key: Option<Key>,
    /// The slot and hash of the superblock being committed.
    committing: Option<(u64, Hash)>,
    /// The tree update that waits for the cache checkpoint.
    pending: Option<(SbStage, Payload)>,
    /// Why the update that is rolled back failed.
    failure: Option<Error>,
    after_release: AfterRelease,
}

impl SbState {
    fn new() -> Self {
        Self {
            stage: SbStage::Start,
            after_commit: AfterCommit::Complete,
            slots: Vec::new(),
            mounting: None,
            new_key: None,
            committing: None,
            pending: None,
            failure: None,
            after_release: AfterRelease::Complete,
        }
    }
}

/// The owner of the superblock.
///
/// Every change of the volume goes through here. Changes accumulate in the
/// open generation and become durable when the superblock that references
/// them is written to the next slot and secured by the trust anchor.
pub struct SbControl {
    sb: Option<Superblock>,
    slot: u64,
    nr_of_slots: u64,
    gens: Generations,
    channels: Channels<SbState>,
}

impl SbControl {
    pub const NR_OF_CHANNELS: usize = 1;

    pub fn new(nr_of_slots: u64) -> Self {
        Self {
            sb: None,
            slot: 0,
            nr_of_slots,
            gens: Generations::default(),
            channels: Channels::new(ModuleId::SuperblockControl, Self::NR_OF_CHANNELS),
        }
    }

    /// The superblock of the mounted volume, including uncommitted changes.
    pub fn superblock(&self) -> Option<&Superblock> {
        self.sb.as_ref()
    }

    pub fn generations(&self) -> Generations {
        self.gens
    }

    fn sb(&self) -> Result<&Superblock> {
        self.sb
            .as_ref()
            .ok_or(Error::with_msg(NotInitialized, "volume is not mounted"))
    }

    fn sb_mut(&mut self) -> Result<&mut Superblock> {
        self.sb
            .as_mut()
            .ok_or(Error::with_msg(NotInitialized, "volume is not mounted"))
    }

    fn alloc_context(&self) -> Result<AllocContext> {
        let sb = self.sb()?;
        Ok(AllocContext {
            free_tree: sb.free_tree,
            meta_tree: sb.meta_tree,
            gens: self.gens,
            snapshots: sb.kept_generations(),
        })
    }

    fn apply_context(&mut self, ctx: &AllocContext) -> Result<()> {
        let sb = self.sb_mut()?;
        sb.free_tree = ctx.free_tree;
        sb.meta_tree = ctx.meta_tree;
        Ok(())
    }

    fn commit(&self, state: &mut SbState, after_commit: AfterCommit) -> Action {
        state.stage = SbStage::Flushing;
        state.after_commit = after_commit;
        Action::Generate(Payload::Cache(CacheRequest::flush()))
    }

    /// Runs a tree update inside a cache checkpoint. A failed update is
    /// rolled back, so the cached trees keep matching the superblock.
    fn checkpointed(state: &mut SbState, stage: SbStage, update: Payload) -> Action {
        state.pending = Some((stage, update));
        state.stage = SbStage::Checkpointing;
        Action::Generate(Payload::Cache(CacheRequest::checkpoint()))
    }

    fn roll_back(state: &mut SbState, err: Error) -> Action {
        state.failure = Some(err);
        state.stage = SbStage::RollingBack;
        Action::Generate(Payload::Cache(CacheRequest::rollback()))
    }

    fn release(state: &mut SbState, after_release: AfterRelease) -> Action {
        state.after_release = after_release;
        state.stage = SbStage::Releasing;
        Action::Generate(Payload::Cache(CacheRequest::release()))
    }

    fn crypto(op: CryptoOp, block: Option<Block>) -> Action {
        Action::Generate(Payload::Crypto(CryptoRequest::new(op, block)))
    }

    fn trust_anchor(request: TrustAnchorRequest) -> Action {
        Action::Generate(Payload::TrustAnchor(request))
    }

    fn block_io(request: BlockIoRequest) -> Action {
        Action::Generate(Payload::BlockIo(request))
    }

    fn advance(
        &mut self,
        request: &mut SbControlRequest,
        state: &mut SbState,
        response: Option<Payload>,
    ) -> Result<Action> {
        match state.stage {
            SbStage::Start => self.start(request, state),
            SbStage::ReadingSlot(slot) => {
                let block = payload_of!(expect_response(response), BlockIo)
                    .into_result()?
                    .ok_or(Error::with_msg(IoFailed, "slot read returned no block"))?;
                state.slots.push((slot, block));
                if slot + 1 < self.nr_of_slots {
                    state.stage = SbStage::ReadingSlot(slot + 1);
                    return Ok(Self::block_io(BlockIoRequest::read(slot + 1)));
                }
                state.stage = SbStage::QueryingHash;
                Ok(Self::trust_anchor(TrustAnchorRequest::last_superblock_hash()))
            }
            SbStage::QueryingHash => {
                let answer = payload_of!(expect_response(response), TrustAnchor);
                let Some(hash) = answer.hash.filter(|_| answer.success) else {
                    return_errno_with_msg!(NoValidSuperblock, "trust anchor secured nothing");
                };
                let (slot, sb) = Self::select_slot(&state.slots, &hash)?;
                debug!("[SbControl] slot {} holds generation {}", slot, sb.generation);
                let sealed = sb.current_key.sealed;
                state.mounting = Some((slot, sb));
                state.slots.clear();
                state.stage = SbStage::UnwrappingKey { previous: false };
                Ok(Self::trust_anchor(TrustAnchorRequest::decrypt_key(sealed)))
            }
            SbStage::UnwrappingKey { previous } => {
                let answer = payload_of!(expect_response(response), TrustAnchor);
                let Some(key) = answer.key.filter(|_| answer.success) else {
                    return_errno_with_msg!(DecryptFailed, "trust anchor cannot unwrap the key");
                };
                let Some(entry) = Self::mounting_key(state, previous) else {
                    return_errno_with_msg!(NotFound, "superblock has no such key");
                };
                state.stage = SbStage::InstallingKey { previous };
                Ok(Self::crypto(
                    CryptoOp::AddKey {
                        key_id: entry.id,
                        key,
                    },
                    None,
                ))
            }
            SbStage::InstallingKey { previous } => {
                if !payload_of!(expect_response(response), Crypto).success {
                    return_errno_with_msg!(InvalidArgs, "crypto refused the key");
                }
                if !previous {
                    if let Some(entry) = Self::mounting_key(state, true) {
                        state.stage = SbStage::UnwrappingKey { previous: true };
                        return Ok(Self::trust_anchor(TrustAnchorRequest::decrypt_key(
                            entry.sealed,
                        )));
                    }
                }
                let Some((slot, sb)) = state.mounting.take() else {
                    return_errno_with_msg!(NotFound, "no superblock being mounted");
                };
                self.gens = Generations {
                    curr: sb.generation + 1,
                    last_secured: sb.generation,
                };
                info!(
                    "[SbControl] mounted generation {} from slot {} ({:?})",
                    sb.generation, slot, sb.state
                );
                self.slot = slot;
                self.sb = Some(sb);
                Ok(Action::Complete)
            }
            SbStage::ReadingVba => {
                let resolved = payload_of!(expect_response(response), Vbd);
                if !resolved.success {
                    return_errno_with_msg!(IoFailed, "vbd read failed");
                }
                let Some(block) = resolved.block else {
                    if request.op == SbControlOp::RekeyVba {
                        return self.rekeyed(state);
                    }
                    request.block = Some(Block::new_zeroed());
                    return Ok(Action::Complete);
                };
                let key_id = match request.op {
                    SbControlOp::RekeyVba => self.previous_key()?,
                    _ => self.sb()?.key_for(request.vba),
                };
                state.stage = SbStage::DecryptingData;
                Ok(Self::crypto(
                    CryptoOp::DecryptClientData {
                        key_id,
                        vba: request.vba,
                    },
                    Some(block),
                ))
            }
            SbStage::DecryptingData => {
                let decrypted = payload_of!(expect_response(response), Crypto);
                if !decrypted.success {
                    return_errno_with_msg!(DecryptFailed, "client data decryption failed");
                }
                if request.op == SbControlOp::RekeyVba {
                    state.stage = SbStage::EncryptingData;
                    return Ok(Self::crypto(
                        CryptoOp::EncryptClientData {
                            key_id: self.sb()?.current_key.id,
                            vba: request.vba,
                        },
                        decrypted.block,
                    ));
                }
                request.block = decrypted.block;
                Ok(Action::Complete)
            }
            SbStage::EncryptingData => {
                let encrypted = payload_of!(expect_response(response), Crypto);
                let Some(block) = encrypted.block.filter(|_| encrypted.success) else {
                    return_errno_with_msg!(EncryptFailed, "client data encryption failed");
                };
                let rekeying = request.op == SbControlOp::RekeyVba;
                let sb = self.sb()?;
                let key_id = match rekeying {
                    true => sb.current_key.id,
                    false => sb.key_for(request.vba),
                };
                let write = VbdRequest::write(
                    sb.vbd,
                    self.alloc_context()?,
                    request.vba,
                    key_id,
                    block,
                    rekeying,
                );
                Ok(Self::checkpointed(
                    state,
                    SbStage::WritingVba,
                    Payload::Vbd(write),
                ))
            }
            SbStage::WritingVba => {
                let written = payload_of!(expect_response(response), Vbd);
                if !written.success {
                    let err = Error::with_msg(IoFailed, "vbd write failed");
                    return Ok(Self::roll_back(state, err));
                }
                self.apply_context(&written.ctx)?;
                self.sb_mut()?.vbd = written.vbd;
                if request.op == SbControlOp::RekeyVba {
                    self.move_rekeying_cursor()?;
                    return Ok(Self::release(state, AfterRelease::Commit));
                }
                Ok(Self::release(state, AfterRelease::Complete))
            }
            SbStage::CreatingKey => {
                let answer = payload_of!(expect_response(response), TrustAnchor);
                let Some(key) = answer.key.filter(|_| answer.success) else {
                    return_errno_with_msg!(InvalidArgs, "trust anchor created no key");
                };
                state.new_key = Some(key);
                state.stage = SbStage::WrappingKey;
                Ok(Self::trust_anchor(TrustAnchorRequest::encrypt_key(key)))
            }
            SbStage::WrappingKey => {
                let answer = payload_of!(expect_response(response), TrustAnchor);
                let (Some(sealed), Some(key)) =
                    (answer.sealed_key.filter(|_| answer.success), state.new_key)
                else {
                    return_errno_with_msg!(EncryptFailed, "trust anchor cannot wrap the key");
                };
                let sb = self.sb_mut()?;
                let entry = KeyEntry {
                    id: sb.current_key.id + 1,
                    sealed,
                };
                sb.previous_key = Some(sb.current_key);
                sb.current_key = entry;
                state.stage = SbStage::InstallingNewKey;
                Ok(Self::crypto(
                    CryptoOp::AddKey {
                        key_id: entry.id,
                        key,
                    },
                    None,
                ))
            }
            SbStage::InstallingNewKey => {
                state.new_key = None;
                let installed = payload_of!(expect_response(response), Crypto).success;
                let sb = self.sb_mut()?;
                if !installed {
                    if let Some(previous) = sb.previous_key.take() {
                        sb.current_key = previous;
                    }
                    return_errno_with_msg!(InvalidArgs, "crypto refused the new key");
                }
                sb.state = SuperblockState::Rekeying;
                sb.rekeying_vba = 0;
                request.key_id = sb.current_key.id;
                info!("[SbControl] rekeying to key {}", sb.current_key.id);
                Ok(self.commit(state, AfterCommit::Complete))
            }
            SbStage::RemovingKey(key_id) => {
                if !payload_of!(expect_response(response), Crypto).success {
                    return_errno_with_msg!(UnknownKey, "crypto cannot remove the key");
                }
                self.key_removed(request, state, key_id)
            }
            SbStage::ExtendingVbd => {
                let extended = payload_of!(expect_response(response), Vbd);
                if !extended.success {
                    let err = Error::with_msg(OutOfDisk, "vbd extension step failed");
                    return Ok(Self::roll_back(state, err));
                }
                self.apply_context(&extended.ctx)?;
                let sb = self.sb_mut()?;
                sb.vbd = extended.vbd;
                sb.resizing_nr_of_leaves = sb.resizing_nr_of_leaves.saturating_sub(extended.nr_of_leaves);
                if sb.resizing_nr_of_leaves == 0 {
                    sb.state = SuperblockState::Normal;
                    request.done = true;
                    info!("[SbControl] vbd extended to {} leaves", sb.vbd.geometry.nr_of_leaves);
                }
                Ok(Self::release(state, AfterRelease::Commit))
            }
            SbStage::QueryingDeviceSize => {
                let size = payload_of!(expect_response(response), BlockIo);
                if !size.success {
                    return_errno_with_msg!(IoFailed, "cannot query the device size");
                }
                let nr_of_blocks = request.nr_of_blocks;
                let sb = self.sb_mut()?;
                let fits = sb
                    .nr_of_pbas
                    .checked_add(nr_of_blocks)
                    .is_some_and(|end| end <= size.nr_of_blocks);
                if !fits {
                    return_errno_with_msg!(OutOfDisk, "the device is too small for the extension");
                }
                sb.state = SuperblockState::ExtendingFt;
                sb.extending_first_pba = sb.nr_of_pbas;
                sb.extending_nr_of_pbas = nr_of_blocks;
                info!("[SbControl] extending free tree by {} blocks", nr_of_blocks);
                Ok(self.commit(state, AfterCommit::Complete))
            }
            SbStage::ExtendingFt => {
                let extended = payload_of!(expect_response(response), FreeTree);
                if !extended.success {
                    let err = Error::with_msg(OutOfDisk, "free tree extension step failed");
                    return Ok(Self::roll_back(state, err));
                }
                self.apply_context(&extended.ctx)?;
                let sb = self.sb_mut()?;
                sb.extending_first_pba += extended.nr_of_pbas;
                sb.extending_nr_of_pbas = sb.extending_nr_of_pbas.saturating_sub(extended.nr_of_pbas);
                sb.nr_of_pbas = sb.extending_first_pba;
                if sb.extending_nr_of_pbas == 0 {
                    sb.state = SuperblockState::Normal;
                    request.done = true;
                    info!(
                        "[SbControl] free tree extended to {} blocks",
                        sb.free_tree.geometry.nr_of_leaves
                    );
                }
                Ok(Self::release(state, AfterRelease::Commit))
            }
            SbStage::Checkpointing => {
                payload_of!(expect_response(response), Cache).into_result()?;
                let Some((stage, update)) = state.pending.take() else {
                    return_errno_with_msg!(NotFound, "no tree update to run");
                };
                state.stage = stage;
                Ok(Action::Generate(update))
            }
            SbStage::RollingBack => {
                payload_of!(expect_response(response), Cache).into_result()?;
                Err(state
                    .failure
                    .take()
                    .unwrap_or(Error::with_msg(IoFailed, "tree update failed")))
            }
            SbStage::Releasing => {
                payload_of!(expect_response(response), Cache).into_result()?;
                match state.after_release {
                    AfterRelease::Complete => Ok(Action::Complete),
                    AfterRelease::Commit => Ok(self.commit(state, AfterCommit::Complete)),
                }
            }
            SbStage::Flushing => {
                payload_of!(expect_response(response), Cache).into_result()?;
                state.stage = SbStage::SyncingData;
                Ok(Self::block_io(BlockIoRequest::sync()))
            }
            SbStage::SyncingData => {
                payload_of!(expect_response(response), BlockIo).into_result()?;
                let mut sb = self.sb()?.clone();
                sb.generation = self.gens.curr;
                let block = sb.encode()?;
                let slot = (self.slot + 1) % self.nr_of_slots;
                state.committing = Some((slot, block.hash()));
                state.stage = SbStage::WritingSlot;
                Ok(Self::block_io(BlockIoRequest::write(slot, block)))
            }
            SbStage::WritingSlot => {
                payload_of!(expect_response(response), BlockIo).into_result()?;
                state.stage = SbStage::SyncingSlot;
                Ok(Self::block_io(BlockIoRequest::sync()))
            }
            SbStage::SyncingSlot => {
                payload_of!(expect_response(response), BlockIo).into_result()?;
                let Some((_, hash)) = state.committing else {
                    return_errno_with_msg!(NotFound, "no superblock being committed");
                };
                state.stage = SbStage::Securing;
                Ok(Self::trust_anchor(TrustAnchorRequest::secure_superblock(hash)))
            }
            SbStage::Securing => {
                if !payload_of!(expect_response(response), TrustAnchor).success {
                    return_errno_with_msg!(IoFailed, "trust anchor did not secure the superblock");
                }
                let Some((slot, _)) = state.committing.take() else {
                    return_errno_with_msg!(NotFound, "no superblock being committed");
                };
                let curr = self.gens.curr;
                self.sb_mut()?.generation = curr;
                self.slot = slot;
                self.gens = Generations {
                    curr: curr + 1,
                    last_secured: curr,
                };
                info!("[SbControl] generation {} secured in slot {}", curr, slot);
                match state.after_commit {
                    AfterCommit::Complete => Ok(Action::Complete),
                    AfterCommit::RemoveKeys => {
                        let key_id = self.sb()?.current_key.id;
                        state.stage = SbStage::RemovingKey(key_id);
                        Ok(Self::crypto(CryptoOp::RemoveKey { key_id }, None))
                    }
                }
            }
        }
    }

    fn start(&mut self, request: &mut SbControlRequest, state: &mut SbState) -> Result<Action> {
        let curr = self.gens.curr;
        let Some(sb) = self.sb.as_mut() else {
            if request.op != SbControlOp::Initialize {
                return_errno_with_msg!(NotInitialized, "volume is not mounted");
            }
            state.stage = SbStage::ReadingSlot(0);
            return Ok(Self::block_io(BlockIoRequest::read(0)));
        };
        match request.op {
            SbControlOp::Initialize => {
                return_errno_with_msg!(InvalidArgs, "volume is already mounted")
            }
            SbControlOp::ReadVba => {
                let vbd = match request.snapshot_id {
                    Some(id) => match sb.snapshot(id) {
                        Some(snapshot) => snapshot.vbd,
                        None => return_errno_with_msg!(NotFound, "no such snapshot"),
                    },
                    None => sb.vbd,
                };
                state.stage = SbStage::ReadingVba;
                Ok(Action::Generate(Payload::Vbd(VbdRequest::read(
                    vbd,
                    request.vba,
                ))))
            }
            SbControlOp::WriteVba => {
                let key_id = sb.key_for(request.vba);
                let Some(block) = request.block.take() else {
                    return_errno_with_msg!(InvalidArgs, "write without data");
                };
                state.stage = SbStage::EncryptingData;
                Ok(Self::crypto(
                    CryptoOp::EncryptClientData {
                        key_id,
                        vba: request.vba,
                    },
                    Some(block),
                ))
            }
            SbControlOp::Sync => Ok(self.commit(state, AfterCommit::Complete)),
            SbControlOp::CreateSnapshot => {
                if sb.state == SuperblockState::Rekeying {
                    return_errno_with_msg!(Unsupported, "no snapshots while rekeying");
                }
                if sb.kept_generations().len() >= Superblock::MAX_SNAPSHOTS {
                    return_errno_with_msg!(OutOfDisk, "snapshot table is full");
                }
                sb.last_snapshot_id += 1;
                let snapshot = Snapshot {
                    id: sb.last_snapshot_id,
                    generation: curr,
                    vbd: sb.vbd,
                    keep: true,
                };
                sb.snapshots.push(snapshot);
                request.snapshot_id = Some(snapshot.id);
                info!("[SbControl] snapshot {} of generation {}", snapshot.id, curr);
                Ok(self.commit(state, AfterCommit::Complete))
            }
            SbControlOp::DiscardSnapshot => {
                let Some(id) = request.snapshot_id else {
                    return_errno_with_msg!(InvalidArgs, "no snapshot id given");
                };
                let Some(index) = sb.snapshots.iter().position(|snapshot| snapshot.id == id) else {
                    return_errno_with_msg!(NotFound, "no such snapshot");
                };
                sb.snapshots.remove(index);
                info!("[SbControl] snapshot {} discarded", id);
                Ok(self.commit(state, AfterCommit::Complete))
            }
            SbControlOp::InitializeRekeying => {
                if sb.state != SuperblockState::Normal {
                    return_errno_with_msg!(InvalidArgs, "another operation is in progress");
                }
                if !sb.kept_generations().is_empty() {
                    return_errno_with_msg!(Unsupported, "cannot rekey while snapshots are kept");
                }
                state.stage = SbStage::CreatingKey;
                Ok(Self::trust_anchor(TrustAnchorRequest::create_key()))
            }
            SbControlOp::RekeyVba => {
                if sb.state != SuperblockState::Rekeying {
                    return_errno_with_msg!(InvalidArgs, "volume is not rekeying");
                }
                if sb.rekeying_vba >= sb.vbd.geometry.nr_of_leaves {
                    let key_id = self.previous_key()?;
                    state.stage = SbStage::RemovingKey(key_id);
                    return Ok(Self::crypto(CryptoOp::RemoveKey { key_id }, None));
                }
                request.vba = sb.rekeying_vba;
                state.stage = SbStage::ReadingVba;
                Ok(Action::Generate(Payload::Vbd(VbdRequest::read(
                    sb.vbd,
                    request.vba,
                ))))
            }
            SbControlOp::ExtendVbd => match (sb.state, request.nr_of_blocks) {
                (SuperblockState::Normal, 0) => {
                    request.done = true;
                    Ok(Action::Complete)
                }
                (SuperblockState::Normal, _) => {
                    sb.state = SuperblockState::ExtendingVbd;
                    sb.resizing_nr_of_leaves = request.nr_of_blocks;
                    info!("[SbControl] extending vbd by {} leaves", request.nr_of_blocks);
                    Ok(self.commit(state, AfterCommit::Complete))
                }
                (SuperblockState::ExtendingVbd, _) => {
                    let (vbd, nr_of_leaves) = (sb.vbd, sb.resizing_nr_of_leaves);
                    let step = VbdRequest::extend_step(vbd, self.alloc_context()?, nr_of_leaves);
                    Ok(Self::checkpointed(
                        state,
                        SbStage::ExtendingVbd,
                        Payload::Vbd(step),
                    ))
                }
                _ => return_errno_with_msg!(InvalidArgs, "another operation is in progress"),
            },
            SbControlOp::ExtendFt => match (sb.state, request.nr_of_blocks) {
                (SuperblockState::Normal, 0) => {
                    request.done = true;
                    Ok(Action::Complete)
                }
                (SuperblockState::Normal, _) => {
                    state.stage = SbStage::QueryingDeviceSize;
                    Ok(Self::block_io(BlockIoRequest::size()))
                }
                (SuperblockState::ExtendingFt, _) => {
                    let (first, nr_of_pbas) = (sb.extending_first_pba, sb.extending_nr_of_pbas);
                    let step = FtRequest::extend_step(self.alloc_context()?, first, nr_of_pbas);
                    Ok(Self::checkpointed(
                        state,
                        SbStage::ExtendingFt,
                        Payload::FreeTree(step),
                    ))
                }
                _ => return_errno_with_msg!(InvalidArgs, "another operation is in progress"),
            },
            SbControlOp::Deinitialize => Ok(self.commit(state, AfterCommit::RemoveKeys)),
        }
    }

    /// Picks the slot whose content the trust anchor secured last.
    fn select_slot(slots: &[(u64, Block)], hash: &Hash) -> Result<(u64, Superblock)> {
        slots
            .iter()
            .filter(|(_, block)| block.hash() == *hash)
            .filter_map(|(slot, block)| Some((*slot, Superblock::decode(block).ok()?)))
            .filter(|(_, sb)| sb.valid())
            .max_by_key(|(_, sb)| sb.generation)
            .ok_or(Error::with_msg(NoValidSuperblock, "no slot matches the secured hash"))
    }

    fn mounting_key(state: &SbState, previous: bool) -> Option<KeyEntry> {
        let (_, sb) = state.mounting.as_ref()?;
        match previous {
            true => sb.previous_key,
            false => Some(sb.current_key),
        }
    }

    fn previous_key(&self) -> Result<KeyId> {
        self.sb()?
            .previous_key
            .map(|entry| entry.id)
            .ok_or(Error::with_msg(NotFound, "no previous key"))
    }

    fn move_rekeying_cursor(&mut self) -> Result<()> {
        let sb = self.sb_mut()?;
        sb.rekeying_vba += 1;
        trace!("[SbControl] rekeying cursor at vba {}", sb.rekeying_vba);
        Ok(())
    }

    /// Moves the rekeying cursor past the current VBA and commits.
    fn rekeyed(&mut self, state: &mut SbState) -> Result<Action> {
        self.move_rekeying_cursor()?;
        Ok(self.commit(state, AfterCommit::Complete))
    }

    fn key_removed(
        &mut self,
        request: &mut SbControlRequest,
        state: &mut SbState,
        key_id: KeyId,
    ) -> Result<Action> {
        match request.op {
            SbControlOp::RekeyVba => {
                let sb = self.sb_mut()?;
                sb.previous_key = None;
                sb.state = SuperblockState::Normal;
                request.done = true;
                info!("[SbControl] rekeying to key {} finished", sb.current_key.id);
                Ok(self.commit(state, AfterCommit::Complete))
            }
            _ => {
                let previous = self.sb()?.previous_key.map(|entry| entry.id);
                match previous {
                    Some(previous) if previous != key_id => {
                        state.stage = SbStage::RemovingKey(previous);
                        Ok(Self::crypto(CryptoOp::RemoveKey { key_id: previous }, None))
                    }
                    _ => {
                        self.sb = None;
                        info!("[SbControl] volume unmounted");
                        Ok(Action::Complete)
                    }
                }
            }
        }
    }
}

impl ChannelModule for SbControl {
    type State = SbState;

    const ID: ModuleId = ModuleId::SuperblockControl;

    fn channels(&self) -> &Channels<SbState> {
        &self.channels
    }

    fn channels_mut(&mut self) -> &mut Channels<SbState> {
        &mut self.channels
    }

    fn accept(&mut self, _request: &mut ModuleRequest) -> SbState {
        SbState::new()
    }

    fn step(&mut self, channel: &mut Channel<SbState>) -> bool {
        channel.resume(
            |payload, state, response| {
                self.advance(payload_of!(payload, SuperblockControl), state, response)
            },
            |payload, result| {
                let request = payload_of!(payload, SuperblockControl);
                if let Err(err) = &result {
                    warn!("[SbControl] {:?} of vba {} failed: {}", request.op, request.vba, err);
                }
                request.success = result.is_ok();
            },
        )
    }
}

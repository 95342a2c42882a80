// SPDX-License-Identifier: MPL-2.0

use hashbrown::HashMap;
use lru::LruCache;

use crate::{layers::bio::BlockIoRequest, prelude::*};

/// The type of a cache request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CacheOp {
    Read,
    Write,
    /// Write back every dirty block.
    Flush,
    /// Starts recording the prior content of every block written, so the
    /// writes can be undone.
    Checkpoint,
    /// Keeps the writes since the checkpoint.
    Release,
    /// Restores every block written since the checkpoint.
    Rollback,
}

/// A request to the Cache module.
#[derive(Debug)]
pub struct CacheRequest {
    pub op: CacheOp,
    pub pba: Pba,
    pub block: Option<Block>,
    pub success: bool,
}

impl CacheRequest {
    pub fn read(pba: Pba) -> Self {
        Self {
            op: CacheOp::Read,
            pba,
            block: None,
            success: false,
        }
    }

    pub fn write(pba: Pba, block: Block) -> Self {
        Self {
            op: CacheOp::Write,
            pba,
            block: Some(block),
            success: false,
        }
    }

    pub fn flush() -> Self {
        Self::control(CacheOp::Flush)
    }

    pub fn checkpoint() -> Self {
        Self::control(CacheOp::Checkpoint)
    }

    pub fn release() -> Self {
        Self::control(CacheOp::Release)
    }

    pub fn rollback() -> Self {
        Self::control(CacheOp::Rollback)
    }

    fn control(op: CacheOp) -> Self {
        Self {
            op,
            pba: INVALID_PBA,
            block: None,
            success: false,
        }
    }

    /// Turns a completed request into its outcome, the block read if any.
    pub(crate) fn into_result(self) -> Result<Option<Block>> {
        if !self.success {
            return_errno_with_msg!(IoFailed, "cache request failed");
        }
        Ok(self.block)
    }
}

struct Entry {
    block: Block,
    dirty: bool,
    /// A Block I/O request for this PBA is in flight. Nobody else may
    /// touch the entry until it returns.
    busy: bool,
}

/// The per-channel progress of a cache request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CacheState {
    Submitted,
    /// Waiting for the Block I/O read of the requested PBA.
    Loading,
    /// Waiting for the write-back of a dirty entry.
    WritingBack(Pba),
}

enum Room {
    Ready,
    WritingBack(Pba),
    Blocked,
}

/// The content a PBA had when it was first written after a checkpoint.
/// `None` if it was not resident.
type Undo = Option<(Block, bool)>;

/// A fixed-capacity cache of metadata blocks with write-back.
///
/// A dirty block is never dropped: making room for a new block writes the
/// least recently used dirty block back first. Every resident PBA has at
/// most one Block I/O request outstanding.
///
/// Blocks written after a checkpoint stay resident and are not written
/// back until the checkpoint is released or rolled back. The cache may
/// exceed its capacity if nothing else can make room.
pub struct Cache {
    entries: LruCache<Pba, Entry>,
    capacity: usize,
    undo_log: Option<HashMap<Pba, Undo>>,
    channels: Channels<CacheState>,
}

impl Cache {
    pub const NR_OF_CHANNELS: usize = 8;

    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "[Cache] zero capacity");
        Self {
            entries: LruCache::unbounded(),
            capacity,
            undo_log: None,
            channels: Channels::new(ModuleId::Cache, Self::NR_OF_CHANNELS),
        }
    }

    pub fn nr_of_dirty(&self) -> usize {
        self.entries.iter().filter(|(_, entry)| entry.dirty).count()
    }

    fn is_pinned(&self, pba: Pba) -> bool {
        self.undo_log
            .as_ref()
            .is_some_and(|undo_log| undo_log.contains_key(&pba))
    }

    /// Frees a slot for a new entry, writing back a dirty block if needed.
    fn make_room(&mut self, channel: &mut Channel<CacheState>) -> Room {
        while self.entries.len() >= self.capacity {
            let clean = self
                .entries
                .iter()
                .rev()
                .find(|(pba, entry)| !entry.busy && !entry.dirty && !self.is_pinned(**pba))
                .map(|(pba, _)| *pba);
            let Some(pba) = clean else {
                break;
            };
            trace!("[Cache] evicting pba {}", pba);
            self.entries.pop(&pba);
        }
        if self.entries.len() < self.capacity {
            return Room::Ready;
        }
        let dirty = self
            .entries
            .iter()
            .rev()
            .find(|(pba, entry)| !entry.busy && !self.is_pinned(**pba))
            .map(|(pba, _)| *pba);
        if let Some(pba) = dirty {
            debug!("[Cache] writing back dirty pba {} to make room", pba);
            self.write_back(channel, pba);
            return Room::WritingBack(pba);
        }
        if self.entries.iter().any(|(_, entry)| entry.busy) {
            return Room::Blocked;
        }
        debug!("[Cache] every entry is pinned, growing beyond {}", self.capacity);
        Room::Ready
    }

    /// Remembers what `pba` held before its first write since the
    /// checkpoint.
    fn record_undo(&mut self, pba: Pba) {
        let Some(undo_log) = self.undo_log.as_mut() else {
            return;
        };
        if undo_log.contains_key(&pba) {
            return;
        }
        let prior = self
            .entries
            .peek(&pba)
            .map(|entry| (entry.block.clone(), entry.dirty));
        undo_log.insert(pba, prior);
    }

    fn roll_back(&mut self) {
        let Some(undo_log) = self.undo_log.take() else {
            panic!("[Cache] rollback without a checkpoint");
        };
        debug!("[Cache] rolling back {} blocks", undo_log.len());
        for (pba, prior) in undo_log {
            match prior {
                Some((block, dirty)) => {
                    self.entries.put(
                        pba,
                        Entry {
                            block,
                            dirty,
                            busy: false,
                        },
                    );
                }
                None => {
                    self.entries.pop(&pba);
                }
            }
        }
    }

    fn write_back(&mut self, channel: &mut Channel<CacheState>, pba: Pba) {
        let Some(entry) = self.entries.peek_mut(&pba) else {
            return;
        };
        entry.busy = true;
        let block = entry.block.clone();
        channel.generate(Payload::BlockIo(BlockIoRequest::write(pba, block)));
    }

    fn step_submitted(&mut self, channel: &mut Channel<CacheState>) -> bool {
        let (op, pba) = {
            let request = payload_of!(channel.payload(), Cache);
            (request.op, request.pba)
        };
        match op {
            CacheOp::Read => {
                if let Some(entry) = self.entries.get(&pba) {
                    if entry.busy {
                        return false;
                    }
                    let block = entry.block.clone();
                    let request = payload_of!(channel.payload_mut(), Cache);
                    request.block = Some(block);
                    request.success = true;
                    channel.complete();
                    return true;
                }
                match self.make_room(channel) {
                    Room::Ready => {
                        self.entries.put(
                            pba,
                            Entry {
                                block: Block::new_zeroed(),
                                dirty: false,
                                busy: true,
                            },
                        );
                        channel.generate(Payload::BlockIo(BlockIoRequest::read(pba)));
                        channel.state = CacheState::Loading;
                        true
                    }
                    Room::WritingBack(victim) => {
                        channel.state = CacheState::WritingBack(victim);
                        true
                    }
                    Room::Blocked => false,
                }
            }
            CacheOp::Write => {
                if self.entries.peek(&pba).is_some_and(|entry| entry.busy) {
                    return false;
                }
                if !self.entries.contains(&pba) {
                    match self.make_room(channel) {
                        Room::Ready => {}
                        Room::WritingBack(victim) => {
                            channel.state = CacheState::WritingBack(victim);
                            return true;
                        }
                        Room::Blocked => return false,
                    }
                }
                self.record_undo(pba);
                let request = payload_of!(channel.payload_mut(), Cache);
                let Some(block) = request.block.take() else {
                    panic!("[Cache] write request without a block");
                };
                self.entries.put(
                    pba,
                    Entry {
                        block,
                        dirty: true,
                        busy: false,
                    },
                );
                request.success = true;
                channel.complete();
                true
            }
            CacheOp::Flush => {
                assert!(self.undo_log.is_none(), "[Cache] flush inside a checkpoint");
                let dirty = self
                    .entries
                    .iter()
                    .find(|(_, entry)| entry.dirty && !entry.busy)
                    .map(|(pba, _)| *pba);
                if let Some(pba) = dirty {
                    self.write_back(channel, pba);
                    channel.state = CacheState::WritingBack(pba);
                    return true;
                }
                if self.entries.iter().any(|(_, entry)| entry.dirty) {
                    // Another channel is writing the rest back.
                    return false;
                }
                payload_of!(channel.payload_mut(), Cache).success = true;
                channel.complete();
                true
            }
            CacheOp::Checkpoint => {
                assert!(self.undo_log.is_none(), "[Cache] nested checkpoint");
                self.undo_log = Some(HashMap::new());
                payload_of!(channel.payload_mut(), Cache).success = true;
                channel.complete();
                true
            }
            CacheOp::Release => {
                self.undo_log = None;
                payload_of!(channel.payload_mut(), Cache).success = true;
                channel.complete();
                true
            }
            CacheOp::Rollback => {
                self.roll_back();
                payload_of!(channel.payload_mut(), Cache).success = true;
                channel.complete();
                true
            }
        }
    }

    fn fail(channel: &mut Channel<CacheState>) {
        let request = payload_of!(channel.payload_mut(), Cache);
        warn!("[Cache] {:?} of pba {} failed", request.op, request.pba);
        request.success = false;
        channel.complete();
    }
}

impl ChannelModule for Cache {
    type State = CacheState;

    const ID: ModuleId = ModuleId::Cache;

    fn channels(&self) -> &Channels<CacheState> {
        &self.channels
    }

    fn channels_mut(&mut self) -> &mut Channels<CacheState> {
        &mut self.channels
    }

    fn accept(&mut self, _request: &mut ModuleRequest) -> CacheState {
        CacheState::Submitted
    }

    fn step(&mut self, channel: &mut Channel<CacheState>) -> bool {
        match channel.state {
            CacheState::Submitted => self.step_submitted(channel),
            CacheState::Loading => {
                let Some(response) = channel.take_response() else {
                    return false;
                };
                let response = payload_of!(response, BlockIo);
                let pba = payload_of!(channel.payload(), Cache).pba;
                match response.block {
                    Some(block) if response.success => {
                        if let Some(entry) = self.entries.peek_mut(&pba) {
                            entry.block = block.clone();
                            entry.busy = false;
                        }
                        let request = payload_of!(channel.payload_mut(), Cache);
                        request.block = Some(block);
                        request.success = true;
                        channel.complete();
                    }
                    _ => {
                        self.entries.pop(&pba);
                        Self::fail(channel);
                    }
                }
                true
            }
            CacheState::WritingBack(pba) => {
                let Some(response) = channel.take_response() else {
                    return false;
                };
                let success = payload_of!(response, BlockIo).success;
                if let Some(entry) = self.entries.peek_mut(&pba) {
                    entry.busy = false;
                    if success {
                        entry.dirty = false;
                    }
                }
                if success {
                    channel.state = CacheState::Submitted;
                } else {
                    Self::fail(channel);
                }
                true
            }
        }
    }
}

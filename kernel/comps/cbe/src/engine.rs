// SPDX-License-Identifier: MPL-2.0

//! The composition of all modules and the loop that routes between them.

use crate::{
    config::Config,
    dispatch::Module,
    layers::{
        bio::{BlockDevice, BlockIo},
        cache::Cache,
        control::{Request, RequestPool, SbControl, Superblock},
        crypto::{Crypto, TrustAnchor, TrustAnchorDevice},
        init::{FormatRequest, FtInitializer, SbInitializer, VbdInitializer},
        tree::{BlockAllocator, FreeTree, Generations, MetaTree, Vbd},
    },
    prelude::*,
};

/// A consistent block encrypter over the device `D`, rooted in the trust
/// anchor `T`.
///
/// Nothing happens on submission. Requests advance only while the owner
/// calls [`Engine::execute`] or [`Engine::run`].
pub struct Engine<D, T> {
    config: Config,
    request_pool: RequestPool,
    sb_control: SbControl,
    vbd: Vbd,
    free_tree: FreeTree,
    meta_tree: MetaTree,
    crypto: Crypto,
    trust_anchor: TrustAnchor<T>,
    cache: Cache,
    block_io: BlockIo<D>,
    block_allocator: BlockAllocator,
    vbd_initializer: VbdInitializer,
    ft_initializer: FtInitializer,
    sb_initializer: SbInitializer,
}

impl<D: BlockDevice, T: TrustAnchorDevice> Engine<D, T> {
    pub fn new(config: &Config, device: D, trust_anchor: T) -> Result<Self> {
        config.validate()?;
        let nr_of_blocks = device.nr_of_blocks();
        debug!("[Engine] created over {} blocks: {:?}", nr_of_blocks, config);
        Ok(Self {
            config: *config,
            request_pool: RequestPool::new(),
            sb_control: SbControl::new(config.nr_of_superblock_slots),
            vbd: Vbd::new(),
            free_tree: FreeTree::new(),
            meta_tree: MetaTree::new(),
            crypto: Crypto::new(),
            trust_anchor: TrustAnchor::new(trust_anchor),
            cache: Cache::new(config.cache_capacity),
            block_io: BlockIo::new(device),
            block_allocator: BlockAllocator::new(config.nr_of_superblock_slots, nr_of_blocks),
            vbd_initializer: VbdInitializer::new(),
            ft_initializer: FtInitializer::new(),
            sb_initializer: SbInitializer::new(),
        })
    }

    /// Formats the device as a new volume and returns its first
    /// superblock. The volume must be mounted with an `Initialize` request
    /// afterwards.
    pub fn format(&mut self) -> Result<Superblock> {
        let format = FormatRequest::new(
            self.config.vbd,
            self.config.free_tree,
            self.config.meta_tree,
            self.config.nr_of_superblock_slots,
        );
        self.sb_initializer.submit_request(ModuleRequest::new(
            ModuleId::Client,
            0,
            Payload::SbInitializer(format),
        ));
        self.run();
        if self.sb_initializer.peek_completed_request().is_none() {
            return_errno_with_msg!(IoFailed, "format stalled");
        }
        let format = payload_of!(self.sb_initializer.drop_completed_request().into_payload(), SbInitializer);
        match format.superblock {
            Some(superblock) if format.success => Ok(superblock),
            _ => Err(format
                .error
                .unwrap_or(Error::with_msg(IoFailed, "format failed"))),
        }
    }

    pub fn ready_to_submit_request(&self) -> bool {
        self.request_pool.ready_to_submit_request()
    }

    /// Hands a client request to the request pool.
    ///
    /// # Panics
    ///
    /// Panics if the pool is full.
    pub fn submit_request(&mut self, request: Request) {
        trace!("[Engine] client submits {:?} with tag {}", request.operation, request.tag);
        self.request_pool.submit_request(ModuleRequest::new(
            ModuleId::Client,
            0,
            Payload::RequestPool(request),
        ));
    }

    pub fn peek_completed_request(&self) -> Option<&Request> {
        self.request_pool
            .peek_completed_request()
            .map(|request| payload_of!(request.payload(), RequestPool))
    }

    /// # Panics
    ///
    /// Panics if no client request has completed.
    pub fn drop_completed_request(&mut self) -> Request {
        payload_of!(self.request_pool.drop_completed_request().into_payload(), RequestPool)
    }

    /// Performs one routing pass over all modules. Returns whether any
    /// module made progress.
    pub fn execute(&mut self) -> bool {
        let mut progress = false;
        for id in ModuleId::MODULES {
            self.module(id).execute(&mut progress);

            while let Some(generated) = self.module(id).peek_generated_request() {
                let dst = generated.dst_module();
                if !self.module(dst).ready_to_submit_request() {
                    break;
                }
                let request = self.module(id).drop_generated_request();
                trace!(
                    "[Engine] {:?}/{} -> {:?}",
                    id,
                    request.src_request_id(),
                    dst
                );
                self.module(dst).submit_request(request);
                progress = true;
            }

            while let Some(completed) = self.module(id).peek_completed_request() {
                let src = completed.src_module();
                if src == ModuleId::Client {
                    break;
                }
                let request = self.module(id).drop_completed_request();
                self.module(src).generated_request_complete(request);
                progress = true;
            }
        }
        progress
    }

    /// Routes until no module makes progress.
    pub fn run(&mut self) {
        while self.execute() {}
    }

    /// The superblock of the mounted volume, including uncommitted changes.
    pub fn superblock(&self) -> Option<&Superblock> {
        self.sb_control.superblock()
    }

    pub fn generations(&self) -> Generations {
        self.sb_control.generations()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device(&self) -> &D {
        self.block_io.device()
    }

    pub fn device_mut(&mut self) -> &mut D {
        self.block_io.device_mut()
    }

    pub fn trust_anchor(&self) -> &T {
        self.trust_anchor.device()
    }

    pub fn trust_anchor_mut(&mut self) -> &mut T {
        self.trust_anchor.device_mut()
    }

    /// Drops all volatile state and returns the device and the trust
    /// anchor, as after a power cut.
    pub fn into_devices(self) -> (D, T) {
        (self.block_io.into_device(), self.trust_anchor.into_device())
    }

    fn module(&mut self, id: ModuleId) -> &mut dyn Module {
        match id {
            ModuleId::Client => panic!("[Engine] the client is not a module"),
            ModuleId::RequestPool => &mut self.request_pool,
            ModuleId::SuperblockControl => &mut self.sb_control,
            ModuleId::Vbd => &mut self.vbd,
            ModuleId::FreeTree => &mut self.free_tree,
            ModuleId::MetaTree => &mut self.meta_tree,
            ModuleId::Crypto => &mut self.crypto,
            ModuleId::TrustAnchor => &mut self.trust_anchor,
            ModuleId::Cache => &mut self.cache,
            ModuleId::BlockIo => &mut self.block_io,
            ModuleId::BlockAllocator => &mut self.block_allocator,
            ModuleId::VbdInitializer => &mut self.vbd_initializer,
            ModuleId::FtInitializer => &mut self.ft_initializer,
            ModuleId::SbInitializer => &mut self.sb_initializer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{
        bio::MemDisk,
        control::{Operation, SnapshotId, SuperblockState, Tag},
        crypto::SoftTrustAnchor,
        tree::{TreeGeometry, TreeRoot, TreeWalk, Type2Node},
    };

    type TestEngine = Engine<MemDisk, SoftTrustAnchor>;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn config() -> Config {
        Config {
            nr_of_superblock_slots: 4,
            cache_capacity: 16,
            vbd: TreeGeometry::new(2, 4, 16),
            free_tree: TreeGeometry::new(2, 8, 56),
            meta_tree: TreeGeometry::new(2, 8, 32),
        }
    }

    fn data(byte: u8, nr_of_blocks: usize) -> Vec<u8> {
        vec![byte; nr_of_blocks * BLOCK_SIZE]
    }

    /// Formats a fresh disk and mounts it.
    fn mounted(config: &Config) -> Result<TestEngine> {
        init_logger();
        let disk = MemDisk::create(config.nr_of_required_blocks() + 16)?;
        let mut engine = Engine::new(config, disk, SoftTrustAnchor::new())?;
        engine.format()?;
        call(&mut engine, Request::new(Operation::Initialize, 0))?;
        Ok(engine)
    }

    /// Restarts the engine on the devices of a crashed one and mounts.
    fn remount(engine: TestEngine) -> Result<TestEngine> {
        let config = *engine.config();
        let (disk, trust_anchor) = engine.into_devices();
        let mut engine = Engine::new(&config, disk, trust_anchor)?;
        call(&mut engine, Request::new(Operation::Initialize, 0))?;
        Ok(engine)
    }

    /// Submits one request and drives the engine until it completes.
    fn submit_and_run(engine: &mut TestEngine, request: Request) -> Request {
        engine.submit_request(request);
        engine.run();
        engine.drop_completed_request()
    }

    fn call(engine: &mut TestEngine, request: Request) -> Result<Request> {
        let done = submit_and_run(engine, request);
        if !done.success {
            return_errno_with_msg!(IoFailed, "request failed");
        }
        Ok(done)
    }

    fn write(engine: &mut TestEngine, vba: u64, byte: u8) -> Result<()> {
        call(engine, Request::write(vba, data(byte, 1), 0)).map(|_| ())
    }

    fn read(engine: &mut TestEngine, vba: u64, count: u64) -> Result<Vec<u8>> {
        Ok(call(engine, Request::read(vba, count, 0))?.data)
    }

    fn read_snapshot(engine: &mut TestEngine, id: SnapshotId, vba: u64) -> Result<Vec<u8>> {
        Ok(call(engine, Request::read_snapshot(id, vba, 1, 0))?.data)
    }

    fn sync(engine: &mut TestEngine) -> Result<()> {
        call(engine, Request::new(Operation::Sync, 0)).map(|_| ())
    }

    fn superblock(engine: &TestEngine) -> Result<Superblock> {
        engine
            .superblock()
            .cloned()
            .ok_or(Error::new(NotInitialized))
    }

    /// Loads every leaf of a committed free list straight from the disk.
    fn free_list(engine: &mut TestEngine, root: &TreeRoot) -> Result<Vec<Type2Node>> {
        let mut walk = TreeWalk::new(*root);
        while let Some((key, reference)) = walk.next_to_load_all()? {
            let mut block = Block::new_zeroed();
            engine
                .device_mut()
                .read(reference.pba, block.as_mut_slice())?;
            walk.insert_loaded(key, reference, block)?;
        }
        (0..root.geometry.nr_of_leaves)
            .map(|unit| walk.entry(unit))
            .collect()
    }

    #[test]
    fn format_then_mount() -> Result<()> {
        init_logger();
        let config = config();
        let disk = MemDisk::create(config.nr_of_required_blocks())?;
        let mut engine = Engine::new(&config, disk, SoftTrustAnchor::new())?;
        let formatted = engine.format()?;
        assert_eq!(formatted.generation, 0);
        assert_eq!(formatted.state, SuperblockState::Normal);
        assert_eq!(formatted.current_key.id, SbInitializer::FIRST_KEY_ID);
        assert_eq!(formatted.nr_of_pbas, config.nr_of_required_blocks());
        assert!(engine.superblock().is_none());

        call(&mut engine, Request::new(Operation::Initialize, 0))?;
        assert_eq!(superblock(&engine)?, formatted);
        assert_eq!(
            engine.generations(),
            Generations {
                curr: 1,
                last_secured: 0
            }
        );
        assert_eq!(read(&mut engine, 0, 16)?, data(0, 16));
        Ok(())
    }

    #[test]
    fn format_fails_on_a_small_device() -> Result<()> {
        init_logger();
        let config = config();
        let disk = MemDisk::create(config.nr_of_required_blocks() - 1)?;
        let mut engine = Engine::new(&config, disk, SoftTrustAnchor::new())?;
        assert_eq!(engine.format().map_err(|err| err.errno()), Err(OutOfDisk));
        Ok(())
    }

    #[test]
    fn format_reports_device_errors() -> Result<()> {
        init_logger();
        let config = config();
        let disk = MemDisk::create(config.nr_of_required_blocks())?;
        let mut engine = Engine::new(&config, disk, SoftTrustAnchor::new())?;
        engine.device_mut().fail_next_write();
        assert_eq!(engine.format().map_err(|err| err.errno()), Err(IoFailed));
        Ok(())
    }

    #[test]
    fn minimal_volume_formats() -> Result<()> {
        init_logger();
        let config = Config {
            nr_of_superblock_slots: 2,
            cache_capacity: 16,
            vbd: TreeGeometry::new(1, 2, 1),
            free_tree: TreeGeometry::new(1, 2, 1),
            meta_tree: TreeGeometry::new(1, 4, 4),
        };
        let disk = MemDisk::create(config.nr_of_required_blocks())?;
        let mut engine = Engine::new(&config, disk, SoftTrustAnchor::new())?;
        let formatted = engine.format()?;
        assert!(formatted.valid());
        assert_eq!(formatted.generation, 0);
        assert_eq!(formatted.free_tree.geometry.nr_of_leaves, 2);

        call(&mut engine, Request::new(Operation::Initialize, 0))?;
        assert_eq!(read(&mut engine, 0, 1)?, data(0, 1));
        Ok(())
    }

    #[test]
    fn requests_before_mount_fail() -> Result<()> {
        init_logger();
        let config = config();
        let disk = MemDisk::create(config.nr_of_required_blocks())?;
        let mut engine = Engine::new(&config, disk, SoftTrustAnchor::new())?;
        assert!(!submit_and_run(&mut engine, Request::read(0, 1, 0)).success);
        // A blank device has nothing secured.
        assert!(!submit_and_run(&mut engine, Request::new(Operation::Initialize, 0)).success);
        Ok(())
    }

    #[test]
    fn write_sync_read() -> Result<()> {
        let mut engine = mounted(&config())?;
        call(&mut engine, Request::write(3, [data(1, 1), data(2, 1)].concat(), 0))?;
        write(&mut engine, 15, 0xff)?;
        assert_eq!(read(&mut engine, 3, 2)?, [data(1, 1), data(2, 1)].concat());
        sync(&mut engine)?;
        assert_eq!(superblock(&engine)?.generation, 1);
        assert_eq!(read(&mut engine, 15, 1)?, data(0xff, 1));
        assert_eq!(read(&mut engine, 0, 1)?, data(0, 1));

        // Client data is stored encrypted.
        let leaf_pba = {
            let sb = superblock(&engine)?;
            let mut walk = TreeWalk::new(sb.vbd);
            while let Some((key, reference)) = walk.next_to_load(15, false)? {
                let mut block = Block::new_zeroed();
                engine.device_mut().read(reference.pba, block.as_mut_slice())?;
                walk.insert_loaded(key, reference, block)?;
            }
            walk.entry::<crate::layers::tree::Type1Node>(15)?.pba
        };
        let mut stored = Block::new_zeroed();
        engine.device_mut().read(leaf_pba, stored.as_mut_slice())?;
        assert_ne!(stored.as_slice(), &data(0xff, 1)[..]);

        assert!(!submit_and_run(&mut engine, Request::read(16, 1, 0)).success);
        Ok(())
    }

    #[test]
    fn unsynced_writes_are_lost_in_a_crash() -> Result<()> {
        let mut engine = mounted(&config())?;
        write(&mut engine, 1, 0x11)?;
        sync(&mut engine)?;
        write(&mut engine, 1, 0x22)?;
        write(&mut engine, 2, 0x33)?;

        let mut engine = remount(engine)?;
        assert_eq!(superblock(&engine)?.generation, 1);
        assert_eq!(read(&mut engine, 1, 2)?, [data(0x11, 1), data(0, 1)].concat());

        write(&mut engine, 2, 0x44)?;
        sync(&mut engine)?;
        let mut engine = remount(engine)?;
        assert_eq!(superblock(&engine)?.generation, 2);
        assert_eq!(read(&mut engine, 1, 2)?, [data(0x11, 1), data(0x44, 1)].concat());
        Ok(())
    }

    #[test]
    fn every_sync_opens_a_new_generation() -> Result<()> {
        let mut engine = mounted(&config())?;
        let mut last = superblock(&engine)?.generation;
        for round in 0..5u8 {
            if round % 2 == 0 {
                write(&mut engine, u64::from(round), round)?;
            }
            sync(&mut engine)?;
            let secured = superblock(&engine)?.generation;
            assert!(secured > last);
            assert_eq!(
                engine.generations(),
                Generations {
                    curr: secured + 1,
                    last_secured: secured
                }
            );
            last = secured;
        }
        let engine = remount(engine)?;
        assert_eq!(superblock(&engine)?.generation, last);
        Ok(())
    }

    #[test]
    fn failed_secure_keeps_the_generation() -> Result<()> {
        let mut engine = mounted(&config())?;
        write(&mut engine, 2, 0x22)?;
        let before = engine.generations();

        engine.trust_anchor_mut().fail_next_secure();
        assert!(!submit_and_run(&mut engine, Request::new(Operation::Sync, 0)).success);
        assert_eq!(engine.generations(), before);
        assert_eq!(superblock(&engine)?.generation, before.last_secured);

        sync(&mut engine)?;
        assert_eq!(superblock(&engine)?.generation, before.curr);
        let mut engine = remount(engine)?;
        assert_eq!(superblock(&engine)?.generation, before.curr);
        assert_eq!(read(&mut engine, 2, 1)?, data(0x22, 1));
        Ok(())
    }

    #[test]
    fn many_generations_reuse_blocks() -> Result<()> {
        let mut engine = mounted(&config())?;
        // Far more blocks are written than the free tree holds.
        for round in 0..40u8 {
            write(&mut engine, u64::from(round % 16), round)?;
            sync(&mut engine)?;
        }
        for vba in 0..16u64 {
            let last = (0..40u8).filter(|round| u64::from(*round % 16) == vba).max();
            let expected = last.unwrap_or(0);
            assert_eq!(read(&mut engine, vba, 1)?, data(expected, 1));
        }
        let mut engine = remount(engine)?;
        assert_eq!(read(&mut engine, 7, 1)?, data(39, 1));
        Ok(())
    }

    #[test]
    fn snapshot_keeps_old_data() -> Result<()> {
        let mut engine = mounted(&config())?;
        write(&mut engine, 4, 0xaa)?;
        let snapshot = call(&mut engine, Request::new(Operation::CreateSnapshot, 0))?;
        let Some(id) = snapshot.snapshot_id else {
            return_errno_with_msg!(NotFound, "no snapshot id returned");
        };

        write(&mut engine, 4, 0xbb)?;
        sync(&mut engine)?;
        assert_eq!(read(&mut engine, 4, 1)?, data(0xbb, 1));
        assert_eq!(read_snapshot(&mut engine, id, 4)?, data(0xaa, 1));
        assert_eq!(read_snapshot(&mut engine, id, 5)?, data(0, 1));

        let mut engine = remount(engine)?;
        assert_eq!(read_snapshot(&mut engine, id, 4)?, data(0xaa, 1));
        assert!(!submit_and_run(&mut engine, Request::read_snapshot(id + 1, 4, 1, 0)).success);
        Ok(())
    }

    #[test]
    fn discarded_snapshot_releases_its_blocks() -> Result<()> {
        let mut engine = mounted(&config())?;
        write(&mut engine, 4, 0xaa)?;
        let id = call(&mut engine, Request::new(Operation::CreateSnapshot, 0))?
            .snapshot_id
            .ok_or(Error::new(NotFound))?;
        let sb = superblock(&engine)?;
        let pinned = sb.snapshots[0].generation;
        let old_data = free_list(&mut engine, &sb.free_tree)?
            .into_iter()
            .find(|entry| entry.last_vba == 4 && !entry.is_free())
            .ok_or(Error::new(NotFound))?
            .pba;
        write(&mut engine, 4, 0xbb)?;
        sync(&mut engine)?;

        let sb = superblock(&engine)?;
        let held = free_list(&mut engine, &sb.free_tree)?
            .into_iter()
            .filter(|entry| entry.is_free() && !entry.is_reclaimable(sb.generation, &[pinned]))
            .count();
        assert!(held > 0);

        call(&mut engine, Request::discard_snapshot(id, 0))?;
        let sb = superblock(&engine)?;
        assert!(sb.snapshots.is_empty());
        assert!(!submit_and_run(&mut engine, Request::read_snapshot(id, 4, 1, 0)).success);
        let held = free_list(&mut engine, &sb.free_tree)?
            .into_iter()
            .filter(|entry| entry.is_free() && !entry.is_reclaimable(sb.generation, &[]))
            .count();
        assert_eq!(held, 0);

        // Later writes take the block that held the snapshot's data.
        let mut reused = None;
        for round in 0..32u8 {
            write(&mut engine, u64::from(round % 16), round)?;
            sync(&mut engine)?;
            let sb = superblock(&engine)?;
            reused = free_list(&mut engine, &sb.free_tree)?
                .into_iter()
                .find(|entry| entry.pba == old_data && !entry.is_free());
            if reused.is_some() {
                break;
            }
        }
        let reused = reused.ok_or(Error::with_msg(NotFound, "old data block never reused"))?;
        assert!(reused.alloc_gen > pinned);
        Ok(())
    }

    #[test]
    fn rekeying_reencrypts_everything() -> Result<()> {
        let mut engine = mounted(&config())?;
        for vba in [0, 5, 15] {
            write(&mut engine, vba, vba as u8 + 1)?;
        }
        sync(&mut engine)?;

        let rekey = call(&mut engine, Request::new(Operation::Rekey, 0))?;
        assert_eq!(rekey.key_id, 2);
        let sb = superblock(&engine)?;
        assert_eq!(sb.state, SuperblockState::Normal);
        assert_eq!(sb.current_key.id, 2);
        assert!(sb.previous_key.is_none());

        let written: Vec<Type2Node> = free_list(&mut engine, &sb.free_tree)?
            .into_iter()
            .filter(|entry| !entry.is_free() && entry.last_vba != crate::layers::tree::INVALID_VBA)
            .collect();
        assert_eq!(written.len(), 3);
        assert!(written.iter().all(|entry| entry.last_key_id == 2));

        let mut engine = remount(engine)?;
        for vba in [0, 5, 15] {
            assert_eq!(read(&mut engine, vba, 1)?, data(vba as u8 + 1, 1));
        }
        assert_eq!(read(&mut engine, 1, 1)?, data(0, 1));
        Ok(())
    }

    #[test]
    fn rekeying_resumes_after_a_crash() -> Result<()> {
        let mut engine = mounted(&config())?;
        for vba in 0..16 {
            write(&mut engine, vba, vba as u8)?;
        }
        sync(&mut engine)?;

        // Start rekeying and cut the power after a few VBAs.
        engine.submit_request(Request::new(Operation::Rekey, 1));
        while superblock(&engine)?.rekeying_vba < 6 {
            assert!(engine.execute());
        }
        let mut engine = remount(engine)?;
        let sb = superblock(&engine)?;
        assert_eq!(sb.state, SuperblockState::Rekeying);
        assert!(sb.previous_key.is_some());
        assert!(sb.rekeying_vba >= 5);

        // Client I/O stays correct on both sides of the cursor.
        assert_eq!(read(&mut engine, 2, 1)?, data(2, 1));
        assert_eq!(read(&mut engine, 12, 1)?, data(12, 1));
        write(&mut engine, 13, 0x77)?;

        call(&mut engine, Request::new(Operation::ResumeRekeying, 0))?;
        let sb = superblock(&engine)?;
        assert_eq!(sb.state, SuperblockState::Normal);
        assert!(sb.previous_key.is_none());

        let mut engine = remount(engine)?;
        for vba in 0..16 {
            let expected = if vba == 13 { 0x77 } else { vba as u8 };
            assert_eq!(read(&mut engine, vba, 1)?, data(expected, 1));
        }
        Ok(())
    }

    #[test]
    fn rekeying_is_refused_while_snapshots_are_kept() -> Result<()> {
        let mut engine = mounted(&config())?;
        call(&mut engine, Request::new(Operation::CreateSnapshot, 0))?;
        assert!(!submit_and_run(&mut engine, Request::new(Operation::Rekey, 0)).success);
        assert_eq!(superblock(&engine)?.current_key.id, 1);
        Ok(())
    }

    #[test]
    fn vbd_extension() -> Result<()> {
        let mut engine = mounted(&config())?;
        write(&mut engine, 15, 0x15)?;
        // 16 leaves fill the tree of degree 4 and height 2, so it grows.
        call(&mut engine, Request::extend_vbd(6, 0))?;
        let sb = superblock(&engine)?;
        assert_eq!(sb.vbd.geometry.nr_of_leaves, 22);
        assert_eq!(sb.vbd.geometry.max_level_idx, 3);
        assert_eq!(sb.state, SuperblockState::Normal);

        write(&mut engine, 21, 0x21)?;
        let mut engine = remount(engine)?;
        assert_eq!(read(&mut engine, 15, 1)?, data(0x15, 1));
        assert_eq!(read(&mut engine, 16, 1)?, data(0, 1));
        call(&mut engine, Request::write(21, data(0x21, 1), 0))?;
        assert_eq!(read(&mut engine, 21, 1)?, data(0x21, 1));
        Ok(())
    }

    #[test]
    fn free_tree_extension() -> Result<()> {
        let config = config();
        let mut engine = mounted(&config)?;
        let before = superblock(&engine)?;
        let device_blocks = engine.device().nr_of_blocks();
        engine.device_mut().resize(device_blocks + 20)?;

        call(&mut engine, Request::extend_ft(12, 0))?;
        let sb = superblock(&engine)?;
        assert_eq!(sb.state, SuperblockState::Normal);
        assert_eq!(sb.free_tree.geometry.nr_of_leaves, before.free_tree.geometry.nr_of_leaves + 12);
        assert_eq!(sb.nr_of_pbas, before.nr_of_pbas + 12);

        let appended: Vec<Type2Node> = free_list(&mut engine, &sb.free_tree)?
            .into_iter()
            .filter(|entry| entry.pba >= before.nr_of_pbas)
            .collect();
        assert_eq!(appended.len(), 12);
        assert!(appended.iter().all(Type2Node::is_free));

        let mut engine = remount(engine)?;
        assert_eq!(superblock(&engine)?.free_tree, sb.free_tree);
        write(&mut engine, 0, 1)?;
        sync(&mut engine)?;
        Ok(())
    }

    #[test]
    fn free_tree_extension_beyond_the_device_fails() -> Result<()> {
        let mut engine = mounted(&config())?;
        let before = superblock(&engine)?;
        let spare = engine.device().nr_of_blocks() - before.nr_of_pbas;

        assert!(!submit_and_run(&mut engine, Request::extend_ft(spare + 48, 0)).success);
        assert!(!submit_and_run(&mut engine, Request::extend_ft(u64::MAX, 0)).success);
        let sb = superblock(&engine)?;
        assert_eq!(sb.state, SuperblockState::Normal);
        assert_eq!(sb.nr_of_pbas, before.nr_of_pbas);
        assert_eq!(sb.free_tree, before.free_tree);

        call(&mut engine, Request::extend_ft(spare, 0))?;
        assert_eq!(superblock(&engine)?.nr_of_pbas, engine.device().nr_of_blocks());
        Ok(())
    }

    #[test]
    fn corrupted_data_is_detected() -> Result<()> {
        let mut engine = mounted(&config())?;
        write(&mut engine, 9, 0x99)?;
        sync(&mut engine)?;

        let sb = superblock(&engine)?;
        let entry = free_list(&mut engine, &sb.free_tree)?
            .into_iter()
            .find(|entry| entry.last_vba == 9 && !entry.is_free())
            .ok_or(Error::new(NotFound))?;
        let mut block = Block::new_zeroed();
        engine.device_mut().read(entry.pba, block.as_mut_slice())?;
        block.as_mut_slice()[0] ^= 1;
        engine.device_mut().write(entry.pba, block.as_slice())?;

        assert!(!submit_and_run(&mut engine, Request::read(9, 1, 0)).success);
        assert_eq!(read(&mut engine, 8, 1)?, data(0, 1));
        Ok(())
    }

    #[test]
    fn failed_device_write_fails_the_request() -> Result<()> {
        let mut engine = mounted(&config())?;
        engine.device_mut().fail_next_write();
        assert!(!submit_and_run(&mut engine, Request::write(3, data(3, 1), 0)).success);
        // The next attempt goes through.
        write(&mut engine, 3, 3)?;
        assert_eq!(read(&mut engine, 3, 1)?, data(3, 1));
        Ok(())
    }

    #[test]
    fn failed_write_leaves_the_free_tree_intact() -> Result<()> {
        let mut engine = mounted(&config())?;
        write(&mut engine, 1, 0x11)?;
        engine.device_mut().fail_next_write();
        assert!(!submit_and_run(&mut engine, Request::write(3, data(0x33, 1), 0)).success);

        write(&mut engine, 4, 0x44)?;
        sync(&mut engine)?;
        let mut engine = remount(engine)?;
        write(&mut engine, 5, 0x55)?;
        sync(&mut engine)?;
        assert_eq!(
            read(&mut engine, 1, 5)?,
            [data(0x11, 1), data(0, 1), data(0, 1), data(0x44, 1), data(0x55, 1)].concat()
        );
        Ok(())
    }

    #[test]
    fn deinitialize_unmounts() -> Result<()> {
        let mut engine = mounted(&config())?;
        write(&mut engine, 6, 6)?;
        call(&mut engine, Request::new(Operation::Deinitialize, 0))?;
        assert!(engine.superblock().is_none());
        assert!(!submit_and_run(&mut engine, Request::read(6, 1, 0)).success);

        // Deinitializing committed the write.
        call(&mut engine, Request::new(Operation::Initialize, 0))?;
        assert_eq!(read(&mut engine, 6, 1)?, data(6, 1));
        Ok(())
    }

    #[test]
    fn completions_keep_their_tags() -> Result<()> {
        let mut engine = mounted(&config())?;
        let tags: Vec<Tag> = (10..26).collect();
        for tag in &tags {
            engine.submit_request(Request::write(*tag % 16, data(*tag as u8, 1), *tag));
        }
        assert!(!engine.ready_to_submit_request());
        engine.run();

        let mut completed = Vec::new();
        while engine.peek_completed_request().is_some() {
            let request = engine.drop_completed_request();
            assert!(request.success);
            completed.push(request.tag);
        }
        completed.sort_unstable();
        assert_eq!(completed, tags);
        assert!(engine.ready_to_submit_request());
        Ok(())
    }
}

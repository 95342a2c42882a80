// SPDX-License-Identifier: MPL-2.0

//! A router for the tree modules that serves block traffic from a map.

use std::collections::BTreeMap;

use super::{
    AllocContext, FreeTree, FtRequest, Generations, MetaTree, MtRequest, NodeEntry, TreeBuilder,
    TreeGeometry, TreeRoot, TreeWalk, Type1Node, Type2Node, Vbd, VbdRequest,
};
use crate::{
    dispatch::Module,
    layers::{bio::BlockIoOp, cache::CacheOp},
    prelude::*,
};

pub(crate) struct Rig {
    pub disk: BTreeMap<Pba, Block>,
    next_pba: Pba,
    vbd: Vbd,
    free_tree: FreeTree,
    meta_tree: MetaTree,
}

impl Rig {
    pub fn new() -> Self {
        Self {
            disk: BTreeMap::new(),
            next_pba: 1000,
            vbd: Vbd::new(),
            free_tree: FreeTree::new(),
            meta_tree: MetaTree::new(),
        }
    }

    fn build<T: NodeEntry>(
        &mut self,
        geometry: TreeGeometry,
        entries: &[T],
        unused: T,
    ) -> Result<TreeRoot> {
        let builder = TreeBuilder::new(geometry, self.next_pba);
        self.next_pba += builder.nr_of_blocks();
        let (root, blocks) =
            builder.build(|unit| entries.get(unit as usize).copied().unwrap_or(unused))?;
        self.disk.extend(blocks);
        Ok(root)
    }

    /// Builds a free list whose entries track `in_use` and then `free`.
    pub fn build_free_list(
        &mut self,
        geometry: TreeGeometry,
        free: &[Pba],
        in_use: &[Pba],
    ) -> Result<TreeRoot> {
        let entries: Vec<Type2Node> = in_use
            .iter()
            .map(|pba| Type2Node::in_use(*pba, 0))
            .chain(free.iter().map(|pba| Type2Node::free(*pba, 0, 0)))
            .collect();
        self.build(geometry, &entries, Type2Node::empty())
    }

    /// Builds a volume whose free tree tracks the VBD nodes and the spare
    /// data blocks from 2000 on. The meta tree spares start at 3000.
    pub fn build_volume(
        &mut self,
        vbd: TreeGeometry,
        free_tree: TreeGeometry,
        meta_tree: TreeGeometry,
    ) -> Result<(TreeRoot, AllocContext)> {
        let first_vbd_node = self.next_pba;
        let vbd = self.build(vbd, &[], Type1Node::default())?;
        let vbd_nodes: Vec<Pba> = (first_vbd_node..self.next_pba).collect();
        let nr_of_spares = free_tree.nr_of_leaves - vbd_nodes.len() as u64;
        let spares: Vec<Pba> = (2000..2000 + nr_of_spares).collect();
        let free_tree = self.build_free_list(free_tree, &spares, &vbd_nodes)?;
        let mt_spares: Vec<Pba> = (3000..3000 + meta_tree.nr_of_leaves).collect();
        let meta_tree = self.build_free_list(meta_tree, &mt_spares, &[])?;
        Ok((
            vbd,
            AllocContext {
                free_tree,
                meta_tree,
                gens: Generations {
                    curr: 1,
                    last_secured: 0,
                },
                snapshots: Vec::new(),
            },
        ))
    }

    pub fn read(&self, pba: Pba) -> Result<Block> {
        self.disk
            .get(&pba)
            .cloned()
            .ok_or(Error::with_msg(NotFound, "block was never written"))
    }

    /// Loads every leaf entry of a free list, verifying all hashes.
    pub fn free_list(&self, root: &TreeRoot) -> Result<Vec<Type2Node>> {
        let mut walk = TreeWalk::new(*root);
        while let Some((key, reference)) = walk.next_to_load_all()? {
            walk.insert_loaded(key, reference, self.read(reference.pba)?)?;
        }
        (0..root.geometry.nr_of_leaves)
            .map(|unit| walk.entry(unit))
            .collect()
    }

    pub fn exchange(&mut self, request: MtRequest) -> Result<MtRequest> {
        let request = payload_of!(self.run(Payload::MetaTree(request)), MetaTree);
        if !request.success {
            return_errno_with_msg!(OutOfDisk, "exchange failed");
        }
        Ok(request)
    }

    pub fn free_tree(&mut self, request: FtRequest) -> Result<FtRequest> {
        let request = payload_of!(self.run(Payload::FreeTree(request)), FreeTree);
        if !request.success {
            return_errno_with_msg!(OutOfDisk, "free tree request failed");
        }
        Ok(request)
    }

    pub fn vbd(&mut self, request: VbdRequest) -> Result<VbdRequest> {
        let request = payload_of!(self.run(Payload::Vbd(request)), Vbd);
        if !request.success {
            return_errno_with_msg!(IoFailed, "vbd request failed");
        }
        Ok(request)
    }

    fn module(&mut self, id: ModuleId) -> &mut dyn Module {
        match id {
            ModuleId::Vbd => &mut self.vbd,
            ModuleId::FreeTree => &mut self.free_tree,
            ModuleId::MetaTree => &mut self.meta_tree,
            other => panic!("the rig does not host {:?}", other),
        }
    }

    fn serve(&mut self, payload: &mut Payload) {
        let (read, pba, block, success) = match payload {
            Payload::Cache(request) => (
                request.op == CacheOp::Read,
                request.pba,
                &mut request.block,
                &mut request.success,
            ),
            Payload::BlockIo(request) => (
                request.op == BlockIoOp::Read,
                request.pba,
                &mut request.block,
                &mut request.success,
            ),
            other => panic!("the rig cannot serve {:?}", other.module()),
        };
        if read {
            *block = self.disk.get(&pba).cloned();
            *success = block.is_some();
        } else {
            if let Some(block) = block.take() {
                self.disk.insert(pba, block);
            }
            *success = true;
        }
    }

    /// Submits `payload` and routes until it completes.
    fn run(&mut self, payload: Payload) -> Payload {
        let target = payload.module();
        self.module(target)
            .submit_request(ModuleRequest::new(ModuleId::Client, 0, payload));
        loop {
            let mut progress = false;
            for id in [ModuleId::Vbd, ModuleId::FreeTree, ModuleId::MetaTree] {
                self.module(id).execute(&mut progress);
                while self.module(id).peek_generated_request().is_some() {
                    let mut request = self.module(id).drop_generated_request();
                    match request.dst_module() {
                        ModuleId::Cache | ModuleId::BlockIo => {
                            self.serve(request.payload_mut());
                            self.module(id).generated_request_complete(request);
                        }
                        dst => self.module(dst).submit_request(request),
                    }
                    progress = true;
                }
                while let Some(completed) = self.module(id).peek_completed_request() {
                    let src = completed.src_module();
                    let request = self.module(id).drop_completed_request();
                    if src == ModuleId::Client {
                        return request.into_payload();
                    }
                    self.module(src).generated_request_complete(request);
                    progress = true;
                }
            }
            assert!(progress, "tree modules stalled");
        }
    }
}

// SPDX-License-Identifier: MPL-2.0

//! The cooperative module-dispatch protocol.
//!
//! Every component of the engine is a [`Module`] that owns a fixed number
//! of channels. A request submitted to a module is bound to a free channel
//! whose index becomes the request's `dst_request_id`. While executing, a
//! channel may generate one sub-request at a time for another module and
//! resumes once that sub-request comes back completed.
//!
//! Nothing in here blocks: `execute` advances each channel by at most one
//! step and reports whether anything changed. A driver loop owned by the
//! engine moves generated and completed requests between modules until no
//! module makes progress.

mod channel;

use log::trace;

pub(crate) use self::channel::{Channel, Channels};
use crate::layers::{
    bio::BlockIoRequest,
    cache::CacheRequest,
    control::{Request, SbControlRequest},
    crypto::{CryptoRequest, TrustAnchorRequest},
    init::{FormatRequest, FtInitRequest, VbdInitRequest},
    tree::{AllocRequest, FtRequest, MtRequest, VbdRequest},
};

/// The index of a channel inside its module. It doubles as request id.
pub type ChannelId = u8;

/// Identifies a module of the engine.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum ModuleId {
    /// The caller outside of the engine.
    Client,
    RequestPool,
    SuperblockControl,
    Vbd,
    FreeTree,
    MetaTree,
    Crypto,
    TrustAnchor,
    Cache,
    BlockIo,
    BlockAllocator,
    VbdInitializer,
    FtInitializer,
    SbInitializer,
}

impl ModuleId {
    /// All modules in the order the driver loop visits them.
    pub const MODULES: [ModuleId; 13] = [
        ModuleId::RequestPool,
        ModuleId::SuperblockControl,
        ModuleId::Vbd,
        ModuleId::FreeTree,
        ModuleId::MetaTree,
        ModuleId::Crypto,
        ModuleId::TrustAnchor,
        ModuleId::Cache,
        ModuleId::BlockIo,
        ModuleId::BlockAllocator,
        ModuleId::SbInitializer,
        ModuleId::VbdInitializer,
        ModuleId::FtInitializer,
    ];
}

/// The typed content of a module request, one variant per receiving module.
#[derive(Debug)]
pub enum Payload {
    RequestPool(Request),
    SuperblockControl(SbControlRequest),
    Vbd(VbdRequest),
    FreeTree(FtRequest),
    MetaTree(MtRequest),
    Crypto(CryptoRequest),
    TrustAnchor(TrustAnchorRequest),
    Cache(CacheRequest),
    BlockIo(BlockIoRequest),
    BlockAllocator(AllocRequest),
    VbdInitializer(VbdInitRequest),
    FtInitializer(FtInitRequest),
    SbInitializer(FormatRequest),
}

impl Payload {
    /// The module that serves this payload.
    pub fn module(&self) -> ModuleId {
        match self {
            Payload::RequestPool(_) => ModuleId::RequestPool,
            Payload::SuperblockControl(_) => ModuleId::SuperblockControl,
            Payload::Vbd(_) => ModuleId::Vbd,
            Payload::FreeTree(_) => ModuleId::FreeTree,
            Payload::MetaTree(_) => ModuleId::MetaTree,
            Payload::Crypto(_) => ModuleId::Crypto,
            Payload::TrustAnchor(_) => ModuleId::TrustAnchor,
            Payload::Cache(_) => ModuleId::Cache,
            Payload::BlockIo(_) => ModuleId::BlockIo,
            Payload::BlockAllocator(_) => ModuleId::BlockAllocator,
            Payload::VbdInitializer(_) => ModuleId::VbdInitializer,
            Payload::FtInitializer(_) => ModuleId::FtInitializer,
            Payload::SbInitializer(_) => ModuleId::SbInitializer,
        }
    }
}

/// Unwraps the payload variant a module expects.
///
/// # Panics
///
/// A payload of any other kind means the router delivered a request to the
/// wrong module, which is a protocol violation.
#[macro_export]
macro_rules! payload_of {
    ($payload: expr, $variant: ident) => {
        match $payload {
            $crate::dispatch::Payload::$variant(inner) => inner,
            other => panic!(
                "expected a {} payload, got one for {:?}",
                stringify!($variant),
                other.module()
            ),
        }
    };
}

/// The internal message unit of the dispatch protocol.
#[derive(Debug)]
pub struct ModuleRequest {
    src_module: ModuleId,
    src_request_id: ChannelId,
    dst_module: ModuleId,
    dst_request_id: ChannelId,
    payload: Payload,
}

impl ModuleRequest {
    /// Creates a request from channel `src_request_id` of `src_module`.
    /// The destination is the module that serves `payload`.
    pub fn new(src_module: ModuleId, src_request_id: ChannelId, payload: Payload) -> Self {
        Self {
            src_module,
            src_request_id,
            dst_module: payload.module(),
            dst_request_id: 0,
            payload,
        }
    }

    pub fn src_module(&self) -> ModuleId {
        self.src_module
    }

    pub fn src_request_id(&self) -> ChannelId {
        self.src_request_id
    }

    pub fn dst_module(&self) -> ModuleId {
        self.dst_module
    }

    /// The channel that serves the request. Only meaningful once submitted.
    pub fn dst_request_id(&self) -> ChannelId {
        self.dst_request_id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub(crate) fn set_dst_request_id(&mut self, id: ChannelId) {
        self.dst_request_id = id;
    }
}

/// The interface every engine component exposes to the driver loop.
pub trait Module {
    /// Returns whether a free channel exists.
    fn ready_to_submit_request(&self) -> bool;

    /// Binds `request` to a free channel.
    ///
    /// # Panics
    ///
    /// Panics if the module is not ready to take a request.
    fn submit_request(&mut self, request: ModuleRequest);

    /// Advances every busy channel by at most one step. Sets `progress` if
    /// any channel changed its state.
    fn execute(&mut self, progress: &mut bool);

    /// Returns a request whose processing has finished, if any.
    fn peek_completed_request(&self) -> Option<&ModuleRequest>;

    /// Releases the channel of the request returned by the last peek and
    /// hands the request back to the caller.
    ///
    /// # Panics
    ///
    /// Panics if there is no completed request.
    fn drop_completed_request(&mut self) -> ModuleRequest;

    /// Returns a sub-request that another module must perform, if any.
    fn peek_generated_request(&self) -> Option<&ModuleRequest>;

    /// Takes the sub-request returned by the last peek. The issuing channel
    /// then waits for `generated_request_complete`.
    ///
    /// # Panics
    ///
    /// Panics if there is no generated request.
    fn drop_generated_request(&mut self) -> ModuleRequest;

    /// Hands a completed sub-request back to the channel that generated it.
    ///
    /// # Panics
    ///
    /// Panics if that channel is not waiting for it.
    fn generated_request_complete(&mut self, request: ModuleRequest);
}

/// What a channel does after advancing its state machine by one step.
pub(crate) enum Action {
    /// Issue a sub-request and wait for its completion.
    Generate(Payload),
    /// The request is finished.
    Complete,
}

/// Unwraps the sub-request a resumed channel was waiting for.
///
/// # Panics
///
/// Panics if there is none, which means a state that waits for a response
/// was entered without generating a request.
pub(crate) fn expect_response(response: Option<Payload>) -> Payload {
    match response {
        Some(payload) => payload,
        None => panic!("channel resumed without the response it waits for"),
    }
}

/// A module built on a [`Channels`] arena.
///
/// Implementors only describe how a request enters a channel and how one
/// channel advances; the [`Module`] protocol is derived from that.
pub(crate) trait ChannelModule {
    type State;

    const ID: ModuleId;

    fn channels(&self) -> &Channels<Self::State>;

    fn channels_mut(&mut self) -> &mut Channels<Self::State>;

    /// Returns the initial state of a channel serving `request`.
    fn accept(&mut self, request: &mut ModuleRequest) -> Self::State;

    /// Advances `channel` by at most one step. Returns whether it changed.
    fn step(&mut self, channel: &mut Channel<Self::State>) -> bool;
}

impl<M: ChannelModule> Module for M {
    fn ready_to_submit_request(&self) -> bool {
        self.channels().has_free_slot()
    }

    fn submit_request(&mut self, mut request: ModuleRequest) {
        if !self.channels().has_free_slot() {
            panic!("[{:?}] submit_request while not ready", M::ID);
        }
        if request.dst_module() != M::ID {
            panic!(
                "[{:?}] received a request addressed to {:?}",
                M::ID,
                request.dst_module()
            );
        }
        let state = self.accept(&mut request);
        let id = self.channels_mut().submit(request, state);
        trace!("[{:?}] request submitted to channel {}", M::ID, id);
    }

    fn execute(&mut self, progress: &mut bool) {
        for id in 0..self.channels().capacity() {
            let Some(mut channel) = self.channels_mut().take_busy(id) else {
                continue;
            };
            if self.step(&mut channel) {
                *progress = true;
            }
            self.channels_mut().restore(channel);
        }
    }

    fn peek_completed_request(&self) -> Option<&ModuleRequest> {
        self.channels().peek_completed()
    }

    fn drop_completed_request(&mut self) -> ModuleRequest {
        self.channels_mut().drop_completed()
    }

    fn peek_generated_request(&self) -> Option<&ModuleRequest> {
        self.channels().peek_generated()
    }

    fn drop_generated_request(&mut self) -> ModuleRequest {
        self.channels_mut().drop_generated()
    }

    fn generated_request_complete(&mut self, request: ModuleRequest) {
        self.channels_mut().generated_complete(request)
    }
}

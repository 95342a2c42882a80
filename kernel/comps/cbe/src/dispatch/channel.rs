// SPDX-License-Identifier: MPL-2.0

use core::mem;

use super::{Action, ChannelId, ModuleId, ModuleRequest, Payload};
use crate::prelude::Result;

/// The life cycle of the one sub-request a channel may have outstanding.
#[derive(Debug, Default)]
enum Generated {
    #[default]
    Idle,
    /// Waiting for the router to pick it up.
    Pending(ModuleRequest),
    /// Handed to the destination module.
    InFlight,
    /// Came back completed, not consumed by the channel yet.
    Done(ModuleRequest),
}

/// A slot holding one in-flight request and the state of its processing.
pub(crate) struct Channel<S> {
    id: ChannelId,
    module: ModuleId,
    request: ModuleRequest,
    generated: Generated,
    completed: bool,
    pub(crate) state: S,
}

impl<S> Channel<S> {
    pub(crate) fn payload(&self) -> &Payload {
        self.request.payload()
    }

    pub(crate) fn payload_mut(&mut self) -> &mut Payload {
        self.request.payload_mut()
    }

    /// Issues a sub-request to the module serving `payload`.
    ///
    /// # Panics
    ///
    /// Panics if the channel already has a sub-request outstanding.
    pub(crate) fn generate(&mut self, payload: Payload) {
        if !matches!(self.generated, Generated::Idle) {
            panic!(
                "[{:?}] channel {} generates while a sub-request is outstanding",
                self.module, self.id
            );
        }
        let request = ModuleRequest::new(self.module, self.id, payload);
        self.generated = Generated::Pending(request);
    }

    /// Whether a generated sub-request has not come back yet.
    pub(crate) fn is_waiting(&self) -> bool {
        matches!(self.generated, Generated::Pending(_) | Generated::InFlight)
    }

    /// Takes the completed sub-request, if it came back.
    pub(crate) fn take_response(&mut self) -> Option<Payload> {
        match mem::take(&mut self.generated) {
            Generated::Done(request) => Some(request.into_payload()),
            other => {
                self.generated = other;
                None
            }
        }
    }

    /// Marks the request as finished. The channel is released once the
    /// router has dropped the completed request.
    pub(crate) fn complete(&mut self) {
        self.completed = true;
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed
    }

    /// Advances a channel whose state machine is written as `advance`.
    ///
    /// `advance` receives the completed sub-request, if any, and is not
    /// called while one is outstanding. `finish` records the outcome in the
    /// payload before the request completes. Returns whether the channel
    /// changed.
    pub(crate) fn resume(
        &mut self,
        advance: impl FnOnce(&mut Payload, &mut S, Option<Payload>) -> Result<Action>,
        finish: impl FnOnce(&mut Payload, Result<()>),
    ) -> bool {
        if self.is_waiting() {
            return false;
        }
        let response = self.take_response();
        match advance(self.request.payload_mut(), &mut self.state, response) {
            Ok(Action::Generate(payload)) => self.generate(payload),
            Ok(Action::Complete) => {
                finish(self.request.payload_mut(), Ok(()));
                self.complete();
            }
            Err(err) => {
                finish(self.request.payload_mut(), Err(err));
                self.complete();
            }
        }
        true
    }
}

/// A fixed-capacity arena of channels.
pub(crate) struct Channels<S> {
    module: ModuleId,
    slots: Vec<Option<Channel<S>>>,
}

impl<S> Channels<S> {
    /// # Panics
    ///
    /// Panics if `capacity` does not fit the `ChannelId` range.
    pub(crate) fn new(module: ModuleId, capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity <= ChannelId::MAX as usize + 1,
            "invalid channel capacity"
        );
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { module, slots }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn has_free_slot(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    /// The number of channels that are not inactive.
    pub(crate) fn nr_of_active(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub(crate) fn submit(&mut self, mut request: ModuleRequest, state: S) -> ChannelId {
        let Some(index) = self.slots.iter().position(Option::is_none) else {
            panic!("[{:?}] no free channel", self.module);
        };
        let id = index as ChannelId;
        request.set_dst_request_id(id);
        self.slots[index] = Some(Channel {
            id,
            module: self.module,
            request,
            generated: Generated::Idle,
            completed: false,
            state,
        });
        id
    }

    /// Takes a channel that still has work to do out of the arena.
    pub(crate) fn take_busy(&mut self, index: usize) -> Option<Channel<S>> {
        match &self.slots[index] {
            Some(channel) if !channel.completed => self.slots[index].take(),
            _ => None,
        }
    }

    pub(crate) fn restore(&mut self, channel: Channel<S>) {
        let index = channel.id as usize;
        debug_assert!(self.slots[index].is_none());
        self.slots[index] = Some(channel);
    }

    pub(crate) fn peek_completed(&self) -> Option<&ModuleRequest> {
        self.slots
            .iter()
            .flatten()
            .find(|channel| channel.completed)
            .map(|channel| &channel.request)
    }

    pub(crate) fn drop_completed(&mut self) -> ModuleRequest {
        let Some(index) = self
            .slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|channel| channel.completed))
        else {
            panic!("[{:?}] drop_completed_request without a completed request", self.module);
        };
        let Some(channel) = self.slots[index].take() else {
            unreachable!()
        };
        channel.request
    }

    pub(crate) fn peek_generated(&self) -> Option<&ModuleRequest> {
        self.slots.iter().flatten().find_map(|channel| match &channel.generated {
            Generated::Pending(request) => Some(request),
            _ => None,
        })
    }

    pub(crate) fn drop_generated(&mut self) -> ModuleRequest {
        for channel in self.slots.iter_mut().flatten() {
            if matches!(channel.generated, Generated::Pending(_)) {
                let Generated::Pending(request) =
                    mem::replace(&mut channel.generated, Generated::InFlight)
                else {
                    unreachable!()
                };
                return request;
            }
        }
        panic!("[{:?}] drop_generated_request without a generated request", self.module);
    }

    pub(crate) fn generated_complete(&mut self, request: ModuleRequest) {
        let index = request.src_request_id() as usize;
        match self.slots.get_mut(index).and_then(Option::as_mut) {
            Some(channel) if matches!(channel.generated, Generated::InFlight) => {
                channel.generated = Generated::Done(request);
            }
            _ => panic!(
                "[{:?}] channel {} is not waiting for a completed request",
                self.module, index
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::bio::BlockIoRequest;

    fn io_request() -> ModuleRequest {
        ModuleRequest::new(ModuleId::Client, 0, Payload::BlockIo(BlockIoRequest::sync()))
    }

    #[test]
    fn channel_index_is_request_id() {
        let mut channels: Channels<()> = Channels::new(ModuleId::BlockIo, 2);
        assert_eq!(channels.submit(io_request(), ()), 0);
        assert_eq!(channels.submit(io_request(), ()), 1);
        assert!(!channels.has_free_slot());
        assert_eq!(channels.nr_of_active(), 2);

        let mut channel = channels.take_busy(1).unwrap();
        channel.complete();
        channels.restore(channel);

        let completed = channels.peek_completed().unwrap();
        assert_eq!(completed.dst_request_id(), 1);
        channels.drop_completed();
        assert!(channels.has_free_slot());
        assert_eq!(channels.submit(io_request(), ()), 1);
    }

    #[test]
    fn generated_request_round_trip() {
        let mut channels: Channels<()> = Channels::new(ModuleId::Cache, 1);
        channels.submit(io_request(), ());
        let mut channel = channels.take_busy(0).unwrap();
        channel.generate(Payload::BlockIo(BlockIoRequest::sync()));
        assert!(channel.is_waiting());
        channels.restore(channel);

        let generated = channels.peek_generated().unwrap();
        assert_eq!(generated.src_module(), ModuleId::Cache);
        assert_eq!(generated.dst_module(), ModuleId::BlockIo);
        let generated = channels.drop_generated();
        assert!(channels.peek_generated().is_none());
        channels.generated_complete(generated);

        let mut channel = channels.take_busy(0).unwrap();
        assert!(!channel.is_waiting());
        assert!(channel.take_response().is_some());
        assert!(channel.take_response().is_none());
    }

    #[test]
    #[should_panic]
    fn submit_when_full_panics() {
        let mut channels: Channels<()> = Channels::new(ModuleId::BlockIo, 1);
        channels.submit(io_request(), ());
        channels.submit(io_request(), ());
    }

    #[test]
    #[should_panic]
    fn unexpected_completion_panics() {
        let mut channels: Channels<()> = Channels::new(ModuleId::Cache, 1);
        channels.submit(io_request(), ());
        channels.generated_complete(io_request());
    }
}

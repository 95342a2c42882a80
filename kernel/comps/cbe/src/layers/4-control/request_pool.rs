// SPDX-License-Identifier: MPL-2.0

use super::{Operation, Request, SbControlOp, SbControlRequest};
use crate::prelude::*;

pub(crate) struct PoolState {
    /// The position of the request in arrival order.
    seq: u64,
    /// The number of primitives completed so far.
    index: u64,
    /// Whether Superblock Control reported a stepwise operation finished.
    done: bool,
}

/// The entry point of client requests.
///
/// Requests are split into Superblock Control primitives and served one at
/// a time in the order they arrived. A request completes after its last
/// primitive, or with `success` cleared after the first that fails.
pub struct RequestPool {
    next_seq: u64,
    serving: u64,
    channels: Channels<PoolState>,
}

impl RequestPool {
    pub const NR_OF_CHANNELS: usize = 16;

    /// The largest number of blocks one read or write may span.
    pub const MAX_NR_OF_BLOCKS: u64 = 1 << 16;

    pub fn new() -> Self {
        Self {
            next_seq: 0,
            serving: 0,
            channels: Channels::new(ModuleId::RequestPool, Self::NR_OF_CHANNELS),
        }
    }

    /// The number of client requests not yet handed back.
    pub fn nr_of_pending(&self) -> usize {
        self.channels.nr_of_active()
    }

    fn advance(request: &mut Request, state: &mut PoolState, response: Option<Payload>) -> Result<Action> {
        match response {
            Some(response) => {
                let primitive = payload_of!(response, SuperblockControl);
                if !primitive.success {
                    return_errno_with_msg!(IoFailed, "superblock control primitive failed");
                }
                match request.operation {
                    Operation::Read => {
                        let Some(block) = primitive.block else {
                            return_errno_with_msg!(IoFailed, "read returned no block");
                        };
                        let start = state.index as usize * BLOCK_SIZE;
                        request.data[start..start + BLOCK_SIZE].copy_from_slice(block.as_slice());
                    }
                    Operation::CreateSnapshot => request.snapshot_id = primitive.snapshot_id,
                    Operation::Rekey if state.index == 0 => request.key_id = primitive.key_id,
                    _ => {}
                }
                state.done = primitive.done;
                state.index += 1;
            }
            None => match request.operation {
                Operation::Read => request.data = vec![0; Self::data_len(request)?],
                Operation::Write if request.data.len() != Self::data_len(request)? => {
                    return_errno_with_msg!(NotBlockSizeAligned, "data does not match the block count");
                }
                _ => {}
            },
        }
        match Self::next_primitive(request, state)? {
            Some(primitive) => Ok(Action::Generate(Payload::SuperblockControl(primitive))),
            None => Ok(Action::Complete),
        }
    }

    /// The number of data bytes of a read or write, once its block range
    /// is known to be addressable.
    fn data_len(request: &Request) -> Result<usize> {
        if request.count > Self::MAX_NR_OF_BLOCKS {
            return_errno_with_msg!(InvalidArgs, "too many blocks for one request");
        }
        if request.block_number.checked_add(request.count).is_none() {
            return_errno_with_msg!(InvalidArgs, "block range overflows");
        }
        Ok(request.count as usize * BLOCK_SIZE)
    }

    /// The primitive that continues `request`, or `None` if it is finished.
    fn next_primitive(request: &Request, state: &PoolState) -> Result<Option<SbControlRequest>> {
        let first = state.index == 0;
        let once = |op| first.then(|| SbControlRequest::new(op));
        let primitive = match request.operation {
            Operation::Read => (state.index < request.count).then(|| {
                SbControlRequest::read(request.block_number + state.index, request.snapshot_id)
            }),
            Operation::Write => {
                if state.index < request.count {
                    let block = Block::from_slice(request.block_data(state.index)?)?;
                    Some(SbControlRequest::write(request.block_number + state.index, block))
                } else {
                    None
                }
            }
            Operation::Sync => once(SbControlOp::Sync),
            Operation::CreateSnapshot => once(SbControlOp::CreateSnapshot),
            Operation::DiscardSnapshot => once(SbControlOp::DiscardSnapshot).map(|primitive| {
                SbControlRequest {
                    snapshot_id: request.snapshot_id,
                    ..primitive
                }
            }),
            Operation::Rekey if first => Some(SbControlRequest::new(SbControlOp::InitializeRekeying)),
            Operation::Rekey | Operation::ResumeRekeying => {
                (!state.done).then(|| SbControlRequest::new(SbControlOp::RekeyVba))
            }
            Operation::ExtendVbd => {
                (!state.done).then(|| SbControlRequest::extend(SbControlOp::ExtendVbd, request.count))
            }
            Operation::ExtendFt => {
                (!state.done).then(|| SbControlRequest::extend(SbControlOp::ExtendFt, request.count))
            }
            Operation::Initialize => once(SbControlOp::Initialize),
            Operation::Deinitialize => once(SbControlOp::Deinitialize),
        };
        Ok(primitive)
    }
}

impl Default for RequestPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelModule for RequestPool {
    type State = PoolState;

    const ID: ModuleId = ModuleId::RequestPool;

    fn channels(&self) -> &Channels<PoolState> {
        &self.channels
    }

    fn channels_mut(&mut self) -> &mut Channels<PoolState> {
        &mut self.channels
    }

    fn accept(&mut self, request: &mut ModuleRequest) -> PoolState {
        let client = payload_of!(request.payload(), RequestPool);
        debug!("[RequestPool] accepted {:?} with tag {}", client.operation, client.tag);
        let seq = self.next_seq;
        self.next_seq += 1;
        PoolState {
            seq,
            index: 0,
            done: false,
        }
    }

    fn step(&mut self, channel: &mut Channel<PoolState>) -> bool {
        if channel.state.seq != self.serving {
            return false;
        }
        let changed = channel.resume(
            |payload, state, response| Self::advance(payload_of!(payload, RequestPool), state, response),
            |payload, result| {
                let request = payload_of!(payload, RequestPool);
                if let Err(err) = &result {
                    warn!(
                        "[RequestPool] {:?} with tag {} failed: {}",
                        request.operation, request.tag, err
                    );
                }
                request.success = result.is_ok();
            },
        );
        if channel.is_completed() {
            self.serving += 1;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Module;

    fn submit(pool: &mut RequestPool, request: Request) {
        pool.submit_request(ModuleRequest::new(
            ModuleId::Client,
            0,
            Payload::RequestPool(request),
        ));
    }

    fn execute(pool: &mut RequestPool) {
        let mut progress = false;
        pool.execute(&mut progress);
    }

    /// Executes the pool and answers the primitive it generates with `answer`.
    fn serve(pool: &mut RequestPool, answer: impl FnOnce(&mut SbControlRequest)) -> SbControlOp {
        execute(pool);
        let mut generated = pool.drop_generated_request();
        assert!(pool.peek_generated_request().is_none());
        let primitive = payload_of!(generated.payload_mut(), SuperblockControl);
        let op = primitive.op;
        answer(primitive);
        pool.generated_request_complete(generated);
        op
    }

    fn completed(pool: &mut RequestPool) -> Request {
        execute(pool);
        match pool.drop_completed_request().into_payload() {
            Payload::RequestPool(request) => request,
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn requests_are_served_in_arrival_order() {
        let mut pool = RequestPool::new();
        submit(&mut pool, Request::write(7, vec![1; 2 * BLOCK_SIZE], 1));
        submit(&mut pool, Request::new(Operation::Sync, 2));

        let mut vbas = Vec::new();
        for _ in 0..2 {
            assert_eq!(
                serve(&mut pool, |primitive| {
                    vbas.push(primitive.vba);
                    primitive.success = true;
                }),
                SbControlOp::WriteVba
            );
        }
        assert_eq!(vbas, [7, 8]);

        let write = completed(&mut pool);
        assert_eq!((write.tag, write.success), (1, true));
        assert_eq!(
            serve(&mut pool, |primitive| primitive.success = true),
            SbControlOp::Sync
        );
        assert_eq!(completed(&mut pool).tag, 2);
        assert_eq!(pool.nr_of_pending(), 0);
    }

    #[test]
    fn read_gathers_the_blocks() {
        let mut pool = RequestPool::new();
        submit(&mut pool, Request::read(3, 2, 5));
        for fill in [0xaa, 0xbb] {
            serve(&mut pool, |primitive| {
                let mut block = Block::new_zeroed();
                block.as_mut_slice().fill(fill);
                primitive.block = Some(block);
                primitive.success = true;
            });
        }
        let read = completed(&mut pool);
        assert!(read.success);
        assert_eq!(read.data.len(), 2 * BLOCK_SIZE);
        assert!(read.data[..BLOCK_SIZE].iter().all(|byte| *byte == 0xaa));
        assert!(read.data[BLOCK_SIZE..].iter().all(|byte| *byte == 0xbb));
    }

    #[test]
    fn failed_primitive_fails_the_request() {
        let mut pool = RequestPool::new();
        submit(&mut pool, Request::write(0, vec![0; 3 * BLOCK_SIZE], 9));
        serve(&mut pool, |primitive| primitive.success = true);
        serve(&mut pool, |primitive| primitive.success = false);
        let write = completed(&mut pool);
        assert!(!write.success);
    }

    #[test]
    fn misaligned_write_is_refused() {
        let mut pool = RequestPool::new();
        let mut request = Request::write(0, vec![0; BLOCK_SIZE], 1);
        request.data.truncate(100);
        submit(&mut pool, request);
        assert!(!completed(&mut pool).success);
    }

    #[test]
    fn unaddressable_ranges_are_refused() {
        let mut pool = RequestPool::new();
        submit(&mut pool, Request::read(0, u64::MAX, 1));
        assert!(!completed(&mut pool).success);

        submit(&mut pool, Request::read(u64::MAX, 2, 2));
        assert!(!completed(&mut pool).success);

        submit(&mut pool, Request::write(u64::MAX, vec![0; 2 * BLOCK_SIZE], 3));
        assert!(!completed(&mut pool).success);

        let mut huge = Request::write(0, Vec::new(), 4);
        huge.count = RequestPool::MAX_NR_OF_BLOCKS + 1;
        submit(&mut pool, huge);
        assert!(!completed(&mut pool).success);
        assert_eq!(pool.nr_of_pending(), 0);
    }

    #[test]
    fn rekey_steps_until_done() {
        let mut pool = RequestPool::new();
        submit(&mut pool, Request::new(Operation::Rekey, 4));
        assert_eq!(
            serve(&mut pool, |primitive| {
                primitive.key_id = 2;
                primitive.success = true;
            }),
            SbControlOp::InitializeRekeying
        );
        for done in [false, false, true] {
            assert_eq!(
                serve(&mut pool, |primitive| {
                    primitive.done = done;
                    primitive.success = true;
                }),
                SbControlOp::RekeyVba
            );
        }
        let rekey = completed(&mut pool);
        assert!(rekey.success);
        assert_eq!(rekey.key_id, 2);
    }

    #[test]
    fn pool_applies_backpressure() {
        let mut pool = RequestPool::new();
        for tag in 0..RequestPool::NR_OF_CHANNELS as u64 {
            submit(&mut pool, Request::new(Operation::Sync, tag));
        }
        assert!(!pool.ready_to_submit_request());
    }
}

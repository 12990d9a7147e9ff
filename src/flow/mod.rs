//! Flow engine
//!
//! A flow streams one byte range between two endpoints: network (a framed
//! transport), memory, or storage (a collection bytestream). Transfers
//! through storage are double-buffered: while one staging buffer fills
//! from the source, the other drains into the destination, and the pair
//! swaps roles whenever both sides are ready. Memory-to-network flows are
//! plain copy-throughs driven by the same machinery.
//!
//! Flows own no threads. Each fill and drain becomes an op posted to a
//! worker of the manager the engine was built with; op completions re-enter
//! the engine by flow id through the flow registry, never through
//! self-referential callbacks. Errors are terminal: the first failure is
//! recorded, outstanding transfers on the other side degrade to best-effort
//! no-ops, and the completion callback fires once the flow quiesces.

pub mod buffer;
pub mod request;

use crate::mgmt::context::CompletionContext;
use crate::mgmt::op::{ServiceFn, ServiceOutcome};
use crate::mgmt::worker::WorkerId;
use crate::mgmt::{OpManager, PostTarget};
use crate::registry::{IdTable, RawId};
use crate::storage::bstream::StreamSegment;
use crate::storage::collection::Collection;
use crate::storage::Handle;
use crate::{Error, HintBag, Result};
use buffer::{BufferState, FlowBuffer, StagingBuffer};
use request::RequestPlanner;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Id of a posted flow
pub type FlowId = RawId;

/// Invoked exactly once when the flow finishes; carries the bytes moved
pub type FlowCallback = Box<dyn FnOnce(Result<u64>) + Send>;

/// Framed transport abstraction supplied by the network layer
///
/// The flow engine neither frames nor retries; `recv` returning 0 means
/// end of stream, and `send` may accept fewer bytes than offered.
pub trait Transport: Send {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn send(&mut self, buf: &[u8]) -> Result<usize>;
}

/// Memory endpoint: a shared byte vector with a read position
pub struct MemoryEndpoint {
    pub data: Arc<Mutex<Vec<u8>>>,
    pos: usize,
}

impl MemoryEndpoint {
    pub fn new(data: Arc<Mutex<Vec<u8>>>) -> Self {
        MemoryEndpoint { data, pos: 0 }
    }
}

/// One side of a flow
pub enum FlowEndpoint {
    Network(Box<dyn Transport>),
    Memory(MemoryEndpoint),
    Storage {
        coll: Arc<Collection>,
        handle: Handle,
    },
}

impl FlowEndpoint {
    fn is_storage(&self) -> bool {
        matches!(self, FlowEndpoint::Storage { .. })
    }
}

/// The byte range a flow moves
#[derive(Debug, Clone, Copy)]
pub struct FlowRequest {
    /// Offset on the storage side (ignored for memory/network pairs)
    pub storage_offset: u64,
    /// Total bytes to move
    pub size: u64,
}

/// A complete flow description
pub struct FlowDescriptor {
    pub src: FlowEndpoint,
    pub dst: FlowEndpoint,
    pub request: FlowRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Fill,
    Drain,
}

struct FlowState {
    src: Option<FlowEndpoint>,
    dst: Option<FlowEndpoint>,
    /// Plans storage-side segments; drives fill budgeting for all flows
    planner: RequestPlanner,
    storage_is_src: bool,
    storage_is_dst: bool,
    /// Bytes the fill side may still consume (non-storage sources)
    fill_remaining: u64,
    buffers: [FlowBuffer; 2],
    fill_idx: usize,
    moved: u64,
    no_more_fill: bool,
    error: Option<Error>,
    inflight: usize,
    finished: bool,
    callback: Option<FlowCallback>,
}

enum Action {
    PostFill {
        endpoint: FlowEndpoint,
        buffer: StagingBuffer,
        budget: usize,
        segments: Vec<StreamSegment>,
    },
    PostDrain {
        endpoint: FlowEndpoint,
        buffer: StagingBuffer,
        valid: usize,
        segments: Vec<StreamSegment>,
    },
    Finish(Result<u64>, FlowCallback),
}

/// Coordinates double-buffered endpoint transfers
pub struct FlowEngine {
    manager: Arc<OpManager>,
    worker: WorkerId,
    flows: IdTable<Mutex<FlowState>>,
    /// Internal context for fill/drain ops; completions are not observed
    /// here, the engine advances from within the service closures
    ctx: Arc<CompletionContext>,
    buffer_size: usize,
    alignment: usize,
    max_segments: usize,
    self_weak: Weak<FlowEngine>,
}

impl FlowEngine {
    /// Build an engine posting transfer ops to `worker`
    ///
    /// The worker must service ops asynchronously (threaded, pool, or
    /// per-op); a blocking worker would serialize the two pipeline sides.
    pub fn new(
        manager: Arc<OpManager>,
        worker: WorkerId,
        config: &crate::config::FlowConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| FlowEngine {
            manager,
            worker,
            flows: IdTable::new(),
            ctx: CompletionContext::open_callback(Box::new(|_| {})),
            buffer_size: config.buffer_size,
            alignment: config.buffer_alignment,
            max_segments: config.max_segments,
            self_weak: self_weak.clone(),
        })
    }

    /// Number of flows currently registered
    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }

    /// Start a flow; the callback fires once with the outcome
    pub fn post_flow(&self, desc: FlowDescriptor, callback: FlowCallback) -> Result<FlowId> {
        if desc.src.is_storage() && desc.dst.is_storage() {
            return Err(Error::InvalidArg(
                "storage-to-storage flows are not supported".into(),
            ));
        }

        let storage_is_src = desc.src.is_storage();
        let storage_is_dst = desc.dst.is_storage();
        let state = FlowState {
            src: Some(desc.src),
            dst: Some(desc.dst),
            planner: RequestPlanner::new(desc.request.storage_offset, desc.request.size),
            storage_is_src,
            storage_is_dst,
            fill_remaining: desc.request.size,
            buffers: [
                FlowBuffer::new(self.buffer_size, self.alignment, BufferState::ReadyToFill)?,
                FlowBuffer::new(self.buffer_size, self.alignment, BufferState::ReadyToSwap)?,
            ],
            fill_idx: 0,
            moved: 0,
            no_more_fill: desc.request.size == 0,
            error: None,
            inflight: 0,
            finished: false,
            callback: Some(callback),
        };
        let flow_id = self.flows.register(Arc::new(Mutex::new(state)));
        tracing::debug!(flow = %flow_id, "flow posted");
        self.advance(flow_id);
        Ok(flow_id)
    }

    fn flow(&self, flow_id: FlowId) -> Option<Arc<Mutex<FlowState>>> {
        self.flows.lookup(flow_id)
    }

    fn flow_errored(&self, flow_id: FlowId) -> bool {
        match self.flow(flow_id) {
            Some(flow) => lock(&flow).error.is_some(),
            None => true,
        }
    }

    /// Drive the state machine: swap ready buffers, post fills and drains,
    /// finish quiesced flows
    fn advance(&self, flow_id: FlowId) {
        let flow = match self.flow(flow_id) {
            Some(flow) => flow,
            None => return,
        };

        let mut actions = Vec::new();
        {
            let mut state = lock(&flow);
            if state.finished {
                return;
            }

            // Terminal error: wait for in-flight transfers to quiesce.
            if state.error.is_some() {
                if state.inflight == 0 {
                    state.finished = true;
                    let error = state.error.clone().expect("checked above");
                    if let Some(callback) = state.callback.take() {
                        actions.push(Action::Finish(Err(error), callback));
                    }
                }
            } else {
                self.plan_actions(&mut state, &mut actions);
            }
        }

        for action in actions {
            match action {
                Action::PostFill {
                    endpoint,
                    buffer,
                    budget,
                    segments,
                } => self.post_transfer(flow_id, Side::Fill, endpoint, buffer, budget, segments),
                Action::PostDrain {
                    endpoint,
                    buffer,
                    valid,
                    segments,
                } => self.post_transfer(flow_id, Side::Drain, endpoint, buffer, valid, segments),
                Action::Finish(result, callback) => {
                    tracing::debug!(flow = %flow_id, ok = result.is_ok(), "flow finished");
                    self.flows.unregister(flow_id);
                    callback(result);
                }
            }
        }
    }

    fn plan_actions(&self, state: &mut FlowState, actions: &mut Vec<Action>) {
        let drain_idx = 1 - state.fill_idx;

        // Swap when both sides are ready; a fill side already at Done (or
        // empty with nothing more to fill) means the flow is complete once
        // the drain side quiesces.
        let fill_exhausted = state.buffers[state.fill_idx].state == BufferState::Done
            || (state.buffers[state.fill_idx].state == BufferState::ReadyToSwap
                && state.buffers[state.fill_idx].valid == 0
                && state.no_more_fill);
        if state.buffers[drain_idx].state == BufferState::ReadyToSwap {
            if fill_exhausted {
                state.finished = true;
                let moved = state.moved;
                if let Some(callback) = state.callback.take() {
                    actions.push(Action::Finish(Ok(moved), callback));
                }
                return;
            }
            if state.buffers[state.fill_idx].state == BufferState::ReadyToSwap {
                // Swap roles: the filled buffer drains, the drained refills.
                state.fill_idx = drain_idx;
                let new_drain = 1 - state.fill_idx;
                state.buffers[new_drain].state = BufferState::ReadyToDrain;
                state.buffers[state.fill_idx].state = if state.no_more_fill {
                    BufferState::Done
                } else {
                    BufferState::ReadyToFill
                };
                state.buffers[state.fill_idx].valid = 0;
            }
        }

        let drain_idx = 1 - state.fill_idx;

        // Post a fill.
        if state.buffers[state.fill_idx].state == BufferState::ReadyToFill {
            if state.no_more_fill {
                state.buffers[state.fill_idx].state = BufferState::Done;
            } else if let Some(endpoint) = state.src.take() {
                let (budget, segments) = if state.storage_is_src {
                    let segments = state
                        .planner
                        .next_segments(self.buffer_size, self.max_segments);
                    let budget: u64 = segments.iter().map(|s| s.size).sum();
                    (budget as usize, segments)
                } else {
                    let budget = (self.buffer_size as u64).min(state.fill_remaining) as usize;
                    (budget, Vec::new())
                };
                if budget == 0 {
                    state.src = Some(endpoint);
                    state.no_more_fill = true;
                    state.buffers[state.fill_idx].state = BufferState::Done;
                } else {
                    let buffer = state.buffers[state.fill_idx].take();
                    state.buffers[state.fill_idx].state = BufferState::Filling;
                    state.buffers[state.fill_idx].segments = segments.clone();
                    state.inflight += 1;
                    actions.push(Action::PostFill {
                        endpoint,
                        buffer,
                        budget,
                        segments,
                    });
                }
            }
        }

        // Post a drain.
        if state.buffers[drain_idx].state == BufferState::ReadyToDrain {
            if let Some(endpoint) = state.dst.take() {
                let valid = state.buffers[drain_idx].valid;
                let segments = if state.storage_is_dst {
                    // Plan exactly the filled byte count on the storage side.
                    let mut segments = Vec::new();
                    let mut need = valid as u64;
                    while need > 0 && !state.planner.is_done() {
                        let batch = state.planner.next_segments(need as usize, self.max_segments);
                        if batch.is_empty() {
                            break;
                        }
                        need -= batch.iter().map(|s| s.size).sum::<u64>();
                        segments.extend(batch);
                    }
                    segments
                } else {
                    Vec::new()
                };
                let buffer = state.buffers[drain_idx].take();
                state.buffers[drain_idx].state = BufferState::Draining;
                state.inflight += 1;
                actions.push(Action::PostDrain {
                    endpoint,
                    buffer,
                    valid,
                    segments,
                });
            }
        }

        // A fill side that went Done above with an idle, drained other side
        // means nothing further will ever be posted; finish now rather than
        // waiting for a completion that cannot come.
        if state.buffers[state.fill_idx].state == BufferState::Done
            && state.buffers[drain_idx].state == BufferState::ReadyToSwap
            && state.inflight == 0
            && !state.finished
        {
            state.finished = true;
            let moved = state.moved;
            if let Some(callback) = state.callback.take() {
                actions.push(Action::Finish(Ok(moved), callback));
            }
        }
    }

    fn post_transfer(
        &self,
        flow_id: FlowId,
        side: Side,
        endpoint: FlowEndpoint,
        buffer: StagingBuffer,
        amount: usize,
        segments: Vec<StreamSegment>,
    ) {
        let engine = self.self_weak.clone();
        let mut carried = Some((endpoint, buffer));
        let service: ServiceFn = Box::new(move |_args| {
            let (mut endpoint, mut buffer) = carried
                .take()
                .ok_or_else(|| Error::Internal("flow transfer serviced twice".into()))?;
            let engine = match engine.upgrade() {
                Some(engine) => engine,
                None => return Ok(ServiceOutcome::Completed),
            };

            // Best-effort cancellation: a transfer racing a flow error
            // skips its I/O entirely.
            let result = if engine.flow_errored(flow_id) {
                Err(Error::Canceled)
            } else {
                match side {
                    Side::Fill => run_fill(&mut endpoint, &mut buffer, amount, &segments),
                    Side::Drain => run_drain(&mut endpoint, &buffer, amount, &segments),
                }
            };
            engine.transfer_done(flow_id, side, endpoint, buffer, result);
            Ok(ServiceOutcome::Completed)
        });

        let posted = self.manager.ctx_post(
            &self.ctx,
            flow_id.0,
            service,
            None,
            HintBag::new(),
            PostTarget::Worker(self.worker),
        );
        if let Err(e) = posted {
            // The op never existed; account the transfer as failed.
            if let Some(flow) = self.flow(flow_id) {
                let mut state = lock(&flow);
                state.inflight = state.inflight.saturating_sub(1);
                if state.error.is_none() {
                    state.error = Some(e);
                }
            }
            self.advance(flow_id);
        }
    }

    fn transfer_done(
        &self,
        flow_id: FlowId,
        side: Side,
        endpoint: FlowEndpoint,
        buffer: StagingBuffer,
        result: Result<usize>,
    ) {
        let flow = match self.flow(flow_id) {
            Some(flow) => flow,
            None => return,
        };
        {
            let mut guard = lock(&flow);
            let state = &mut *guard;
            state.inflight -= 1;
            match side {
                Side::Fill => {
                    state.src = Some(endpoint);
                    let fill = &mut state.buffers[state.fill_idx];
                    fill.put_back(buffer);
                    match result {
                        Ok(n) => {
                            let planned: u64 = fill.segments.iter().map(|s| s.size).sum();
                            fill.valid = n;
                            fill.state = BufferState::ReadyToSwap;
                            if state.storage_is_src {
                                if (n as u64) < planned {
                                    state.no_more_fill = true;
                                }
                                if state.planner.is_done() {
                                    state.no_more_fill = true;
                                }
                            } else {
                                state.fill_remaining -= n as u64;
                                if n == 0 || state.fill_remaining == 0 {
                                    state.no_more_fill = true;
                                }
                            }
                        }
                        Err(e) => {
                            fill.state = BufferState::ReadyToSwap;
                            fill.valid = 0;
                            if state.error.is_none() {
                                state.error = Some(e);
                            }
                        }
                    }
                }
                Side::Drain => {
                    state.dst = Some(endpoint);
                    let drain_idx = 1 - state.fill_idx;
                    let drain = &mut state.buffers[drain_idx];
                    let had = drain.valid;
                    drain.put_back(buffer);
                    drain.valid = 0;
                    drain.state = BufferState::ReadyToSwap;
                    match result {
                        Ok(n) => {
                            state.moved += n as u64;
                            if n < had {
                                // Short drain is terminal.
                                state.no_more_fill = true;
                            }
                        }
                        Err(e) => {
                            if state.error.is_none() {
                                state.error = Some(e);
                            }
                        }
                    }
                }
            }
        }
        self.advance(flow_id);
    }
}

fn lock(flow: &Arc<Mutex<FlowState>>) -> MutexGuard<'_, FlowState> {
    flow.lock().unwrap_or_else(|e| e.into_inner())
}

fn run_fill(
    endpoint: &mut FlowEndpoint,
    buffer: &mut StagingBuffer,
    budget: usize,
    segments: &[StreamSegment],
) -> Result<usize> {
    match endpoint {
        FlowEndpoint::Network(transport) => transport.recv(buffer.space(budget)),
        FlowEndpoint::Memory(mem) => {
            let data = mem.data.lock().unwrap_or_else(|e| e.into_inner());
            let n = budget.min(data.len().saturating_sub(mem.pos));
            buffer.space(n).copy_from_slice(&data[mem.pos..mem.pos + n]);
            drop(data);
            mem.pos += n;
            Ok(n)
        }
        FlowEndpoint::Storage { coll, handle } => {
            let n = coll.bs_read_list_sync(*handle, &mut [buffer.space(budget)], segments)?;
            Ok(n as usize)
        }
    }
}

fn run_drain(
    endpoint: &mut FlowEndpoint,
    buffer: &StagingBuffer,
    valid: usize,
    segments: &[StreamSegment],
) -> Result<usize> {
    match endpoint {
        FlowEndpoint::Network(transport) => {
            // Transports may accept partial sends; push until done.
            let mut sent = 0;
            while sent < valid {
                let n = transport.send(&buffer.filled(valid)[sent..])?;
                if n == 0 {
                    break;
                }
                sent += n;
            }
            Ok(sent)
        }
        FlowEndpoint::Memory(mem) => {
            let mut data = mem.data.lock().unwrap_or_else(|e| e.into_inner());
            data.extend_from_slice(buffer.filled(valid));
            Ok(valid)
        }
        FlowEndpoint::Storage { coll, handle } => {
            let n = coll.bs_write_list_sync(*handle, &[buffer.filled(valid)], segments)?;
            Ok(n as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowConfig;
    use crate::mgmt::worker::{PoolAttrs, WorkerAttrs};
    use crate::storage::dataspace::{DsCreateRequest, DsType};
    use crate::storage::test_support::open_test_collection;
    use std::collections::VecDeque;
    use std::sync::mpsc;
    use std::time::Duration;

    fn engine_with_pool() -> (Arc<OpManager>, Arc<FlowEngine>) {
        let manager = OpManager::new(CompletionContext::open_pull());
        let worker = manager
            .add_worker(WorkerAttrs::Pool(PoolAttrs {
                thread_count: 2,
                ops_per_round: 4,
                timeout: Duration::from_millis(5),
            }))
            .unwrap();
        let config = FlowConfig {
            buffer_size: 64,
            buffer_alignment: 64,
            max_segments: 8,
        };
        let engine = FlowEngine::new(Arc::clone(&manager), worker, &config);
        (manager, engine)
    }

    fn run_flow(engine: &Arc<FlowEngine>, desc: FlowDescriptor) -> Result<u64> {
        let (tx, rx) = mpsc::channel();
        engine
            .post_flow(
                desc,
                Box::new(move |result| {
                    tx.send(result).unwrap();
                }),
            )
            .unwrap();
        rx.recv_timeout(std::time::Duration::from_secs(10)).unwrap()
    }

    /// In-process transport backed by a byte queue
    struct QueueTransport {
        incoming: VecDeque<u8>,
        outgoing: Arc<Mutex<Vec<u8>>>,
        /// Cap recv sizes to force multiple fill rounds
        recv_cap: usize,
    }

    impl Transport for QueueTransport {
        fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
            let n = buf.len().min(self.recv_cap).min(self.incoming.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.incoming.pop_front().expect("length checked");
            }
            Ok(n)
        }

        fn send(&mut self, buf: &[u8]) -> Result<usize> {
            self.outgoing
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    struct FailingTransport;

    impl Transport for FailingTransport {
        fn recv(&mut self, _buf: &mut [u8]) -> Result<usize> {
            Err(Error::Io("connection reset".into()))
        }

        fn send(&mut self, _buf: &[u8]) -> Result<usize> {
            Err(Error::Io("connection reset".into()))
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_memory_to_memory_copy_through() {
        let (_manager, engine) = engine_with_pool();
        let src_data = payload(1000);
        let src = Arc::new(Mutex::new(src_data.clone()));
        let dst = Arc::new(Mutex::new(Vec::new()));

        let moved = run_flow(
            &engine,
            FlowDescriptor {
                src: FlowEndpoint::Memory(MemoryEndpoint::new(Arc::clone(&src))),
                dst: FlowEndpoint::Memory(MemoryEndpoint::new(Arc::clone(&dst))),
                request: FlowRequest {
                    storage_offset: 0,
                    size: 1000,
                },
            },
        )
        .unwrap();
        assert_eq!(moved, 1000);
        assert_eq!(*dst.lock().unwrap(), src_data);
        assert_eq!(engine.active_flows(), 0);
    }

    #[test]
    fn test_memory_to_storage_flow() {
        let (_dir, coll) = open_test_collection();
        let coll = Arc::new(coll);
        let (_manager, engine) = engine_with_pool();
        let handle = coll
            .ds_create_sync(&DsCreateRequest {
                extents: Vec::new(),
                requested: None,
                force_requested: false,
                ds_type: DsType::Datafile,
            })
            .unwrap();

        let src_data = payload(500);
        let src = Arc::new(Mutex::new(src_data.clone()));
        let moved = run_flow(
            &engine,
            FlowDescriptor {
                src: FlowEndpoint::Memory(MemoryEndpoint::new(src)),
                dst: FlowEndpoint::Storage {
                    coll: Arc::clone(&coll),
                    handle,
                },
                request: FlowRequest {
                    storage_offset: 128,
                    size: 500,
                },
            },
        )
        .unwrap();
        assert_eq!(moved, 500);

        let mut buf = vec![0u8; 500];
        coll.bs_read_at_sync(handle, 128, &mut buf).unwrap();
        assert_eq!(buf, src_data);
        assert_eq!(coll.bs_validate_sync(handle).unwrap().logical_size, 628);
    }

    #[test]
    fn test_storage_to_memory_flow() {
        let (_dir, coll) = open_test_collection();
        let coll = Arc::new(coll);
        let (_manager, engine) = engine_with_pool();
        let handle = coll
            .ds_create_sync(&DsCreateRequest {
                extents: Vec::new(),
                requested: None,
                force_requested: false,
                ds_type: DsType::Datafile,
            })
            .unwrap();
        let src_data = payload(777);
        coll.bs_write_at_sync(handle, 0, &src_data).unwrap();

        let dst = Arc::new(Mutex::new(Vec::new()));
        let moved = run_flow(
            &engine,
            FlowDescriptor {
                src: FlowEndpoint::Storage {
                    coll: Arc::clone(&coll),
                    handle,
                },
                dst: FlowEndpoint::Memory(MemoryEndpoint::new(Arc::clone(&dst))),
                request: FlowRequest {
                    storage_offset: 0,
                    size: 777,
                },
            },
        )
        .unwrap();
        assert_eq!(moved, 777);
        assert_eq!(*dst.lock().unwrap(), src_data);
    }

    #[test]
    fn test_network_to_storage_flow() {
        let (_dir, coll) = open_test_collection();
        let coll = Arc::new(coll);
        let (_manager, engine) = engine_with_pool();
        let handle = coll
            .ds_create_sync(&DsCreateRequest {
                extents: Vec::new(),
                requested: None,
                force_requested: false,
                ds_type: DsType::Datafile,
            })
            .unwrap();

        let src_data = payload(300);
        let transport = QueueTransport {
            incoming: src_data.iter().copied().collect(),
            outgoing: Arc::new(Mutex::new(Vec::new())),
            // Deliver in dribbles so several fill/drain rounds happen.
            recv_cap: 48,
        };
        let moved = run_flow(
            &engine,
            FlowDescriptor {
                src: FlowEndpoint::Network(Box::new(transport)),
                dst: FlowEndpoint::Storage {
                    coll: Arc::clone(&coll),
                    handle,
                },
                request: FlowRequest {
                    storage_offset: 0,
                    size: 300,
                },
            },
        )
        .unwrap();
        assert_eq!(moved, 300);

        let mut buf = vec![0u8; 300];
        coll.bs_read_at_sync(handle, 0, &mut buf).unwrap();
        assert_eq!(buf, src_data);
    }

    #[test]
    fn test_storage_to_network_flow() {
        let (_dir, coll) = open_test_collection();
        let coll = Arc::new(coll);
        let (_manager, engine) = engine_with_pool();
        let handle = coll
            .ds_create_sync(&DsCreateRequest {
                extents: Vec::new(),
                requested: None,
                force_requested: false,
                ds_type: DsType::Datafile,
            })
            .unwrap();
        let src_data = payload(200);
        coll.bs_write_at_sync(handle, 0, &src_data).unwrap();

        let outgoing = Arc::new(Mutex::new(Vec::new()));
        let transport = QueueTransport {
            incoming: VecDeque::new(),
            outgoing: Arc::clone(&outgoing),
            recv_cap: 16,
        };
        let moved = run_flow(
            &engine,
            FlowDescriptor {
                src: FlowEndpoint::Storage {
                    coll: Arc::clone(&coll),
                    handle,
                },
                dst: FlowEndpoint::Network(Box::new(transport)),
                request: FlowRequest {
                    storage_offset: 0,
                    size: 200,
                },
            },
        )
        .unwrap();
        assert_eq!(moved, 200);
        assert_eq!(*outgoing.lock().unwrap(), src_data);
    }

    #[test]
    fn test_flow_error_is_terminal() {
        let (_dir, coll) = open_test_collection();
        let coll = Arc::new(coll);
        let (_manager, engine) = engine_with_pool();
        let handle = coll
            .ds_create_sync(&DsCreateRequest {
                extents: Vec::new(),
                requested: None,
                force_requested: false,
                ds_type: DsType::Datafile,
            })
            .unwrap();

        let result = run_flow(
            &engine,
            FlowDescriptor {
                src: FlowEndpoint::Network(Box::new(FailingTransport)),
                dst: FlowEndpoint::Storage {
                    coll: Arc::clone(&coll),
                    handle,
                },
                request: FlowRequest {
                    storage_offset: 0,
                    size: 100,
                },
            },
        );
        assert_eq!(result, Err(Error::Io("connection reset".into())));
        assert_eq!(engine.active_flows(), 0);
    }

    #[test]
    fn test_zero_size_flow() {
        let (_manager, engine) = engine_with_pool();
        let src = Arc::new(Mutex::new(Vec::new()));
        let dst = Arc::new(Mutex::new(Vec::new()));
        let moved = run_flow(
            &engine,
            FlowDescriptor {
                src: FlowEndpoint::Memory(MemoryEndpoint::new(src)),
                dst: FlowEndpoint::Memory(MemoryEndpoint::new(dst)),
                request: FlowRequest {
                    storage_offset: 0,
                    size: 0,
                },
            },
        )
        .unwrap();
        assert_eq!(moved, 0);
    }

    #[test]
    fn test_storage_to_storage_rejected() {
        let (_dir, coll) = open_test_collection();
        let coll = Arc::new(coll);
        let (_manager, engine) = engine_with_pool();
        let err = engine
            .post_flow(
                FlowDescriptor {
                    src: FlowEndpoint::Storage {
                        coll: Arc::clone(&coll),
                        handle: 1,
                    },
                    dst: FlowEndpoint::Storage { coll, handle: 2 },
                    request: FlowRequest {
                        storage_offset: 0,
                        size: 10,
                    },
                },
                Box::new(|_| {}),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArg(_)));
    }
}

//! Op management
//!
//! The management interfaces let callers hand off units of work, ignore how
//! and when they are serviced, and test for completion later. A caller
//! creates an [`OpManager`], adds workers specifying *how* ops are serviced
//! (inline, per-op threads, thread pools over queues, an external
//! submission function), and then posts ops. The worker that services an op
//! is chosen explicitly in the post call or dynamically through registered
//! routing mappings. Completion is reported through the op's completion
//! context in pull or callback mode.
//!
//! # Example
//!
//! ```
//! use stratum::mgmt::{OpManager, PostTarget};
//! use stratum::mgmt::context::CompletionContext;
//! use stratum::mgmt::worker::{PostOutcome, WorkerAttrs};
//! use stratum::HintBag;
//!
//! let ctx = CompletionContext::open_pull();
//! let manager = OpManager::new(ctx);
//! let worker = manager.add_worker(WorkerAttrs::Blocking).unwrap();
//!
//! let (_id, outcome) = manager
//!     .post(
//!         7,
//!         Box::new(|_| Ok(stratum::mgmt::op::ServiceOutcome::Completed)),
//!         None,
//!         HintBag::new(),
//!         PostTarget::Worker(worker),
//!     )
//!     .unwrap();
//! assert!(matches!(outcome, PostOutcome::Completed(Ok(()))));
//! ```

pub mod context;
pub mod op;
pub mod queue;
pub mod worker;

use crate::hints::HintBag;
use crate::registry::IdTable;
use crate::{Error, Result};
use context::{Completion, CompletionContext};
use hdrhistogram::Histogram;
use op::{CancelFn, OpId, OpLifecycle, Operation, ServiceFn, ServiceOutcome};
use queue::{OpQueue, QueueId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use worker::{PostOutcome, WorkerAttrs, WorkerId, WorkerKind};

/// Result of one service round, as seen by a worker
#[derive(Debug)]
pub enum ServiceRound {
    /// The op finished with the given result; the worker must complete it
    /// (or report it inline for blocking posts)
    Completed(Result<()>),
    /// The op handed itself to an internal continuation; the worker leaves
    /// it alone
    Continue,
}

/// Moments an event handler is notified about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpEventKind {
    /// Servicing of an op is about to start
    Start,
    /// Servicing of an op finished a round
    End,
}

/// Event passed to registered handlers
pub struct OpEvent<'a> {
    pub kind: OpEventKind,
    pub op_id: OpId,
    pub hints: &'a HintBag,
    /// Accumulated service time; zero on `Start`
    pub service_time: Duration,
}

/// Event handler callback
pub type EventHandler = Box<dyn Fn(&OpEvent<'_>) + Send + Sync>;

/// Where a post should be routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostTarget {
    /// Consult the registered routing mappings
    Implicit,
    /// Post to a specific worker
    Worker(WorkerId),
    /// Post to a specific queue (and the worker managing it)
    Queue(QueueId),
}

/// Routing mapping callout; returns a target for the op or `None` to pass
pub type MappingFn = Box<dyn Fn(&HintBag, u64) -> Option<PostTarget> + Send + Sync>;

/// Binds workers to ops and contexts and routes posts
pub struct OpManager {
    ops: IdTable<Operation>,
    workers: IdTable<WorkerKind>,
    /// queue id → (owning worker, queue)
    queues: RwLock<HashMap<QueueId, (WorkerId, Arc<OpQueue>)>>,
    mappings: RwLock<Vec<MappingFn>>,
    default_ctx: Arc<CompletionContext>,
    event_handlers: RwLock<Vec<EventHandler>>,
    /// Service times in microseconds
    service_times: Mutex<Histogram<u64>>,
}

impl OpManager {
    /// Create a manager with a default completion context
    pub fn new(default_ctx: Arc<CompletionContext>) -> Arc<Self> {
        Arc::new(OpManager {
            ops: IdTable::new(),
            workers: IdTable::new(),
            queues: RwLock::new(HashMap::new()),
            mappings: RwLock::new(Vec::new()),
            default_ctx,
            event_handlers: RwLock::new(Vec::new()),
            service_times: Mutex::new(
                Histogram::new_with_bounds(1, 60 * 1_000_000, 3)
                    .expect("histogram bounds are static"),
            ),
        })
    }

    pub fn default_context(&self) -> &Arc<CompletionContext> {
        &self.default_ctx
    }

    /// Add a worker built from the given attributes
    pub fn add_worker(self: &Arc<Self>, attrs: WorkerAttrs) -> Result<WorkerId> {
        let worker = WorkerKind::new(Arc::downgrade(self), attrs)?;
        tracing::debug!(worker = worker.name(), "adding worker");
        Ok(self.workers.register(Arc::new(worker)))
    }

    /// Shut down and remove a worker
    ///
    /// Fails `Busy` (and leaves the worker registered) while the worker
    /// still has in-flight work.
    pub fn remove_worker(&self, worker_id: WorkerId) -> Result<()> {
        let worker = self.workers.lookup(worker_id).ok_or(Error::NotFound)?;
        worker.shutdown()?;
        self.workers.unregister(worker_id);
        Ok(())
    }

    /// Hand a queue to a queue-managing worker
    pub fn queue_add(&self, worker_id: WorkerId, queue: Arc<OpQueue>) -> Result<()> {
        let worker = self.workers.lookup(worker_id).ok_or(Error::NotFound)?;
        worker.queue_add(Arc::clone(&queue))?;
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        queues.insert(queue.id(), (worker_id, queue));
        Ok(())
    }

    /// Take a queue away from its worker
    pub fn queue_remove(&self, queue_id: QueueId) -> Result<()> {
        let (worker_id, _queue) = {
            let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
            queues.get(&queue_id).cloned().ok_or(Error::NotFound)?
        };
        let worker = self.workers.lookup(worker_id).ok_or(Error::NotFound)?;
        worker.queue_remove(queue_id)?;
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        queues.remove(&queue_id);
        Ok(())
    }

    /// Register a routing mapping; mappings are consulted in registration
    /// order on implicit posts
    pub fn add_mapping(&self, mapping: MappingFn) {
        self.mappings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(mapping);
    }

    /// Register an event handler for op start/end events
    pub fn add_event_handler(&self, handler: EventHandler) {
        self.event_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    /// Post an op against the manager's default context
    pub fn post(
        &self,
        user_data: u64,
        service: ServiceFn,
        cancel: Option<CancelFn>,
        hints: HintBag,
        target: PostTarget,
    ) -> Result<(OpId, PostOutcome)> {
        let ctx = Arc::clone(&self.default_ctx);
        self.ctx_post(&ctx, user_data, service, cancel, hints, target)
    }

    /// Post an op against a caller-chosen context
    pub fn ctx_post(
        &self,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
        service: ServiceFn,
        cancel: Option<CancelFn>,
        hints: HintBag,
        target: PostTarget,
    ) -> Result<(OpId, PostOutcome)> {
        let (worker_id, queue_id) = self.resolve_target(&hints, user_data, target)?;
        let worker = self.workers.lookup(worker_id).ok_or(Error::NotFound)?;

        let op = Arc::new(Operation::new(
            Arc::clone(ctx),
            user_data,
            service,
            cancel,
            hints,
        ));
        let op_id = self.ops.register(Arc::clone(&op));
        op.bind_id(op_id);
        op.set_worker(worker_id);
        ctx.op_started();

        match worker.post(queue_id, Arc::clone(&op)) {
            Ok(PostOutcome::Posted) => Ok((op_id, PostOutcome::Posted)),
            Ok(PostOutcome::Completed(result)) => {
                // Inline completion: the result is reported to the caller
                // directly and never reaches the context.
                self.ops.unregister(op_id);
                ctx.op_discarded();
                Ok((op_id, PostOutcome::Completed(result)))
            }
            Err(e) => {
                self.ops.unregister(op_id);
                ctx.op_discarded();
                Err(e)
            }
        }
    }

    fn resolve_target(
        &self,
        hints: &HintBag,
        user_data: u64,
        target: PostTarget,
    ) -> Result<(WorkerId, Option<QueueId>)> {
        match target {
            PostTarget::Worker(worker_id) => Ok((worker_id, None)),
            PostTarget::Queue(queue_id) => {
                let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
                let (worker_id, _) = queues.get(&queue_id).ok_or(Error::NotFound)?;
                Ok((*worker_id, Some(queue_id)))
            }
            PostTarget::Implicit => {
                let mappings = self.mappings.read().unwrap_or_else(|e| e.into_inner());
                for mapping in mappings.iter() {
                    match mapping(hints, user_data) {
                        Some(PostTarget::Worker(worker_id)) => return Ok((worker_id, None)),
                        Some(PostTarget::Queue(queue_id)) => {
                            let queues =
                                self.queues.read().unwrap_or_else(|e| e.into_inner());
                            let (worker_id, _) =
                                queues.get(&queue_id).ok_or(Error::NotFound)?;
                            return Ok((*worker_id, Some(queue_id)));
                        }
                        // A mapping cannot defer back to implicit routing.
                        Some(PostTarget::Implicit) | None => continue,
                    }
                }
                Err(Error::InvalidArg(
                    "no routing mapping matched and no explicit target given".into(),
                ))
            }
        }
    }

    /// Attempt to cancel a posted op
    ///
    /// Cancellation is cooperative: a queued op is rewritten out of its
    /// queue and completed with `Canceled`; an internally delayed op has
    /// its cancel closure invoked; an op already completed (or in service
    /// with no cancel path) reports `NotFound`.
    pub fn cancel(&self, op_id: OpId) -> Result<()> {
        let op = self.ops.lookup(op_id).ok_or(Error::NotFound)?;
        let worker = self.workers.lookup(op.worker()).ok_or(Error::NotFound)?;

        if worker.cancel(op.queue(), &op).is_ok() {
            self.complete_op(&op, Err(Error::Canceled));
            return Ok(());
        }

        if op.lifecycle() == OpLifecycle::InternallyDelayed {
            if let Some(cancel) = op.take_cancel() {
                return cancel();
            }
        }
        Err(Error::NotFound)
    }

    /// Run one service round for an op
    ///
    /// Fires start/end events and records the round's duration in the
    /// service-time histogram.
    pub fn service_op(&self, op: &Arc<Operation>) -> ServiceRound {
        self.fire_event(OpEventKind::Start, op, Duration::ZERO);
        op.set_lifecycle(OpLifecycle::InService);

        let (result, elapsed) = op.service();

        {
            let mut hist = self
                .service_times
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let _ = hist.record(elapsed.as_micros().max(1) as u64);
        }
        self.fire_event(OpEventKind::End, op, elapsed);

        match result {
            Ok(ServiceOutcome::Completed) => ServiceRound::Completed(Ok(())),
            Ok(ServiceOutcome::Continue) => {
                op.set_lifecycle(OpLifecycle::InternallyDelayed);
                ServiceRound::Continue
            }
            Err(e) => ServiceRound::Completed(Err(e)),
        }
    }

    /// Publish an op's result to its owning context and release it
    pub fn complete_op(&self, op: &Arc<Operation>, result: Result<()>) {
        let lifecycle = if result == Err(Error::Canceled) {
            OpLifecycle::Canceled
        } else {
            OpLifecycle::Completed
        };
        op.set_lifecycle(lifecycle);

        let op_id = op.id();
        tracing::debug!(op = %op_id, ok = result.is_ok(), "op complete");

        // The external worker meters its outstanding posts on completions.
        if let Some(worker) = self.workers.lookup(op.worker()) {
            if let WorkerKind::External(external) = &*worker {
                external.completion_drained();
            }
        }

        // Publish before releasing the id: a concurrent test that misses
        // the live op is then guaranteed to find the completion.
        op.context().complete(Completion {
            op_id,
            user_data: op.user_data(),
            result,
        });
        self.ops.unregister(op_id);
    }

    /// Complete a batch of ops with their results
    pub fn complete_op_list(&self, ops: &[(Arc<Operation>, Result<()>)]) {
        for (op, result) in ops {
            self.complete_op(op, result.clone());
        }
    }

    /// Wait for a specific op on the default context
    ///
    /// Returns `NotFound` for an id the manager no longer tracks (never
    /// posted, completed inline, or already tested).
    pub fn test_op(&self, op_id: OpId, timeout: Duration) -> Result<Completion> {
        self.test_op_on(&Arc::clone(&self.default_ctx), op_id, timeout)
    }

    /// Wait for a specific op on an explicit context
    pub fn test_op_on(
        &self,
        ctx: &Arc<CompletionContext>,
        op_id: OpId,
        timeout: Duration,
    ) -> Result<Completion> {
        if let Some(completion) = ctx.take_completion(op_id) {
            return Ok(completion);
        }
        if self.ops.lookup(op_id).is_none() {
            // The op may have completed between the two checks; completions
            // are published before the id is released, so re-checking is
            // conclusive.
            return ctx.take_completion(op_id).ok_or(Error::NotFound);
        }
        ctx.test_op(op_id, timeout)
    }

    /// Wait for completions of any of the given ops on the default context
    pub fn test_some(&self, op_ids: &[OpId], timeout: Duration) -> Result<Vec<Completion>> {
        self.default_ctx.test_some(op_ids, timeout)
    }

    /// Drain available completions from the default context
    pub fn test_all(&self, timeout: Duration) -> Result<Vec<Completion>> {
        self.default_ctx.test_all(timeout)
    }

    /// Drain available completions from an explicit context
    pub fn test_context(
        &self,
        ctx: &Arc<CompletionContext>,
        timeout: Duration,
    ) -> Result<Vec<Completion>> {
        ctx.test_all(timeout)
    }

    /// Block until an op completes; timeouts never cancel the op
    pub fn wait_op(&self, op_id: OpId, timeout: Duration) -> Result<Completion> {
        self.test_op(op_id, timeout)
    }

    /// Block until every op on a context has completed
    pub fn wait_context(&self, ctx: &Arc<CompletionContext>, timeout: Duration) -> Result<()> {
        ctx.wait_all(timeout)
    }

    /// Resolve a live op by id; used by continuation paths (async I/O
    /// notify callbacks) that complete ops they did not post
    pub(crate) fn op_ref(&self, op_id: OpId) -> Option<Arc<Operation>> {
        self.ops.lookup(op_id)
    }

    /// Snapshot of the service-time histogram (microseconds)
    pub fn service_stats(&self) -> Histogram<u64> {
        self.service_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn fire_event(&self, kind: OpEventKind, op: &Arc<Operation>, service_time: Duration) {
        let handlers = self
            .event_handlers
            .read()
            .unwrap_or_else(|e| e.into_inner());
        if handlers.is_empty() {
            return;
        }
        let event = OpEvent {
            kind,
            op_id: op.id(),
            hints: op.hints(),
            service_time,
        };
        for handler in handlers.iter() {
            handler(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;
    use worker::{ExternalAttrs, PoolAttrs, ThreadedAttrs};

    fn completed_service() -> ServiceFn {
        Box::new(|_| Ok(ServiceOutcome::Completed))
    }

    #[test]
    fn test_blocking_inline_completion() {
        let ctx = CompletionContext::open_pull();
        let manager = OpManager::new(ctx);
        let worker = manager.add_worker(WorkerAttrs::Blocking).unwrap();

        let (op_id, outcome) = manager
            .post(
                1,
                completed_service(),
                None,
                HintBag::new(),
                PostTarget::Worker(worker),
            )
            .unwrap();
        assert!(matches!(outcome, PostOutcome::Completed(Ok(()))));

        // The op was never queued, so a test on its id reports NotFound.
        let err = manager.test_op(op_id, Duration::from_millis(1)).unwrap_err();
        assert_eq!(err, Error::NotFound);
    }

    #[test]
    fn test_blocking_inline_error() {
        let ctx = CompletionContext::open_pull();
        let manager = OpManager::new(ctx);
        let worker = manager.add_worker(WorkerAttrs::Blocking).unwrap();

        let (_id, outcome) = manager
            .post(
                1,
                Box::new(|_| Err(Error::Io("no space".into()))),
                None,
                HintBag::new(),
                PostTarget::Worker(worker),
            )
            .unwrap();
        match outcome {
            PostOutcome::Completed(result) => {
                assert_eq!(result, Err(Error::Io("no space".into())))
            }
            PostOutcome::Posted => panic!("blocking post must complete inline"),
        }
    }

    #[test]
    fn test_threaded_queues_roundtrip() {
        let hits = Arc::new(AtomicUsize::new(0));
        let callback_hits = Arc::clone(&hits);
        let counter = Arc::new(Mutex::new(0u32));

        let ctx = CompletionContext::open_callback(Box::new(move |batch| {
            callback_hits.fetch_add(batch.len(), Ordering::SeqCst);
        }));
        let manager = OpManager::new(Arc::clone(&ctx));
        let worker = manager
            .add_worker(WorkerAttrs::Threaded(ThreadedAttrs {
                thread_count: 4,
                ops_per_queue: 8,
                timeout: Duration::from_millis(10),
            }))
            .unwrap();
        let queue = OpQueue::new();
        manager.queue_add(worker, Arc::clone(&queue)).unwrap();

        for i in 0..100 {
            let counter = Arc::clone(&counter);
            let (_, outcome) = manager
                .ctx_post(
                    &ctx,
                    i,
                    Box::new(move |_| {
                        *counter.lock().unwrap() += 1;
                        Ok(ServiceOutcome::Completed)
                    }),
                    None,
                    HintBag::new(),
                    PostTarget::Queue(queue.id()),
                )
                .unwrap();
            assert!(matches!(outcome, PostOutcome::Posted));
        }

        // Wait for all 100 to complete.
        let deadline = Instant::now() + Duration::from_secs(10);
        while ctx.outstanding() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*counter.lock().unwrap(), 100);
        // Every op's callback fired exactly once.
        assert_eq!(hits.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_cancel_queued_op() {
        let ctx = CompletionContext::open_pull();
        let manager = OpManager::new(Arc::clone(&ctx));
        let worker = manager
            .add_worker(WorkerAttrs::Threaded(ThreadedAttrs {
                thread_count: 1,
                ops_per_queue: 1,
                timeout: Duration::from_millis(10),
            }))
            .unwrap();
        let queue = OpQueue::new();
        manager.queue_add(worker, Arc::clone(&queue)).unwrap();

        // The first op occupies the only thread for a while.
        let (_blocker, _) = manager
            .post(
                0,
                Box::new(|_| {
                    thread::sleep(Duration::from_millis(100));
                    Ok(ServiceOutcome::Completed)
                }),
                None,
                HintBag::new(),
                PostTarget::Queue(queue.id()),
            )
            .unwrap();

        let (victim, _) = manager
            .post(
                1,
                Box::new(|_| {
                    thread::sleep(Duration::from_millis(500));
                    Ok(ServiceOutcome::Completed)
                }),
                None,
                HintBag::new(),
                PostTarget::Queue(queue.id()),
            )
            .unwrap();

        // Cancel may race with servicing; both outcomes are legal.
        match manager.cancel(victim) {
            Ok(()) => {
                let completion = manager
                    .test_op(victim, Duration::from_secs(1))
                    .unwrap();
                assert_eq!(completion.result, Err(Error::Canceled));
            }
            Err(e) => assert_eq!(e, Error::NotFound),
        }
    }

    #[test]
    fn test_per_op_worker() {
        let ctx = CompletionContext::open_pull();
        let manager = OpManager::new(Arc::clone(&ctx));
        let worker = manager.add_worker(WorkerAttrs::PerOp).unwrap();

        let (op_id, outcome) = manager
            .post(
                42,
                completed_service(),
                None,
                HintBag::new(),
                PostTarget::Worker(worker),
            )
            .unwrap();
        assert!(matches!(outcome, PostOutcome::Posted));

        let completion = manager.test_op(op_id, Duration::from_secs(5)).unwrap();
        assert_eq!(completion.user_data, 42);
        assert_eq!(completion.result, Ok(()));
    }

    #[test]
    fn test_queues_worker_do_work() {
        let ctx = CompletionContext::open_pull();
        let manager = OpManager::new(Arc::clone(&ctx));
        let worker_id = manager
            .add_worker(WorkerAttrs::Queues { ops_per_round: 4 })
            .unwrap();
        let queue = OpQueue::new();
        manager.queue_add(worker_id, Arc::clone(&queue)).unwrap();

        let mut ids = Vec::new();
        for i in 0..6 {
            let (op_id, _) = manager
                .post(
                    i,
                    completed_service(),
                    None,
                    HintBag::new(),
                    PostTarget::Queue(queue.id()),
                )
                .unwrap();
            ids.push(op_id);
        }

        // Nothing is serviced until the caller donates time.
        assert_eq!(ctx.pending(), 0);
        let worker = manager.workers.lookup(worker_id).unwrap();
        let serviced = worker.do_work(Duration::from_secs(1)).unwrap();
        assert_eq!(serviced, 4);
        let serviced = worker.do_work(Duration::from_secs(1)).unwrap();
        assert_eq!(serviced, 2);

        let completions = manager.test_all(Duration::from_millis(10)).unwrap();
        assert_eq!(completions.len(), 6);
    }

    #[test]
    fn test_implicit_routing() {
        let ctx = CompletionContext::open_pull();
        let manager = OpManager::new(ctx);
        let worker = manager.add_worker(WorkerAttrs::Blocking).unwrap();

        // No mapping yet: implicit posts fail.
        let err = manager
            .post(
                0,
                completed_service(),
                None,
                HintBag::new(),
                PostTarget::Implicit,
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArg(_)));

        manager.add_mapping(Box::new(move |hints, _| {
            hints.get("route.blocking").map(|_| PostTarget::Worker(worker))
        }));

        let mut hints = HintBag::new();
        hints.add("route.blocking", b"");
        let (_, outcome) = manager
            .post(0, completed_service(), None, hints, PostTarget::Implicit)
            .unwrap();
        assert!(matches!(outcome, PostOutcome::Completed(Ok(()))));
    }

    #[test]
    fn test_external_worker_backpressure() {
        let submitted: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&submitted);

        let ctx = CompletionContext::open_pull();
        let manager = OpManager::new(Arc::clone(&ctx));
        let worker_id = manager
            .add_worker(WorkerAttrs::External(ExternalAttrs {
                post: Box::new(move |op| {
                    seen.lock().unwrap().push(op.user_data());
                    Ok(())
                }),
                max_posts: 2,
            }))
            .unwrap();

        let mut ops = Vec::new();
        for i in 0..4 {
            let (op_id, _) = manager
                .post(
                    i,
                    completed_service(),
                    None,
                    HintBag::new(),
                    PostTarget::Worker(worker_id),
                )
                .unwrap();
            ops.push(manager.ops.lookup(op_id).unwrap());
        }

        // Only max_posts ops reach the external system up front.
        assert_eq!(submitted.lock().unwrap().len(), 2);

        // Completing one drains one parked post.
        manager.complete_op(&ops[0], Ok(()));
        assert_eq!(submitted.lock().unwrap().len(), 3);

        manager.complete_op(&ops[1], Ok(()));
        assert_eq!(submitted.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_pool_worker() {
        let ctx = CompletionContext::open_pull();
        let manager = OpManager::new(Arc::clone(&ctx));
        let worker = manager
            .add_worker(WorkerAttrs::Pool(PoolAttrs {
                thread_count: 2,
                ops_per_round: 4,
                timeout: Duration::from_millis(10),
            }))
            .unwrap();

        let mut ids = Vec::new();
        for i in 0..20 {
            let (op_id, _) = manager
                .post(
                    i,
                    completed_service(),
                    None,
                    HintBag::new(),
                    PostTarget::Worker(worker),
                )
                .unwrap();
            ids.push(op_id);
        }
        manager
            .wait_context(&Arc::clone(&ctx), Duration::from_secs(10))
            .unwrap();
        let completions = manager.test_all(Duration::from_millis(10)).unwrap();
        assert_eq!(completions.len(), 20);
    }

    #[test]
    fn test_event_handlers_fire() {
        let starts = Arc::new(AtomicUsize::new(0));
        let ends = Arc::new(AtomicUsize::new(0));

        let ctx = CompletionContext::open_pull();
        let manager = OpManager::new(ctx);
        let worker = manager.add_worker(WorkerAttrs::Blocking).unwrap();

        let s = Arc::clone(&starts);
        let e = Arc::clone(&ends);
        manager.add_event_handler(Box::new(move |event| match event.kind {
            OpEventKind::Start => {
                s.fetch_add(1, Ordering::SeqCst);
            }
            OpEventKind::End => {
                e.fetch_add(1, Ordering::SeqCst);
            }
        }));

        manager
            .post(
                0,
                completed_service(),
                None,
                HintBag::new(),
                PostTarget::Worker(worker),
            )
            .unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(ends.load(Ordering::SeqCst), 1);
        assert_eq!(manager.service_stats().len(), 1);
    }

    #[test]
    fn test_remove_worker() {
        let ctx = CompletionContext::open_pull();
        let manager = OpManager::new(ctx);
        let worker = manager.add_worker(WorkerAttrs::Blocking).unwrap();
        manager.remove_worker(worker).unwrap();
        assert_eq!(manager.remove_worker(worker).unwrap_err(), Error::NotFound);
    }
}

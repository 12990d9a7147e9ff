//! Op descriptors
//!
//! An op is one unit of work handed to the manager: a service closure, an
//! optional cancel closure, a hint bag forwarded to the service function,
//! and bookkeeping for the lifecycle and queue-membership invariants.
//!
//! Lifecycle: `Unposted` → `Queued` | `InService` | `InternallyDelayed` →
//! `Completed`, with `Canceled` as the alternate terminal state. An op is a
//! member of at most one queue at any instant; the queue enforces this
//! through [`Operation::mark_enqueued`] / [`Operation::mark_dequeued`].

use crate::mgmt::context::CompletionContext;
use crate::mgmt::queue::QueueId;
use crate::registry::RawId;
use crate::{Error, HintBag, Result};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Id of a posted op, issued by the manager's op table
pub type OpId = RawId;

/// What a service function reports back to the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// The op finished; the worker completes it immediately
    Completed,
    /// The op handed itself to an internal continuation (async I/O
    /// submission); something else calls `complete_op` later
    Continue,
}

/// Arguments handed to a service function on every round
pub struct ServiceArgs<'a> {
    /// The op's own id, for continuations that complete it later
    pub op_id: OpId,
    pub hints: &'a HintBag,
}

/// Service closure invoked by a worker on behalf of the manager
pub type ServiceFn = Box<dyn FnMut(&ServiceArgs<'_>) -> Result<ServiceOutcome> + Send>;

/// Cancel closure for ops that are internally delayed
pub type CancelFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// Lifecycle states of an op
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpLifecycle {
    Unposted,
    Queued,
    InService,
    InternallyDelayed,
    Completed,
    Canceled,
}

struct OpMutState {
    lifecycle: OpLifecycle,
    /// Queue currently holding this op, if any
    in_queue: Option<QueueId>,
    /// Set when the op enters a queue; used for queue residency stats
    enqueued_at: Option<Instant>,
    /// Accumulated service time across service rounds
    service_time: Duration,
    /// Worker the manager routed this op to
    worker: RawId,
}

/// One unit of work
pub struct Operation {
    id: OnceLock<OpId>,
    context: Arc<CompletionContext>,
    user_data: u64,
    hints: HintBag,
    service: Mutex<ServiceFn>,
    cancel: Mutex<Option<CancelFn>>,
    posted_at: Instant,
    state: Mutex<OpMutState>,
}

impl Operation {
    pub fn new(
        context: Arc<CompletionContext>,
        user_data: u64,
        service: ServiceFn,
        cancel: Option<CancelFn>,
        hints: HintBag,
    ) -> Self {
        Operation {
            id: OnceLock::new(),
            context,
            user_data,
            hints,
            service: Mutex::new(service),
            cancel: Mutex::new(cancel),
            posted_at: Instant::now(),
            state: Mutex::new(OpMutState {
                lifecycle: OpLifecycle::Unposted,
                in_queue: None,
                enqueued_at: None,
                service_time: Duration::ZERO,
                worker: RawId::NULL,
            }),
        }
    }

    /// Assign the registry id; called exactly once by the manager
    pub(crate) fn bind_id(&self, id: OpId) {
        // A second bind indicates a manager bug, not a caller error.
        let _ = self.id.set(id);
    }

    /// The op's id; null until the manager registers it
    pub fn id(&self) -> OpId {
        self.id.get().copied().unwrap_or(RawId::NULL)
    }

    pub fn context(&self) -> &Arc<CompletionContext> {
        &self.context
    }

    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    pub fn hints(&self) -> &HintBag {
        &self.hints
    }

    pub fn posted_at(&self) -> Instant {
        self.posted_at
    }

    pub fn lifecycle(&self) -> OpLifecycle {
        self.lock_state().lifecycle
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: OpLifecycle) {
        self.lock_state().lifecycle = lifecycle;
    }

    pub(crate) fn set_worker(&self, worker: RawId) {
        self.lock_state().worker = worker;
    }

    pub(crate) fn worker(&self) -> RawId {
        self.lock_state().worker
    }

    /// Run one round of the service function
    ///
    /// Returns the outcome and the wall time the round took. An `Err` from
    /// the service closure is surfaced unchanged; the caller decides whether
    /// it completes the op.
    pub(crate) fn service(&self) -> (Result<ServiceOutcome>, Duration) {
        let args = ServiceArgs {
            op_id: self.id(),
            hints: &self.hints,
        };
        let start = Instant::now();
        let result = {
            let mut service = self.service.lock().unwrap_or_else(|e| e.into_inner());
            (service)(&args)
        };
        let elapsed = start.elapsed();
        self.lock_state().service_time += elapsed;
        (result, elapsed)
    }

    /// Total time spent inside the service function so far
    pub fn service_time(&self) -> Duration {
        self.lock_state().service_time
    }

    /// Take the cancel closure, if one was supplied and not yet consumed
    pub(crate) fn take_cancel(&self) -> Option<CancelFn> {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Record entry into a queue, enforcing the one-queue invariant
    pub(crate) fn mark_enqueued(&self, queue: QueueId) -> Result<Instant> {
        let mut state = self.lock_state();
        if let Some(current) = state.in_queue {
            return Err(Error::InvalidArg(format!(
                "op {} is already in queue {}",
                self.id(),
                current
            )));
        }
        let now = Instant::now();
        state.in_queue = Some(queue);
        state.enqueued_at = Some(now);
        state.lifecycle = OpLifecycle::Queued;
        Ok(now)
    }

    /// Record removal from a queue, returning the enqueue timestamp
    pub(crate) fn mark_dequeued(&self) -> Option<Instant> {
        let mut state = self.lock_state();
        state.in_queue = None;
        state.enqueued_at.take()
    }

    /// Queue currently holding this op, if any
    pub fn queue(&self) -> Option<QueueId> {
        self.lock_state().in_queue
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, OpMutState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Operation")
            .field("id", &self.id())
            .field("user_data", &self.user_data)
            .field("lifecycle", &state.lifecycle)
            .field("in_queue", &state.in_queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_op() -> Operation {
        let ctx = CompletionContext::open_pull();
        Operation::new(
            ctx,
            0,
            Box::new(|_| Ok(ServiceOutcome::Completed)),
            None,
            HintBag::new(),
        )
    }

    #[test]
    fn test_lifecycle_starts_unposted() {
        let op = noop_op();
        assert_eq!(op.lifecycle(), OpLifecycle::Unposted);
        assert!(op.queue().is_none());
        assert_eq!(op.id(), RawId::NULL);
    }

    #[test]
    fn test_single_queue_invariant() {
        let op = noop_op();
        op.mark_enqueued(1).unwrap();
        assert_eq!(op.queue(), Some(1));
        assert_eq!(op.lifecycle(), OpLifecycle::Queued);

        // A second enqueue without a dequeue must be rejected.
        assert!(matches!(op.mark_enqueued(2), Err(Error::InvalidArg(_))));

        op.mark_dequeued().unwrap();
        assert!(op.queue().is_none());
        op.mark_enqueued(2).unwrap();
    }

    #[test]
    fn test_service_accumulates_time() {
        let ctx = CompletionContext::open_pull();
        let mut calls = 0u32;
        let op = Operation::new(
            ctx,
            0,
            Box::new(move |_| {
                calls += 1;
                if calls < 2 {
                    Ok(ServiceOutcome::Continue)
                } else {
                    Ok(ServiceOutcome::Completed)
                }
            }),
            None,
            HintBag::new(),
        );

        let (outcome, _) = op.service();
        assert_eq!(outcome.unwrap(), ServiceOutcome::Continue);
        let (outcome, _) = op.service();
        assert_eq!(outcome.unwrap(), ServiceOutcome::Completed);
    }

    #[test]
    fn test_hints_forwarded() {
        let ctx = CompletionContext::open_pull();
        let mut bag = HintBag::new();
        bag.add("request.id", b"9");
        let op = Operation::new(
            ctx,
            0,
            Box::new(|args| {
                assert_eq!(args.hints.get("request.id"), Some(&b"9"[..]));
                Ok(ServiceOutcome::Completed)
            }),
            None,
            bag.clone(),
        );
        let (outcome, _) = op.service();
        assert_eq!(outcome.unwrap(), ServiceOutcome::Completed);
    }

    #[test]
    fn test_take_cancel_consumes() {
        let ctx = CompletionContext::open_pull();
        let op = Operation::new(
            ctx,
            0,
            Box::new(|_| Ok(ServiceOutcome::Completed)),
            Some(Box::new(|| Ok(()))),
            HintBag::new(),
        );
        assert!(op.take_cancel().is_some());
        assert!(op.take_cancel().is_none());
    }
}

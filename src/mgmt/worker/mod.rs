//! Worker execution strategies
//!
//! A worker decides how posted ops get serviced. Six strategies exist:
//!
//! - **Blocking**: services the op inline on the posting thread
//! - **PerOp**: spawns one detached thread per posted op
//! - **Queues**: cooperative; queues ops and services them when the caller
//!   donates time through `do_work`
//! - **Threaded**: a fixed thread pool servicing a rotating list of queues
//! - **External**: forwards posts to a caller-provided submission function
//!   with bounded outstanding-post backpressure
//! - **Pool**: N threads draining one internal queue
//!
//! Workers are owned by a manager and call back into it to service and
//! complete ops; they hold a `Weak` reference so worker threads cannot keep
//! a dropped manager alive.

pub mod blocking;
pub mod external;
pub mod per_op;
pub mod pool;
pub mod queues;
pub mod threaded;

use crate::mgmt::op::Operation;
use crate::mgmt::queue::{OpQueue, QueueId};
use crate::mgmt::OpManager;
use crate::registry::RawId;
use crate::{Error, Result};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub use blocking::BlockingWorker;
pub use external::{ExternalAttrs, ExternalPostFn, ExternalWorker};
pub use per_op::PerOpWorker;
pub use pool::{PoolAttrs, PoolWorker};
pub use queues::QueuesWorker;
pub use threaded::{ThreadedAttrs, ThreadedWorker};

/// Id of a worker within a manager
pub type WorkerId = RawId;

/// Outcome of posting an op to a worker
#[derive(Debug)]
pub enum PostOutcome {
    /// The op was queued or otherwise accepted; completion arrives through
    /// the owning context
    Posted,
    /// The worker serviced the op inline; the result is returned directly
    /// and the op never reaches its context
    Completed(Result<()>),
}

/// Construction attributes, one variant per worker kind
pub enum WorkerAttrs {
    Blocking,
    PerOp,
    Queues {
        /// Ops pulled per queue per `do_work` round
        ops_per_round: usize,
    },
    Threaded(ThreadedAttrs),
    External(ExternalAttrs),
    Pool(PoolAttrs),
}

/// A worker instance owned by a manager
pub enum WorkerKind {
    Blocking(BlockingWorker),
    PerOp(PerOpWorker),
    Queues(QueuesWorker),
    Threaded(ThreadedWorker),
    External(ExternalWorker),
    Pool(PoolWorker),
}

impl WorkerKind {
    /// Build a worker from attributes
    pub fn new(manager: Weak<OpManager>, attrs: WorkerAttrs) -> Result<Self> {
        Ok(match attrs {
            WorkerAttrs::Blocking => WorkerKind::Blocking(BlockingWorker::new(manager)),
            WorkerAttrs::PerOp => WorkerKind::PerOp(PerOpWorker::new(manager)),
            WorkerAttrs::Queues { ops_per_round } => {
                WorkerKind::Queues(QueuesWorker::new(manager, ops_per_round))
            }
            WorkerAttrs::Threaded(attrs) => {
                WorkerKind::Threaded(ThreadedWorker::new(manager, attrs)?)
            }
            WorkerAttrs::External(attrs) => {
                WorkerKind::External(ExternalWorker::new(manager, attrs))
            }
            WorkerAttrs::Pool(attrs) => WorkerKind::Pool(PoolWorker::new(manager, attrs)?),
        })
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            WorkerKind::Blocking(_) => "blocking",
            WorkerKind::PerOp(_) => "per-op",
            WorkerKind::Queues(_) => "queues",
            WorkerKind::Threaded(_) => "threaded-queues",
            WorkerKind::External(_) => "external",
            WorkerKind::Pool(_) => "pool",
        }
    }

    /// True if the worker manages caller-supplied queues
    pub fn manages_queues(&self) -> bool {
        matches!(self, WorkerKind::Queues(_) | WorkerKind::Threaded(_))
    }

    /// Hand a queue to the worker
    pub fn queue_add(&self, queue: Arc<OpQueue>) -> Result<()> {
        match self {
            WorkerKind::Queues(w) => w.queue_add(queue),
            WorkerKind::Threaded(w) => w.queue_add(queue),
            _ => Err(Error::InvalidArg(format!(
                "{} worker does not manage queues",
                self.name()
            ))),
        }
    }

    /// Take a queue away from the worker
    pub fn queue_remove(&self, queue_id: QueueId) -> Result<()> {
        match self {
            WorkerKind::Queues(w) => w.queue_remove(queue_id),
            WorkerKind::Threaded(w) => w.queue_remove(queue_id),
            _ => Err(Error::InvalidArg(format!(
                "{} worker does not manage queues",
                self.name()
            ))),
        }
    }

    /// Post an op, optionally to a specific queue
    pub fn post(&self, queue_id: Option<QueueId>, op: Arc<Operation>) -> Result<PostOutcome> {
        match self {
            WorkerKind::Blocking(w) => w.post(op),
            WorkerKind::PerOp(w) => w.post(op),
            WorkerKind::Queues(w) => w.post(queue_id, op),
            WorkerKind::Threaded(w) => w.post(queue_id, op),
            WorkerKind::External(w) => w.post(op),
            WorkerKind::Pool(w) => w.post(op),
        }
    }

    /// Donate caller time to a cooperative worker
    ///
    /// Only the queues worker services ops here; every other variant makes
    /// progress on its own and returns `InvalidArg`.
    pub fn do_work(&self, budget: Duration) -> Result<usize> {
        match self {
            WorkerKind::Queues(w) => w.do_work(budget),
            _ => Err(Error::InvalidArg(format!(
                "{} worker services ops without do_work",
                self.name()
            ))),
        }
    }

    /// Attempt to cancel a queued op
    pub fn cancel(&self, queue_id: Option<QueueId>, op: &Arc<Operation>) -> Result<()> {
        match self {
            WorkerKind::Queues(w) => w.cancel(queue_id, op),
            WorkerKind::Threaded(w) => w.cancel(queue_id, op),
            WorkerKind::Pool(w) => w.cancel(op),
            _ => Err(Error::NotFound),
        }
    }

    /// Stop worker threads and release resources
    pub fn shutdown(&self) -> Result<()> {
        match self {
            WorkerKind::Blocking(_) | WorkerKind::Queues(_) => Ok(()),
            WorkerKind::PerOp(w) => w.shutdown(),
            WorkerKind::Threaded(w) => w.shutdown(),
            WorkerKind::External(w) => w.shutdown(),
            WorkerKind::Pool(w) => w.shutdown(),
        }
    }
}

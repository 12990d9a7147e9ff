//! Threaded-queues worker
//!
//! A fixed pool of OS threads services a rotating list of queues. Each
//! thread detaches the head queue into an in-use list, waits up to the
//! configured timeout for a batch of ops, reattaches the queue at the tail,
//! and services the batch through the manager. A peer is signalled only if
//! the queue still holds work after the batch was taken, so idle threads
//! are not woken for nothing.
//!
//! `queue_remove` raises a remove-requested flag; servicing threads park on
//! the condvar until the flag clears, which guarantees the queue comes back
//! to the idle list where it can be plucked off safely.

use crate::mgmt::op::Operation;
use crate::mgmt::queue::{OpQueue, QueueId};
use crate::mgmt::worker::PostOutcome;
use crate::mgmt::{OpManager, ServiceRound};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long an idle thread sleeps waiting for a queue to be added
const WAIT_FOR_QUEUE_INTERVAL: Duration = Duration::from_secs(1);

/// How long `queue_remove` sleeps between checks for the queue returning
const REMOVE_POLL_INTERVAL: Duration = Duration::from_millis(10);

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10);

/// Attributes for a threaded-queues worker
#[derive(Debug, Clone)]
pub struct ThreadedAttrs {
    /// Number of servicing threads
    pub thread_count: usize,
    /// Maximum ops pulled from a queue per servicing round
    pub ops_per_queue: usize,
    /// Queue wait timeout per round (zero selects the default)
    pub timeout: Duration,
}

impl Default for ThreadedAttrs {
    fn default() -> Self {
        ThreadedAttrs {
            thread_count: num_cpus::get(),
            ops_per_queue: 8,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

struct SharedState {
    queues: VecDeque<Arc<OpQueue>>,
    inuse: Vec<Arc<OpQueue>>,
    remove_requested: bool,
    running: bool,
}

struct Shared {
    manager: Weak<OpManager>,
    state: Mutex<SharedState>,
    cond: Condvar,
    ops_per_queue: usize,
    timeout: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct ThreadedWorker {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadedWorker {
    pub fn new(manager: Weak<OpManager>, attrs: ThreadedAttrs) -> Result<Self> {
        if attrs.thread_count == 0 {
            return Err(Error::InvalidArg("thread_count must be > 0".into()));
        }
        let shared = Arc::new(Shared {
            manager,
            state: Mutex::new(SharedState {
                queues: VecDeque::new(),
                inuse: Vec::new(),
                remove_requested: false,
                running: true,
            }),
            cond: Condvar::new(),
            ops_per_queue: attrs.ops_per_queue.max(1),
            timeout: if attrs.timeout.is_zero() {
                DEFAULT_TIMEOUT
            } else {
                attrs.timeout
            },
        });

        let mut threads = Vec::with_capacity(attrs.thread_count);
        for i in 0..attrs.thread_count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("stratum-worker-{}", i))
                .spawn(move || service_thread(shared))
                .map_err(|e| Error::Io(format!("thread spawn: {}", e)))?;
            threads.push(handle);
        }

        Ok(ThreadedWorker {
            shared,
            threads: Mutex::new(threads),
        })
    }

    pub fn queue_add(&self, queue: Arc<OpQueue>) -> Result<()> {
        queue.add_producer();
        queue.add_consumer();
        let mut state = self.shared.lock();
        state.queues.push_back(queue);
        // Wake one thread waiting for a queue to appear.
        self.shared.cond.notify_one();
        Ok(())
    }

    pub fn queue_remove(&self, queue_id: QueueId) -> Result<()> {
        let mut state = self.shared.lock();
        state.remove_requested = true;

        // Wait for the queue to come back to the idle list; a servicing
        // thread may hold it detached right now.
        loop {
            if let Some(pos) = state.queues.iter().position(|q| q.id() == queue_id) {
                let queue = state.queues.remove(pos).expect("position found above");
                queue.remove_producer();
                queue.remove_consumer();
                break;
            }
            let known = state.inuse.iter().any(|q| q.id() == queue_id);
            if !known {
                state.remove_requested = false;
                self.shared.cond.notify_all();
                return Err(Error::NotFound);
            }
            let (guard, _) = self
                .shared
                .cond
                .wait_timeout(state, REMOVE_POLL_INTERVAL)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }

        state.remove_requested = false;
        self.shared.cond.notify_all();
        Ok(())
    }

    fn resolve(&self, queue_id: Option<QueueId>) -> Result<Arc<OpQueue>> {
        let state = self.shared.lock();
        match queue_id {
            Some(id) => state
                .queues
                .iter()
                .chain(state.inuse.iter())
                .find(|q| q.id() == id)
                .cloned()
                .ok_or(Error::NotFound),
            None => {
                let total = state.queues.len() + state.inuse.len();
                if total != 1 {
                    return Err(Error::InvalidArg(
                        "no queue named and more than one queue is managed".into(),
                    ));
                }
                Ok(state
                    .queues
                    .front()
                    .or_else(|| state.inuse.first())
                    .cloned()
                    .expect("exactly one queue exists"))
            }
        }
    }

    pub fn post(&self, queue_id: Option<QueueId>, op: Arc<Operation>) -> Result<PostOutcome> {
        let queue = self.resolve(queue_id)?;
        tracing::debug!(worker = "threaded-queues", queue = queue.id(), op = %op.id(), "post");
        queue.push(op)?;
        Ok(PostOutcome::Posted)
    }

    /// Rewrite a specific op out of its queue
    pub fn cancel(&self, queue_id: Option<QueueId>, op: &Arc<Operation>) -> Result<()> {
        let queue = self.resolve(queue_id)?;
        queue.remove(op)
    }

    /// Stop and join all servicing threads
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.shared.lock();
            state.running = false;
            self.shared.cond.notify_all();
        }
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for ThreadedWorker {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn service_thread(shared: Arc<Shared>) {
    loop {
        let mut state = shared.lock();
        if !state.running {
            break;
        }

        if state.remove_requested {
            // Yield until the removal handshake finishes.
            let (guard, _) = shared
                .cond
                .wait_timeout(state, REMOVE_POLL_INTERVAL)
                .unwrap_or_else(|e| e.into_inner());
            drop(guard);
            continue;
        }

        let queue = match state.queues.pop_front() {
            Some(queue) => {
                state.inuse.push(Arc::clone(&queue));
                drop(state);
                queue
            }
            None => {
                // No queues yet; sleep until one is added, with a timeout
                // short enough to notice shutdown.
                let _ = shared
                    .cond
                    .wait_timeout(state, WAIT_FOR_QUEUE_INTERVAL)
                    .unwrap_or_else(|e| e.into_inner());
                continue;
            }
        };

        let pulled = queue.timed_wait(shared.ops_per_queue, shared.timeout);

        {
            let mut state = shared.lock();
            state.inuse.retain(|q| !Arc::ptr_eq(q, &queue));
            state.queues.push_back(Arc::clone(&queue));
            // Signal a peer only if the queue still holds work; posts into
            // an idle rotation do their own signalling.
            if queue.count() > 0 {
                shared.cond.notify_one();
            }
            if state.remove_requested {
                // queue_remove may be waiting for this queue to reattach.
                shared.cond.notify_all();
            }
        }

        let ops = match pulled {
            Ok(ops) => ops,
            Err(_) => continue,
        };

        let manager = match shared.manager.upgrade() {
            Some(manager) => manager,
            None => break,
        };
        for op in ops {
            match manager.service_op(&op) {
                ServiceRound::Completed(result) => manager.complete_op(&op, result),
                ServiceRound::Continue => {}
            }
        }
    }
}

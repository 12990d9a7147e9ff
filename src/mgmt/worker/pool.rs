//! Pool worker
//!
//! N threads draining one internal queue: the threaded-queues strategy
//! specialized to a single queue the worker owns itself. There is no queue
//! management surface; posts always land on the internal queue and any
//! servicing thread picks them up.

use crate::mgmt::op::Operation;
use crate::mgmt::queue::OpQueue;
use crate::mgmt::worker::PostOutcome;
use crate::mgmt::{OpManager, ServiceRound};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Attributes for a pool worker
#[derive(Debug, Clone)]
pub struct PoolAttrs {
    pub thread_count: usize,
    /// Maximum ops a thread takes per round
    pub ops_per_round: usize,
    /// Queue wait timeout per round
    pub timeout: Duration,
}

impl Default for PoolAttrs {
    fn default() -> Self {
        PoolAttrs {
            thread_count: num_cpus::get(),
            ops_per_round: 8,
            timeout: Duration::from_millis(10),
        }
    }
}

pub struct PoolWorker {
    queue: Arc<OpQueue>,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolWorker {
    pub fn new(manager: Weak<OpManager>, attrs: PoolAttrs) -> Result<Self> {
        if attrs.thread_count == 0 {
            return Err(Error::InvalidArg("thread_count must be > 0".into()));
        }
        let queue = OpQueue::new();
        let running = Arc::new(AtomicBool::new(true));

        let mut threads = Vec::with_capacity(attrs.thread_count);
        for i in 0..attrs.thread_count {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            let manager = manager.clone();
            let ops_per_round = attrs.ops_per_round.max(1);
            let timeout = attrs.timeout;
            queue.add_consumer();
            let handle = thread::Builder::new()
                .name(format!("stratum-pool-{}", i))
                .spawn(move || {
                    while running.load(Ordering::Acquire) {
                        let ops = match queue.timed_wait(ops_per_round, timeout) {
                            Ok(ops) => ops,
                            Err(_) => continue,
                        };
                        let manager = match manager.upgrade() {
                            Some(manager) => manager,
                            None => break,
                        };
                        for op in ops {
                            match manager.service_op(&op) {
                                ServiceRound::Completed(result) => {
                                    manager.complete_op(&op, result)
                                }
                                ServiceRound::Continue => {}
                            }
                        }
                    }
                    queue.remove_consumer();
                })
                .map_err(|e| Error::Io(format!("thread spawn: {}", e)))?;
            threads.push(handle);
        }

        Ok(PoolWorker {
            queue,
            running,
            threads: Mutex::new(threads),
        })
    }

    pub fn post(&self, op: Arc<Operation>) -> Result<PostOutcome> {
        self.queue.push(op)?;
        Ok(PostOutcome::Posted)
    }

    pub fn cancel(&self, op: &Arc<Operation>) -> Result<()> {
        self.queue.remove(op)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for PoolWorker {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

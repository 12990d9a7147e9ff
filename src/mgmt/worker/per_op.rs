//! Per-op worker
//!
//! Spawns one detached thread per posted op. The thread services the op
//! through the manager and completes it into the owning context. An
//! in-flight counter gates shutdown: `shutdown` drains briefly and fails
//! `Busy` if threads remain.

use crate::mgmt::op::Operation;
use crate::mgmt::worker::PostOutcome;
use crate::mgmt::{OpManager, ServiceRound};
use crate::{Error, Result};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

const SHUTDOWN_DRAIN: Duration = Duration::from_millis(100);

pub struct PerOpWorker {
    manager: Weak<OpManager>,
    inflight: Arc<(Mutex<usize>, Condvar)>,
}

impl PerOpWorker {
    pub fn new(manager: Weak<OpManager>) -> Self {
        PerOpWorker {
            manager,
            inflight: Arc::new((Mutex::new(0), Condvar::new())),
        }
    }

    /// Threads currently servicing ops
    pub fn inflight(&self) -> usize {
        *self.inflight.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn post(&self, op: Arc<Operation>) -> Result<PostOutcome> {
        let manager = self.manager.clone();
        let inflight = Arc::clone(&self.inflight);

        {
            let mut count = inflight.0.lock().unwrap_or_else(|e| e.into_inner());
            *count += 1;
        }

        let builder = thread::Builder::new().name(format!("stratum-op-{}", op.id()));
        let spawn_result = builder.spawn(move || {
            if let Some(manager) = manager.upgrade() {
                match manager.service_op(&op) {
                    ServiceRound::Completed(result) => manager.complete_op(&op, result),
                    ServiceRound::Continue => {}
                }
            }
            let (lock, cond) = &*inflight;
            let mut count = lock.lock().unwrap_or_else(|e| e.into_inner());
            *count -= 1;
            cond.notify_all();
        });

        if let Err(e) = spawn_result {
            let mut count = self.inflight.0.lock().unwrap_or_else(|e| e.into_inner());
            *count -= 1;
            return Err(Error::Io(format!("thread spawn: {}", e)));
        }
        Ok(PostOutcome::Posted)
    }

    /// Wait briefly for in-flight threads, then fail `Busy` if any remain
    pub fn shutdown(&self) -> Result<()> {
        let (lock, cond) = &*self.inflight;
        let deadline = std::time::Instant::now() + SHUTDOWN_DRAIN;
        let mut count = lock.lock().unwrap_or_else(|e| e.into_inner());
        while *count > 0 {
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(Error::Busy(format!("{} ops in flight", *count)));
            }
            let (guard, _) = cond
                .wait_timeout(count, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            count = guard;
        }
        Ok(())
    }
}

//! Cooperative queues worker
//!
//! Holds an ordered list of queues and owns no threads; ops are serviced
//! only when the caller donates time through `do_work`. Each round detaches
//! the head queue, pulls up to `ops_per_round` entries, services them, and
//! reattaches the queue at the tail, so repeated calls rotate through the
//! queues round-robin. Entries left unserviced when the budget elapses are
//! pushed back to the front of their queue in order.

use crate::mgmt::op::Operation;
use crate::mgmt::queue::{OpQueue, QueueId};
use crate::mgmt::worker::PostOutcome;
use crate::mgmt::{OpManager, ServiceRound};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

pub struct QueuesWorker {
    manager: Weak<OpManager>,
    ops_per_round: usize,
    queues: Mutex<VecDeque<Arc<OpQueue>>>,
}

impl QueuesWorker {
    pub fn new(manager: Weak<OpManager>, ops_per_round: usize) -> Self {
        QueuesWorker {
            manager,
            ops_per_round: ops_per_round.max(1),
            queues: Mutex::new(VecDeque::new()),
        }
    }

    pub fn queue_add(&self, queue: Arc<OpQueue>) -> Result<()> {
        queue.add_producer();
        queue.add_consumer();
        self.lock().push_back(queue);
        Ok(())
    }

    pub fn queue_remove(&self, queue_id: QueueId) -> Result<()> {
        let mut queues = self.lock();
        let pos = queues
            .iter()
            .position(|q| q.id() == queue_id)
            .ok_or(Error::NotFound)?;
        let queue = queues.remove(pos).expect("position found above");
        queue.remove_producer();
        queue.remove_consumer();
        Ok(())
    }

    /// Resolve an explicit queue id, or the single managed queue when the
    /// caller did not name one
    fn resolve(&self, queue_id: Option<QueueId>) -> Result<Arc<OpQueue>> {
        let queues = self.lock();
        match queue_id {
            Some(id) => queues
                .iter()
                .find(|q| q.id() == id)
                .cloned()
                .ok_or(Error::NotFound),
            None => {
                if queues.len() != 1 {
                    return Err(Error::InvalidArg(
                        "no queue named and more than one queue is managed".into(),
                    ));
                }
                Ok(queues[0].clone())
            }
        }
    }

    pub fn post(&self, queue_id: Option<QueueId>, op: Arc<Operation>) -> Result<PostOutcome> {
        let queue = self.resolve(queue_id)?;
        queue.push(op)?;
        Ok(PostOutcome::Posted)
    }

    pub fn cancel(&self, queue_id: Option<QueueId>, op: &Arc<Operation>) -> Result<()> {
        let queue = self.resolve(queue_id)?;
        queue.remove(op)
    }

    /// Service ops for up to `budget`, returning the number serviced
    pub fn do_work(&self, budget: Duration) -> Result<usize> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| Error::Internal("manager released".into()))?;
        let deadline = Instant::now() + budget;
        let rounds = self.lock().len();
        let mut serviced = 0;

        for _ in 0..rounds.max(1) {
            // Detach the head queue so a reentrant post cannot observe a
            // half-serviced rotation.
            let queue = match self.lock().pop_front() {
                Some(queue) => queue,
                None => return Ok(serviced),
            };

            let mut pulled = queue.pull(self.ops_per_round);
            let mut leftover = VecDeque::new();
            while let Some(op) = pulled.pop() {
                // pulled is drained back-to-front; service front-to-back by
                // draining into leftover first.
                leftover.push_front(op);
            }
            while let Some(op) = leftover.pop_front() {
                if Instant::now() >= deadline {
                    // Budget elapsed: return the tail unserviced, in order.
                    while let Some(op) = leftover.pop_back() {
                        queue.push_front(op)?;
                    }
                    queue.push_front(op)?;
                    self.lock().push_back(queue);
                    return Ok(serviced);
                }
                match manager.service_op(&op) {
                    ServiceRound::Completed(result) => {
                        manager.complete_op(&op, result);
                        serviced += 1;
                    }
                    ServiceRound::Continue => serviced += 1,
                }
            }

            self.lock().push_back(queue);
            if Instant::now() >= deadline {
                break;
            }
        }
        Ok(serviced)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<OpQueue>>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }
}

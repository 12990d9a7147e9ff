//! External worker
//!
//! Delegates op submission to a caller-provided function, e.g. a non-local
//! transport that completes ops through its own notification path. The
//! worker never services ops itself; it only tracks how many posts are
//! outstanding and parks excess posts on a wait list until completions
//! drain, bounding the pressure on the external system.

use crate::mgmt::op::Operation;
use crate::mgmt::worker::PostOutcome;
use crate::mgmt::OpManager;
use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Submission function supplied by the external system
pub type ExternalPostFn = Box<dyn Fn(&Arc<Operation>) -> Result<()> + Send + Sync>;

/// Attributes for an external worker
pub struct ExternalAttrs {
    pub post: ExternalPostFn,
    /// Maximum outstanding posts before backpressure engages
    pub max_posts: usize,
}

struct ExternalState {
    outstanding: usize,
    waiting: VecDeque<Arc<Operation>>,
}

pub struct ExternalWorker {
    manager: Weak<OpManager>,
    post_fn: ExternalPostFn,
    max_posts: usize,
    state: Mutex<ExternalState>,
}

impl ExternalWorker {
    pub fn new(manager: Weak<OpManager>, attrs: ExternalAttrs) -> Self {
        ExternalWorker {
            manager,
            post_fn: attrs.post,
            max_posts: attrs.max_posts.max(1),
            state: Mutex::new(ExternalState {
                outstanding: 0,
                waiting: VecDeque::new(),
            }),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    pub fn waiting(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn post(&self, op: Arc<Operation>) -> Result<PostOutcome> {
        let submit = {
            let mut state = self.lock();
            if state.outstanding < self.max_posts {
                state.outstanding += 1;
                true
            } else {
                tracing::debug!(op = %op.id(), "external worker at max posts, parking op");
                state.waiting.push_back(Arc::clone(&op));
                false
            }
        };
        if submit {
            if let Err(e) = (self.post_fn)(&op) {
                let mut state = self.lock();
                state.outstanding -= 1;
                return Err(e);
            }
        }
        Ok(PostOutcome::Posted)
    }

    /// Called by the manager when an op owned by this worker completes;
    /// releases a parked post if one is waiting
    pub(crate) fn completion_drained(&self) {
        let next = {
            let mut state = self.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
            if state.outstanding >= self.max_posts {
                return;
            }
            match state.waiting.pop_front() {
                Some(op) => {
                    state.outstanding += 1;
                    op
                }
                None => return,
            }
        };
        if let Err(e) = (self.post_fn)(&next) {
            // The parked op could not be submitted; surface the error
            // through its context. Completing it re-enters this function,
            // which rebalances the outstanding count and releases the next
            // parked op if any.
            if let Some(manager) = self.manager.upgrade() {
                manager.complete_op(&next, Err(e));
            }
        }
    }

    pub fn shutdown(&self) -> Result<()> {
        let state = self.lock();
        if state.outstanding > 0 || !state.waiting.is_empty() {
            return Err(Error::Busy(format!(
                "{} posts outstanding, {} parked",
                state.outstanding,
                state.waiting.len()
            )));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ExternalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

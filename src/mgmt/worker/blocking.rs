//! Blocking worker
//!
//! Services the op inline on the posting thread and returns the result from
//! `post` itself. Used for ops whose cost is negligible or that must run
//! synchronously; an op completed this way never reaches its context and is
//! not testable afterwards.

use crate::mgmt::op::Operation;
use crate::mgmt::worker::PostOutcome;
use crate::mgmt::{OpManager, ServiceRound};
use crate::{Error, Result};
use std::sync::{Arc, Weak};

pub struct BlockingWorker {
    manager: Weak<OpManager>,
}

impl BlockingWorker {
    pub fn new(manager: Weak<OpManager>) -> Self {
        BlockingWorker { manager }
    }

    pub fn post(&self, op: Arc<Operation>) -> Result<PostOutcome> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| Error::Internal("manager released".into()))?;
        match manager.service_op(&op) {
            ServiceRound::Completed(result) => Ok(PostOutcome::Completed(result)),
            // The service function handed itself to an internal
            // continuation; completion arrives through the context.
            ServiceRound::Continue => Ok(PostOutcome::Posted),
        }
    }
}

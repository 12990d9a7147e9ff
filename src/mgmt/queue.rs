//! Op queues
//!
//! Insertion-order-preserving FIFO of ops with blocking and timed pulls,
//! predicate search, action triggers, and residency statistics. Queues are
//! shared objects: workers consume from them, posters produce into them, and
//! both register their role through the producer/consumer refcounts so a
//! queue cannot be torn down under an active party.
//!
//! Triggers fire while the queue lock is held; trigger callbacks must be
//! short and must not call back into the same queue.

use crate::mgmt::op::Operation;
use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Process-unique queue id
pub type QueueId = u64;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Actions a trigger can be registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAction {
    /// An entry was pushed; the callback receives the post-push count
    Posted,
    /// Entries were pulled or removed; the callback receives the remaining
    /// count
    Removed,
    /// The queue transitioned to empty; the callback receives 0
    Emptied,
}

/// Trigger callback; the argument is the entry count after the action
pub type TriggerFn = Box<dyn Fn(usize) + Send>;

/// Comparator for ordered insertion; `None` keeps plain FIFO order
pub type CompareFn = Box<dyn Fn(&Arc<Operation>, &Arc<Operation>) -> std::cmp::Ordering + Send + Sync>;

/// Entry-matching predicate for search and waits
pub type FindFn<'a> = &'a dyn Fn(&Arc<Operation>) -> bool;

/// Residency statistics, estimated with Knuth's incremental algorithm
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    /// Entries ever pulled or removed from the queue
    pub total_queued: u64,
    /// Mean residency in microseconds
    pub avg_queued_us: f64,
    /// Sample variance of residency in microseconds squared
    pub var_queued_us: f64,
}

struct Trigger {
    action: QueueAction,
    callback: TriggerFn,
}

#[derive(Default)]
struct StatsAccum {
    total: u64,
    mean: f64,
    m2: f64,
}

impl StatsAccum {
    fn update(&mut self, residency_us: f64) {
        self.total += 1;
        let delta = residency_us - self.mean;
        self.mean += delta / self.total as f64;
        self.m2 += delta * (residency_us - self.mean);
    }

    fn snapshot(&self) -> QueueStats {
        QueueStats {
            total_queued: self.total,
            avg_queued_us: self.mean,
            var_queued_us: if self.total > 1 {
                self.m2 / (self.total - 1) as f64
            } else {
                0.0
            },
        }
    }
}

struct QueueInner {
    entries: VecDeque<Arc<Operation>>,
    triggers: Vec<Trigger>,
    stats: StatsAccum,
    producers: usize,
    consumers: usize,
}

/// Shared op queue
pub struct OpQueue {
    id: QueueId,
    compare: Option<CompareFn>,
    inner: Mutex<QueueInner>,
    cond: Condvar,
    destroyed: AtomicBool,
}

impl OpQueue {
    /// Create a FIFO queue
    pub fn new() -> Arc<Self> {
        Self::with_compare(None)
    }

    /// Create a queue with ordered insertion
    pub fn with_compare(compare: Option<CompareFn>) -> Arc<Self> {
        Arc::new(OpQueue {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            compare,
            inner: Mutex::new(QueueInner {
                entries: VecDeque::new(),
                triggers: Vec::new(),
                stats: StatsAccum::default(),
                producers: 0,
                consumers: 0,
            }),
            cond: Condvar::new(),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn count(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn add_producer(&self) {
        self.lock().producers += 1;
    }

    pub fn remove_producer(&self) {
        let mut inner = self.lock();
        inner.producers = inner.producers.saturating_sub(1);
    }

    pub fn add_consumer(&self) {
        self.lock().consumers += 1;
    }

    pub fn remove_consumer(&self) {
        let mut inner = self.lock();
        inner.consumers = inner.consumers.saturating_sub(1);
    }

    /// Register a trigger for an action
    pub fn add_trigger(&self, action: QueueAction, callback: TriggerFn) {
        self.lock().triggers.push(Trigger { action, callback });
    }

    /// Append an entry (or insert in comparator order)
    pub fn push(&self, op: Arc<Operation>) -> Result<()> {
        self.insert(op, false)
    }

    /// Insert an entry at the front, bypassing any comparator
    ///
    /// Used by cooperative workers to return unserviced entries without
    /// perturbing their order.
    pub fn push_front(&self, op: Arc<Operation>) -> Result<()> {
        self.insert(op, true)
    }

    fn insert(&self, op: Arc<Operation>, front: bool) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::InvalidArg("push on a destroyed queue".into()));
        }
        op.mark_enqueued(self.id)?;
        let mut inner = self.lock();
        tracing::debug!(queue = self.id, op = %op.id(), front, "queue push");
        if front {
            inner.entries.push_front(op);
        } else if let Some(compare) = &self.compare {
            let pos = inner
                .entries
                .iter()
                .position(|e| compare(&op, e) == std::cmp::Ordering::Less)
                .unwrap_or(inner.entries.len());
            inner.entries.insert(pos, op);
        } else {
            inner.entries.push_back(op);
        }
        let count = inner.entries.len();
        self.cond.notify_all();
        Self::fire(&inner, QueueAction::Posted, count);
        Ok(())
    }

    /// Pull up to `max` entries without blocking
    pub fn pull(&self, max: usize) -> Vec<Arc<Operation>> {
        let mut inner = self.lock();
        self.pull_locked(&mut inner, max)
    }

    fn pull_locked(&self, inner: &mut QueueInner, max: usize) -> Vec<Arc<Operation>> {
        let take = max.min(inner.entries.len());
        let mut out = Vec::with_capacity(take);
        let now = Instant::now();
        for _ in 0..take {
            let op = inner.entries.pop_front().expect("count checked above");
            if let Some(enqueued) = op.mark_dequeued() {
                inner
                    .stats
                    .update(now.duration_since(enqueued).as_micros() as f64);
            }
            out.push(op);
        }
        if !out.is_empty() {
            let count = inner.entries.len();
            tracing::debug!(queue = self.id, pulled = out.len(), "queue pull");
            Self::fire(inner, QueueAction::Removed, count);
            if count == 0 {
                Self::fire(inner, QueueAction::Emptied, 0);
            }
        }
        out
    }

    /// Remove a specific entry
    ///
    /// Returns `NotFound` if the op is not currently in this queue.
    pub fn remove(&self, op: &Arc<Operation>) -> Result<()> {
        let mut inner = self.lock();
        let pos = inner
            .entries
            .iter()
            .position(|e| Arc::ptr_eq(e, op))
            .ok_or(Error::NotFound)?;
        let removed = inner.entries.remove(pos).expect("position found above");
        if let Some(enqueued) = removed.mark_dequeued() {
            inner
                .stats
                .update(enqueued.elapsed().as_micros() as f64);
        }
        let count = inner.entries.len();
        Self::fire(&inner, QueueAction::Removed, count);
        if count == 0 {
            Self::fire(&inner, QueueAction::Emptied, 0);
        }
        Ok(())
    }

    /// Remove and return the first entry matching a predicate
    pub fn search_and_remove(&self, find: FindFn<'_>) -> Result<Arc<Operation>> {
        let mut inner = self.lock();
        let pos = inner
            .entries
            .iter()
            .position(|e| find(e))
            .ok_or(Error::NotFound)?;
        let op = inner.entries.remove(pos).expect("position found above");
        if let Some(enqueued) = op.mark_dequeued() {
            inner
                .stats
                .update(enqueued.elapsed().as_micros() as f64);
        }
        let count = inner.entries.len();
        Self::fire(&inner, QueueAction::Removed, count);
        if count == 0 {
            Self::fire(&inner, QueueAction::Emptied, 0);
        }
        Ok(op)
    }

    /// Block until at least one entry is present, then pull up to `max`
    pub fn wait(&self, max: usize) -> Vec<Arc<Operation>> {
        let mut inner = self.lock();
        // Spurious wakeups leave the queue empty; loop until there is work.
        while inner.entries.is_empty() {
            inner = self
                .cond
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
        self.pull_locked(&mut inner, max)
    }

    /// Wait up to `timeout` for entries, then pull up to `max`
    ///
    /// Wakes on any post. A concurrent consumer may drain the queue between
    /// the wakeup and the pull, so fewer entries than posted (including
    /// zero before the deadline) are possible; only a deadline expiry with
    /// an empty queue returns `Timeout`.
    pub fn timed_wait(&self, max: usize, timeout: Duration) -> Result<Vec<Arc<Operation>>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while inner.entries.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let (guard, wait_result) = self
                .cond
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
            if wait_result.timed_out() && inner.entries.is_empty() {
                return Err(Error::Timeout);
            }
        }
        Ok(self.pull_locked(&mut inner, max))
    }

    /// Wait up to `timeout` for an entry matching a predicate and remove it
    pub fn wait_for_entry(
        &self,
        find: FindFn<'_>,
        timeout: Duration,
    ) -> Result<Arc<Operation>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(pos) = inner.entries.iter().position(|e| find(e)) {
                let op = inner.entries.remove(pos).expect("position found above");
                if let Some(enqueued) = op.mark_dequeued() {
                    inner
                        .stats
                        .update(enqueued.elapsed().as_micros() as f64);
                }
                let count = inner.entries.len();
                Self::fire(&inner, QueueAction::Removed, count);
                if count == 0 {
                    Self::fire(&inner, QueueAction::Emptied, 0);
                }
                return Ok(op);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let (guard, _) = self
                .cond
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
        }
    }

    /// Current residency statistics
    pub fn stats(&self) -> QueueStats {
        self.lock().stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.lock().stats = StatsAccum::default();
    }

    /// Validate that the queue may be torn down
    ///
    /// Requires an empty entry list (`InvalidArg` otherwise) and zero
    /// registered producers/consumers (`Busy` otherwise). The queue itself
    /// is freed when the last `Arc` drops.
    pub fn destroy(&self) -> Result<()> {
        let inner = self.lock();
        if !inner.entries.is_empty() {
            return Err(Error::InvalidArg("cannot destroy a non-empty queue".into()));
        }
        if inner.producers != 0 || inner.consumers != 0 {
            return Err(Error::Busy(format!(
                "queue {} has {} producers and {} consumers",
                self.id, inner.producers, inner.consumers
            )));
        }
        self.destroyed.store(true, Ordering::Release);
        Ok(())
    }

    fn fire(inner: &QueueInner, action: QueueAction, count: usize) {
        for trigger in &inner.triggers {
            if trigger.action == action {
                (trigger.callback)(count);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for OpQueue {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        if !inner.entries.is_empty() {
            tracing::warn!(queue = self.id, count = inner.entries.len(),
                "queue dropped with entries still linked");
        }
    }
}

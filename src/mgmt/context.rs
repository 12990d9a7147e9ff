//! Completion contexts
//!
//! A context aggregates the completions of a group of in-flight ops. In
//! *pull* mode, completed ops queue inside the context until a caller
//! retrieves them with one of the `test_*` calls. In *callback* mode, the
//! completing thread invokes a user callback immediately; nothing is
//! buffered.
//!
//! The completing thread holds no context lock while a callback runs, and
//! callbacks receive exactly the `(op, user data, result)` triple that a
//! pull-mode `test` would have returned; the two modes are semantically
//! equivalent.
//!
//! Completion ordering is only guaranteed per op, never across ops.

use crate::mgmt::op::OpId;
use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// One completed op as delivered to a context
#[derive(Debug, Clone)]
pub struct Completion {
    pub op_id: OpId,
    pub user_data: u64,
    pub result: Result<()>,
}

/// Callback invoked with a batch of completions in callback mode
pub type ContextCallback = Box<dyn Fn(&[Completion]) + Send + Sync>;

struct CtxInner {
    completed: VecDeque<Completion>,
    outstanding: usize,
    closed: bool,
}

/// Completion aggregation for a group of ops
pub struct CompletionContext {
    callback: Option<ContextCallback>,
    inner: Mutex<CtxInner>,
    cond: Condvar,
}

impl CompletionContext {
    /// Open a pull-mode context
    pub fn open_pull() -> Arc<Self> {
        Arc::new(CompletionContext {
            callback: None,
            inner: Mutex::new(CtxInner {
                completed: VecDeque::new(),
                outstanding: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        })
    }

    /// Open a callback-mode context
    pub fn open_callback(callback: ContextCallback) -> Arc<Self> {
        Arc::new(CompletionContext {
            callback: Some(callback),
            inner: Mutex::new(CtxInner {
                completed: VecDeque::new(),
                outstanding: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn is_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Number of posted ops not yet completed
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    /// Completions buffered and not yet tested (always 0 in callback mode)
    pub fn pending(&self) -> usize {
        self.lock().completed.len()
    }

    /// Record that an op was posted against this context
    pub(crate) fn op_started(&self) {
        self.lock().outstanding += 1;
    }

    /// Undo `op_started` for an op that completed inline and was reported
    /// to the caller directly
    pub(crate) fn op_discarded(&self) {
        let mut inner = self.lock();
        inner.outstanding = inner.outstanding.saturating_sub(1);
        self.cond.notify_all();
    }

    /// Deliver one completion
    pub fn complete(&self, completion: Completion) {
        self.complete_list(std::iter::once(completion));
    }

    /// Deliver a batch of completions
    pub fn complete_list<I: IntoIterator<Item = Completion>>(&self, completions: I) {
        if let Some(callback) = &self.callback {
            let batch: Vec<Completion> = completions.into_iter().collect();
            {
                let mut inner = self.lock();
                inner.outstanding = inner.outstanding.saturating_sub(batch.len());
                self.cond.notify_all();
            }
            // Callback runs on the completing thread with no lock held.
            callback(&batch);
        } else {
            let mut inner = self.lock();
            for completion in completions {
                inner.outstanding = inner.outstanding.saturating_sub(1);
                inner.completed.push_back(completion);
            }
            self.cond.notify_all();
        }
    }

    /// Non-blocking removal of a buffered completion for a specific op
    pub(crate) fn take_completion(&self, op_id: OpId) -> Option<Completion> {
        let mut inner = self.lock();
        let pos = inner.completed.iter().position(|c| c.op_id == op_id)?;
        inner.completed.remove(pos)
    }

    /// Wait up to `timeout` for a specific op to complete
    ///
    /// Pull mode only; callback contexts report completions through their
    /// callback and return `InvalidArg` here.
    pub fn test_op(&self, op_id: OpId, timeout: Duration) -> Result<Completion> {
        if self.is_callback() {
            return Err(Error::InvalidArg(
                "test on a callback-mode context".into(),
            ));
        }
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(pos) = inner.completed.iter().position(|c| c.op_id == op_id) {
                return Ok(inner.completed.remove(pos).expect("position found above"));
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

    /// Wait up to `timeout` for completions of any of the given ops
    ///
    /// Returns as soon as at least one of them has completed; the rest stay
    /// buffered. An empty result only happens on timeout.
    pub fn test_some(&self, op_ids: &[OpId], timeout: Duration) -> Result<Vec<Completion>> {
        if self.is_callback() {
            return Err(Error::InvalidArg(
                "test on a callback-mode context".into(),
            ));
        }
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            let mut matched = Vec::new();
            let mut i = 0;
            while i < inner.completed.len() {
                if op_ids.contains(&inner.completed[i].op_id) {
                    matched.push(inner.completed.remove(i).expect("index in bounds"));
                } else {
                    i += 1;
                }
            }
            if !matched.is_empty() {
                return Ok(matched);
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

    /// Wait up to `timeout` for any completions and drain them all
    pub fn test_all(&self, timeout: Duration) -> Result<Vec<Completion>> {
        if self.is_callback() {
            return Err(Error::InvalidArg(
                "test on a callback-mode context".into(),
            ));
        }
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if !inner.completed.is_empty() {
                return Ok(inner.completed.drain(..).collect());
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

    /// Block until every posted op has completed or `timeout` elapses
    ///
    /// Buffered completions are left in place; this only waits for the
    /// outstanding count to reach zero.
    pub fn wait_all(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while inner.outstanding > 0 {
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
        Ok(())
    }

    /// Close the context
    ///
    /// In pull mode, fails `Busy` while ops are outstanding; buffered,
    /// untested completions are discarded.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        if self.callback.is_none() && inner.outstanding > 0 {
            return Err(Error::Busy(format!(
                "{} ops outstanding",
                inner.outstanding
            )));
        }
        inner.closed = true;
        inner.completed.clear();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RawId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn completion(id: u64) -> Completion {
        Completion {
            op_id: RawId(id),
            user_data: id,
            result: Ok(()),
        }
    }

    #[test]
    fn test_pull_mode_buffers() {
        let ctx = CompletionContext::open_pull();
        ctx.op_started();
        ctx.op_started();
        assert_eq!(ctx.outstanding(), 2);

        ctx.complete(completion(1));
        assert_eq!(ctx.outstanding(), 1);
        assert_eq!(ctx.pending(), 1);

        let c = ctx.test_op(RawId(1), Duration::from_millis(10)).unwrap();
        assert_eq!(c.user_data, 1);
        assert_eq!(ctx.pending(), 0);
    }

    #[test]
    fn test_test_op_timeout() {
        let ctx = CompletionContext::open_pull();
        let err = ctx
            .test_op(RawId(5), Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err, Error::Timeout);
    }

    #[test]
    fn test_test_some_returns_partial() {
        let ctx = CompletionContext::open_pull();
        for i in 1..=3 {
            ctx.op_started();
            ctx.complete(completion(i));
        }
        let ids = [RawId(1), RawId(3), RawId(9)];
        let got = ctx.test_some(&ids, Duration::from_millis(10)).unwrap();
        let mut data: Vec<u64> = got.iter().map(|c| c.user_data).collect();
        data.sort_unstable();
        assert_eq!(data, vec![1, 3]);
        // Unmatched completion 2 stays buffered.
        assert_eq!(ctx.pending(), 1);
    }

    #[test]
    fn test_test_all_drains() {
        let ctx = CompletionContext::open_pull();
        for i in 1..=4 {
            ctx.op_started();
            ctx.complete(completion(i));
        }
        let got = ctx.test_all(Duration::from_millis(10)).unwrap();
        assert_eq!(got.len(), 4);
        assert_eq!(ctx.pending(), 0);
    }

    #[test]
    fn test_callback_mode() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let ctx = CompletionContext::open_callback(Box::new(move |batch| {
            for c in batch {
                assert_eq!(c.result, Ok(()));
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }));
        assert!(ctx.is_callback());

        ctx.op_started();
        ctx.op_started();
        ctx.complete_list(vec![completion(1), completion(2)]);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.outstanding(), 0);
        // Nothing buffered in callback mode.
        assert_eq!(ctx.pending(), 0);
        assert!(ctx.test_op(RawId(1), Duration::ZERO).is_err());
    }

    #[test]
    fn test_wait_all() {
        let ctx = CompletionContext::open_pull();
        ctx.op_started();
        let completer = Arc::clone(&ctx);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            completer.complete(completion(1));
        });
        ctx.wait_all(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(ctx.outstanding(), 0);
    }

    #[test]
    fn test_close_busy_with_outstanding() {
        let ctx = CompletionContext::open_pull();
        ctx.op_started();
        assert!(matches!(ctx.close(), Err(Error::Busy(_))));
        ctx.complete(completion(1));
        assert!(ctx.close().is_ok());
        assert!(ctx.is_closed());
    }

    #[test]
    fn test_completion_error_preserved() {
        let ctx = CompletionContext::open_pull();
        ctx.op_started();
        ctx.complete(Completion {
            op_id: RawId(8),
            user_data: 0,
            result: Err(Error::Io("short write".into())),
        });
        let c = ctx.test_op(RawId(8), Duration::from_millis(10)).unwrap();
        assert_eq!(c.result, Err(Error::Io("short write".into())));
    }
}

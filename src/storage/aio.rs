//! Async list-I/O backends
//!
//! Bytestream list I/O is submitted through a pluggable backend: a batch of
//! read/write/sync descriptors plus a notify callback fired once the whole
//! batch has completed. Backends expose submit, poll, cancel, and suspend;
//! cancellation is best-effort and only skips descriptors not yet started.
//!
//! Two backends are provided:
//!
//! - [`ThreadedAio`]: dedicated-thread emulation; each submitted batch is
//!   serviced by one spawned thread issuing `pread`/`pwrite`/`fsync`.
//!   Always available and the default.
//! - `UringAio` (feature `io_uring`, Linux only): submits the batch to an
//!   io_uring instance and reaps completions.
//!
//! # Safety
//!
//! Descriptors carry raw buffer pointers. The submitter must keep the
//! buffers alive and unaliased until the notify callback has run; the
//! storage facade guarantees this by owning the buffers in the op that
//! awaits the notify.

use crate::{Error, Result};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// Kind of a single I/O descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioKind {
    Read,
    Write,
    Sync,
}

/// One I/O descriptor within a batch
#[derive(Debug)]
pub struct AioOp {
    pub kind: AioKind,
    pub fd: RawFd,
    pub offset: u64,
    /// Buffer for read/write; ignored for sync
    pub buffer: *mut u8,
    /// Transfer length in bytes; ignored for sync
    pub len: usize,
}

// Safety: the raw buffer pointer is owned by the submitter, which keeps it
// valid and unaliased until the batch's notify callback runs.
unsafe impl Send for AioOp {}

/// Per-descriptor completion
#[derive(Debug)]
pub struct AioOpResult {
    /// Index of the descriptor within the submitted batch
    pub index: usize,
    /// Bytes transferred, or the translated OS error
    pub result: Result<usize>,
}

/// Callback fired once per batch, after every descriptor finished
pub type AioNotify = Box<dyn FnOnce(&[AioOpResult]) + Send>;

/// Identifies a submitted batch for poll/cancel/suspend
pub type AioBatchId = u64;

/// Pluggable list-I/O backend
pub trait AioBackend: Send + Sync {
    /// Submit a batch; the notify callback fires when all descriptors have
    /// completed (or were skipped by cancellation)
    fn submit(&self, ops: Vec<AioOp>, notify: AioNotify) -> Result<AioBatchId>;

    /// True once the batch has completed
    fn poll(&self, batch: AioBatchId) -> Result<bool>;

    /// Best-effort cancel: descriptors not yet started complete `Canceled`
    fn cancel(&self, batch: AioBatchId) -> Result<()>;

    /// Block until the batch completes or the timeout elapses
    fn suspend(&self, batch: AioBatchId, timeout: Duration) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Run one descriptor synchronously
///
/// # Safety
///
/// `op.buffer` must be valid for `op.len` bytes and unaliased for the
/// duration of the call.
unsafe fn run_op(op: &AioOp) -> Result<usize> {
    let rc = match op.kind {
        AioKind::Read => libc::pread(
            op.fd,
            op.buffer as *mut libc::c_void,
            op.len,
            op.offset as libc::off_t,
        ),
        AioKind::Write => libc::pwrite(
            op.fd,
            op.buffer as *const libc::c_void,
            op.len,
            op.offset as libc::off_t,
        ),
        AioKind::Sync => libc::fsync(op.fd) as isize,
    };
    if rc < 0 {
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO);
        return Err(Error::from_errno(errno));
    }
    Ok(rc as usize)
}

struct BatchState {
    done: Mutex<bool>,
    cond: Condvar,
    canceled: AtomicBool,
}

impl BatchState {
    fn new() -> Arc<Self> {
        Arc::new(BatchState {
            done: Mutex::new(false),
            cond: Condvar::new(),
            canceled: AtomicBool::new(false),
        })
    }

    fn mark_done(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        self.cond.notify_all();
    }

    fn is_done(&self) -> bool {
        *self.done.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait_done(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(done, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            done = guard;
        }
        true
    }
}

/// Dedicated-thread list-I/O emulation
///
/// Each submitted batch gets one thread that runs its descriptors in order
/// and fires the notify callback. Simple, portable, and adequate for
/// metadata-heavy servers; swap in the io_uring backend for data-heavy
/// ones.
pub struct ThreadedAio {
    batches: Arc<Mutex<HashMap<AioBatchId, Arc<BatchState>>>>,
    next_id: AtomicU64,
}

impl ThreadedAio {
    pub fn new() -> Self {
        ThreadedAio {
            batches: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    fn state(&self, batch: AioBatchId) -> Result<Arc<BatchState>> {
        let batches = self.batches.lock().unwrap_or_else(|e| e.into_inner());
        batches.get(&batch).cloned().ok_or(Error::NotFound)
    }
}

impl Default for ThreadedAio {
    fn default() -> Self {
        Self::new()
    }
}

impl AioBackend for ThreadedAio {
    fn submit(&self, ops: Vec<AioOp>, notify: AioNotify) -> Result<AioBatchId> {
        let batch_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = BatchState::new();
        {
            let mut batches = self.batches.lock().unwrap_or_else(|e| e.into_inner());
            batches.insert(batch_id, Arc::clone(&state));
        }

        let batches = Arc::clone(&self.batches);
        let thread_state = Arc::clone(&state);
        thread::Builder::new()
            .name(format!("stratum-aio-{}", batch_id))
            .spawn(move || {
                let mut results = Vec::with_capacity(ops.len());
                for (index, op) in ops.iter().enumerate() {
                    if thread_state.canceled.load(Ordering::Acquire) {
                        results.push(AioOpResult {
                            index,
                            result: Err(Error::Canceled),
                        });
                        continue;
                    }
                    // Safety: the submitter keeps buffers valid until notify
                    // runs (see module docs).
                    let result = unsafe { run_op(op) };
                    results.push(AioOpResult { index, result });
                }
                thread_state.mark_done();
                notify(&results);
                let mut batches = batches.lock().unwrap_or_else(|e| e.into_inner());
                batches.remove(&batch_id);
            })
            .map_err(|e| Error::Io(format!("aio thread spawn: {}", e)))?;

        Ok(batch_id)
    }

    fn poll(&self, batch: AioBatchId) -> Result<bool> {
        match self.state(batch) {
            Ok(state) => Ok(state.is_done()),
            // A batch that already ran and was reaped counts as done.
            Err(Error::NotFound) => Ok(true),
            Err(e) => Err(e),
        }
    }

    fn cancel(&self, batch: AioBatchId) -> Result<()> {
        let state = self.state(batch)?;
        state.canceled.store(true, Ordering::Release);
        Ok(())
    }

    fn suspend(&self, batch: AioBatchId, timeout: Duration) -> Result<()> {
        let state = match self.state(batch) {
            Ok(state) => state,
            Err(Error::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        if state.wait_done(timeout) {
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }

    fn name(&self) -> &'static str {
        "threaded"
    }
}

/// io_uring list-I/O backend
#[cfg(feature = "io_uring")]
pub mod uring {
    use super::*;
    use io_uring::{opcode, types, IoUring};

    /// Submits each batch to a dedicated io_uring instance and reaps
    /// completions on one spawned thread, so the notify discipline matches
    /// [`ThreadedAio`] exactly.
    pub struct UringAio {
        batches: Arc<Mutex<HashMap<AioBatchId, Arc<BatchState>>>>,
        next_id: AtomicU64,
        queue_depth: u32,
    }

    impl UringAio {
        pub fn new(queue_depth: u32) -> Self {
            UringAio {
                batches: Arc::new(Mutex::new(HashMap::new())),
                next_id: AtomicU64::new(1),
                queue_depth: queue_depth.max(1),
            }
        }

        fn state(&self, batch: AioBatchId) -> Result<Arc<BatchState>> {
            let batches = self.batches.lock().unwrap_or_else(|e| e.into_inner());
            batches.get(&batch).cloned().ok_or(Error::NotFound)
        }

        fn run_batch(ring: &mut IoUring, ops: &[AioOp]) -> Result<Vec<AioOpResult>> {
            for (index, op) in ops.iter().enumerate() {
                let entry = match op.kind {
                    AioKind::Read => opcode::Read::new(
                        types::Fd(op.fd),
                        op.buffer,
                        op.len as u32,
                    )
                    .offset(op.offset)
                    .build()
                    .user_data(index as u64),
                    AioKind::Write => opcode::Write::new(
                        types::Fd(op.fd),
                        op.buffer as *const u8,
                        op.len as u32,
                    )
                    .offset(op.offset)
                    .build()
                    .user_data(index as u64),
                    AioKind::Sync => opcode::Fsync::new(types::Fd(op.fd))
                        .build()
                        .user_data(index as u64),
                };
                // Safety: entries reference buffers the submitter keeps
                // alive until notify runs.
                unsafe {
                    ring.submission()
                        .push(&entry)
                        .map_err(|_| Error::Again)?;
                }
            }

            let mut results = Vec::with_capacity(ops.len());
            while results.len() < ops.len() {
                ring.submit_and_wait(1)
                    .map_err(|e| Error::Io(format!("io_uring submit: {}", e)))?;
                for cqe in ring.completion() {
                    let index = cqe.user_data() as usize;
                    let code = cqe.result();
                    let result = if code >= 0 {
                        Ok(code as usize)
                    } else {
                        Err(Error::from_errno(-code))
                    };
                    results.push(AioOpResult { index, result });
                }
            }
            Ok(results)
        }
    }

    impl AioBackend for UringAio {
        fn submit(&self, ops: Vec<AioOp>, notify: AioNotify) -> Result<AioBatchId> {
            let batch_id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let state = BatchState::new();
            {
                let mut batches = self.batches.lock().unwrap_or_else(|e| e.into_inner());
                batches.insert(batch_id, Arc::clone(&state));
            }

            let depth = self.queue_depth.max(ops.len() as u32);
            let batches = Arc::clone(&self.batches);
            let thread_state = Arc::clone(&state);
            thread::Builder::new()
                .name(format!("stratum-uring-{}", batch_id))
                .spawn(move || {
                    let results = match IoUring::new(depth) {
                        Ok(mut ring) => {
                            if thread_state.canceled.load(Ordering::Acquire) {
                                (0..ops.len())
                                    .map(|index| AioOpResult {
                                        index,
                                        result: Err(Error::Canceled),
                                    })
                                    .collect()
                            } else {
                                match Self::run_batch(&mut ring, &ops) {
                                    Ok(results) => results,
                                    Err(e) => (0..ops.len())
                                        .map(|index| AioOpResult {
                                            index,
                                            result: Err(e.clone()),
                                        })
                                        .collect(),
                                }
                            }
                        }
                        Err(e) => {
                            let err = Error::Io(format!("io_uring setup: {}", e));
                            (0..ops.len())
                                .map(|index| AioOpResult {
                                    index,
                                    result: Err(err.clone()),
                                })
                                .collect()
                        }
                    };
                    thread_state.mark_done();
                    notify(&results);
                    let mut batches = batches.lock().unwrap_or_else(|e| e.into_inner());
                    batches.remove(&batch_id);
                })
                .map_err(|e| Error::Io(format!("aio thread spawn: {}", e)))?;

            Ok(batch_id)
        }

        fn poll(&self, batch: AioBatchId) -> Result<bool> {
            match self.state(batch) {
                Ok(state) => Ok(state.is_done()),
                Err(Error::NotFound) => Ok(true),
                Err(e) => Err(e),
            }
        }

        fn cancel(&self, batch: AioBatchId) -> Result<()> {
            let state = self.state(batch)?;
            state.canceled.store(true, Ordering::Release);
            Ok(())
        }

        fn suspend(&self, batch: AioBatchId, timeout: Duration) -> Result<()> {
            let state = match self.state(batch) {
                Ok(state) => state,
                Err(Error::NotFound) => return Ok(()),
                Err(e) => return Err(e),
            };
            if state.wait_done(timeout) {
                Ok(())
            } else {
                Err(Error::Timeout)
            }
        }

        fn name(&self) -> &'static str {
            "io_uring"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn open_file(dir: &TempDir) -> std::fs::File {
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dir.path().join("data"))
            .unwrap()
    }

    #[test]
    fn test_write_then_read_batch() {
        let dir = TempDir::new().unwrap();
        let file = open_file(&dir);
        let fd = file.as_raw_fd();
        let aio = ThreadedAio::new();

        let mut payload = b"hello aio".to_vec();
        let (tx, rx) = mpsc::channel();
        let batch = aio
            .submit(
                vec![AioOp {
                    kind: AioKind::Write,
                    fd,
                    offset: 0,
                    buffer: payload.as_mut_ptr(),
                    len: payload.len(),
                }],
                Box::new(move |results| {
                    tx.send(results[0].result.clone().unwrap()).unwrap();
                }),
            )
            .unwrap();

        aio.suspend(batch, Duration::from_secs(5)).unwrap();
        assert_eq!(rx.recv().unwrap(), payload.len());
        assert!(aio.poll(batch).unwrap());
        // Buffers stay alive past notify per the submit contract.
        drop(payload);

        let mut readback = vec![0u8; 9];
        let (tx, rx) = mpsc::channel();
        let batch = aio
            .submit(
                vec![AioOp {
                    kind: AioKind::Read,
                    fd,
                    offset: 0,
                    buffer: readback.as_mut_ptr(),
                    len: readback.len(),
                }],
                Box::new(move |results| {
                    tx.send(results[0].result.clone().unwrap()).unwrap();
                }),
            )
            .unwrap();
        aio.suspend(batch, Duration::from_secs(5)).unwrap();
        assert_eq!(rx.recv().unwrap(), 9);
        assert_eq!(&readback, b"hello aio");
    }

    #[test]
    fn test_batch_order_preserved() {
        let dir = TempDir::new().unwrap();
        let file = open_file(&dir);
        let fd = file.as_raw_fd();
        let aio = ThreadedAio::new();

        let mut a = vec![b'a'; 4];
        let mut b = vec![b'b'; 4];
        let (tx, rx) = mpsc::channel();
        let batch = aio
            .submit(
                vec![
                    AioOp {
                        kind: AioKind::Write,
                        fd,
                        offset: 0,
                        buffer: a.as_mut_ptr(),
                        len: a.len(),
                    },
                    AioOp {
                        kind: AioKind::Write,
                        fd,
                        offset: 4,
                        buffer: b.as_mut_ptr(),
                        len: b.len(),
                    },
                    AioOp {
                        kind: AioKind::Sync,
                        fd,
                        offset: 0,
                        buffer: std::ptr::null_mut(),
                        len: 0,
                    },
                ],
                Box::new(move |results| {
                    let indices: Vec<usize> = results.iter().map(|r| r.index).collect();
                    let all_ok = results.iter().all(|r| r.result.is_ok());
                    tx.send((indices, all_ok)).unwrap();
                }),
            )
            .unwrap();
        aio.suspend(batch, Duration::from_secs(5)).unwrap();
        let (indices, all_ok) = rx.recv().unwrap();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(all_ok);

        let data = std::fs::read(dir.path().join("data")).unwrap();
        assert_eq!(&data, b"aaaabbbb");
    }

    #[test]
    fn test_read_on_bad_fd_reports_error() {
        let aio = ThreadedAio::new();
        let mut buf = vec![0u8; 8];
        let (tx, rx) = mpsc::channel();
        let batch = aio
            .submit(
                vec![AioOp {
                    kind: AioKind::Read,
                    fd: -1,
                    offset: 0,
                    buffer: buf.as_mut_ptr(),
                    len: buf.len(),
                }],
                Box::new(move |results| {
                    tx.send(results[0].result.clone()).unwrap();
                }),
            )
            .unwrap();
        aio.suspend(batch, Duration::from_secs(5)).unwrap();
        assert!(rx.recv().unwrap().is_err());
    }

    #[test]
    fn test_poll_unknown_batch_done() {
        let aio = ThreadedAio::new();
        assert!(aio.poll(999).unwrap());
    }
}

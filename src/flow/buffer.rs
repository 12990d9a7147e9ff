//! Flow staging buffers
//!
//! Each flow owns a pair of staging buffers and pipelines them: one fills
//! from the source endpoint while the other drains into the destination.
//! The memory is kept at a configurable alignment so storage endpoints can
//! move to direct I/O without reallocating, and allocation failures surface
//! as `NoMem` through the normal error path; a flow post is a request-time
//! operation where the caller can shed load.
//!
//! Buffer state machine:
//!
//! ```text
//! ReadyToFill -> Filling -> ReadyToSwap -> ReadyToDrain -> Draining -> ReadyToSwap
//! ```
//!
//! At any time at most one buffer of a pair is `Filling` and at most one is
//! `Draining`; the pair swaps roles only when both sit at `ReadyToSwap`.
//! `Done` is terminal and only entered when the flow has nothing further
//! for that buffer.

use crate::storage::bstream::StreamSegment;
use crate::{Error, Result};
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

/// Owned, aligned staging memory for one side of a transfer
///
/// The buffer moves into a transfer op for the duration of one fill or
/// drain and comes back through [`FlowBuffer::put_back`]; the accessors
/// window exactly the bytes a transfer touches, not the whole allocation.
#[derive(Debug)]
pub struct StagingBuffer {
    mem: NonNull<u8>,
    layout: Layout,
}

impl StagingBuffer {
    /// Allocate `size` bytes at `alignment`
    pub fn alloc(size: usize, alignment: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArg("zero-size staging buffer".into()));
        }
        if !alignment.is_power_of_two() {
            return Err(Error::InvalidArg(format!(
                "staging alignment {} is not a power of two",
                alignment
            )));
        }
        let layout = Layout::from_size_align(size, alignment)
            .map_err(|e| Error::InvalidArg(format!("staging layout: {}", e)))?;
        // Safety: the layout has non-zero size, checked above.
        let mem = NonNull::new(unsafe { alloc(layout) }).ok_or(Error::NoMem)?;
        Ok(StagingBuffer { mem, layout })
    }

    /// Capacity in bytes
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// The first `len` bytes, as left behind by a completed fill
    pub fn filled(&self, len: usize) -> &[u8] {
        debug_assert!(len <= self.len());
        // Safety: mem covers `layout.size()` bytes and outlives the borrow.
        unsafe { std::slice::from_raw_parts(self.mem.as_ptr(), len) }
    }

    /// Writable window of the first `len` bytes for an incoming fill
    pub fn space(&mut self, len: usize) -> &mut [u8] {
        debug_assert!(len <= self.len());
        // Safety: mem covers `layout.size()` bytes; &mut self guarantees
        // exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.mem.as_ptr(), len) }
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        // Safety: mem was allocated with exactly this layout.
        unsafe { dealloc(self.mem.as_ptr(), self.layout) }
    }
}

// Safety: the buffer exclusively owns its allocation; transfer ops move it
// between threads whole, never sharing the pointer.
unsafe impl Send for StagingBuffer {}

/// Per-buffer pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    ReadyToFill,
    Filling,
    ReadyToSwap,
    ReadyToDrain,
    Draining,
    Done,
}

/// One staging buffer with its pipeline state
pub struct FlowBuffer {
    /// Taken by an in-flight transfer op and reinstalled on completion
    pub data: Option<StagingBuffer>,
    /// Bytes of valid data after a fill
    pub valid: usize,
    pub state: BufferState,
    /// Storage-side segments this buffer's contents map to
    pub segments: Vec<StreamSegment>,
}

impl FlowBuffer {
    pub fn new(size: usize, alignment: usize, state: BufferState) -> Result<Self> {
        Ok(FlowBuffer {
            data: Some(StagingBuffer::alloc(size, alignment)?),
            valid: 0,
            state,
            segments: Vec::new(),
        })
    }

    /// Take the buffer for an in-flight op
    pub fn take(&mut self) -> StagingBuffer {
        self.data.take().expect("buffer already taken")
    }

    /// Reinstall the buffer after an op completed
    pub fn put_back(&mut self, buffer: StagingBuffer) {
        debug_assert!(self.data.is_none(), "buffer put back twice");
        self.data = Some(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_len() {
        let buffer = StagingBuffer::alloc(4096, 512).unwrap();
        assert_eq!(buffer.len(), 4096);
        assert!(!buffer.is_empty());
    }

    #[test]
    fn test_alignment_honored() {
        let buffer = StagingBuffer::alloc(8192, 4096).unwrap();
        assert_eq!(buffer.filled(0).as_ptr() as usize % 4096, 0);
    }

    #[test]
    fn test_bad_alignment_rejected() {
        assert!(matches!(
            StagingBuffer::alloc(4096, 513).unwrap_err(),
            Error::InvalidArg(_)
        ));
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            StagingBuffer::alloc(0, 512).unwrap_err(),
            Error::InvalidArg(_)
        ));
    }

    #[test]
    fn test_fill_then_read_window() {
        let mut buffer = StagingBuffer::alloc(1024, 512).unwrap();
        buffer.space(5).copy_from_slice(b"hello");
        assert_eq!(buffer.filled(5), b"hello");
    }

    #[test]
    fn test_flow_buffer_take_put_back() {
        let mut fb = FlowBuffer::new(4096, 512, BufferState::ReadyToFill).unwrap();
        assert_eq!(fb.state, BufferState::ReadyToFill);
        let buf = fb.take();
        assert!(fb.data.is_none());
        fb.put_back(buf);
        assert!(fb.data.is_some());
    }

    #[test]
    #[should_panic(expected = "buffer already taken")]
    fn test_flow_buffer_double_take() {
        let mut fb = FlowBuffer::new(4096, 512, BufferState::ReadyToFill).unwrap();
        let _a = fb.take();
        let _b = fb.take();
    }
}

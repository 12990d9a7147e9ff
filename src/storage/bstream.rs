//! Bytestreams
//!
//! The byte-addressable payload of a datafile dataspace, stored as one
//! regular file per handle under the collection's bucket directories. Files
//! materialize lazily on first I/O; the *logical* size lives in the
//! dataspace attribute record and tracks the maximum byte ever committed,
//! independent of the on-disk length (holes read back as zeros).
//!
//! List I/O takes two parallel segment vectors, memory and stream, that
//! need not line up; the only requirement is equal total byte counts. Each
//! stream segment is submitted as one `preadv`/`pwritev`. Short transfers
//! are terminal: the achieved byte count is returned and the logical size
//! reflects only what was committed.

use crate::storage::collection::Collection;
use crate::storage::dataspace::DsType;
use crate::storage::Handle;
use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

/// One (offset, size) extent of a bytestream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSegment {
    pub offset: u64,
    pub size: u64,
}

impl StreamSegment {
    pub fn new(offset: u64, size: u64) -> Self {
        StreamSegment { offset, size }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Logical vs materialized state of a bytestream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BstreamInfo {
    /// Size recorded in the attribute record
    pub logical_size: u64,
    /// Length of the backing file; zero when not yet materialized
    pub on_disk_size: u64,
}

/// Walks memory segments as a flat byte sequence
struct MemCursor {
    segments: Vec<(*mut u8, usize)>,
    seg: usize,
    off: usize,
}

impl MemCursor {
    fn from_slices(mem: &[&[u8]]) -> Self {
        MemCursor {
            segments: mem
                .iter()
                .map(|s| (s.as_ptr() as *mut u8, s.len()))
                .collect(),
            seg: 0,
            off: 0,
        }
    }

    fn from_mut_slices(mem: &mut [&mut [u8]]) -> Self {
        MemCursor {
            segments: mem.iter_mut().map(|s| (s.as_mut_ptr(), s.len())).collect(),
            seg: 0,
            off: 0,
        }
    }

    fn total(&self) -> u64 {
        self.segments.iter().map(|(_, len)| *len as u64).sum()
    }

    /// Take iovecs covering the next `need` bytes
    fn gather(&mut self, mut need: usize) -> Vec<libc::iovec> {
        let mut iovs = Vec::new();
        while need > 0 && self.seg < self.segments.len() {
            let (base, len) = self.segments[self.seg];
            let avail = len - self.off;
            let take = avail.min(need);
            // Safety: base/off stay within the segment the caller handed us.
            let ptr = unsafe { base.add(self.off) };
            iovs.push(libc::iovec {
                iov_base: ptr as *mut libc::c_void,
                iov_len: take,
            });
            need -= take;
            self.off += take;
            if self.off == len {
                self.seg += 1;
                self.off = 0;
            }
        }
        iovs
    }
}

/// Zero the tail of a gathered iovec run, starting `skip` bytes in
///
/// # Safety
///
/// The iovecs must reference writable memory owned by the caller.
unsafe fn zero_fill(iovs: &[libc::iovec], skip: usize, mut count: usize) {
    let mut remaining_skip = skip;
    for iov in iovs {
        if count == 0 {
            break;
        }
        let len = iov.iov_len;
        if remaining_skip >= len {
            remaining_skip -= len;
            continue;
        }
        let start = remaining_skip;
        remaining_skip = 0;
        let n = (len - start).min(count);
        std::ptr::write_bytes((iov.iov_base as *mut u8).add(start), 0, n);
        count -= n;
    }
}

impl Collection {
    pub(crate) fn bstream_file(&self, handle: Handle, create: bool) -> Result<(File, PathBuf)> {
        let path = self.layout().bstream_path(self.id(), handle);
        if create {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)?;
        Ok((file, path))
    }

    pub(crate) fn bstream_logical_size(&self, handle: Handle) -> Result<u64> {
        let attrs = self.ds_getattr_sync(handle)?;
        if attrs.ds_type != DsType::Datafile {
            return Err(Error::InvalidArg(format!(
                "handle {:#x} is a {}, not a datafile",
                handle, attrs.ds_type
            )));
        }
        Ok(attrs.bstream_size())
    }

    /// Scatter-gather write
    ///
    /// Returns the bytes actually written; on a short transfer the logical
    /// size grows only to the highest byte committed.
    pub fn bs_write_list_sync(
        &self,
        handle: Handle,
        mem: &[&[u8]],
        stream: &[StreamSegment],
    ) -> Result<u64> {
        self.ensure_writable()?;
        // Validates the handle names a datafile before touching the file.
        self.bstream_logical_size(handle)?;

        let mut cursor = MemCursor::from_slices(mem);
        let stream_total: u64 = stream.iter().map(|s| s.size).sum();
        if cursor.total() != stream_total {
            return Err(Error::InvalidArg(format!(
                "memory bytes {} != stream bytes {}",
                cursor.total(),
                stream_total
            )));
        }
        if stream_total == 0 {
            return Ok(0);
        }

        let (file, _path) = self.bstream_file(handle, true)?;
        let fd = file.as_raw_fd();

        let mut achieved = 0u64;
        let mut committed_end = 0u64;
        for seg in stream {
            let iovs = cursor.gather(seg.size as usize);
            let n = unsafe {
                libc::pwritev(
                    fd,
                    iovs.as_ptr(),
                    iovs.len() as libc::c_int,
                    seg.offset as libc::off_t,
                )
            };
            if n < 0 {
                let errno = std::io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(libc::EIO);
                return Err(Error::from_errno(errno));
            }
            let written = n as u64;
            achieved += written;
            if written > 0 {
                committed_end = committed_end.max(seg.offset + written);
            }
            if written < seg.size {
                // Short transfer is terminal.
                break;
            }
        }

        // The commit merges under the collection size lock, so a racing
        // writer with a higher end cannot be clobbered by this one.
        self.ds_commit_bstream_size(handle, committed_end)?;
        tracing::debug!(collection = self.id(), handle, achieved, "bstream write");
        Ok(achieved)
    }

    /// Scatter-gather read
    ///
    /// Reads within the logical size but beyond the materialized file are
    /// holes and fill with zeros. Returns the bytes delivered; reading past
    /// the logical size is a short transfer.
    pub fn bs_read_list_sync(
        &self,
        handle: Handle,
        mem: &mut [&mut [u8]],
        stream: &[StreamSegment],
    ) -> Result<u64> {
        let logical = self.bstream_logical_size(handle)?;

        let mut cursor = MemCursor::from_mut_slices(mem);
        let stream_total: u64 = stream.iter().map(|s| s.size).sum();
        if cursor.total() != stream_total {
            return Err(Error::InvalidArg(format!(
                "memory bytes {} != stream bytes {}",
                cursor.total(),
                stream_total
            )));
        }
        if stream_total == 0 {
            return Ok(0);
        }

        // A bytestream that was never written is all holes.
        let file = match self.bstream_file(handle, false) {
            Ok((file, _)) => Some(file),
            Err(Error::NotFound) => None,
            Err(e) => return Err(e),
        };

        let mut achieved = 0u64;
        for seg in stream {
            let iovs = cursor.gather(seg.size as usize);
            let n = match &file {
                Some(file) => {
                    let n = unsafe {
                        libc::preadv(
                            file.as_raw_fd(),
                            iovs.as_ptr(),
                            iovs.len() as libc::c_int,
                            seg.offset as libc::off_t,
                        )
                    };
                    if n < 0 {
                        let errno = std::io::Error::last_os_error()
                            .raw_os_error()
                            .unwrap_or(libc::EIO);
                        return Err(Error::from_errno(errno));
                    }
                    n as u64
                }
                None => 0,
            };

            achieved += n;
            if n < seg.size {
                // The file ended early; bytes inside the logical size are
                // holes and read as zeros.
                let hole = logical
                    .saturating_sub(seg.offset + n)
                    .min(seg.size - n);
                if hole > 0 {
                    // Safety: the iovecs reference the caller's buffers.
                    unsafe { zero_fill(&iovs, n as usize, hole as usize) };
                    achieved += hole;
                }
                if n + hole < seg.size {
                    break;
                }
            }
        }
        Ok(achieved)
    }

    /// Scalar write at an offset
    pub fn bs_write_at_sync(&self, handle: Handle, offset: u64, data: &[u8]) -> Result<u64> {
        self.bs_write_list_sync(handle, &[data], &[StreamSegment::new(offset, data.len() as u64)])
    }

    /// Scalar read at an offset
    pub fn bs_read_at_sync(
        &self,
        handle: Handle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<u64> {
        let len = buf.len() as u64;
        self.bs_read_list_sync(handle, &mut [buf], &[StreamSegment::new(offset, len)])
    }

    /// Grow or shrink the bytestream to an exact size
    pub fn bs_resize_sync(&self, handle: Handle, size: u64) -> Result<()> {
        self.ensure_writable()?;
        // Verify the handle names a datafile before touching anything.
        self.bstream_logical_size(handle)?;
        let (file, _path) = self.bstream_file(handle, true)?;
        file.set_len(size)?;
        self.ds_set_bstream_size(handle, size)
    }

    /// Report logical vs materialized sizes
    pub fn bs_validate_sync(&self, handle: Handle) -> Result<BstreamInfo> {
        let logical_size = self.bstream_logical_size(handle)?;
        let on_disk_size = match std::fs::metadata(self.layout().bstream_path(self.id(), handle))
        {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        Ok(BstreamInfo {
            logical_size,
            on_disk_size,
        })
    }

    /// Force data and attributes to durable storage
    pub fn bs_flush_sync(&self, handle: Handle) -> Result<()> {
        self.bstream_logical_size(handle)?;
        if let Ok((file, _)) = self.bstream_file(handle, false) {
            file.sync_all()?;
        }
        self.ds_attr_db().sync()
    }
}

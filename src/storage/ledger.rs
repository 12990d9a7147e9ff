//! Handle ledger
//!
//! Each collection owns a ledger: the server-assigned extent ranges it may
//! allocate handles from, plus a freelist with a timed purgatory. A handle
//! freed at time T cannot be reissued before T plus the purgatory interval,
//! which keeps clients holding a stale handle from silently landing on an
//! unrelated new object.
//!
//! Invariants: no two live dataspaces share a handle within a collection,
//! and `alloc` never returns a handle still in purgatory.

use crate::{Error, Result};
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Inclusive range of handles a collection may allocate from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub first: u64,
    pub last: u64,
}

impl Extent {
    pub fn new(first: u64, last: u64) -> Self {
        Extent { first, last }
    }

    pub fn contains(&self, handle: u64) -> bool {
        handle >= self.first && handle <= self.last
    }

    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }
}

/// Parse a handle range string like `"4-2147483650,2147483651-4294967297"`
pub fn parse_extent_list(spec: &str) -> Result<Vec<Extent>> {
    let mut extents = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (first, last) = match part.split_once('-') {
            Some((first, last)) => (
                first
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| Error::InvalidArg(format!("bad extent: {}", part)))?,
                last.trim()
                    .parse::<u64>()
                    .map_err(|_| Error::InvalidArg(format!("bad extent: {}", part)))?,
            ),
            None => {
                let single = part
                    .parse::<u64>()
                    .map_err(|_| Error::InvalidArg(format!("bad extent: {}", part)))?;
                (single, single)
            }
        };
        if first == 0 || last < first {
            return Err(Error::InvalidArg(format!("bad extent: {}", part)));
        }
        extents.push(Extent::new(first, last));
    }
    if extents.is_empty() {
        return Err(Error::InvalidArg("empty extent list".into()));
    }
    Ok(extents)
}

struct ExtentState {
    extent: Extent,
    /// Next never-issued handle in this extent
    next_fresh: u64,
}

struct LedgerInner {
    extents: Vec<ExtentState>,
    /// Handles released from purgatory, ready for reissue
    free: VecDeque<u64>,
    /// Recently freed handles ordered by release deadline
    purgatory: VecDeque<(Instant, u64)>,
    /// Handles currently live (issued or force-claimed)
    used: HashSet<u64>,
    purgatory_interval: Duration,
}

impl LedgerInner {
    /// Move purgatory entries whose interval has elapsed onto the freelist
    fn drain_purgatory(&mut self) {
        let now = Instant::now();
        while let Some((deadline, handle)) = self.purgatory.front().copied() {
            if deadline > now {
                break;
            }
            self.purgatory.pop_front();
            tracing::debug!(handle, "handle released from purgatory");
            self.free.push_back(handle);
        }
    }

    fn alloc_fresh(&mut self, within: Option<&[Extent]>) -> Option<u64> {
        for state in &mut self.extents {
            loop {
                if state.next_fresh > state.extent.last {
                    break;
                }
                let candidate = state.next_fresh;
                state.next_fresh += 1;
                if self.used.contains(&candidate) {
                    continue;
                }
                if let Some(ranges) = within {
                    if !ranges.iter().any(|r| r.contains(candidate)) {
                        continue;
                    }
                }
                return Some(candidate);
            }
        }
        None
    }
}

/// Per-collection handle allocator with purgatory
pub struct HandleLedger {
    inner: Mutex<LedgerInner>,
}

impl HandleLedger {
    pub fn new(extents: Vec<Extent>, purgatory: Duration) -> Self {
        HandleLedger {
            inner: Mutex::new(LedgerInner {
                extents: extents
                    .into_iter()
                    .map(|extent| ExtentState {
                        next_fresh: extent.first,
                        extent,
                    })
                    .collect(),
                free: VecDeque::new(),
                purgatory: VecDeque::new(),
                used: HashSet::new(),
                purgatory_interval: purgatory,
            }),
        }
    }

    /// Change the purgatory interval for subsequently freed handles
    pub fn set_purgatory(&self, purgatory: Duration) {
        self.lock().purgatory_interval = purgatory;
    }

    /// Allocate any available handle
    pub fn alloc(&self) -> Result<u64> {
        let mut inner = self.lock();
        inner.drain_purgatory();
        if let Some(handle) = inner.free.pop_front() {
            inner.used.insert(handle);
            return Ok(handle);
        }
        let handle = inner.alloc_fresh(None).ok_or(Error::NoMem)?;
        inner.used.insert(handle);
        Ok(handle)
    }

    /// Allocate a handle inside one of the requested ranges
    pub fn alloc_from_ranges(&self, ranges: &[Extent]) -> Result<u64> {
        let mut inner = self.lock();
        inner.drain_purgatory();
        if let Some(pos) = inner
            .free
            .iter()
            .position(|h| ranges.iter().any(|r| r.contains(*h)))
        {
            let handle = inner.free.remove(pos).expect("position found above");
            inner.used.insert(handle);
            return Ok(handle);
        }
        let handle = inner.alloc_fresh(Some(ranges)).ok_or(Error::NoMem)?;
        inner.used.insert(handle);
        Ok(handle)
    }

    /// Claim a specific handle (forced creation)
    ///
    /// Fails `Exists` if the handle is live and `InvalidArg` if it falls
    /// outside every ledger extent.
    pub fn set_used(&self, handle: u64) -> Result<()> {
        let mut inner = self.lock();
        inner.drain_purgatory();
        if !inner.extents.iter().any(|s| s.extent.contains(handle)) {
            return Err(Error::InvalidArg(format!(
                "handle {:#x} outside collection extents",
                handle
            )));
        }
        if inner.used.contains(&handle) {
            return Err(Error::Exists);
        }
        // Pull the handle out of the freelist or purgatory if it sits there.
        if let Some(pos) = inner.free.iter().position(|h| *h == handle) {
            inner.free.remove(pos);
        }
        if let Some(pos) = inner.purgatory.iter().position(|(_, h)| *h == handle) {
            inner.purgatory.remove(pos);
        }
        inner.used.insert(handle);
        Ok(())
    }

    /// Record a handle as live without extent validation
    ///
    /// Used when rebuilding ledger state from the dataspace table at open
    /// time; existing objects stay live even if the configured extents
    /// have since shrunk around them.
    pub(crate) fn mark_used_unchecked(&self, handle: u64) {
        self.lock().used.insert(handle);
    }

    /// True if the handle is currently issued
    pub fn is_used(&self, handle: u64) -> bool {
        self.lock().used.contains(&handle)
    }

    /// Release a handle into purgatory
    pub fn free(&self, handle: u64) -> Result<()> {
        let mut inner = self.lock();
        if !inner.used.remove(&handle) {
            return Err(Error::NotFound);
        }
        let deadline = Instant::now() + inner.purgatory_interval;
        inner.purgatory.push_back((deadline, handle));
        Ok(())
    }

    /// Live handle count
    pub fn used_count(&self) -> usize {
        self.lock().used.len()
    }

    /// Handles waiting out their purgatory interval
    pub fn purgatory_count(&self) -> usize {
        self.lock().purgatory.len()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

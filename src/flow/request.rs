//! Request planning
//!
//! A flow moves one byte range of a bytestream. The planner walks that
//! range and, for each staging buffer, emits the storage-side (offset,
//! size) segment list the buffer's contents map to. Segments split at
//! chunk boundaries when a chunk size is configured (striped layouts keep
//! submissions chunk-aligned); a plan never exceeds the caller's segment
//! budget, so one scatter-gather submission always suffices.

use crate::storage::bstream::StreamSegment;

/// Walks a byte range producing per-buffer segment lists
#[derive(Debug, Clone)]
pub struct RequestPlanner {
    next_offset: u64,
    remaining: u64,
    /// Segment split granularity; `None` plans one contiguous segment
    chunk: Option<u64>,
}

impl RequestPlanner {
    pub fn new(offset: u64, size: u64) -> Self {
        RequestPlanner {
            next_offset: offset,
            remaining: size,
            chunk: None,
        }
    }

    /// Split planned segments at multiples of `chunk` bytes
    pub fn with_chunk(mut self, chunk: u64) -> Self {
        assert!(chunk > 0, "chunk must be non-zero");
        self.chunk = Some(chunk);
        self
    }

    /// Bytes not yet planned
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }

    /// Plan the next segment list covering up to `budget` bytes
    ///
    /// Returns at most `max_segments` segments; the total planned size can
    /// fall short of `budget` when the segment budget caps it. An empty
    /// plan means the range is exhausted.
    pub fn next_segments(&mut self, budget: usize, max_segments: usize) -> Vec<StreamSegment> {
        let mut budget = (budget as u64).min(self.remaining);
        let mut segments = Vec::new();
        while budget > 0 && segments.len() < max_segments {
            let size = match self.chunk {
                Some(chunk) => {
                    // Split at the next chunk boundary.
                    let into_chunk = self.next_offset % chunk;
                    (chunk - into_chunk).min(budget)
                }
                None => budget,
            };
            segments.push(StreamSegment::new(self.next_offset, size));
            self.next_offset += size;
            self.remaining -= size;
            budget -= size;
        }
        segments
    }

    /// Give back the tail of a plan after a short transfer
    ///
    /// `achieved` is the byte count actually moved out of the previous
    /// plan; the rest is returned to the unplanned range so a retry (or a
    /// terminal accounting pass) sees it.
    pub fn rewind_unconsumed(&mut self, planned: &[StreamSegment], achieved: u64) {
        let total: u64 = planned.iter().map(|s| s.size).sum();
        let unconsumed = total.saturating_sub(achieved);
        self.next_offset -= unconsumed;
        self.remaining += unconsumed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_plan() {
        let mut planner = RequestPlanner::new(100, 1000);
        let plan = planner.next_segments(256, 64);
        assert_eq!(plan, vec![StreamSegment::new(100, 256)]);
        assert_eq!(planner.remaining(), 744);

        let plan = planner.next_segments(1024, 64);
        assert_eq!(plan, vec![StreamSegment::new(356, 744)]);
        assert!(planner.is_done());
        assert!(planner.next_segments(1024, 64).is_empty());
    }

    #[test]
    fn test_chunked_plan_splits_at_boundaries() {
        let mut planner = RequestPlanner::new(100, 300).with_chunk(128);
        let plan = planner.next_segments(300, 64);
        // First segment ends at offset 128, then full chunks.
        assert_eq!(
            plan,
            vec![
                StreamSegment::new(100, 28),
                StreamSegment::new(128, 128),
                StreamSegment::new(256, 128),
                StreamSegment::new(384, 16),
            ]
        );
        assert!(planner.is_done());
    }

    #[test]
    fn test_segment_budget_caps_plan() {
        let mut planner = RequestPlanner::new(0, 1024).with_chunk(64);
        let plan = planner.next_segments(1024, 4);
        assert_eq!(plan.len(), 4);
        let planned: u64 = plan.iter().map(|s| s.size).sum();
        assert_eq!(planned, 256);
        assert_eq!(planner.remaining(), 768);
    }

    #[test]
    fn test_rewind_unconsumed() {
        let mut planner = RequestPlanner::new(0, 100);
        let plan = planner.next_segments(60, 64);
        assert_eq!(planner.remaining(), 40);

        // Only 25 of the 60 planned bytes moved.
        planner.rewind_unconsumed(&plan, 25);
        assert_eq!(planner.remaining(), 75);
        let plan = planner.next_segments(100, 64);
        assert_eq!(plan, vec![StreamSegment::new(25, 75)]);
    }
}

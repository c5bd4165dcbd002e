//! # Write Scheduler
//!
//! Streams that have data but could not write it wait here until the
//! session gets write readiness. Service order is strict priority (lower
//! value first), FIFO within a priority. The control stream always comes
//! first whatever priority it was registered with.

use std::collections::VecDeque;

use crate::stream::StreamId;

/// Stream priority; 0 is served first.
pub type StreamPriority = u8;

pub const HIGHEST_PRIORITY: StreamPriority = 0;
pub const LOWEST_PRIORITY: StreamPriority = 7;
/// Priority given to streams created without an explicit one.
pub const DEFAULT_PRIORITY: StreamPriority = 3;

const NUM_PRIORITIES: usize = LOWEST_PRIORITY as usize + 1;

#[derive(Debug, Clone, Default)]
pub struct WriteBlockedList {
    control_stream_blocked: bool,
    /// One FIFO per priority level.
    buckets: [VecDeque<StreamId>; NUM_PRIORITIES],
}

impl WriteBlockedList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream as having data to write. A stream must not be
    /// registered twice; release builds keep only the latest registration.
    pub fn push_back(&mut self, id: StreamId, priority: StreamPriority) {
        if id == StreamId::CONTROL {
            self.control_stream_blocked = true;
            return;
        }
        debug_assert!(!self.contains(id), "stream {id} registered twice");
        self.remove(id);
        let bucket = priority.min(LOWEST_PRIORITY) as usize;
        self.buckets[bucket].push_back(id);
    }

    /// Next stream to service, control stream first.
    pub fn pop_front(&mut self) -> Option<StreamId> {
        if self.control_stream_blocked {
            self.control_stream_blocked = false;
            return Some(StreamId::CONTROL);
        }
        self.buckets.iter_mut().find_map(|bucket| bucket.pop_front())
    }

    pub fn has_control_stream_blocked(&self) -> bool {
        self.control_stream_blocked
    }

    pub fn has_data_streams_blocked(&self) -> bool {
        self.buckets.iter().any(|bucket| !bucket.is_empty())
    }

    pub fn blocked_count(&self) -> usize {
        let data: usize = self.buckets.iter().map(VecDeque::len).sum();
        data + usize::from(self.control_stream_blocked)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        if id == StreamId::CONTROL {
            return self.control_stream_blocked;
        }
        self.buckets.iter().any(|bucket| bucket.contains(&id))
    }

    /// Drop a stream's registration, e.g. when it closes.
    pub fn remove(&mut self, id: StreamId) {
        if id == StreamId::CONTROL {
            self.control_stream_blocked = false;
            return;
        }
        for bucket in &mut self.buckets {
            bucket.retain(|&queued| queued != id);
        }
    }
}

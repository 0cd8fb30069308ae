//! Per-session bounded ring of normalized events.
//!
//! One buffer per session; single-writer (the owning `ActiveSession`'s
//! normalizer task), multi-reader (poll and stream consumers). Protected by
//! a single `parking_lot::Mutex` since appends and range reads are never
//! held across an `.await` point - they only touch the in-memory ring.

use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::events::{StreamEvent, StreamEventPayload};

/// Default capacity when a session does not override it.
pub const DEFAULT_CAPACITY: usize = 1000;

struct Ring {
    events: VecDeque<StreamEvent>,
    capacity: usize,
    /// Index that will be assigned to the next appended event.
    next_index: u64,
    /// Lowest index still present in `events`.
    first_retained_index: u64,
}

/// A bounded, append-only, monotonically-indexed event log for one session.
pub struct EventBuffer {
    ring: Mutex<Ring>,
}

/// The result of a range read: events at or after the requested index, the
/// index to pass on the next call, and whether any events were dropped
/// before the requested index.
#[derive(Debug)]
pub struct RangeRead {
    pub events: Vec<StreamEvent>,
    pub next_index: u64,
    pub gap: bool,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                events: VecDeque::with_capacity(capacity.min(4096)),
                capacity: capacity.max(1),
                next_index: 0,
                first_retained_index: 0,
            }),
        }
    }

    /// Appends an event, assigning it the next index. If capacity is
    /// reached the oldest event is dropped and `first_retained_index`
    /// advances. Returns the assigned index.
    pub fn append(&self, payload: StreamEventPayload, session_id: Option<uuid::Uuid>, role: Option<String>, tool_name: Option<String>) -> u64 {
        let mut ring = self.ring.lock();
        let index = ring.next_index;
        ring.next_index += 1;
        if ring.events.len() >= ring.capacity {
            ring.events.pop_front();
            ring.first_retained_index += 1;
        }
        ring.events.push_back(StreamEvent {
            index,
            session_id,
            role,
            tool_name,
            payload,
        });
        index
    }

    /// Returns events with index >= `index`. If `index` is below the
    /// lowest retained index, `gap` is set and reading resumes from
    /// `first_retained_index` - the caller missed events that will never
    /// be replayed.
    pub fn range_since(&self, index: u64) -> RangeRead {
        let ring = self.ring.lock();
        let gap = index < ring.first_retained_index;
        let effective_start = index.max(ring.first_retained_index);
        let events = ring
            .events
            .iter()
            .filter(|e| e.index >= effective_start)
            .cloned()
            .collect();
        RangeRead {
            events,
            next_index: ring.next_index,
            gap,
        }
    }

    pub fn first_index(&self) -> u64 {
        self.ring.lock().first_retained_index
    }

    pub fn next_index(&self) -> u64 {
        self.ring.lock().next_index
    }

    pub fn len(&self) -> usize {
        self.ring.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(text: &str) -> StreamEventPayload {
        StreamEventPayload::Message { text: text.to_string() }
    }

    #[test]
    fn test_indexes_are_dense_without_overflow() {
        let buf = EventBuffer::new(10);
        for i in 0..5 {
            let idx = buf.append(msg(&i.to_string()), None, None, None);
            assert_eq!(idx, i as u64);
        }
        let read = buf.range_since(0);
        assert_eq!(read.events.len(), 5);
        assert!(!read.gap);
        for (i, e) in read.events.iter().enumerate() {
            assert_eq!(e.index, i as u64);
        }
    }

    #[test]
    fn test_overflow_drops_oldest_and_reports_gap() {
        let buf = EventBuffer::new(10);
        for i in 0..25 {
            buf.append(msg(&i.to_string()), None, None, None);
        }
        let read = buf.range_since(0);
        assert!(read.gap);
        assert_eq!(read.events.len(), 10);
        assert_eq!(buf.first_index(), 15);

        let read2 = buf.range_since(buf.first_index());
        assert!(!read2.gap);
        assert_eq!(read2.events.len(), 10);
        assert_eq!(read2.events.first().unwrap().index, 15);
        assert_eq!(read2.events.last().unwrap().index, 24);
    }

    #[test]
    fn test_range_since_future_index_returns_empty() {
        let buf = EventBuffer::new(10);
        buf.append(msg("a"), None, None, None);
        let read = buf.range_since(50);
        assert!(read.events.is_empty());
        assert!(!read.gap);
    }

    #[test]
    fn test_next_index_monotone() {
        let buf = EventBuffer::new(4);
        for _ in 0..20 {
            buf.append(msg("x"), None, None, None);
        }
        assert_eq!(buf.next_index(), 20);
    }
}

use super::request::{Priority, QueuedRequest, RequestId};
use super::stats::QueueDepth;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Requests re-inserted after a 429 cooldown jump ahead of everything else,
/// for that one pass only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Lane {
    Normal,
    Front,
}

struct Entry {
    lane: Lane,
    request: QueuedRequest,
}

impl Entry {
    fn key(&self) -> (Lane, Priority) {
        (self.lane, self.request.priority)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: greater key pops first; earlier submissions win ties.
        // `seq` rather than `created_at`, which moves if the wall clock steps back.
        self.key()
            .cmp(&other.key())
            .then_with(|| other.request.seq.cmp(&self.request.seq))
    }
}

/// Pending requests ordered by lane, then priority, then submission order.
///
/// Once closed it accepts nothing more; callers check `is_closed` under the
/// same lock before pushing.
#[derive(Default)]
pub(crate) struct RequestQueue {
    heap: BinaryHeap<Entry>,
    closed: bool,
}

impl RequestQueue {
    pub fn push(&mut self, request: QueuedRequest) {
        self.heap.push(Entry {
            lane: Lane::Normal,
            request,
        });
    }

    pub fn push_front(&mut self, request: QueuedRequest) {
        self.heap.push(Entry {
            lane: Lane::Front,
            request,
        });
    }

    pub fn pop(&mut self) -> Option<QueuedRequest> {
        self.heap.pop().map(|e| e.request)
    }

    pub fn remove(&mut self, id: RequestId) -> Option<QueuedRequest> {
        if !self.heap.iter().any(|e| e.request.id == id) {
            return None;
        }
        let (mut hit, rest): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .partition(|e| e.request.id == id);
        self.heap = BinaryHeap::from(rest);
        hit.pop().map(|e| e.request)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Marks the queue closed and hands back everything still pending.
    pub fn close(&mut self) -> Vec<QueuedRequest> {
        self.closed = true;
        std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .map(|e| e.request)
            .collect()
    }

    pub fn depth(&self) -> QueueDepth {
        let mut depth = QueueDepth {
            total: self.heap.len(),
            ..QueueDepth::default()
        };
        for e in self.heap.iter() {
            match e.request.priority {
                Priority::High => depth.high += 1,
                Priority::Medium => depth.medium += 1,
                Priority::Low => depth.low += 1,
            }
        }
        depth
    }
}

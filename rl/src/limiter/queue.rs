//! Priority queue of pending requests
//!
//! Ordered by priority (highest first), then enqueue time (earliest first).
//! Removal by id and deadline pruning tombstone the heap entry instead of
//! rebuilding the heap; tombstones are discarded lazily when they surface.

use std::any::Any;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::debug;

use crate::error::WorkError;
use crate::retry::RetryClassifier;

/// Unique identifier for a queued request
pub type RequestId = String;

/// Type-erased value produced by a successful attempt
pub(crate) type Output = Box<dyn Any + Send>;

/// Type-erased unit of work; called once per attempt
pub(crate) type Work = Arc<dyn Fn() -> BoxFuture<'static, Result<Output, WorkError>> + Send + Sync>;

/// Per-request scheduling options
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// Higher runs first; default 0
    pub priority: i32,

    /// Free-form metadata carried on events
    pub metadata: HashMap<String, serde_json::Value>,

    /// Absolute deadline; the request is rejected if still queued past it
    pub deadline: Option<Instant>,

    /// Retry classification for this unit of work
    pub classifier: RetryClassifier,
}

impl ScheduleOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_classifier(mut self, classifier: RetryClassifier) -> Self {
        self.classifier = classifier;
        self
    }
}

/// A unit of work waiting for admission
pub struct QueuedRequest {
    pub id: RequestId,
    pub priority: i32,
    pub enqueued_at: Instant,
    pub deadline: Option<Instant>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub(crate) classifier: RetryClassifier,
    pub(crate) work: Work,
}

impl QueuedRequest {
    /// Wrap a unit of work as a request stamped with the current time
    pub fn new<F, Fut, T>(work: F, options: ScheduleOptions) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, WorkError>> + Send + 'static,
        T: Send + 'static,
    {
        let work: Work = Arc::new(move || {
            let fut = work();
            async move { fut.await.map(|value| Box::new(value) as Output) }.boxed()
        });
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            priority: options.priority,
            enqueued_at: Instant::now(),
            deadline: options.deadline,
            metadata: options.metadata,
            classifier: options.classifier,
            work,
        }
    }

    /// True once the deadline has passed
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Start one attempt of the unit of work
    pub(crate) fn attempt(&self) -> BoxFuture<'static, Result<Output, WorkError>> {
        (self.work)()
    }
}

impl fmt::Debug for QueuedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("enqueued_at", &self.enqueued_at)
            .field("deadline", &self.deadline)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Heap key; `seq` keeps FIFO when two requests share an instant
#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapEntry {
    priority: i32,
    enqueued_at: Instant,
    seq: u64,
    id: RequestId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier submission
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap of requests with lazy tombstone deletion
#[derive(Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<HeapEntry>,
    deadlines: BinaryHeap<Reverse<(Instant, RequestId)>>,
    items: HashMap<RequestId, QueuedRequest>,
    tombstones: HashSet<RequestId>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request
    pub fn enqueue(&mut self, request: QueuedRequest) {
        debug!(id = %request.id, priority = request.priority, "PriorityQueue::enqueue: called");
        let seq = self.next_seq;
        self.next_seq += 1;

        self.heap.push(HeapEntry {
            priority: request.priority,
            enqueued_at: request.enqueued_at,
            seq,
            id: request.id.clone(),
        });
        if let Some(deadline) = request.deadline {
            self.deadlines.push(Reverse((deadline, request.id.clone())));
        }
        self.items.insert(request.id.clone(), request);
    }

    /// Remove and return the highest-priority request
    pub fn dequeue(&mut self) -> Option<QueuedRequest> {
        while let Some(entry) = self.heap.pop() {
            if self.tombstones.remove(&entry.id) {
                continue;
            }
            if let Some(request) = self.items.remove(&entry.id) {
                self.prune_deadlines();
                return Some(request);
            }
        }
        None
    }

    /// The request `dequeue` would return next
    pub fn peek(&mut self) -> Option<&QueuedRequest> {
        self.purge_top();
        let id = &self.heap.peek()?.id;
        self.items.get(id)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live requests (physical heap size minus tombstones)
    pub fn len(&self) -> usize {
        self.heap.len() - self.tombstones.len()
    }

    /// Tombstone and return every request whose deadline has passed
    pub fn remove_expired(&mut self, now: Instant) -> Vec<QueuedRequest> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, _))) = self.deadlines.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((_, id))) = self.deadlines.pop() else {
                break;
            };
            // Already dequeued or removed
            if let Some(request) = self.items.remove(&id) {
                self.tombstones.insert(id);
                expired.push(request);
            }
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "PriorityQueue::remove_expired: tombstoned expired requests");
        }
        expired
    }

    /// Tombstone and return a request by id
    pub fn remove_by_id(&mut self, id: &str) -> Option<QueuedRequest> {
        let request = self.items.remove(id)?;
        debug!(%id, "PriorityQueue::remove_by_id: tombstoned");
        self.tombstones.insert(request.id.clone());
        self.prune_deadlines();
        Some(request)
    }

    /// Remove every request, returned in dequeue order
    pub fn clear(&mut self) -> Vec<QueuedRequest> {
        let mut drained = Vec::with_capacity(self.len());
        while let Some(request) = self.dequeue() {
            drained.push(request);
        }
        self.heap.clear();
        self.deadlines.clear();
        self.tombstones.clear();
        self.items.clear();
        drained
    }

    /// Ids of live requests in dequeue order
    pub fn ids_in_order(&self) -> Vec<RequestId> {
        let mut entries: Vec<_> = self
            .heap
            .iter()
            .filter(|e| !self.tombstones.contains(&e.id))
            .collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.id.clone()).collect()
    }

    /// Drop deadline entries of requests that already left the queue
    ///
    /// Stale entries at the top go immediately; the rest are swept once they
    /// outnumber live requests.
    fn prune_deadlines(&mut self) {
        while let Some(Reverse((_, id))) = self.deadlines.peek() {
            if self.items.contains_key(id) {
                break;
            }
            self.deadlines.pop();
        }
        if self.deadlines.len() > 2 * self.items.len() {
            let items = &self.items;
            self.deadlines.retain(|Reverse((_, id))| items.contains_key(id));
            debug!(remaining = self.deadlines.len(), "PriorityQueue::prune_deadlines: compacted");
        }
    }

    fn purge_top(&mut self) {
        while let Some(entry) = self.heap.peek() {
            if !self.tombstones.contains(&entry.id) {
                break;
            }
            let id = entry.id.clone();
            self.heap.pop();
            self.tombstones.remove(&id);
        }
    }
}

impl fmt::Debug for PriorityQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("len", &self.len())
            .field("tombstones", &self.tombstones.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn request(priority: i32) -> QueuedRequest {
        QueuedRequest::new(|| async { Ok(()) }, ScheduleOptions::default().with_priority(priority))
    }

    fn request_with_deadline(priority: i32, deadline: Instant) -> QueuedRequest {
        QueuedRequest::new(
            || async { Ok(()) },
            ScheduleOptions::default().with_priority(priority).with_deadline(deadline),
        )
    }

    #[test]
    fn test_higher_priority_first() {
        let mut queue = PriorityQueue::new();
        let low = request(-1);
        let normal = request(0);
        let high = request(10);
        let (low_id, normal_id, high_id) = (low.id.clone(), normal.id.clone(), high.id.clone());

        queue.enqueue(low);
        queue.enqueue(normal);
        queue.enqueue(high);

        assert_eq!(queue.dequeue().map(|r| r.id), Some(high_id));
        assert_eq!(queue.dequeue().map(|r| r.id), Some(normal_id));
        assert_eq!(queue.dequeue().map(|r| r.id), Some(low_id));
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut queue = PriorityQueue::new();
        let ids: Vec<_> = (0..5)
            .map(|_| {
                let r = request(0);
                let id = r.id.clone();
                queue.enqueue(r);
                id
            })
            .collect();

        let drained: Vec<_> = std::iter::from_fn(|| queue.dequeue()).map(|r| r.id).collect();
        assert_eq!(drained, ids);
    }

    #[test]
    fn test_remove_by_id_tombstones() {
        let mut queue = PriorityQueue::new();
        let a = request(0);
        let b = request(0);
        let c = request(0);
        let (a_id, b_id, c_id) = (a.id.clone(), b.id.clone(), c.id.clone());
        queue.enqueue(a);
        queue.enqueue(b);
        queue.enqueue(c);

        let removed = queue.remove_by_id(&a_id);
        assert_eq!(removed.map(|r| r.id), Some(a_id.clone()));
        assert_eq!(queue.len(), 2);
        assert!(queue.remove_by_id(&a_id).is_none());

        // FIFO survives the removal
        assert_eq!(queue.peek().map(|r| r.id.clone()), Some(b_id.clone()));
        assert_eq!(queue.dequeue().map(|r| r.id), Some(b_id));
        assert_eq!(queue.dequeue().map(|r| r.id), Some(c_id));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_unknown_id() {
        let mut queue = PriorityQueue::new();
        queue.enqueue(request(0));
        assert!(queue.remove_by_id("nope").is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_deadline_heap_stays_bounded_under_churn() {
        let mut queue = PriorityQueue::new();
        let far = Instant::now() + Duration::from_secs(3600);
        for i in 0..10 {
            queue.enqueue(request_with_deadline(i % 3, far));
        }

        // Steady traffic: every request leaves long before its deadline
        for i in 0..1000 {
            queue.enqueue(request_with_deadline(i % 3, far + Duration::from_millis(i as u64)));
            if i % 2 == 0 {
                queue.dequeue();
            } else {
                let id = queue.ids_in_order().pop();
                if let Some(id) = id {
                    queue.remove_by_id(&id);
                }
            }
            assert!(queue.deadlines.len() <= 2 * queue.len().max(1));
        }
        assert_eq!(queue.len(), 10);

        while queue.dequeue().is_some() {}
        assert!(queue.deadlines.is_empty());
    }

    #[test]
    fn test_remove_expired() {
        let mut queue = PriorityQueue::new();
        let now = Instant::now();
        let expired = request_with_deadline(5, now - Duration::from_secs(1));
        let live = request_with_deadline(0, now + Duration::from_secs(60));
        let forever = request(1);
        let (expired_id, live_id, forever_id) = (expired.id.clone(), live.id.clone(), forever.id.clone());

        queue.enqueue(expired);
        queue.enqueue(live);
        queue.enqueue(forever);

        let removed: Vec<_> = queue.remove_expired(now).into_iter().map(|r| r.id).collect();
        assert_eq!(removed, vec![expired_id]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.ids_in_order(), vec![forever_id.clone(), live_id.clone()]);

        assert_eq!(queue.dequeue().map(|r| r.id), Some(forever_id));
        assert_eq!(queue.dequeue().map(|r| r.id), Some(live_id));
    }

    #[test]
    fn test_remove_expired_skips_dequeued() {
        let mut queue = PriorityQueue::new();
        let now = Instant::now();
        queue.enqueue(request_with_deadline(0, now + Duration::from_secs(1)));
        assert!(queue.dequeue().is_some());

        assert!(queue.remove_expired(now + Duration::from_secs(2)).is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_clear_returns_in_order() {
        let mut queue = PriorityQueue::new();
        let low = request(0);
        let high = request(3);
        let (low_id, high_id) = (low.id.clone(), high.id.clone());
        queue.enqueue(low);
        queue.enqueue(high);

        let drained: Vec<_> = queue.clear().into_iter().map(|r| r.id).collect();
        assert_eq!(drained, vec![high_id, low_id]);
        assert!(queue.is_empty());
        assert!(queue.peek().is_none());
    }

    #[test]
    fn test_is_expired() {
        let now = Instant::now();
        assert!(request_with_deadline(0, now).is_expired(now));
        assert!(!request_with_deadline(0, now + Duration::from_millis(1)).is_expired(now));
        assert!(!request(0).is_expired(now));
    }

    proptest! {
        #[test]
        fn prop_dequeue_order(priorities in proptest::collection::vec(-5i32..5, 0..64)) {
            let mut queue = PriorityQueue::new();
            let mut expected = Vec::new();
            for (index, priority) in priorities.iter().enumerate() {
                let r = request(*priority);
                expected.push((*priority, index, r.id.clone()));
                queue.enqueue(r);
            }
            // Stable sort: priority descending, insertion order within a tier
            expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

            let drained: Vec<_> = std::iter::from_fn(|| queue.dequeue()).map(|r| r.id).collect();
            let expected: Vec<_> = expected.into_iter().map(|(_, _, id)| id).collect();
            prop_assert_eq!(drained, expected);
        }
    }
}

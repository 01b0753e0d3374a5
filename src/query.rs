//! Chunk state queries, caller handles and the priority-ordered waiting queue.

use crate::protocol::QueryOutcome;
use crate::types::{ChunkLoadState, ChunkPosition, Dimension, Priority};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Completion callback. Runs exactly once, on whichever task terminates the query.
pub type Callback = Box<dyn FnOnce(&ChunkStateQuery) + Send + 'static>;

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// The immutable half of a query.
#[derive(Debug, Clone, Copy)]
pub struct QueryRequest {
    pub position: ChunkPosition,
    pub dimension: Dimension,
    pub expected: ChunkLoadState,
    pub priority: Priority,
    pub expires_at: Instant,
}

impl QueryRequest {
    pub fn new(
        dimension: Dimension,
        position: ChunkPosition,
        expected: ChunkLoadState,
        priority: Priority,
        expiry: Duration,
    ) -> Self {
        Self {
            position,
            dimension,
            expected,
            priority,
            expires_at: Instant::now() + expiry,
        }
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

struct Completion {
    state: ChunkLoadState,
    outcome: Option<QueryOutcome>,
    callback: Option<Callback>,
}

struct QueryInner {
    id: u64,
    request: QueryRequest,
    cancelled_at: Mutex<Option<Instant>>,
    completion: Mutex<Completion>,
}

/// One probe request plus its mutable result.
///
/// Cheap to clone; every clone refers to the same query. The scheduler and the
/// connection that currently owns it pass clones around, the caller holds a
/// [`QueryHandle`].
#[derive(Clone)]
pub struct ChunkStateQuery {
    inner: Arc<QueryInner>,
}

impl ChunkStateQuery {
    pub fn new(request: QueryRequest, callback: Option<Callback>) -> Self {
        Self {
            inner: Arc::new(QueryInner {
                id: NEXT_QUERY_ID.fetch_add(1, AtomicOrdering::Relaxed),
                request,
                cancelled_at: Mutex::new(None),
                completion: Mutex::new(Completion {
                    state: ChunkLoadState::Waiting,
                    outcome: None,
                    callback,
                }),
            }),
        }
    }

    /// Process-wide creation sequence. Earlier queries have smaller ids.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn position(&self) -> ChunkPosition {
        self.inner.request.position
    }

    pub fn dimension(&self) -> Dimension {
        self.inner.request.dimension
    }

    pub fn expected(&self) -> ChunkLoadState {
        self.inner.request.expected
    }

    pub fn priority(&self) -> Priority {
        self.inner.request.priority
    }

    pub fn state(&self) -> ChunkLoadState {
        self.inner.completion.lock().state
    }

    /// `None` while waiting.
    pub fn outcome(&self) -> Option<QueryOutcome> {
        self.inner.completion.lock().outcome
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn expires_at(&self) -> Instant {
        match *self.inner.cancelled_at.lock() {
            Some(at) => at.min(self.inner.request.expires_at),
            None => self.inner.request.expires_at,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }

    /// Expire the query now. It will not be dispatched again.
    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled_at.lock();
        if cancelled.is_none() {
            *cancelled = Some(Instant::now());
        }
    }

    /// Move `Waiting → state` and fire the callback.
    ///
    /// Returns `false` (and does nothing) if the query already terminated or
    /// `state` is `Waiting`. The callback runs after the internal lock is
    /// released, so it may freely submit follow-up queries.
    pub fn complete(&self, state: ChunkLoadState, outcome: QueryOutcome) -> bool {
        if !state.is_terminal() {
            return false;
        }

        let callback = {
            let mut completion = self.inner.completion.lock();
            if completion.state.is_terminal() {
                return false;
            }
            completion.state = state;
            completion.outcome = Some(outcome);
            completion.callback.take()
        };

        if let Some(callback) = callback {
            callback(self);
        }
        true
    }

    pub fn ptr_eq(&self, other: &ChunkStateQuery) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ChunkStateQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStateQuery")
            .field("id", &self.inner.id)
            .field("dimension", &self.inner.request.dimension)
            .field("position", &self.inner.request.position)
            .field("priority", &self.inner.request.priority)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Caller handle
// ---------------------------------------------------------------------------

/// What the caller keeps after submitting a query.
#[derive(Debug, Clone)]
pub struct QueryHandle {
    query: ChunkStateQuery,
}

impl QueryHandle {
    pub(crate) fn new(query: ChunkStateQuery) -> Self {
        Self { query }
    }

    pub fn id(&self) -> u64 {
        self.query.id()
    }

    pub fn state(&self) -> ChunkLoadState {
        self.query.state()
    }

    pub fn outcome(&self) -> Option<QueryOutcome> {
        self.query.outcome()
    }

    pub fn is_done(&self) -> bool {
        self.query.is_terminal()
    }

    /// Stop scheduling this query. A probe already on the wire is not aborted;
    /// if it classifies before the scheduler drops the query, that result wins.
    pub fn cancel(&self) {
        self.query.cancel();
    }

    pub fn query(&self) -> &ChunkStateQuery {
        &self.query
    }
}

// ---------------------------------------------------------------------------
// Priority ordering
// ---------------------------------------------------------------------------

/// Which end of the [`Priority`] scale is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriorityOrder {
    /// `High` before `Medium` before `Low`.
    #[default]
    HighestFirst,
    /// `Low` before `Medium` before `High`.
    LowestFirst,
}

impl PriorityOrder {
    /// Larger rank is served first.
    pub fn rank(self, priority: Priority) -> u8 {
        let natural = match priority {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
        };
        match self {
            PriorityOrder::HighestFirst => natural,
            PriorityOrder::LowestFirst => 2 - natural,
        }
    }

    /// `Ordering::Less` when `a` is served before `b`.
    pub fn compare(self, a: Priority, b: Priority) -> Ordering {
        self.rank(b).cmp(&self.rank(a))
    }
}

// ---------------------------------------------------------------------------
// Waiting queue
// ---------------------------------------------------------------------------

struct Waiting {
    rank: u8,
    query: ChunkStateQuery,
}

impl PartialEq for Waiting {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Waiting {}

impl PartialOrd for Waiting {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiting {
    // Max-heap: higher rank first, then the earlier query.
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| other.query.id().cmp(&self.query.id()))
    }
}

/// Queries not yet dispatched, served by priority then arrival.
///
/// Rescheduled queries keep their original arrival position.
pub struct WaitingQueue {
    order: PriorityOrder,
    heap: BinaryHeap<Waiting>,
}

impl WaitingQueue {
    pub fn new(order: PriorityOrder) -> Self {
        Self {
            order,
            heap: BinaryHeap::new(),
        }
    }

    pub fn order(&self) -> PriorityOrder {
        self.order
    }

    pub fn push(&mut self, query: ChunkStateQuery) {
        let rank = self.order.rank(query.priority());
        self.heap.push(Waiting { rank, query });
    }

    pub fn peek(&self) -> Option<&ChunkStateQuery> {
        self.heap.peek().map(|w| &w.query)
    }

    pub fn pop(&mut self) -> Option<ChunkStateQuery> {
        self.heap.pop().map(|w| w.query)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove and return every query that expired (or already terminated).
    pub fn drain_expired(&mut self, now: Instant) -> Vec<ChunkStateQuery> {
        let (dead, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .partition(|w| w.query.is_expired(now) || w.query.is_terminal());
        self.heap = live.into();
        dead.into_iter().map(|w| w.query).collect()
    }

    /// Remove everything, in service order.
    pub fn drain(&mut self) -> Vec<ChunkStateQuery> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(q) = self.pop() {
            out.push(q);
        }
        out
    }
}

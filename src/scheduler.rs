//! Per-dimension probe scheduler.
//!
//! Owns the waiting queue and the set of connection actors in one dimension.
//! Every [`ProbeScheduler::tick`]:
//!
//! 1. drains the shared inbox (new submissions and probes handed back by
//!    connections) into the waiting queue,
//! 2. drops expired queries,
//! 3. offers waiting queries, in priority order, to ready connections,
//! 4. ticks every connection,
//! 5. reports the dimension as unavailable when queries wait and no
//!    connection is left to take them,
//! 6. refreshes the metrics,
//! 7. completes the expired queries once no lock is held.
//!
//! Lock order: `state` may take `shared.inbox`, never the reverse. Actors and
//! callers only ever touch the inbox.

use crate::actor::ConnectionHandle;
use crate::config::{ProbeConfig, SchedulerConfig};
use crate::connection::ProbeConnection;
use crate::error::ProbeError;
use crate::protocol::{Inbound, Outbound, ProbeReport, QueryOutcome};
use crate::query::{ChunkStateQuery, WaitingQueue};
use crate::types::{ChunkLoadState, ConnectionId, Dimension};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

// ---------------------------------------------------------------------------
// Shared inbox
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Inbox {
    queries: Vec<ChunkStateQuery>,
    reports: Vec<ProbeReport>,
}

/// The part of a scheduler that callers and connection actors write into.
#[derive(Debug)]
pub struct SchedulerShared {
    dimension: Dimension,
    inbox: Mutex<Inbox>,
    completed: AtomicU64,
}

impl SchedulerShared {
    pub fn new(dimension: Dimension) -> Arc<Self> {
        Arc::new(Self {
            dimension,
            inbox: Mutex::new(Inbox::default()),
            completed: AtomicU64::new(0),
        })
    }

    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    /// Queue a query for the next tick.
    pub fn submit(&self, query: ChunkStateQuery) {
        self.inbox.lock().queries.push(query);
    }

    /// Collect a connection's outputs.
    pub fn absorb(&self, queries: Vec<ChunkStateQuery>, reports: Vec<ProbeReport>, finalised: u32) {
        if finalised > 0 {
            self.completed.fetch_add(u64::from(finalised), Ordering::Relaxed);
        }
        if queries.is_empty() && reports.is_empty() {
            return;
        }
        let mut inbox = self.inbox.lock();
        inbox.queries.extend(queries);
        inbox.reports.extend(reports);
    }

    /// Probes classified by any connection of this scheduler, ever.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    fn take(&self) -> Inbox {
        std::mem::take(&mut *self.inbox.lock())
    }

    fn pending(&self) -> usize {
        self.inbox.lock().queries.len()
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Read-only throughput and backlog figures for one dimension.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerMetrics {
    pub dimension: Option<Dimension>,
    pub tick: u64,
    /// Completed probes per second over the trailing window.
    pub queries_per_second: f32,
    /// Queued, not yet dispatched.
    pub waiting: usize,
    /// Dispatched, awaiting classification.
    pub processing: usize,
    pub connections: usize,
    pub ready_connections: usize,
    pub completed_total: u64,
    pub expired_total: u64,
}

/// What one scheduler tick produced.
#[derive(Debug, Default)]
pub struct SchedulerTick {
    pub tick: u64,
    pub dispatched: usize,
    /// Queries dropped this tick; already completed with [`QueryOutcome::Expired`].
    pub expired: Vec<ChunkStateQuery>,
    pub reports: Vec<ProbeReport>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct SchedulerState {
    connections: BTreeMap<ConnectionId, ConnectionHandle>,
    waiting: WaitingQueue,
    tick: u64,
    completed_history: VecDeque<u64>,
    expired_total: u64,
    /// Queries were waiting with no connections at the last tick.
    unavailable: bool,
    metrics: SchedulerMetrics,
}

pub struct ProbeScheduler {
    dimension: Dimension,
    config: SchedulerConfig,
    probe_config: Arc<ProbeConfig>,
    state: Mutex<SchedulerState>,
    shared: Arc<SchedulerShared>,
}

impl ProbeScheduler {
    pub fn new(dimension: Dimension, config: SchedulerConfig, probe_config: Arc<ProbeConfig>) -> Self {
        let waiting = WaitingQueue::new(config.priority_order);
        Self {
            dimension,
            config,
            probe_config,
            state: Mutex::new(SchedulerState {
                connections: BTreeMap::new(),
                waiting,
                tick: 0,
                completed_history: VecDeque::new(),
                expired_total: 0,
                unavailable: false,
                metrics: SchedulerMetrics {
                    dimension: Some(dimension),
                    ..Default::default()
                },
            }),
            shared: SchedulerShared::new(dimension),
        }
    }

    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    pub fn shared(&self) -> Arc<SchedulerShared> {
        self.shared.clone()
    }

    /// Queue `query`. Safe to call from a completion callback.
    pub fn submit(&self, query: ChunkStateQuery) {
        self.shared.submit(query);
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Start an actor for `connection`.
    pub fn login(&self, connection: ProbeConnection) -> Result<(), ProbeError> {
        let id = connection.id();
        let mut state = self.state.lock();
        if state.connections.contains_key(&id) {
            return Err(ProbeError::DuplicateConnection(id));
        }
        debug!("{} joined the {} scheduler", connection.name(), self.dimension);
        let handle = ConnectionHandle::spawn(connection, self.shared.clone());
        state.connections.insert(id, handle);
        Ok(())
    }

    /// Take over a running actor from another scheduler.
    pub fn adopt(&self, handle: ConnectionHandle) -> Result<(), ProbeError> {
        let id = handle.id();
        let mut state = self.state.lock();
        if state.connections.contains_key(&id) {
            return Err(ProbeError::DuplicateConnection(id));
        }
        handle.rebind(self.shared.clone())?;
        debug!("{} moved into the {} scheduler", handle.name(), self.dimension);
        state.connections.insert(id, handle);
        Ok(())
    }

    /// Detach a running actor without stopping it.
    pub fn evict(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.state.lock().connections.remove(&id)
    }

    /// Stop the actor; its in-flight probes are requeued here.
    pub async fn logout(&self, id: ConnectionId) -> Result<(), ProbeError> {
        let handle = self
            .evict(id)
            .ok_or(ProbeError::UnknownConnection(id))?;
        if handle.logout().await.is_err() {
            warn!("connection {} actor panicked during logout", id);
        }
        Ok(())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.state.lock().connections.contains_key(&id)
    }

    pub fn packet_in(&self, id: ConnectionId, event: Inbound) -> Result<(), ProbeError> {
        let state = self.state.lock();
        let handle = state
            .connections
            .get(&id)
            .ok_or(ProbeError::UnknownConnection(id))?;
        handle.packet_in(event)
    }

    pub fn packet_out(&self, id: ConnectionId, packet: Outbound) -> Result<(), ProbeError> {
        let state = self.state.lock();
        let handle = state
            .connections
            .get(&id)
            .ok_or(ProbeError::UnknownConnection(id))?;
        handle.packet_out(packet)
    }

    pub fn snapshot(&self, id: ConnectionId) -> Option<crate::connection::ConnectionSnapshot> {
        self.state.lock().connections.get(&id).map(|h| h.snapshot())
    }

    pub fn snapshots(&self) -> Vec<crate::connection::ConnectionSnapshot> {
        self.state
            .lock()
            .connections
            .values()
            .map(|h| h.snapshot())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    pub fn tick(&self) -> SchedulerTick {
        let now = Instant::now();

        let (tick, dispatched, mut expired, reports) = {
            let mut state = self.state.lock();
            state.tick += 1;

            let inbox = self.shared.take();
            for query in inbox.queries {
                if !query.is_terminal() {
                    state.waiting.push(query);
                }
            }

            // Already-classified queries are dropped silently.
            let expired: Vec<_> = state
                .waiting
                .drain_expired(now)
                .into_iter()
                .filter(|query| !query.is_terminal())
                .collect();
            let dispatched = self.dispatch_waiting(&mut state);

            let mut dead = Vec::new();
            for (id, handle) in &state.connections {
                if handle.tick().is_err() {
                    dead.push(*id);
                }
            }
            for id in dead {
                warn!("connection {} actor is gone, dropping it", id);
                state.connections.remove(&id);
            }

            let mut reports = inbox.reports;
            let unavailable = state.connections.is_empty() && !state.waiting.is_empty();
            if unavailable && !state.unavailable {
                warn!(
                    "no connections in {}, {} queries cannot be probed",
                    self.dimension,
                    state.waiting.len()
                );
                reports.push(ProbeReport::DimensionUnavailable {
                    dimension: self.dimension,
                    waiting: state.waiting.len(),
                });
            }
            state.unavailable = unavailable;

            self.update_metrics(&mut state, expired.len());
            (state.tick, dispatched, expired, reports)
        };

        // Callbacks run with no lock held; they may submit follow-ups.
        expired.retain(|query| query.complete(ChunkLoadState::Unloaded, QueryOutcome::Expired));
        if !expired.is_empty() {
            debug!("{} scheduler expired {} queries", self.dimension, expired.len());
        }

        SchedulerTick {
            tick,
            dispatched,
            expired,
            reports,
        }
    }

    /// First-fit, highest-priority first. Stops at the first query no
    /// connection can take, so lower priorities never overtake it.
    fn dispatch_waiting(&self, state: &mut SchedulerState) -> usize {
        let mut slots: Vec<(ConnectionId, u32)> = state
            .connections
            .iter()
            .filter_map(|(id, handle)| {
                let snapshot = handle.snapshot();
                (snapshot.can_query && snapshot.dimension == self.dimension && snapshot.capacity > 0)
                    .then_some((*id, snapshot.capacity))
            })
            .collect();

        let mut dispatched = 0;
        while !state.waiting.is_empty() {
            let Some(slot) = slots.iter_mut().find(|(_, capacity)| *capacity > 0) else {
                break;
            };
            let Some(query) = state.waiting.pop() else {
                break;
            };
            let Some(handle) = state.connections.get(&slot.0) else {
                slot.1 = 0;
                state.waiting.push(query);
                continue;
            };
            match handle.dispatch(query) {
                Ok(()) => {
                    slot.1 -= 1;
                    dispatched += 1;
                }
                Err(query) => {
                    slot.1 = 0;
                    state.waiting.push(query);
                }
            }
        }
        dispatched
    }

    fn update_metrics(&self, state: &mut SchedulerState, expired: usize) {
        let completed = self.shared.completed();
        state.completed_history.push_back(completed);
        while state.completed_history.len() > self.config.qps_window_ticks + 1 {
            state.completed_history.pop_front();
        }
        let span_ticks = state.completed_history.len().saturating_sub(1);
        let queries_per_second = match (state.completed_history.front(), span_ticks) {
            (Some(oldest), span) if span > 0 => {
                let seconds = span as f32 * self.config.tick_interval_ms as f32 / 1000.0;
                (completed - oldest) as f32 / seconds
            }
            _ => 0.0,
        };

        let snapshots: Vec<_> = state.connections.values().map(|h| h.snapshot()).collect();
        state.expired_total += expired as u64;
        state.metrics = SchedulerMetrics {
            dimension: Some(self.dimension),
            tick: state.tick,
            queries_per_second,
            waiting: state.waiting.len(),
            processing: snapshots.iter().map(|s| s.in_flight).sum(),
            connections: snapshots.len(),
            ready_connections: snapshots.iter().filter(|s| s.can_query).count(),
            completed_total: completed,
            expired_total: state.expired_total,
        };
    }

    /// Wait until every connection actor has applied everything sent so far.
    pub async fn flush(&self) {
        let signals: Vec<_> = {
            let state = self.state.lock();
            state
                .connections
                .values()
                .filter_map(|h| h.flush_signal())
                .collect()
        };
        for signal in signals {
            let _ = signal.await;
        }
    }

    // -----------------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------------

    /// Metrics as of the last tick.
    pub fn metrics(&self) -> SchedulerMetrics {
        self.state.lock().metrics.clone()
    }

    /// Queued (including submissions not yet drained) and not dispatched.
    pub fn waiting_count(&self) -> usize {
        let queued = self.state.lock().waiting.len();
        queued + self.shared.pending()
    }

    pub fn processing_count(&self) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .map(|h| h.snapshot().in_flight)
            .sum()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Whether any connection is present to probe this dimension.
    pub fn is_available(&self) -> bool {
        !self.state.lock().connections.is_empty()
    }

    /// Probes the currently ready connections could dispatch over the next
    /// `ahead_ticks` ticks.
    pub fn max_throughput(&self, ahead_ticks: u32) -> f32 {
        let ready = self
            .state
            .lock()
            .connections
            .values()
            .filter(|h| h.snapshot().can_query)
            .count();
        ready as f32 * self.probe_config.queries_per_tick * ahead_ticks as f32
    }
}

//! Entry point: routes chunk-state requests to the scheduler of their dimension.

use crate::config::{EngineConfig, ProbeConfig, RouterConfig};
use crate::connection::{ProbeConnection, Transport};
use crate::error::ProbeError;
use crate::policy;
use crate::protocol::{ChunkStateEvent, Inbound, Outbound, ProbeReport};
use crate::query::{Callback, ChunkStateQuery, QueryHandle, QueryRequest};
use crate::scheduler::{ProbeScheduler, SchedulerMetrics};
use crate::types::{ChunkLoadState, ChunkPosition, ConnectionId, Dimension, Priority};
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Everything one router tick produced, across dimensions.
#[derive(Debug, Default)]
pub struct RouterTick {
    pub tick: u64,
    pub dispatched: usize,
    pub expired: usize,
    pub reports: Vec<ProbeReport>,
    /// Terminal classifications since the previous tick.
    pub chunk_states: Vec<ChunkStateEvent>,
}

pub struct DimensionQueryRouter {
    config: RouterConfig,
    probe_config: Arc<ProbeConfig>,
    schedulers: HashMap<Dimension, ProbeScheduler>,
    /// Which scheduler each connection currently lives in.
    connections: Mutex<HashMap<ConnectionId, Dimension>>,
    chunk_states: Arc<Mutex<Vec<ChunkStateEvent>>>,
    ticks: Mutex<u64>,
}

impl DimensionQueryRouter {
    pub fn new(config: &EngineConfig) -> Result<Self, ProbeError> {
        config.validate()?;
        let probe_config = Arc::new(config.probe.clone());
        let schedulers = Dimension::ALL
            .iter()
            .map(|d| {
                (
                    *d,
                    ProbeScheduler::new(*d, config.scheduler.clone(), probe_config.clone()),
                )
            })
            .collect();

        Ok(Self {
            config: config.router.clone(),
            probe_config,
            schedulers,
            connections: Mutex::new(HashMap::new()),
            chunk_states: Arc::new(Mutex::new(Vec::new())),
            ticks: Mutex::new(0),
        })
    }

    /// Whether any probing mechanism is available.
    pub fn is_supported(&self) -> bool {
        self.config.invalid_move_enabled
    }

    /// Whether `dimension` currently has a connection that can probe it.
    pub fn is_available(&self, dimension: Dimension) -> bool {
        self.is_supported() && self.schedulers.get(&dimension).is_some_and(|s| s.is_available())
    }

    pub fn scheduler(&self, dimension: Dimension) -> Option<&ProbeScheduler> {
        self.schedulers.get(&dimension)
    }

    fn scheduler_for(&self, dimension: Dimension) -> Result<&ProbeScheduler, ProbeError> {
        self.schedulers
            .get(&dimension)
            .ok_or(ProbeError::NoScheduler(dimension))
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Ask whether the chunk at `position` is loaded.
    ///
    /// `callback` fires exactly once with the terminal query. Fails with
    /// [`ProbeError::Unsupported`] when probing is disabled for this server.
    pub fn request(
        &self,
        dimension: Dimension,
        position: ChunkPosition,
        expected: ChunkLoadState,
        priority: Priority,
        expiry: Duration,
        callback: Option<Callback>,
    ) -> Result<QueryHandle, ProbeError> {
        if !self.is_supported() {
            return Err(ProbeError::Unsupported);
        }
        let scheduler = self.scheduler_for(dimension)?;

        let sink = self.chunk_states.clone();
        let wrapped: Callback = Box::new(move |query: &ChunkStateQuery| {
            if let Some(outcome) = query.outcome() {
                sink.lock().push(ChunkStateEvent {
                    dimension: query.dimension(),
                    position: query.position(),
                    state: query.state(),
                    outcome,
                });
            }
            if let Some(callback) = callback {
                callback(query);
            }
        });

        let request = QueryRequest::new(dimension, position, expected, priority, expiry);
        let query = ChunkStateQuery::new(request, Some(wrapped));
        scheduler.submit(query.clone());
        Ok(QueryHandle::new(query))
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Register a bot connection. Must be called inside a Tokio runtime.
    pub fn login(
        &self,
        id: ConnectionId,
        name: impl Into<String>,
        dimension: Dimension,
        transport: Box<dyn Transport>,
    ) -> Result<(), ProbeError> {
        let mut connections = self.connections.lock();
        if connections.contains_key(&id) {
            return Err(ProbeError::DuplicateConnection(id));
        }
        let policy = policy::build(&self.probe_config.policy)?;
        let connection = ProbeConnection::new(
            id,
            name,
            dimension,
            self.probe_config.clone(),
            policy,
            transport,
        );
        info!("{} logged in ({})", connection.name(), dimension);
        self.scheduler_for(dimension)?.login(connection)?;
        connections.insert(id, dimension);
        Ok(())
    }

    pub async fn logout(&self, id: ConnectionId) -> Result<(), ProbeError> {
        let dimension = self
            .connections
            .lock()
            .remove(&id)
            .ok_or(ProbeError::UnknownConnection(id))?;
        info!("connection {} logged out", id);
        self.scheduler_for(dimension)?.logout(id).await
    }

    pub fn dimension_of(&self, id: ConnectionId) -> Option<Dimension> {
        self.connections.lock().get(&id).copied()
    }

    /// Deliver an inbound event. A respawn into another dimension moves the
    /// connection to that dimension's scheduler.
    pub fn packet_in(&self, id: ConnectionId, event: Inbound) -> Result<(), ProbeError> {
        let mut connections = self.connections.lock();
        let current = *connections
            .get(&id)
            .ok_or(ProbeError::UnknownConnection(id))?;
        let target = match &event {
            Inbound::Respawn { dimension } => *dimension,
            _ => current,
        };

        let scheduler = self.scheduler_for(current)?;
        scheduler.packet_in(id, event)?;

        if target != current {
            if let Some(handle) = scheduler.evict(id) {
                debug!("moving {} from {} to {}", handle.name(), current, target);
                self.scheduler_for(target)?.adopt(handle)?;
                connections.insert(id, target);
            }
        }
        Ok(())
    }

    /// Let the connection observe a packet sent outside the engine.
    pub fn packet_out(&self, id: ConnectionId, packet: Outbound) -> Result<(), ProbeError> {
        let dimension = self
            .dimension_of(id)
            .ok_or(ProbeError::UnknownConnection(id))?;
        self.scheduler_for(dimension)?.packet_out(id, packet)
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    pub fn tick(&self) -> RouterTick {
        let tick = {
            let mut ticks = self.ticks.lock();
            *ticks += 1;
            *ticks
        };

        let mut out = RouterTick {
            tick,
            ..Default::default()
        };
        for dimension in Dimension::ALL {
            if let Some(scheduler) = self.schedulers.get(&dimension) {
                let result = scheduler.tick();
                out.dispatched += result.dispatched;
                out.expired += result.expired.len();
                out.reports.extend(result.reports);
            }
        }
        out.chunk_states = std::mem::take(&mut *self.chunk_states.lock());
        out
    }

    /// Wait for every connection actor to catch up.
    pub async fn flush(&self) {
        for dimension in Dimension::ALL {
            if let Some(scheduler) = self.schedulers.get(&dimension) {
                scheduler.flush().await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------------

    pub fn metrics(&self, dimension: Dimension) -> Option<SchedulerMetrics> {
        self.schedulers.get(&dimension).map(|s| s.metrics())
    }

    pub fn all_metrics(&self) -> Vec<SchedulerMetrics> {
        Dimension::ALL
            .iter()
            .filter_map(|d| self.metrics(*d))
            .collect()
    }

    pub fn max_throughput(&self, dimension: Dimension, ahead_ticks: u32) -> f32 {
        self.schedulers
            .get(&dimension)
            .map_or(0.0, |s| s.max_throughput(ahead_ticks))
    }
}

//! Per-bot probe state machine.
//!
//! [`ProbeConnection`] owns everything one bot connection knows: its model of
//! the server's teleport and window counters, the storage it uses as a side
//! channel, and the probes it has in flight. It is synchronous and
//! single-owner; [`crate::actor`] serialises ticks and packets into it.
//!
//! ```text
//!            dispatch()                     packet_in()
//!  query ──► [CancelDigging] ──► processing ──► current ──► finalize ──► callback
//!            [open storage]      (FIFO)          │
//!            PositionUpdate                      ├─ Desync   ──► reschedule all
//!            TeleportConfirm                     └─ Timeout  ──► reschedule all
//! ```

use crate::config::ProbeConfig;
use crate::policy::{ClassificationPolicy, DesyncKind, PolicyContext, Verdict};
use crate::protocol::{Inbound, Outbound, ProbeReport, QueryOutcome, RescheduleReason};
use crate::query::ChunkStateQuery;
use crate::storage::{StorageAction, StorageLocator, EYE_HEIGHT};
use crate::types::{Angle, BlockPosition, ChunkLoadState, ConnectionId, Dimension, Position};
use log::{debug, info, trace, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Horizontal coordinates beyond this get the client kicked.
pub const WORLD_BORDER: i32 = 29_999_999;

/// Window ids handed out by the server run 1..=100.
pub fn next_window_id(id: i32) -> i32 {
    id.rem_euclid(100) + 1
}

pub fn previous_window_id(id: i32) -> i32 {
    if id <= 1 {
        100
    } else {
        id - 1
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Outbound half of a connection. Ordered and non-blocking.
pub trait Transport: Send + 'static {
    fn send(&mut self, packet: Outbound);
}

impl Transport for mpsc::UnboundedSender<Outbound> {
    fn send(&mut self, packet: Outbound) {
        if mpsc::UnboundedSender::send(self, packet).is_err() {
            trace!("outbound channel closed, dropping packet");
        }
    }
}

// ---------------------------------------------------------------------------
// In-flight bookkeeping
// ---------------------------------------------------------------------------

/// A dispatched query waiting for its reply sequence.
#[derive(Debug)]
pub struct ProcessingProbe {
    pub query: ChunkStateQuery,
    /// Cancel-digging position marking this probe's boundary, if any.
    pub digging_position: Option<BlockPosition>,
    pub teleport_id: i32,
    /// Predicted window id of the storage session opened for this probe.
    pub window_id: Option<i32>,
    pub open_window_id: Option<i32>,
    pub close_window_id: Option<i32>,
    pub packets_elapsed: u32,
    pub ticks_elapsed: u32,
    /// No digging boundary has been seen for this probe.
    pub unsure: bool,
    pub dispatched_at: Instant,
}

impl ProcessingProbe {
    fn new(
        query: ChunkStateQuery,
        digging_position: Option<BlockPosition>,
        teleport_id: i32,
        window_id: Option<i32>,
    ) -> Self {
        Self {
            query,
            digging_position,
            teleport_id,
            window_id,
            open_window_id: None,
            close_window_id: None,
            packets_elapsed: 0,
            ticks_elapsed: 0,
            unsure: true,
            dispatched_at: Instant::now(),
        }
    }
}

/// The connection's model of the server-side counters.
#[derive(Debug, Clone)]
pub struct BotConnectionState {
    pub spawned: bool,
    pub dimension: Dimension,
    pub position: Position,
    pub angle: Angle,
    /// Teleport id the next dispatched probe will acknowledge (minus one).
    pub estimated_teleport_id: i32,
    /// Last teleport id the server issued.
    pub last_teleport_id: i32,
    pub estimated_window_id: i32,
    /// Last window id the server opened.
    pub last_window_id: i32,
    pub teleport_desync: bool,
    pub window_desync: bool,
    /// Movement packets are suppressed while positive.
    pub movement_limit: i32,
    pub ticks_since_packet: u32,
    pub ticks_since_teleport: u32,
    pub ticks_since_storage_update: u32,
    pub average_response_ms: f32,
    pub ping_ms: u32,
}

impl BotConnectionState {
    fn new(dimension: Dimension) -> Self {
        Self {
            spawned: false,
            dimension,
            position: Position::default(),
            angle: Angle::default(),
            estimated_teleport_id: 1,
            last_teleport_id: 0,
            estimated_window_id: 0,
            last_window_id: 0,
            // The first correction after login is never pre-confirmed.
            teleport_desync: true,
            window_desync: false,
            movement_limit: 0,
            ticks_since_packet: 0,
            ticks_since_teleport: 0,
            ticks_since_storage_update: 0,
            average_response_ms: 0.0,
            ping_ms: 0,
        }
    }
}

/// Read-only view published after every state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub dimension: Dimension,
    pub can_query: bool,
    /// How many more probes this connection accepts before the next tick.
    pub capacity: u32,
    pub in_flight: usize,
    pub teleport_desync: bool,
    pub window_desync: bool,
    pub has_storage: bool,
    pub storage_open: bool,
    pub spawned: bool,
    pub dispatched_total: u64,
    pub completed_total: u64,
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

pub struct ProbeConnection {
    id: ConnectionId,
    name: String,
    config: Arc<ProbeConfig>,
    policy: Box<dyn ClassificationPolicy>,
    transport: Box<dyn Transport>,
    rng: fastrand::Rng,

    state: BotConnectionState,
    storage: StorageLocator,

    pre_confirms: VecDeque<i32>,
    pending_opens: VecDeque<i32>,
    processing: VecDeque<ProcessingProbe>,
    current: Option<ProcessingProbe>,

    rescheduled: Vec<ChunkStateQuery>,
    reports: Vec<ProbeReport>,

    ticks: u64,
    ticks_processing: u32,
    dispatched_this_tick: u32,
    allowance: u32,
    carry: f32,
    finalised: u32,
    dispatched_total: u64,
    completed_total: u64,
}

impl ProbeConnection {
    pub fn new(
        id: ConnectionId,
        name: impl Into<String>,
        dimension: Dimension,
        config: Arc<ProbeConfig>,
        policy: Box<dyn ClassificationPolicy>,
        transport: Box<dyn Transport>,
    ) -> Self {
        let name = name.into();
        debug!("new probe connection for {} ({})", name, dimension);

        let mut connection = Self {
            id,
            name,
            config,
            policy,
            transport,
            rng: fastrand::Rng::new(),
            state: BotConnectionState::new(dimension),
            storage: StorageLocator::new(),
            pre_confirms: VecDeque::new(),
            pending_opens: VecDeque::new(),
            processing: VecDeque::new(),
            current: None,
            rescheduled: Vec::new(),
            reports: Vec::new(),
            ticks: 0,
            ticks_processing: 0,
            dispatched_this_tick: 0,
            allowance: 0,
            carry: 0.0,
            finalised: 0,
            dispatched_total: 0,
            completed_total: 0,
        };
        connection.refresh_allowance();
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &BotConnectionState {
        &self.state
    }

    pub fn storage(&self) -> &StorageLocator {
        &self.storage
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Probes dispatched and not yet finalised or handed back.
    pub fn in_flight(&self) -> usize {
        self.processing.len() + usize::from(self.current.is_some())
    }

    pub fn current(&self) -> Option<&ProcessingProbe> {
        self.current.as_ref()
    }

    pub fn processing(&self) -> impl Iterator<Item = &ProcessingProbe> {
        self.processing.iter()
    }

    pub fn pre_confirms(&self) -> usize {
        self.pre_confirms.len()
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Ready to take a new probe at all.
    pub fn can_query(&self) -> bool {
        self.storage.current().is_some()
            && self.state.spawned
            && self.state.movement_limit <= 0
            && !self.state.teleport_desync
            && !self.state.window_desync
            && (self.storage.is_open() || self.config.arzi_mode)
    }

    /// Has budget left for `query` this tick.
    pub fn can_handle(&self, query: &ChunkStateQuery) -> bool {
        query.dimension() == self.state.dimension
            && self.dispatched_this_tick < self.allowance
            && self.throughput_ratio() > self.in_flight() as f32
    }

    /// How many more probes [`can_handle`](Self::can_handle) would accept in a row.
    pub fn capacity(&self) -> u32 {
        let ratio = self.throughput_ratio();
        let mut in_flight = self.in_flight() as f32;
        let mut n = 0;
        while self.dispatched_this_tick + n < self.allowance && ratio > in_flight {
            n += 1;
            in_flight += 1.0;
        }
        n
    }

    /// Probes this connection could dispatch over `ticks` ticks at full speed.
    pub fn throughput(&self, ticks: u32) -> f32 {
        if self.can_query() {
            self.config.queries_per_tick * ticks as f32
        } else {
            0.0
        }
    }

    fn throughput_ratio(&self) -> f32 {
        self.state.average_response_ms.max(50.0) / 50.0 * self.config.queries_per_tick
    }

    /// Round trip estimate used by the resync windows.
    fn expected_ticks(&self) -> f32 {
        self.config.timeout_base_ticks as f32 + self.state.ping_ms.max(50) as f32 / 50.0
    }

    fn eyes(&self) -> Position {
        self.state.position.offset(0.0, EYE_HEIGHT, 0.0)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Send a probe for `query`. Hands the query back if this connection
    /// cannot take it right now.
    pub fn dispatch(&mut self, query: ChunkStateQuery) -> Result<(), ChunkStateQuery> {
        if !self.can_query() || !self.can_handle(&query) {
            return Err(query);
        }
        trace!("{} dispatching probe {:?}", self.name, query);

        let digging_position = if self.config.digging_resync {
            let position = self.digging_position();
            self.send(Outbound::CancelDigging { position });
            Some(position)
        } else {
            None
        };

        self.state.estimated_teleport_id += 1;
        let teleport_id = self.state.estimated_teleport_id;

        // Open before the move, so the open reply always precedes the correction.
        if self.config.arzi_mode {
            self.open_storage();
        }
        let window_id = self
            .config
            .tracks_windows()
            .then_some(self.state.estimated_window_id);

        let target = query
            .position()
            .block(8, self.config.probe_height as i32, 8);
        let position = Position::new(
            target.x.clamp(-WORLD_BORDER, WORLD_BORDER) as f64,
            self.config.probe_height,
            target.z.clamp(-WORLD_BORDER, WORLD_BORDER) as f64,
        );

        self.processing.push_back(ProcessingProbe::new(
            query,
            digging_position,
            teleport_id,
            window_id,
        ));

        self.send(Outbound::PositionUpdate {
            position,
            on_ground: false,
        });
        self.send(Outbound::TeleportConfirm { teleport_id });

        self.dispatched_this_tick += 1;
        self.dispatched_total += 1;
        Ok(())
    }

    fn digging_position(&mut self) -> BlockPosition {
        let mut distance = self.config.max_digging_distance - 4;
        let dx = self.rng.i32(5..distance.max(6));
        distance -= dx;
        let dy = if distance <= 0 { 0 } else { self.rng.i32(0..distance) };
        distance -= dy;
        let dz = if distance <= 0 { 0 } else { self.rng.i32(0..distance) };

        let base = self.state.position.block();
        BlockPosition::new(
            base.x.saturating_add(dx),
            base.y.saturating_add(dy),
            base.z.saturating_add(dz),
        )
    }

    /// Send the packets that open the current storage and advance the
    /// predicted window id.
    fn open_storage(&mut self) -> bool {
        let Some(storage) = self.storage.current().cloned() else {
            return false;
        };
        let eyes = self.eyes();
        for packet in storage.open_packets(&eyes, self.state.angle, self.config.swing_arm) {
            if let Outbound::Rotation { angle, .. } = &packet {
                self.state.angle = *angle;
            }
            self.send(packet);
        }

        self.state.estimated_window_id = next_window_id(self.state.estimated_window_id);
        self.pending_opens.push_back(self.state.estimated_window_id);
        self.storage.mark_open_attempt(self.ticks);
        true
    }

    fn send(&mut self, packet: Outbound) {
        self.packet_out(&packet);
        self.transport.send(packet);
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    pub fn tick(&mut self) {
        self.ticks += 1;
        if let Some(current) = self.current.as_mut() {
            current.ticks_elapsed += 1;
        }

        // Time-based recovery needs the server to be talking to us.
        let stalled = self.state.ticks_since_packet > self.config.stall_ticks;

        self.tick_storage();
        if !stalled {
            self.tick_teleport_sync();
            self.tick_window_sync();
        }
        self.tick_queries();

        self.state.ticks_since_packet = self.state.ticks_since_packet.saturating_add(1);
        self.state.ticks_since_teleport = self.state.ticks_since_teleport.saturating_add(1);
        self.state.ticks_since_storage_update =
            self.state.ticks_since_storage_update.saturating_add(1);
        self.state.movement_limit = (self.state.movement_limit - 1).max(-1);

        self.dispatched_this_tick = 0;
        self.refresh_allowance();
    }

    /// Carry the fractional part of the per-tick budget into the next tick.
    fn refresh_allowance(&mut self) {
        let budget = self.carry + self.config.queries_per_tick;
        self.allowance = budget.floor() as u32;
        self.carry = budget.fract();
    }

    fn tick_storage(&mut self) {
        let eyes = self.eyes();
        let action = self.storage.tick(
            &eyes,
            self.ticks,
            self.state.spawned,
            self.state.window_desync,
            &self.config,
        );
        match action {
            StorageAction::Nothing => {}
            StorageAction::Open => {
                trace!("{} is attempting to open storage", self.name);
                self.open_storage();
            }
            StorageAction::OpenTimedOut => {
                warn!("{} failed to open storage (timed out)", self.name);
            }
            StorageAction::Found(storage) => {
                debug!("{} is using storage {}", self.name, storage);
            }
            StorageAction::Missing => {
                warn!("couldn't find a valid storage for {}", self.name);
                self.reports.push(ProbeReport::NoStorage {
                    connection: self.id,
                    name: self.name.clone(),
                    dimension: self.state.dimension,
                });
            }
        }
    }

    fn tick_teleport_sync(&mut self) {
        let expected = self.expected_ticks();
        let since_teleport = self.state.ticks_since_teleport as f32;

        if self.state.teleport_desync {
            if since_teleport > expected
                && self.state.last_teleport_id == self.state.estimated_teleport_id
            {
                info!("{} is probably no longer teleport desynced", self.name);
                self.state.teleport_desync = false;
            } else if since_teleport > expected && self.state.movement_limit < 0 {
                debug!("{} is forcing a teleport id update", self.name);
                self.state.movement_limit = 20;
                // Guaranteed setback: the server answers with a fresh teleport id.
                let position = self.state.position.offset(0.0, 100_000.0, 0.0);
                self.send(Outbound::PositionUpdate {
                    position,
                    on_ground: false,
                });
            }
        } else if self.state.ticks_since_teleport > self.config.idle_ticks
            && self.in_flight() == 0
            && self.state.spawned
        {
            trace!("{} is idling", self.name);
            self.state.ticks_since_teleport = 0;
            let position = self.state.position;
            self.send(Outbound::PositionUpdate {
                position,
                on_ground: false,
            });
        }
    }

    fn tick_window_sync(&mut self) {
        if !self.state.window_desync || self.storage.current().is_none() {
            return;
        }

        let expected = self.expected_ticks();
        if self.state.ticks_since_storage_update as f32 > expected
            && self.state.last_window_id == self.state.estimated_window_id
        {
            info!("{} is probably no longer window desynced", self.name);
            self.state.window_desync = false;
            self.pending_opens.clear();
            return;
        }

        let stale = match self.storage.attempt_age(self.ticks) {
            None => true,
            Some(age) => age > self.config.open_timeout_ticks,
        };
        if !self.storage.is_open() && stale {
            debug!("{} is window desynced, reopening storage", self.name);
            self.open_storage();
        }
    }

    fn tick_queries(&mut self) {
        if self.in_flight() == 0 {
            self.ticks_processing = 0;
            return;
        }

        let expected = (self.state.average_response_ms.max(50.0) / 50.0).ceil() as u32;
        // Silence from the server is waited out, not counted.
        if self.state.ticks_since_packet > expected {
            self.ticks_processing = 0;
        }
        self.ticks_processing += 1;

        if self.ticks_processing > self.config.timeout_base_ticks + expected {
            warn!(
                "{} probe timeout: mlimit={}, preconf={}, in_flight={}, t_p={}",
                self.name,
                self.state.movement_limit,
                self.pre_confirms.len(),
                self.in_flight(),
                self.ticks_processing
            );
            self.ticks_processing = 0;
            self.reschedule_all(RescheduleReason::Timeout);
            self.state.movement_limit = 20;
            self.pre_confirms.clear();
        }
    }

    // -----------------------------------------------------------------------
    // Packets
    // -----------------------------------------------------------------------

    /// Observe a packet this connection (or anything else sharing the
    /// transport) sent.
    pub fn packet_out(&mut self, packet: &Outbound) {
        if let Outbound::TeleportConfirm { teleport_id } = packet {
            // Only ids the server has not issued yet are confirmed ahead of time.
            if !self.state.teleport_desync && *teleport_id > self.state.last_teleport_id {
                self.pre_confirms.push_back(*teleport_id);
            }
        }
    }

    /// Feed one inbound event, in arrival order.
    pub fn packet_in(&mut self, event: &Inbound) {
        self.state.ticks_since_packet = 0;

        match event {
            Inbound::PositionCorrection {
                teleport_id,
                position,
                angle,
            } => {
                self.state.position = *position;
                self.state.angle = *angle;
                self.state.last_teleport_id = *teleport_id;
                if !self.state.spawned {
                    debug!("{} spawned at {}", self.name, position);
                    self.state.spawned = true;
                }
            }
            Inbound::ContainerOpened { window_id } => {
                self.state.last_window_id = *window_id;
            }
            Inbound::LatencyUpdate { millis } => {
                self.state.ping_ms = *millis;
            }
            Inbound::Respawn { dimension } => {
                self.respawn(*dimension);
                return;
            }
            _ => {}
        }

        if let Some(lost) = self.storage.handle(event, &self.config) {
            debug!("{} lost current storage ({})", self.name, lost);
        }
        self.resync_in(event);
        self.classify(event);

        match event {
            Inbound::PositionCorrection { .. } => self.state.ticks_since_teleport = 0,
            Inbound::ContainerOpened { .. } | Inbound::ContainerClosed { .. } => {
                self.state.ticks_since_storage_update = 0
            }
            _ => {}
        }
    }

    fn resync_in(&mut self, event: &Inbound) {
        match event {
            Inbound::PositionCorrection { teleport_id, .. } => {
                let expected = self.pre_confirms.pop_front();
                if expected != Some(*teleport_id) {
                    debug!(
                        "{} unexpected teleport: e_tid={:?}, tid={}, preconf={}, mlimit={}",
                        self.name,
                        expected,
                        teleport_id,
                        self.pre_confirms.len(),
                        self.state.movement_limit
                    );
                    self.pre_confirms.clear();
                    self.state.estimated_teleport_id = *teleport_id;
                    self.state.movement_limit = 10;
                    self.state.teleport_desync = true;
                    self.send(Outbound::TeleportConfirm {
                        teleport_id: *teleport_id,
                    });
                }
            }
            Inbound::ContainerOpened { window_id } => {
                let expected = self.pending_opens.pop_front();
                if self.state.window_desync {
                    self.state.estimated_window_id = *window_id;
                } else if self.config.tracks_windows() && expected != Some(*window_id) {
                    warn!(
                        "{} unexpected window: e_wid={:?}, wid={}",
                        self.name, expected, window_id
                    );
                    self.enter_window_desync();
                    self.state.estimated_window_id = *window_id;
                }
            }
            Inbound::ContainerItems { window_id }
            | Inbound::ContainerProperty { window_id }
            | Inbound::ContainerClosed { window_id }
                if self.state.window_desync && (1..=100).contains(window_id) =>
            {
                self.state.estimated_window_id = *window_id;
            }
            _ => {}
        }
    }

    fn classify(&mut self, event: &Inbound) {
        if self.current.is_none() && self.processing.is_empty() {
            return;
        }
        let ctx = PolicyContext {
            storage_open: self.storage.is_open(),
            tracks_windows: self.config.tracks_windows(),
            arzi_mode: self.config.arzi_mode,
        };

        if self.config.digging_resync {
            if let Inbound::BlockChange { record } = event {
                let boundary = self.processing.front().and_then(|p| p.digging_position);
                if boundary == Some(record.position) {
                    if self.current.is_some() {
                        // The previous probe never completed: the server dropped packets.
                        warn!(
                            "{} missed probe boundary: mlimit={}, preconf={}, in_flight={}",
                            self.name,
                            self.state.movement_limit,
                            self.pre_confirms.len(),
                            self.in_flight()
                        );
                        self.reschedule_all(RescheduleReason::PacketLoss);
                        self.state.movement_limit = 20;
                        self.pre_confirms.clear();
                        return;
                    }
                    self.current = self.processing.pop_front().map(|mut probe| {
                        probe.unsure = false;
                        probe
                    });
                }
            }
        }

        if self.current.is_none() && self.policy.claims(event, &ctx) {
            self.current = self.processing.pop_front();
        }
        let Some(probe) = self.current.as_mut() else {
            return;
        };
        if !matches!(event, Inbound::Chat) {
            probe.packets_elapsed += 1;
        }

        match self.policy.observe(probe, event, &ctx) {
            Verdict::Pending => {}
            Verdict::Loaded => self.finalize(true),
            Verdict::Unloaded => self.finalize(false),
            Verdict::RescheduleCurrent => {
                if let Some(probe) = self.current.take() {
                    trace!(
                        "{} storage is closed, rescheduling probe at {}",
                        self.name,
                        probe.query.position()
                    );
                    self.hand_back(vec![probe.query], RescheduleReason::StorageClosed);
                }
            }
            Verdict::Desync(DesyncKind::Teleport { observed }) => {
                warn!(
                    "{} unexpected setback: tid={}, in_flight={}",
                    self.name,
                    observed,
                    self.in_flight()
                );
                self.reschedule_all(RescheduleReason::TeleportDesync);
                self.pre_confirms.clear();
                if !self.state.teleport_desync {
                    self.state.teleport_desync = true;
                    self.state.estimated_teleport_id = observed;
                    self.state.movement_limit = 10;
                    self.send(Outbound::TeleportConfirm {
                        teleport_id: observed,
                    });
                }
            }
            Verdict::Desync(DesyncKind::Window) => {
                warn!("{} window ordering broken, resyncing", self.name);
                self.enter_window_desync();
            }
        }

        if let Inbound::PositionCorrection { .. } = event {
            // A correction always closes the current probe.
            if let Some(probe) = self.current.take() {
                self.hand_back(vec![probe.query], RescheduleReason::StorageClosed);
            }
            if !self.config.arzi_mode && !self.storage.is_open() {
                // Queued probes will not reopen the storage themselves.
                let rest: Vec<_> = self.processing.drain(..).map(|p| p.query).collect();
                self.hand_back(rest, RescheduleReason::StorageClosed);
                if self.storage.current().is_some() && !self.storage.is_attempting_open() {
                    trace!("{} is attempting to open storage", self.name);
                    self.open_storage();
                }
            }
        }
    }

    fn enter_window_desync(&mut self) {
        self.state.window_desync = true;
        self.pending_opens.clear();
        self.reschedule_all(RescheduleReason::WindowDesync);
    }

    fn respawn(&mut self, dimension: Dimension) {
        let reason = if dimension != self.state.dimension {
            info!(
                "{} changed dimension {} -> {}",
                self.name, self.state.dimension, dimension
            );
            RescheduleReason::DimensionChanged
        } else {
            debug!("{} respawned in {}", self.name, dimension);
            RescheduleReason::Respawn
        };

        self.reschedule_all(reason);
        self.storage.clear();
        self.pre_confirms.clear();
        self.pending_opens.clear();
        self.state.dimension = dimension;
        self.state.spawned = false;
        self.state.teleport_desync = true;
        self.state.window_desync = false;
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    fn finalize(&mut self, loaded: bool) {
        let Some(probe) = self.current.take() else {
            return;
        };
        self.ticks_processing = 0;

        let response_ms = probe.dispatched_at.elapsed().as_secs_f32() * 1000.0;
        self.state.average_response_ms = self.state.average_response_ms * 0.95 + response_ms * 0.05;

        trace!(
            "{} finalised probe: position={}, loaded={}, packets={}, ticks={}, dt={:.0}ms",
            self.name,
            probe.query.position(),
            loaded,
            probe.packets_elapsed,
            probe.ticks_elapsed,
            response_ms
        );
        if probe.digging_position.is_some() && probe.unsure {
            warn!("{} got no digging response for {}", self.name, probe.query.position());
        }

        self.finalised += 1;
        self.completed_total += 1;
        let state = if loaded {
            ChunkLoadState::Loaded
        } else {
            ChunkLoadState::Unloaded
        };
        probe.query.complete(state, QueryOutcome::Resolved);
    }

    fn reschedule_all(&mut self, reason: RescheduleReason) {
        let mut queries: Vec<_> = self.current.take().map(|p| p.query).into_iter().collect();
        queries.extend(self.processing.drain(..).map(|p| p.query));
        self.hand_back(queries, reason);
    }

    fn hand_back(&mut self, queries: Vec<ChunkStateQuery>, reason: RescheduleReason) {
        if queries.is_empty() {
            return;
        }
        debug!(
            "{} {} probes rescheduled ({})",
            self.name,
            queries.len(),
            reason
        );
        self.reports.push(ProbeReport::Rescheduled {
            connection: self.id,
            name: self.name.clone(),
            reason,
            count: queries.len(),
        });
        self.rescheduled.extend(queries);
    }

    /// Hand back everything in flight; the connection is gone.
    pub fn logout(&mut self) {
        debug!("{} logout ({})", self.name, self.state.dimension);
        self.reschedule_all(RescheduleReason::Logout);
        self.pre_confirms.clear();
        self.pending_opens.clear();
    }

    // -----------------------------------------------------------------------
    // Outputs
    // -----------------------------------------------------------------------

    pub fn take_rescheduled(&mut self) -> Vec<ChunkStateQuery> {
        std::mem::take(&mut self.rescheduled)
    }

    pub fn take_reports(&mut self) -> Vec<ProbeReport> {
        std::mem::take(&mut self.reports)
    }

    /// Probes finalised since the last call.
    pub fn take_finalised(&mut self) -> u32 {
        std::mem::take(&mut self.finalised)
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let can_query = self.can_query();
        ConnectionSnapshot {
            id: self.id,
            dimension: self.state.dimension,
            can_query,
            capacity: if can_query { self.capacity() } else { 0 },
            in_flight: self.in_flight(),
            teleport_desync: self.state.teleport_desync,
            window_desync: self.state.window_desync,
            has_storage: self.storage.current().is_some(),
            storage_open: self.storage.is_open(),
            spawned: self.state.spawned,
            dispatched_total: self.dispatched_total,
            completed_total: self.completed_total,
        }
    }
}

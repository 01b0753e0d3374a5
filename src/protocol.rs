//! Messages that cross the engine boundary.
//!
//! | Type           | Direction                        | Peer                     |
//! |----------------|----------------------------------|--------------------------|
//! | [`Inbound`]    | transport → connection           | per-connection, in order |
//! | [`Outbound`]   | connection → transport           | per-connection, in order |
//! | [`ProbeReport`]| engine → reporting collaborator  | `probe.report.*`         |
//! | [`ChunkStateEvent`] | engine → orchestration      | `probe.chunk.state`      |
//!
//! The game wire format itself belongs to the transport; these are already
//! decoded, typed events.

use crate::types::{
    Angle, BlockPosition, ChunkLoadState, ChunkPosition, ConnectionId, Dimension, Position,
};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

/// A single block state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChangeRecord {
    pub position: BlockPosition,
    pub block_id: u32,
}

/// A block entity carried in a chunk data packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntity {
    pub position: BlockPosition,
    /// Namespaced id, e.g. `minecraft:chest`.
    pub id: String,
}

/// Every server → client event the engine reacts to.
///
/// Closed on purpose: classification and locator logic match exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Server moved us, carrying the teleport id it expects acknowledged.
    PositionCorrection {
        teleport_id: i32,
        position: Position,
        angle: Angle,
    },
    ContainerOpened {
        window_id: i32,
    },
    ContainerItems {
        window_id: i32,
    },
    ContainerProperty {
        window_id: i32,
    },
    ContainerClosed {
        window_id: i32,
    },
    BlockChange {
        record: BlockChangeRecord,
    },
    MultiBlockChange {
        records: Vec<BlockChangeRecord>,
    },
    ChunkData {
        position: ChunkPosition,
        block_entities: Vec<BlockEntity>,
    },
    ChunkUnload {
        position: ChunkPosition,
    },
    EntitySpawn {
        entity_id: i32,
        kind: String,
        position: Position,
    },
    EntityDestroy {
        entity_ids: Vec<i32>,
    },
    /// The connection was moved to another (or the same) dimension.
    Respawn {
        dimension: Dimension,
    },
    /// Latency reported by the server for this connection.
    LatencyUpdate {
        millis: u32,
    },
    /// Chat traffic; never counted as a probe response packet.
    Chat,
    /// Any other packet. Only proves the server is still talking.
    KeepAlive,
}

impl Inbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::PositionCorrection { .. } => "position_correction",
            Inbound::ContainerOpened { .. } => "container_opened",
            Inbound::ContainerItems { .. } => "container_items",
            Inbound::ContainerProperty { .. } => "container_property",
            Inbound::ContainerClosed { .. } => "container_closed",
            Inbound::BlockChange { .. } => "block_change",
            Inbound::MultiBlockChange { .. } => "multi_block_change",
            Inbound::ChunkData { .. } => "chunk_data",
            Inbound::ChunkUnload { .. } => "chunk_unload",
            Inbound::EntitySpawn { .. } => "entity_spawn",
            Inbound::EntityDestroy { .. } => "entity_destroy",
            Inbound::Respawn { .. } => "respawn",
            Inbound::LatencyUpdate { .. } => "latency_update",
            Inbound::Chat => "chat",
            Inbound::KeepAlive => "keep_alive",
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound packets
// ---------------------------------------------------------------------------

/// Every client → server packet the engine sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outbound {
    PositionUpdate { position: Position, on_ground: bool },
    Rotation { angle: Angle, on_ground: bool },
    TeleportConfirm { teleport_id: i32 },
    /// Right-click a block (opens container blocks).
    UseBlock { position: BlockPosition },
    SwingArm,
    /// Right-click an entity (opens chested entities).
    InteractEntity { entity_id: i32 },
    CancelDigging { position: BlockPosition },
}

// ---------------------------------------------------------------------------
// Reports  (subjects: probe.report.*)
// ---------------------------------------------------------------------------

/// Why in-flight probes were handed back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RescheduleReason {
    /// Correction arrived with a teleport id we did not expect.
    TeleportDesync,
    /// Window ids or open/close ordering contradicted the prediction.
    WindowDesync,
    /// No classification inside the timeout window.
    Timeout,
    /// Probe boundary arrived while a previous probe was unresolved.
    PacketLoss,
    /// Storage was closed so the probe could not be classified.
    StorageClosed,
    /// The connection refused a dispatch it could no longer accept.
    Rejected,
    Logout,
    DimensionChanged,
    /// Respawned in the same dimension; the world view was reset.
    Respawn,
}

impl std::fmt::Display for RescheduleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RescheduleReason::TeleportDesync => "teleport_desync",
            RescheduleReason::WindowDesync => "window_desync",
            RescheduleReason::Timeout => "timeout",
            RescheduleReason::PacketLoss => "packet_loss",
            RescheduleReason::StorageClosed => "storage_closed",
            RescheduleReason::Rejected => "rejected",
            RescheduleReason::Logout => "logout",
            RescheduleReason::DimensionChanged => "dimension_changed",
            RescheduleReason::Respawn => "respawn",
        };
        f.write_str(s)
    }
}

/// Operator-facing events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeReport {
    /// No usable storage near the connection; it accepts no new probes.
    NoStorage {
        connection: ConnectionId,
        name: String,
        dimension: Dimension,
    },
    /// A batch of queries was handed back for rescheduling.
    Rescheduled {
        connection: ConnectionId,
        name: String,
        reason: RescheduleReason,
        count: usize,
    },
    /// Queries are waiting in a dimension no connection is in.
    DimensionUnavailable {
        dimension: Dimension,
        waiting: usize,
    },
}

impl ProbeReport {
    pub fn subject(&self) -> &'static str {
        match self {
            ProbeReport::NoStorage { .. } => subjects::REPORT_NO_STORAGE,
            ProbeReport::Rescheduled { .. } => subjects::REPORT_RESCHEDULED,
            ProbeReport::DimensionUnavailable { .. } => subjects::REPORT_DIMENSION_UNAVAILABLE,
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk state  (subject: probe.chunk.state)
// ---------------------------------------------------------------------------

/// How a query reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    /// Classified by a probe.
    Resolved,
    /// Dropped before classification (expired or cancelled).
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkStateEvent {
    pub dimension: Dimension,
    pub position: ChunkPosition,
    pub state: ChunkLoadState,
    pub outcome: QueryOutcome,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Every published message is wrapped in this envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeEvent<T> {
    pub server: String,
    pub tick: u64,
    pub payload: T,
}

impl<T> ProbeEvent<T> {
    pub fn new(server: impl Into<String>, tick: u64, payload: T) -> Self {
        Self {
            server: server.into(),
            tick,
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Subject names
// ---------------------------------------------------------------------------

pub mod subjects {
    pub const CHUNK_STATE: &str = "probe.chunk.state";
    pub const METRICS: &str = "probe.metrics";
    pub const REPORT_NO_STORAGE: &str = "probe.report.no_storage";
    pub const REPORT_RESCHEDULED: &str = "probe.report.rescheduled";
    pub const REPORT_DIMENSION_UNAVAILABLE: &str = "probe.report.dimension_unavailable";
}

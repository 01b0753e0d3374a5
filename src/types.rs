//! Core value types shared across all modules.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Dimensions
// ---------------------------------------------------------------------------

/// One of the three game dimensions. The set is fixed.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Overworld,
    Nether,
    End,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::Overworld, Dimension::Nether, Dimension::End];

    /// Map the protocol's numeric dimension id (-1, 0, 1), clamping anything else.
    pub fn from_protocol(id: i32) -> Self {
        match id.clamp(-1, 1) {
            -1 => Dimension::Nether,
            0 => Dimension::Overworld,
            _ => Dimension::End,
        }
    }

    pub fn protocol_id(self) -> i32 {
        match self {
            Dimension::Overworld => 0,
            Dimension::Nether => -1,
            Dimension::End => 1,
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Dimension::Overworld => "overworld",
            Dimension::Nether => "nether",
            Dimension::End => "end",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// Integer chunk coordinate (16x16 block columns).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChunkPosition {
    pub x: i32,
    pub z: i32,
}

impl ChunkPosition {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Block position at the given offset inside this chunk. Saturates at
    /// the `i32` range for chunks no world can hold.
    pub fn block(&self, dx: i32, y: i32, dz: i32) -> BlockPosition {
        BlockPosition::new(
            self.x.saturating_mul(16).saturating_add(dx),
            y,
            self.z.saturating_mul(16).saturating_add(dz),
        )
    }
}

impl std::fmt::Display for ChunkPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.x, self.z)
    }
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct BlockPosition {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPosition {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn chunk(&self) -> ChunkPosition {
        ChunkPosition::new(self.x >> 4, self.z >> 4)
    }

    pub fn center(&self) -> Position {
        Position::new(
            self.x as f64 + 0.5,
            self.y as f64 + 0.5,
            self.z as f64 + 0.5,
        )
    }
}

impl std::fmt::Display for BlockPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{},{}]", self.x, self.y, self.z)
    }
}

/// Continuous world position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn offset(&self, dx: f64, dy: f64, dz: f64) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z + dz)
    }

    pub fn distance_squared(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    pub fn block(&self) -> BlockPosition {
        BlockPosition::new(
            self.x.floor() as i32,
            self.y.floor() as i32,
            self.z.floor() as i32,
        )
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

/// View angle in degrees. Yaw is wrapped to [-180, 180), pitch clamped to [-90, 90].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Angle {
    pub yaw: f32,
    pub pitch: f32,
}

impl Angle {
    pub fn new(yaw: f32, pitch: f32) -> Self {
        let mut yaw = yaw % 360.0;
        if yaw >= 180.0 {
            yaw -= 360.0;
        } else if yaw < -180.0 {
            yaw += 360.0;
        }
        Self {
            yaw,
            pitch: (pitch % 180.0).clamp(-90.0, 90.0),
        }
    }

    /// Angle needed to look from `eyes` at `target`.
    pub fn looking_at(eyes: &Position, target: &Position) -> Self {
        let dx = target.x - eyes.x;
        let dy = target.y - eyes.y;
        let dz = target.z - eyes.z;
        let horizontal = (dx * dx + dz * dz).sqrt();
        Self::new(
            dz.atan2(dx).to_degrees() as f32 - 90.0,
            -(dy.atan2(horizontal).to_degrees() as f32),
        )
    }
}

impl std::fmt::Display for Angle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(yaw={:.1}, pitch={:.1})", self.yaw, self.pitch)
    }
}

// ---------------------------------------------------------------------------
// Query classification
// ---------------------------------------------------------------------------

/// Residency classification of one chunk.
///
/// `Waiting` is the only non-terminal state; a query leaves it exactly once.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkLoadState {
    Waiting,
    Loaded,
    Unloaded,
}

impl ChunkLoadState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ChunkLoadState::Waiting)
    }
}

/// Scheduling weight of a query.
///
/// The derived `Ord` is declaration order (`Low < Medium < High`). It says nothing
/// about which one is served first; that is decided by
/// [`PriorityOrder`](crate::query::PriorityOrder).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// Identifies one bot connection across schedulers.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

//! In-process stand-in for a game server.
//!
//! Answers the engine's outbound packets the way the anti-cheat does: an
//! out-of-range move is set back with a fresh teleport id, and if the target
//! chunk is loaded the open storage session is closed first. Used by the
//! simulator binary and by end-to-end tests.

use crate::protocol::{BlockChangeRecord, BlockEntity, Inbound, Outbound};
use crate::storage::REACH_SQUARED;
use crate::types::{Angle, BlockPosition, ChunkPosition, Position};

/// Moves further than this from the bot are rejected.
const MAX_MOVE_SQUARED: f64 = 100.0;

type LoadedFn = Box<dyn Fn(ChunkPosition) -> bool + Send + Sync>;

/// One bot's view of a simulated server.
pub struct SimulatedServer {
    position: Position,
    angle: Angle,
    storage: BlockPosition,
    storage_name: String,
    loaded: LoadedFn,
    teleport_id: i32,
    window_id: i32,
    open_window: Option<i32>,
}

impl SimulatedServer {
    /// A bot standing at `position` next to a chest at `storage`.
    pub fn new(
        position: Position,
        storage: BlockPosition,
        loaded: impl Fn(ChunkPosition) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            position,
            angle: Angle::default(),
            storage,
            storage_name: "minecraft:chest".into(),
            loaded: Box::new(loaded),
            teleport_id: 0,
            window_id: 0,
            open_window: None,
        }
    }

    /// Chunks within `radius` (Chebyshev, in chunks) of `center` are loaded.
    pub fn loaded_within(center: ChunkPosition, radius: i32) -> impl Fn(ChunkPosition) -> bool {
        move |chunk: ChunkPosition| {
            (chunk.x - center.x).abs() <= radius && (chunk.z - center.z).abs() <= radius
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn teleport_id(&self) -> i32 {
        self.teleport_id
    }

    pub fn window_id(&self) -> i32 {
        self.window_id
    }

    pub fn open_window(&self) -> Option<i32> {
        self.open_window
    }

    /// What the server sends on join: the chunk holding the storage, then the
    /// spawn position.
    pub fn join(&mut self) -> Vec<Inbound> {
        self.teleport_id += 1;
        vec![
            Inbound::ChunkData {
                position: self.storage.chunk(),
                block_entities: vec![BlockEntity {
                    position: self.storage,
                    id: self.storage_name.clone(),
                }],
            },
            self.correction(),
        ]
    }

    /// Sent every game tick regardless of traffic.
    pub fn tick(&mut self) -> Vec<Inbound> {
        vec![Inbound::KeepAlive]
    }

    pub fn handle(&mut self, packet: &Outbound) -> Vec<Inbound> {
        let mut replies = Vec::new();
        match packet {
            Outbound::UseBlock { position } => {
                let eyes = self.position.offset(0.0, crate::storage::EYE_HEIGHT, 0.0);
                if *position == self.storage
                    && position.center().distance_squared(&eyes) < REACH_SQUARED
                {
                    if let Some(previous) = self.open_window.take() {
                        replies.push(Inbound::ContainerClosed {
                            window_id: previous,
                        });
                    }
                    self.window_id = self.window_id % 100 + 1;
                    self.open_window = Some(self.window_id);
                    replies.push(Inbound::ContainerOpened {
                        window_id: self.window_id,
                    });
                    replies.push(Inbound::ContainerItems {
                        window_id: self.window_id,
                    });
                }
                // The block is resent regardless of the outcome.
                replies.push(Inbound::BlockChange {
                    record: BlockChangeRecord {
                        position: *position,
                        block_id: 54,
                    },
                });
            }
            Outbound::PositionUpdate { position, .. } => {
                if position.distance_squared(&self.position) > MAX_MOVE_SQUARED {
                    let target = position.block().chunk();
                    if (self.loaded)(target) {
                        if let Some(window) = self.open_window.take() {
                            replies.push(Inbound::ContainerClosed { window_id: window });
                        }
                    }
                    self.teleport_id += 1;
                    replies.push(self.correction());
                }
            }
            Outbound::Rotation { angle, .. } => self.angle = *angle,
            Outbound::CancelDigging { position } => {
                replies.push(Inbound::BlockChange {
                    record: BlockChangeRecord {
                        position: *position,
                        block_id: 0,
                    },
                });
            }
            Outbound::TeleportConfirm { .. }
            | Outbound::SwingArm
            | Outbound::InteractEntity { .. } => {}
        }
        replies
    }

    fn correction(&self) -> Inbound {
        Inbound::PositionCorrection {
            teleport_id: self.teleport_id,
            position: self.position,
            angle: self.angle,
        }
    }
}

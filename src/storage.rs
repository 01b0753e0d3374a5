//! Storage subsystem: interactive objects near a connection that can be
//! opened and closed as the probe's side channel, plus the locator that keeps
//! them current from world-change events.

use crate::config::ProbeConfig;
use crate::protocol::{BlockChangeRecord, Inbound, Outbound};
use crate::types::{Angle, BlockPosition, ChunkPosition, Position};
use std::collections::HashMap;

/// Squared interaction reach, measured from the eyes.
pub const REACH_SQUARED: f64 = 25.0;

/// Eye offset above the feet position.
pub const EYE_HEIGHT: f64 = 1.53;

// ---------------------------------------------------------------------------
// Storage kinds
// ---------------------------------------------------------------------------

/// A container block (chest, hopper …).
#[derive(Debug, Clone, PartialEq)]
pub struct BlockStorage {
    pub position: BlockPosition,
    /// Namespaced block id.
    pub name: String,
}

impl BlockStorage {
    pub fn new(position: BlockPosition, name: impl Into<String>) -> Self {
        Self {
            position,
            name: name.into(),
        }
    }
}

/// A chested entity (donkey, chest minecart …).
#[derive(Debug, Clone, PartialEq)]
pub struct EntityStorage {
    pub entity_id: i32,
    pub kind: String,
    pub position: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Block,
    Entity,
}

/// Anything the locator can hand to a connection as its side channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    Block(BlockStorage),
    Entity(EntityStorage),
}

impl Storage {
    pub fn kind(&self) -> StorageKind {
        match self {
            Storage::Block(_) => StorageKind::Block,
            Storage::Entity(_) => StorageKind::Entity,
        }
    }

    fn target(&self) -> Position {
        match self {
            Storage::Block(b) => b.position.center(),
            Storage::Entity(e) => e.position,
        }
    }

    /// Within reach of `eyes`.
    pub fn is_valid(&self, eyes: &Position) -> bool {
        self.target().distance_squared(eyes) < REACH_SQUARED
    }

    /// View angle a block interaction must be aimed with. Entities need none.
    pub fn required_angle(&self, eyes: &Position) -> Option<Angle> {
        match self {
            Storage::Block(b) => Some(Angle::looking_at(eyes, &b.position.center())),
            Storage::Entity(_) => None,
        }
    }

    /// Packets that attempt to open this storage, given the current view angle.
    pub fn open_packets(&self, eyes: &Position, angle: Angle, swing_arm: bool) -> Vec<Outbound> {
        match self {
            Storage::Block(b) => {
                let mut packets = Vec::with_capacity(3);
                if let Some(required) = self.required_angle(eyes) {
                    if required != angle {
                        packets.push(Outbound::Rotation {
                            angle: required,
                            on_ground: false,
                        });
                    }
                }
                packets.push(Outbound::UseBlock {
                    position: b.position,
                });
                if swing_arm {
                    packets.push(Outbound::SwingArm);
                }
                packets
            }
            Storage::Entity(e) => vec![Outbound::InteractEntity {
                entity_id: e.entity_id,
            }],
        }
    }
}

impl std::fmt::Display for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Storage::Block(b) => write!(f, "block {} at {}", b.name, b.position),
            Storage::Entity(e) => write!(f, "entity {} ({}) at {}", e.entity_id, e.kind, e.position),
        }
    }
}

// ---------------------------------------------------------------------------
// Locator
// ---------------------------------------------------------------------------

/// Outcome of one locator tick.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageAction {
    Nothing,
    /// The current storage should be opened now.
    Open,
    /// The last open attempt got no reply in time; it will be retried.
    OpenTimedOut,
    /// A new storage was selected.
    Found(Storage),
    /// Discovery ran and nothing usable is in reach.
    Missing,
}

/// Tracks storage candidates around one connection.
pub struct StorageLocator {
    blocks: HashMap<BlockPosition, BlockStorage>,
    entities: HashMap<i32, EntityStorage>,
    current: Option<Storage>,
    /// Where the last correction put the bot.
    position: Option<Position>,
    dirty: bool,
    just_found: bool,
    open: bool,
    attempt_open: Option<u64>,
}

impl StorageLocator {
    pub fn new() -> Self {
        Self {
            blocks: HashMap::new(),
            entities: HashMap::new(),
            current: None,
            position: None,
            dirty: false,
            just_found: false,
            open: false,
            attempt_open: None,
        }
    }

    pub fn current(&self) -> Option<&Storage> {
        self.current.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_attempting_open(&self) -> bool {
        self.attempt_open.is_some()
    }

    /// Ticks since the pending open attempt was made.
    pub fn attempt_age(&self, now: u64) -> Option<u64> {
        self.attempt_open.map(|at| now.saturating_sub(at))
    }

    pub fn mark_open_attempt(&mut self, tick: u64) {
        self.attempt_open = Some(tick);
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Forget every candidate (logout / dimension change).
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.entities.clear();
        self.current = None;
        self.position = None;
        self.open = false;
        self.attempt_open = None;
        self.just_found = false;
        self.dirty = false;
    }

    // -----------------------------------------------------------------------
    // World-change events
    // -----------------------------------------------------------------------

    /// Apply a world-change event. Returns the storage in use if this event
    /// invalidated it.
    pub fn handle(&mut self, event: &Inbound, config: &ProbeConfig) -> Option<Storage> {
        match event {
            Inbound::ChunkData {
                position,
                block_entities,
            } => {
                let lost = self.remove_chunk(*position);
                for entity in block_entities {
                    if config.is_storage_block_name(&entity.id) {
                        self.blocks.insert(
                            entity.position,
                            BlockStorage::new(entity.position, entity.id.clone()),
                        );
                        self.dirty = true;
                    }
                }
                lost
            }
            Inbound::ChunkUnload { position } => self.remove_chunk(*position),
            Inbound::BlockChange { record } => self.handle_record(record, config),
            Inbound::MultiBlockChange { records } => {
                let mut lost = None;
                for record in records {
                    if let Some(storage) = self.handle_record(record, config) {
                        lost = Some(storage);
                    }
                }
                lost
            }
            Inbound::EntitySpawn {
                entity_id,
                kind,
                position,
            } => {
                if config.is_storage_entity(kind) {
                    self.entities.insert(
                        *entity_id,
                        EntityStorage {
                            entity_id: *entity_id,
                            kind: kind.clone(),
                            position: *position,
                        },
                    );
                    self.dirty = true;
                }
                None
            }
            Inbound::EntityDestroy { entity_ids } => {
                let mut lost = None;
                for id in entity_ids {
                    if let Some(entity) = self.entities.remove(id) {
                        self.dirty = true;
                        let storage = Storage::Entity(entity);
                        if self.is_current(&storage) {
                            lost = self.current.take();
                        }
                    }
                }
                lost
            }
            Inbound::PositionCorrection { position, .. } => {
                // Candidates already known may have come into reach.
                if self.position != Some(*position) {
                    self.position = Some(*position);
                    self.dirty = true;
                }
                None
            }
            Inbound::ContainerOpened { .. } => {
                self.open = true;
                self.attempt_open = None;
                None
            }
            Inbound::ContainerClosed { .. } => {
                self.open = false;
                self.attempt_open = None;
                None
            }
            _ => None,
        }
    }

    fn handle_record(&mut self, record: &BlockChangeRecord, config: &ProbeConfig) -> Option<Storage> {
        let name = config.storage_block_name(record.block_id);
        match (self.blocks.contains_key(&record.position), name) {
            (true, None) => {
                self.dirty = true;
                let removed = self.blocks.remove(&record.position)?;
                let storage = Storage::Block(removed);
                if self.is_current(&storage) {
                    return self.current.take();
                }
                None
            }
            (false, Some(name)) => {
                self.blocks
                    .insert(record.position, BlockStorage::new(record.position, name));
                self.dirty = true;
                None
            }
            _ => None,
        }
    }

    fn remove_chunk(&mut self, chunk: ChunkPosition) -> Option<Storage> {
        let before = self.blocks.len();
        self.blocks.retain(|pos, _| pos.chunk() != chunk);
        if self.blocks.len() == before {
            return None;
        }
        self.dirty = true;

        let current_gone = matches!(
            &self.current,
            Some(Storage::Block(b)) if b.position.chunk() == chunk
        );
        if current_gone {
            self.current.take()
        } else {
            None
        }
    }

    fn is_current(&self, storage: &Storage) -> bool {
        match (&self.current, storage) {
            (Some(Storage::Block(a)), Storage::Block(b)) => a.position == b.position,
            (Some(Storage::Entity(a)), Storage::Entity(b)) => a.entity_id == b.entity_id,
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Keep the current storage valid and open, or rediscover one.
    pub fn tick(
        &mut self,
        eyes: &Position,
        now: u64,
        spawned: bool,
        window_desync: bool,
        config: &ProbeConfig,
    ) -> StorageAction {
        if let Some(current) = &self.current {
            if current.is_valid(eyes) {
                // Window desync recovery owns the open attempts.
                if window_desync {
                    return StorageAction::Nothing;
                }
                if !self.open {
                    match self.attempt_open {
                        None if !config.arzi_mode || self.just_found => {
                            return StorageAction::Open;
                        }
                        Some(at) if now.saturating_sub(at) > config.open_timeout_ticks => {
                            self.attempt_open = None;
                            return StorageAction::OpenTimedOut;
                        }
                        _ => {}
                    }
                } else if self.just_found {
                    self.just_found = false;
                }
                return StorageAction::Nothing;
            }
        }

        if self.current.take().is_some() {
            self.dirty = true;
        }
        self.open = false;
        self.attempt_open = None;

        if !self.dirty || !spawned {
            return StorageAction::Nothing;
        }
        self.dirty = false;

        match self.find(eyes, config.use_entity_storages) {
            Some(storage) => {
                self.current = Some(storage.clone());
                self.just_found = true;
                StorageAction::Found(storage)
            }
            None => StorageAction::Missing,
        }
    }

    /// Nearest valid candidate.
    fn find(&self, eyes: &Position, prefer_entities: bool) -> Option<Storage> {
        let nearest = |candidates: Vec<Storage>| {
            candidates
                .into_iter()
                .filter(|s| s.is_valid(eyes))
                .min_by(|a, b| {
                    a.target()
                        .distance_squared(eyes)
                        .total_cmp(&b.target().distance_squared(eyes))
                })
        };

        if prefer_entities && !self.entities.is_empty() {
            let entities = self.entities.values().cloned().map(Storage::Entity).collect();
            if let Some(found) = nearest(entities) {
                return Some(found);
            }
        }
        nearest(self.blocks.values().cloned().map(Storage::Block).collect())
    }
}

impl Default for StorageLocator {
    fn default() -> Self {
        Self::new()
    }
}

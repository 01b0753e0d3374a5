//! Statically declared configuration for every component.
//!
//! Built once at startup (TOML file and/or `PROBE_*` environment variables via
//! the `config` crate) and handed to components by `Arc`.

use crate::error::ConfigError;
use crate::policy;
use crate::query::PriorityOrder;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything the engine needs, grouped by component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub router: RouterConfig,
    pub scheduler: SchedulerConfig,
    pub probe: ProbeConfig,
    pub agent: AgentConfig,
}

impl EngineConfig {
    /// Load defaults, then the optional TOML file, then `PROBE_` environment
    /// overrides (`PROBE_PROBE__QUERIES_PER_TICK=2`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("PROBE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: EngineConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let qpt = self.probe.queries_per_tick;
        if qpt.is_nan() || qpt <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "probe.queries_per_tick must be positive, got {}",
                self.probe.queries_per_tick
            )));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.tick_interval_ms must be non-zero".into(),
            ));
        }
        if self.scheduler.qps_window_ticks == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.qps_window_ticks must be non-zero".into(),
            ));
        }
        if policy::lookup(&self.probe.policy).is_none() {
            return Err(ConfigError::Invalid(format!(
                "unknown classification policy '{}' (known: {})",
                self.probe.policy,
                policy::names().join(", ")
            )));
        }
        if self.probe.digging_resync && self.probe.max_digging_distance < 10 {
            return Err(ConfigError::Invalid(
                "probe.max_digging_distance must be at least 10 with digging resync".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Out-of-range movement probing.
    pub invalid_move_enabled: bool,
    /// Digging-based probing. Reserved; no scheduler implements it.
    pub digging_enabled: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            invalid_move_enabled: true,
            digging_enabled: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Length of one scheduler tick.
    pub tick_interval_ms: u64,
    /// Which end of the priority scale is served first.
    pub priority_order: PriorityOrder,
    /// Trailing window for the queries/second metric.
    pub qps_window_ticks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 50,
            priority_order: PriorityOrder::HighestFirst,
            qps_window_ticks: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection probing
// ---------------------------------------------------------------------------

/// A block id the locator accepts as a storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageBlock {
    pub id: u32,
    pub name: String,
}

impl StorageBlock {
    fn new(id: u32, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Probes dispatched per tick per connection. Fractions carry over.
    pub queries_per_tick: f32,
    /// Open the storage right before every probe.
    pub arzi_mode: bool,
    /// Predict window ids per probe (only meaningful with `arzi_mode`).
    pub window_tracking: bool,
    /// Swing the arm when opening a block storage.
    pub swing_arm: bool,
    /// Mark probe boundaries with a cancel-digging round trip.
    pub digging_resync: bool,
    pub max_digging_distance: i32,
    /// Prefer entity storages over block storages when any are known.
    pub use_entity_storages: bool,
    /// Name of the classification policy, one of [`policy::names`].
    pub policy: String,
    /// Y coordinate of the out-of-range position update.
    pub probe_height: f64,
    /// Ticks added to the round-trip estimate before in-flight probes time out.
    pub timeout_base_ticks: u32,
    /// Ticks to wait for a storage open reply before retrying.
    pub open_timeout_ticks: u64,
    /// Idle ticks before a keep-sync movement packet is sent.
    pub idle_ticks: u32,
    /// Ticks of server silence after which time-based logic pauses.
    pub stall_ticks: u32,
    pub storage_blocks: Vec<StorageBlock>,
    pub storage_entities: Vec<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            queries_per_tick: 1.0,
            arzi_mode: true,
            window_tracking: true,
            swing_arm: true,
            digging_resync: false,
            max_digging_distance: 16,
            use_entity_storages: false,
            policy: policy::DEFAULT_POLICY.to_string(),
            probe_height: 100_000.0,
            timeout_base_ticks: 40,
            open_timeout_ticks: 100,
            idle_ticks: 20,
            stall_ticks: 2,
            storage_blocks: vec![
                StorageBlock::new(23, "minecraft:dispenser"),
                StorageBlock::new(54, "minecraft:chest"),
                StorageBlock::new(130, "minecraft:ender_chest"),
                StorageBlock::new(154, "minecraft:hopper"),
                StorageBlock::new(158, "minecraft:dropper"),
            ],
            storage_entities: vec![
                "donkey".into(),
                "mule".into(),
                "llama".into(),
                "chest_minecart".into(),
            ],
        }
    }
}

impl ProbeConfig {
    pub fn storage_block_name(&self, id: u32) -> Option<&str> {
        self.storage_blocks
            .iter()
            .find(|b| b.id == id)
            .map(|b| b.name.as_str())
    }

    pub fn is_storage_block_name(&self, name: &str) -> bool {
        self.storage_blocks.iter().any(|b| b.name == name)
    }

    pub fn is_storage_entity(&self, kind: &str) -> bool {
        self.storage_entities.iter().any(|e| e == kind)
    }

    /// Whether each probe carries its own predicted window id.
    pub fn tracks_windows(&self) -> bool {
        self.arzi_mode && self.window_tracking
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Server label stamped on every published event.
    pub server: String,
    /// Publish metrics every N ticks.
    pub metrics_every_ticks: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: "localhost:25565".into(),
            metrics_every_ticks: 20,
        }
    }
}

//! Chunk Probe Engine
//!
//! Decides whether a remote chunk is loaded on a game server by sending an
//! out-of-range movement packet and correlating the anti-cheat setback with
//! an open storage window (the ARZI method).
//!
//! ## Architecture
//!
//! ```text
//! ProbeAgent  (agent.rs)             ← tick loop, publishes events
//!   └── DimensionQueryRouter  (router.rs)
//!         └── ProbeScheduler  (scheduler.rs)   one per dimension
//!               └── ConnectionHandle  (actor.rs)   one task per bot
//!                     └── ProbeConnection  (connection.rs)
//!                           ├── StorageLocator       (storage.rs)
//!                           └── ClassificationPolicy (policy.rs)
//! ```
//!
//! The transport (login, wire codec) is not part of this crate: callers feed
//! decoded [`protocol::Inbound`] events in and receive
//! [`protocol::Outbound`] packets through a [`connection::Transport`].
//! [`sim::SimulatedServer`] stands in for a real server.

pub mod actor;
pub mod config;
pub mod connection;
pub mod error;
pub mod policy;
pub mod protocol;
pub mod query;
pub mod router;
pub mod scheduler;
pub mod sim;
pub mod storage;
pub mod types;

// Tick loop and event publishing require the `server` feature.
#[cfg(feature = "server")]
pub mod agent;

#[cfg(feature = "server")]
pub use agent::{ChannelPublisher, LogPublisher, ProbeAgent, Publisher};
pub use config::{EngineConfig, ProbeConfig, SchedulerConfig};
pub use connection::{ProbeConnection, Transport};
pub use error::{ConfigError, ProbeError};
pub use query::{ChunkStateQuery, PriorityOrder, QueryHandle};
pub use router::DimensionQueryRouter;
pub use scheduler::{ProbeScheduler, SchedulerMetrics};
pub use types::{ChunkLoadState, ChunkPosition, ConnectionId, Dimension, Priority};

//! chunk-probe-sim binary
//!
//! Runs the probe engine against in-process simulated servers: logs in a few
//! bots, probes every chunk in a square around the origin and publishes the
//! classifications to the log.
//!
//! ## Configuration (env / TOML via `config` crate)
//!
//! | Key                              | Default           | Description                     |
//! |----------------------------------|-------------------|---------------------------------|
//! | `PROBE_SCHEDULER__TICK_INTERVAL_MS` | `50`           | Scheduler tick length           |
//! | `PROBE_PROBE__QUERIES_PER_TICK`  | `1.0`             | Probes per tick per bot         |
//! | `PROBE_PROBE__POLICY`            | `close-window`    | Classification policy           |
//! | `PROBE_AGENT__SERVER`            | `localhost:25565` | Server label on published events |

use anyhow::{Context, Result};
use chunk_probe::{
    agent::{LogPublisher, ProbeAgent},
    config::EngineConfig,
    protocol::Outbound,
    query::ChunkStateQuery,
    router::DimensionQueryRouter,
    sim::SimulatedServer,
    types::{BlockPosition, ChunkLoadState, ChunkPosition, ConnectionId, Dimension, Position, Priority},
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "chunk-probe-sim", about = "Chunk-load probe simulator", version)]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "PROBE_CONFIG")]
    config: Option<PathBuf>,

    /// Number of simulated bot connections
    #[arg(long, env = "PROBE_BOTS", default_value_t = 2)]
    bots: u64,

    /// Probe every chunk within this radius of the origin
    #[arg(long, env = "PROBE_RADIUS", default_value_t = 4)]
    radius: i32,

    /// Chunks within this radius are loaded on the simulated server
    #[arg(long, env = "PROBE_LOADED_RADIUS", default_value_t = 2)]
    loaded_radius: i32,

    /// Stop after this many scheduler ticks
    #[arg(long, env = "PROBE_TICKS", default_value_t = 600)]
    ticks: u32,
}

// ---------------------------------------------------------------------------
// Simulated bots
// ---------------------------------------------------------------------------

async fn run_bot(
    router: Arc<DimensionQueryRouter>,
    id: ConnectionId,
    mut server: SimulatedServer,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    tick_interval: Duration,
) -> Result<()> {
    for event in server.join() {
        router.packet_in(id, event)?;
    }

    let mut timer = tokio::time::interval(tick_interval);
    loop {
        tokio::select! {
            packet = outbound.recv() => {
                let Some(packet) = packet else { break };
                for event in server.handle(&packet) {
                    router.packet_in(id, event)?;
                }
            }
            _ = timer.tick() => {
                for event in server.tick() {
                    router.packet_in(id, event)?;
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chunk_probe=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = EngineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    log::info!(
        "Starting chunk-probe-sim (bots={}, radius={}, loaded_radius={}, policy='{}')",
        args.bots,
        args.radius,
        args.loaded_radius,
        config.probe.policy,
    );

    let router = Arc::new(DimensionQueryRouter::new(&config)?);
    let tick_interval = Duration::from_millis(config.scheduler.tick_interval_ms);

    // Bots stand in a row along x, each next to its own chest.
    for n in 0..args.bots {
        let id = ConnectionId(n);
        let x = n as i32 * 4;
        let server = SimulatedServer::new(
            Position::new(x as f64 + 0.5, 64.0, 0.5),
            BlockPosition::new(x + 1, 64, 0),
            SimulatedServer::loaded_within(ChunkPosition::new(0, 0), args.loaded_radius),
        );
        let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
        router.login(id, format!("bot{}", n), Dimension::Overworld, Box::new(tx))?;

        let bot_router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = run_bot(bot_router, id, server, rx, tick_interval).await {
                log::warn!("bot {} stopped: {:#}", id, e);
            }
        });
    }

    // Probe the whole square once.
    let loaded = Arc::new(AtomicUsize::new(0));
    let unloaded = Arc::new(AtomicUsize::new(0));
    let expiry = tick_interval * args.ticks;
    for x in -args.radius..=args.radius {
        for z in -args.radius..=args.radius {
            let loaded = loaded.clone();
            let unloaded = unloaded.clone();
            router.request(
                Dimension::Overworld,
                ChunkPosition::new(x, z),
                ChunkLoadState::Loaded,
                Priority::Medium,
                expiry,
                Some(Box::new(move |query: &ChunkStateQuery| match query.state() {
                    ChunkLoadState::Loaded => {
                        loaded.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        unloaded.fetch_add(1, Ordering::Relaxed);
                    }
                })),
            )?;
        }
    }

    // Run until the tick budget is spent (or SIGINT)
    let agent = ProbeAgent::new(
        config.agent.clone(),
        tick_interval,
        router.clone(),
        Arc::new(LogPublisher),
    );
    agent.run(tokio::time::sleep(expiry)).await?;

    log::info!(
        "Done: {} loaded, {} unloaded",
        loaded.load(Ordering::Relaxed),
        unloaded.load(Ordering::Relaxed)
    );
    Ok(())
}

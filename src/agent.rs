//! Tick driver – runs the router on a fixed interval and publishes what each
//! tick produced.
//!
//! ## Event contract (outbound)
//!
//! | Subject                     | Payload type                      |
//! |-----------------------------|-----------------------------------|
//! | `probe.chunk.state`         | `ProbeEvent<ChunkStateEvent>`     |
//! | `probe.metrics`             | `ProbeEvent<SchedulerMetrics>`    |
//! | `probe.report.no_storage`   | `ProbeEvent<ProbeReport>`         |
//! | `probe.report.rescheduled`  | `ProbeEvent<ProbeReport>`         |
//! | `probe.report.dimension_unavailable` | `ProbeEvent<ProbeReport>` |

use crate::config::AgentConfig;
use crate::protocol::{subjects, ProbeEvent};
use crate::router::{DimensionQueryRouter, RouterTick};
use anyhow::{Context, Result};
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

/// Where serialised events go.
pub trait Publisher: Send + Sync {
    fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;
}

/// Writes every event to the log at `info`.
#[derive(Debug, Default)]
pub struct LogPublisher;

impl Publisher for LogPublisher {
    fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let text = std::str::from_utf8(&payload).context("event payload is not UTF-8")?;
        info!(subject, "{}", text);
        Ok(())
    }
}

/// Forwards `(subject, payload)` pairs into a channel.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<(String, Bytes)>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, Bytes)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Publisher for ChannelPublisher {
    fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.tx
            .send((subject.to_string(), payload))
            .map_err(|_| anyhow::anyhow!("publish channel closed"))
    }
}

/// Serialise `event` and publish it on `subject`.
///
/// Errors are logged and swallowed; a single failed publish must not stop
/// the tick loop.
pub fn publish_event<P, T>(publisher: &P, subject: &str, event: ProbeEvent<T>)
where
    P: Publisher + ?Sized,
    T: serde::Serialize,
{
    match serde_json::to_vec(&event) {
        Ok(payload) => {
            if let Err(e) = publisher.publish(subject, Bytes::from(payload)) {
                warn!("Failed to publish to {}: {}", subject, e);
            }
        }
        Err(e) => warn!("Failed to serialise event for {}: {}", subject, e),
    }
}

// ---------------------------------------------------------------------------
// ProbeAgent
// ---------------------------------------------------------------------------

/// Drives a [`DimensionQueryRouter`] at the scheduler tick rate.
pub struct ProbeAgent<P: Publisher> {
    config: AgentConfig,
    tick_interval: Duration,
    router: Arc<DimensionQueryRouter>,
    publisher: Arc<P>,
}

impl<P: Publisher> ProbeAgent<P> {
    pub fn new(
        config: AgentConfig,
        tick_interval: Duration,
        router: Arc<DimensionQueryRouter>,
        publisher: Arc<P>,
    ) -> Self {
        Self {
            config,
            tick_interval,
            router,
            publisher,
        }
    }

    /// Run one tick and publish its results.
    pub fn step(&self) -> RouterTick {
        let tick = self.router.tick();
        self.publish_tick(&tick);
        tick
    }

    fn publish_tick(&self, tick: &RouterTick) {
        let server = self.config.server.as_str();
        let frame = tick.tick;

        for report in &tick.reports {
            publish_event(
                self.publisher.as_ref(),
                report.subject(),
                ProbeEvent::new(server, frame, report),
            );
        }

        for state in &tick.chunk_states {
            publish_event(
                self.publisher.as_ref(),
                subjects::CHUNK_STATE,
                ProbeEvent::new(server, frame, state),
            );
        }

        let every = self.config.metrics_every_ticks.max(1);
        if frame % every == 0 {
            for metrics in self.router.all_metrics() {
                publish_event(
                    self.publisher.as_ref(),
                    subjects::METRICS,
                    ProbeEvent::new(server, frame, &metrics),
                );
            }
        }
    }

    /// Tick until `shutdown` resolves or SIGINT arrives.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(
            "ProbeAgent active for '{}' – ticking every {}ms",
            self.config.server,
            self.tick_interval.as_millis()
        );

        let mut timer = tokio::time::interval(self.tick_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let tick = self.step();
                    if tick.dispatched > 0 || tick.expired > 0 {
                        tracing::debug!(
                            tick = tick.tick,
                            dispatched = tick.dispatched,
                            expired = tick.expired,
                            "probe tick"
                        );
                    }
                }
                _ = &mut shutdown => {
                    info!("ProbeAgent shutting down");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("ProbeAgent shutting down (SIGINT)");
                    break;
                }
            }
        }

        // Final flush so the last classifications are published.
        self.router.flush().await;
        let tick = self.step();
        info!(
            "ProbeAgent stopped at tick {} ({} final classifications)",
            tick.tick,
            tick.chunk_states.len()
        );
        Ok(())
    }
}

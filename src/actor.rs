//! One task per bot connection.
//!
//! Ticks from the scheduler and packets from the transport are funnelled into
//! a single channel and applied to the [`ProbeConnection`] in arrival order, so
//! the connection's state has exactly one owner and needs no lock. After every
//! message the actor copies its outputs (handed-back queries, reports,
//! completion count) into the scheduler's shared inbox and republishes its
//! [`ConnectionSnapshot`].

use crate::connection::{ConnectionSnapshot, ProbeConnection};
use crate::error::ProbeError;
use crate::protocol::{Inbound, Outbound, ProbeReport, RescheduleReason};
use crate::query::ChunkStateQuery;
use crate::scheduler::SchedulerShared;
use crate::types::ConnectionId;
use log::{debug, trace};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Everything a connection actor reacts to.
#[derive(Debug)]
pub enum ConnectionMessage {
    Tick,
    PacketIn(Inbound),
    PacketOut(Outbound),
    Dispatch(ChunkStateQuery),
    /// Report to a different scheduler from now on (dimension change).
    Rebind(Arc<SchedulerShared>),
    /// Acknowledged once every earlier message has been applied.
    Flush(oneshot::Sender<()>),
    Logout,
}

struct ConnectionActor {
    connection: ProbeConnection,
    shared: Arc<SchedulerShared>,
    rx: mpsc::UnboundedReceiver<ConnectionMessage>,
    snapshot: watch::Sender<ConnectionSnapshot>,
}

impl ConnectionActor {
    async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            let mut ack = None;
            let mut done = false;

            match message {
                ConnectionMessage::Tick => self.connection.tick(),
                ConnectionMessage::PacketIn(event) => self.connection.packet_in(&event),
                ConnectionMessage::PacketOut(packet) => self.connection.packet_out(&packet),
                ConnectionMessage::Dispatch(query) => {
                    if let Err(query) = self.connection.dispatch(query) {
                        trace!(
                            "{} refused probe at {}, requeueing",
                            self.connection.name(),
                            query.position()
                        );
                        let report = ProbeReport::Rescheduled {
                            connection: self.connection.id(),
                            name: self.connection.name().to_string(),
                            reason: RescheduleReason::Rejected,
                            count: 1,
                        };
                        self.shared.absorb(vec![query], vec![report], 0);
                    }
                }
                ConnectionMessage::Rebind(shared) => self.shared = shared,
                ConnectionMessage::Flush(tx) => ack = Some(tx),
                ConnectionMessage::Logout => {
                    self.connection.logout();
                    done = true;
                }
            }

            self.publish();
            if let Some(tx) = ack {
                let _ = tx.send(());
            }
            if done {
                break;
            }
        }

        // Dropped without an explicit logout: nothing may stay in flight.
        if self.connection.in_flight() > 0 {
            self.connection.logout();
            self.publish();
        }
        debug!("{} actor stopped", self.connection.name());
    }

    fn publish(&mut self) {
        let rescheduled = self.connection.take_rescheduled();
        let reports = self.connection.take_reports();
        let finalised = self.connection.take_finalised();
        self.shared.absorb(rescheduled, reports, finalised);
        self.snapshot.send_replace(self.connection.snapshot());
    }
}

/// Scheduler-side handle to a running connection actor.
pub struct ConnectionHandle {
    id: ConnectionId,
    name: String,
    tx: mpsc::UnboundedSender<ConnectionMessage>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Move `connection` into its own task. Must be called inside a Tokio runtime.
    pub fn spawn(connection: ProbeConnection, shared: Arc<SchedulerShared>) -> Self {
        let id = connection.id();
        let name = connection.name().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(connection.snapshot());

        let actor = ConnectionActor {
            connection,
            shared,
            rx,
            snapshot: snapshot_tx,
        };
        let task = tokio::spawn(actor.run());

        Self {
            id,
            name,
            tx,
            snapshot: snapshot_rx,
            task,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// State as of the last message the actor finished.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn send(&self, message: ConnectionMessage) -> Result<(), ProbeError> {
        self.tx
            .send(message)
            .map_err(|_| ProbeError::ConnectionClosed(self.id))
    }

    /// Hand a query to the actor. Gives it back if the actor is gone.
    pub fn dispatch(&self, query: ChunkStateQuery) -> Result<(), ChunkStateQuery> {
        let retained = query.clone();
        self.tx
            .send(ConnectionMessage::Dispatch(query))
            .map_err(|_| retained)
    }

    pub fn tick(&self) -> Result<(), ProbeError> {
        self.send(ConnectionMessage::Tick)
    }

    pub fn packet_in(&self, event: Inbound) -> Result<(), ProbeError> {
        self.send(ConnectionMessage::PacketIn(event))
    }

    pub fn packet_out(&self, packet: Outbound) -> Result<(), ProbeError> {
        self.send(ConnectionMessage::PacketOut(packet))
    }

    pub fn rebind(&self, shared: Arc<SchedulerShared>) -> Result<(), ProbeError> {
        self.send(ConnectionMessage::Rebind(shared))
    }

    /// Queue a barrier; the receiver resolves once the actor has caught up.
    pub fn flush_signal(&self) -> Option<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(ConnectionMessage::Flush(tx)).ok()?;
        Some(rx)
    }

    pub async fn flush(&self) {
        if let Some(rx) = self.flush_signal() {
            let _ = rx.await;
        }
    }

    /// Ask the actor to hand back its probes and stop.
    pub fn logout(self) -> JoinHandle<()> {
        let _ = self.tx.send(ConnectionMessage::Logout);
        self.task
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

//! Connection actor tests

#[cfg(test)]
mod tests {
    use chunk_probe::{
        actor::{ConnectionHandle, ConnectionMessage},
        config::{ProbeConfig, SchedulerConfig},
        connection::ProbeConnection,
        error::ProbeError,
        policy,
        protocol::{Inbound, Outbound, ProbeReport, RescheduleReason},
        query::{ChunkStateQuery, QueryRequest},
        scheduler::{ProbeScheduler, SchedulerShared},
        types::{ChunkLoadState, ChunkPosition, ConnectionId, Dimension, Priority},
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok, block_on};

    fn connection(dimension: Dimension) -> (ProbeConnection, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
        let connection = ProbeConnection::new(
            ConnectionId(1),
            "bot",
            dimension,
            Arc::new(ProbeConfig::default()),
            policy::build(policy::DEFAULT_POLICY).unwrap(),
            Box::new(tx),
        );
        (connection, rx)
    }

    fn query() -> ChunkStateQuery {
        let request = QueryRequest::new(
            Dimension::Overworld,
            ChunkPosition::new(0, 0),
            ChunkLoadState::Loaded,
            Priority::Medium,
            Duration::from_secs(60),
        );
        ChunkStateQuery::new(request, None)
    }

    #[test]
    fn refused_dispatch_is_requeued() {
        block_on(async {
            let scheduler = ProbeScheduler::new(
                Dimension::Overworld,
                SchedulerConfig::default(),
                Arc::new(ProbeConfig::default()),
            );
            let (conn, _rx) = connection(Dimension::Overworld);
            let handle = ConnectionHandle::spawn(conn, scheduler.shared());

            // Not spawned yet: the actor hands the query straight back.
            assert!(handle.dispatch(query()).is_ok());
            handle.flush().await;
            assert_eq!(scheduler.waiting_count(), 1);
            assert_eq!(handle.snapshot().in_flight, 0);

            let tick = scheduler.tick();
            assert!(tick.reports.iter().any(|r| matches!(
                r,
                ProbeReport::Rescheduled {
                    reason: RescheduleReason::Rejected,
                    count: 1,
                    ..
                }
            )));
        });
    }

    #[test]
    fn snapshot_follows_applied_messages() {
        block_on(async {
            let shared = SchedulerShared::new(Dimension::Overworld);
            let (conn, mut rx) = connection(Dimension::Overworld);
            let handle = ConnectionHandle::spawn(conn, shared);
            assert!(!handle.snapshot().spawned);

            assert_ok!(handle.packet_in(Inbound::PositionCorrection {
                teleport_id: 1,
                position: Default::default(),
                angle: Default::default(),
            }));
            handle.flush().await;

            let snapshot = handle.snapshot();
            assert!(snapshot.spawned);
            assert!(snapshot.teleport_desync);
            // The unexpected correction was acknowledged.
            assert_eq!(
                rx.try_recv().ok(),
                Some(Outbound::TeleportConfirm { teleport_id: 1 })
            );
        });
    }

    #[test]
    fn rebind_redirects_outputs() {
        block_on(async {
            let overworld = ProbeScheduler::new(
                Dimension::Overworld,
                SchedulerConfig::default(),
                Arc::new(ProbeConfig::default()),
            );
            let nether = ProbeScheduler::new(
                Dimension::Nether,
                SchedulerConfig::default(),
                Arc::new(ProbeConfig::default()),
            );
            let (conn, _rx) = connection(Dimension::Overworld);
            let handle = ConnectionHandle::spawn(conn, overworld.shared());

            assert_ok!(handle.rebind(nether.shared()));
            assert_ok!(handle.send(ConnectionMessage::Dispatch(query())));
            handle.flush().await;

            // The refused query went to the scheduler the actor is bound to now.
            assert_eq!(nether.waiting_count(), 1);
            assert_eq!(overworld.waiting_count(), 0);
        });
    }

    #[test]
    fn logout_stops_the_actor() {
        block_on(async {
            let shared = SchedulerShared::new(Dimension::End);
            let (conn, _rx) = connection(Dimension::End);
            let handle = ConnectionHandle::spawn(conn, shared);
            assert_ok!(handle.tick());
            assert_ok!(handle.logout().await);
        });
    }

    #[test]
    fn closed_actor_rejects_messages() {
        block_on(async {
            let shared = SchedulerShared::new(Dimension::Overworld);
            let (conn, _rx) = connection(Dimension::Overworld);
            let handle = ConnectionHandle::spawn(conn, shared.clone());
            let again = ConnectionHandle::spawn(connection(Dimension::Overworld).0, shared);

            assert_ok!(again.send(ConnectionMessage::Logout));
            again.flush().await;
            assert!(again.is_closed());
            assert!(matches!(
                again.tick(),
                Err(ProbeError::ConnectionClosed(id)) if id == ConnectionId(1)
            ));
            assert_err!(again.packet_in(Inbound::KeepAlive));
            assert!(again.flush_signal().is_none());

            assert_ok!(handle.logout().await);
        });
    }
}

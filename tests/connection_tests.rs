//! ProbeConnection state machine tests, driven against the simulated server

#[cfg(test)]
mod tests {
    use chunk_probe::{
        config::ProbeConfig,
        connection::{ProbeConnection, Transport},
        policy,
        protocol::{Inbound, Outbound, ProbeReport, QueryOutcome, RescheduleReason},
        query::{ChunkStateQuery, QueryRequest},
        sim::SimulatedServer,
        types::{
            Angle, BlockPosition, ChunkLoadState, ChunkPosition, ConnectionId, Dimension,
            Position, Priority,
        },
    };
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    // -----------------------------------------------------------------------
    // Harness
    // -----------------------------------------------------------------------

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Outbound>>>);

    impl Transport for Recorder {
        fn send(&mut self, packet: Outbound) {
            self.0.lock().push(packet);
        }
    }

    struct Harness {
        conn: ProbeConnection,
        server: SimulatedServer,
        outbound: Recorder,
        /// Everything the server has received.
        sent: Vec<Outbound>,
    }

    impl Harness {
        fn new(config: ProbeConfig) -> Self {
            let outbound = Recorder::default();
            let policy = policy::build(&config.policy).unwrap();
            let conn = ProbeConnection::new(
                ConnectionId(1),
                "bot",
                Dimension::Overworld,
                Arc::new(config),
                policy,
                Box::new(outbound.clone()),
            );
            let server = SimulatedServer::new(
                Position::new(0.5, 64.0, 0.5),
                BlockPosition::new(1, 64, 0),
                SimulatedServer::loaded_within(ChunkPosition::new(0, 0), 2),
            );
            Self {
                conn,
                server,
                outbound,
                sent: Vec::new(),
            }
        }

        /// Joined, storage open and teleport ids in sync.
        fn ready(config: ProbeConfig) -> Self {
            let mut h = Self::new(config);
            for event in h.server.join() {
                h.conn.packet_in(&event);
            }
            h.pump();
            for _ in 0..100 {
                if h.conn.can_query() {
                    break;
                }
                h.tick();
            }
            assert!(h.conn.can_query(), "connection never became ready");
            h.sent.clear();
            h.conn.take_reports();
            h
        }

        fn tick(&mut self) {
            for event in self.server.tick() {
                self.conn.packet_in(&event);
            }
            self.conn.tick();
            self.pump();
        }

        /// Deliver queued packets to the server and its replies back.
        fn pump(&mut self) {
            loop {
                let batch = std::mem::take(&mut *self.outbound.0.lock());
                if batch.is_empty() {
                    break;
                }
                for packet in batch {
                    let replies = self.server.handle(&packet);
                    self.sent.push(packet);
                    for reply in replies {
                        self.conn.packet_in(&reply);
                    }
                }
            }
        }

        /// Lose whatever the connection sent since the last pump.
        fn drop_outbound(&mut self) -> Vec<Outbound> {
            std::mem::take(&mut *self.outbound.0.lock())
        }

        fn reasons(&mut self) -> Vec<RescheduleReason> {
            self.conn
                .take_reports()
                .into_iter()
                .filter_map(|report| match report {
                    ProbeReport::Rescheduled { reason, .. } => Some(reason),
                    _ => None,
                })
                .collect()
        }
    }

    fn query(x: i32, z: i32) -> ChunkStateQuery {
        let request = QueryRequest::new(
            Dimension::Overworld,
            ChunkPosition::new(x, z),
            ChunkLoadState::Loaded,
            Priority::Medium,
            Duration::from_secs(60),
        );
        ChunkStateQuery::new(request, None)
    }

    fn confirms(packets: &[Outbound]) -> Vec<i32> {
        packets
            .iter()
            .filter_map(|p| match p {
                Outbound::TeleportConfirm { teleport_id } => Some(*teleport_id),
                _ => None,
            })
            .collect()
    }

    fn pipelined() -> ProbeConfig {
        ProbeConfig {
            queries_per_tick: 2.0,
            ..Default::default()
        }
    }

    // -----------------------------------------------------------------------
    // Readiness
    // -----------------------------------------------------------------------

    #[test]
    fn fresh_connection_refuses_probes() {
        let mut h = Harness::new(ProbeConfig::default());
        let q = query(0, 0);
        assert!(h.conn.dispatch(q.clone()).is_err());
        assert_eq!(q.state(), ChunkLoadState::Waiting);
        assert!(h.drop_outbound().is_empty());
    }

    #[test]
    fn becomes_ready_after_spawn_and_storage() {
        let h = Harness::ready(ProbeConfig::default());
        let snapshot = h.conn.snapshot();

        assert!(snapshot.spawned);
        assert!(snapshot.has_storage);
        assert!(snapshot.storage_open);
        assert!(!snapshot.teleport_desync);
        assert_eq!(snapshot.capacity, 1);
        assert_eq!(h.conn.state().last_window_id, 1);
    }

    // -----------------------------------------------------------------------
    // Classification
    // -----------------------------------------------------------------------

    #[test]
    fn loaded_chunk_closes_window_before_correction() {
        let mut h = Harness::ready(ProbeConfig::default());
        let q = query(0, 0);

        assert!(h.conn.dispatch(q.clone()).is_ok());
        h.pump();

        assert_eq!(q.state(), ChunkLoadState::Loaded);
        assert_eq!(q.outcome(), Some(QueryOutcome::Resolved));
        assert_eq!(h.conn.in_flight(), 0);
        assert_eq!(h.conn.take_finalised(), 1);
    }

    #[test]
    fn unloaded_chunk_keeps_window_open() {
        let mut h = Harness::ready(ProbeConfig::default());
        let q = query(50, -50);

        assert!(h.conn.dispatch(q.clone()).is_ok());
        h.pump();

        assert_eq!(q.state(), ChunkLoadState::Unloaded);
        assert!(h.conn.storage().is_open());
    }

    #[test]
    fn dispatch_sends_open_move_confirm_in_order() {
        let mut h = Harness::ready(ProbeConfig::default());
        assert!(h.conn.dispatch(query(3, -4)).is_ok());

        let packets: Vec<_> = h
            .drop_outbound()
            .into_iter()
            .filter(|p| !matches!(p, Outbound::Rotation { .. } | Outbound::SwingArm))
            .collect();
        assert_eq!(packets.len(), 3);
        assert_eq!(
            packets[0],
            Outbound::UseBlock {
                position: BlockPosition::new(1, 64, 0)
            }
        );
        assert_eq!(
            packets[1],
            Outbound::PositionUpdate {
                position: Position::new(56.0, 100_000.0, -56.0),
                on_ground: false,
            }
        );
        assert_eq!(packets[2], Outbound::TeleportConfirm { teleport_id: 2 });
    }

    #[test]
    fn probe_target_is_clamped_to_world_border() {
        let mut h = Harness::ready(ProbeConfig::default());
        assert!(h.conn.dispatch(query(3_000_000, -3_000_000)).is_ok());

        let moved = h.drop_outbound().into_iter().find_map(|p| match p {
            Outbound::PositionUpdate { position, .. } => Some(position),
            _ => None,
        });
        let position = moved.unwrap();
        assert_eq!(position.x, 29_999_999.0);
        assert_eq!(position.z, -29_999_999.0);
    }

    #[test]
    fn extreme_chunk_coordinates_saturate_at_the_border() {
        let mut h = Harness::ready(ProbeConfig::default());
        let q = query(i32::MAX, i32::MIN);
        assert!(h.conn.dispatch(q.clone()).is_ok());

        let moved = h
            .outbound
            .0
            .lock()
            .iter()
            .find_map(|p| match p {
                Outbound::PositionUpdate { position, .. } => Some(*position),
                _ => None,
            })
            .unwrap();
        assert_eq!(moved.x, 29_999_999.0);
        assert_eq!(moved.z, -29_999_999.0);

        h.pump();
        assert_eq!(q.state(), ChunkLoadState::Unloaded);
    }

    #[test]
    fn untracked_windows_correlate_closes_with_their_own_open() {
        let mut h = Harness::ready(ProbeConfig {
            window_tracking: false,
            ..Default::default()
        });
        let probes = [query(50, 0), query(60, 0), query(1, 0), query(70, 0)];

        for q in &probes {
            assert!(h.conn.dispatch(q.clone()).is_ok());
            h.pump();
            h.tick();
        }

        let states: Vec<_> = probes.iter().map(|q| q.state()).collect();
        assert_eq!(
            states,
            vec![
                ChunkLoadState::Unloaded,
                ChunkLoadState::Unloaded,
                ChunkLoadState::Loaded,
                ChunkLoadState::Unloaded,
            ]
        );
        assert!(h.reasons().is_empty());
        assert!(!h.conn.state().window_desync);
    }

    #[test]
    fn pipelined_probes_classify_in_order() {
        let mut h = Harness::ready(pipelined());
        let near = query(1, 0);
        let far = query(40, 40);

        assert!(h.conn.dispatch(near.clone()).is_ok());
        assert!(h.conn.dispatch(far.clone()).is_ok());
        assert_eq!(h.conn.in_flight(), 2);
        // Allowance for this tick is spent.
        assert!(h.conn.dispatch(query(2, 2)).is_err());

        h.pump();
        assert_eq!(near.state(), ChunkLoadState::Loaded);
        assert_eq!(far.state(), ChunkLoadState::Unloaded);
        assert_eq!(h.conn.in_flight(), 0);
        assert!(h.reasons().is_empty());
    }

    #[test]
    fn teleport_ids_strictly_increase() {
        let mut h = Harness::ready(ProbeConfig::default());
        for n in 0..5 {
            assert!(h.conn.dispatch(query(n * 10, 0)).is_ok());
            h.pump();
            h.tick();
        }

        let ids = confirms(&h.sent);
        assert_eq!(ids, vec![2, 3, 4, 5, 6]);
        assert_eq!(h.server.teleport_id(), 6);
    }

    // -----------------------------------------------------------------------
    // Desync
    // -----------------------------------------------------------------------

    #[test]
    fn unexpected_teleport_reschedules_and_blocks_dispatch() {
        let mut h = Harness::ready(ProbeConfig::default());
        let q = query(1, 1);
        assert!(h.conn.dispatch(q.clone()).is_ok());
        h.drop_outbound();

        h.conn.packet_in(&Inbound::PositionCorrection {
            teleport_id: 99,
            position: Position::new(0.5, 64.0, 0.5),
            angle: Angle::default(),
        });

        assert!(h.conn.state().teleport_desync);
        assert_eq!(h.conn.state().estimated_teleport_id, 99);
        assert_eq!(
            h.drop_outbound(),
            vec![Outbound::TeleportConfirm { teleport_id: 99 }]
        );
        assert_eq!(h.reasons(), vec![RescheduleReason::TeleportDesync]);

        let back = h.conn.take_rescheduled();
        assert_eq!(back.len(), 1);
        assert!(back[0].ptr_eq(&q));
        assert_eq!(q.state(), ChunkLoadState::Waiting);

        assert!(!h.conn.can_query());
        assert!(h.conn.dispatch(query(2, 2)).is_err());
    }

    #[test]
    fn unexpected_window_enters_window_desync_then_recovers() {
        let mut h = Harness::ready(ProbeConfig::default());
        let q = query(1, 1);
        assert!(h.conn.dispatch(q.clone()).is_ok());
        h.drop_outbound();

        h.conn.packet_in(&Inbound::ContainerOpened { window_id: 7 });
        assert!(h.conn.state().window_desync);
        assert_eq!(h.conn.state().estimated_window_id, 7);
        assert_eq!(h.reasons(), vec![RescheduleReason::WindowDesync]);
        assert_eq!(h.conn.take_rescheduled().len(), 1);
        assert!(!h.conn.can_query());

        // Quiet window traffic for long enough clears the desync.
        for _ in 0..50 {
            h.conn.packet_in(&Inbound::KeepAlive);
            h.conn.tick();
            h.drop_outbound();
        }
        assert!(!h.conn.state().window_desync);
    }

    #[test]
    fn silent_server_never_times_out() {
        let mut h = Harness::ready(ProbeConfig::default());
        assert!(h.conn.dispatch(query(1, 1)).is_ok());
        h.drop_outbound();

        for _ in 0..200 {
            h.conn.tick();
        }
        assert_eq!(h.conn.in_flight(), 1);
        assert!(h.reasons().is_empty());
    }

    #[test]
    fn lost_reply_times_out() {
        let mut h = Harness::ready(ProbeConfig::default());
        let q = query(1, 1);
        assert!(h.conn.dispatch(q.clone()).is_ok());
        h.drop_outbound();

        for _ in 0..50 {
            h.conn.packet_in(&Inbound::KeepAlive);
            h.conn.tick();
        }
        assert_eq!(h.conn.in_flight(), 0);
        assert_eq!(h.reasons(), vec![RescheduleReason::Timeout]);
        assert_eq!(h.conn.take_rescheduled().len(), 1);
        assert_eq!(h.conn.pre_confirms(), 0);
        assert!(h.conn.state().movement_limit > 0);
    }

    // -----------------------------------------------------------------------
    // Digging resync
    // -----------------------------------------------------------------------

    fn digging() -> ProbeConfig {
        ProbeConfig {
            queries_per_tick: 2.0,
            digging_resync: true,
            ..Default::default()
        }
    }

    #[test]
    fn digging_boundary_marks_probe_sure() {
        let mut h = Harness::ready(digging());
        let q = query(0, 1);
        assert!(h.conn.dispatch(q.clone()).is_ok());

        let first = h.outbound.0.lock().first().cloned();
        assert!(matches!(first, Some(Outbound::CancelDigging { .. })));

        h.pump();
        assert_eq!(q.state(), ChunkLoadState::Loaded);
    }

    #[test]
    fn missed_digging_boundary_is_packet_loss() {
        let mut h = Harness::ready(digging());
        assert!(h.conn.dispatch(query(0, 1)).is_ok());
        assert!(h.conn.dispatch(query(30, 30)).is_ok());

        let boundaries: Vec<_> = h
            .drop_outbound()
            .into_iter()
            .filter_map(|p| match p {
                Outbound::CancelDigging { position } => Some(position),
                _ => None,
            })
            .collect();
        assert_eq!(boundaries.len(), 2);

        // The first probe's replies never arrive after its boundary.
        for position in boundaries {
            h.conn.packet_in(&Inbound::BlockChange {
                record: chunk_probe::protocol::BlockChangeRecord {
                    position,
                    block_id: 0,
                },
            });
        }

        assert_eq!(h.conn.in_flight(), 0);
        assert_eq!(h.reasons(), vec![RescheduleReason::PacketLoss]);
        assert_eq!(h.conn.take_rescheduled().len(), 2);
    }

    // -----------------------------------------------------------------------
    // Non-ARZI mode
    // -----------------------------------------------------------------------

    #[test]
    fn closed_storage_hands_back_queued_probes() {
        let config = ProbeConfig {
            queries_per_tick: 2.0,
            arzi_mode: false,
            ..Default::default()
        };
        let mut h = Harness::ready(config);
        let near = query(1, 1);
        let far = query(30, 30);

        assert!(h.conn.dispatch(near.clone()).is_ok());
        assert!(h.conn.dispatch(far.clone()).is_ok());
        h.pump();

        assert_eq!(near.state(), ChunkLoadState::Loaded);
        assert_eq!(far.state(), ChunkLoadState::Waiting);
        assert_eq!(h.reasons(), vec![RescheduleReason::StorageClosed]);
        let back = h.conn.take_rescheduled();
        assert_eq!(back.len(), 1);
        assert!(back[0].ptr_eq(&far));

        // The storage was reopened right away.
        assert!(h.conn.storage().is_open());
    }

    // -----------------------------------------------------------------------
    // Respawn
    // -----------------------------------------------------------------------

    #[test]
    fn dimension_change_hands_everything_back() {
        let mut h = Harness::ready(ProbeConfig::default());
        assert!(h.conn.dispatch(query(1, 1)).is_ok());
        h.drop_outbound();

        h.conn.packet_in(&Inbound::Respawn {
            dimension: Dimension::Nether,
        });

        assert_eq!(h.reasons(), vec![RescheduleReason::DimensionChanged]);
        assert_eq!(h.conn.take_rescheduled().len(), 1);
        assert_eq!(h.conn.state().dimension, Dimension::Nether);
        assert!(!h.conn.state().spawned);
        assert!(h.conn.storage().current().is_none());
        assert!(!h.conn.can_query());
    }

    #[test]
    fn same_dimension_respawn_resets_world_view() {
        let mut h = Harness::ready(ProbeConfig::default());
        assert!(h.conn.dispatch(query(1, 1)).is_ok());
        h.drop_outbound();

        h.conn.packet_in(&Inbound::Respawn {
            dimension: Dimension::Overworld,
        });
        assert_eq!(h.reasons(), vec![RescheduleReason::Respawn]);
        assert!(h.conn.state().teleport_desync);
    }

    #[test]
    fn logout_hands_back_in_flight() {
        let mut h = Harness::ready(pipelined());
        assert!(h.conn.dispatch(query(1, 1)).is_ok());
        assert!(h.conn.dispatch(query(2, 2)).is_ok());

        h.conn.logout();
        assert_eq!(h.reasons(), vec![RescheduleReason::Logout]);
        assert_eq!(h.conn.take_rescheduled().len(), 2);
        assert_eq!(h.conn.in_flight(), 0);
    }

    // -----------------------------------------------------------------------
    // Budget
    // -----------------------------------------------------------------------

    #[test]
    fn fractional_rate_carries_over_ticks() {
        let config = ProbeConfig {
            queries_per_tick: 0.5,
            ..Default::default()
        };
        let mut h = Harness::new(config);

        let mut total = 0;
        for _ in 0..10 {
            total += h.conn.capacity();
            h.conn.tick();
        }
        assert_eq!(total, 5);
    }

    #[test]
    fn external_confirms_are_tracked_only_when_synced() {
        let mut h = Harness::new(ProbeConfig::default());
        h.conn.packet_out(&Outbound::TeleportConfirm { teleport_id: 5 });
        assert_eq!(h.conn.pre_confirms(), 0);

        let mut h = Harness::ready(ProbeConfig::default());
        h.conn.packet_out(&Outbound::TeleportConfirm { teleport_id: 5 });
        assert_eq!(h.conn.pre_confirms(), 1);
    }
}

//! StorageLocator unit tests

#[cfg(test)]
mod tests {
    use chunk_probe::{
        config::ProbeConfig,
        protocol::{BlockChangeRecord, BlockEntity, Inbound, Outbound},
        storage::{Storage, StorageAction, StorageKind, StorageLocator, EYE_HEIGHT},
        types::{Angle, BlockPosition, ChunkPosition, Position},
    };

    const CHEST: BlockPosition = BlockPosition { x: 1, y: 64, z: 0 };

    fn eyes() -> Position {
        Position::new(0.5, 64.0, 0.5).offset(0.0, EYE_HEIGHT, 0.0)
    }

    fn chunk_with_chest() -> Inbound {
        Inbound::ChunkData {
            position: CHEST.chunk(),
            block_entities: vec![
                BlockEntity {
                    position: CHEST,
                    id: "minecraft:chest".into(),
                },
                BlockEntity {
                    position: BlockPosition::new(3, 64, 3),
                    id: "minecraft:sign".into(),
                },
            ],
        }
    }

    fn located(config: &ProbeConfig) -> StorageLocator {
        let mut locator = StorageLocator::new();
        assert_eq!(locator.handle(&chunk_with_chest(), config), None);
        match locator.tick(&eyes(), 1, true, false, config) {
            StorageAction::Found(Storage::Block(b)) => assert_eq!(b.position, CHEST),
            other => panic!("expected a block storage, got {:?}", other),
        }
        locator
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    #[test]
    fn chunk_data_registers_only_storage_blocks() {
        let config = ProbeConfig::default();
        let mut locator = StorageLocator::new();
        locator.handle(&chunk_with_chest(), &config);
        assert_eq!(locator.block_count(), 1);
    }

    #[test]
    fn discovery_waits_for_spawn() {
        let config = ProbeConfig::default();
        let mut locator = StorageLocator::new();
        locator.handle(&chunk_with_chest(), &config);

        assert_eq!(
            locator.tick(&eyes(), 1, false, false, &config),
            StorageAction::Nothing
        );
        assert!(matches!(
            locator.tick(&eyes(), 2, true, false, &config),
            StorageAction::Found(_)
        ));
    }

    #[test]
    fn nothing_in_reach_reports_missing() {
        let config = ProbeConfig::default();
        let mut locator = StorageLocator::new();
        locator.handle(&chunk_with_chest(), &config);

        let far = Position::new(200.0, 65.53, 200.0);
        assert_eq!(locator.tick(&far, 1, true, false, &config), StorageAction::Missing);
        assert!(locator.current().is_none());
        // Discovery only reruns once candidates change.
        assert_eq!(locator.tick(&far, 2, true, false, &config), StorageAction::Nothing);
    }

    #[test]
    fn moving_into_reach_reruns_discovery() {
        let config = ProbeConfig::default();
        let mut locator = StorageLocator::new();
        locator.handle(&chunk_with_chest(), &config);

        let far = Position::new(200.0, 64.0, 200.0);
        let correction = |position: Position| Inbound::PositionCorrection {
            teleport_id: 1,
            position,
            angle: Angle::default(),
        };
        locator.handle(&correction(far), &config);
        let far_eyes = far.offset(0.0, EYE_HEIGHT, 0.0);
        assert_eq!(locator.tick(&far_eyes, 1, true, false, &config), StorageAction::Missing);

        // A setback to the same spot changes nothing.
        locator.handle(&correction(far), &config);
        assert_eq!(locator.tick(&far_eyes, 2, true, false, &config), StorageAction::Nothing);

        locator.handle(&correction(Position::new(0.5, 64.0, 0.5)), &config);
        assert!(matches!(
            locator.tick(&eyes(), 3, true, false, &config),
            StorageAction::Found(Storage::Block(b)) if b.position == CHEST
        ));
    }

    #[test]
    fn block_change_adds_storage() {
        let config = ProbeConfig::default();
        let mut locator = StorageLocator::new();
        locator.handle(
            &Inbound::BlockChange {
                record: BlockChangeRecord {
                    position: CHEST,
                    block_id: 154,
                },
            },
            &config,
        );
        match locator.tick(&eyes(), 1, true, false, &config) {
            StorageAction::Found(Storage::Block(b)) => assert_eq!(b.name, "minecraft:hopper"),
            other => panic!("expected hopper, got {:?}", other),
        }
    }

    #[test]
    fn prefers_entities_when_configured() {
        let config = ProbeConfig {
            use_entity_storages: true,
            ..Default::default()
        };
        let mut locator = StorageLocator::new();
        locator.handle(&chunk_with_chest(), &config);
        locator.handle(
            &Inbound::EntitySpawn {
                entity_id: 7,
                kind: "donkey".into(),
                position: Position::new(2.0, 64.0, 2.0),
            },
            &config,
        );
        assert_eq!(locator.entity_count(), 1);

        match locator.tick(&eyes(), 1, true, false, &config) {
            StorageAction::Found(storage) => assert_eq!(storage.kind(), StorageKind::Entity),
            other => panic!("expected entity storage, got {:?}", other),
        }
    }

    #[test]
    fn ignores_non_storage_entities() {
        let config = ProbeConfig::default();
        let mut locator = StorageLocator::new();
        locator.handle(
            &Inbound::EntitySpawn {
                entity_id: 9,
                kind: "zombie".into(),
                position: Position::new(1.0, 64.0, 1.0),
            },
            &config,
        );
        assert_eq!(locator.entity_count(), 0);
    }

    // -----------------------------------------------------------------------
    // Loss
    // -----------------------------------------------------------------------

    #[test]
    fn chunk_unload_drops_current() {
        let config = ProbeConfig::default();
        let mut locator = located(&config);

        let lost = locator.handle(
            &Inbound::ChunkUnload {
                position: ChunkPosition::new(0, 0),
            },
            &config,
        );
        assert!(matches!(lost, Some(Storage::Block(_))));
        assert!(locator.current().is_none());
        assert_eq!(locator.block_count(), 0);
    }

    #[test]
    fn block_broken_drops_current() {
        let config = ProbeConfig::default();
        let mut locator = located(&config);

        let lost = locator.handle(
            &Inbound::MultiBlockChange {
                records: vec![BlockChangeRecord {
                    position: CHEST,
                    block_id: 0,
                }],
            },
            &config,
        );
        assert!(lost.is_some());
        assert!(locator.current().is_none());
    }

    #[test]
    fn unrelated_unload_keeps_current() {
        let config = ProbeConfig::default();
        let mut locator = located(&config);

        let lost = locator.handle(
            &Inbound::ChunkUnload {
                position: ChunkPosition::new(5, 5),
            },
            &config,
        );
        assert_eq!(lost, None);
        assert!(locator.current().is_some());
    }

    #[test]
    fn entity_destroy_drops_current() {
        let config = ProbeConfig {
            use_entity_storages: true,
            ..Default::default()
        };
        let mut locator = StorageLocator::new();
        locator.handle(
            &Inbound::EntitySpawn {
                entity_id: 7,
                kind: "mule".into(),
                position: Position::new(1.0, 64.0, 1.0),
            },
            &config,
        );
        assert!(matches!(
            locator.tick(&eyes(), 1, true, false, &config),
            StorageAction::Found(_)
        ));

        let lost = locator.handle(&Inbound::EntityDestroy { entity_ids: vec![7] }, &config);
        assert!(matches!(lost, Some(Storage::Entity(e)) if e.entity_id == 7));
    }

    // -----------------------------------------------------------------------
    // Opening
    // -----------------------------------------------------------------------

    #[test]
    fn new_storage_is_opened_then_retried_after_timeout() {
        let config = ProbeConfig::default();
        let mut locator = located(&config);

        assert_eq!(locator.tick(&eyes(), 2, true, false, &config), StorageAction::Open);
        locator.mark_open_attempt(2);
        assert!(locator.is_attempting_open());
        assert_eq!(locator.tick(&eyes(), 3, true, false, &config), StorageAction::Nothing);

        let late = 3 + config.open_timeout_ticks;
        assert_eq!(
            locator.tick(&eyes(), late, true, false, &config),
            StorageAction::OpenTimedOut
        );
        assert!(!locator.is_attempting_open());
    }

    #[test]
    fn window_desync_suppresses_open() {
        let config = ProbeConfig::default();
        let mut locator = located(&config);
        assert_eq!(locator.tick(&eyes(), 2, true, true, &config), StorageAction::Nothing);
    }

    #[test]
    fn container_events_track_open_state() {
        let config = ProbeConfig::default();
        let mut locator = located(&config);
        locator.mark_open_attempt(1);

        locator.handle(&Inbound::ContainerOpened { window_id: 1 }, &config);
        assert!(locator.is_open());
        assert!(!locator.is_attempting_open());

        // Already open: arzi mode leaves reopening to the probes.
        assert_eq!(locator.tick(&eyes(), 2, true, false, &config), StorageAction::Nothing);
        locator.handle(&Inbound::ContainerClosed { window_id: 1 }, &config);
        assert!(!locator.is_open());
        assert_eq!(locator.tick(&eyes(), 3, true, false, &config), StorageAction::Nothing);
    }

    #[test]
    fn block_open_packets_aim_then_use() {
        let storage = Storage::Block(chunk_probe::storage::BlockStorage::new(
            CHEST,
            "minecraft:chest",
        ));
        let packets = storage.open_packets(&eyes(), Angle::default(), true);

        assert_eq!(packets.len(), 3);
        assert!(matches!(packets[0], Outbound::Rotation { .. }));
        assert_eq!(packets[1], Outbound::UseBlock { position: CHEST });
        assert_eq!(packets[2], Outbound::SwingArm);

        // Already aimed: no rotation.
        let aimed = storage.required_angle(&eyes()).unwrap();
        let packets = storage.open_packets(&eyes(), aimed, false);
        assert_eq!(packets, vec![Outbound::UseBlock { position: CHEST }]);
    }
}

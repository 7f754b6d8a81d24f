//! End-to-end behaviour of the engine across connectivity gaps.
//!
//! Covers the offline author workflows: edits made while disconnected are
//! compacted, replayed exactly once on reconnect, and the optimistic entity
//! is swapped for the server's without ever showing twice.

mod common;

use std::collections::BTreeMap;

use common::{Call, FakeRest, FakeSocket, T0, payload};
use serde_json::json;
use trailsync_core::clock::ManualClock;
use trailsync_core::config::SyncConfig;
use trailsync_core::model::{EntityKind, LocalIdMinter, PositionSample};
use trailsync_core::protocol::{Inbound, PeerPosition, SnapshotMessage};
use trailsync_core::resync::{SubscriptionState, Trigger};
use trailsync_core::store::MemoryStore;
use trailsync_core::trace::RetentionChange;
use trailsync_core::{Session, SyncEngine};

fn offline_engine(clock: &ManualClock) -> SyncEngine<FakeSocket, FakeRest> {
    SyncEngine::new(
        Session::new("mission-7", "ana"),
        SyncConfig::default(),
        FakeSocket::default(),
        FakeRest::default(),
        Box::new(MemoryStore::new()),
        Box::new(clock.clone()),
    )
    .with_minter(LocalIdMinter::seeded(42))
}

fn reconnect(engine: &mut SyncEngine<FakeSocket, FakeRest>) {
    engine.channel_mut().connected = true;
    engine.resync(Trigger::Reconnect);
}

#[test]
fn ravine_created_and_recolored_offline_reaches_server_once() {
    let clock = ManualClock::new(T0);
    let mut engine = offline_engine(&clock);

    let id = engine.create_with_local_id(
        EntityKind::Poi,
        "local-42",
        payload(json!({"title": "Ravine", "color": "#00ff00"})),
    );
    assert_eq!(id, "local-42");
    clock.advance(30_000);
    engine.update(EntityKind::Poi, "local-42", payload(json!({"color": "#ff0000"})));

    assert_eq!(engine.queue().len(), 1);
    let cached = engine.cache().get(EntityKind::Poi, "local-42").expect("optimistic");
    assert_eq!(cached.str_field("color"), Some("#ff0000"));

    reconnect(&mut engine);

    assert_eq!(
        engine.service().calls,
        vec![Call::Create(
            EntityKind::Poi,
            payload(json!({"title": "Ravine", "color": "#ff0000"}))
        )]
    );
    assert!(engine.queue().is_empty());
    assert_eq!(engine.cache().len(EntityKind::Poi), 1);
    assert!(engine.cache().get(EntityKind::Poi, "local-42").is_none());
    let confirmed = engine.cache().get(EntityKind::Poi, "66500001").expect("server id");
    assert_eq!(confirmed.str_field("title"), Some("Ravine"));

    // The server's own broadcast of the create is an overwrite, not a second entity.
    let echo = confirmed.clone();
    engine.handle_inbound(Inbound::PoiCreated(echo));
    assert_eq!(engine.cache().len(EntityKind::Poi), 1);
}

#[test]
fn create_then_delete_offline_makes_no_calls() {
    let clock = ManualClock::new(T0);
    let mut engine = offline_engine(&clock);

    let id = engine.create(EntityKind::Zone, payload(json!({"name": "Sector B"})));
    engine.update(EntityKind::Zone, id.clone(), payload(json!({"name": "Sector B2"})));
    engine.delete(EntityKind::Zone, id);
    assert!(engine.queue().is_empty());

    reconnect(&mut engine);
    assert!(engine.service().calls.is_empty());
    assert!(engine.cache().is_empty());
}

#[test]
fn failure_mid_flush_keeps_tail_in_order() {
    let clock = ManualClock::new(T0);
    let mut engine = offline_engine(&clock);
    engine.service_mut().fail_calls = vec![2];
    for id in ["A", "B", "C"] {
        engine
            .service_mut()
            .entities
            .insert(id.to_string(), trailsync_core::model::Entity::new(id, payload(json!({}))));
        engine.delete(EntityKind::Poi, id);
    }

    reconnect(&mut engine);

    let remaining: Vec<_> = engine.queue().actions().iter().map(|a| a.id.as_str()).collect();
    assert_eq!(remaining, vec!["B", "C"]);
    let report = engine.last_flush().expect("flushed");
    assert_eq!(report.confirmed, 1);
    assert!(report.stopped_on.is_some());

    // Next connectivity signal drains the rest.
    engine.resync(Trigger::Online);
    assert!(engine.queue().is_empty());
}

#[test]
fn edit_of_server_entity_offline_is_replayed() {
    let clock = ManualClock::new(T0);
    let mut engine = offline_engine(&clock);
    let existing = trailsync_core::model::Entity::new("p9", payload(json!({"title": "Hut"})));
    engine.service_mut().entities.insert("p9".into(), existing.clone());
    engine.reload_entities(EntityKind::Poi, vec![existing]);

    engine.update(EntityKind::Poi, "p9", payload(json!({"title": "Old hut"})));
    engine.update(EntityKind::Poi, "p9", payload(json!({"icon": "cabin"})));
    assert_eq!(engine.queue().len(), 2);

    reconnect(&mut engine);
    assert_eq!(engine.service().calls.len(), 2);
    let server = &engine.service().entities["p9"];
    assert_eq!(server.str_field("title"), Some("Old hut"));
    assert_eq!(server.str_field("icon"), Some("cabin"));
}

#[test]
fn snapshot_application_is_idempotent_and_spares_own_trace() {
    let clock = ManualClock::new(T0);
    let mut engine = offline_engine(&clock);
    reconnect(&mut engine);
    assert_eq!(engine.state(), SubscriptionState::SnapshotRequested);
    engine.record_position(PositionSample::new(7.0, 46.0, T0 - 5_000));

    let mut traces = BTreeMap::new();
    traces.insert(
        "bo".to_string(),
        vec![
            PositionSample::new(7.1, 46.1, T0 - 2_000),
            PositionSample::new(7.2, 46.2, T0 - 1_000),
        ],
    );
    traces.insert("ana".to_string(), vec![PositionSample::new(0.0, 0.0, T0 - 100)]);
    let mut positions = BTreeMap::new();
    positions.insert("cy".to_string(), PositionSample::new(7.3, 46.3, T0 - 50));
    let snapshot = SnapshotMessage {
        mission_id: "mission-7".into(),
        positions,
        traces,
        retention_seconds: Some(3_600),
    };

    engine.handle_inbound(Inbound::Snapshot(snapshot.clone()));
    let once = engine.traces().clone();
    engine.handle_inbound(Inbound::Snapshot(snapshot));
    assert_eq!(engine.traces(), &once);

    assert_eq!(engine.state(), SubscriptionState::Synced);
    assert_eq!(engine.traces().trace("ana"), vec![PositionSample::new(7.0, 46.0, T0 - 5_000)]);
    assert_eq!(engine.traces().trace_len("bo"), 2);
    assert!(engine.traces().last_known("cy").is_some());

    // Live fixes replayed after the snapshot are deduplicated by timestamp.
    let replay = Inbound::PositionUpdate(PeerPosition {
        user_id: "bo".into(),
        sample: PositionSample::new(7.2, 46.2, T0 - 1_000),
    });
    engine.handle_inbound(replay);
    assert_eq!(engine.traces().trace_len("bo"), 2);
}

#[test]
fn shrinking_retention_purges_without_waiting_for_tick() {
    let clock = ManualClock::new(T0);
    let mut engine = offline_engine(&clock);
    for ms_ago in [3_300_000_i64, 2_400_000, 1_200_000, 600_000, 30_000, 0] {
        engine.record_position(PositionSample::new(7.0, 46.0, T0 - ms_ago));
    }
    assert_eq!(engine.traces().trace_len("ana"), 6);

    let change = engine.set_retention_seconds(60);
    assert_eq!(change, RetentionChange::Shrunk { dropped: 4 });
    assert_eq!(engine.traces().trace_len("ana"), 2);
}

#[test]
fn silent_peer_drains_on_purge_ticks() {
    let clock = ManualClock::new(T0);
    let mut engine = offline_engine(&clock);
    engine.set_retention_seconds(10);
    engine.handle_inbound(Inbound::PositionUpdate(PeerPosition {
        user_id: "bo".into(),
        sample: PositionSample::new(7.0, 46.0, T0),
    }));
    assert_eq!(engine.traces().trace_len("bo"), 1);

    for _ in 0..6 {
        clock.advance(2_000);
        engine.tick();
    }
    assert_eq!(engine.traces().trace_len("bo"), 0);
    assert!(engine.traces().last_known("bo").is_none());
}

#[test]
fn mission_retention_broadcast_growth_requests_snapshot() {
    let clock = ManualClock::new(T0);
    let mut engine = offline_engine(&clock);
    reconnect(&mut engine);
    engine.channel_mut().sent.clear();

    engine.handle_inbound(Inbound::MissionUpdated {
        mission_id: "mission-7".into(),
        retention_seconds: Some(7_200),
    });
    assert_eq!(engine.channel().events(), vec!["mission:snapshot:request"]);
    assert_eq!(engine.traces().retention_ms(), 7_200_000);
}

#[test]
fn anonymous_create_conflict_retires_local_id_and_queue_drains() {
    let clock = ManualClock::new(T0);
    let mut engine = offline_engine(&clock);
    engine.service_mut().anonymous_conflicts = true;

    let local = engine.create(EntityKind::Zone, payload(json!({"title": "Camp"})));
    reconnect(&mut engine);

    assert_eq!(engine.service().creates(), 1);
    assert!(engine.queue().is_empty());
    assert!(engine.cache().get(EntityKind::Zone, &local).is_none());

    // An edit racing the conflict still names the local id; it can never resolve.
    clock.advance(1_000);
    engine.update(EntityKind::Zone, local.clone(), payload(json!({"title": "Base"})));
    for _ in 0..3 {
        engine.resync(Trigger::Online);
    }

    assert!(engine.queue().is_empty());
    assert_eq!(engine.service().calls.len(), 1);
    assert!(engine.cache().get(EntityKind::Zone, &local).is_none());
}

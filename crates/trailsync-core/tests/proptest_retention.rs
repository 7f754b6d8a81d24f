use proptest::prelude::*;
use std::collections::BTreeSet;

use trailsync_core::model::{Entity, EntityKind, Payload, PositionSample, is_local_id};
use trailsync_core::queue::{
    ConfirmationSink, MutationError, MutationService, OfflineQueue, PendingAction,
};
use trailsync_core::trace::{TraceStore, max_trace_points};

const T0: i64 = 1_700_000_000_000;
const SUBJECTS: [&str; 3] = ["ana", "bo", "cy"];

#[derive(Debug, Clone)]
enum TraceOp {
    Append { subject: usize, offset_ms: i64 },
    Advance { ms: i64 },
    SetRetention { seconds: u64 },
}

fn arb_trace_op() -> impl Strategy<Value = TraceOp> {
    prop_oneof![
        6 => (0..SUBJECTS.len(), -90_000_i64..5_000).prop_map(|(subject, offset_ms)| {
            TraceOp::Append { subject, offset_ms }
        }),
        3 => (0_i64..20_000).prop_map(|ms| TraceOp::Advance { ms }),
        1 => (1_u64..120).prop_map(|seconds| TraceOp::SetRetention { seconds }),
    ]
}

fn assert_ordered_and_capped(store: &TraceStore) -> Result<(), TestCaseError> {
    for subject in SUBJECTS {
        let trace = store.trace(subject);
        prop_assert!(trace.len() <= max_trace_points(store.retention_ms()));
        prop_assert!(trace.windows(2).all(|w| w[0].t < w[1].t), "{subject} not strictly ordered");
    }
    Ok(())
}

fn assert_within_window(store: &TraceStore, now: i64) -> Result<(), TestCaseError> {
    let floor = now - i64::try_from(store.retention_ms()).unwrap_or(i64::MAX);
    for subject in SUBJECTS {
        prop_assert!(store.trace(subject).iter().all(|s| s.t >= floor));
        prop_assert!(store.last_known(subject).is_none_or(|s| s.t >= floor));
    }
    Ok(())
}

struct AlwaysOk {
    creates: usize,
    local_targets: usize,
}

impl MutationService for AlwaysOk {
    fn create(&mut self, _: EntityKind, _: &str, p: &Payload) -> Result<Entity, MutationError> {
        self.creates += 1;
        Ok(Entity::new(format!("srv-{}", self.creates), p.clone()))
    }

    fn update(
        &mut self,
        _: EntityKind,
        _: &str,
        id: &str,
        p: &Payload,
    ) -> Result<Entity, MutationError> {
        if is_local_id(id) {
            self.local_targets += 1;
        }
        Ok(Entity::new(id, p.clone()))
    }

    fn delete(&mut self, _: EntityKind, _: &str, id: &str) -> Result<(), MutationError> {
        if is_local_id(id) {
            self.local_targets += 1;
        }
        Ok(())
    }
}

struct Ignore;

impl ConfirmationSink for Ignore {
    fn create_confirmed(&mut self, _: EntityKind, _: &str, _: Entity) {}
    fn update_confirmed(&mut self, _: EntityKind, _: Entity) {}
    fn delete_confirmed(&mut self, _: EntityKind, _: &str) {}
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(512))]

    #[test]
    fn retention_invariant_holds(ops in proptest::collection::vec(arb_trace_op(), 1..200)) {
        let mut store = TraceStore::new(60_000);
        let mut now = T0;
        for op in ops {
            match op {
                TraceOp::Append { subject, offset_ms } => {
                    let sample = PositionSample::new(7.0, 46.0, now + offset_ms);
                    store.append(SUBJECTS[subject], sample, now);
                }
                TraceOp::Advance { ms } => {
                    now += ms;
                    store.purge_tick(now);
                    assert_within_window(&store, now)?;
                }
                TraceOp::SetRetention { seconds } => {
                    store.set_retention(seconds * 1_000, now);
                    store.purge_tick(now);
                    assert_within_window(&store, now)?;
                }
            }
            assert_ordered_and_capped(&store)?;
        }
    }

    #[test]
    fn compacted_log_creates_each_surviving_entity_once(
        script in proptest::collection::vec((0_usize..4, 0_u8..3), 1..40)
    ) {
        let mut queue = OfflineQueue::default();
        let mut alive: BTreeSet<usize> = BTreeSet::new();
        let mut created: BTreeSet<usize> = BTreeSet::new();
        for (t, (entity, verb)) in (0_i64..).zip(script) {
            let id = format!("local-{entity}");
            match verb {
                0 if !created.contains(&entity) => {
                    queue.enqueue(PendingAction::create(EntityKind::Poi, id, Payload::new(), t));
                    created.insert(entity);
                    alive.insert(entity);
                }
                1 if alive.contains(&entity) => {
                    queue.enqueue(PendingAction::update(EntityKind::Poi, id, Payload::new(), t));
                }
                2 if alive.contains(&entity) => {
                    queue.enqueue(PendingAction::delete(EntityKind::Poi, id, t));
                    alive.remove(&entity);
                }
                _ => {}
            }
        }

        let mut service = AlwaysOk { creates: 0, local_targets: 0 };
        let report = queue.flush("m1", true, &mut service, &mut Ignore);
        prop_assert_eq!(service.creates, alive.len());
        prop_assert_eq!(service.local_targets, 0);
        prop_assert!(queue.is_empty());
        prop_assert_eq!(report.deferred, 0);
    }
}

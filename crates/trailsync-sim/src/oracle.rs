use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use trailsync_core::model::{Entity, EntityKind, PositionSample, is_local_id};

use crate::client::ClientOutcome;
use crate::network::ClientId;
use crate::server::ServerState;

/// Coordinates survive a JSON round trip to within this.
const COORD_EPSILON: f64 = 1e-9;

/// Outcome of one or more invariant checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OracleResult {
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    #[must_use]
    pub const fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "invariant", rename_all = "snake_case")]
pub enum InvariantViolation {
    /// Actions still queued after the network healed.
    QueueNotDrained { client: ClientId, remaining: usize },
    /// An optimistic entity was never swapped for its confirmed version.
    UnswappedLocalId {
        client: ClientId,
        kind: EntityKind,
        id: String,
    },
    /// One user-created entity shows up twice in a client's cache.
    DuplicateInCache { client: ClientId, title: String },
    /// A create reached the server more than once.
    DuplicateOnServer { title: String, count: usize },
    /// A create the user never undid is missing on the server.
    MissingOnServer { title: String },
    /// A deleted entity still exists on the server.
    Resurrected { title: String, count: usize },
    /// A server entity no user intended to create.
    Phantom { kind: EntityKind, id: String },
    /// Cache and server disagree after the final reload.
    CacheDivergence {
        client: ClientId,
        kind: EntityKind,
        only_in_cache: Vec<String>,
        only_on_server: Vec<String>,
        differing: Vec<String>,
    },
    /// A held sample is older than the retention window.
    RetentionBreach {
        client: ClientId,
        subject: String,
        t: i64,
        floor: i64,
    },
    /// A trace is not strictly ordered by time.
    TraceOutOfOrder { client: ClientId, subject: String },
    /// A trace holds more points than its cap.
    TraceOverCap {
        client: ClientId,
        subject: String,
        len: usize,
        cap: usize,
    },
    /// A client holds a sample its subject never recorded.
    FabricatedSample {
        client: ClientId,
        subject: String,
        t: i64,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueNotDrained { client, remaining } => {
                write!(f, "QueueNotDrained: client {client} still holds {remaining} action(s)")
            }
            Self::UnswappedLocalId { client, kind, id } => {
                write!(f, "UnswappedLocalId: client {client} still caches {kind} {id}")
            }
            Self::DuplicateInCache { client, title } => {
                write!(f, "DuplicateInCache: client {client} shows {title:?} more than once")
            }
            Self::DuplicateOnServer { title, count } => {
                write!(f, "DuplicateOnServer: {title:?} created {count} times")
            }
            Self::MissingOnServer { title } => {
                write!(f, "MissingOnServer: {title:?} never arrived")
            }
            Self::Resurrected { title, count } => {
                write!(f, "Resurrected: deleted {title:?} still present ({count})")
            }
            Self::Phantom { kind, id } => {
                write!(f, "Phantom: server {kind} {id} has no author intent")
            }
            Self::CacheDivergence {
                client,
                kind,
                only_in_cache,
                only_on_server,
                differing,
            } => write!(
                f,
                "CacheDivergence: client {client} {kind} cache differs \
                 (only_in_cache={only_in_cache:?}, only_on_server={only_on_server:?}, \
                 differing={differing:?})"
            ),
            Self::RetentionBreach {
                client,
                subject,
                t,
                floor,
            } => write!(
                f,
                "RetentionBreach: client {client} holds {subject} sample t={t} below floor {floor}"
            ),
            Self::TraceOutOfOrder { client, subject } => {
                write!(f, "TraceOutOfOrder: client {client} trace of {subject}")
            }
            Self::TraceOverCap {
                client,
                subject,
                len,
                cap,
            } => write!(f, "TraceOverCap: client {client} trace of {subject} has {len} > {cap}"),
            Self::FabricatedSample { client, subject, t } => write!(
                f,
                "FabricatedSample: client {client} holds {subject} sample t={t} never recorded"
            ),
        }
    }
}

/// End-of-run checks over the healed system.
///
/// 1. **Drain**: every queue is empty once connectivity is back.
/// 2. **Swap**: no optimistic id survives and nothing is shown twice.
/// 3. **At most once**: every intended entity exists exactly once on the
///    server, deleted ones not at all, and nothing else.
/// 4. **Convergence**: after reloading, caches equal the server listing.
/// 5. **Retention**: traces are ordered, capped and inside the window.
/// 6. **Provenance**: every held sample was recorded by its subject.
pub struct SyncOracle;

impl SyncOracle {
    #[must_use]
    pub fn check_queues_drained(clients: &[ClientOutcome]) -> OracleResult {
        OracleResult::from_violations(
            clients
                .iter()
                .filter(|c| c.queue_len > 0)
                .map(|c| InvariantViolation::QueueNotDrained {
                    client: c.client,
                    remaining: c.queue_len,
                })
                .collect(),
        )
    }

    /// Inspect each client's cache as it stood before the final reload.
    #[must_use]
    pub fn check_optimistic_swapped(clients: &[ClientOutcome]) -> OracleResult {
        let mut violations = Vec::new();
        for client in clients {
            let mut titles = BTreeSet::new();
            for (kind, entities) in &client.settled_cache {
                for entity in entities {
                    if is_local_id(&entity.id) {
                        violations.push(InvariantViolation::UnswappedLocalId {
                            client: client.client,
                            kind: *kind,
                            id: entity.id.clone(),
                        });
                    }
                    if let Some(title) = entity.str_field("title")
                        && !titles.insert(title.to_string())
                    {
                        violations.push(InvariantViolation::DuplicateInCache {
                            client: client.client,
                            title: title.to_string(),
                        });
                    }
                }
            }
        }
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_at_most_once(clients: &[ClientOutcome], server: &ServerState) -> OracleResult {
        let mut violations = Vec::new();
        let mut intended = BTreeSet::new();
        for client in clients {
            for title in client.intended.keys() {
                intended.insert(title.as_str());
                let count = server.count_titled(title);
                if client.deleted.contains(title) {
                    if count > 0 {
                        violations.push(InvariantViolation::Resurrected {
                            title: title.clone(),
                            count,
                        });
                    }
                } else if count == 0 {
                    violations.push(InvariantViolation::MissingOnServer {
                        title: title.clone(),
                    });
                } else if count > 1 {
                    violations.push(InvariantViolation::DuplicateOnServer {
                        title: title.clone(),
                        count,
                    });
                }
            }
        }
        for (kind, entities) in &server.entities {
            for entity in entities {
                if !entity.str_field("title").is_some_and(|t| intended.contains(t)) {
                    violations.push(InvariantViolation::Phantom {
                        kind: *kind,
                        id: entity.id.clone(),
                    });
                }
            }
        }
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_cache_convergence(
        clients: &[ClientOutcome],
        server: &ServerState,
    ) -> OracleResult {
        let mut violations = Vec::new();
        for client in clients {
            for kind in [EntityKind::Poi, EntityKind::Zone] {
                let cache = by_id(client.cache.get(&kind));
                let truth = by_id(server.entities.get(&kind));
                let only_in_cache: Vec<String> = cache
                    .keys()
                    .filter(|id| !truth.contains_key(*id))
                    .map(|id| (*id).to_string())
                    .collect();
                let only_on_server: Vec<String> = truth
                    .keys()
                    .filter(|id| !cache.contains_key(*id))
                    .map(|id| (*id).to_string())
                    .collect();
                let differing: Vec<String> = cache
                    .iter()
                    .filter(|(id, entity)| truth.get(*id).is_some_and(|t| t != *entity))
                    .map(|(id, _)| (*id).to_string())
                    .collect();
                if !only_in_cache.is_empty() || !only_on_server.is_empty() || !differing.is_empty()
                {
                    violations.push(InvariantViolation::CacheDivergence {
                        client: client.client,
                        kind,
                        only_in_cache,
                        only_on_server,
                        differing,
                    });
                }
            }
        }
        OracleResult::from_violations(violations)
    }

    /// Checked against the clock reading at which the client's last purge
    /// tick ran, which is when the window is guaranteed.
    #[must_use]
    pub fn check_retention(clients: &[ClientOutcome]) -> OracleResult {
        let mut violations = Vec::new();
        for client in clients {
            let floor = client
                .now
                .saturating_sub(i64::try_from(client.retention_ms).unwrap_or(i64::MAX));
            for (subject, trace) in &client.traces {
                if let Some(oldest) = trace.iter().find(|s| s.t < floor) {
                    violations.push(InvariantViolation::RetentionBreach {
                        client: client.client,
                        subject: subject.clone(),
                        t: oldest.t,
                        floor,
                    });
                }
                if !trace.windows(2).all(|w| w[0].t < w[1].t) {
                    violations.push(InvariantViolation::TraceOutOfOrder {
                        client: client.client,
                        subject: subject.clone(),
                    });
                }
                if trace.len() > client.max_points {
                    violations.push(InvariantViolation::TraceOverCap {
                        client: client.client,
                        subject: subject.clone(),
                        len: trace.len(),
                        cap: client.max_points,
                    });
                }
            }
        }
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_sample_provenance(clients: &[ClientOutcome]) -> OracleResult {
        let recorded: BTreeMap<&str, &[PositionSample]> = clients
            .iter()
            .map(|c| (c.user_id.as_str(), c.recorded.as_slice()))
            .collect();
        let mut violations = Vec::new();
        for client in clients {
            for (subject, trace) in &client.traces {
                let source = recorded.get(subject.as_str()).copied().unwrap_or_default();
                for sample in trace {
                    if !source.iter().any(|r| same_fix(r, sample)) {
                        violations.push(InvariantViolation::FabricatedSample {
                            client: client.client,
                            subject: subject.clone(),
                            t: sample.t,
                        });
                    }
                }
            }
        }
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_all(clients: &[ClientOutcome], server: &ServerState) -> OracleResult {
        Self::check_queues_drained(clients)
            .merge(Self::check_optimistic_swapped(clients))
            .merge(Self::check_at_most_once(clients, server))
            .merge(Self::check_cache_convergence(clients, server))
            .merge(Self::check_retention(clients))
            .merge(Self::check_sample_provenance(clients))
    }
}

fn by_id(entities: Option<&Vec<Entity>>) -> BTreeMap<&str, &Entity> {
    entities
        .into_iter()
        .flatten()
        .map(|e| (e.id.as_str(), e))
        .collect()
}

fn same_fix(a: &PositionSample, b: &PositionSample) -> bool {
    a.t == b.t && (a.lng - b.lng).abs() < COORD_EPSILON && (a.lat - b.lat).abs() < COORD_EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trailsync_core::model::Payload;

    const NOW: i64 = 1_700_000_100_000;

    fn titled(id: &str, title: &str) -> Entity {
        let fields: Payload = json!({"title": title}).as_object().cloned().expect("object");
        Entity::new(id, fields)
    }

    fn client(id: ClientId, user: &str) -> ClientOutcome {
        ClientOutcome {
            client: id,
            user_id: user.into(),
            now: NOW,
            state: "synced".into(),
            queue_len: 0,
            retention_ms: 60_000,
            max_points: 2_000,
            traces: BTreeMap::new(),
            settled_cache: BTreeMap::new(),
            cache: BTreeMap::new(),
            recorded: Vec::new(),
            intended: BTreeMap::new(),
            deleted: BTreeSet::new(),
        }
    }

    fn server(entities: Vec<Entity>) -> ServerState {
        ServerState {
            retention_seconds: 60,
            entities: BTreeMap::from([(EntityKind::Poi, entities)]),
            creates_applied: 0,
        }
    }

    #[test]
    fn healthy_outcome_passes_everything() {
        let hut = titled("srv-1", "ana-poi-1");
        let fix = PositionSample::new(7.0, 46.0, NOW - 1_000);
        let mut ana = client(0, "ana");
        ana.intended.insert("ana-poi-1".into(), EntityKind::Poi);
        ana.recorded.push(fix);
        ana.traces.insert("ana".into(), vec![fix]);
        ana.settled_cache.insert(EntityKind::Poi, vec![hut.clone()]);
        ana.cache.insert(EntityKind::Poi, vec![hut.clone()]);
        let mut bo = client(1, "bo");
        bo.traces.insert("ana".into(), vec![fix]);
        bo.cache.insert(EntityKind::Poi, vec![hut.clone()]);

        let result = SyncOracle::check_all(&[ana, bo], &server(vec![hut]));
        assert!(result.passed, "{:?}", result.violations);
    }

    #[test]
    fn undrained_queue_is_reported() {
        let mut ana = client(0, "ana");
        ana.queue_len = 2;
        let result = SyncOracle::check_queues_drained(&[ana]);
        assert_eq!(
            result.violations,
            vec![InvariantViolation::QueueNotDrained {
                client: 0,
                remaining: 2
            }]
        );
    }

    #[test]
    fn double_create_and_leftover_delete_are_caught() {
        let mut ana = client(0, "ana");
        ana.intended.insert("twice".into(), EntityKind::Poi);
        ana.intended.insert("gone".into(), EntityKind::Poi);
        ana.intended.insert("lost".into(), EntityKind::Poi);
        ana.deleted.insert("gone".into());
        let state = server(vec![
            titled("a", "twice"),
            titled("b", "twice"),
            titled("c", "gone"),
            titled("d", "stranger"),
        ]);
        let result = SyncOracle::check_at_most_once(&[ana], &state);
        assert!(!result.passed);
        let rendered: Vec<String> = result.violations.iter().map(ToString::to_string).collect();
        assert!(rendered.iter().any(|v| v.starts_with("DuplicateOnServer")));
        assert!(rendered.iter().any(|v| v.starts_with("Resurrected")));
        assert!(rendered.iter().any(|v| v.starts_with("MissingOnServer")));
        assert!(rendered.iter().any(|v| v.starts_with("Phantom")));
    }

    #[test]
    fn optimistic_leftovers_are_caught() {
        let mut ana = client(0, "ana");
        ana.settled_cache.insert(
            EntityKind::Poi,
            vec![titled("local-abc-1-000001", "Ford"), titled("srv-2", "Ford")],
        );
        let result = SyncOracle::check_optimistic_swapped(&[ana]);
        assert_eq!(result.violations.len(), 2);
    }

    #[test]
    fn cache_divergence_lists_each_side() {
        let mut ana = client(0, "ana");
        ana.cache
            .insert(EntityKind::Poi, vec![titled("x", "X"), titled("y", "old")]);
        let state = server(vec![titled("y", "new"), titled("z", "Z")]);
        let result = SyncOracle::check_cache_convergence(&[ana], &state);
        assert_eq!(
            result.violations,
            vec![InvariantViolation::CacheDivergence {
                client: 0,
                kind: EntityKind::Poi,
                only_in_cache: vec!["x".into()],
                only_on_server: vec!["z".into()],
                differing: vec!["y".into()],
            }]
        );
    }

    #[test]
    fn stale_unordered_or_fabricated_samples_fail() {
        let mut ana = client(0, "ana");
        let old = PositionSample::new(7.0, 46.0, NOW - 61_000);
        let late = PositionSample::new(7.0, 46.0, NOW - 1_000);
        ana.recorded = vec![old, late];
        ana.traces.insert("ana".into(), vec![late, old]);
        ana.traces
            .insert("ghost".into(), vec![PositionSample::new(1.0, 1.0, NOW)]);

        let retention = SyncOracle::check_retention(std::slice::from_ref(&ana));
        assert!(
            retention
                .violations
                .iter()
                .any(|v| matches!(v, InvariantViolation::RetentionBreach { .. }))
        );
        assert!(
            retention
                .violations
                .iter()
                .any(|v| matches!(v, InvariantViolation::TraceOutOfOrder { .. }))
        );

        let provenance = SyncOracle::check_sample_provenance(&[ana]);
        assert_eq!(
            provenance.violations,
            vec![InvariantViolation::FabricatedSample {
                client: 0,
                subject: "ghost".into(),
                t: NOW
            }]
        );
    }

    #[test]
    fn merge_accumulates_failures() {
        let failed = OracleResult::from_violations(vec![InvariantViolation::MissingOnServer {
            title: "x".into(),
        }]);
        let merged = OracleResult::pass().merge(failed).merge(OracleResult::pass());
        assert!(!merged.passed);
        assert_eq!(merged.violations.len(), 1);
    }
}

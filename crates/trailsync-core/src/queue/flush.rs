//! Replaying the offline log against the mutation service.
//!
//! # Rules
//!
//! 1. Actions are sent strictly in log order, one call at a time.
//! 2. A confirmed create records `local id → server id` for the rest of the
//!    pass and lets the entity cache swap its optimistic copy.
//! 3. An update/delete whose local target has no mapping yet is deferred:
//!    it stays in the log and the pass continues.
//! 4. The first transport or service failure ends the pass. The failing
//!    action and everything after it stay queued in their original order;
//!    actions confirmed earlier in the pass are gone.
//! 5. Conflicts (the entity already exists, or is already gone for a delete)
//!    count as confirmed. A create conflict that does not name the existing
//!    entity retires the local id: the optimistic copy is dropped and any
//!    action still targeting that id is discarded, now or in a later pass.
//!
//! Before the pass ends, still-queued actions are rewritten through the
//! pass's mapping so a later pass never needs the mapping again.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{OfflineQueue, PendingAction};
use crate::error::ErrorCode;
use crate::model::{Entity, EntityKind, Op, Payload};

/// The REST surface for POI and zone mutations.
///
/// One implementation call per queued action; implementations must not
/// retry internally, the queue owns retry.
pub trait MutationService {
    /// `createPOI` / `createZone`. Returns the persisted entity with its
    /// server-assigned id.
    fn create(
        &mut self,
        kind: EntityKind,
        mission_id: &str,
        payload: &Payload,
    ) -> Result<Entity, MutationError>;

    /// `updatePOI` / `updateZone`.
    fn update(
        &mut self,
        kind: EntityKind,
        mission_id: &str,
        id: &str,
        patch: &Payload,
    ) -> Result<Entity, MutationError>;

    /// `deletePOI` / `deleteZone`.
    fn delete(&mut self, kind: EntityKind, mission_id: &str, id: &str)
    -> Result<(), MutationError>;
}

/// Failure modes of a single mutation call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MutationError {
    /// Network error, timeout or dropped connection.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The service answered with a non-success status.
    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The entity already exists. `existing` carries it when the service
    /// reports which one.
    #[error("entity already exists")]
    Conflict { existing: Option<Entity> },

    #[error("entity {0} not found")]
    NotFound(String),
}

impl MutationError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Transport(_) => ErrorCode::MutationTransport,
            Self::Rejected { .. } | Self::NotFound(_) => ErrorCode::MutationRejected,
            Self::Conflict { .. } => ErrorCode::EntityConflict,
        }
    }
}

/// Receiver of server confirmations during a flush, typically the entity
/// cache.
pub trait ConfirmationSink {
    /// A create was acknowledged: replace `local_id` with `entity`.
    fn create_confirmed(&mut self, kind: EntityKind, local_id: &str, entity: Entity);
    fn update_confirmed(&mut self, kind: EntityKind, entity: Entity);
    fn delete_confirmed(&mut self, kind: EntityKind, id: &str);
}

/// Where a flush pass stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlushStop {
    pub entity: EntityKind,
    pub op: Op,
    pub id: String,
    pub code: &'static str,
    pub error: String,
}

/// Summary of one flush pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlushReport {
    /// Service calls made.
    pub attempted: usize,
    /// Actions removed from the log as applied.
    pub confirmed: usize,
    /// Actions kept because their local target is unresolved.
    pub deferred: usize,
    /// Actions dropped because their local target was retired.
    pub discarded: usize,
    /// Log length after the pass.
    pub remaining: usize,
    /// `(local id, server id)` pairs established in this pass.
    pub mappings: Vec<(String, String)>,
    pub stopped_on: Option<FlushStop>,
}

impl FlushReport {
    /// A pass that did nothing (empty log or no connection).
    #[must_use]
    pub fn idle(remaining: usize) -> Self {
        Self {
            remaining,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.attempted == 0 && self.deferred == 0 && self.discarded == 0
    }
}

enum Step {
    Confirmed,
    Deferred,
    Discarded,
    Failed(MutationError),
}

impl OfflineQueue {
    /// Replay the log in order. See the module docs for the rules.
    ///
    /// No-op when the log is empty or `connected` is false.
    pub fn flush(
        &mut self,
        mission_id: &str,
        connected: bool,
        service: &mut dyn MutationService,
        sink: &mut dyn ConfirmationSink,
    ) -> FlushReport {
        self.flush_checkpointed(mission_id, connected, service, sink, &mut |_| {})
    }

    /// [`flush`](Self::flush), calling `checkpoint` with the log as it
    /// would be persisted after every confirmed action. Ids already mapped
    /// in this pass are rewritten in the checkpointed log.
    pub fn flush_checkpointed(
        &mut self,
        mission_id: &str,
        connected: bool,
        service: &mut dyn MutationService,
        sink: &mut dyn ConfirmationSink,
        checkpoint: &mut dyn FnMut(&[PendingAction]),
    ) -> FlushReport {
        if !connected || self.actions.is_empty() {
            return FlushReport::idle(self.actions.len());
        }

        let mut report = FlushReport::default();
        let mut resolved: HashMap<String, String> = HashMap::new();
        let mut kept: Vec<PendingAction> = Vec::new();

        let mut pending = std::mem::take(&mut self.actions).into_iter();
        while let Some(action) = pending.next() {
            let step = send(
                mission_id,
                &action,
                &mut resolved,
                &mut self.retired,
                service,
                sink,
                &mut report,
            );
            match step {
                Step::Confirmed => {
                    report.confirmed += 1;
                    checkpoint(&remaining(&kept, pending.as_slice(), &resolved));
                }
                Step::Deferred => {
                    debug!(
                        id = %action.id,
                        op = %action.op,
                        "deferring action on unresolved local id"
                    );
                    report.deferred += 1;
                    kept.push(action);
                }
                Step::Discarded => {
                    warn!(
                        id = %action.id,
                        op = %action.op,
                        entity = %action.entity,
                        "discarding action on retired local id"
                    );
                    report.discarded += 1;
                    checkpoint(&remaining(&kept, pending.as_slice(), &resolved));
                }
                Step::Failed(error) => {
                    warn!(
                        id = %action.id,
                        op = %action.op,
                        entity = %action.entity,
                        %error,
                        "flush stopped, keeping remaining actions"
                    );
                    report.stopped_on = Some(FlushStop {
                        entity: action.entity,
                        op: action.op,
                        id: action.id.clone(),
                        code: error.code().code(),
                        error: error.to_string(),
                    });
                    kept.push(action);
                    kept.extend(pending.by_ref());
                    break;
                }
            }
        }

        rewrite_ids(&mut kept, &resolved);

        self.actions = kept;
        report.remaining = self.actions.len();
        let mut mappings: Vec<(String, String)> = resolved.into_iter().collect();
        mappings.sort();
        report.mappings = mappings;

        info!(
            attempted = report.attempted,
            confirmed = report.confirmed,
            deferred = report.deferred,
            discarded = report.discarded,
            remaining = report.remaining,
            "flush pass finished"
        );
        report
    }
}

fn rewrite_ids(actions: &mut [PendingAction], resolved: &HashMap<String, String>) {
    for action in actions {
        if let Some(server_id) = resolved.get(&action.id) {
            action.id.clone_from(server_id);
        }
    }
}

fn remaining(
    kept: &[PendingAction],
    rest: &[PendingAction],
    resolved: &HashMap<String, String>,
) -> Vec<PendingAction> {
    let mut log: Vec<PendingAction> = kept.iter().chain(rest).cloned().collect();
    rewrite_ids(&mut log, resolved);
    log
}

fn send(
    mission_id: &str,
    action: &PendingAction,
    resolved: &mut HashMap<String, String>,
    retired: &mut BTreeSet<String>,
    service: &mut dyn MutationService,
    sink: &mut dyn ConfirmationSink,
    report: &mut FlushReport,
) -> Step {
    if action.op == Op::Create {
        report.attempted += 1;
        return match service.create(action.entity, mission_id, &action.payload) {
            Ok(entity) | Err(MutationError::Conflict { existing: Some(entity) }) => {
                resolved.insert(action.id.clone(), entity.id.clone());
                sink.create_confirmed(action.entity, &action.id, entity);
                Step::Confirmed
            }
            Err(MutationError::Conflict { existing: None }) => {
                warn!(
                    id = %action.id,
                    entity = %action.entity,
                    "create conflicted without canonical entity, retiring local id"
                );
                sink.delete_confirmed(action.entity, &action.id);
                retired.insert(action.id.clone());
                Step::Confirmed
            }
            Err(error) => Step::Failed(error),
        };
    }

    let target = if action.targets_local_id() {
        match resolved.get(&action.id) {
            Some(server_id) => server_id.clone(),
            None if retired.contains(&action.id) => return Step::Discarded,
            None => return Step::Deferred,
        }
    } else {
        action.id.clone()
    };

    report.attempted += 1;
    if action.op == Op::Update {
        match service.update(action.entity, mission_id, &target, &action.payload) {
            Ok(entity) | Err(MutationError::Conflict { existing: Some(entity) }) => {
                sink.update_confirmed(action.entity, entity);
                Step::Confirmed
            }
            Err(MutationError::Conflict { existing: None }) => Step::Confirmed,
            Err(MutationError::NotFound(_)) => {
                warn!(
                    id = %target,
                    entity = %action.entity,
                    "update target gone server-side, dropping"
                );
                sink.delete_confirmed(action.entity, &target);
                Step::Confirmed
            }
            Err(error) => Step::Failed(error),
        }
    } else {
        match service.delete(action.entity, mission_id, &target) {
            Ok(()) | Err(MutationError::NotFound(_) | MutationError::Conflict { .. }) => {
                sink.delete_confirmed(action.entity, &target);
                Step::Confirmed
            }
            Err(error) => Step::Failed(error),
        }
    }
}

//! Ordered log of entity mutations awaiting server acknowledgement.
//!
//! Every user mutation lands here first, online or not; being online only
//! means the log is flushed right away. The log is single-writer (the local
//! client) and is persisted by its owner after every change.
//!
//! - [`compact`] folds edits of not-yet-created entities into their create.
//! - [`flush`] replays the log against the [`flush::MutationService`].

pub mod compact;
pub mod flush;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::TimestampMs;
use crate::model::{EntityKind, Op, Payload, is_local_id};

pub use compact::Compaction;
pub use flush::{ConfirmationSink, FlushReport, FlushStop, MutationError, MutationService};

/// Default bound on retained actions. Best effort, not a correctness limit.
pub const DEFAULT_QUEUE_CAP: usize = 5_000;

/// One queued mutation. `id` is a server id or a local id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub entity: EntityKind,
    pub op: Op,
    pub id: String,
    #[serde(default)]
    pub payload: Payload,
    pub t: TimestampMs,
}

impl PendingAction {
    #[must_use]
    pub fn create(
        entity: EntityKind,
        local_id: impl Into<String>,
        payload: Payload,
        t: TimestampMs,
    ) -> Self {
        Self {
            entity,
            op: Op::Create,
            id: local_id.into(),
            payload,
            t,
        }
    }

    #[must_use]
    pub fn update(
        entity: EntityKind,
        id: impl Into<String>,
        patch: Payload,
        t: TimestampMs,
    ) -> Self {
        Self {
            entity,
            op: Op::Update,
            id: id.into(),
            payload: patch,
            t,
        }
    }

    #[must_use]
    pub fn delete(entity: EntityKind, id: impl Into<String>, t: TimestampMs) -> Self {
        Self {
            entity,
            op: Op::Delete,
            id: id.into(),
            payload: Payload::new(),
            t,
        }
    }

    /// True while the target is still a client placeholder.
    #[must_use]
    pub fn targets_local_id(&self) -> bool {
        is_local_id(&self.id)
    }
}

/// The offline action log.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineQueue {
    actions: Vec<PendingAction>,
    cap: usize,
    /// Local ids whose create conflicted without naming the server entity.
    /// Later edits of these ids can never resolve and are discarded.
    retired: BTreeSet<String>,
}

impl OfflineQueue {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            actions: Vec::new(),
            cap: cap.max(1),
            retired: BTreeSet::new(),
        }
    }

    /// Rebuild from persisted actions, applying the cap.
    #[must_use]
    pub fn restore(actions: Vec<PendingAction>, cap: usize) -> Self {
        let mut queue = Self {
            actions,
            cap: cap.max(1),
            retired: BTreeSet::new(),
        };
        queue.enforce_cap();
        queue
    }

    /// Compact `action` into the log, then enforce the cap.
    pub fn enqueue(&mut self, action: PendingAction) -> Compaction {
        let outcome = compact::compact_into(&mut self.actions, action);
        self.enforce_cap();
        outcome
    }

    #[must_use]
    pub fn actions(&self) -> &[PendingAction] {
        &self.actions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Whether `local_id` belongs to a create that conflicted anonymously.
    #[must_use]
    pub fn is_retired(&self, local_id: &str) -> bool {
        self.retired.contains(local_id)
    }

    #[must_use]
    pub const fn cap(&self) -> usize {
        self.cap
    }

    fn enforce_cap(&mut self) {
        if self.actions.len() > self.cap {
            let excess = self.actions.len() - self.cap;
            warn!(excess, cap = self.cap, "offline queue over capacity, dropping oldest actions");
            self.actions.drain(..excess);
        }
    }
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAP)
    }
}

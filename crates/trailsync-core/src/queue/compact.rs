//! Enqueue-time compaction for the offline action log.
//!
//! While an entity exists only locally, every later edit can be folded into
//! its pending create, and deleting it cancels the create outright. The log
//! therefore grows with the number of distinct entities touched, not with
//! the number of edits.
//!
//! Only those two chains are compacted. `update → update` is left alone
//! (the later call wins server-side), and anything targeting a server id is
//! always appended verbatim.

use tracing::debug;

use super::PendingAction;
use crate::model::{Op, is_local_id, merge_payload};

/// What compaction did with an incoming action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compaction {
    /// Appended at the tail.
    Appended,
    /// Payload merged into the queued create at `index`; the update itself
    /// was dropped.
    MergedIntoCreate { index: usize },
    /// The queued create and `removed - 1` other actions for the same local
    /// id were removed together with the incoming delete.
    Collapsed { removed: usize },
}

/// Fold `action` into `log`, appending only when no chain applies.
pub fn compact_into(log: &mut Vec<PendingAction>, action: PendingAction) -> Compaction {
    if !is_local_id(&action.id) || action.op == Op::Create {
        log.push(action);
        return Compaction::Appended;
    }

    let Some(index) = find_create(log, &action) else {
        log.push(action);
        return Compaction::Appended;
    };

    if action.op == Op::Update {
        merge_payload(&mut log[index].payload, &action.payload);
        debug!(id = %action.id, entity = %action.entity, "update folded into pending create");
        return Compaction::MergedIntoCreate { index };
    }

    let before = log.len();
    log.retain(|queued| !(queued.entity == action.entity && queued.id == action.id));
    let removed = before - log.len();
    debug!(id = %action.id, entity = %action.entity, removed, "create/delete collapsed");
    Compaction::Collapsed { removed }
}

fn find_create(log: &[PendingAction], action: &PendingAction) -> Option<usize> {
    log.iter().position(|queued| {
        queued.op == Op::Create && queued.entity == action.entity && queued.id == action.id
    })
}

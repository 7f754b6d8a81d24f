//! Retention-bounded position trails for the local operator and every peer.
//!
//! # Invariants
//!
//! - Each trace is sorted by `t` with no two samples sharing a `t`.
//! - After any public operation that takes `now`, the touched traces hold no
//!   sample older than `now - retention` and at most
//!   [`max_trace_points`] samples (oldest dropped first).
//! - Eviction is event-driven on append and periodic via [`TraceStore::purge_tick`],
//!   so a subject that goes silent still drains to empty.
//! - Growing the window never resurrects purged samples; the caller is told
//!   to request a snapshot instead.

pub mod retention;

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, trace};

use crate::clock::TimestampMs;
use crate::model::{PositionSample, SubjectId};

pub use retention::{MIN_TRACE_POINTS, cutoff, max_trace_points};

/// What [`TraceStore::append`] did with a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// A sample with the same `t` is already held for this subject.
    Duplicate,
    /// Non-finite coordinates.
    Malformed,
    /// Older than the retention cutoff; evicted on arrival.
    Expired,
}

/// Effect of a retention change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionChange {
    Unchanged,
    Shrunk { dropped: usize },
    /// History beyond the old window is gone locally; ask the server.
    Grew,
}

/// Per-subject ordered traces plus a last-known-position map.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceStore {
    retention_ms: u64,
    traces: BTreeMap<SubjectId, VecDeque<PositionSample>>,
    positions: BTreeMap<SubjectId, PositionSample>,
}

impl TraceStore {
    #[must_use]
    pub fn new(retention_ms: u64) -> Self {
        Self {
            retention_ms,
            traces: BTreeMap::new(),
            positions: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn retention_ms(&self) -> u64 {
        self.retention_ms
    }

    /// Current per-trace cap.
    #[must_use]
    pub fn max_points(&self) -> usize {
        max_trace_points(self.retention_ms)
    }

    /// Insert one sample for `subject`, then evict that subject's trace.
    pub fn append(
        &mut self,
        subject: &str,
        sample: PositionSample,
        now: TimestampMs,
    ) -> AppendOutcome {
        if !sample.is_well_formed() {
            debug!(subject, t = sample.t, "dropping malformed position sample");
            return AppendOutcome::Malformed;
        }

        let floor = cutoff(now, self.retention_ms);
        if sample.t < floor {
            trace!(subject, t = sample.t, floor, "sample already outside retention");
            return AppendOutcome::Expired;
        }

        let buffer = self.traces.entry(subject.to_string()).or_default();
        if !insert_sorted(buffer, sample) {
            return AppendOutcome::Duplicate;
        }

        let max_points = max_trace_points(self.retention_ms);
        evict(buffer, floor, max_points);
        self.note_position(subject, sample);
        AppendOutcome::Inserted
    }

    /// Insert many samples for one subject; returns how many were kept.
    ///
    /// Used for `position:bulk` and restore. Eviction runs once at the end.
    pub fn extend(
        &mut self,
        subject: &str,
        samples: impl IntoIterator<Item = PositionSample>,
        now: TimestampMs,
    ) -> usize {
        let floor = cutoff(now, self.retention_ms);
        let max_points = max_trace_points(self.retention_ms);
        let buffer = self.traces.entry(subject.to_string()).or_default();

        let mut newest: Option<PositionSample> = None;
        let mut inserted = 0usize;
        for sample in samples {
            if !sample.is_well_formed() || sample.t < floor {
                continue;
            }
            if insert_sorted(buffer, sample) {
                inserted += 1;
                if newest.is_none_or(|n| sample.t > n.t) {
                    newest = Some(sample);
                }
            }
        }
        evict(buffer, floor, max_points);
        if buffer.is_empty() {
            self.traces.remove(subject);
        }
        if let Some(sample) = newest {
            self.note_position(subject, sample);
        }
        inserted
    }

    /// Change the retention window.
    ///
    /// Shrinking evicts every trace and the position map immediately.
    pub fn set_retention(&mut self, retention_ms: u64, now: TimestampMs) -> RetentionChange {
        let previous = self.retention_ms;
        self.retention_ms = retention_ms;
        match retention_ms.cmp(&previous) {
            std::cmp::Ordering::Equal => RetentionChange::Unchanged,
            std::cmp::Ordering::Less => {
                let dropped = self.purge(now);
                debug!(previous, retention_ms, dropped, "retention shrunk");
                RetentionChange::Shrunk { dropped }
            }
            std::cmp::Ordering::Greater => {
                debug!(previous, retention_ms, "retention grew");
                RetentionChange::Grew
            }
        }
    }

    /// Periodic eviction independent of new data. Returns samples dropped.
    pub fn purge_tick(&mut self, now: TimestampMs) -> usize {
        self.purge(now)
    }

    /// Forget a subject entirely (trace and last known position).
    pub fn clear(&mut self, subject: &str) -> bool {
        let had_trace = self.traces.remove(subject).is_some();
        let had_position = self.positions.remove(subject).is_some();
        had_trace || had_position
    }

    /// Replace every subject except `keep` with authoritative server state.
    ///
    /// Samples are filtered through the current window and cap. Replacing
    /// with the same input twice yields the same store.
    pub fn replace_peers(
        &mut self,
        keep: &str,
        positions: &BTreeMap<SubjectId, PositionSample>,
        traces: &BTreeMap<SubjectId, Vec<PositionSample>>,
        now: TimestampMs,
    ) -> usize {
        self.traces.retain(|subject, _| subject == keep);
        self.positions.retain(|subject, _| subject == keep);

        let floor = cutoff(now, self.retention_ms);
        for (subject, samples) in traces {
            if subject == keep {
                continue;
            }
            self.extend(subject, samples.iter().copied(), now);
        }
        for (subject, sample) in positions {
            if subject == keep || !sample.is_well_formed() || sample.t < floor {
                continue;
            }
            self.note_position(subject, *sample);
        }

        self.positions.keys().filter(|s| s.as_str() != keep).count()
    }

    /// Copy of one subject's trace, oldest first.
    #[must_use]
    pub fn trace(&self, subject: &str) -> Vec<PositionSample> {
        self.traces
            .get(subject)
            .map(|buffer| buffer.iter().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn trace_len(&self, subject: &str) -> usize {
        self.traces.get(subject).map_or(0, VecDeque::len)
    }

    #[must_use]
    pub fn last_known(&self, subject: &str) -> Option<PositionSample> {
        self.positions.get(subject).copied()
    }

    /// Subjects with a trace or a last known position, sorted.
    #[must_use]
    pub fn subjects(&self) -> Vec<SubjectId> {
        let mut all: Vec<SubjectId> = self
            .traces
            .keys()
            .chain(self.positions.keys())
            .cloned()
            .collect();
        all.sort();
        all.dedup();
        all
    }

    /// Every trace except `exclude`, for persistence.
    #[must_use]
    pub fn export_except(&self, exclude: &str) -> BTreeMap<SubjectId, Vec<PositionSample>> {
        self.traces
            .iter()
            .filter(|(subject, _)| subject.as_str() != exclude)
            .map(|(subject, buffer)| (subject.clone(), buffer.iter().copied().collect()))
            .collect()
    }

    #[must_use]
    pub fn total_samples(&self) -> usize {
        self.traces.values().map(VecDeque::len).sum()
    }

    fn purge(&mut self, now: TimestampMs) -> usize {
        let floor = cutoff(now, self.retention_ms);
        let max_points = max_trace_points(self.retention_ms);
        let mut dropped = 0usize;
        self.traces.retain(|_, buffer| {
            dropped += evict(buffer, floor, max_points);
            !buffer.is_empty()
        });
        self.positions.retain(|_, sample| sample.t >= floor);
        dropped
    }

    fn note_position(&mut self, subject: &str, sample: PositionSample) {
        match self.positions.get_mut(subject) {
            Some(current) if current.t > sample.t => {}
            Some(current) => *current = sample,
            None => {
                self.positions.insert(subject.to_string(), sample);
            }
        }
    }
}

/// Insert keeping `t` order. Returns false for a same-`t` duplicate.
fn insert_sorted(buffer: &mut VecDeque<PositionSample>, sample: PositionSample) -> bool {
    if buffer.back().is_none_or(|last| last.t < sample.t) {
        buffer.push_back(sample);
        return true;
    }
    let index = buffer.partition_point(|s| s.t < sample.t);
    if buffer.get(index).is_some_and(|s| s.t == sample.t) {
        return false;
    }
    buffer.insert(index, sample);
    true
}

/// Drop samples older than `floor`, then trim the front down to `max_points`.
fn evict(buffer: &mut VecDeque<PositionSample>, floor: TimestampMs, max_points: usize) -> usize {
    let before = buffer.len();
    let stale = buffer.partition_point(|s| s.t < floor);
    buffer.drain(..stale);
    if buffer.len() > max_points {
        let excess = buffer.len() - max_points;
        buffer.drain(..excess);
    }
    before - buffer.len()
}

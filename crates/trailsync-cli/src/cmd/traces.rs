//! `trailsync traces`: persisted position traces of a session, checked
//! against the configured retention window.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::{Result, bail};
use clap::Args;
use serde::Serialize;
use trailsync_core::clock::{Clock, SystemClock, TimestampMs};
use trailsync_core::config::load_config;
use trailsync_core::model::{PositionSample, SubjectId};
use trailsync_core::store::{LocalStore, Slot, StateKey, load_json};
use trailsync_core::trace::cutoff;

use crate::cmd::{SessionArgs, open_state};
use crate::output::{OutputMode, format_millis, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct TracesArgs {
    #[command(flatten)]
    pub session: SessionArgs,

    /// List the samples of one subject instead of the summary.
    #[arg(long)]
    pub subject: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceSummary {
    pub subject: SubjectId,
    /// The session's own trace rather than a peer's.
    pub own: bool,
    pub points: usize,
    pub first_t: Option<TimestampMs>,
    pub last_t: Option<TimestampMs>,
    /// Samples already older than the retention window. They are evicted
    /// on the engine's next purge tick.
    pub stale: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceReport {
    pub mission_id: String,
    pub user_id: String,
    pub retention_seconds: u64,
    pub now: TimestampMs,
    pub subjects: Vec<TraceSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub samples: Option<Vec<PositionSample>>,
}

/// Own and peer traces of a session, keyed by subject.
pub fn load_traces(
    store: &dyn LocalStore,
    mission_id: &str,
    user_id: &str,
) -> BTreeMap<SubjectId, Vec<PositionSample>> {
    let mut traces: BTreeMap<SubjectId, Vec<PositionSample>> =
        load_json(store, &StateKey::new(mission_id, user_id, Slot::PeerTraces)).unwrap_or_default();
    if let Some(own) = load_json(store, &StateKey::new(mission_id, user_id, Slot::SelfTrace)) {
        traces.insert(user_id.to_string(), own);
    }
    traces
}

#[must_use]
pub fn summarize(
    traces: &BTreeMap<SubjectId, Vec<PositionSample>>,
    self_id: &str,
    retention_ms: u64,
    now: TimestampMs,
) -> Vec<TraceSummary> {
    let floor = cutoff(now, retention_ms);
    let mut out: Vec<TraceSummary> = traces
        .iter()
        .map(|(subject, samples)| TraceSummary {
            subject: subject.clone(),
            own: subject == self_id,
            points: samples.len(),
            first_t: samples.iter().map(|s| s.t).min(),
            last_t: samples.iter().map(|s| s.t).max(),
            stale: samples.iter().filter(|s| s.t < floor).count(),
        })
        .collect();
    out.sort_by(|a, b| b.own.cmp(&a.own).then_with(|| a.subject.cmp(&b.subject)));
    out
}

/// Execute `trailsync traces`.
///
/// # Errors
///
/// Returns an error if config or store cannot be loaded, if `--subject`
/// names no stored trace, or if output fails.
pub fn run_traces(args: &TracesArgs, output: OutputMode, data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir)?;
    let store = open_state(data_dir)?;
    let SessionArgs { mission, user } = &args.session;
    let mut traces = load_traces(&store, mission, user);
    let now = SystemClock.now_ms();

    let samples = match &args.subject {
        Some(subject) => {
            let Some(samples) = traces.remove(subject) else {
                bail!("no stored trace for subject '{subject}' in {mission}/{user}");
            };
            traces = BTreeMap::from([(subject.clone(), samples.clone())]);
            Some(samples)
        }
        None => None,
    };

    let report = TraceReport {
        mission_id: mission.clone(),
        user_id: user.clone(),
        retention_seconds: config.retention_seconds,
        now,
        subjects: summarize(&traces, user, config.retention_ms(), now),
        samples,
    };
    render_mode(output, &report, render_text, render_pretty)
}

fn span(summary: &TraceSummary) -> String {
    match (summary.first_t, summary.last_t) {
        (Some(first), Some(last)) => format!("{} .. {}", format_millis(first), format_millis(last)),
        _ => "-".to_string(),
    }
}

fn render_text(report: &TraceReport, w: &mut dyn Write) -> std::io::Result<()> {
    for s in &report.subjects {
        writeln!(
            w,
            "trace subject={} own={} points={} stale={} first_t={} last_t={}",
            s.subject,
            s.own,
            s.points,
            s.stale,
            s.first_t.map_or_else(|| "-".to_string(), |t| t.to_string()),
            s.last_t.map_or_else(|| "-".to_string(), |t| t.to_string()),
        )?;
    }
    for sample in report.samples.iter().flatten() {
        writeln!(w, "sample t={} lng={} lat={}", sample.t, sample.lng, sample.lat)?;
    }
    Ok(())
}

fn render_pretty(report: &TraceReport, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, &format!("Traces {} / {}", report.mission_id, report.user_id))?;
    pretty_kv(w, "Retention", format!("{}s", report.retention_seconds))?;
    pretty_kv(w, "Now", format_millis(report.now))?;
    writeln!(w)?;
    if report.subjects.is_empty() {
        return writeln!(w, "No stored traces.");
    }
    for s in &report.subjects {
        let label = if s.own {
            format!("{} (self)", s.subject)
        } else {
            s.subject.clone()
        };
        writeln!(w, "{label:<24} {:>6} pts  {:>5} stale  {}", s.points, s.stale, span(s))?;
    }
    if let Some(samples) = &report.samples {
        writeln!(w)?;
        for sample in samples {
            writeln!(
                w,
                "  {}  {:>11.6} {:>10.6}",
                format_millis(sample.t),
                sample.lng,
                sample.lat
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trailsync_core::store::{MemoryStore, save_json};

    fn fix(t: TimestampMs) -> PositionSample {
        PositionSample::new(7.44, 46.95, t)
    }

    #[test]
    fn own_trace_is_listed_first() {
        let traces = BTreeMap::from([
            ("aaron".to_string(), vec![fix(10)]),
            ("zoe".to_string(), vec![fix(5), fix(9)]),
        ]);
        let summary = summarize(&traces, "zoe", 60_000, 20);
        assert_eq!(summary[0].subject, "zoe");
        assert!(summary[0].own);
        assert_eq!(summary[0].first_t, Some(5));
        assert_eq!(summary[0].last_t, Some(9));
        assert_eq!(summary[1].subject, "aaron");
    }

    #[test]
    fn stale_counts_samples_before_cutoff() {
        let traces = BTreeMap::from([("bo".to_string(), vec![fix(0), fix(4_999), fix(5_000)])]);
        let summary = summarize(&traces, "ana", 5_000, 10_000);
        assert_eq!(summary[0].stale, 2);
        assert_eq!(summary[0].points, 3);
    }

    #[test]
    fn load_traces_merges_self_and_peers() {
        let mut store = MemoryStore::new();
        save_json(
            &mut store,
            &StateKey::new("m1", "ana", Slot::SelfTrace),
            &vec![fix(1)],
            0,
        )
        .expect("self");
        save_json(
            &mut store,
            &StateKey::new("m1", "ana", Slot::PeerTraces),
            &BTreeMap::from([("bo".to_string(), vec![fix(2), fix(3)])]),
            0,
        )
        .expect("peers");

        let traces = load_traces(&store, "m1", "ana");
        assert_eq!(traces.len(), 2);
        assert_eq!(traces["ana"], vec![fix(1)]);
        assert_eq!(traces["bo"].len(), 2);
    }

    #[test]
    fn corrupt_slot_reads_as_empty() {
        let mut store = MemoryStore::new();
        store.put_raw(StateKey::new("m1", "ana", Slot::PeerTraces), "{not json");
        assert!(load_traces(&store, "m1", "ana").is_empty());
    }
}

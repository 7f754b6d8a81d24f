//! `trailsync status`: one line per persisted (mission, user) session.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use trailsync_core::clock::TimestampMs;
use trailsync_core::model::{PositionSample, SubjectId, Viewport};
use trailsync_core::queue::PendingAction;
use trailsync_core::store::{LocalStore, Slot, SqliteStore, StateKey, load_json};

use crate::cmd::open_state;
use crate::output::{OutputMode, format_millis, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug, Default)]
pub struct StatusArgs {
    /// Only report sessions of this mission.
    #[arg(long, short)]
    pub mission: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub mission_id: String,
    pub user_id: String,
    pub queued: usize,
    pub self_points: usize,
    pub peers: usize,
    pub peer_points: usize,
    pub viewport: Option<Viewport>,
    pub updated_at: Option<String>,
}

/// Summarize every session found in `store`, optionally for one mission.
///
/// # Errors
///
/// Returns an error if listing keys or reading write times fails.
pub fn collect_status(store: &SqliteStore, mission: Option<&str>) -> Result<Vec<SessionStatus>> {
    let mut sessions: BTreeMap<(String, String), Vec<StateKey>> = BTreeMap::new();
    for key in store.keys()? {
        if mission.is_some_and(|m| m != key.mission_id) {
            continue;
        }
        sessions
            .entry((key.mission_id.clone(), key.user_id.clone()))
            .or_default()
            .push(key);
    }

    let mut out = Vec::with_capacity(sessions.len());
    for ((mission_id, user_id), keys) in sessions {
        let mut last_write: Option<TimestampMs> = None;
        for key in &keys {
            last_write = last_write.max(store.updated_at(key)?);
        }
        let key = |slot| StateKey::new(mission_id.as_str(), user_id.as_str(), slot);
        let queued =
            load_json::<Vec<PendingAction>>(store, &key(Slot::Queue)).as_ref().map_or(0, Vec::len);
        let self_points = load_json::<Vec<PositionSample>>(store, &key(Slot::SelfTrace))
            .as_ref()
            .map_or(0, Vec::len);
        let peer_traces =
            load_json::<BTreeMap<SubjectId, Vec<PositionSample>>>(store, &key(Slot::PeerTraces))
                .unwrap_or_default();
        let viewport = load_json::<Viewport>(store, &key(Slot::Viewport));
        out.push(SessionStatus {
            queued,
            self_points,
            peers: peer_traces.len(),
            peer_points: peer_traces.values().map(Vec::len).sum(),
            viewport,
            updated_at: last_write.map(format_millis),
            mission_id,
            user_id,
        });
    }
    Ok(out)
}

/// Execute `trailsync status`.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or read, or output fails.
pub fn run_status(args: &StatusArgs, output: OutputMode, data_dir: &Path) -> Result<()> {
    let store = open_state(data_dir)?;
    let sessions = collect_status(&store, args.mission.as_deref())?;
    render_mode(output, &sessions, render_text, render_pretty)
}

fn render_text(sessions: &Vec<SessionStatus>, w: &mut dyn Write) -> std::io::Result<()> {
    for s in sessions {
        writeln!(
            w,
            "session mission={} user={} queued={} self_points={} peers={} peer_points={} viewport={} updated_at={}",
            s.mission_id,
            s.user_id,
            s.queued,
            s.self_points,
            s.peers,
            s.peer_points,
            s.viewport.is_some(),
            s.updated_at.as_deref().unwrap_or("-")
        )?;
    }
    Ok(())
}

fn render_pretty(sessions: &Vec<SessionStatus>, w: &mut dyn Write) -> std::io::Result<()> {
    if sessions.is_empty() {
        return writeln!(w, "No saved sessions.");
    }
    for (i, s) in sessions.iter().enumerate() {
        if i > 0 {
            writeln!(w)?;
        }
        pretty_section(w, &format!("{} / {}", s.mission_id, s.user_id))?;
        pretty_kv(w, "Queued", s.queued.to_string())?;
        pretty_kv(w, "Own trace", format!("{} points", s.self_points))?;
        pretty_kv(w, "Peer traces", format!("{} peers, {} points", s.peers, s.peer_points))?;
        if let Some(v) = s.viewport {
            pretty_kv(
                w,
                "Viewport",
                format!("{:.5}, {:.5} @ z{:.1}", v.center_lng, v.center_lat, v.zoom),
            )?;
        }
        pretty_kv(w, "Last write", s.updated_at.as_deref().unwrap_or("never"))?;
    }
    Ok(())
}

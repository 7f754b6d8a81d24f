//! `trailsync queue`: list the persisted offline action log of a session.

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use trailsync_core::model::{EntityKind, Op, Payload};
use trailsync_core::queue::PendingAction;
use trailsync_core::store::{Slot, StateKey, load_json};

use crate::cmd::{SessionArgs, open_state};
use crate::output::{OutputMode, format_millis, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct QueueArgs {
    #[command(flatten)]
    pub session: SessionArgs,

    /// Include each action's payload.
    #[arg(long)]
    pub payload: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueRow {
    pub position: usize,
    pub op: Op,
    pub entity: EntityKind,
    pub id: String,
    /// Target is a local id still waiting for its create to be acknowledged.
    pub local: bool,
    pub queued_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueListing {
    pub mission_id: String,
    pub user_id: String,
    pub actions: Vec<QueueRow>,
}

#[must_use]
pub fn queue_rows(actions: &[PendingAction], with_payload: bool) -> Vec<QueueRow> {
    actions
        .iter()
        .enumerate()
        .map(|(i, action)| QueueRow {
            position: i + 1,
            op: action.op,
            entity: action.entity,
            id: action.id.clone(),
            local: action.targets_local_id(),
            queued_at: format_millis(action.t),
            payload: with_payload.then(|| action.payload.clone()),
        })
        .collect()
}

/// Execute `trailsync queue`.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or output fails.
pub fn run_queue(args: &QueueArgs, output: OutputMode, data_dir: &Path) -> Result<()> {
    let store = open_state(data_dir)?;
    let key = StateKey::new(
        args.session.mission.as_str(),
        args.session.user.as_str(),
        Slot::Queue,
    );
    let actions: Vec<PendingAction> = load_json(&store, &key).unwrap_or_default();
    let listing = QueueListing {
        mission_id: args.session.mission.clone(),
        user_id: args.session.user.clone(),
        actions: queue_rows(&actions, args.payload),
    };
    render_mode(output, &listing, render_text, render_pretty)
}

fn render_text(listing: &QueueListing, w: &mut dyn Write) -> std::io::Result<()> {
    for row in &listing.actions {
        write!(
            w,
            "action pos={} op={} entity={} id={} local={} queued_at={}",
            row.position, row.op, row.entity, row.id, row.local, row.queued_at
        )?;
        if let Some(payload) = &row.payload {
            write!(w, " payload={}", serde_json::Value::Object(payload.clone()))?;
        }
        writeln!(w)?;
    }
    Ok(())
}

fn render_pretty(listing: &QueueListing, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(
        w,
        &format!(
            "Offline queue {} / {} ({} pending)",
            listing.mission_id,
            listing.user_id,
            listing.actions.len()
        ),
    )?;
    if listing.actions.is_empty() {
        return writeln!(w, "Nothing queued.");
    }
    writeln!(w, "{:>4}  {:<7} {:<5} {:<32} {}", "#", "OP", "KIND", "ID", "QUEUED")?;
    for row in &listing.actions {
        let id = if row.local {
            format!("{}*", row.id)
        } else {
            row.id.clone()
        };
        writeln!(
            w,
            "{:>4}  {:<7} {:<5} {:<32} {}",
            row.position,
            row.op.to_string(),
            row.entity.to_string(),
            id,
            row.queued_at
        )?;
        if let Some(payload) = &row.payload {
            for (field, value) in payload {
                writeln!(w, "{:>6}{field} = {value}", "")?;
            }
        }
    }
    if listing.actions.iter().any(|r| r.local) {
        writeln!(w)?;
        writeln!(w, "* target not yet acknowledged by the server")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Vec<PendingAction> {
        let mut payload = Payload::new();
        payload.insert("title".into(), json!("Checkpoint"));
        vec![
            PendingAction::create(EntityKind::Poi, "local-k3-1-00ab12", payload, 1_000),
            PendingAction::update(EntityKind::Zone, "z1", Payload::new(), 2_000),
        ]
    }

    #[test]
    fn rows_are_numbered_from_one_and_flag_local_targets() {
        let rows = queue_rows(&sample(), false);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].position, 1);
        assert!(rows[0].local);
        assert!(!rows[1].local);
        assert_eq!(rows[1].op, Op::Update);
        assert!(rows.iter().all(|r| r.payload.is_none()));
    }

    #[test]
    fn payload_is_opt_in() {
        let rows = queue_rows(&sample(), true);
        let payload = rows[0].payload.as_ref().expect("payload requested");
        assert_eq!(payload["title"], "Checkpoint");
    }

    #[test]
    fn pretty_marks_unacknowledged_targets() {
        let listing = QueueListing {
            mission_id: "m1".into(),
            user_id: "ana".into(),
            actions: queue_rows(&sample(), false),
        };
        let mut buf = Vec::new();
        render_pretty(&listing, &mut buf).expect("render");
        let text = String::from_utf8(buf).expect("utf8");
        assert!(text.contains("(2 pending)"));
        assert!(text.contains("local-k3-1-00ab12*"));
        assert!(text.contains("not yet acknowledged"));
    }

    #[test]
    fn json_omits_absent_payload() {
        let rows = queue_rows(&sample(), false);
        let value = serde_json::to_value(&rows[0]).expect("json");
        assert!(value.get("payload").is_none());
        assert_eq!(value["op"], "create");
        assert_eq!(value["entity"], "poi");
    }
}

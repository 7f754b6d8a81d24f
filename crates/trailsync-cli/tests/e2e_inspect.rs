//! E2E CLI tests for the inspection and config commands.
//!
//! Each test seeds a local state database in an isolated temp directory and
//! runs the `trailsync` binary against it.

use std::collections::BTreeMap;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;
use trailsync_core::clock::{Clock, SystemClock};
use trailsync_core::model::{EntityKind, Payload, PositionSample};
use trailsync_core::queue::PendingAction;
use trailsync_core::store::sqlite::DB_FILE_NAME;
use trailsync_core::store::{Slot, SqliteStore, StateKey, save_json};

// ---------------------------------------------------------------------------
// Test Harness
// ---------------------------------------------------------------------------

fn ts_cmd(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("trailsync"));
    cmd.arg("--data-dir").arg(dir);
    cmd.env("TRAILSYNC_LOG", "error");
    cmd.env_remove("TRAILSYNC_FORMAT");
    cmd.env_remove("TRAILSYNC_RETENTION_SECONDS");
    cmd
}

fn json_of(cmd: &mut Command) -> Value {
    let output = cmd.output().expect("command should not crash");
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("valid JSON")
}

/// Write one session the way a running engine would have left it.
fn seed_session(dir: &Path) {
    let mut store = SqliteStore::open(&dir.join(DB_FILE_NAME)).expect("open store");
    let now = SystemClock.now_ms();

    let mut payload = Payload::new();
    payload.insert("title".into(), Value::String("Water point".into()));
    let queue = vec![
        PendingAction::create(EntityKind::Poi, "local-k3-1-00ab12", payload, now - 2_000),
        PendingAction::delete(EntityKind::Zone, "srv-000007", now - 1_000),
    ];
    save_json(&mut store, &StateKey::new("m-42", "ana", Slot::Queue), &queue, now)
        .expect("queue");

    let own = vec![
        PositionSample::new(7.44, 46.95, now - 10 * 86_400_000),
        PositionSample::new(7.45, 46.96, now - 1_000),
    ];
    save_json(&mut store, &StateKey::new("m-42", "ana", Slot::SelfTrace), &own, now)
        .expect("self trace");

    let peers = BTreeMap::from([(
        "bo".to_string(),
        vec![PositionSample::new(7.40, 46.90, now - 500)],
    )]);
    save_json(&mut store, &StateKey::new("m-42", "ana", Slot::PeerTraces), &peers, now)
        .expect("peer traces");
}

fn seeded_dir() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    seed_session(dir.path());
    dir
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

#[test]
fn status_without_database_fails_with_hint() {
    let dir = TempDir::new().expect("tempdir");
    ts_cmd(dir.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no local state"));
    assert!(
        !dir.path().join(DB_FILE_NAME).exists(),
        "inspection must not create a database"
    );
}

#[test]
fn status_json_lists_session() {
    let dir = seeded_dir();
    let json = json_of(ts_cmd(dir.path()).args(["status", "--json"]));
    let sessions = json.as_array().expect("array");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["mission_id"], "m-42");
    assert_eq!(sessions[0]["user_id"], "ana");
    assert_eq!(sessions[0]["queued"], 2);
    assert_eq!(sessions[0]["self_points"], 2);
    assert_eq!(sessions[0]["peers"], 1);
}

#[test]
fn status_text_is_one_record_per_line() {
    let dir = seeded_dir();
    ts_cmd(dir.path())
        .args(["--format", "text", "status"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("session mission=m-42 user=ana queued=2"));
}

#[test]
fn status_mission_filter_excludes_others() {
    let dir = seeded_dir();
    let json = json_of(ts_cmd(dir.path()).args(["status", "--mission", "other", "--json"]));
    assert_eq!(json.as_array().map(Vec::len), Some(0));
}

// ---------------------------------------------------------------------------
// queue
// ---------------------------------------------------------------------------

#[test]
fn queue_json_preserves_replay_order() {
    let dir = seeded_dir();
    let json = json_of(ts_cmd(dir.path()).args(["queue", "-m", "m-42", "-u", "ana", "--json"]));
    let actions = json["actions"].as_array().expect("actions");
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0]["op"], "create");
    assert_eq!(actions[0]["local"], true);
    assert!(actions[0].get("payload").is_none());
    assert_eq!(actions[1]["op"], "delete");
    assert_eq!(actions[1]["id"], "srv-000007");
    assert_eq!(actions[1]["local"], false);
}

#[test]
fn queue_payload_flag_includes_fields() {
    let dir = seeded_dir();
    let json = json_of(ts_cmd(dir.path()).args([
        "queue", "-m", "m-42", "-u", "ana", "--payload", "--json",
    ]));
    assert_eq!(json["actions"][0]["payload"]["title"], "Water point");
}

#[test]
fn queue_for_unknown_session_is_empty() {
    let dir = seeded_dir();
    let json = json_of(ts_cmd(dir.path()).args(["queue", "-m", "m-42", "-u", "zed", "--json"]));
    assert_eq!(json["actions"].as_array().map(Vec::len), Some(0));
}

// ---------------------------------------------------------------------------
// traces
// ---------------------------------------------------------------------------

#[test]
fn traces_flag_samples_outside_retention() {
    let dir = seeded_dir();
    let json = json_of(ts_cmd(dir.path()).args(["traces", "-m", "m-42", "-u", "ana", "--json"]));
    assert_eq!(json["retention_seconds"], 3_600);
    let subjects = json["subjects"].as_array().expect("subjects");
    assert_eq!(subjects.len(), 2);
    assert_eq!(subjects[0]["subject"], "ana");
    assert_eq!(subjects[0]["own"], true);
    assert_eq!(subjects[0]["points"], 2);
    assert_eq!(subjects[0]["stale"], 1);
    assert_eq!(subjects[1]["subject"], "bo");
    assert_eq!(subjects[1]["stale"], 0);
}

#[test]
fn traces_subject_lists_samples() {
    let dir = seeded_dir();
    let json = json_of(ts_cmd(dir.path()).args([
        "traces", "-m", "m-42", "-u", "ana", "--subject", "bo", "--json",
    ]));
    assert_eq!(json["subjects"].as_array().map(Vec::len), Some(1));
    assert_eq!(json["samples"].as_array().map(Vec::len), Some(1));
}

#[test]
fn traces_unknown_subject_fails() {
    let dir = seeded_dir();
    ts_cmd(dir.path())
        .args(["traces", "-m", "m-42", "-u", "ana", "--subject", "nobody"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no stored trace for subject 'nobody'"));
}

#[test]
fn traces_follow_configured_retention() {
    let dir = seeded_dir();
    ts_cmd(dir.path())
        .args(["config", "set", "retention_seconds", "1000000"])
        .assert()
        .success();
    let json = json_of(ts_cmd(dir.path()).args(["traces", "-m", "m-42", "-u", "ana", "--json"]));
    assert_eq!(json["retention_seconds"], 1_000_000);
    assert_eq!(json["subjects"][0]["stale"], 0);
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

#[test]
fn config_show_reports_defaults_without_file() {
    let dir = TempDir::new().expect("tempdir");
    let json = json_of(ts_cmd(dir.path()).args(["config", "show", "--json"]));
    assert_eq!(json["config_file_exists"], false);
    assert_eq!(json["retention_seconds"], 3_600);
    assert_eq!(json["purge_interval_ms"], 2_000);
    assert_eq!(json["queue_cap"], 5_000);
}

#[test]
fn config_set_show_unset_round_trip() {
    let dir = TempDir::new().expect("tempdir");
    ts_cmd(dir.path())
        .args(["config", "set", "queue_cap", "250", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"ok\": true"));

    let json = json_of(ts_cmd(dir.path()).args(["config", "show", "--json"]));
    assert_eq!(json["queue_cap"], 250);
    assert_eq!(json["config_file_exists"], true);

    ts_cmd(dir.path())
        .args(["config", "unset", "queue_cap"])
        .assert()
        .success();
    let json = json_of(ts_cmd(dir.path()).args(["config", "show", "--json"]));
    assert_eq!(json["queue_cap"], 5_000);
}

#[test]
fn config_set_rejects_invalid_values_without_writing() {
    let dir = TempDir::new().expect("tempdir");
    ts_cmd(dir.path())
        .args(["config", "set", "retention_seconds", "0"])
        .assert()
        .failure();
    ts_cmd(dir.path())
        .args(["config", "set", "nonsense", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unsupported key"));
    assert!(!dir.path().join("config.toml").exists());
}

#[test]
fn environment_overrides_file_retention() {
    let dir = TempDir::new().expect("tempdir");
    let json = json_of(
        ts_cmd(dir.path())
            .env("TRAILSYNC_RETENTION_SECONDS", "120")
            .args(["config", "show", "--json"]),
    );
    assert_eq!(json["retention_seconds"], 120);
}

#[test]
fn completions_mention_binary_name() {
    let dir = TempDir::new().expect("tempdir");
    ts_cmd(dir.path())
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("trailsync"));
}

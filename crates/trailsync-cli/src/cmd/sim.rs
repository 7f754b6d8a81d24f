//! `trailsync sim`: deterministic simulation campaigns.
//!
//! `trailsync sim run` executes a campaign across many seeds.
//! `trailsync sim replay` replays a single seed with its trace.

use std::process;

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;
use trailsync_core::model::EntityKind;
use trailsync_sim::campaign::{CampaignConfig, replay_seed, run_campaign};
use trailsync_sim::link::SimStats;

use crate::output::{OutputMode, pretty_kv, pretty_section};

/// How many failing seeds are printed before truncating.
const FAILURE_SAMPLE: usize = 5;

#[derive(Args, Debug)]
pub struct SimArgs {
    #[command(subcommand)]
    pub command: SimCommand,
}

#[derive(Subcommand, Debug)]
pub enum SimCommand {
    #[command(
        about = "Run a simulation campaign across multiple seeds",
        long_about = "Run seeded simulations of several clients sharing one mission over a\n\
                      faulty network, then check that queues drained, every intended entity\n\
                      exists exactly once, caches converged and traces respect retention.",
        after_help = "EXAMPLES:\n    # Run 100 seeds with defaults\n    trailsync sim run --seeds 100\n\n\
                      # Harsher network\n    trailsync sim run --seeds 50 --clients 6 --disconnect 12 --mutation-failure 25\n\n\
                      # Machine-readable output\n    trailsync sim run --seeds 100 --format json"
    )]
    Run(SimRunArgs),

    #[command(
        about = "Replay a single seed with detailed output",
        long_about = "Replay one seed to get its statistics, oracle verdict and, with\n\
                      --trace, the full event log. Use after a campaign failure.",
        after_help = "EXAMPLES:\n    # Replay seed 42\n    trailsync sim replay --seed 42\n\n\
                      # Include every event\n    trailsync sim replay --seed 42 --trace\n\n\
                      # Machine-readable output\n    trailsync sim replay --seed 42 --format json"
    )]
    Replay(SimReplayArgs),
}

/// Parameters shared by `run` and `replay`.
#[derive(Args, Debug, Clone)]
pub struct ScenarioArgs {
    /// Number of simulated clients.
    #[arg(long, default_value = "4")]
    pub clients: usize,

    /// Rounds per seed before the network heals.
    #[arg(long, default_value = "90")]
    pub rounds: u64,

    /// Initial mission retention in seconds.
    #[arg(long, default_value = "45")]
    pub retention: u64,

    /// Chance per round (percent) that the mission retention changes.
    #[arg(long, default_value = "2")]
    pub retention_change: u8,

    /// Maximum broadcast delivery delay in rounds.
    #[arg(long, default_value = "2")]
    pub max_delay: u8,

    /// Broadcast drop rate (percent).
    #[arg(long, default_value = "5")]
    pub drop: u8,

    /// Per-round disconnect rate of an online client (percent).
    #[arg(long, default_value = "6")]
    pub disconnect: u8,

    /// Per-round reconnect rate of an offline client (percent).
    #[arg(long, default_value = "30")]
    pub reconnect: u8,

    /// Mutation call failure rate (percent).
    #[arg(long, default_value = "10")]
    pub mutation_failure: u8,

    /// Rate (percent) of applied creates answered with an anonymous conflict.
    #[arg(long, default_value = "3")]
    pub create_conflict: u8,
}

#[derive(Args, Debug)]
pub struct SimRunArgs {
    /// Number of seeds to run.
    #[arg(long, default_value = "100")]
    pub seeds: u64,

    /// Starting seed value.
    #[arg(long, default_value = "0")]
    pub seed_start: u64,

    #[command(flatten)]
    pub scenario: ScenarioArgs,
}

#[derive(Args, Debug)]
pub struct SimReplayArgs {
    /// Seed to replay.
    #[arg(long)]
    pub seed: u64,

    /// Print every trace event.
    #[arg(long)]
    pub trace: bool,

    #[command(flatten)]
    pub scenario: ScenarioArgs,
}

#[derive(Debug, Serialize)]
struct RunOutput {
    seeds_run: usize,
    seeds_passed: usize,
    seeds_failed: usize,
    first_failure: Option<u64>,
    interesting_states_reached: usize,
    all_passed: bool,
    failures: Vec<FailureOutput>,
}

#[derive(Debug, Serialize)]
struct FailureOutput {
    seed: u64,
    violations: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ReplayOutput {
    seed: u64,
    clients: usize,
    rounds_run: u64,
    trace_events: usize,
    oracle_passed: bool,
    violations: Vec<String>,
    interesting_state_reached: bool,
    stats: SimStats,
    server_pois: usize,
    server_zones: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace: Option<Vec<serde_json::Value>>,
}

fn campaign_config(seed_start: u64, seeds: u64, scenario: &ScenarioArgs) -> CampaignConfig {
    CampaignConfig {
        seed_range: seed_start..seed_start.saturating_add(seeds),
        client_count: scenario.clients,
        rounds: scenario.rounds,
        retention_seconds: scenario.retention,
        retention_change_percent: scenario.retention_change,
        fault_max_delay: scenario.max_delay,
        fault_drop_percent: scenario.drop,
        fault_disconnect_percent: scenario.disconnect,
        fault_reconnect_percent: scenario.reconnect,
        fault_mutation_failure_percent: scenario.mutation_failure,
        fault_create_conflict_percent: scenario.create_conflict,
    }
}

fn replay_hint(seed: u64, s: &ScenarioArgs) -> String {
    format!(
        "trailsync sim replay --seed {seed} --clients {} --rounds {} --retention {} \
         --retention-change {} --max-delay {} --drop {} --disconnect {} --reconnect {} \
         --mutation-failure {} --create-conflict {}",
        s.clients,
        s.rounds,
        s.retention,
        s.retention_change,
        s.max_delay,
        s.drop,
        s.disconnect,
        s.reconnect,
        s.mutation_failure,
        s.create_conflict
    )
}

/// Execute `trailsync sim run`. Exits with status 1 when any seed fails.
///
/// # Errors
///
/// Returns an error if the parameters are invalid or output fails.
pub fn run_sim_run(args: &SimRunArgs, output: OutputMode) -> Result<()> {
    let config = campaign_config(args.seed_start, args.seeds, &args.scenario);
    let report = run_campaign(&config)?;

    let out = RunOutput {
        seeds_run: report.seeds_run,
        seeds_passed: report.seeds_passed,
        seeds_failed: report.failures.len(),
        first_failure: report.first_failure,
        interesting_states_reached: report.interesting_states_reached,
        all_passed: report.all_passed(),
        failures: report
            .failures
            .iter()
            .map(|f| FailureOutput {
                seed: f.seed,
                violations: f.violations.clone(),
            })
            .collect(),
    };

    match output {
        OutputMode::Json => {
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputMode::Text => {
            println!(
                "campaign seeds_run={} clients={} rounds={}",
                out.seeds_run, args.scenario.clients, args.scenario.rounds
            );
            println!(
                "results passed={} failed={} interesting_states={} all_passed={}",
                out.seeds_passed, out.seeds_failed, out.interesting_states_reached, out.all_passed
            );
            for failure in out.failures.iter().take(FAILURE_SAMPLE) {
                println!(
                    "failure seed={} violations={}",
                    failure.seed,
                    failure.violations.len()
                );
            }
            if out.failures.len() > FAILURE_SAMPLE {
                println!("failures_truncated count={}", out.failures.len() - FAILURE_SAMPLE);
            }
            if let Some(seed) = out.first_failure {
                println!("hint replay_seed={seed}");
            }
        }
        OutputMode::Pretty => {
            let stdout = std::io::stdout();
            let mut w = stdout.lock();
            pretty_section(&mut w, "Simulation Campaign")?;
            pretty_kv(&mut w, "Seeds", out.seeds_run.to_string())?;
            pretty_kv(&mut w, "Clients", args.scenario.clients.to_string())?;
            pretty_kv(&mut w, "Rounds", args.scenario.rounds.to_string())?;
            pretty_kv(
                &mut w,
                "Faults",
                format!(
                    "drop {}%, disconnect {}%, call failure {}%",
                    args.scenario.drop, args.scenario.disconnect, args.scenario.mutation_failure
                ),
            )?;
            pretty_kv(
                &mut w,
                "Results",
                format!(
                    "{} passed / {} failed ({} interesting states)",
                    out.seeds_passed, out.seeds_failed, out.interesting_states_reached
                ),
            )?;

            if let Some(seed) = out.first_failure {
                pretty_kv(
                    &mut w,
                    "Status",
                    format!("{} failures (first at seed {seed})", out.seeds_failed),
                )?;
                println!();
                pretty_section(&mut w, "Failure Samples")?;
                for failure in out.failures.iter().take(FAILURE_SAMPLE) {
                    println!("seed {:<8} violations={}", failure.seed, failure.violations.len());
                    for violation in &failure.violations {
                        println!("  - {violation}");
                    }
                }
                if out.failures.len() > FAILURE_SAMPLE {
                    println!("... and {} more failures", out.failures.len() - FAILURE_SAMPLE);
                }
                println!();
                pretty_kv(&mut w, "Replay", replay_hint(seed, &args.scenario))?;
            } else {
                pretty_kv(&mut w, "Status", "all seeds passed")?;
            }
        }
    }

    if !report.all_passed() {
        process::exit(1);
    }
    Ok(())
}

/// Execute `trailsync sim replay`. Exits with status 1 when the seed fails.
///
/// # Errors
///
/// Returns an error if the parameters are invalid, the simulation hits an
/// internal error, or output fails.
pub fn run_sim_replay(args: &SimReplayArgs, output: OutputMode) -> Result<()> {
    let config = campaign_config(args.seed, 1, &args.scenario);
    let detail = replay_seed(args.seed, &config)?;
    let result = &detail.result;

    let trace = if args.trace {
        Some(
            result
                .trace
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()?,
        )
    } else {
        None
    };

    let out = ReplayOutput {
        seed: args.seed,
        clients: result.clients.len(),
        rounds_run: result.rounds_run,
        trace_events: result.trace.len(),
        oracle_passed: detail.oracle.passed,
        violations: detail.oracle.violations.iter().map(ToString::to_string).collect(),
        interesting_state_reached: result.interesting_state_reached,
        stats: result.stats,
        server_pois: result.server.entities.get(&EntityKind::Poi).map_or(0, Vec::len),
        server_zones: result.server.entities.get(&EntityKind::Zone).map_or(0, Vec::len),
        trace,
    };

    match output {
        OutputMode::Json => {
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputMode::Text => {
            println!(
                "replay seed={} clients={} rounds_run={}",
                out.seed, out.clients, out.rounds_run
            );
            println!(
                "result oracle_passed={} trace_events={} interesting_state_reached={} server_pois={} server_zones={}",
                out.oracle_passed,
                out.trace_events,
                out.interesting_state_reached,
                out.server_pois,
                out.server_zones
            );
            println!("stats {}", stats_line(&out.stats));
            for violation in &out.violations {
                println!("violation={violation}");
            }
            for event in out.trace.iter().flatten() {
                println!("event {event}");
            }
        }
        OutputMode::Pretty => {
            let stdout = std::io::stdout();
            let mut w = stdout.lock();
            pretty_section(&mut w, &format!("Replay Seed {}", out.seed))?;
            pretty_kv(&mut w, "Clients", out.clients.to_string())?;
            pretty_kv(&mut w, "Rounds run", out.rounds_run.to_string())?;
            pretty_kv(&mut w, "Trace events", out.trace_events.to_string())?;
            pretty_kv(
                &mut w,
                "Server",
                format!("{} POIs, {} zones", out.server_pois, out.server_zones),
            )?;
            pretty_kv(&mut w, "Interesting", out.interesting_state_reached.to_string())?;
            pretty_kv(&mut w, "Oracle", out.oracle_passed.to_string())?;

            println!();
            pretty_section(&mut w, "Statistics")?;
            for (name, value) in stats_rows(&out.stats) {
                pretty_kv(&mut w, name, value.to_string())?;
            }

            if !out.oracle_passed {
                println!();
                pretty_section(&mut w, "Invariant Violations")?;
                for violation in &out.violations {
                    println!("- {violation}");
                }
            }

            if out.trace.is_some() {
                println!();
                pretty_section(&mut w, "Trace")?;
                for event in &result.trace {
                    let who = event
                        .client
                        .map_or_else(|| "mission".to_string(), |c| format!("client {c}"));
                    println!("r{:<4} {who:<10} {:?}", event.round, event.kind);
                }
            }
        }
    }

    if !detail.oracle.passed {
        process::exit(1);
    }
    Ok(())
}

fn stats_rows(stats: &SimStats) -> [(&'static str, usize); 12] {
    [
        ("Disconnects", stats.disconnects),
        ("Reconnects", stats.reconnects),
        ("With backlog", stats.reconnects_with_backlog),
        ("Calls", stats.mutation_calls),
        ("Call failures", stats.mutation_failures),
        ("Conflicts", stats.create_conflicts),
        ("Frames sent", stats.frames_sent),
        ("Dropped", stats.frames_dropped),
        ("Delivered", stats.frames_delivered),
        ("Malformed", stats.malformed_frames),
        ("Snapshots", stats.snapshots_applied),
        ("Retention", stats.retention_changes),
    ]
}

fn stats_line(stats: &SimStats) -> String {
    stats_rows(stats)
        .iter()
        .map(|(name, value)| format!("{}={value}", name.to_lowercase().replace(' ', "_")))
        .collect::<Vec<_>>()
        .join(" ")
}

#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{CommandFactory, Parser, Subcommand};
use output::{OutputMode, resolve_output_mode};
use std::env;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use trailsync_core::config::resolve_data_dir;

#[derive(Parser, Debug)]
#[command(
    name = "trailsync",
    author,
    version,
    about = "trailsync: offline-tolerant mission state sync",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    /// Shorthand for `--format json`.
    #[arg(long, global = true, hide = true)]
    json: bool,

    /// Data directory holding config.toml and the local state database.
    /// Defaults to $TRAILSYNC_DATA_DIR, then the platform data dir.
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn output_mode(&self) -> OutputMode {
        resolve_output_mode(self.format, self.json)
    }

    fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| resolve_data_dir(|key| env::var(key).ok()))
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Inspect",
        about = "Summarize saved sessions",
        long_about = "List every (mission, user) session in the local state database with\n\
                      its queue length, trace sizes, viewport and last write time.",
        after_help = "EXAMPLES:\n    # All sessions\n    trailsync status\n\n    # One mission\n    trailsync status --mission m-42\n\n    # Emit machine-readable output\n    trailsync status --json"
    )]
    Status(cmd::status::StatusArgs),

    #[command(
        next_help_heading = "Inspect",
        about = "List queued offline actions",
        long_about = "List the offline action log of one session in replay order. Targets\n\
                      still carrying a local id are marked.",
        after_help = "EXAMPLES:\n    # Pending actions\n    trailsync queue --mission m-42 --user ana\n\n    # With payloads\n    trailsync queue -m m-42 -u ana --payload\n\n    # Emit machine-readable output\n    trailsync queue -m m-42 -u ana --json"
    )]
    Queue(cmd::queue::QueueArgs),

    #[command(
        next_help_heading = "Inspect",
        about = "Show stored position traces",
        long_about = "Summarize the own and peer traces saved for one session and count\n\
                      samples already outside the configured retention window.",
        after_help = "EXAMPLES:\n    # Per-subject summary\n    trailsync traces --mission m-42 --user ana\n\n    # Samples of one peer\n    trailsync traces -m m-42 -u ana --subject bo"
    )]
    Traces(cmd::traces::TracesArgs),

    #[command(
        next_help_heading = "Configure",
        about = "Show or edit configuration",
        long_about = "Show the effective sync configuration or edit keys in config.toml.",
        after_help = "EXAMPLES:\n    # Effective configuration\n    trailsync config show\n\n    # Shorter retention\n    trailsync config set retention_seconds 900\n\n    # Back to the default\n    trailsync config unset retention_seconds"
    )]
    Config(cmd::config::ConfigArgs),

    #[command(
        next_help_heading = "Develop",
        about = "Deterministic sync simulation",
        long_about = "Run or replay seeded simulations of clients syncing one mission\n\
                      through disconnects, dropped broadcasts and failing mutation calls."
    )]
    Sim(cmd::sim::SimArgs),

    #[command(
        next_help_heading = "Configure",
        about = "Generate shell completion scripts",
        long_about = "Generate shell completion scripts for supported shells.",
        after_help = "EXAMPLES:\n    # Generate bash completions\n    trailsync completions bash\n\n    # Generate zsh completions\n    trailsync completions zsh"
    )]
    Completions(cmd::completions::CompletionsArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("TRAILSYNC_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "trailsync=debug,info"
        } else {
            "trailsync=info,warn"
        })
    });

    let format = env::var("TRAILSYNC_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    if cli.verbose {
        info!("Verbose mode enabled");
    }

    let output = cli.output_mode();
    let data_dir = cli.data_dir();

    match &cli.command {
        Commands::Status(args) => cmd::status::run_status(args, output, &data_dir),
        Commands::Queue(args) => cmd::queue::run_queue(args, output, &data_dir),
        Commands::Traces(args) => cmd::traces::run_traces(args, output, &data_dir),
        Commands::Config(args) => cmd::config::run_config(args, &data_dir, output),
        Commands::Sim(args) => match &args.command {
            cmd::sim::SimCommand::Run(run) => cmd::sim::run_sim_run(run, output),
            cmd::sim::SimCommand::Replay(replay) => cmd::sim::run_sim_replay(replay, output),
        },
        Commands::Completions(args) => {
            let mut command = Cli::command();
            cmd::completions::run_completions(args.shell, &mut command)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn json_flag_after_subcommand() {
        let cli = Cli::parse_from(["trailsync", "status", "--json"]);
        assert!(cli.json);
        assert_eq!(cli.output_mode(), OutputMode::Json);
    }

    #[test]
    fn format_flag_parses() {
        let cli = Cli::parse_from(["trailsync", "--format", "text", "status"]);
        assert_eq!(cli.format, Some(OutputMode::Text));
    }

    #[test]
    fn data_dir_flag_wins() {
        let cli = Cli::parse_from(["trailsync", "--data-dir", "/tmp/ts", "status"]);
        assert_eq!(cli.data_dir(), PathBuf::from("/tmp/ts"));
    }

    #[test]
    fn queue_requires_session() {
        assert!(Cli::try_parse_from(["trailsync", "queue"]).is_err());
        let cli = Cli::parse_from(["trailsync", "queue", "-m", "m1", "-u", "ana"]);
        let Commands::Queue(args) = cli.command else {
            panic!("expected queue");
        };
        assert_eq!(args.session.mission, "m1");
        assert_eq!(args.session.user, "ana");
        assert!(!args.payload);
    }

    #[test]
    fn sim_run_defaults() {
        let cli = Cli::parse_from(["trailsync", "sim", "run"]);
        let Commands::Sim(sim) = cli.command else {
            panic!("expected sim");
        };
        let cmd::sim::SimCommand::Run(run) = sim.command else {
            panic!("expected run");
        };
        assert_eq!(run.seeds, 100);
        assert_eq!(run.seed_start, 0);
        assert_eq!(run.scenario.clients, 4);
        assert_eq!(run.scenario.reconnect, 30);
    }

    #[test]
    fn sim_replay_requires_seed() {
        assert!(Cli::try_parse_from(["trailsync", "sim", "replay"]).is_err());
        let cli = Cli::parse_from(["trailsync", "sim", "replay", "--seed", "9", "--trace"]);
        let Commands::Sim(sim) = cli.command else {
            panic!("expected sim");
        };
        let cmd::sim::SimCommand::Replay(replay) = sim.command else {
            panic!("expected replay");
        };
        assert_eq!(replay.seed, 9);
        assert!(replay.trace);
    }

    #[test]
    fn completions_subcommand_parses() {
        let cli = Cli::parse_from(["trailsync", "completions", "bash"]);
        assert!(matches!(
            cli.command,
            Commands::Completions(cmd::completions::CompletionsArgs {
                shell: clap_complete::Shell::Bash
            })
        ));
    }

    #[test]
    fn all_subcommands_listed() {
        let command = Cli::command();
        let names: Vec<&str> = command.get_subcommands().map(clap::Command::get_name).collect();
        for expected in ["status", "queue", "traces", "config", "sim", "completions"] {
            assert!(names.contains(&expected), "missing subcommand {expected}");
        }
    }
}

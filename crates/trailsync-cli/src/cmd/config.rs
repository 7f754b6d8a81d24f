use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use toml::Value;
use trailsync_core::config::{CONFIG_FILE_NAME, SyncConfig, load_config};
use trailsync_core::store::sqlite::DB_FILE_NAME;

use crate::output::{OutputMode, pretty_kv, pretty_section};

/// Keys `config set` accepts. All are non-negative integers.
pub const KNOWN_KEYS: [&str; 5] = [
    "retention_seconds",
    "purge_interval_ms",
    "queue_cap",
    "initial_flush_delay_ms",
    "position_backlog_cap",
];

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Show the effective configuration
    Show(ShowArgs),
    /// Set a key in config.toml
    Set(SetArgs),
    /// Remove a key from config.toml, restoring its default
    Unset(UnsetArgs),
}

#[derive(Args, Debug)]
struct ShowArgs {
    /// Show the raw file contents only
    #[arg(long)]
    raw: bool,
}

#[derive(Args, Debug)]
struct SetArgs {
    /// Config key (e.g. retention_seconds)
    key: String,

    /// New value
    value: String,
}

#[derive(Args, Debug)]
struct UnsetArgs {
    /// Config key (e.g. retention_seconds)
    key: String,
}

#[derive(Debug, Serialize)]
struct EffectiveConfig {
    data_dir: PathBuf,
    config_file: PathBuf,
    config_file_exists: bool,
    database: PathBuf,
    #[serde(flatten)]
    sync: SyncConfig,
}

/// Execute `trailsync config`.
///
/// # Errors
///
/// Returns an error if the config file cannot be read, parsed or written,
/// or if a new value fails validation.
pub fn run_config(args: &ConfigArgs, data_dir: &Path, output: OutputMode) -> Result<()> {
    match &args.command {
        ConfigCommand::Show(show) => run_show(show, data_dir, output),
        ConfigCommand::Set(set) => run_set(set, data_dir, output),
        ConfigCommand::Unset(unset) => run_unset(unset, data_dir, output),
    }
}

fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

fn run_show(args: &ShowArgs, data_dir: &Path, output: OutputMode) -> Result<()> {
    let path = config_path(data_dir);
    if args.raw {
        let value = load_toml_table(&path)?;
        print_toml_or_json(&value, output)?;
        return Ok(());
    }

    let effective = EffectiveConfig {
        data_dir: data_dir.to_path_buf(),
        config_file_exists: path.exists(),
        config_file: path,
        database: data_dir.join(DB_FILE_NAME),
        sync: load_config(data_dir)?,
    };
    print_effective(&effective, output)
}

fn run_set(args: &SetArgs, data_dir: &Path, output: OutputMode) -> Result<()> {
    let path = config_path(data_dir);
    let mut value = load_toml_table(&path)?;
    apply_set(&mut value, &args.key, &args.value)?;
    check_config(&value)?;
    write_toml_table(&path, &value)?;
    render_mutation(output, "set", &args.key)
}

fn run_unset(args: &UnsetArgs, data_dir: &Path, output: OutputMode) -> Result<()> {
    let path = config_path(data_dir);
    let mut value = load_toml_table(&path)?;
    apply_unset(&mut value, &args.key)?;
    write_toml_table(&path, &value)?;
    render_mutation(output, "unset", &args.key)
}

fn known_key(key: &str) -> Result<&str> {
    if KNOWN_KEYS.contains(&key) {
        Ok(key)
    } else {
        bail!("Unsupported key `{key}` (expected one of: {})", KNOWN_KEYS.join(", "));
    }
}

fn apply_set(root: &mut Value, key: &str, raw: &str) -> Result<()> {
    let key = known_key(key)?;
    let number: i64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} expects a whole number"))?;
    if number < 0 {
        bail!("{key} must not be negative");
    }
    root.as_table_mut()
        .ok_or_else(|| anyhow!("Config root must be a TOML table"))?
        .insert(key.to_string(), Value::Integer(number));
    Ok(())
}

fn apply_unset(root: &mut Value, key: &str) -> Result<()> {
    let key = known_key(key)?;
    root.as_table_mut()
        .ok_or_else(|| anyhow!("Config root must be a TOML table"))?
        .remove(key);
    Ok(())
}

/// Parse the edited table as a config so an invalid value never reaches disk.
fn check_config(value: &Value) -> Result<SyncConfig> {
    let config: SyncConfig = value.clone().try_into()?;
    config.validate()?;
    Ok(config)
}

fn load_toml_table(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(Value::Table(toml::map::Map::new()));
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let value: Value =
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;

    if !value.is_table() {
        bail!("{} must contain a top-level TOML table", path.display());
    }

    Ok(value)
}

fn write_toml_table(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let serialized = toml::to_string_pretty(value)?;
    std::fs::write(path, serialized).with_context(|| format!("Failed to write {}", path.display()))
}

fn print_toml_or_json(value: &Value, output: OutputMode) -> Result<()> {
    match output {
        OutputMode::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputMode::Text | OutputMode::Pretty => print!("{}", toml::to_string_pretty(value)?),
    }
    Ok(())
}

fn print_effective(value: &EffectiveConfig, output: OutputMode) -> Result<()> {
    match output {
        OutputMode::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputMode::Text => {
            println!("data_dir={}", value.data_dir.display());
            println!("config_file={}", value.config_file.display());
            println!("config_file_exists={}", value.config_file_exists);
            println!("database={}", value.database.display());
            println!("retention_seconds={}", value.sync.retention_seconds);
            println!("purge_interval_ms={}", value.sync.purge_interval_ms);
            println!("queue_cap={}", value.sync.queue_cap);
            println!("initial_flush_delay_ms={}", value.sync.initial_flush_delay_ms);
            println!("position_backlog_cap={}", value.sync.position_backlog_cap);
        }
        OutputMode::Pretty => {
            let stdout = std::io::stdout();
            let mut w = stdout.lock();
            pretty_section(&mut w, "Configuration")?;
            pretty_kv(&mut w, "Data dir", value.data_dir.display().to_string())?;
            let file = if value.config_file_exists {
                value.config_file.display().to_string()
            } else {
                format!("{} (absent, defaults)", value.config_file.display())
            };
            pretty_kv(&mut w, "Config file", file)?;
            pretty_kv(&mut w, "Database", value.database.display().to_string())?;
            pretty_kv(&mut w, "Retention", format!("{}s", value.sync.retention_seconds))?;
            pretty_kv(&mut w, "Purge every", format!("{}ms", value.sync.purge_interval_ms))?;
            pretty_kv(&mut w, "Queue cap", value.sync.queue_cap.to_string())?;
            pretty_kv(
                &mut w,
                "First flush",
                format!("{}ms after connect", value.sync.initial_flush_delay_ms),
            )?;
            pretty_kv(&mut w, "Backlog cap", value.sync.position_backlog_cap.to_string())?;
        }
    }
    Ok(())
}

fn render_mutation(output: OutputMode, action: &str, key: &str) -> Result<()> {
    match output {
        OutputMode::Json => {
            let body = serde_json::json!({ "ok": true, "action": action, "key": key });
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        OutputMode::Text => println!("ok action={action} key={key}"),
        OutputMode::Pretty => println!("{action} {key}"),
    }
    Ok(())
}

pub mod completions;
pub mod config;
pub mod queue;
pub mod sim;
pub mod status;
pub mod traces;

use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::Args;
use trailsync_core::error::ErrorCode;
use trailsync_core::store::SqliteStore;
use trailsync_core::store::sqlite::DB_FILE_NAME;

/// Which persisted session to inspect.
#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    /// Mission id.
    #[arg(long, short)]
    pub mission: String,

    /// User id the state was saved for.
    #[arg(long, short)]
    pub user: String,
}

/// Open the local state database for inspection.
///
/// Never creates one: a missing database is an error, not an empty store.
///
/// # Errors
///
/// Returns an error if the database file does not exist or cannot be opened.
pub fn open_state(data_dir: &Path) -> Result<SqliteStore> {
    let path = data_dir.join(DB_FILE_NAME);
    if !path.exists() {
        bail!(
            "{}: no local state at {}\n  Hint: set TRAILSYNC_DATA_DIR or pass --data-dir",
            ErrorCode::StoreOpenFailed,
            path.display()
        );
    }
    SqliteStore::open_read_only(&path)
        .with_context(|| format!("Failed to open {}", path.display()))
}

//! SQLite schema and migrations for the local state database.
//!
//! One row per `(mission_id, user_id, slot)`; the body is the slot's JSON.
//! Versions are tracked in `PRAGMA user_version`.

use rusqlite::{Connection, types::Type};

/// Migration v1: the slot table.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS local_state (
    mission_id TEXT NOT NULL CHECK (length(mission_id) > 0),
    user_id TEXT NOT NULL CHECK (length(user_id) > 0),
    slot TEXT NOT NULL CHECK (slot IN ('queue', 'self_trace', 'peer_traces', 'viewport')),
    body_json TEXT NOT NULL,
    updated_at_ms INTEGER NOT NULL,
    PRIMARY KEY (mission_id, user_id, slot)
);
";

/// Migration v2: recency index for `trailsync status`.
pub const MIGRATION_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_local_state_updated
    ON local_state(updated_at_ms DESC);
";

pub const LATEST_SCHEMA_VERSION: u32 = 2;

const MIGRATIONS: &[(u32, &str)] = &[(1, MIGRATION_V1_SQL), (2, MIGRATION_V2_SQL)];

/// Current `PRAGMA user_version`.
///
/// # Errors
///
/// Returns an error if the query fails or the value is negative.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(error))
    })
}

/// Apply every migration newer than `user_version`, each in its own
/// transaction.
///
/// # Errors
///
/// Returns an error if any migration fails; earlier ones stay applied.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<u32> {
    let mut current = current_schema_version(conn)?;
    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", i64::from(*version))?;
        tx.commit()?;
        current = *version;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrates_fresh_db_and_is_idempotent() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;
        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);
        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);

        let index_exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1)",
            ["idx_local_state_updated"],
            |row| row.get(0),
        )?;
        assert!(index_exists);
        Ok(())
    }

    #[test]
    fn unknown_slot_is_rejected_by_schema() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        let result = conn.execute(
            "INSERT INTO local_state VALUES ('m1', 'ana', 'bogus', '{}', 0)",
            [],
        );
        assert!(result.is_err());
        Ok(())
    }
}

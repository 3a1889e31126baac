//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_outbox_events(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: the outbox table.
///
/// Timestamps are RFC 3339 TEXT with fixed microsecond precision in UTC,
/// so SQL comparisons against `next_attempt_at` and `claimed_at` are plain
/// string comparisons.
fn migrate_v1_outbox_events(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: outbox events");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox_events (
            id TEXT PRIMARY KEY,
            aggregate_key TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            payload BLOB NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempt_count INTEGER NOT NULL DEFAULT 0,
            claimed_by TEXT,
            claimed_at TEXT,
            next_attempt_at TEXT NOT NULL,
            last_error TEXT,
            receipt_id TEXT,
            created_at TEXT NOT NULL,
            delivered_at TEXT,
            UNIQUE (aggregate_key, sequence)
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_events_status_next_attempt
            ON outbox_events (status, next_attempt_at);

        CREATE INDEX IF NOT EXISTS idx_outbox_events_aggregate
            ON outbox_events (aggregate_key, sequence);
        ",
    )?;

    record_migration(conn, 1, "outbox_events")?;
    Ok(())
}

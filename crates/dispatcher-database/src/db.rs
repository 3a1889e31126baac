//! Database connection wrapper.

use crate::{migrations, queries, DatabaseResult};
use chrono::{DateTime, Utc};
use dispatcher_core::{NewOutboxEvent, OutboxEvent};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// Outbox database with query methods.
///
/// One connection per instance; multiple dispatcher processes may open the
/// same file, with WAL mode and a busy timeout absorbing write contention.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the given path, running migrations if needed.
    pub fn open(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database for testing.
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn insert_event(&self, new: &NewOutboxEvent) -> DatabaseResult<OutboxEvent> {
        queries::insert_event(&self.conn, new)
    }

    pub fn claim_batch(
        &self,
        limit: usize,
        dispatcher_id: &str,
        stale_claim_timeout: Duration,
        unblock_on_failure: bool,
    ) -> DatabaseResult<Vec<OutboxEvent>> {
        queries::claim_batch(
            &self.conn,
            limit,
            dispatcher_id,
            stale_claim_timeout,
            unblock_on_failure,
        )
    }

    pub fn release_claim(
        &self,
        event_id: &str,
        attempt_count: i32,
        last_error: Option<&str>,
        visible_after: DateTime<Utc>,
    ) -> DatabaseResult<usize> {
        queries::release_claim(&self.conn, event_id, attempt_count, last_error, visible_after)
    }

    pub fn mark_delivered(&self, event_id: &str, receipt_id: &str) -> DatabaseResult<usize> {
        queries::mark_delivered(&self.conn, event_id, receipt_id)
    }

    pub fn mark_failed(
        &self,
        event_id: &str,
        attempt_count: i32,
        last_error: &str,
    ) -> DatabaseResult<usize> {
        queries::mark_failed(&self.conn, event_id, attempt_count, last_error)
    }

    pub fn mark_skipped(&self, event_id: &str) -> DatabaseResult<usize> {
        queries::mark_skipped(&self.conn, event_id)
    }

    pub fn get_event(&self, id: &str) -> DatabaseResult<Option<OutboxEvent>> {
        queries::get_event(&self.conn, id)
    }

    pub fn pending_count(&self) -> DatabaseResult<usize> {
        queries::pending_count(&self.conn)
    }

    pub fn status_counts(&self) -> DatabaseResult<Vec<(String, i64)>> {
        queries::status_counts(&self.conn)
    }
}

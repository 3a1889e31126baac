//! [`EventStore`] adapter over the SQLite database.

use crate::Database;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatcher_core::{CoreError, CoreResult, EventStore, NewOutboxEvent, OutboxEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

/// SQLite-backed Event Store Gateway.
///
/// `unblock_on_failure` controls whether a failed-terminal event unblocks
/// later events of its aggregate (default) or keeps the stream parked for
/// operator intervention.
pub struct SqliteEventStore {
    db: Arc<Mutex<Database>>,
    unblock_on_failure: bool,
}

impl SqliteEventStore {
    pub fn new(db: Database, unblock_on_failure: bool) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            unblock_on_failure,
        }
    }

    /// Wrap an already-shared database handle.
    pub fn shared(db: Arc<Mutex<Database>>, unblock_on_failure: bool) -> Self {
        Self {
            db,
            unblock_on_failure,
        }
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn claim_batch(
        &self,
        limit: usize,
        dispatcher_id: &str,
        stale_claim_timeout: Duration,
    ) -> CoreResult<Vec<OutboxEvent>> {
        let db = self.db.lock().await;
        db.claim_batch(limit, dispatcher_id, stale_claim_timeout, self.unblock_on_failure)
            .map_err(into_core)
    }

    async fn release_claim(
        &self,
        event_id: &str,
        attempt_count: i32,
        last_error: Option<&str>,
        visible_after: DateTime<Utc>,
    ) -> CoreResult<()> {
        let db = self.db.lock().await;
        let count = db
            .release_claim(event_id, attempt_count, last_error, visible_after)
            .map_err(into_core)?;
        if count == 0 {
            warn!(event_id, "Release found no live claim");
        }
        Ok(())
    }

    async fn mark_delivered(&self, event_id: &str, receipt_id: &str) -> CoreResult<()> {
        let db = self.db.lock().await;
        let count = db.mark_delivered(event_id, receipt_id).map_err(into_core)?;
        if count == 0 {
            // The claim went stale mid-delivery and another instance took
            // over; at-least-once tolerates the duplicate.
            warn!(event_id, "Delivered event had no live claim");
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: &str,
        attempt_count: i32,
        last_error: &str,
    ) -> CoreResult<()> {
        let db = self.db.lock().await;
        let count = db
            .mark_failed(event_id, attempt_count, last_error)
            .map_err(into_core)?;
        if count == 0 {
            warn!(event_id, "Failed event had no live claim");
        }
        Ok(())
    }

    async fn mark_skipped(&self, event_id: &str) -> CoreResult<()> {
        let db = self.db.lock().await;
        let count = db.mark_skipped(event_id).map_err(into_core)?;
        if count == 0 {
            warn!(event_id, "Skipped event had no live claim");
        }
        Ok(())
    }

    async fn insert_event(&self, event: NewOutboxEvent) -> CoreResult<OutboxEvent> {
        let db = self.db.lock().await;
        db.insert_event(&event).map_err(into_core)
    }

    async fn pending_count(&self) -> CoreResult<usize> {
        let db = self.db.lock().await;
        db.pending_count().map_err(into_core)
    }
}

fn into_core(err: crate::DatabaseError) -> CoreError {
    CoreError::Store(err.to_string())
}

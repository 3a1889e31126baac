//! Claim and settle queries for the outbox table.
//!
//! Every state transition is a single conditional `UPDATE`, so the database
//! is the only synchronization point between dispatcher processes. A settle
//! that matches zero rows means the claim was lost (reclaimed elsewhere);
//! callers decide whether that is worth a warning.

use crate::{DatabaseError, DatabaseResult};
use chrono::{DateTime, SecondsFormat, Utc};
use dispatcher_core::{EventStatus, NewOutboxEvent, OutboxEvent};
use rusqlite::{params, Connection, Row};
use std::time::Duration;

/// Failure causes are capped at this many characters before storage.
pub const MAX_ERROR_LEN: usize = 1000;

const EVENT_COLUMNS: &str = "id, aggregate_key, sequence, event_type, payload, status, \
     attempt_count, claimed_by, claimed_at, next_attempt_at, last_error, receipt_id, \
     created_at, delivered_at";

// Two variants of the claim statement, differing only in which statuses
// block an aggregate: by default a failed-terminal event unblocks its
// successors; with unblocking disabled it keeps its stream parked until an
// operator intervenes. Skipped events never block either way: they were
// deliberately not delivered.
const CLAIM_SQL_UNBLOCK_ON_FAILURE: &str = "
    UPDATE outbox_events
    SET status = 'claimed', claimed_by = ?1, claimed_at = ?2
    WHERE id IN (
        SELECT e.id FROM outbox_events e
        WHERE ((e.status = 'pending' AND e.next_attempt_at <= ?2)
            OR (e.status = 'claimed' AND e.claimed_at <= ?3))
          AND e.sequence = (
              SELECT MIN(b.sequence) FROM outbox_events b
              WHERE b.aggregate_key = e.aggregate_key
                AND b.status NOT IN ('delivered', 'failed', 'skipped')
          )
        ORDER BY e.aggregate_key, e.sequence
        LIMIT ?4
    )
    RETURNING id, aggregate_key, sequence, event_type, payload, status, attempt_count,
              claimed_by, claimed_at, next_attempt_at, last_error, receipt_id,
              created_at, delivered_at";

const CLAIM_SQL_BLOCK_ON_FAILURE: &str = "
    UPDATE outbox_events
    SET status = 'claimed', claimed_by = ?1, claimed_at = ?2
    WHERE id IN (
        SELECT e.id FROM outbox_events e
        WHERE ((e.status = 'pending' AND e.next_attempt_at <= ?2)
            OR (e.status = 'claimed' AND e.claimed_at <= ?3))
          AND e.sequence = (
              SELECT MIN(b.sequence) FROM outbox_events b
              WHERE b.aggregate_key = e.aggregate_key
                AND b.status NOT IN ('delivered', 'skipped')
          )
        ORDER BY e.aggregate_key, e.sequence
        LIMIT ?4
    )
    RETURNING id, aggregate_key, sequence, event_type, payload, status, attempt_count,
              claimed_by, claimed_at, next_attempt_at, last_error, receipt_id,
              created_at, delivered_at";

/// Insert a new event. The store assigns the id and the next sequence for
/// the event's aggregate; the UNIQUE (aggregate_key, sequence) constraint
/// rejects the loser of a concurrent insert race.
pub fn insert_event(conn: &Connection, new: &NewOutboxEvent) -> DatabaseResult<OutboxEvent> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = fmt_datetime(Utc::now());
    conn.execute(
        "INSERT INTO outbox_events
             (id, aggregate_key, sequence, event_type, payload, status, attempt_count,
              next_attempt_at, created_at)
         VALUES (?1, ?2,
                 (SELECT COALESCE(MAX(sequence), 0) + 1 FROM outbox_events
                  WHERE aggregate_key = ?2),
                 ?3, ?4, 'pending', 0, ?5, ?5)",
        params![id, new.aggregate_key, new.event_type, new.payload, now],
    )?;
    get_event(conn, &id)?
        .ok_or_else(|| DatabaseError::NotFound("Event not found after insert".to_string()))
}

/// Atomically claim up to `limit` eligible events for `dispatcher_id`.
///
/// Eligible: pending with `next_attempt_at` in the past, or claimed with a
/// claim older than `stale_claim_timeout`. Within each aggregate only the
/// lowest-sequence non-terminal event is surfaced. Returned ordered by
/// (aggregate_key, sequence).
pub fn claim_batch(
    conn: &Connection,
    limit: usize,
    dispatcher_id: &str,
    stale_claim_timeout: Duration,
    unblock_on_failure: bool,
) -> DatabaseResult<Vec<OutboxEvent>> {
    let now = Utc::now();
    let stale_cutoff = now
        - chrono::Duration::from_std(stale_claim_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(3650));

    let sql = if unblock_on_failure {
        CLAIM_SQL_UNBLOCK_ON_FAILURE
    } else {
        CLAIM_SQL_BLOCK_ON_FAILURE
    };

    let mut stmt = conn.prepare_cached(sql)?;
    let mut events = stmt
        .query_map(
            params![
                dispatcher_id,
                fmt_datetime(now),
                fmt_datetime(stale_cutoff),
                limit as i64
            ],
            map_event_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    // RETURNING does not guarantee row order.
    events.sort_by(|a, b| {
        (a.aggregate_key.as_str(), a.sequence).cmp(&(b.aggregate_key.as_str(), b.sequence))
    });
    Ok(events)
}

/// Return a claimed event to pending, invisible until `visible_after`.
/// Passing no error keeps whatever cause was recorded before.
pub fn release_claim(
    conn: &Connection,
    event_id: &str,
    attempt_count: i32,
    last_error: Option<&str>,
    visible_after: DateTime<Utc>,
) -> DatabaseResult<usize> {
    let count = conn.execute(
        "UPDATE outbox_events
         SET status = 'pending', claimed_by = NULL, claimed_at = NULL,
             attempt_count = ?2, last_error = COALESCE(?3, last_error),
             next_attempt_at = ?4
         WHERE id = ?1 AND status = 'claimed'",
        params![
            event_id,
            attempt_count,
            last_error.map(truncate_error),
            fmt_datetime(visible_after)
        ],
    )?;
    Ok(count)
}

/// Settle a claimed event as delivered, recording the successful attempt
/// and the relay's receipt id.
pub fn mark_delivered(
    conn: &Connection,
    event_id: &str,
    receipt_id: &str,
) -> DatabaseResult<usize> {
    let now = fmt_datetime(Utc::now());
    let count = conn.execute(
        "UPDATE outbox_events
         SET status = 'delivered', claimed_by = NULL, claimed_at = NULL,
             attempt_count = attempt_count + 1, last_error = NULL,
             receipt_id = ?2, delivered_at = ?3
         WHERE id = ?1 AND status = 'claimed'",
        params![event_id, receipt_id, now],
    )?;
    Ok(count)
}

/// Settle a claimed event as failed-terminal, recording the cause.
pub fn mark_failed(
    conn: &Connection,
    event_id: &str,
    attempt_count: i32,
    last_error: &str,
) -> DatabaseResult<usize> {
    let count = conn.execute(
        "UPDATE outbox_events
         SET status = 'failed', claimed_by = NULL, claimed_at = NULL,
             attempt_count = ?2, last_error = ?3
         WHERE id = ?1 AND status = 'claimed'",
        params![event_id, attempt_count, truncate_error(last_error)],
    )?;
    Ok(count)
}

/// Settle a claimed event as skipped-terminal: no destination exists for
/// it. Never attempted, so the attempt count and error stay untouched.
pub fn mark_skipped(conn: &Connection, event_id: &str) -> DatabaseResult<usize> {
    let count = conn.execute(
        "UPDATE outbox_events
         SET status = 'skipped', claimed_by = NULL, claimed_at = NULL
         WHERE id = ?1 AND status = 'claimed'",
        params![event_id],
    )?;
    Ok(count)
}

/// Get an event by id.
pub fn get_event(conn: &Connection, id: &str) -> DatabaseResult<Option<OutboxEvent>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM outbox_events WHERE id = ?1",
        EVENT_COLUMNS
    ))?;

    match stmt.query_row(params![id], map_event_row) {
        Ok(event) => Ok(Some(event)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Number of events currently pending.
pub fn pending_count(conn: &Connection) -> DatabaseResult<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM outbox_events WHERE status = 'pending'",
        [],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Event counts per status, for the operator surface.
pub fn status_counts(conn: &Connection) -> DatabaseResult<Vec<(String, i64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT status, COUNT(*) FROM outbox_events GROUP BY status ORDER BY status",
    )?;
    let counts = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(counts)
}

fn map_event_row(row: &Row<'_>) -> rusqlite::Result<OutboxEvent> {
    Ok(OutboxEvent {
        id: row.get(0)?,
        aggregate_key: row.get(1)?,
        sequence: row.get(2)?,
        event_type: row.get(3)?,
        payload: row.get(4)?,
        status: EventStatus::from_str(&row.get::<_, String>(5)?),
        attempt_count: row.get(6)?,
        claimed_by: row.get(7)?,
        claimed_at: row.get::<_, Option<String>>(8)?.map(parse_datetime),
        next_attempt_at: parse_datetime(row.get::<_, String>(9)?),
        last_error: row.get(10)?,
        receipt_id: row.get(11)?,
        created_at: parse_datetime(row.get::<_, String>(12)?),
        delivered_at: row.get::<_, Option<String>>(13)?.map(parse_datetime),
    })
}

/// Fixed-precision UTC RFC 3339, so stored timestamps compare as strings.
fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn truncate_error(err: &str) -> String {
    err.chars().take(MAX_ERROR_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_migrations;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn new_event(aggregate: &str) -> NewOutboxEvent {
        NewOutboxEvent {
            aggregate_key: aggregate.to_string(),
            event_type: "asset.updated".to_string(),
            payload: b"{\"pid\":\"abc\"}".to_vec(),
        }
    }

    fn claim(conn: &Connection, limit: usize) -> Vec<OutboxEvent> {
        claim_batch(conn, limit, "disp-1", Duration::from_secs(300), true).unwrap()
    }

    #[test]
    fn test_insert_assigns_sequence_per_aggregate() {
        let conn = test_conn();
        let a1 = insert_event(&conn, &new_event("agg-a")).unwrap();
        let a2 = insert_event(&conn, &new_event("agg-a")).unwrap();
        let b1 = insert_event(&conn, &new_event("agg-b")).unwrap();

        assert_eq!(a1.sequence, 1);
        assert_eq!(a2.sequence, 2);
        assert_eq!(b1.sequence, 1);
        assert_eq!(a1.status, EventStatus::Pending);
        assert_eq!(a1.attempt_count, 0);
        assert_eq!(a1.payload, b"{\"pid\":\"abc\"}".to_vec());
    }

    #[test]
    fn test_claim_sets_claim_fields() {
        let conn = test_conn();
        let inserted = insert_event(&conn, &new_event("agg-a")).unwrap();

        let claimed = claim(&conn, 10);
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, inserted.id);
        assert_eq!(claimed[0].status, EventStatus::Claimed);
        assert_eq!(claimed[0].claimed_by.as_deref(), Some("disp-1"));
        assert!(claimed[0].claimed_at.is_some());

        // Already claimed: nothing left.
        assert!(claim(&conn, 10).is_empty());
    }

    #[test]
    fn test_claim_surfaces_only_lowest_sequence_per_aggregate() {
        let conn = test_conn();
        for _ in 0..3 {
            insert_event(&conn, &new_event("agg-a")).unwrap();
        }

        let claimed = claim(&conn, 10);
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].sequence, 1);

        // Sequence 2 stays hidden while 1 is unresolved.
        assert!(claim(&conn, 10).is_empty());
    }

    #[test]
    fn test_claim_spans_aggregates_ordered() {
        let conn = test_conn();
        insert_event(&conn, &new_event("agg-b")).unwrap();
        insert_event(&conn, &new_event("agg-a")).unwrap();
        insert_event(&conn, &new_event("agg-c")).unwrap();

        let claimed = claim(&conn, 10);
        let keys: Vec<&str> = claimed.iter().map(|e| e.aggregate_key.as_str()).collect();
        assert_eq!(keys, vec!["agg-a", "agg-b", "agg-c"]);
    }

    #[test]
    fn test_claim_respects_limit() {
        let conn = test_conn();
        for i in 0..5 {
            insert_event(&conn, &new_event(&format!("agg-{}", i))).unwrap();
        }

        assert_eq!(claim(&conn, 2).len(), 2);
        assert_eq!(claim(&conn, 10).len(), 3);
    }

    #[test]
    fn test_failed_terminal_unblocks_successor() {
        let conn = test_conn();
        insert_event(&conn, &new_event("agg-a")).unwrap();
        insert_event(&conn, &new_event("agg-a")).unwrap();

        let first = claim(&conn, 10);
        assert_eq!(first[0].sequence, 1);
        mark_failed(&conn, &first[0].id, 1, "HTTP 422: rejected").unwrap();

        let second = claim(&conn, 10);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].sequence, 2);
    }

    #[test]
    fn test_failed_terminal_keeps_blocking_when_unblock_disabled() {
        let conn = test_conn();
        insert_event(&conn, &new_event("agg-a")).unwrap();
        insert_event(&conn, &new_event("agg-a")).unwrap();

        let first =
            claim_batch(&conn, 10, "disp-1", Duration::from_secs(300), false).unwrap();
        mark_failed(&conn, &first[0].id, 1, "HTTP 422: rejected").unwrap();

        // The failed event still parks its stream.
        let second =
            claim_batch(&conn, 10, "disp-1", Duration::from_secs(300), false).unwrap();
        assert!(second.is_empty());

        // Other aggregates are unaffected.
        insert_event(&conn, &new_event("agg-b")).unwrap();
        let third = claim_batch(&conn, 10, "disp-1", Duration::from_secs(300), false).unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].aggregate_key, "agg-b");
    }

    #[test]
    fn test_skipped_unblocks_successor_in_both_modes() {
        for unblock in [true, false] {
            let conn = test_conn();
            insert_event(&conn, &new_event("agg-a")).unwrap();
            insert_event(&conn, &new_event("agg-a")).unwrap();

            let first =
                claim_batch(&conn, 10, "disp-1", Duration::from_secs(300), unblock).unwrap();
            assert_eq!(first[0].sequence, 1);
            mark_skipped(&conn, &first[0].id).unwrap();

            let skipped = get_event(&conn, &first[0].id).unwrap().unwrap();
            assert_eq!(skipped.status, EventStatus::Skipped);
            assert_eq!(skipped.attempt_count, 0);
            assert!(skipped.last_error.is_none());

            let second =
                claim_batch(&conn, 10, "disp-1", Duration::from_secs(300), unblock).unwrap();
            assert_eq!(second.len(), 1);
            assert_eq!(second[0].sequence, 2);
        }
    }

    #[test]
    fn test_delivered_unblocks_successor() {
        let conn = test_conn();
        insert_event(&conn, &new_event("agg-a")).unwrap();
        insert_event(&conn, &new_event("agg-a")).unwrap();

        let first = claim(&conn, 10);
        mark_delivered(&conn, &first[0].id, "rcpt-1").unwrap();

        let second = claim(&conn, 10);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].sequence, 2);
    }

    #[test]
    fn test_release_with_future_visibility_gates_reclaim() {
        let conn = test_conn();
        insert_event(&conn, &new_event("agg-a")).unwrap();

        let claimed = claim(&conn, 10);
        let count = release_claim(
            &conn,
            &claimed[0].id,
            1,
            Some("HTTP 503: overloaded"),
            Utc::now() + chrono::Duration::hours(1),
        )
        .unwrap();
        assert_eq!(count, 1);

        // Invisible until the delay elapses.
        assert!(claim(&conn, 10).is_empty());

        let event = get_event(&conn, &claimed[0].id).unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.attempt_count, 1);
        assert_eq!(event.last_error.as_deref(), Some("HTTP 503: overloaded"));
    }

    #[test]
    fn test_release_with_past_visibility_is_reclaimable() {
        let conn = test_conn();
        insert_event(&conn, &new_event("agg-a")).unwrap();

        let claimed = claim(&conn, 10);
        release_claim(&conn, &claimed[0].id, 1, None, Utc::now()).unwrap();

        let reclaimed = claim(&conn, 10);
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempt_count, 1);
    }

    #[test]
    fn test_release_without_error_keeps_previous_cause() {
        let conn = test_conn();
        insert_event(&conn, &new_event("agg-a")).unwrap();

        let claimed = claim(&conn, 10);
        release_claim(&conn, &claimed[0].id, 1, Some("first cause"), Utc::now()).unwrap();

        let reclaimed = claim(&conn, 10);
        release_claim(&conn, &reclaimed[0].id, 1, None, Utc::now()).unwrap();

        let event = get_event(&conn, &claimed[0].id).unwrap().unwrap();
        assert_eq!(event.last_error.as_deref(), Some("first cause"));
    }

    #[test]
    fn test_stale_claim_is_reclaimed_exactly_once() {
        let conn = test_conn();
        let inserted = insert_event(&conn, &new_event("agg-a")).unwrap();

        claim(&conn, 10);
        // Fresh claim: not reclaimable.
        assert!(claim(&conn, 10).is_empty());

        // Backdate the claim past the timeout, as if the holder crashed.
        let stale = fmt_datetime(Utc::now() - chrono::Duration::hours(1));
        conn.execute(
            "UPDATE outbox_events SET claimed_at = ?1 WHERE id = ?2",
            params![stale, inserted.id],
        )
        .unwrap();

        let reclaimed = claim(&conn, 10);
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, inserted.id);

        // Exactly once.
        assert!(claim(&conn, 10).is_empty());
    }

    #[test]
    fn test_mark_delivered_records_attempt_and_receipt() {
        let conn = test_conn();
        let inserted = insert_event(&conn, &new_event("agg-a")).unwrap();

        let claimed = claim(&conn, 10);
        let count = mark_delivered(&conn, &claimed[0].id, "rcpt-42").unwrap();
        assert_eq!(count, 1);

        let event = get_event(&conn, &inserted.id).unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Delivered);
        assert_eq!(event.attempt_count, 1);
        assert_eq!(event.receipt_id.as_deref(), Some("rcpt-42"));
        assert!(event.delivered_at.is_some());
        assert!(event.last_error.is_none());

        // Settling twice finds no live claim.
        assert_eq!(mark_delivered(&conn, &claimed[0].id, "rcpt-43").unwrap(), 0);
    }

    #[test]
    fn test_settle_unclaimed_event_is_a_noop() {
        let conn = test_conn();
        let inserted = insert_event(&conn, &new_event("agg-a")).unwrap();

        assert_eq!(mark_delivered(&conn, &inserted.id, "rcpt-1").unwrap(), 0);
        assert_eq!(mark_failed(&conn, &inserted.id, 1, "boom").unwrap(), 0);
        assert_eq!(mark_skipped(&conn, &inserted.id).unwrap(), 0);
        assert_eq!(
            release_claim(&conn, &inserted.id, 1, None, Utc::now()).unwrap(),
            0
        );

        let event = get_event(&conn, &inserted.id).unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.attempt_count, 0);
    }

    #[test]
    fn test_error_cause_is_truncated() {
        let conn = test_conn();
        insert_event(&conn, &new_event("agg-a")).unwrap();

        let claimed = claim(&conn, 10);
        let long_error = "x".repeat(5000);
        mark_failed(&conn, &claimed[0].id, 1, &long_error).unwrap();

        let event = get_event(&conn, &claimed[0].id).unwrap().unwrap();
        assert_eq!(event.last_error.unwrap().len(), MAX_ERROR_LEN);
    }

    #[test]
    fn test_status_counts() {
        let conn = test_conn();
        insert_event(&conn, &new_event("agg-a")).unwrap();
        insert_event(&conn, &new_event("agg-b")).unwrap();
        insert_event(&conn, &new_event("agg-c")).unwrap();

        let claimed = claim(&conn, 1);
        mark_delivered(&conn, &claimed[0].id, "rcpt-1").unwrap();

        let counts = status_counts(&conn).unwrap();
        assert_eq!(
            counts,
            vec![("delivered".to_string(), 1), ("pending".to_string(), 2)]
        );
        assert_eq!(pending_count(&conn).unwrap(), 2);
    }
}

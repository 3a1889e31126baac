//! Outbox event model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single outbox row: immutable payload plus mutable dispatch metadata.
///
/// Events are created by the producer side with status `pending` and mutated
/// only through the [`EventStore`](crate::EventStore) settle operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Unique identifier, assigned by the store.
    pub id: String,
    /// Logical stream the event belongs to. Events sharing an aggregate key
    /// are delivered in `sequence` order.
    pub aggregate_key: String,
    /// Monotone per aggregate key, assigned at insert.
    pub sequence: i64,
    /// Event type forwarded to the delivery endpoint.
    pub event_type: String,
    /// Opaque content, forwarded verbatim.
    pub payload: Vec<u8>,
    /// Dispatch status.
    pub status: EventStatus,
    /// Delivery attempts made so far. Only ever increases.
    pub attempt_count: i32,
    /// Dispatcher instance currently holding the claim.
    pub claimed_by: Option<String>,
    /// When the claim was taken; stale claims are reclaimed after a timeout.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Earliest instant the event may be claimed again after a retry.
    pub next_attempt_at: DateTime<Utc>,
    /// Last recorded failure cause.
    pub last_error: Option<String>,
    /// Remote message id returned by the delivery endpoint on success.
    pub receipt_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Dispatch status of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Claimed,
    Delivered,
    /// Failed terminally; no further dispatch action occurs.
    Failed,
    /// No destination application is configured for the event's aggregate;
    /// terminal, never attempted.
    Skipped,
}

impl Default for EventStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "claimed" => Self::Claimed,
            "delivered" => Self::Delivered,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            _ => Self::Pending,
        }
    }

    /// Delivered, failed or skipped: no further dispatch action occurs.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Skipped)
    }
}

/// New event for insertion by the producer side.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub aggregate_key: String,
    pub event_type: String,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            EventStatus::Pending,
            EventStatus::Claimed,
            EventStatus::Delivered,
            EventStatus::Failed,
            EventStatus::Skipped,
        ] {
            assert_eq!(EventStatus::from_str(status.as_str()), status);
        }
    }

    #[test]
    fn test_status_from_str_unknown_defaults_to_pending() {
        assert_eq!(EventStatus::from_str("bogus"), EventStatus::Pending);
        assert_eq!(EventStatus::from_str(""), EventStatus::Pending);
        assert_eq!(EventStatus::from_str("PENDING"), EventStatus::Pending);
        assert_eq!(EventStatus::from_str("DELIVERED"), EventStatus::Delivered);
    }

    #[test]
    fn test_status_terminality() {
        assert!(!EventStatus::Pending.is_terminal());
        assert!(!EventStatus::Claimed.is_terminal());
        assert!(EventStatus::Delivered.is_terminal());
        assert!(EventStatus::Failed.is_terminal());
        assert!(EventStatus::Skipped.is_terminal());
    }
}

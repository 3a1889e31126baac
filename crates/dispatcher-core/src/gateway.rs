//! Store and transport contracts consumed by the dispatch loop.

use crate::{CoreResult, NewOutboxEvent, OutboxEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Contract over the outbox table.
///
/// The store is the sole synchronization point between dispatcher instances:
/// `claim_batch` must be atomic (claim-if-eligible in a single round trip),
/// and a failed call must leave no event state mutated.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically claim up to `limit` eligible events for `dispatcher_id`.
    ///
    /// Eligible events are pending with `next_attempt_at` in the past, or
    /// claimed with a claim older than `stale_claim_timeout` (crash
    /// recovery). Within each aggregate only the lowest-sequence
    /// non-terminal event may be surfaced, so sequence n+1 never appears
    /// while n is unresolved. The result is ordered by aggregate key and
    /// sequence. Two concurrent callers never both claim the same event.
    async fn claim_batch(
        &self,
        limit: usize,
        dispatcher_id: &str,
        stale_claim_timeout: Duration,
    ) -> CoreResult<Vec<OutboxEvent>>;

    /// Return a claimed event to pending, invisible to claimers until
    /// `visible_after`. Records the new attempt count and, when given, the
    /// failure cause.
    async fn release_claim(
        &self,
        event_id: &str,
        attempt_count: i32,
        last_error: Option<&str>,
        visible_after: DateTime<Utc>,
    ) -> CoreResult<()>;

    /// Settle a claimed event as delivered (terminal). The store records
    /// the successful attempt by incrementing the event's attempt count.
    async fn mark_delivered(&self, event_id: &str, receipt_id: &str) -> CoreResult<()>;

    /// Settle a claimed event as failed (terminal), recording the cause.
    async fn mark_failed(
        &self,
        event_id: &str,
        attempt_count: i32,
        last_error: &str,
    ) -> CoreResult<()>;

    /// Settle a claimed event as skipped (terminal): no destination exists
    /// for it, so it was never attempted. The attempt count is untouched.
    async fn mark_skipped(&self, event_id: &str) -> CoreResult<()>;

    /// Producer-side insert. The store assigns the id and the next sequence
    /// for the event's aggregate.
    async fn insert_event(&self, event: NewOutboxEvent) -> CoreResult<OutboxEvent>;

    /// Number of events currently pending delivery.
    async fn pending_count(&self) -> CoreResult<usize>;
}

/// Outcome of a confirmed delivery.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    /// Remote message id assigned by the delivery endpoint.
    pub receipt_id: String,
}

/// A classified delivery failure.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl DeliveryFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Unauthorized,
            message: message.into(),
        }
    }

    pub fn unroutable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Unroutable,
            message: message.into(),
        }
    }
}

/// Classification of a delivery failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Likely to succeed on retry (network, timeout, 5xx).
    Transient,
    /// Structurally certain to fail again (validation rejection, 4xx).
    Permanent,
    /// Credentials rejected. The loop releases the claim without burning an
    /// attempt and stops; retrying with the same token cannot succeed.
    Unauthorized,
    /// No destination application is configured for the event's aggregate.
    /// The loop settles the event as skipped without attempting delivery.
    Unroutable,
}

/// Contract over the outbound transport.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    /// Forward one event's payload. Blocking from the loop's perspective;
    /// the result must be classified so the retry policy can decide.
    async fn send(&self, event: &OutboxEvent) -> Result<DeliveryReceipt, DeliveryFailure>;
}

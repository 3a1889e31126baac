//! The dispatch loop: claim → deliver → settle cycles.

use crate::{
    CoreResult, DeliveryClient, EventStore, FailureKind, Liveness, OutboxEvent, RetryDecision,
    RetryPolicy,
};
use chrono::Utc;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Dispatch loop configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Identifier recorded on claims taken by this instance.
    pub dispatcher_id: String,
    /// Maximum events claimed per cycle.
    pub batch_size: usize,
    /// Sleep between cycles that claim nothing.
    pub idle_interval: Duration,
    /// Claim age after which another instance may reclaim it. Must exceed
    /// the worst-case delivery latency plus margin.
    pub stale_claim_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            dispatcher_id: format!("dispatcher-{}", uuid::Uuid::new_v4()),
            batch_size: 100,
            idle_interval: Duration::from_secs(120),
            stale_claim_timeout: Duration::from_secs(300),
        }
    }
}

/// Counters for one claim/deliver/settle cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Events claimed this cycle.
    pub claimed: usize,
    /// Delivered and settled as terminal.
    pub delivered: usize,
    /// Released back to pending with a retry delay.
    pub retried: usize,
    /// Settled as failed-terminal.
    pub failed: usize,
    /// Settled as skipped: no destination configured for the aggregate.
    pub skipped: usize,
    /// Released unattempted (shutdown or blocked by a retried predecessor).
    pub released: usize,
}

impl CycleOutcome {
    fn absorb(&mut self, other: CycleOutcome) {
        self.delivered += other.delivered;
        self.retried += other.retried;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.released += other.released;
    }
}

/// Orchestrates poll → claim → deliver → settle against an [`EventStore`]
/// and a [`DeliveryClient`].
///
/// Multiple instances may run against the same store; the store's claim
/// operation is the sole synchronization point. Within one instance,
/// aggregates are delivered concurrently but events of one aggregate
/// strictly in sequence.
pub struct DispatchLoop {
    store: Arc<dyn EventStore>,
    client: Arc<dyn DeliveryClient>,
    policy: RetryPolicy,
    config: DispatchConfig,
    liveness: Liveness,
    shutdown: watch::Receiver<bool>,
    // Set when the loop stops itself (rejected credentials).
    stopped: AtomicBool,
}

impl DispatchLoop {
    pub fn new(
        store: Arc<dyn EventStore>,
        client: Arc<dyn DeliveryClient>,
        policy: RetryPolicy,
        config: DispatchConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            client,
            policy,
            config,
            liveness: Liveness::new(),
            shutdown,
            stopped: AtomicBool::new(false),
        }
    }

    /// Probe recording when the loop last completed a cycle.
    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    /// Run cycles until the shutdown signal flips or the loop stops itself.
    pub async fn run(&self) {
        info!(
            dispatcher_id = %self.config.dispatcher_id,
            batch_size = self.config.batch_size,
            idle_interval_secs = self.config.idle_interval.as_secs(),
            "Dispatch loop started"
        );

        loop {
            if self.should_stop() {
                break;
            }

            match self.run_cycle().await {
                Ok(outcome) if outcome.claimed == 0 => {
                    debug!("No claimable events, idling");
                    self.idle_sleep().await;
                }
                Ok(outcome) => {
                    debug!(
                        claimed = outcome.claimed,
                        delivered = outcome.delivered,
                        retried = outcome.retried,
                        failed = outcome.failed,
                        skipped = outcome.skipped,
                        released = outcome.released,
                        "Cycle complete"
                    );
                }
                Err(e) => {
                    // No event state was mutated by the failed call; retry
                    // the whole cycle after the idle interval.
                    warn!(error = %e, "Cycle aborted, store unavailable");
                    self.idle_sleep().await;
                }
            }
        }

        info!(dispatcher_id = %self.config.dispatcher_id, "Dispatch loop stopped");
    }

    /// Execute one claim/deliver/settle cycle.
    pub async fn run_cycle(&self) -> CoreResult<CycleOutcome> {
        let events = self
            .store
            .claim_batch(
                self.config.batch_size,
                &self.config.dispatcher_id,
                self.config.stale_claim_timeout,
            )
            .await?;

        let mut outcome = CycleOutcome {
            claimed: events.len(),
            ..Default::default()
        };

        if events.is_empty() {
            self.liveness.record_cycle();
            return Ok(outcome);
        }

        // The claim comes back ordered by (aggregate_key, sequence); keep
        // that order within each group.
        let mut groups: BTreeMap<String, Vec<OutboxEvent>> = BTreeMap::new();
        for event in events {
            groups
                .entry(event.aggregate_key.clone())
                .or_default()
                .push(event);
        }

        let results = join_all(groups.into_values().map(|group| self.dispatch_group(group))).await;

        let mut first_error = None;
        for result in results {
            match result {
                Ok(group_outcome) => outcome.absorb(group_outcome),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        self.liveness.record_cycle();

        // A failed settle leaves its event claimed; stale-claim reclamation
        // recovers it. Other groups' outcomes still count.
        match first_error {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    /// Deliver one aggregate's claimed events strictly in sequence.
    async fn dispatch_group(&self, group: Vec<OutboxEvent>) -> CoreResult<CycleOutcome> {
        let mut outcome = CycleOutcome::default();
        let mut events = group.into_iter();

        while let Some(event) = events.next() {
            if self.should_stop() {
                outcome.released += self.release_unattempted(event, &mut events).await?;
                break;
            }

            match self.client.send(&event).await {
                Ok(receipt) => {
                    self.store.mark_delivered(&event.id, &receipt.receipt_id).await?;
                    outcome.delivered += 1;
                    info!(
                        event_id = %event.id,
                        aggregate_key = %event.aggregate_key,
                        sequence = event.sequence,
                        receipt_id = %receipt.receipt_id,
                        "Event delivered"
                    );
                }
                Err(failure) if failure.kind == FailureKind::Unroutable => {
                    // Terminal but never attempted; successors are free to
                    // proceed once a destination exists for them.
                    self.store.mark_skipped(&event.id).await?;
                    outcome.skipped += 1;
                    debug!(
                        event_id = %event.id,
                        aggregate_key = %event.aggregate_key,
                        "No destination application for event, skipped"
                    );
                }
                Err(failure) if failure.kind == FailureKind::Unauthorized => {
                    // A broken credential must not burn attempts; give the
                    // claim back untouched and stop initiating work.
                    warn!(
                        event_id = %event.id,
                        error = %failure.message,
                        "Delivery rejected by endpoint: invalid credentials, stopping loop"
                    );
                    self.stopped.store(true, Ordering::SeqCst);
                    outcome.released += self.release_unattempted(event, &mut events).await?;
                    break;
                }
                Err(failure) => {
                    let attempts = event.attempt_count + 1;
                    match self.policy.decide(attempts as u32, failure.kind) {
                        RetryDecision::RetryAfter(delay) => {
                            let visible_after = Utc::now()
                                + chrono::Duration::from_std(delay)
                                    .unwrap_or_else(|_| chrono::Duration::days(3650));
                            self.store
                                .release_claim(
                                    &event.id,
                                    attempts,
                                    Some(&failure.message),
                                    visible_after,
                                )
                                .await?;
                            outcome.retried += 1;
                            warn!(
                                event_id = %event.id,
                                attempts,
                                delay_ms = delay.as_millis() as u64,
                                error = %failure.message,
                                "Delivery failed, will retry"
                            );
                            // Successors must not overtake the retried
                            // event; give back whatever else was claimed
                            // for this aggregate.
                            outcome.released += self.release_rest(&mut events).await?;
                            break;
                        }
                        RetryDecision::GiveUp => {
                            self.store
                                .mark_failed(&event.id, attempts, &failure.message)
                                .await?;
                            outcome.failed += 1;
                            error!(
                                event_id = %event.id,
                                aggregate_key = %event.aggregate_key,
                                sequence = event.sequence,
                                attempts,
                                error = %failure.message,
                                "Event failed terminally"
                            );
                        }
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Release `first` and everything left in `rest` without an attempt.
    async fn release_unattempted(
        &self,
        first: OutboxEvent,
        rest: &mut std::vec::IntoIter<OutboxEvent>,
    ) -> CoreResult<usize> {
        let mut released = self.release_one(first).await?;
        released += self.release_rest(rest).await?;
        Ok(released)
    }

    async fn release_rest(
        &self,
        rest: &mut std::vec::IntoIter<OutboxEvent>,
    ) -> CoreResult<usize> {
        let remaining: Vec<OutboxEvent> = rest.collect();
        let mut released = 0;
        for event in remaining {
            released += self.release_one(event).await?;
        }
        Ok(released)
    }

    async fn release_one(&self, event: OutboxEvent) -> CoreResult<usize> {
        self.store
            .release_claim(
                &event.id,
                event.attempt_count,
                event.last_error.as_deref(),
                Utc::now(),
            )
            .await?;
        debug!(event_id = %event.id, "Claim released unattempted");
        Ok(1)
    }

    fn should_stop(&self) -> bool {
        *self.shutdown.borrow() || self.stopped.load(Ordering::SeqCst)
    }

    async fn idle_sleep(&self) {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.config.idle_interval) => {}
            _ = shutdown.changed() => {}
        }
    }
}

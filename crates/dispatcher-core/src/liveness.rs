//! Liveness probe for the dispatch loop.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared handle recording when the loop last completed a poll cycle.
///
/// Cloneable; the loop records, the process wrapper probes.
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    // Epoch millis of the last completed cycle, 0 = never.
    last_cycle_ms: Arc<AtomicI64>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a poll cycle just completed.
    pub fn record_cycle(&self) {
        self.last_cycle_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// When the last cycle completed, if any cycle has completed yet.
    pub fn last_cycle_at(&self) -> Option<DateTime<Utc>> {
        match self.last_cycle_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::<Utc>::from_timestamp_millis(ms),
        }
    }

    /// True when the last cycle completed within `expected_interval`.
    pub fn is_live(&self, expected_interval: Duration) -> bool {
        match self.last_cycle_at() {
            Some(at) => Utc::now()
                .signed_duration_since(at)
                .to_std()
                .map(|age| age <= expected_interval)
                // A last-cycle instant in the future means the clock moved;
                // treat it as live rather than flapping.
                .unwrap_or(true),
            None => false,
        }
    }
}

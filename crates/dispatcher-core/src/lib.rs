//! Dispatch core for the outbox event dispatcher.
//!
//! This crate provides:
//! - OutboxEvent: the event model shared by the store and the loop
//! - EventStore / DeliveryClient: contracts over the outbox table and the
//!   outbound transport
//! - RetryPolicy: pure backoff/give-up decision for failed deliveries
//! - DispatchLoop: claim → deliver → settle cycles with idle backoff and
//!   cooperative shutdown
//!
//! No storage or transport lives here; concrete adapters are provided by
//! `dispatcher-database` and `dispatcher-relay-client`.

mod dispatch;
mod error;
mod event;
mod gateway;
mod liveness;
mod retry;

pub use dispatch::{CycleOutcome, DispatchConfig, DispatchLoop};
pub use error::{CoreError, CoreResult};
pub use event::{EventStatus, NewOutboxEvent, OutboxEvent};
pub use gateway::{DeliveryClient, DeliveryFailure, DeliveryReceipt, EventStore, FailureKind};
pub use liveness::Liveness;
pub use retry::{RetryDecision, RetryPolicy};

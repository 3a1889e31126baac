//! HTTP delivery client for the webhook relay.
//!
//! Implements [`dispatcher_core::DeliveryClient`] over `reqwest`, carrying
//! an idempotency key per event and classifying failures into the kinds the
//! retry policy understands.

mod client;
mod error;

pub use client::{RelayClient, RelayConfig};
pub use error::{RelayError, RelayResult};

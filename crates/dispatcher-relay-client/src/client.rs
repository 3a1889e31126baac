//! Relay HTTP client.

use crate::RelayResult;
use async_trait::async_trait;
use base64::Engine;
use dispatcher_core::{DeliveryClient, DeliveryFailure, DeliveryReceipt, FailureKind, OutboxEvent};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Relay client configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base URL of the relay API.
    pub base_url: String,
    /// Bearer token for the relay API.
    pub auth_token: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Aggregate key to destination application id. Events whose aggregate
    /// is absent here are unroutable and get skipped, not delivered.
    pub route_map: HashMap<String, String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8071".to_string(),
            auth_token: String::new(),
            timeout_secs: 30,
            route_map: HashMap::new(),
        }
    }
}

/// Request payload for forwarding one event.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendEventRequest<'a> {
    event_id: &'a str,
    event_type: &'a str,
    aggregate_key: &'a str,
    sequence: i64,
    /// Opaque payload bytes, base64-encoded for the JSON body.
    payload: String,
}

/// Response from the relay.
#[derive(Debug, Deserialize)]
struct SendEventResponse {
    id: String,
}

/// HTTP delivery client for the webhook relay.
///
/// Each event is routed to a destination application via the configured
/// map before anything goes on the wire.
pub struct RelayClient {
    config: RelayConfig,
    client: Client,
}

impl RelayClient {
    /// Create a new relay client.
    pub fn new(config: RelayConfig) -> RelayResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    /// Destination application id for an aggregate, if one is configured.
    fn route(&self, aggregate_key: &str) -> Option<&str> {
        self.config.route_map.get(aggregate_key).map(String::as_str)
    }

    /// Attempt to forward one event (single try; retry is the loop's job).
    async fn try_send(&self, event: &OutboxEvent) -> Result<DeliveryReceipt, DeliveryFailure> {
        let app_id = self.route(&event.aggregate_key).ok_or_else(|| {
            DeliveryFailure::unroutable(format!(
                "No destination application for aggregate {}",
                event.aggregate_key
            ))
        })?;

        let url = format!(
            "{}/apps/{}/events",
            self.config.base_url.trim_end_matches('/'),
            app_id
        );
        let request = SendEventRequest {
            event_id: &event.id,
            event_type: &event.event_type,
            aggregate_key: &event.aggregate_key,
            sequence: event.sequence,
            payload: base64::engine::general_purpose::STANDARD.encode(&event.payload),
        };

        debug!(
            url = %url,
            event_id = %event.id,
            event_type = %event.event_type,
            "Sending event"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.auth_token))
            .header("Idempotency-Key", idempotency_key(&event.id))
            .json(&request)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryFailure {
                kind: classify_status(status),
                message: format!("HTTP {}: {}", status.as_u16(), body),
            });
        }

        // A success without a parseable receipt is retried; the idempotency
        // key makes the redelivery harmless.
        let receipt: SendEventResponse = response
            .json()
            .await
            .map_err(|e| DeliveryFailure::transient(format!("Invalid relay response: {}", e)))?;

        Ok(DeliveryReceipt {
            receipt_id: receipt.id,
        })
    }
}

#[async_trait]
impl DeliveryClient for RelayClient {
    async fn send(&self, event: &OutboxEvent) -> Result<DeliveryReceipt, DeliveryFailure> {
        self.try_send(event).await
    }
}

/// Idempotency key the relay uses to deduplicate redeliveries.
fn idempotency_key(event_id: &str) -> String {
    format!("outbox:{}", event_id)
}

fn classify_request_error(err: reqwest::Error) -> DeliveryFailure {
    // Connect failures, timeouts and body errors are all retryable.
    DeliveryFailure::transient(format!("Request failed: {}", err))
}

/// Map a non-success status to a failure kind.
fn classify_status(status: StatusCode) -> FailureKind {
    match status {
        StatusCode::UNAUTHORIZED => FailureKind::Unauthorized,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => FailureKind::Transient,
        s if s.is_server_error() => FailureKind::Transient,
        s if s.is_client_error() => FailureKind::Permanent,
        _ => FailureKind::Transient,
    }
}

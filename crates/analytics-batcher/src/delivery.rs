// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of events to the ingestion endpoint.
//!
//! # Wire format
//!
//! Batches are posted to `<api_url>/batch` as:
//!
//! ```json
//! {"batch": [{"type": "track", "event": "Signed Up", ...}], "context": {...}, "integrations": {...}}
//! ```
//!
//! `context` and `integrations` are only present when given. A single event is
//! posted on its own to `<api_url>/<type>`.
//!
//! # Outcome
//!
//! | Result                           | Retried | Outcome   |
//! |----------------------------------|---------|-----------|
//! | 200                              | -       | `Success` |
//! | 400 (too large or malformed)     | no      | `Failure` |
//! | any other status                 | no      | `Failure` |
//! | transport error (connect, timeout) | yes   | `Failure` once the retry budget is spent |
//!
//! Every failure is logged here. Callers only see the two-valued
//! [`DeliveryOutcome`].

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde_json::{json, Map, Value};
use tracing::{debug, error};

use crate::config::BatcherConfig;
use crate::error::{ConfigError, DeliveryError};
use crate::event::Event;
use crate::http::get_client;
use crate::retry::{with_backoff, RetryPolicy};
use crate::telemetry::{DeliveryEvent, DeliveryKind, DeliveryObserver, TracingObserver};

/// Library name reported in the default event context.
pub const LIBRARY_NAME: &str = "analytics-batcher";

const BATCH_PATH: &str = "batch";

/// Result of a delivery call as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    Failure,
}

impl DeliveryOutcome {
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Anything that can take a batch of events off the scheduler's hands.
#[async_trait]
pub trait BatchSender: Send + Sync {
    /// Delivers `events` as one call, preserving their order.
    async fn send_batch(&self, events: Vec<Event>) -> DeliveryOutcome;

    /// Delivers one event outside of any batch.
    async fn send_event(&self, event: Event) -> DeliveryOutcome {
        self.send_batch(vec![event]).await
    }
}

/// HTTP delivery client with bounded retry on transport errors.
pub struct DeliveryClient {
    client: reqwest::Client,
    base_url: Url,
    write_key: String,
    retry_policy: RetryPolicy,
    default_context: Value,
    observer: Arc<dyn DeliveryObserver>,
}

impl DeliveryClient {
    pub fn new(config: &BatcherConfig) -> Result<Self, ConfigError> {
        // `Url::join` replaces the last path segment unless the base ends in '/'.
        let mut api_url = config.api_url.clone();
        if !api_url.ends_with('/') {
            api_url.push('/');
        }
        let base_url = Url::parse(&api_url).map_err(|_| ConfigError::InvalidValue {
            name: "ANALYTICS_API_URL",
            value: config.api_url.clone(),
        })?;

        Ok(Self {
            client: get_client(config),
            base_url,
            write_key: config.write_key.clone(),
            retry_policy: config.retry_policy(),
            default_context: default_context(),
            observer: Arc::new(TracingObserver),
        })
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn DeliveryObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Sends one event to the endpoint named after its type.
    pub async fn send_one(&self, event: Event) -> DeliveryOutcome {
        let path = event.event_type().to_string();
        let payload = normalize(event, &self.default_context, None, &sent_at());
        self.deliver(DeliveryKind::Single, &path, 1, payload).await
    }

    /// Sends `events` as one batch with the default context.
    pub async fn send_batch_with(
        &self,
        events: Vec<Event>,
        context: Option<Value>,
        integrations: Option<Value>,
    ) -> DeliveryOutcome {
        if events.is_empty() {
            return DeliveryOutcome::Success;
        }
        let event_count = events.len();
        let payload = build_envelope(
            events,
            &self.default_context,
            context,
            integrations,
            &sent_at(),
        );
        self.deliver(DeliveryKind::Batch, BATCH_PATH, event_count, payload)
            .await
    }

    async fn deliver(
        &self,
        kind: DeliveryKind,
        path: &str,
        event_count: usize,
        payload: Value,
    ) -> DeliveryOutcome {
        let event = DeliveryEvent {
            kind,
            path,
            event_count,
            payload: &payload,
        };
        self.observer.on_start(&event);
        let start = Instant::now();

        let result = self.post(path, &payload).await;

        let outcome = match result {
            Ok(()) => {
                debug!("Delivered {event_count} events to {path}");
                DeliveryOutcome::Success
            }
            Err(e) => {
                log_failure(&e, path, event_count);
                self.observer.on_error(&event, &e.to_string());
                DeliveryOutcome::Failure
            }
        };
        self.observer.on_stop(&event, outcome, start.elapsed());
        outcome
    }

    async fn post(&self, path: &str, payload: &Value) -> Result<(), DeliveryError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| DeliveryError::InvalidRequest(format!("cannot build URL for {path}: {e}")))?;
        let body = serde_json::to_vec(payload)?;

        with_backoff(
            &self.retry_policy,
            |e| matches!(e, DeliveryError::Transport(_)),
            |attempt| {
                debug!(attempt, url = %url, bytes = body.len(), "Posting payload");
                self.post_once(url.clone(), body.clone())
            },
        )
        .await
    }

    async fn post_once(&self, url: Url, body: Vec<u8>) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(url)
            .basic_auth(&self.write_key, Some(""))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::BAD_REQUEST => Err(DeliveryError::PayloadRejected(
                response.text().await.unwrap_or_default(),
            )),
            status => Err(DeliveryError::UnexpectedStatus {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl BatchSender for DeliveryClient {
    async fn send_batch(&self, events: Vec<Event>) -> DeliveryOutcome {
        self.send_batch_with(events, None, None).await
    }

    async fn send_event(&self, event: Event) -> DeliveryOutcome {
        self.send_one(event).await
    }
}

fn log_failure(error: &DeliveryError, path: &str, event_count: usize) {
    match error {
        DeliveryError::PayloadRejected(body) => error!(
            "Endpoint rejected {event_count} events sent to {path} as too large or malformed, dropping them: {body}"
        ),
        DeliveryError::InvalidRequest(reason) => error!(
            "Could not build request for {event_count} events sent to {path}, dropping them: {reason}"
        ),
        DeliveryError::UnexpectedStatus { status, body } => error!(
            "Endpoint returned {status} for {event_count} events sent to {path}, dropping them: {body}"
        ),
        DeliveryError::Transport(e) => error!(
            "Failed to send {event_count} events to {path} after exhausting retries, dropping them: {e}"
        ),
        DeliveryError::Serialization(e) => error!(
            "Failed to serialize {event_count} events for {path}, dropping them: {e}"
        ),
    }
}

fn default_context() -> Value {
    json!({
        "library": {
            "name": LIBRARY_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

fn sent_at() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Wraps normalized events into the batch envelope.
pub(crate) fn build_envelope(
    events: Vec<Event>,
    default_context: &Value,
    context: Option<Value>,
    integrations: Option<Value>,
    timestamp: &str,
) -> Value {
    let batch: Vec<Value> = events
        .into_iter()
        .map(|event| normalize(event, default_context, context.as_ref(), timestamp))
        .collect();

    let mut envelope = Map::new();
    envelope.insert("batch".to_string(), Value::Array(batch));
    if let Some(context) = context {
        envelope.insert("context".to_string(), context);
    }
    if let Some(integrations) = integrations {
        envelope.insert("integrations".to_string(), integrations);
    }
    let mut envelope = Value::Object(envelope);
    prune(&mut envelope);
    // An empty batch array is kept; only objects and nulls are pruned.
    envelope
}

/// Turns an event into its wire form.
///
/// The event's own context is layered over `explicit_context` if given, else
/// over `default_context`. `timestamp` is only set when the event has none.
/// Nulls and empty objects are removed at every depth.
pub(crate) fn normalize(
    event: Event,
    default_context: &Value,
    explicit_context: Option<&Value>,
    timestamp: &str,
) -> Value {
    let (event_type, mut fields) = event.into_parts();

    let base = explicit_context.unwrap_or(default_context);
    let context = merge_objects(base, fields.remove("context"));
    fields.insert("context".to_string(), context);

    let has_timestamp = fields.get("timestamp").is_some_and(|ts| !ts.is_null());
    if !has_timestamp {
        fields.insert("timestamp".to_string(), Value::String(timestamp.to_string()));
    }
    fields.insert("type".to_string(), Value::String(event_type.to_string()));

    let mut value = Value::Object(fields);
    prune(&mut value);
    value
}

/// Shallow merge; keys from `overlay` win. A non-object overlay replaces `base`.
fn merge_objects(base: &Value, overlay: Option<Value>) -> Value {
    match (base, overlay) {
        (_, None) => base.clone(),
        (Value::Object(base), Some(Value::Object(overlay))) => {
            let mut merged = base.clone();
            merged.extend(overlay);
            Value::Object(merged)
        }
        (_, Some(overlay)) if overlay.is_null() => base.clone(),
        (_, Some(overlay)) => overlay,
    }
}

fn prune(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for nested in map.values_mut() {
                prune(nested);
            }
            map.retain(|_, nested| !is_unset(nested));
        }
        Value::Array(items) => {
            for nested in items.iter_mut() {
                prune(nested);
            }
        }
        _ => {}
    }
}

fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Start/stop/error hooks around each delivery call.
//!
//! Failures are otherwise invisible to producers, so callers that need
//! stronger guarantees plug their own [`DeliveryObserver`] in here.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::delivery::DeliveryOutcome;

/// Whether a delivery carried a single event or a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    Single,
    Batch,
}

/// Metadata attached to every hook invocation.
#[derive(Debug, Clone)]
pub struct DeliveryEvent<'a> {
    pub kind: DeliveryKind,
    /// Request path relative to the API base URL.
    pub path: &'a str,
    pub event_count: usize,
    /// The normalized JSON body that was (or would have been) sent.
    pub payload: &'a Value,
}

pub trait DeliveryObserver: Send + Sync {
    fn on_start(&self, event: &DeliveryEvent<'_>);

    fn on_stop(&self, event: &DeliveryEvent<'_>, outcome: DeliveryOutcome, elapsed: Duration);

    /// Called before `on_stop` when the call ended in a failure.
    fn on_error(&self, event: &DeliveryEvent<'_>, error: &str);
}

/// Observer that reports through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl DeliveryObserver for TracingObserver {
    fn on_start(&self, event: &DeliveryEvent<'_>) {
        debug!(
            kind = ?event.kind,
            path = event.path,
            events = event.event_count,
            "Delivery started"
        );
    }

    fn on_stop(&self, event: &DeliveryEvent<'_>, outcome: DeliveryOutcome, elapsed: Duration) {
        debug!(
            kind = ?event.kind,
            path = event.path,
            events = event.event_count,
            outcome = ?outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            "Delivery finished"
        );
    }

    fn on_error(&self, event: &DeliveryEvent<'_>, error: &str) {
        debug!(
            kind = ?event.kind,
            path = event.path,
            events = event.event_count,
            "Delivery failed: {error}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_tracing_observer_reports_lifecycle() {
        let payload = json!({"batch": []});
        let event = DeliveryEvent {
            kind: DeliveryKind::Batch,
            path: "batch",
            event_count: 0,
            payload: &payload,
        };

        let observer = TracingObserver;
        observer.on_start(&event);
        observer.on_error(&event, "connection refused");
        observer.on_stop(&event, DeliveryOutcome::Failure, Duration::from_millis(12));

        assert!(logs_contain("Delivery failed: connection refused"));
        assert!(logs_contain("Delivery finished"));
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batched delivery of analytics events.
//!
//! Producers hand events to [`Analytics::enqueue`] and get control back
//! immediately. A single scheduler task groups them into batches of at most
//! `max_batch_size` events and posts one batch per tick to the ingestion
//! endpoint. When producers outpace delivery, closed batches wait in a
//! bounded [`OverflowQueue`] (in memory or SQLite) that evicts the oldest
//! batch once full.
//!
//! Delivery is best effort: transport errors are retried with a doubling
//! backoff, anything else is logged and the batch is dropped.
//!
//! ```rust,ignore
//! use analytics_batcher::{Analytics, BatcherConfig, Event};
//! use serde_json::json;
//!
//! let analytics = Analytics::start(BatcherConfig::from_env()?)?;
//! analytics.enqueue(Event::track("user-1", "Signed Up", json!({"plan": "pro"})))?;
//! analytics.shutdown().await?;
//! ```

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]

pub mod analytics;
pub mod batch;
pub mod config;
pub mod delivery;
pub mod error;
pub mod event;
pub mod http;
pub mod overflow;
pub mod retry;
pub mod scheduler;
pub mod telemetry;

pub use analytics::Analytics;
pub use batch::{BatchState, ClosedBatch, EnqueueOutcome, TickWork};
pub use config::{BatcherConfig, OverflowStorage};
pub use delivery::{BatchSender, DeliveryClient, DeliveryOutcome};
pub use error::{BatcherError, ConfigError, DeliveryError, EventError, StorageError};
pub use event::{Event, EventType};
pub use overflow::{MemoryBackend, OverflowQueue, SqliteBackend, StorageBackend};
pub use retry::RetryPolicy;
pub use scheduler::{SchedulerHandle, SchedulerService, SchedulerStatus};
pub use telemetry::{DeliveryEvent, DeliveryKind, DeliveryObserver, TracingObserver};

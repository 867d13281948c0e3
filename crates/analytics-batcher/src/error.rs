// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types surfaced by the batcher.
//!
//! Delivery failures never reach producers: they are logged by the delivery
//! client and collapsed into a two-valued outcome. The errors here cover
//! construction, configuration, storage and the actor channel.

use reqwest::StatusCode;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Errors raised when building an [`Event`](crate::event::Event) from raw input.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Event is not a JSON object")]
    NotAnObject,

    #[error("Event is missing the `type` field")]
    MissingType,

    #[error("Unknown event type: {0}")]
    UnknownType(String),

    #[error("Failed to parse event: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by an overflow queue storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to encode batch: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classified failure of a single delivery call.
///
/// Only [`DeliveryError::Transport`] is retried.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Payload rejected by endpoint (400): {0}")]
    PayloadRejected(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unexpected status {status}: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },

    #[error("Failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Top level error for the public entry points.
#[derive(Debug, thiserror::Error)]
pub enum BatcherError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Scheduler unavailable: {0}")]
    SchedulerUnavailable(String),
}

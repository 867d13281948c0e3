// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer-facing entry points.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::batch::BatchState;
use crate::config::{BatcherConfig, OverflowStorage};
use crate::delivery::{BatchSender, DeliveryClient, DeliveryOutcome};
use crate::error::BatcherError;
use crate::event::Event;
use crate::overflow::{MemoryBackend, OverflowQueue, SqliteBackend, StorageBackend};
use crate::scheduler::{SchedulerHandle, SchedulerService, SchedulerStatus};

/// A running batcher: the scheduler task plus the sender it delivers through.
///
/// Must be created inside a tokio runtime.
pub struct Analytics {
    handle: SchedulerHandle,
    sender: Arc<dyn BatchSender>,
    task: JoinHandle<()>,
}

impl Analytics {
    /// Starts a batcher that delivers over HTTP.
    pub fn start(config: BatcherConfig) -> Result<Self, BatcherError> {
        config.validate()?;
        let client = DeliveryClient::new(&config)?;
        Self::with_sender(config, Arc::new(client))
    }

    /// Starts a batcher that hands closed batches to `sender`.
    pub fn with_sender(
        config: BatcherConfig,
        sender: Arc<dyn BatchSender>,
    ) -> Result<Self, BatcherError> {
        let backend: Box<dyn StorageBackend> = match &config.overflow_storage {
            OverflowStorage::Memory => Box::new(MemoryBackend::default()),
            OverflowStorage::Sqlite(path) => Box::new(SqliteBackend::open(path)?),
        };
        let capacity = config.hard_limit_batches();
        let state = BatchState::new(
            config.max_batch_size,
            OverflowQueue::new(backend, capacity),
        );

        let (service, handle) =
            SchedulerService::new(state, Arc::clone(&sender), config.batch_interval());
        let task = tokio::spawn(service.run());

        info!(
            max_batch_size = config.max_batch_size,
            batch_every_ms = config.batch_every_ms,
            overflow_capacity = capacity,
            "Analytics batcher started"
        );

        Ok(Self {
            handle,
            sender,
            task,
        })
    }

    /// Accepts `event` into the pipeline. Returns before any delivery happens.
    pub fn enqueue(&self, event: Event) -> Result<(), BatcherError> {
        self.handle.enqueue(event)
    }

    /// Delivers everything buffered as one call and waits for it.
    ///
    /// Delivery failures are logged, not returned. The call can exceed the
    /// endpoint's payload limit when a large backlog is buffered.
    pub async fn flush(&self) -> Result<(), BatcherError> {
        self.handle.flush().await
    }

    /// Delivers `event` right away, outside the batching pipeline.
    pub async fn send_now(&self, event: Event) -> DeliveryOutcome {
        self.sender.send_event(event).await
    }

    pub async fn status(&self) -> Result<SchedulerStatus, BatcherError> {
        self.handle.status().await
    }

    /// A handle that can be cloned into other tasks.
    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Flushes, then stops the scheduler and waits for it to exit.
    pub async fn shutdown(self) -> Result<(), BatcherError> {
        self.handle.flush().await?;
        self.handle.shutdown()?;
        self.task.await.map_err(|e| {
            BatcherError::SchedulerUnavailable(format!("Scheduler task failed: {e}"))
        })?;
        debug!("Analytics batcher stopped");
        Ok(())
    }
}

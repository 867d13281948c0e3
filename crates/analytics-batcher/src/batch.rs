// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Two-tier batch state owned by the scheduler.
//!
//! Events accumulate in a single [`OpenBatch`]. Once it holds `max_batch_size`
//! events the next arrival closes it into a [`ClosedBatch`], which is pushed to
//! the [`OverflowQueue`], and starts a fresh open batch.
//!
//! Closed batches are always older than the open batch, so work is taken from
//! the overflow queue first. That keeps delivery FIFO across both tiers.
//!
//! ```text
//!   enqueue ──> [ open batch ] ──full──> [ overflow queue ] ──tick──> delivery
//!                     │                                                 ^
//!                     └──────────── tick (overflow empty) ──────────────┘
//! ```
//!
//! Everything here is synchronous. The scheduler actor serializes access.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::event::Event;
use crate::overflow::OverflowQueue;

/// Number of closed batches the overflow queue may hold for a given event budget.
#[must_use]
pub fn hard_limit_batches(events_hard_limit: usize, max_batch_size: usize) -> usize {
    events_hard_limit / max_batch_size.max(1) + 1
}

/// Ordered events that are still accepting arrivals.
#[derive(Debug, Clone)]
pub struct OpenBatch {
    events: Vec<Event>,
    max_size: usize,
}

impl OpenBatch {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        OpenBatch {
            events: Vec::with_capacity(max_size),
            max_size,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.events.len() >= self.max_size
    }

    fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Closes the batch, leaving an empty one with the same capacity behind.
    fn close(&mut self) -> ClosedBatch {
        let events = std::mem::replace(&mut self.events, Vec::with_capacity(self.max_size));
        ClosedBatch { events }
    }
}

/// An immutable, ordered batch waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClosedBatch {
    events: Vec<Event>,
}

impl ClosedBatch {
    #[must_use]
    pub fn new(events: Vec<Event>) -> Self {
        ClosedBatch { events }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    #[must_use]
    pub fn into_events(self) -> Vec<Event> {
        self.events
    }
}

/// What an enqueue did to the batch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The event was appended to the open batch.
    Appended,
    /// The open batch was full: it was closed into the overflow queue and the
    /// event started a new open batch. The scheduler should tick immediately.
    Rolled,
}

/// The unit of work selected by one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickWork {
    /// The oldest batch from the overflow queue.
    Overflow(ClosedBatch),
    /// The open batch, closed because the overflow queue was empty.
    Open(ClosedBatch),
    /// Nothing buffered.
    Idle,
}

/// The open batch plus the overflow queue of closed batches.
pub struct BatchState {
    open: OpenBatch,
    overflow: OverflowQueue,
    max_batch_size: usize,
}

impl BatchState {
    #[must_use]
    pub fn new(max_batch_size: usize, overflow: OverflowQueue) -> Self {
        BatchState {
            open: OpenBatch::new(max_batch_size),
            overflow,
            max_batch_size: max_batch_size.max(1),
        }
    }

    #[must_use]
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    #[must_use]
    pub fn overflow_size(&self) -> usize {
        self.overflow.size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.is_empty() && self.overflow.is_empty()
    }

    pub fn enqueue(&mut self, event: Event) -> EnqueueOutcome {
        if !self.open.is_full() {
            self.open.push(event);
            return EnqueueOutcome::Appended;
        }

        let closed = self.open.close();
        debug!(
            events = closed.len(),
            "Open batch full, moving it to the overflow queue"
        );
        self.overflow.enqueue(closed);
        self.open.push(event);
        EnqueueOutcome::Rolled
    }

    /// Picks the work for one tick: the oldest overflow batch, else the open batch.
    pub fn next_tick_work(&mut self) -> TickWork {
        if let Some(batch) = self.overflow.dequeue() {
            return TickWork::Overflow(batch);
        }
        if !self.open.is_empty() {
            return TickWork::Open(self.open.close());
        }
        TickWork::Idle
    }

    /// Empties both tiers, oldest overflow batch first and the open batch last.
    pub fn drain_all(&mut self) -> Vec<Event> {
        let pending = self.overflow.size();
        let mut events: Vec<Event> = self
            .overflow
            .dequeue_n(pending)
            .into_iter()
            .flat_map(ClosedBatch::into_events)
            .collect();
        events.extend(self.open.close().into_events());
        events
    }
}

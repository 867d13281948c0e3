// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Actor that owns the batch state and drives delivery.
//!
//! ```text
//!    ┌──────────────┐
//!    │   Handles    │ (any number of producers)
//!    └──────┬───────┘
//!           │ SchedulerCommand
//!           v
//!    ┌──────────────┐   one delivery    ┌──────────────┐
//!    │   Service    │ ────────────────> │ BatchSender  │
//!    │  (one task)  │ <──── outcome ─── │ (spawned)    │
//!    └──────┬───────┘                   └──────────────┘
//!           │ owns
//!           v
//!    ┌──────────────┐
//!    │  BatchState  │ + single timer deadline
//!    └──────────────┘
//! ```
//!
//! The service reacts to three things, strictly one at a time:
//!
//! - a command from a handle (`Enqueue`, `Flush`, `Status`, `Shutdown`),
//! - the timer deadline, which runs one tick,
//! - completion of the in-flight delivery, which re-arms the timer.
//!
//! Commands already queued are handled before a due tick, so a short burst
//! of enqueues is applied in full before the next batch is chosen. After
//! [`MAX_COMMAND_BURST`] commands in a row a due tick goes first, so a
//! channel that never drains cannot hold delivery back.
//!
//! The timer is a single `Option<Instant>`. Arming it overwrites whatever
//! was there, so at most one wake-up is ever pending. No tick runs while a
//! delivery is in flight, which keeps batches reaching the endpoint in the
//! order they were closed.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, warn};

use crate::batch::{BatchState, ClosedBatch, EnqueueOutcome, TickWork};
use crate::delivery::{BatchSender, DeliveryOutcome};
use crate::error::BatcherError;
use crate::event::Event;

/// Commands sent from [`SchedulerHandle`]s to the service.
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Hand an event over to the scheduler.
    Enqueue(Event),

    /// Deliver everything buffered as one call and reply once it finished.
    Flush(oneshot::Sender<()>),

    /// Report the current state.
    Status(oneshot::Sender<SchedulerStatus>),

    /// Stop the service after the in-flight delivery resolves.
    Shutdown,
}

/// Snapshot of the scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStatus {
    /// Events in the open batch.
    pub open_count: usize,
    /// Closed batches waiting in the overflow queue.
    pub overflow_batches: usize,
    pub timer_armed: bool,
    pub delivery_in_flight: bool,
}

/// Cloneable handle for talking to a running [`SchedulerService`].
#[derive(Clone, Debug)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Hands `event` to the scheduler without waiting for it.
    pub fn enqueue(&self, event: Event) -> Result<(), BatcherError> {
        self.tx
            .send(SchedulerCommand::Enqueue(event))
            .map_err(|e| BatcherError::SchedulerUnavailable(format!("Failed to enqueue event: {e}")))
    }

    /// Waits until everything buffered at the time of the call has been
    /// handed to the sender and the sender returned.
    pub async fn flush(&self) -> Result<(), BatcherError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Flush(response_tx))
            .map_err(|e| {
                BatcherError::SchedulerUnavailable(format!("Failed to send flush command: {e}"))
            })?;

        response_rx.await.map_err(|e| {
            BatcherError::SchedulerUnavailable(format!("Failed to receive flush response: {e}"))
        })
    }

    pub async fn status(&self) -> Result<SchedulerStatus, BatcherError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Status(response_tx))
            .map_err(|e| {
                BatcherError::SchedulerUnavailable(format!("Failed to send status command: {e}"))
            })?;

        response_rx.await.map_err(|e| {
            BatcherError::SchedulerUnavailable(format!("Failed to receive status response: {e}"))
        })
    }

    /// Stops the service. Buffered events are not delivered; flush first.
    pub fn shutdown(&self) -> Result<(), BatcherError> {
        self.tx.send(SchedulerCommand::Shutdown).map_err(|e| {
            BatcherError::SchedulerUnavailable(format!("Failed to send shutdown command: {e}"))
        })
    }
}

/// Consecutive commands handled before a due tick takes precedence.
pub const MAX_COMMAND_BURST: usize = 128;

struct InFlight {
    task: JoinHandle<DeliveryOutcome>,
    event_count: usize,
    /// Delay to re-arm with once the delivery resolves, unless overflow is pending.
    next_delay: Duration,
}

pub struct SchedulerService {
    state: BatchState,
    sender: Arc<dyn BatchSender>,
    batch_interval: Duration,
    timer: Option<Instant>,
    in_flight: Option<InFlight>,
    /// Commands handled since the last tick.
    burst: usize,
    rx: mpsc::UnboundedReceiver<SchedulerCommand>,
}

impl SchedulerService {
    /// Creates the service with its first tick due immediately.
    ///
    /// Returns the service, to be spawned, and a handle to talk to it.
    #[must_use]
    pub fn new(
        state: BatchState,
        sender: Arc<dyn BatchSender>,
        batch_interval: Duration,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            state,
            sender,
            batch_interval,
            timer: Some(Instant::now()),
            in_flight: None,
            burst: 0,
            rx,
        };
        (service, SchedulerHandle { tx })
    }

    /// Processes commands, ticks and delivery completions until shutdown or
    /// until every handle is dropped.
    pub async fn run(mut self) {
        debug!("Batch scheduler started");

        loop {
            tokio::select! {
                biased;

                result = join_delivery(&mut self.in_flight), if self.in_flight.is_some() => {
                    self.finish_delivery(result);
                }
                () = sleep_until_deadline(self.timer),
                    if self.in_flight.is_none() && self.burst >= MAX_COMMAND_BURST =>
                {
                    self.tick();
                }
                command = self.rx.recv() => {
                    self.burst = self.burst.saturating_add(1);
                    match command {
                        Some(SchedulerCommand::Enqueue(event)) => self.enqueue(event),
                        Some(SchedulerCommand::Flush(response_tx)) => {
                            self.flush().await;
                            if response_tx.send(()).is_err() {
                                error!("Failed to send flush response - receiver dropped");
                            }
                        }
                        Some(SchedulerCommand::Status(response_tx)) => {
                            if response_tx.send(self.status()).is_err() {
                                error!("Failed to send status response - receiver dropped");
                            }
                        }
                        Some(SchedulerCommand::Shutdown) | None => break,
                    }
                }
                () = sleep_until_deadline(self.timer), if self.in_flight.is_none() => {
                    self.tick();
                }
            }
        }

        if let Some(in_flight) = self.in_flight.take() {
            debug!("Waiting for in-flight delivery before shutting down");
            let count = in_flight.event_count;
            log_outcome(in_flight.task.await, count);
        }
        debug!(
            open = self.state.open_count(),
            overflow_batches = self.state.overflow_size(),
            "Batch scheduler shutting down"
        );
    }

    fn enqueue(&mut self, event: Event) {
        if self.state.enqueue(event) == EnqueueOutcome::Rolled {
            self.arm_timer(Duration::ZERO);
        }
    }

    fn tick(&mut self) {
        self.timer = None;
        self.burst = 0;
        match self.state.next_tick_work() {
            TickWork::Overflow(batch) => self.dispatch(batch, Duration::ZERO),
            TickWork::Open(batch) => self.dispatch(batch, self.batch_interval),
            TickWork::Idle => self.arm_timer(self.batch_interval),
        }
    }

    fn dispatch(&mut self, batch: ClosedBatch, next_delay: Duration) {
        let sender = Arc::clone(&self.sender);
        let event_count = batch.len();
        debug!(events = event_count, "Dispatching batch");

        let task = tokio::spawn(async move { sender.send_batch(batch.into_events()).await });
        self.in_flight = Some(InFlight {
            task,
            event_count,
            next_delay,
        });
    }

    fn finish_delivery(&mut self, result: Result<DeliveryOutcome, JoinError>) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        log_outcome(result, in_flight.event_count);

        let delay = if self.state.overflow_size() > 0 {
            Duration::ZERO
        } else {
            in_flight.next_delay
        };
        self.arm_timer(delay);
    }

    async fn flush(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            let count = in_flight.event_count;
            log_outcome(in_flight.task.await, count);
        }

        let events = self.state.drain_all();
        if events.is_empty() {
            debug!("Flush requested with nothing buffered");
        } else {
            let count = events.len();
            debug!(events = count, "Flushing all buffered events");
            log_outcome(Ok(self.sender.send_batch(events).await), count);
        }

        self.arm_timer(self.batch_interval);
    }

    fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            open_count: self.state.open_count(),
            overflow_batches: self.state.overflow_size(),
            timer_armed: self.timer.is_some(),
            delivery_in_flight: self.in_flight.is_some(),
        }
    }

    /// Replaces the pending wake-up, if any, with one `delay` from now.
    fn arm_timer(&mut self, delay: Duration) {
        self.timer = Some(Instant::now() + delay);
    }
}

fn log_outcome(result: Result<DeliveryOutcome, JoinError>, event_count: usize) {
    match result {
        Ok(DeliveryOutcome::Success) => debug!(events = event_count, "Batch delivered"),
        Ok(DeliveryOutcome::Failure) => {
            warn!("Dropping batch of {event_count} events after failed delivery");
        }
        Err(e) => error!("Delivery task for {event_count} events panicked or was cancelled: {e}"),
    }
}

async fn join_delivery(in_flight: &mut Option<InFlight>) -> Result<DeliveryOutcome, JoinError> {
    match in_flight {
        Some(in_flight) => (&mut in_flight.task).await,
        None => pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::overflow::OverflowQueue;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::sleep;
    use tracing_test::traced_test;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn event(name: &str) -> Event {
        Event::track("user-1", name, json!({}))
    }

    fn names(prefix: &str, range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|i| format!("{prefix}{i}")).collect()
    }

    #[derive(Default)]
    struct RecordingSender {
        batches: Mutex<Vec<Vec<String>>>,
        delay: Duration,
        fail: bool,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl RecordingSender {
        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn batches(&self) -> Vec<Vec<String>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchSender for RecordingSender {
        async fn send_batch(&self, events: Vec<Event>) -> DeliveryOutcome {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            let names = events
                .iter()
                .map(|e| e.get("event").unwrap().as_str().unwrap().to_string())
                .collect();
            self.batches.lock().unwrap().push(names);
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                DeliveryOutcome::Failure
            } else {
                DeliveryOutcome::Success
            }
        }
    }

    fn spawn_scheduler(
        max_batch_size: usize,
        batch_interval: Duration,
        sender: Arc<RecordingSender>,
    ) -> SchedulerHandle {
        let state = BatchState::new(max_batch_size, OverflowQueue::in_memory(100));
        let (service, handle) = SchedulerService::new(state, sender, batch_interval);
        tokio::spawn(service.run());
        handle
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_is_delivered_on_immediate_tick() {
        let sender = Arc::new(RecordingSender::default());
        let handle = spawn_scheduler(2, ms(2_000), sender.clone());

        for name in ["E1", "E2", "E3"] {
            handle.enqueue(event(name)).unwrap();
        }
        sleep(ms(1)).await;

        let batches = sender.batches();
        assert_eq!(batches[0], vec!["E1", "E2"]);
        // Overflow drained, so the open batch follows on the next zero-delay tick.
        assert_eq!(batches[1], vec!["E3"]);
        assert_eq!(batches.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_batch_is_delivered_after_interval() {
        let sender = Arc::new(RecordingSender::default());
        let handle = spawn_scheduler(100, ms(2_000), sender.clone());

        // Let the initial tick run on empty state.
        sleep(ms(1)).await;
        for i in 1..=5 {
            handle.enqueue(event(&format!("E{i}"))).unwrap();
        }

        sleep(ms(1_900)).await;
        assert!(sender.batches().is_empty());

        sleep(ms(200)).await;
        assert_eq!(sender.batches(), vec![names("E", 1..6)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_concatenates_overflow_and_open_batch() {
        let sender = Arc::new(RecordingSender::default());
        let handle = spawn_scheduler(2, ms(2_000), sender.clone());

        // [E1, E2] and [E3, E4] close into the overflow queue, E5 stays open.
        for i in 1..=5 {
            handle.enqueue(event(&format!("E{i}"))).unwrap();
        }
        handle.flush().await.unwrap();

        assert_eq!(sender.batches(), vec![names("E", 1..6)]);
        let status = handle.status().await.unwrap();
        assert_eq!(status.open_count, 0);
        assert_eq!(status.overflow_batches, 0);
        assert!(status.timer_armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_empty_state_sends_nothing() {
        let sender = Arc::new(RecordingSender::default());
        let handle = spawn_scheduler(10, ms(2_000), sender.clone());

        handle.flush().await.unwrap();
        handle.flush().await.unwrap();

        assert!(sender.batches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_drains_in_order_one_delivery_at_a_time() {
        let sender = Arc::new(RecordingSender::slow(ms(10)));
        let handle = spawn_scheduler(2, ms(2_000), sender.clone());

        for i in 0..10 {
            handle.enqueue(event(&format!("e{i}"))).unwrap();
        }
        sleep(ms(200)).await;

        let batches = sender.batches();
        assert_eq!(batches.len(), 5);
        assert!(batches.iter().all(|batch| batch.len() <= 2));
        assert_eq!(batches.concat(), names("e", 0..10));
        assert_eq!(sender.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_tracks_in_flight_delivery_and_timer() {
        let sender = Arc::new(RecordingSender::slow(ms(100)));
        let handle = spawn_scheduler(10, ms(2_000), sender.clone());

        handle.enqueue(event("E1")).unwrap();
        sleep(ms(1)).await;

        let status = handle.status().await.unwrap();
        assert!(status.delivery_in_flight);
        assert!(!status.timer_armed);
        assert_eq!(status.open_count, 0);

        sleep(ms(200)).await;
        let status = handle.status().await.unwrap();
        assert!(!status.delivery_in_flight);
        assert!(status.timer_armed);
        assert_eq!(sender.batches(), vec![vec!["E1".to_string()]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_waits_for_in_flight_delivery() {
        let sender = Arc::new(RecordingSender::slow(ms(100)));
        let handle = spawn_scheduler(10, ms(2_000), sender.clone());

        handle.enqueue(event("E1")).unwrap();
        sleep(ms(1)).await;
        handle.enqueue(event("E2")).unwrap();
        handle.flush().await.unwrap();

        assert_eq!(
            sender.batches(),
            vec![vec!["E1".to_string()], vec!["E2".to_string()]]
        );
        assert_eq!(sender.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_failed_delivery_is_dropped_and_ticking_continues() {
        let sender = Arc::new(RecordingSender::failing());
        let handle = spawn_scheduler(10, ms(2_000), sender.clone());

        handle.enqueue(event("E1")).unwrap();
        sleep(ms(1)).await;
        handle.enqueue(event("E2")).unwrap();
        sleep(ms(2_100)).await;

        assert_eq!(
            sender.batches(),
            vec![vec!["E1".to_string()], vec!["E2".to_string()]]
        );
        let status = handle.status().await.unwrap();
        assert_eq!(status.open_count, 0);
        assert!(logs_contain("Dropping batch of 1 events after failed delivery"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_timer_after_mixed_operations() {
        let sender = Arc::new(RecordingSender::default());
        let handle = spawn_scheduler(2, ms(2_000), sender.clone());

        for i in 0..7 {
            handle.enqueue(event(&format!("e{i}"))).unwrap();
        }
        handle.flush().await.unwrap();
        handle.enqueue(event("late")).unwrap();
        sleep(ms(2_100)).await;

        // Each buffered event went out exactly once despite the rolls, the
        // flush and the periodic tick all arming the timer.
        let mut expected = names("e", 0..7);
        expected.push("late".to_string());
        assert_eq!(sender.batches().concat(), expected);

        let status = handle.status().await.unwrap();
        assert!(status.timer_armed);
        assert!(!status.delivery_in_flight);
    }

    #[tokio::test]
    async fn test_handle_errors_after_shutdown() {
        let sender = Arc::new(RecordingSender::default());
        let handle = spawn_scheduler(10, ms(2_000), sender);

        handle.shutdown().unwrap();
        sleep(ms(10)).await;

        assert!(matches!(
            handle.enqueue(event("E1")),
            Err(BatcherError::SchedulerUnavailable(_))
        ));
        assert!(handle.flush().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ticks_keep_firing_under_sustained_producers() {
        const PER_PRODUCER_LIMIT: usize = 100_000;
        let sender = Arc::new(RecordingSender::default());
        let handle = spawn_scheduler(10, ms(20), sender.clone());

        // Each producer enqueues without pause until deliveries are observed,
        // giving up only at the limit.
        let producers: Vec<_> = (0..4)
            .map(|producer| {
                let handle = handle.clone();
                let sender = Arc::clone(&sender);
                tokio::task::spawn_blocking(move || {
                    let mut seq = 0;
                    while seq < PER_PRODUCER_LIMIT {
                        if seq % 64 == 0 && sender.batches.lock().unwrap().len() >= 3 {
                            break;
                        }
                        handle.enqueue(event(&format!("p{producer}-{seq}"))).unwrap();
                        seq += 1;
                    }
                    seq
                })
            })
            .collect();

        for producer in producers {
            let produced = producer.await.unwrap();
            assert!(
                produced < PER_PRODUCER_LIMIT,
                "no delivery happened while producers kept the channel busy"
            );
        }
        assert!(sender.batches().len() >= 3);
        handle.flush().await.unwrap();

        // Only the final flush may exceed the batch size.
        let batches = sender.batches();
        let (_, ticked) = batches.split_last().unwrap();
        assert!(ticked.iter().all(|batch| batch.len() <= 10));

        // Evictions may drop events, but each producer's survivors arrive in order.
        let mut last_seen: HashMap<String, usize> = HashMap::new();
        for name in batches.concat() {
            let (producer, seq) = name.split_once('-').unwrap();
            let seq: usize = seq.parse().unwrap();
            if let Some(previous) = last_seen.insert(producer.to_string(), seq) {
                assert!(seq > previous, "{producer} delivered {seq} after {previous}");
            }
        }
        assert_eq!(sender.max_active.load(Ordering::SeqCst), 1);

        let status = handle.status().await.unwrap();
        assert_eq!(status.open_count, 0);
        assert_eq!(status.overflow_batches, 0);
        assert!(status.timer_armed);
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO of closed batches awaiting delivery.
//!
//! The queue is bounded in batches, not events. When it is full the oldest
//! batch is evicted and dropped so memory (or disk) use stays bounded while the
//! endpoint is slow or unreachable.
//!
//! Storage is pluggable:
//! - [`MemoryBackend`]: a `VecDeque`, lost on restart.
//! - [`SqliteBackend`]: one row per batch in a SQLite file. Batches left over
//!   from a previous run are picked up on open and delivered first.

use std::collections::VecDeque;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, info, warn};

use crate::batch::ClosedBatch;
use crate::error::StorageError;

/// Storage for the overflow queue. Implementations must be FIFO.
pub trait StorageBackend: Send {
    fn push(&mut self, batch: ClosedBatch) -> Result<(), StorageError>;

    /// Removes and returns the oldest batch.
    ///
    /// A batch that cannot be decoded is still removed before the error is returned.
    fn pop(&mut self) -> Result<Option<ClosedBatch>, StorageError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    batches: VecDeque<ClosedBatch>,
}

impl StorageBackend for MemoryBackend {
    fn push(&mut self, batch: ClosedBatch) -> Result<(), StorageError> {
        self.batches.push_back(batch);
        Ok(())
    }

    fn pop(&mut self) -> Result<Option<ClosedBatch>, StorageError> {
        Ok(self.batches.pop_front())
    }

    fn len(&self) -> usize {
        self.batches.len()
    }
}

/// Disk-backed storage in a single SQLite table.
pub struct SqliteBackend {
    conn: Connection,
    len: usize,
}

impl SqliteBackend {
    /// Opens (or creates) the queue file, recovering any batches already in it.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        let backend = Self::init(conn)?;
        if backend.len > 0 {
            info!(
                batches = backend.len,
                path = %path.display(),
                "Recovered overflow batches from disk"
            );
        }
        Ok(backend)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS overflow_batches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                events TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM overflow_batches", [], |row| row.get(0))?;

        Ok(Self {
            conn,
            len: usize::try_from(count).unwrap_or(0),
        })
    }
}

impl StorageBackend for SqliteBackend {
    fn push(&mut self, batch: ClosedBatch) -> Result<(), StorageError> {
        let events = serde_json::to_string(&batch)?;
        self.conn.execute(
            "INSERT INTO overflow_batches (events, created_at) VALUES (?1, ?2)",
            params![
                events,
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
            ],
        )?;
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<Option<ClosedBatch>, StorageError> {
        let tx = self.conn.transaction()?;
        let row: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, events FROM overflow_batches ORDER BY id LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((id, events)) = row else {
            return Ok(None);
        };
        tx.execute("DELETE FROM overflow_batches WHERE id = ?1", params![id])?;
        tx.commit()?;
        self.len = self.len.saturating_sub(1);

        Ok(Some(serde_json::from_str(&events)?))
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// FIFO of closed batches with a fixed capacity and oldest-evict policy.
pub struct OverflowQueue {
    backend: Box<dyn StorageBackend>,
    capacity: usize,
}

impl OverflowQueue {
    #[must_use]
    pub fn new(backend: Box<dyn StorageBackend>, capacity_in_batches: usize) -> Self {
        OverflowQueue {
            backend,
            capacity: capacity_in_batches.max(1),
        }
    }

    #[must_use]
    pub fn in_memory(capacity_in_batches: usize) -> Self {
        Self::new(Box::new(MemoryBackend::default()), capacity_in_batches)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.backend.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backend.is_empty()
    }

    /// Appends a batch, evicting the oldest ones while the queue is at capacity.
    ///
    /// If the storage cannot evict, the incoming batch is dropped so the queue
    /// never grows past its capacity. Returns the number of events dropped.
    pub fn enqueue(&mut self, batch: ClosedBatch) -> usize {
        let mut dropped = 0;
        while self.backend.len() >= self.capacity {
            match self.backend.pop() {
                Ok(Some(evicted)) => {
                    warn!(
                        "Overflow queue full ({} batches), dropping oldest batch of {} events",
                        self.capacity,
                        evicted.len()
                    );
                    dropped += evicted.len();
                }
                Ok(None) => break,
                Err(StorageError::Encoding(e)) => {
                    warn!("Overflow queue full, dropped an unreadable batch: {e}");
                }
                Err(e) => {
                    error!(
                        "Failed to evict from full overflow queue, dropping incoming batch of {} events: {e}",
                        batch.len()
                    );
                    return dropped + batch.len();
                }
            }
        }

        let count = batch.len();
        if let Err(e) = self.backend.push(batch) {
            error!("Failed to store batch of {count} events in overflow queue, dropping it: {e}");
            return dropped + count;
        }
        debug!(
            size = self.backend.len(),
            capacity = self.capacity,
            "Batch added to overflow queue"
        );
        dropped
    }

    /// Removes the oldest batch. Batches that fail to decode are logged and skipped.
    pub fn dequeue(&mut self) -> Option<ClosedBatch> {
        loop {
            match self.backend.pop() {
                Ok(batch) => return batch,
                Err(StorageError::Encoding(e)) => {
                    error!("Failed to decode batch from overflow queue, skipping it: {e}");
                }
                Err(e) => {
                    error!("Failed to read from overflow queue: {e}");
                    return None;
                }
            }
        }
    }

    /// Removes up to `n` batches, oldest first.
    pub fn dequeue_n(&mut self, n: usize) -> Vec<ClosedBatch> {
        let mut batches = Vec::with_capacity(n.min(self.size()));
        while batches.len() < n {
            match self.dequeue() {
                Some(batch) => batches.push(batch),
                None => break,
            }
        }
        batches
    }
}

//! Bounded admission queue between the scanner and the workers.
//!
//! The queue does not carry task data (the task store does). It carries
//! *tickets*: wake-ups for workers, one per claimable row at most. Its
//! capacity `K` is also the admission bound the scanner enforces on pending
//! rows:
//!
//! - The scanner inserts a task only while fewer than `K` rows are pending,
//!   then publishes a ticket with [`TaskQueue::try_reserve`].
//! - A worker [`take`](TaskQueue::take)s a ticket before calling
//!   `claim_next`; a ticket whose claim finds nothing is dropped. A
//!   successful claim calls [`TaskQueue::notify_room`] so a waiting scanner
//!   rechecks at once.
//! - [`TaskQueue::refill`] issues tickets for claimable rows that have none
//!   (retries whose backoff elapsed, recovered rows, stuck requeues).
//!
//! Rows held back by backoff or the same-hash gate have no ticket but still
//! count as pending, so pending plus processing rows never exceed `K` plus
//! the number of workers.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::storage::{StoreError, TaskStore};

use super::task::TaskId;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The receiving side is gone; the pool has shut down.
    #[error("Task queue is closed")]
    Closed,

    #[error("Task store error during refill: {0}")]
    Store(#[from] StoreError),
}

/// Admission ticket for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    /// Task the ticket was issued for, if known. Workers still claim by
    /// priority, so this is informational.
    pub task_id: Option<TaskId>,
}

/// A reserved queue slot. Dropping it without [`admit`](Permit::admit)
/// returns the slot.
pub struct Permit<'a> {
    inner: mpsc::Permit<'a, Ticket>,
}

impl Permit<'_> {
    /// Publishes the ticket for an inserted task.
    pub fn admit(self, task_id: TaskId) {
        self.inner.send(Ticket {
            task_id: Some(task_id),
        });
    }
}

/// Bounded ticket queue.
pub struct TaskQueue {
    tx: mpsc::Sender<Ticket>,
    rx: Mutex<mpsc::Receiver<Ticket>>,
    room: Notify,
}

impl TaskQueue {
    /// Creates a queue admitting at most `capacity` unclaimed tasks.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            room: Notify::new(),
        }
    }

    /// Reserves a slot without waiting.
    pub fn try_reserve(&self) -> Option<Permit<'_>> {
        self.tx.try_reserve().ok().map(|inner| Permit { inner })
    }

    /// Waits up to `wait` for a ticket.
    pub async fn take(&self, wait: Duration) -> Option<Ticket> {
        let recv = async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        };
        tokio::time::timeout(wait, recv).await.ok().flatten()
    }

    /// Signals that a pending row was claimed. At most one wake-up is
    /// stored when nobody waits.
    pub fn notify_room(&self) {
        self.room.notify_one();
    }

    /// Waits up to `wait` for [`notify_room`](Self::notify_room).
    pub async fn wait_for_room(&self, wait: Duration) {
        let _ = tokio::time::timeout(wait, self.room.notified()).await;
    }

    /// Tickets outstanding (issued or reserved, not yet taken).
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn is_full(&self) -> bool {
        self.tx.capacity() == 0
    }

    /// Issues tickets for claimable rows that have none, up to the free
    /// capacity. Returns the number of tickets issued.
    pub async fn refill(&self, store: &TaskStore) -> Result<usize, QueueError> {
        let claimable = store.claimable_count().await? as usize;
        let missing = claimable.saturating_sub(self.depth());

        let mut issued = 0;
        for _ in 0..missing {
            match self.tx.try_send(Ticket { task_id: None }) {
                Ok(()) => issued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => break,
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(QueueError::Closed),
            }
        }

        if issued > 0 {
            tracing::debug!(issued, depth = self.depth(), "Queue refilled");
        }
        Ok(issued)
    }
}

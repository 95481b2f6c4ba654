//! Work queue of pending transaction indices and the block completion signal.

use crate::error::{Result, SchedulerError};
use crate::types::TxnIndex;
use crossbeam::channel::{self, select, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Bounded MPMC queue of transaction indices.
///
/// Capacity is the block length: the release protocol keeps at most one
/// outstanding entry per index, so a full queue is a bookkeeping bug.
pub struct WorkQueue {
    capacity: usize,
    tx: Sender<TxnIndex>,
    rx: Receiver<TxnIndex>,
    /// Dropping the sender wakes every blocked `dequeue`.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = channel::bounded(capacity);
        let (shutdown_tx, shutdown_rx) = channel::bounded(0);
        Self {
            capacity,
            tx,
            rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        }
    }

    /// Pushes an index. Enqueueing into a closed queue is a no-op.
    pub fn enqueue(&self, index: TxnIndex) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        match self.tx.try_send(index) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SchedulerError::QueueOverflow {
                index,
                capacity: self.capacity,
            }),
            // The receiver lives as long as the queue.
            Err(TrySendError::Disconnected(_)) => Ok(()),
        }
    }

    /// Blocks until an index is available. Returns `None` once closed.
    pub fn dequeue(&self) -> Option<TxnIndex> {
        if self.is_closed() {
            return None;
        }
        select! {
            recv(self.rx) -> index => index.ok(),
            recv(self.shutdown_rx) -> _ => None,
        }
    }

    /// Pops an index without blocking.
    pub fn try_dequeue(&self) -> Option<TxnIndex> {
        self.rx.try_recv().ok()
    }

    /// Closes the queue and wakes all waiting workers.
    pub fn close(&self) {
        self.shutdown_tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown_tx.lock().is_none()
    }

    /// Number of queued indices.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Creates a one-shot completion signal and its waiter.
pub fn completion() -> (CompletionSignal, CompletionWaiter) {
    let (tx, rx) = channel::bounded(1);
    (
        CompletionSignal {
            tx,
            fired: AtomicBool::new(false),
        },
        CompletionWaiter { rx },
    )
}

/// Fires once when the block is fully merged, or aborted.
pub struct CompletionSignal {
    tx: Sender<Result<()>>,
    fired: AtomicBool,
}

impl CompletionSignal {
    /// Fires the signal. Returns false if it had already fired.
    pub fn fire(&self, outcome: Result<()>) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Capacity 1 and a single send; this cannot be full.
        let _ = self.tx.try_send(outcome);
        true
    }
}

/// Waits for the completion signal.
pub struct CompletionWaiter {
    rx: Receiver<Result<()>>,
}

impl CompletionWaiter {
    pub fn wait(self) -> Result<()> {
        self.rx.recv().unwrap_or_else(|_| {
            Err(SchedulerError::InvariantViolation(
                "completion signal dropped before firing".to_string(),
            ))
        })
    }
}

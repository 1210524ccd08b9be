//! Fan-in of inbound value updates to every processor queue

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error};

use publisher_core::ValueUpdate;

/// Minimum spacing between "queue full" log lines
pub const FULL_QUEUE_LOG_FREQUENCY: Duration = Duration::from_secs(10);

/// Pushes each update into every registered processor queue without ever
/// blocking the caller. Cheap to clone, clones share counters.
#[derive(Clone)]
pub struct UpdateDispatcher {
    queues: Arc<Vec<mpsc::Sender<ValueUpdate>>>,
    last_drop_log: Arc<Mutex<Option<Instant>>>,
    drop_logs: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    dispatched: Arc<AtomicU64>,
    /// Updates handed to this clone; see [`UpdateDispatcher::for_source`]
    received: Arc<AtomicU64>,
}

impl UpdateDispatcher {
    pub fn new(queues: Vec<mpsc::Sender<ValueUpdate>>) -> Self {
        Self {
            queues: Arc::new(queues),
            last_drop_log: Arc::new(Mutex::new(None)),
            drop_logs: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            dispatched: Arc::new(AtomicU64::new(0)),
            received: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A clone sharing the queues and totals but counting its own updates,
    /// one per ingest source
    pub fn for_source(&self) -> Self {
        Self {
            received: Arc::new(AtomicU64::new(0)),
            ..self.clone()
        }
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Returns the number of queues that accepted the update
    pub fn dispatch(&self, update: ValueUpdate) -> usize {
        self.received.fetch_add(1, Ordering::Relaxed);
        let mut accepted = 0;

        for queue in self.queues.iter() {
            match queue.try_send(update.clone()) {
                Ok(()) => accepted += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    self.log_drop();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Processor queue closed, dropping update for {}", update.asset);
                }
            }
        }

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        accepted
    }

    fn log_drop(&self) {
        let mut last = self.last_drop_log.lock();
        let due = last.map_or(true, |at| at.elapsed() >= FULL_QUEUE_LOG_FREQUENCY);
        if due {
            error!("Dropped incoming price update - too many updates");
            self.drop_logs.fetch_add(1, Ordering::Relaxed);
            *last = Some(Instant::now());
        }
    }

    /// Updates dropped because a processor queue was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// "Queue full" lines actually logged, at most one per window
    pub fn drop_log_count(&self) -> u64 {
        self.drop_logs.load(Ordering::Relaxed)
    }

    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Updates waiting in each processor queue, in queue order
    pub fn queue_depths(&self) -> Vec<usize> {
        self.queues
            .iter()
            .map(|queue| queue.max_capacity() - queue.capacity())
            .collect()
    }
}

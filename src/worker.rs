// Worker pool - queue consumers feeding the reconciler
//
// Each worker dequeues one item at a time. Outcome per item:
//   success               -> ack
//   permanent failure     -> reject (parked with its reason)
//   transient failure     -> release for redelivery, until max_deliveries
//   cancelled             -> release, worker stops

use anyhow::Context;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::queue::{QueuedItem, SqliteQueue};
use crate::reconciliation::Reconciler;
use crate::repository::sleep_cancellable;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    pub count: usize,
    pub lease: Duration,
    pub idle_poll: Duration,

    /// Stop once the queue is empty instead of polling
    pub drain: bool,

    /// Deliveries after which a transiently failing item is rejected
    pub max_deliveries: u32,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            count: 4,
            lease: Duration::from_secs(300),
            idle_poll: Duration::from_millis(250),
            drain: false,
            max_deliveries: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub processed: usize,
    pub rejected: usize,
    pub released: usize,
}

#[derive(Default)]
struct Counters {
    processed: AtomicUsize,
    rejected: AtomicUsize,
    released: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

pub struct WorkerPool {
    queue: Arc<SqliteQueue>,
    reconciler: Arc<Reconciler>,
    options: WorkerOptions,
}

impl WorkerPool {
    pub fn new(queue: Arc<SqliteQueue>, reconciler: Arc<Reconciler>, options: WorkerOptions) -> Self {
        WorkerPool {
            queue,
            reconciler,
            options,
        }
    }

    /// Run the workers until `cancel` fires or, in drain mode, the queue is empty
    pub fn run(&self, cancel: &CancellationToken) -> anyhow::Result<WorkerStats> {
        let counters = Counters::default();
        let cancel = cancel.child_token();
        let count = self.options.count.max(1);

        info!(workers = count, drain = self.options.drain, "starting worker pool");

        thread::scope(|scope| -> anyhow::Result<()> {
            let mut handles = Vec::with_capacity(count);
            for index in 0..count {
                let counters = &counters;
                let cancel = &cancel;
                let spawned = thread::Builder::new()
                    .name(format!("registry-worker-{}", index))
                    .spawn_scoped(scope, move || self.worker_loop(index, counters, cancel));

                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        cancel.cancel();
                        return Err(err).context("failed to spawn worker thread");
                    }
                }
            }

            for handle in handles {
                if handle.join().is_err() {
                    anyhow::bail!("worker thread panicked");
                }
            }
            Ok(())
        })?;

        let stats = counters.snapshot();
        info!(
            processed = stats.processed,
            rejected = stats.rejected,
            released = stats.released,
            "worker pool stopped"
        );
        Ok(stats)
    }

    fn worker_loop(&self, index: usize, counters: &Counters, cancel: &CancellationToken) {
        debug!(worker = index, "worker started");

        while !cancel.is_cancelled() {
            match self.queue.dequeue(self.options.lease) {
                Ok(Some(queued)) => self.handle(index, queued, counters, cancel),
                Ok(None) if self.options.drain => break,
                Ok(None) => {
                    sleep_cancellable(self.options.idle_poll, cancel).ok();
                }
                Err(err) => {
                    warn!(worker = index, error = %err, "dequeue failed");
                    sleep_cancellable(self.options.idle_poll, cancel).ok();
                }
            }
        }

        debug!(worker = index, "worker stopped");
    }

    fn handle(&self, index: usize, queued: QueuedItem, counters: &Counters, cancel: &CancellationToken) {
        let id = queued.id.as_str();

        let outcome = match self.reconciler.process(&queued.item, cancel) {
            Ok(report) => {
                debug!(worker = index, id, summary = %report.summary(), "item processed");
                counters.processed.fetch_add(1, Ordering::Relaxed);
                self.queue.ack(id)
            }
            Err(err) if err.is_permanent() => {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                self.queue.reject(id, &err.to_string())
            }
            Err(SyncError::Cancelled) => self.queue.release(id),
            Err(err) if queued.attempts >= self.options.max_deliveries => {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                let reason = format!("gave up after {} deliveries: {}", queued.attempts, err);
                self.queue.reject(id, &reason)
            }
            Err(err) => {
                warn!(worker = index, id, attempts = queued.attempts, error = %err, "item failed, releasing");
                counters.released.fetch_add(1, Ordering::Relaxed);
                self.queue.release(id)
            }
        };

        if let Err(err) = outcome {
            warn!(worker = index, id, error = %err, "failed to settle queue item");
        }
    }
}

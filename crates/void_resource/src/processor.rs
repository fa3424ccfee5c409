//! Async Processor - Background worker pipeline
//!
//! Operations go into a FIFO served by one or more named worker threads.
//! Each worker blocks on the queue, processes an operation and moves it to
//! the finished queue. The owning thread drains the finished queue once per
//! frame through [`AsyncProcessor::perform_all_post_sync`]; that drain is
//! where retired operations are dropped and their reports surface.
//!
//! There is no hard cancellation. A request withdrawn before a worker reaches
//! it makes the operation a no-op (see [`crate::resource`]).

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{ResourceError, ResourceResult};
use crate::operation::{panic_message, OperationOutcome, OperationReport, ResourceOperation};
use crate::STREAM_TARGET;

/// Operation retired by a worker, waiting for the drain
struct FinishedOperation {
    operation: Box<ResourceOperation>,
    report: OperationReport,
}

/// Count of queued plus executing operations
#[derive(Default)]
struct Outstanding {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Outstanding {
    fn increment(&self) {
        *self.count.lock() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn get(&self) -> usize {
        *self.count.lock()
    }

    fn wait_for_zero(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

/// Background queue executing resource operations off the calling thread
pub struct AsyncProcessor {
    name: String,
    jobs: RwLock<Option<Sender<Box<ResourceOperation>>>>,
    finished: Receiver<FinishedOperation>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    outstanding: Arc<Outstanding>,
}

impl AsyncProcessor {
    /// Start `worker_count` workers (at least one)
    pub fn new(name: impl Into<String>, worker_count: usize) -> ResourceResult<Self> {
        let name = name.into();
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Box<ResourceOperation>>();
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let outstanding = Arc::new(Outstanding::default());

        let mut workers = Vec::new();
        for index in 0..worker_count.max(1) {
            let jobs = job_rx.clone();
            let finished = done_tx.clone();
            let outstanding = Arc::clone(&outstanding);

            let handle = thread::Builder::new()
                .name(format!("{} streaming #{}", name, index))
                .spawn(move || Self::worker_loop(jobs, finished, outstanding))
                .map_err(ResourceError::Spawn)?;
            workers.push(handle);
        }

        log::debug!(target: STREAM_TARGET, "Processor '{}' started with {} worker(s)", name, workers.len());

        Ok(Self {
            name,
            jobs: RwLock::new(Some(job_tx)),
            finished: done_rx,
            workers: Mutex::new(workers),
            outstanding,
        })
    }

    fn worker_loop(
        jobs: Receiver<Box<ResourceOperation>>,
        finished: Sender<FinishedOperation>,
        outstanding: Arc<Outstanding>,
    ) {
        // Ends once the sender is dropped and the queue is empty
        for operation in jobs.iter() {
            let report = match panic::catch_unwind(AssertUnwindSafe(|| operation.process())) {
                Ok(report) => report,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    log::error!(
                        target: STREAM_TARGET,
                        "Streaming worker caught a panic processing '{}': {}",
                        operation.key(),
                        message
                    );
                    OperationReport {
                        key: operation.key().clone(),
                        kind: operation.kind(),
                        outcome: OperationOutcome::Failed(message),
                        panicked: true,
                    }
                }
            };

            // The drain owns the operation from here on
            let _ = finished.send(FinishedOperation { operation, report });
            outstanding.decrement();
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append an operation to the queue and wake a worker.
    ///
    /// Returns the operation back if the processor has been shut down.
    pub fn enqueue(&self, operation: Box<ResourceOperation>) -> Result<(), Box<ResourceOperation>> {
        let jobs = self.jobs.read();
        let Some(sender) = jobs.as_ref() else {
            return Err(operation);
        };

        self.outstanding.increment();
        sender.send(operation).map_err(|e| {
            self.outstanding.decrement();
            e.into_inner()
        })
    }

    /// Drain the finished queue, dropping retired operations.
    ///
    /// Call once per frame from the owning thread.
    pub fn perform_all_post_sync(&self) -> Vec<OperationReport> {
        self.finished
            .try_iter()
            .map(|FinishedOperation { operation, report }| {
                drop(operation);
                report
            })
            .collect()
    }

    /// Queued plus executing operations
    pub fn operation_count(&self) -> usize {
        self.outstanding.get()
    }

    pub fn is_idle(&self) -> bool {
        self.operation_count() == 0
    }

    /// Block until every queued operation has been processed
    pub fn wait_for_idle(&self) {
        self.outstanding.wait_for_zero();
    }

    pub fn is_shut_down(&self) -> bool {
        self.jobs.read().is_none()
    }

    /// Stop accepting operations, let workers finish the queue and join them
    pub fn shutdown(&self) {
        let sender = self.jobs.write().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                log::error!(target: STREAM_TARGET, "Streaming worker of '{}' terminated abnormally", self.name);
            }
        }
        log::debug!(target: STREAM_TARGET, "Processor '{}' stopped", self.name);
    }
}

impl Drop for AsyncProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for AsyncProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncProcessor")
            .field("name", &self.name)
            .field("operations", &self.operation_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

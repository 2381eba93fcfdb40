use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::assemble::{BatchAssembler, BatchJob};
use crate::types::{LoaderError, PropertyBatch};

/// A finished job: its sequence number and the assembled batch or error.
pub type BatchResult = (u64, Result<PropertyBatch, LoaderError>);

/// Fixed set of threads assembling batches.
///
/// Jobs go in on one channel and `(sequence, result)` pairs come back on
/// another in completion order. Dropping the pool closes the job channel and
/// joins every worker; jobs still queued at that point are skipped.
pub struct WorkerPool {
    jobs: Option<Sender<BatchJob>>,
    results: Receiver<BatchResult>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(num_workers: usize, assembler: Arc<BatchAssembler>) -> Result<Self, LoaderError> {
        if num_workers == 0 {
            return Err(LoaderError::Config("num_workers must be at least 1".into()));
        }

        let (job_tx, job_rx) = crossbeam_channel::unbounded::<BatchJob>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<BatchResult>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let assembler = Arc::clone(&assembler);
            let shutdown = Arc::clone(&shutdown);
            let handle = std::thread::Builder::new()
                .name(format!("batch-worker-{id}"))
                .spawn(move || worker_loop(id, jobs, results, assembler, shutdown))?;
            workers.push(handle);
        }

        tracing::debug!(num_workers, "Batch worker pool started");

        Ok(Self {
            jobs: Some(job_tx),
            results: result_rx,
            workers,
            shutdown,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn submit(&self, job: BatchJob) -> Result<(), LoaderError> {
        self.jobs
            .as_ref()
            .ok_or(LoaderError::Disconnected)?
            .send(job)
            .map_err(|_| LoaderError::Disconnected)
    }

    /// Block until any worker finishes a job.
    pub fn recv(&self) -> Result<BatchResult, LoaderError> {
        self.results.recv().map_err(|_| LoaderError::Disconnected)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.jobs.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("Batch worker panicked outside a job");
            }
        }
        tracing::debug!("Batch worker pool shut down");
    }
}

fn worker_loop(
    id: usize,
    jobs: Receiver<BatchJob>,
    results: Sender<BatchResult>,
    assembler: Arc<BatchAssembler>,
    shutdown: Arc<AtomicBool>,
) {
    for job in jobs.iter() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let sequence = job.sequence;
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| assembler.assemble(&job)))
            .unwrap_or_else(|panic| {
                Err(LoaderError::Worker {
                    sequence,
                    message: panic_message(panic.as_ref()),
                })
            });
        if let Err(e) = &outcome {
            tracing::debug!(worker = id, sequence, error = %e, "Batch assembly failed");
        }
        if results.send((sequence, outcome)).is_err() {
            break;
        }
    }
    tracing::debug!(worker = id, "Batch worker exiting");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

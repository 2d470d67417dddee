//! Inference pipeline
//!
//! A single worker thread owns the model; every intake submits jobs through
//! the shared [`JobQueue`] and waits on its own one-shot reply.

pub mod queue;
pub mod worker;

#[cfg(test)]
pub mod testing;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::vision::LatexOcr;

pub use queue::{JobQueue, QueueError, Response};
pub use worker::{spawn_worker, SharedStatus, WorkerOptions, WorkerState, WorkerStatus};

/// A running local pipeline
pub struct Pipeline {
    pub queue: JobQueue,
    pub status: SharedStatus,
    pub worker: JoinHandle<()>,
}

/// Start the worker with the nougat-latex model described by `config`.
///
/// Returns immediately; the model loads on the worker thread and jobs queue
/// up behind it.
pub fn start(config: &AppConfig, options: WorkerOptions) -> Result<Pipeline> {
    let (queue, rx) = JobQueue::new(config.server.max_queue_depth);
    let status: SharedStatus = Arc::new(RwLock::new(WorkerStatus {
        precision: config.model.precision,
        ..Default::default()
    }));

    let model_config = config.model.clone();
    let preprocess = config.preprocess.clone();
    let worker = spawn_worker(
        rx,
        move |report| LatexOcr::load(&model_config, &preprocess, report),
        options,
        status.clone(),
    )
    .context("Failed to spawn inference worker")?;

    Ok(Pipeline { queue, status, worker })
}

impl Pipeline {
    /// Close the queue and wait for the worker to drain it
    pub fn shutdown(self) -> bool {
        shutdown(self.queue, self.worker, &self.status)
    }
}

/// Drop `queue` and join `worker` once it has processed everything queued.
///
/// A worker still loading its model is left to finish on its own; returns
/// whether the worker was joined.
pub fn shutdown(queue: JobQueue, worker: JoinHandle<()>, status: &SharedStatus) -> bool {
    drop(queue);
    if status.read().state == WorkerState::Loading {
        info!("Model still loading; not waiting for the inference worker");
        return false;
    }
    if worker.join().is_err() {
        warn!("Inference worker panicked during shutdown");
    }
    true
}

//! Inference worker loop
//!
//! A dedicated OS thread owns the model and drains the queue one item at a
//! time, so at most one inference call runs at any instant. Every job gets
//! exactly one response, including when the model failed to load or panics.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::inference::queue::{Job, PrecisionReply, Response, WorkItem};
use crate::vision::{strip_markers, InferenceError, LoadProgress, Precision, Recognizer};

/// Lifecycle of the worker as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Loading,
    Idle,
    Busy,
    /// Model failed to load; jobs are answered with failures
    Failed,
}

/// Snapshot shared read-only with the UI
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub precision: Precision,
    pub device: String,
    /// Jobs answered with a result
    pub completed: u64,
    /// Jobs answered with a failure
    pub failed: u64,
    pub load_error: Option<String>,
    /// Last progress report while loading
    pub progress: Option<LoadProgress>,
}

pub type SharedStatus = Arc<RwLock<WorkerStatus>>;

#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Drop jobs whose submitter went away before they were reached
    pub skip_abandoned_jobs: bool,
    /// Extra sink for model loading progress
    pub progress: Option<Sender<LoadProgress>>,
}

/// Start the worker thread.
///
/// `loader` runs on the worker thread before the first item is taken. The
/// thread exits once every [`JobQueue`](crate::inference::JobQueue) clone is
/// dropped.
pub fn spawn_worker<L, R>(
    rx: Receiver<WorkItem>,
    loader: L,
    options: WorkerOptions,
    status: SharedStatus,
) -> std::io::Result<JoinHandle<()>>
where
    L: FnOnce(&dyn Fn(LoadProgress)) -> anyhow::Result<R> + Send + 'static,
    R: Recognizer + 'static,
{
    thread::Builder::new()
        .name("inference-worker".to_string())
        .spawn(move || {
            let model = load_model(loader, &options, &status);
            run(rx, model, &options, &status);
        })
}

fn load_model<L, R>(loader: L, options: &WorkerOptions, status: &SharedStatus) -> Result<R, String>
where
    L: FnOnce(&dyn Fn(LoadProgress)) -> anyhow::Result<R>,
    R: Recognizer,
{
    status.write().state = WorkerState::Loading;

    let report = |progress: LoadProgress| {
        debug!("Model load {:.0}%: {}", progress.percent, progress.message);
        if let Some(tx) = &options.progress {
            let _ = tx.send(progress.clone());
        }
        status.write().progress = Some(progress);
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| loader(&report)));
    let model = match outcome {
        Ok(Ok(model)) => Ok(model),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(panic_message(payload.as_ref())),
    };

    let mut s = status.write();
    match &model {
        Ok(model) => {
            s.state = WorkerState::Idle;
            s.precision = model.precision();
            s.device = model.device_info();
            info!("Inference worker ready ({}, {})", s.precision.label(), s.device);
        }
        Err(e) => {
            s.state = WorkerState::Failed;
            s.load_error = Some(e.clone());
            error!("Model failed to load: {}", e);
        }
    }
    model
}

fn run<R: Recognizer>(
    rx: Receiver<WorkItem>,
    mut model: Result<R, String>,
    options: &WorkerOptions,
    status: &SharedStatus,
) {
    while let Ok(item) = rx.recv() {
        match item {
            WorkItem::Recognize(job) => handle_job(job, &mut model, options, status),
            WorkItem::SetPrecision { precision, reply } => {
                let outcome = switch_precision(&mut model, precision, status);
                if reply.send(outcome).is_err() {
                    debug!("Precision switch requester went away");
                }
            }
        }
    }
    info!("Inference queue closed, worker stopping");
}

fn handle_job<R: Recognizer>(job: Job, model: &mut Result<R, String>, options: &WorkerOptions, status: &SharedStatus) {
    let Job {
        id,
        payload,
        reply,
        enqueued_at,
    } = job;

    if options.skip_abandoned_jobs && reply.is_closed() {
        debug!("Job {} abandoned by its caller, skipping", id);
        return;
    }

    let waited = enqueued_at.elapsed();
    let previous = {
        let mut s = status.write();
        let previous = s.state;
        if previous == WorkerState::Idle {
            s.state = WorkerState::Busy;
        }
        previous
    };

    let started = Instant::now();
    let response = match model {
        Ok(model) => recognize(model, &payload),
        Err(e) => Response::Failed(InferenceError::NotLoaded(e.clone()).to_string()),
    };
    let elapsed = started.elapsed();

    {
        let mut s = status.write();
        s.state = previous;
        match &response {
            Response::Recognized(_) => s.completed += 1,
            Response::Failed(_) => s.failed += 1,
        }
    }

    match &response {
        Response::Recognized(latex) => {
            info!("Job {} done in {:?} (queued {:?}): ${}$", id, elapsed, waited, latex)
        }
        Response::Failed(e) => warn!("Job {} failed after {:?}: {}", id, elapsed, e),
    }

    if reply.send(response).is_err() {
        debug!("Job {} caller disconnected before the reply", id);
    }
}

/// Decode, infer and clean one payload; faults become `Failed`
pub fn recognize<R: Recognizer>(model: &mut R, payload: &[u8]) -> Response {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<String, InferenceError> {
        let image = image::load_from_memory(payload)?.to_rgb8();
        let raw = model.infer(&image)?;
        Ok(strip_markers(&raw, &model.marker_tokens()))
    }));

    match outcome {
        Ok(Ok(latex)) => Response::Recognized(latex),
        Ok(Err(e)) => Response::Failed(e.to_string()),
        Err(payload) => Response::Failed(InferenceError::Panicked(panic_message(payload.as_ref())).to_string()),
    }
}

fn switch_precision<R: Recognizer>(
    model: &mut Result<R, String>,
    precision: Precision,
    status: &SharedStatus,
) -> PrecisionReply {
    let model = match model {
        Ok(model) => model,
        Err(e) => return Err(InferenceError::NotLoaded(e.clone()).to_string()),
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| model.set_precision(precision)));
    let result = match outcome {
        Ok(Ok(())) => Ok(model.precision()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(InferenceError::Panicked(panic_message(payload.as_ref())).to_string()),
    };

    let mut s = status.write();
    s.precision = model.precision();
    s.device = model.device_info();
    match &result {
        Ok(p) => info!("Model precision is now {}", p.label()),
        Err(e) => warn!("Precision switch to {} failed: {}", precision.label(), e),
    }
    result
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::queue::JobQueue;
    use crate::inference::testing::{png_bytes, spawn_fake, Event, FakeRecognizer, Probe, FAIL_WIDTH, PANIC_WIDTH};
    use anyhow::anyhow;
    use std::time::Duration;

    fn latex(response: Response) -> String {
        match response {
            Response::Recognized(text) => text,
            Response::Failed(e) => panic!("unexpected failure: {}", e),
        }
    }

    #[test]
    fn test_jobs_answered_in_arrival_order() {
        let pipeline = spawn_fake(Duration::from_millis(2), WorkerOptions::default());
        let widths: Vec<u32> = (1..=12).collect();
        let receivers: Vec<_> = widths
            .iter()
            .map(|&w| pipeline.queue.submit(png_bytes(w, 4)).unwrap())
            .collect();

        for (w, rx) in widths.iter().zip(receivers) {
            assert_eq!(latex(rx.blocking_recv().unwrap()), format!("x_{{{}}}", w));
        }
        assert_eq!(pipeline.probe.inferred_widths(), widths);
    }

    #[test]
    fn test_concurrent_submitters_never_overlap() {
        let pipeline = spawn_fake(Duration::from_millis(3), WorkerOptions::default());

        let handles: Vec<_> = (20..36u32)
            .map(|w| {
                let queue = pipeline.queue.clone();
                std::thread::spawn(move || (w, queue.recognize_blocking(png_bytes(w, 3))))
            })
            .collect();

        for handle in handles {
            let (w, response) = handle.join().unwrap();
            assert_eq!(latex(response), format!("x_{{{}}}", w));
        }
        assert_eq!(pipeline.probe.max_active.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(pipeline.probe.inferred_widths().len(), 16);
        assert_eq!(pipeline.status.read().completed, 16);
    }

    #[test]
    fn test_error_fails_only_that_job() {
        let pipeline = spawn_fake(Duration::ZERO, WorkerOptions::default());
        let bad = pipeline.queue.submit(png_bytes(FAIL_WIDTH, 2)).unwrap();
        let good = pipeline.queue.submit(png_bytes(5, 2)).unwrap();

        match bad.blocking_recv().unwrap() {
            Response::Failed(e) => assert!(e.contains("injected failure")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(latex(good.blocking_recv().unwrap()), "x_{5}");

        let status = pipeline.status.read();
        assert_eq!((status.completed, status.failed), (1, 1));
        assert_eq!(status.state, WorkerState::Idle);
    }

    #[test]
    fn test_panic_is_contained() {
        let pipeline = spawn_fake(Duration::ZERO, WorkerOptions::default());
        let bad = pipeline.queue.submit(png_bytes(PANIC_WIDTH, 2)).unwrap();
        let good = pipeline.queue.submit(png_bytes(7, 2)).unwrap();

        match bad.blocking_recv().unwrap() {
            Response::Failed(e) => assert!(e.contains("injected panic")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(latex(good.blocking_recv().unwrap()), "x_{7}");
    }

    #[test]
    fn test_undecodable_payload_fails() {
        let pipeline = spawn_fake(Duration::ZERO, WorkerOptions::default());
        let response = pipeline.queue.recognize_blocking(b"not an image".to_vec());
        assert!(matches!(response, Response::Failed(ref e) if e.contains("unsupported image")));
        assert!(pipeline.probe.events().is_empty());
    }

    #[test]
    fn test_precision_switch_runs_between_jobs() {
        let pipeline = spawn_fake(Duration::from_millis(5), WorkerOptions::default());
        let first = pipeline.queue.submit(png_bytes(3, 2)).unwrap();
        let switch = pipeline.queue.set_precision(Precision::Reduced).unwrap();
        let second = pipeline.queue.submit(png_bytes(4, 2)).unwrap();

        latex(first.blocking_recv().unwrap());
        assert_eq!(switch.blocking_recv().unwrap(), Ok(Precision::Reduced));
        latex(second.blocking_recv().unwrap());

        assert_eq!(
            pipeline.probe.events(),
            vec![Event::Infer(3), Event::Precision(Precision::Reduced), Event::Infer(4)]
        );
        assert_eq!(pipeline.status.read().precision, Precision::Reduced);
    }

    #[test]
    fn test_load_failure_answers_every_job() {
        let (queue, rx) = JobQueue::new(None);
        let status: SharedStatus = Arc::new(RwLock::new(WorkerStatus::default()));
        spawn_worker(
            rx,
            |_report| -> anyhow::Result<FakeRecognizer> { Err(anyhow!("missing encoder weights")) },
            WorkerOptions::default(),
            status.clone(),
        )
        .unwrap();

        for _ in 0..2 {
            match queue.recognize_blocking(png_bytes(2, 2)) {
                Response::Failed(e) => assert!(e.contains("missing encoder weights")),
                other => panic!("expected failure, got {:?}", other),
            }
        }
        let switch = queue.set_precision(Precision::Reduced).unwrap();
        assert!(switch.blocking_recv().unwrap().is_err());

        let status = status.read();
        assert_eq!(status.state, WorkerState::Failed);
        assert!(status.load_error.is_some());
    }

    #[test]
    fn test_load_progress_is_forwarded() {
        let (queue, rx) = JobQueue::new(None);
        let (progress_tx, progress_rx) = crossbeam_channel::unbounded();
        let status: SharedStatus = Arc::new(RwLock::new(WorkerStatus::default()));
        let options = WorkerOptions {
            progress: Some(progress_tx),
            ..Default::default()
        };
        spawn_worker(
            rx,
            |report: &dyn Fn(LoadProgress)| {
                report(LoadProgress::new(50.0, "halfway"));
                Ok(FakeRecognizer::new(Probe::default(), Duration::ZERO))
            },
            options,
            status.clone(),
        )
        .unwrap();

        latex(queue.recognize_blocking(png_bytes(2, 2)));
        let progress = progress_rx.try_recv().unwrap();
        assert_eq!(progress.message, "halfway");
        assert_eq!(status.read().device, "fake");
    }

    #[test]
    fn test_abandoned_job_still_runs_by_default() {
        let pipeline = spawn_fake(Duration::from_millis(20), WorkerOptions::default());
        let blocker = pipeline.queue.submit(png_bytes(1, 2)).unwrap();
        drop(pipeline.queue.submit(png_bytes(2, 2)).unwrap());
        let last = pipeline.queue.submit(png_bytes(3, 2)).unwrap();

        latex(blocker.blocking_recv().unwrap());
        latex(last.blocking_recv().unwrap());
        assert_eq!(pipeline.probe.inferred_widths(), vec![1, 2, 3]);
    }

    #[test]
    fn test_abandoned_job_skipped_when_enabled() {
        let options = WorkerOptions {
            skip_abandoned_jobs: true,
            ..Default::default()
        };
        let pipeline = spawn_fake(Duration::from_millis(20), options);
        let blocker = pipeline.queue.submit(png_bytes(1, 2)).unwrap();
        drop(pipeline.queue.submit(png_bytes(2, 2)).unwrap());
        let last = pipeline.queue.submit(png_bytes(3, 2)).unwrap();

        latex(blocker.blocking_recv().unwrap());
        latex(last.blocking_recv().unwrap());
        assert_eq!(pipeline.probe.inferred_widths(), vec![1, 3]);
    }

    #[test]
    fn test_worker_exits_when_producers_dropped() {
        let pipeline = spawn_fake(Duration::ZERO, WorkerOptions::default());
        let queue = pipeline.queue.clone();
        drop(pipeline.queue);
        latex(queue.recognize_blocking(png_bytes(2, 2)));
        drop(queue);
        pipeline.handle.join().unwrap();
    }
}

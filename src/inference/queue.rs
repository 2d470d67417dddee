//! Process-wide FIFO of pending work
//!
//! Producers (HTTP intakes, desktop capture, CLI) push work items; the single
//! inference worker is the only consumer.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::vision::Precision;

/// Outcome delivered for exactly one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Cleaned LaTeX text
    Recognized(String),
    /// Human-readable failure description
    Failed(String),
}

/// One pending recognition request
#[derive(Debug)]
pub struct Job {
    /// Log correlation only
    pub id: Uuid,
    /// Raw image bytes as uploaded or captured
    pub payload: Vec<u8>,
    /// Single-use reply slot owned by the submitter
    pub reply: oneshot::Sender<Response>,
    pub enqueued_at: Instant,
}

/// Reply for a precision switch: the precision now loaded, or why it failed
pub type PrecisionReply = Result<Precision, String>;

/// Item carried by the queue
#[derive(Debug)]
pub enum WorkItem {
    Recognize(Job),
    SetPrecision {
        precision: Precision,
        reply: oneshot::Sender<PrecisionReply>,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("inference queue is full ({0} jobs pending)")]
    Full(usize),
    #[error("inference worker is not running")]
    Closed,
}

/// Producer handle to the queue; cheap to clone
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: Sender<WorkItem>,
}

impl JobQueue {
    /// Create the queue. `max_depth` of `None` means unbounded.
    pub fn new(max_depth: Option<usize>) -> (Self, Receiver<WorkItem>) {
        let (tx, rx) = match max_depth {
            Some(depth) => crossbeam_channel::bounded(depth.max(1)),
            None => crossbeam_channel::unbounded(),
        };
        (Self { tx }, rx)
    }

    /// Append a recognition job to the tail. Never blocks.
    pub fn submit(&self, payload: Vec<u8>) -> Result<oneshot::Receiver<Response>, QueueError> {
        let (reply, rx) = oneshot::channel();
        let job = Job {
            id: Uuid::new_v4(),
            payload,
            reply,
            enqueued_at: Instant::now(),
        };
        self.push(WorkItem::Recognize(job))?;
        Ok(rx)
    }

    /// Queue a precision switch behind every job already waiting
    pub fn set_precision(&self, precision: Precision) -> Result<oneshot::Receiver<PrecisionReply>, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.push(WorkItem::SetPrecision { precision, reply })?;
        Ok(rx)
    }

    /// Submit and block the calling thread until the response arrives.
    ///
    /// Must not be called from inside an async runtime.
    pub fn recognize_blocking(&self, payload: Vec<u8>) -> Response {
        match self.submit(payload) {
            Ok(rx) => rx
                .blocking_recv()
                .unwrap_or_else(|_| Response::Failed("inference worker dropped the job".to_string())),
            Err(e) => Response::Failed(e.to_string()),
        }
    }

    /// Number of items waiting (not counting the one being processed)
    #[cfg(test)]
    pub fn depth(&self) -> usize {
        self.tx.len()
    }

    fn push(&self, item: WorkItem) -> Result<(), QueueError> {
        self.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full(self.tx.len()),
            TrySendError::Disconnected(_) => QueueError::Closed,
        })
    }
}

//! Test doubles for the inference pipeline

use image::{ImageFormat, RgbImage};
use parking_lot::{Mutex, RwLock};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::MarkerTokens;
use crate::inference::queue::JobQueue;
use crate::inference::worker::{spawn_worker, SharedStatus, WorkerOptions, WorkerStatus};
use crate::vision::{InferenceError, Precision, Recognizer};

/// Images this wide make the fake model return an error
pub const FAIL_WIDTH: u32 = 13;
/// Images this wide make the fake model panic
pub const PANIC_WIDTH: u32 = 66;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Inference ran on an image of this width
    Infer(u32),
    Precision(Precision),
}

/// Shared view into what the fake model did
#[derive(Clone, Default)]
pub struct Probe {
    pub events: Arc<Mutex<Vec<Event>>>,
    active: Arc<AtomicUsize>,
    pub max_active: Arc<AtomicUsize>,
}

impl Probe {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn inferred_widths(&self) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Infer(w) => Some(w),
                _ => None,
            })
            .collect()
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Model that echoes the image width wrapped in marker tokens
pub struct FakeRecognizer {
    probe: Probe,
    delay: Duration,
    precision: Precision,
}

impl FakeRecognizer {
    pub fn new(probe: Probe, delay: Duration) -> Self {
        Self {
            probe,
            delay,
            precision: Precision::Standard,
        }
    }
}

impl Recognizer for FakeRecognizer {
    fn infer(&mut self, image: &RgbImage) -> Result<String, InferenceError> {
        let now = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.probe.active);
        self.probe.max_active.fetch_max(now, Ordering::SeqCst);

        std::thread::sleep(self.delay);
        let width = image.width();
        self.probe.events.lock().push(Event::Infer(width));

        match width {
            FAIL_WIDTH => Err(InferenceError::Generate("injected failure".to_string())),
            PANIC_WIDTH => panic!("injected panic"),
            _ => Ok(format!("<s> x_{{{}}}</s><pad><pad>", width)),
        }
    }

    fn marker_tokens(&self) -> Vec<String> {
        MarkerTokens::default().all()
    }

    fn set_precision(&mut self, precision: Precision) -> Result<(), InferenceError> {
        self.probe.events.lock().push(Event::Precision(precision));
        self.precision = precision;
        Ok(())
    }

    fn precision(&self) -> Precision {
        self.precision
    }

    fn device_info(&self) -> String {
        "fake".to_string()
    }
}

/// Encode a blank PNG of the given size
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::new(width, height);
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, ImageFormat::Png)
        .expect("encode test png");
    bytes.into_inner()
}

/// Queue plus a running worker backed by [`FakeRecognizer`]
pub struct FakePipeline {
    pub queue: JobQueue,
    pub probe: Probe,
    pub status: SharedStatus,
    pub handle: JoinHandle<()>,
}

pub fn spawn_fake(delay: Duration, options: WorkerOptions) -> FakePipeline {
    let (queue, rx) = JobQueue::new(None);
    let probe = Probe::default();
    let status: SharedStatus = Arc::new(RwLock::new(WorkerStatus::default()));
    let model_probe = probe.clone();
    let handle = spawn_worker(
        rx,
        move |_report| Ok(FakeRecognizer::new(model_probe, delay)),
        options,
        status.clone(),
    )
    .expect("spawn worker");
    FakePipeline {
        queue,
        probe,
        status,
        handle,
    }
}

//! Desktop control window
//!
//! Stands in for a tray menu: Capture, Use Float16, Check for Updates, About
//! and Quit. Slow work runs on background threads and reports back through
//! [`AppEvent`]s.

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, Sender};
use eframe::egui;
use egui::{Align2, RichText};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use crate::client::ServiceClient;
use crate::capture::capture_region;
use crate::config::{AppConfig, DesktopConfig};
use crate::desktop::components::StatusCard;
use crate::desktop::state::{DesktopState, Dialog};
use crate::desktop::theme::{self, ThemeColors};
use crate::desktop::update::{check_for_updates, UpdateStatus};
use crate::inference::{self, JobQueue, Response, SharedStatus, WorkerOptions, WorkerState};
use crate::shared::AppEvent;
use crate::vision::LoadProgress;

const ABOUT_TEXT: &str = "Snap2LaTeX converts a picture of a mathematical equation into LaTeX code.\n\n\
Model by @NormXU: https://github.com/NormXU/nougat-latex-ocr";

/// Where captured images are recognized
#[derive(Clone)]
pub enum RecognitionBackend {
    /// In-process worker
    Local(JobQueue),
    /// A running `snap2latex serve`
    Remote(ServiceClient),
}

impl RecognitionBackend {
    /// Blocking; call from a background thread
    pub fn recognize(&self, image: Vec<u8>) -> Response {
        match self {
            RecognitionBackend::Local(queue) => queue.recognize_blocking(image),
            RecognitionBackend::Remote(client) => client
                .recognize_blocking(image, "capture.png")
                .unwrap_or_else(|e| Response::Failed(e.to_string())),
        }
    }
}

/// Capture a region and recognize it
fn capture_and_recognize(command: &[String], backend: &RecognitionBackend) -> Result<String, String> {
    let image = capture_region(command).map_err(|e| e.to_string())?;
    match backend.recognize(image) {
        Response::Recognized(latex) => Ok(latex),
        Response::Failed(e) => Err(e),
    }
}

pub struct DesktopApp {
    config: DesktopConfig,
    backend: RecognitionBackend,
    /// Local worker status; `None` when recognizing remotely
    worker: Option<SharedStatus>,
    state: DesktopState,
    events_tx: Sender<AppEvent>,
    events_rx: Receiver<AppEvent>,
    progress_rx: Option<Receiver<LoadProgress>>,
    theme_applied: bool,
}

impl DesktopApp {
    pub fn new(
        config: DesktopConfig,
        backend: RecognitionBackend,
        worker: Option<SharedStatus>,
        progress_rx: Option<Receiver<LoadProgress>>,
    ) -> Self {
        let precision = worker.as_ref().map(|w| w.read().precision).unwrap_or_default();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            config,
            backend,
            worker,
            state: DesktopState::new(precision),
            events_tx,
            events_rx,
            progress_rx,
            theme_applied: false,
        }
    }

    pub fn options() -> eframe::NativeOptions {
        eframe::NativeOptions {
            viewport: egui::ViewportBuilder::default()
                .with_inner_size([340.0, 320.0])
                .with_min_inner_size([300.0, 260.0])
                .with_always_on_top()
                .with_title("Snap2LaTeX"),
            ..Default::default()
        }
    }

    /// Run capture and recognition on a background thread
    fn start_capture(&mut self, ctx: &egui::Context) {
        if !self.state.begin_capture() {
            return;
        }

        let command = self.config.capture_command.clone();
        let backend = self.backend.clone();
        let tx = self.events_tx.clone();
        let ctx = ctx.clone();
        let spawned = thread::Builder::new().name("capture".to_string()).spawn(move || {
            let outcome = capture_and_recognize(&command, &backend);
            let _ = tx.send(AppEvent::CaptureFinished(outcome));
            ctx.request_repaint();
        });

        if let Err(e) = spawned {
            self.state.apply(AppEvent::CaptureFinished(Err(format!("Failed to start capture: {}", e))));
        }
    }

    fn request_precision(&mut self, ctx: &egui::Context, enabled: bool) {
        let RecognitionBackend::Local(queue) = &self.backend else {
            return;
        };
        let Some(precision) = self.state.toggle_float16(enabled) else {
            return;
        };

        let reply = match queue.set_precision(precision) {
            Ok(reply) => reply,
            Err(e) => {
                self.state.apply(AppEvent::PrecisionChanged(Err(e.to_string())));
                return;
            }
        };

        let tx = self.events_tx.clone();
        let ctx = ctx.clone();
        thread::spawn(move || {
            let outcome = reply
                .blocking_recv()
                .unwrap_or_else(|_| Err("inference worker stopped".to_string()));
            let _ = tx.send(AppEvent::PrecisionChanged(outcome));
            ctx.request_repaint();
        });
    }

    fn start_update_check(&mut self, ctx: &egui::Context) {
        if !self.state.begin_update_check() {
            return;
        }

        let update_url = self.config.update_url.clone();
        let releases_url = self.config.releases_url.clone();
        let tx = self.events_tx.clone();
        let ctx = ctx.clone();
        thread::spawn(move || {
            let outcome = check_for_updates(&update_url, &releases_url).map_err(|e| e.to_string());
            if let Err(e) = &outcome {
                warn!("Update check failed: {}", e);
            }
            let _ = tx.send(AppEvent::UpdateChecked(outcome));
            ctx.request_repaint();
        });
    }

    /// Drain background events and loading progress
    fn poll_events(&mut self, ctx: &egui::Context) {
        for event in self.events_rx.try_iter().collect::<Vec<_>>() {
            if let Some(latex) = self.state.apply(event) {
                ctx.copy_text(latex);
            }
        }

        if let Some(rx) = &self.progress_rx {
            if let Some(progress) = rx.try_iter().last() {
                self.state.load_progress = Some(progress);
            }
        }
    }

    fn worker_state(&self) -> Option<WorkerState> {
        self.worker.as_ref().map(|w| w.read().state)
    }

    fn render_controls(&mut self, ui: &mut egui::Ui, ctx: &egui::Context) {
        match (&self.worker, &self.backend) {
            (Some(status), _) => StatusCard::for_worker(&status.read()).show(ui),
            (None, RecognitionBackend::Remote(_)) => {
                StatusCard::for_server(self.config.server_url.as_deref().unwrap_or_default()).show(ui)
            }
            (None, RecognitionBackend::Local(_)) => {}
        }

        if self.worker_state() == Some(WorkerState::Loading) {
            if let Some(progress) = &self.state.load_progress {
                ui.add(
                    egui::ProgressBar::new(progress.percent / 100.0)
                        .text(progress.message.as_str())
                        .animate(true),
                );
            } else {
                ui.add(egui::ProgressBar::new(0.0).text("Preparing model").animate(true));
            }
        }

        ui.add_space(6.0);

        let capture_label = if self.state.capture_in_flight {
            "Capturing…"
        } else {
            "Capture"
        };
        let capture = ui.add_enabled(
            !self.state.capture_in_flight,
            egui::Button::new(RichText::new(capture_label).strong()).min_size(egui::vec2(ui.available_width(), 32.0)),
        );
        if capture.clicked() {
            self.start_capture(ctx);
        }

        let local = matches!(self.backend, RecognitionBackend::Local(_));
        let mut use_float16 = self.state.use_float16;
        let toggle = ui.add_enabled(
            local && self.state.precision_pending.is_none(),
            egui::Checkbox::new(&mut use_float16, "Use Float16"),
        );
        if toggle.changed() {
            self.request_precision(ctx, use_float16);
        }

        ui.separator();

        ui.horizontal(|ui| {
            if ui
                .add_enabled(!self.state.update_in_flight, egui::Button::new("Check for Updates"))
                .clicked()
            {
                self.start_update_check(ctx);
            }
            if ui.button("About").clicked() {
                self.state.dialog = Some(Dialog::About);
            }
            if ui.button("Quit").clicked() {
                ctx.send_viewport_cmd(egui::ViewportCommand::Close);
            }
        });

        if let Some(latex) = &self.state.last_latex {
            ui.add_space(6.0);
            ui.label(RichText::new("Last result").size(12.0).color(ThemeColors::TEXT_MUTED));
            ui.label(RichText::new(latex).monospace());
        }
    }

    fn render_dialog(&mut self, ctx: &egui::Context) {
        let Some(dialog) = self.state.dialog.clone() else {
            return;
        };

        let title = match &dialog {
            Dialog::Result { .. } => "LaTeX".to_string(),
            Dialog::Error { title, .. } => title.clone(),
            Dialog::Update(_) => "Check for Updates".to_string(),
            Dialog::About => "About Snap2LaTeX".to_string(),
        };

        let mut close = false;
        egui::Window::new(title)
            .collapsible(false)
            .resizable(false)
            .anchor(Align2::CENTER_CENTER, [0.0, 0.0])
            .show(ctx, |ui| {
                match &dialog {
                    Dialog::Result { latex } => {
                        let mut text = latex.clone();
                        ui.add(egui::TextEdit::multiline(&mut text).code_editor().desired_rows(3));
                        ui.label(RichText::new("Copied to clipboard").size(12.0).color(ThemeColors::TEXT_MUTED));
                        if ui.button("Copy again").clicked() {
                            ctx.copy_text(latex.clone());
                        }
                    }
                    Dialog::Error { message, .. } => {
                        ui.label(format!("An error occurred: {}", message));
                    }
                    Dialog::Update(UpdateStatus::UpToDate { current }) => {
                        ui.label(format!("You are running the latest version ({}).", current));
                    }
                    Dialog::Update(UpdateStatus::Available { current, latest, url }) => {
                        ui.label(format!("Version {} is available (you have {}).", latest, current));
                        if ui.button("Open Releases Page").clicked() {
                            ctx.open_url(egui::OpenUrl::new_tab(url));
                            close = true;
                        }
                    }
                    Dialog::About => {
                        ui.label(format!("Snap2LaTeX {}", env!("CARGO_PKG_VERSION")));
                        ui.label(ABOUT_TEXT);
                    }
                }
                ui.add_space(4.0);
                if ui.button("OK").clicked() {
                    close = true;
                }
            });

        if close {
            self.state.dialog = None;
        }
    }
}

impl eframe::App for DesktopApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        if !self.theme_applied {
            theme::apply_theme(ctx);
            self.theme_applied = true;
        }

        self.poll_events(ctx);

        // Progress arrives over a channel, so keep polling while loading
        if matches!(self.worker_state(), Some(WorkerState::Loading | WorkerState::Busy)) {
            ctx.request_repaint_after(Duration::from_millis(100));
        }

        egui::CentralPanel::default().show(ctx, |ui| {
            self.render_controls(ui, ctx);
        });

        self.render_dialog(ctx);
    }
}

/// Start the recognition backend and run the control window until Quit
pub fn run_desktop(config: AppConfig) -> Result<()> {
    let (backend, worker, progress_rx) = match &config.desktop.server_url {
        Some(url) => {
            info!("Recognizing captures with {}", url);
            (RecognitionBackend::Remote(ServiceClient::new(url.clone())?), None, None)
        }
        None => {
            let (progress_tx, progress_rx) = crossbeam_channel::unbounded();
            let options = WorkerOptions {
                skip_abandoned_jobs: config.server.skip_abandoned_jobs,
                progress: Some(progress_tx),
            };
            let pipeline = inference::start(&config, options)?;
            (
                RecognitionBackend::Local(pipeline.queue),
                Some(pipeline.status),
                Some(progress_rx),
            )
        }
    };

    let app = DesktopApp::new(config.desktop.clone(), backend, worker, progress_rx);
    eframe::run_native("Snap2LaTeX", DesktopApp::options(), Box::new(|_cc| Ok(Box::new(app))))
        .map_err(|e| anyhow!("Desktop window failed: {}", e))
}

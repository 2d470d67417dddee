//! Desktop UI state
//!
//! Pure state transitions, kept apart from egui so they can be tested.

use crate::desktop::update::UpdateStatus;
use crate::shared::AppEvent;
use crate::vision::{LoadProgress, Precision};

/// Modal dialog currently shown
#[derive(Debug, Clone, PartialEq)]
pub enum Dialog {
    /// Recognized LaTeX (already copied to the clipboard)
    Result { latex: String },
    Error { title: String, message: String },
    Update(UpdateStatus),
    About,
}

#[derive(Debug, Clone, Default)]
pub struct DesktopState {
    /// A capture is running on a background thread
    pub capture_in_flight: bool,
    /// An update check is running on a background thread
    pub update_in_flight: bool,
    /// State of the "Use Float16" checkbox
    pub use_float16: bool,
    /// Precision switch waiting for the worker
    pub precision_pending: Option<Precision>,
    pub dialog: Option<Dialog>,
    /// Latest model loading progress
    pub load_progress: Option<LoadProgress>,
    pub last_latex: Option<String>,
}

impl DesktopState {
    pub fn new(precision: Precision) -> Self {
        Self {
            use_float16: precision == Precision::Reduced,
            ..Default::default()
        }
    }

    /// Mark a capture as started. Returns false if one is already running.
    pub fn begin_capture(&mut self) -> bool {
        if self.capture_in_flight {
            return false;
        }
        self.capture_in_flight = true;
        true
    }

    pub fn begin_update_check(&mut self) -> bool {
        if self.update_in_flight {
            return false;
        }
        self.update_in_flight = true;
        true
    }

    /// React to a checkbox change. Returns the precision to request, if any.
    ///
    /// While a switch is pending the checkbox snaps back to the pending value.
    pub fn toggle_float16(&mut self, enabled: bool) -> Option<Precision> {
        if let Some(pending) = self.precision_pending {
            self.use_float16 = pending == Precision::Reduced;
            return None;
        }
        self.use_float16 = enabled;
        let precision = Precision::from_float16(enabled);
        self.precision_pending = Some(precision);
        Some(precision)
    }

    pub fn show_error(&mut self, title: impl Into<String>, message: impl Into<String>) {
        self.dialog = Some(Dialog::Error {
            title: title.into(),
            message: message.into(),
        });
    }

    /// Apply a background event. Returns text to copy to the clipboard.
    pub fn apply(&mut self, event: AppEvent) -> Option<String> {
        match event {
            AppEvent::CaptureFinished(outcome) => {
                self.capture_in_flight = false;
                match outcome {
                    Ok(latex) => {
                        self.last_latex = Some(latex.clone());
                        self.dialog = Some(Dialog::Result { latex: latex.clone() });
                        return Some(latex);
                    }
                    Err(message) => self.show_error("Capture failed", message),
                }
            }
            AppEvent::PrecisionChanged(outcome) => {
                let requested = self.precision_pending.take();
                match outcome {
                    Ok(precision) => self.use_float16 = precision == Precision::Reduced,
                    Err(message) => {
                        if let Some(requested) = requested {
                            self.use_float16 = requested != Precision::Reduced;
                        }
                        self.show_error("Precision switch failed", message);
                    }
                }
            }
            AppEvent::UpdateChecked(outcome) => {
                self.update_in_flight = false;
                match outcome {
                    Ok(status) => self.dialog = Some(Dialog::Update(status)),
                    Err(message) => self.show_error("Update check failed", message),
                }
            }
        }
        None
    }
}

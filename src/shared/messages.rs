//! Message types posted to the desktop UI

use crate::desktop::update::UpdateStatus;
use crate::vision::Precision;

/// Outcome of background work, drained by the UI each frame
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// Capture plus recognition finished: LaTeX text or a failure description
    CaptureFinished(Result<String, String>),
    /// The worker applied (or refused) a precision switch
    PrecisionChanged(Result<Precision, String>),
    /// Update check finished
    UpdateChecked(Result<UpdateStatus, String>),
}

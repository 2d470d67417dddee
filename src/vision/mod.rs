//! Vision/OCR Layer
//!
//! The model adapter boundary: turns an RGB image into LaTeX text.
//! The concrete backend runs the nougat-latex encoder/decoder through
//! ONNX Runtime; everything upstream only sees the [`Recognizer`] trait.

pub mod decode;
pub mod latex_ocr;
pub mod models;
pub mod preprocess;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use latex_ocr::LatexOcr;
pub use models::LoadProgress;

/// Weight precision of the loaded model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// Float32 weights
    #[default]
    Standard,
    /// Float16 weights
    Reduced,
}

impl Precision {
    /// Short label for logs and the UI
    pub fn label(&self) -> &'static str {
        match self {
            Precision::Standard => "float32",
            Precision::Reduced => "float16",
        }
    }

    /// Precision selected by the "Use Float16" toggle
    pub fn from_float16(enabled: bool) -> Self {
        if enabled {
            Precision::Reduced
        } else {
            Precision::Standard
        }
    }
}

/// Failure anywhere between raw upload bytes and cleaned LaTeX text
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("unsupported image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("preprocessing failed: {0}")]
    Preprocess(String),
    #[error("generation failed: {0}")]
    Generate(String),
    #[error("postprocessing failed: {0}")]
    Postprocess(String),
    #[error("model not loaded: {0}")]
    NotLoaded(String),
    #[error("model load failed: {0}")]
    Load(String),
    #[error("inference panicked: {0}")]
    Panicked(String),
}

/// Image-to-LaTeX model adapter
///
/// Implementations are owned by exactly one inference worker and are never
/// called concurrently.
pub trait Recognizer: Send {
    /// Recognize an image. The returned text may still contain marker tokens.
    fn infer(&mut self, image: &RgbImage) -> Result<String, InferenceError>;

    /// Marker tokens to strip from `infer` output
    fn marker_tokens(&self) -> Vec<String>;

    /// Switch weight precision, reloading the model if needed
    fn set_precision(&mut self, precision: Precision) -> Result<(), InferenceError>;

    /// Currently loaded precision
    fn precision(&self) -> Precision;

    /// Compute device identifier (e.g. "cpu", "directml")
    fn device_info(&self) -> String;
}

/// Remove every marker substring from generated text.
///
/// Removal repeats until the text is stable, so a marker split around another
/// marker (`"<s<pad>>"`) cannot survive.
pub fn strip_markers(text: &str, markers: &[String]) -> String {
    let mut cleaned = text.to_string();
    loop {
        let before = cleaned.len();
        for marker in markers.iter().filter(|m| !m.is_empty()) {
            cleaned = cleaned.replace(marker.as_str(), "");
        }
        if cleaned.len() == before {
            break;
        }
    }
    cleaned.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarkerTokens;

    #[test]
    fn test_strip_markers_removes_all_markers() {
        let markers = MarkerTokens::default().all();
        let raw = "<s> x^{2}+y^{2}</s><pad><pad>";
        assert_eq!(strip_markers(raw, &markers), "x^{2}+y^{2}");
    }

    #[test]
    fn test_strip_markers_nested_marker() {
        let markers = MarkerTokens::default().all();
        let stripped = strip_markers("a<s<pad>>b", &markers);
        assert_eq!(stripped, "ab");
        for marker in &markers {
            assert!(!stripped.contains(marker.as_str()));
        }
    }

    #[test]
    fn test_strip_markers_plain_text_untouched() {
        let markers = MarkerTokens::default().all();
        assert_eq!(strip_markers(r"\frac{a}{b}", &markers), r"\frac{a}{b}");
    }

    #[test]
    fn test_strip_markers_ignores_empty_marker() {
        let markers = vec![String::new(), "</s>".to_string()];
        assert_eq!(strip_markers("x</s>", &markers), "x");
    }

    #[test]
    fn test_precision_labels() {
        assert_eq!(Precision::from_float16(true), Precision::Reduced);
        assert_eq!(Precision::from_float16(false), Precision::Standard);
        assert_eq!(Precision::Reduced.label(), "float16");
    }
}

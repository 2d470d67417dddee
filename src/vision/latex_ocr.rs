//! nougat-latex model adapter
//!
//! Vision encoder and text decoder exported to ONNX, driven by beam search,
//! with the HuggingFace tokenizer turning generated ids back into text.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use ndarray::Array4;
use ort::value::Tensor;
use std::cell::Cell;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::config::{ModelConfig, PreprocessSettings};
use crate::vision::decode::{beam_search, GenerationConfig};
use crate::vision::models::{overall_percent, LoadProgress, ModelFile, ModelManager, OnnxSession};
use crate::vision::preprocess::preprocess;
use crate::vision::{InferenceError, Precision, Recognizer};

/// Share of the progress bar spent fetching files; session creation gets the rest
const DOWNLOAD_SPAN: f32 = 90.0;

fn generate_err(e: impl std::fmt::Display) -> InferenceError {
    InferenceError::Generate(e.to_string())
}

/// Encoder and decoder sessions for one precision
struct Sessions {
    encoder: OnnxSession,
    decoder: OnnxSession,
}

/// LaTeX OCR backed by ONNX Runtime
pub struct LatexOcr {
    sessions: Sessions,
    tokenizer: Tokenizer,
    manager: ModelManager,
    model_config: ModelConfig,
    preprocess: PreprocessSettings,
    generation: GenerationConfig,
    markers: Vec<String>,
    precision: Precision,
}

impl LatexOcr {
    /// Download (if needed) and load the model, reporting progress along the way
    pub fn load(
        model_config: &ModelConfig,
        preprocess: &PreprocessSettings,
        report: &dyn Fn(LoadProgress),
    ) -> Result<Self> {
        let models_dir = match &model_config.models_dir {
            Some(dir) => dir.clone(),
            None => crate::storage::default_models_dir()?,
        };
        let manager = ModelManager::with_dir(models_dir, model_config.repository_url.clone())?;
        let precision = model_config.precision;

        fetch_files(&manager, precision, report)?;

        let tokenizer = Tokenizer::from_file(manager.model_path(ModelFile::Tokenizer))
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let tokens = &model_config.tokens;
        let token_id = |token: &str| -> Result<i64> {
            tokenizer
                .token_to_id(token)
                .map(i64::from)
                .ok_or_else(|| anyhow!("Tokenizer has no id for marker token {:?}", token))
        };
        let generation = GenerationConfig {
            bos_id: token_id(&tokens.bos)?,
            eos_id: token_id(&tokens.eos)?,
            suppressed: vec![token_id(&tokens.unk)?],
            num_beams: model_config.num_beams.max(1),
            max_length: model_config.max_length.max(2),
        };

        let sessions = build_sessions(&manager, model_config, precision, report)?;
        report(LoadProgress::new(100.0, "Model ready"));
        info!(
            "Loaded nougat-latex model ({}, {})",
            precision.label(),
            sessions.encoder.device()
        );

        Ok(Self {
            sessions,
            tokenizer,
            manager,
            model_config: model_config.clone(),
            preprocess: preprocess.clone(),
            generation,
            markers: tokens.all(),
            precision,
        })
    }
}

/// Make sure every file for `precision` is on disk
fn fetch_files(manager: &ModelManager, precision: Precision, report: &dyn Fn(LoadProgress)) -> Result<()> {
    let files = ModelFile::required(precision);
    for (step, file) in files.iter().enumerate() {
        report(LoadProgress::new(
            overall_percent(step, files.len(), 0.0, DOWNLOAD_SPAN),
            format!("Checking {}", file.display_name()),
        ));

        let last_percent = Cell::new(-1i32);
        let on_chunk = |downloaded: u64, total: Option<u64>| {
            let Some(total) = total.filter(|t| *t > 0) else {
                return;
            };
            let fraction = downloaded as f32 / total as f32;
            let percent = overall_percent(step, files.len(), fraction, DOWNLOAD_SPAN);
            if percent as i32 != last_percent.get() {
                last_percent.set(percent as i32);
                report(LoadProgress::new(
                    percent,
                    format!(
                        "Downloading {} ({:.1} / {:.1} MB)",
                        file.display_name(),
                        downloaded as f64 / 1_048_576.0,
                        total as f64 / 1_048_576.0
                    ),
                ));
            }
        };
        manager
            .ensure_file(*file, Some(&on_chunk))
            .with_context(|| format!("Failed to fetch {}", file.filename()))?;
    }
    Ok(())
}

fn build_sessions(
    manager: &ModelManager,
    model_config: &ModelConfig,
    precision: Precision,
    report: &dyn Fn(LoadProgress),
) -> Result<Sessions> {
    report(LoadProgress::new(DOWNLOAD_SPAN, "Loading vision encoder"));
    let encoder = OnnxSession::new(
        &manager.model_path(ModelFile::Encoder(precision)),
        model_config.intra_threads,
        model_config.use_gpu,
    )?;

    report(LoadProgress::new(95.0, "Loading text decoder"));
    let decoder = OnnxSession::new(
        &manager.model_path(ModelFile::Decoder(precision)),
        model_config.intra_threads,
        model_config.use_gpu,
    )?;

    Ok(Sessions { encoder, decoder })
}

/// Run the encoder, returning `[batch, seq, hidden]` and the flat hidden states
fn encode(encoder: &mut OnnxSession, pixel_values: Array4<f32>) -> Result<([usize; 3], Vec<f32>), InferenceError> {
    let (n, c, h, w) = pixel_values.dim();
    let data: Vec<f32> = pixel_values.iter().copied().collect();
    let input = Tensor::from_array(([n, c, h, w], data)).map_err(generate_err)?;

    let outputs = encoder
        .session_mut()
        .run(ort::inputs!["pixel_values" => input])
        .map_err(generate_err)?;
    let hidden = outputs
        .get("last_hidden_state")
        .ok_or_else(|| InferenceError::Generate("encoder output last_hidden_state missing".to_string()))?;
    let (shape, data) = hidden.try_extract_tensor::<f32>().map_err(generate_err)?;

    let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
    last_position_logits(&dims, data, batch, seq_len)
}

/// Split `[batch, seq_len, vocab]` logits into the final position's row per beam
fn last_position_logits(
    dims: &[usize],
    data: &[f32],
    batch: usize,
    seq_len: usize,
) -> Result<Vec<Vec<f32>>, InferenceError> {
    if dims.len() != 3 || dims[0] != batch || dims[1] != seq_len || seq_len == 0 {
        return Err(InferenceError::Generate(format!(
            "unexpected decoder output shape {:?} for input [{}, {}]",
            dims, batch, seq_len
        )));
    }
    let vocab = dims[2];
    if data.len() != batch * seq_len * vocab {
        return Err(InferenceError::Generate(format!(
            "decoder output holds {} values, expected {}",
            data.len(),
            batch * seq_len * vocab
        )));
    }

    Ok((0..batch)
        .map(|b| {
            let start = (b * seq_len + seq_len - 1) * vocab;
            data[start..start + vocab].to_vec()
        })
        .collect())
}

impl Recognizer for LatexOcr {
    fn infer(&mut self, image: &RgbImage) -> Result<String, InferenceError> {
        let pixel_values = preprocess(image, &self.preprocess)?;

        let Sessions { encoder, decoder } = &mut self.sessions;
        let (hidden_shape, hidden) = encode(encoder, pixel_values)?;
        let tokens = beam_search(&self.generation, |sequences| {
            decode_step(decoder, hidden_shape, &hidden, sequences)
        })?;
        debug!("Generated {} tokens", tokens.len());

        let ids: Vec<u32> = tokens.iter().filter_map(|&id| u32::try_from(id).ok()).collect();
        self.tokenizer
            .decode(&ids, false)
            .map_err(|e| InferenceError::Postprocess(e.to_string()))
    }

    fn marker_tokens(&self) -> Vec<String> {
        self.markers.clone()
    }

    fn set_precision(&mut self, precision: Precision) -> Result<(), InferenceError> {
        if precision == self.precision {
            return Ok(());
        }

        info!("Switching model precision to {}", precision.label());
        let report = |progress: LoadProgress| debug!("{:.0}% {}", progress.percent, progress.message);
        fetch_files(&self.manager, precision, &report).map_err(|e| InferenceError::Load(format!("{:#}", e)))?;
        let sessions = build_sessions(&self.manager, &self.model_config, precision, &report)
            .map_err(|e| InferenceError::Load(format!("{:#}", e)))?;

        self.sessions = sessions;
        self.precision = precision;
        Ok(())
    }

    fn precision(&self) -> Precision {
        self.precision
    }

    fn device_info(&self) -> String {
        self.sessions.encoder.device().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_position_logits_picks_final_step_per_beam() {
        // value = b*100 + t*10 + v
        let (batch, seq_len, vocab) = (2, 3, 4);
        let data: Vec<f32> = (0..batch)
            .flat_map(|b| (0..seq_len).flat_map(move |t| (0..vocab).map(move |v| (b * 100 + t * 10 + v) as f32)))
            .collect();

        let rows = last_position_logits(&[batch, seq_len, vocab], &data, batch, seq_len).unwrap();

        assert_eq!(rows, vec![vec![20.0, 21.0, 22.0, 23.0], vec![120.0, 121.0, 122.0, 123.0]]);
    }

    #[test]
    fn test_last_position_logits_single_step() {
        let rows = last_position_logits(&[1, 1, 3], &[0.5, 1.5, 2.5], 1, 1).unwrap();
        assert_eq!(rows, vec![vec![0.5, 1.5, 2.5]]);
    }

    #[test]
    fn test_last_position_logits_rejects_mismatched_shape() {
        let data = vec![0.0; 12];
        assert!(matches!(
            last_position_logits(&[2, 3, 2], &data, 3, 3),
            Err(InferenceError::Generate(_))
        ));
        assert!(matches!(
            last_position_logits(&[3, 4], &data, 3, 4),
            Err(InferenceError::Generate(_))
        ));
        assert!(matches!(
            last_position_logits(&[2, 3, 4], &data, 2, 3),
            Err(InferenceError::Generate(_))
        ));
    }
}

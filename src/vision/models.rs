//! Model management for ONNX Runtime
//!
//! Handles downloading, caching, and loading of the nougat-latex model files.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use ort::session::{builder::GraphOptimizationLevel, Session};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::vision::Precision;

/// Files making up one loadable model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFile {
    /// Vision encoder
    Encoder(Precision),
    /// Text decoder
    Decoder(Precision),
    /// HuggingFace tokenizer definition
    Tokenizer,
}

impl ModelFile {
    /// Get the local filename for this file
    pub fn filename(&self) -> &'static str {
        match self {
            ModelFile::Encoder(Precision::Standard) => "encoder_model.onnx",
            ModelFile::Encoder(Precision::Reduced) => "encoder_model_fp16.onnx",
            ModelFile::Decoder(Precision::Standard) => "decoder_model.onnx",
            ModelFile::Decoder(Precision::Reduced) => "decoder_model_fp16.onnx",
            ModelFile::Tokenizer => "tokenizer.json",
        }
    }

    /// Path of the file relative to the repository root
    pub fn remote_path(&self) -> String {
        match self {
            ModelFile::Tokenizer => self.filename().to_string(),
            _ => format!("onnx/{}", self.filename()),
        }
    }

    /// Download URL below the given repository base URL
    pub fn download_url(&self, repository_url: &str) -> String {
        format!("{}/{}", repository_url.trim_end_matches('/'), self.remote_path())
    }

    /// Minimum plausible size; anything smaller is treated as a broken download
    pub fn min_size(&self) -> u64 {
        match self {
            ModelFile::Tokenizer => 1_000,
            _ => 1_000_000,
        }
    }

    /// Display name for progress reporting
    pub fn display_name(&self) -> &'static str {
        match self {
            ModelFile::Encoder(_) => "Vision Encoder",
            ModelFile::Decoder(_) => "Text Decoder",
            ModelFile::Tokenizer => "Tokenizer",
        }
    }

    /// Files needed to run the model at the given precision
    pub fn required(precision: Precision) -> [ModelFile; 3] {
        [
            ModelFile::Tokenizer,
            ModelFile::Encoder(precision),
            ModelFile::Decoder(precision),
        ]
    }
}

/// Model loading progress, reported while downloading and building sessions
#[derive(Debug, Clone, PartialEq)]
pub struct LoadProgress {
    /// Overall completion, 0-100
    pub percent: f32,
    /// Human readable step description
    pub message: String,
}

impl LoadProgress {
    pub fn new(percent: f32, message: impl Into<String>) -> Self {
        Self {
            percent: percent.clamp(0.0, 100.0),
            message: message.into(),
        }
    }
}

/// Overall percent for `fraction` of step `step` out of `steps`, scaled into `span`
pub fn overall_percent(step: usize, steps: usize, fraction: f32, span: f32) -> f32 {
    if steps == 0 {
        return span;
    }
    let fraction = fraction.clamp(0.0, 1.0);
    ((step as f32 + fraction) / steps as f32 * span).clamp(0.0, span)
}

/// Model manifest tracking downloaded files
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelManifest {
    pub version: String,
    pub files: Vec<ModelInfo>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelInfo {
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub downloaded_at: u64,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            files: Vec::new(),
        }
    }
}

/// Progress callback for download operations: (downloaded, total)
pub type DownloadProgressCallback<'a> = &'a dyn Fn(u64, Option<u64>);

/// Model manager for downloading and caching model files
pub struct ModelManager {
    models_dir: PathBuf,
    repository_url: String,
}

impl ModelManager {
    /// Create model manager with a directory and download source
    pub fn with_dir(models_dir: PathBuf, repository_url: impl Into<String>) -> Result<Self> {
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("Failed to create models directory {:?}", models_dir))?;
        Ok(Self {
            models_dir,
            repository_url: repository_url.into(),
        })
    }

    /// Get the path to a specific model file
    pub fn model_path(&self, file: ModelFile) -> PathBuf {
        self.models_dir.join(file.filename())
    }

    /// Check if a file is already downloaded
    pub fn is_available(&self, file: ModelFile) -> bool {
        std::fs::metadata(self.model_path(file))
            .map(|m| m.is_file() && m.len() >= file.min_size())
            .unwrap_or(false)
    }

    /// Download a file if not already available, returning its path
    pub fn ensure_file(&self, file: ModelFile, progress: Option<DownloadProgressCallback<'_>>) -> Result<PathBuf> {
        let path = self.model_path(file);

        if self.is_available(file) {
            debug!("{} already available at {:?}", file.display_name(), path);
            return Ok(path);
        }

        self.download_file(file, progress)?;
        Ok(path)
    }

    /// Download a specific file (blocking) with optional progress callback
    fn download_file(&self, file: ModelFile, progress: Option<DownloadProgressCallback<'_>>) -> Result<()> {
        let url = file.download_url(&self.repository_url);
        let path = self.model_path(file);

        info!("Downloading {} from {}", file.display_name(), url);

        if std::env::var("SNAP2LATEX_OFFLINE").is_ok() {
            anyhow::bail!(
                "Offline mode: cannot download models. Please download manually from {} and place at {:?}",
                url,
                path
            );
        }

        let rt = Runtime::new().context("Failed to create tokio runtime")?;
        let hash = rt.block_on(download_to(&url, &path, progress))?;

        if !self.is_available(file) {
            anyhow::bail!("Download of {} completed but the file looks truncated", file.filename());
        }

        self.update_manifest(file, hash)?;

        info!("Successfully downloaded {}", file.display_name());
        Ok(())
    }

    /// Update manifest after successful download
    fn update_manifest(&self, file: ModelFile, sha256: String) -> Result<()> {
        let mut manifest = self.load_manifest().unwrap_or_else(|e| {
            warn!("Ignoring unreadable manifest: {}", e);
            ModelManifest::default()
        });

        let metadata = std::fs::metadata(self.model_path(file))?;
        let model_info = ModelInfo {
            filename: file.filename().to_string(),
            size_bytes: metadata.len(),
            sha256,
            downloaded_at: unix_now(),
        };

        if let Some(existing) = manifest.files.iter_mut().find(|m| m.filename == model_info.filename) {
            *existing = model_info;
        } else {
            manifest.files.push(model_info);
        }

        self.save_manifest(&manifest)
    }

    /// Load the model manifest
    pub fn load_manifest(&self) -> Result<ModelManifest> {
        let manifest_path = self.models_dir.join("manifest.json");
        if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)?;
            let manifest: ModelManifest = serde_json::from_str(&content)?;
            Ok(manifest)
        } else {
            Ok(ModelManifest::default())
        }
    }

    /// Save the model manifest
    pub fn save_manifest(&self, manifest: &ModelManifest) -> Result<()> {
        let manifest_path = self.models_dir.join("manifest.json");
        let content = serde_json::to_string_pretty(manifest)?;
        std::fs::write(manifest_path, content)?;
        Ok(())
    }
}

/// Stream `url` into `path` through a temp file, returning the SHA-256 hex digest
async fn download_to(url: &str, path: &Path, progress: Option<DownloadProgressCallback<'_>>) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(600))
        .build()
        .context("Failed to create HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .context("Failed to send download request")?;

    if !response.status().is_success() {
        anyhow::bail!("Download failed with status {}: {}", response.status(), url);
    }

    let total_size = response.content_length();
    debug!("Download size: {:?} bytes", total_size);

    let temp_path = path.with_extension("part");
    let digest = stream_to_temp(response.bytes_stream(), &temp_path, total_size, progress).await?;

    std::fs::rename(&temp_path, path).context("Failed to move downloaded file to final location")?;

    Ok(digest)
}

/// Write `stream` into `temp_path`, removing the partial file on any failure
async fn stream_to_temp<S, B, E>(
    stream: S,
    temp_path: &Path,
    total_size: Option<u64>,
    progress: Option<DownloadProgressCallback<'_>>,
) -> Result<String>
where
    S: futures_util::Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    let result = write_stream(stream, temp_path, total_size, progress).await;
    if result.is_err() {
        std::fs::remove_file(temp_path).ok();
    }
    result
}

/// Write every chunk of `stream` into `temp_path`, returning the SHA-256 hex digest
async fn write_stream<S, B, E>(
    mut stream: S,
    temp_path: &Path,
    total_size: Option<u64>,
    progress: Option<DownloadProgressCallback<'_>>,
) -> Result<String>
where
    S: futures_util::Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut file = std::fs::File::create(temp_path).context("Failed to create temp file")?;
    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Error reading download stream")?;
        let chunk = chunk.as_ref();

        file.write_all(chunk).context("Failed to write to temp file")?;
        hasher.update(chunk);
        downloaded += chunk.len() as u64;

        if let Some(callback) = progress {
            callback(downloaded, total_size);
        }
    }

    file.flush().context("Failed to flush temp file")?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// ONNX Runtime session wrapper
pub struct OnnxSession {
    session: Session,
    device: &'static str,
}

impl OnnxSession {
    /// Create a session, trying a hardware execution provider first when `use_gpu` is set
    pub fn new(model_path: &Path, intra_threads: usize, use_gpu: bool) -> Result<Self> {
        info!("Loading ONNX model from {:?}", model_path);

        let session_builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads)?;

        let (session_builder, device) = if use_gpu {
            with_gpu_provider(session_builder, intra_threads)?
        } else {
            (session_builder, "cpu")
        };

        let session = session_builder
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load ONNX model {:?}", model_path))?;

        let input_names: Vec<&str> = session.inputs.iter().map(|i| i.name.as_str()).collect();
        let output_names: Vec<&str> = session.outputs.iter().map(|o| o.name.as_str()).collect();
        info!(
            "Model loaded on {}. Inputs: {:?}, Outputs: {:?}",
            device, input_names, output_names
        );

        Ok(Self { session, device })
    }

    /// Get the underlying session mutably for running inference
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Execution device the session runs on
    pub fn device(&self) -> &'static str {
        self.device
    }
}

#[cfg(target_os = "windows")]
fn with_gpu_provider(
    builder: ort::session::builder::SessionBuilder,
    intra_threads: usize,
) -> Result<(ort::session::builder::SessionBuilder, &'static str)> {
    use ort::execution_providers::DirectMLExecutionProvider;
    match builder.with_execution_providers([DirectMLExecutionProvider::default().build()]) {
        Ok(builder) => {
            info!("DirectML GPU acceleration enabled");
            Ok((builder, "directml"))
        }
        Err(e) => {
            warn!("DirectML not available, using CPU: {}", e);
            Ok((cpu_builder(intra_threads)?, "cpu"))
        }
    }
}

#[cfg(target_os = "macos")]
fn with_gpu_provider(
    builder: ort::session::builder::SessionBuilder,
    intra_threads: usize,
) -> Result<(ort::session::builder::SessionBuilder, &'static str)> {
    use ort::execution_providers::CoreMLExecutionProvider;
    match builder.with_execution_providers([CoreMLExecutionProvider::default().build()]) {
        Ok(builder) => {
            info!("CoreML acceleration enabled");
            Ok((builder, "coreml"))
        }
        Err(e) => {
            warn!("CoreML not available, using CPU: {}", e);
            Ok((cpu_builder(intra_threads)?, "cpu"))
        }
    }
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn with_gpu_provider(
    builder: ort::session::builder::SessionBuilder,
    _intra_threads: usize,
) -> Result<(ort::session::builder::SessionBuilder, &'static str)> {
    debug!("No GPU execution provider configured for this platform, using CPU");
    Ok((builder, "cpu"))
}

#[cfg(any(target_os = "windows", target_os = "macos"))]
fn cpu_builder(intra_threads: usize) -> Result<ort::session::builder::SessionBuilder> {
    Ok(Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads)?)
}

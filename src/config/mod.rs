//! Application Configuration
//!
//! User settings stored in TOML format. Every section falls back to its
//! defaults, so a partial (or missing) file is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::vision::Precision;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP inference service settings
    pub server: ServerConfig,
    /// Model loading and generation settings
    pub model: ModelConfig,
    /// Image preprocessing settings
    pub preprocess: PreprocessSettings,
    /// Desktop utility settings
    pub desktop: DesktopConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// HTTP service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the service listens on
    pub bind: SocketAddr,
    /// Reject uploads once this many jobs are waiting (unbounded when unset)
    pub max_queue_depth: Option<usize>,
    /// Maximum number of non-file form fields per upload
    pub max_fields: usize,
    /// Maximum request body size in bytes
    pub max_upload_bytes: usize,
    /// Drop queued jobs whose caller disconnected before inference started
    pub skip_abandoned_jobs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
            max_queue_depth: None,
            max_fields: 2,
            max_upload_bytes: 10 * 1024 * 1024,
            skip_abandoned_jobs: false,
        }
    }
}

/// Special token strings used by the decoder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerTokens {
    pub bos: String,
    pub eos: String,
    pub pad: String,
    pub unk: String,
}

impl Default for MarkerTokens {
    fn default() -> Self {
        Self {
            bos: "<s>".to_string(),
            eos: "</s>".to_string(),
            pad: "<pad>".to_string(),
            unk: "<unk>".to_string(),
        }
    }
}

impl MarkerTokens {
    /// All marker strings, in the order they are stripped
    pub fn all(&self) -> Vec<String> {
        vec![
            self.eos.clone(),
            self.pad.clone(),
            self.bos.clone(),
            self.unk.clone(),
        ]
    }
}

/// Model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL the model files are downloaded from
    pub repository_url: String,
    /// Local model directory (defaults to `<data dir>/models`)
    pub models_dir: Option<PathBuf>,
    /// Weight precision to load at startup
    pub precision: Precision,
    /// Try a hardware execution provider before falling back to CPU
    pub use_gpu: bool,
    /// ONNX Runtime intra-op threads
    pub intra_threads: usize,
    /// Beam width (1 = greedy)
    pub num_beams: usize,
    /// Maximum decoded sequence length, including the start token
    pub max_length: usize,
    /// Decoder marker tokens
    pub tokens: MarkerTokens,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            repository_url: "https://huggingface.co/Norm/nougat-latex-base/resolve/main".to_string(),
            models_dir: None,
            precision: Precision::Standard,
            use_gpu: true,
            intra_threads: 4,
            num_beams: 5,
            max_length: 800,
            tokens: MarkerTokens::default(),
        }
    }
}

/// Image preprocessing settings (Nougat image processor defaults)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessSettings {
    /// Model input height
    pub height: u32,
    /// Model input width
    pub width: u32,
    /// Crop uniform margins before resizing
    pub crop_margin: bool,
    /// Mean values for normalization [R, G, B]
    pub mean: [f32; 3],
    /// Std values for normalization [R, G, B]
    pub std: [f32; 3],
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            height: 224,
            width: 560,
            crop_margin: true,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }
}

/// Desktop utility settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DesktopConfig {
    /// Interactive capture command; `{path}` is replaced by the output PNG path
    pub capture_command: Vec<String>,
    /// Send captures to a running service instead of loading the model locally
    pub server_url: Option<String>,
    /// Release metadata endpoint used by "Check for Updates"
    pub update_url: String,
    /// Page opened when an update is available
    pub releases_url: String,
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            capture_command: default_capture_command(),
            server_url: None,
            update_url: "https://api.github.com/repos/snap2latex/snap2latex/releases/latest".to_string(),
            releases_url: "https://github.com/snap2latex/snap2latex/releases".to_string(),
        }
    }
}

fn default_capture_command() -> Vec<String> {
    // Windows has no stock tool that writes a region capture to a file
    let parts: &[&str] = if cfg!(target_os = "macos") {
        &["screencapture", "-i", "-Jselection", "{path}"]
    } else if cfg!(target_os = "windows") {
        &[]
    } else {
        &["gnome-screenshot", "-a", "-f", "{path}"]
    };
    parts.iter().map(|s| s.to_string()).collect()
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset (e.g. "info", "snap2latex=debug")
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {:?}", path))?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        assert_eq!(config.server.bind.port(), 8000);
        assert!(config.server.max_queue_depth.is_none());
        assert_eq!(config.server.max_fields, 2);
        assert!(!config.server.skip_abandoned_jobs);

        assert_eq!(config.model.precision, Precision::Standard);
        assert_eq!(config.model.num_beams, 5);
        assert_eq!(config.model.tokens.bos, "<s>");

        assert_eq!(config.preprocess.height, 224);
        assert_eq!(config.preprocess.width, 560);

        assert!(config.desktop.server_url.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = AppConfig::default();
        config.server.max_queue_depth = Some(32);
        config.model.precision = Precision::Reduced;
        config.desktop.server_url = Some("http://localhost:8000".to_string());

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.server.max_queue_depth, Some(32));
        assert_eq!(parsed.model.precision, Precision::Reduced);
        assert_eq!(parsed.desktop.server_url.as_deref(), Some("http://localhost:8000"));
        assert_eq!(parsed.preprocess.mean, config.preprocess.mean);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [server]
            bind = "0.0.0.0:9000"

            [model]
            num_beams = 1
            "#,
        )
        .unwrap();

        assert_eq!(parsed.server.bind.port(), 9000);
        assert_eq!(parsed.server.max_fields, 2);
        assert_eq!(parsed.model.num_beams, 1);
        assert_eq!(parsed.model.max_length, 800);
        assert_eq!(parsed.model.tokens.eos, "</s>");
    }

    #[test]
    fn test_save_and_load_config() {
        let config = AppConfig::default();
        let temp_file = NamedTempFile::new().unwrap();

        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert_eq!(config.server.bind, loaded.server.bind);
        assert_eq!(config.desktop.capture_command, loaded.desktop.capture_command);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_marker_tokens_all() {
        let tokens = MarkerTokens::default();
        let all = tokens.all();
        assert_eq!(all.len(), 4);
        assert!(all.contains(&"<unk>".to_string()));
    }
}

//! Interactive screen region capture
//!
//! Runs the platform's region-selection tool, which writes a PNG into a fresh
//! temporary directory. The directory is removed when the session is dropped,
//! whatever the outcome.

use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;
use thiserror::Error;
use tracing::debug;

/// Placeholder in the capture command replaced by the output file path
pub const PATH_PLACEHOLDER: &str = "{path}";

const CAPTURE_FILE: &str = "capture.png";

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no screen capture command configured (set desktop.capture_command)")]
    NotConfigured,
    #[error("failed to prepare capture directory: {0}")]
    TempDir(#[source] std::io::Error),
    #[error("failed to start capture tool {program:?}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("capture tool exited with {0}")]
    ToolFailed(std::process::ExitStatus),
    #[error("capture cancelled")]
    Cancelled,
    #[error("failed to read captured image: {0}")]
    Read(#[source] std::io::Error),
}

/// One capture attempt and the temporary directory it writes into
pub struct CaptureSession {
    _dir: TempDir,
    file: PathBuf,
}

impl CaptureSession {
    pub fn new() -> Result<Self, CaptureError> {
        let dir = tempfile::Builder::new()
            .suffix("image2latex")
            .tempdir()
            .map_err(CaptureError::TempDir)?;
        let file = dir.path().join(CAPTURE_FILE);
        Ok(Self { _dir: dir, file })
    }

    /// Directory removed when the session is dropped
    #[cfg(test)]
    pub fn dir(&self) -> &std::path::Path {
        self._dir.path()
    }

    /// Where the capture tool is told to write
    #[cfg(test)]
    pub fn file(&self) -> &std::path::Path {
        &self.file
    }

    /// Run `command` (with `{path}` substituted) and return the PNG bytes.
    ///
    /// A tool that exits cleanly without writing the file means the user
    /// aborted the selection.
    pub fn run(&self, command: &[String]) -> Result<Vec<u8>, CaptureError> {
        let (program, args) = command.split_first().ok_or(CaptureError::NotConfigured)?;
        if program.trim().is_empty() {
            return Err(CaptureError::NotConfigured);
        }

        let path = self.file.to_string_lossy();
        let args: Vec<String> = args.iter().map(|a| a.replace(PATH_PLACEHOLDER, &path)).collect();
        debug!("Running capture tool: {} {:?}", program, args);

        let status = Command::new(program)
            .args(&args)
            .status()
            .map_err(|source| CaptureError::SpawnFailed {
                program: program.clone(),
                source,
            })?;

        if !status.success() {
            return Err(CaptureError::ToolFailed(status));
        }

        match std::fs::read(&self.file) {
            Ok(bytes) if !bytes.is_empty() => Ok(bytes),
            Ok(_) => Err(CaptureError::Cancelled),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CaptureError::Cancelled),
            Err(e) => Err(CaptureError::Read(e)),
        }
    }
}

/// Capture a region with a fresh session; the temporary files are gone on return
pub fn capture_region(command: &[String]) -> Result<Vec<u8>, CaptureError> {
    let session = CaptureSession::new()?;
    session.run(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_empty_command_is_not_configured() {
        let session = CaptureSession::new().unwrap();
        assert!(matches!(session.run(&[]), Err(CaptureError::NotConfigured)));
        assert!(matches!(session.run(&[String::new()]), Err(CaptureError::NotConfigured)));
    }

    #[test]
    fn test_missing_program_fails_to_spawn() {
        let session = CaptureSession::new().unwrap();
        let command = vec!["snap2latex-no-such-capture-tool".to_string()];
        assert!(matches!(session.run(&command), Err(CaptureError::SpawnFailed { .. })));
    }

    #[test]
    fn test_directory_removed_after_drop() {
        let session = CaptureSession::new().unwrap();
        let dir = session.dir().to_path_buf();
        assert!(dir.exists());
        assert!(dir.to_string_lossy().ends_with("image2latex"));
        drop(session);
        assert!(!dir.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_successful_capture_is_cleaned_up() {
        let session = CaptureSession::new().unwrap();
        let dir = session.dir().to_path_buf();
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "printf png > \"$0\"".to_string(),
            PATH_PLACEHOLDER.to_string(),
        ];

        let bytes = session.run(&command).unwrap();
        assert_eq!(bytes, b"png");
        assert!(session.file().exists());

        drop(session);
        assert!(!dir.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_tool_failure_is_cleaned_up() {
        let session = CaptureSession::new().unwrap();
        let dir = session.dir().to_path_buf();
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "printf partial > \"$0\"; exit 3".to_string(),
            PATH_PLACEHOLDER.to_string(),
        ];

        assert!(matches!(session.run(&command), Err(CaptureError::ToolFailed(_))));
        drop(session);
        assert!(!dir.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_aborted_selection_is_cancelled() {
        let session = CaptureSession::new().unwrap();
        let dir = session.dir().to_path_buf();

        assert!(matches!(session.run(&sh("exit 0")), Err(CaptureError::Cancelled)));
        drop(session);
        assert!(!dir.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_capture_region_returns_bytes() {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "printf abc > \"$0\"".to_string(),
            PATH_PLACEHOLDER.to_string(),
        ];
        assert_eq!(capture_region(&command).unwrap(), b"abc");
    }
}

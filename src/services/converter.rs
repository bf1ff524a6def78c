//! # Converter
//!
//! [`CommandConverter`] drives a headless office suite (LibreOffice by
//! default), one process per attempt:
//!
//! ```text
//! libreoffice --headless -env:UserInstallation=file:///tmp/lo_{job}_{unit} \
//!     --convert-to pdf <source> --outdir <work_dir>/<job>/output
//! ```
//!
//! Each unit gets its own user profile so concurrent conversions do not
//! contend on the profile lock. The child is spawned with `kill_on_drop`, so
//! the caller's timeout terminates it.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use crate::config::StorageConfig;

/// Location of a converted output
pub type OutputRef = String;

/// Longest stderr excerpt carried in a [`ConversionError`]
const STDERR_EXCERPT_LIMIT: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub job_id: Uuid,
    pub unit_id: Uuid,
    pub source_ref: String,
    /// 1-based attempt number
    pub attempt: u32,
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Failed to start converter '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Converter exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("Conversion timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Converter panicked: {0}")]
    Panicked(String),

    #[error("Converter reported success but produced no output at {expected}")]
    MissingOutput { expected: String },

    #[error("I/O error during conversion: {0}")]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait Converter: Send + Sync + 'static {
    async fn convert(&self, request: &ConversionRequest) -> Result<OutputRef, ConversionError>;
}

#[derive(Debug, Clone)]
pub struct CommandConverter {
    program: String,
    output_format: String,
    work_dir: PathBuf,
}

impl CommandConverter {
    pub fn new(
        program: impl Into<String>,
        output_format: impl Into<String>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            output_format: output_format.into(),
            work_dir: work_dir.into(),
        }
    }

    pub fn from_config(storage: &StorageConfig) -> Self {
        Self::new(
            &storage.converter_program,
            &storage.output_format,
            &storage.work_dir,
        )
    }

    /// Each unit converts into its own directory, so members that share a
    /// file stem (`report.docx`, `report.DOCX`) never overwrite each other
    pub fn output_dir(&self, job_id: Uuid, unit_id: Uuid) -> PathBuf {
        self.work_dir
            .join(job_id.to_string())
            .join("output")
            .join(unit_id.to_string())
    }

    fn expected_output(&self, source_ref: &str, output_dir: &Path) -> PathBuf {
        let stem = Path::new(source_ref)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| source_ref.to_string());
        output_dir.join(format!("{stem}.{}", self.output_format))
    }

    fn build_command(&self, request: &ConversionRequest, output_dir: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--headless")
            .arg(format!(
                "-env:UserInstallation=file:///tmp/lo_{}_{}",
                request.job_id, request.unit_id
            ))
            .arg("--convert-to")
            .arg(&self.output_format)
            .arg(&request.source_ref)
            .arg("--outdir")
            .arg(output_dir)
            .env("HOME", "/tmp")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

fn excerpt(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if trimmed.len() <= STDERR_EXCERPT_LIMIT {
        return trimmed.to_string();
    }
    let mut cut = STDERR_EXCERPT_LIMIT;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &trimmed[..cut])
}

#[async_trait]
impl Converter for CommandConverter {
    async fn convert(&self, request: &ConversionRequest) -> Result<OutputRef, ConversionError> {
        let output_dir = self.output_dir(request.job_id, request.unit_id);
        tokio::fs::create_dir_all(&output_dir).await?;

        debug!(
            job_id = %request.job_id,
            unit_id = %request.unit_id,
            attempt = request.attempt,
            program = %self.program,
            "Starting conversion"
        );

        let output = self
            .build_command(request, &output_dir)
            .output()
            .await
            .map_err(|source| ConversionError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ConversionError::CommandFailed {
                status: output.status.to_string(),
                stderr: excerpt(&output.stderr),
            });
        }

        let expected = self.expected_output(&request.source_ref, &output_dir);
        if !tokio::fs::try_exists(&expected).await? {
            return Err(ConversionError::MissingOutput {
                expected: expected.display().to_string(),
            });
        }

        Ok(expected.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(source_ref: &str) -> ConversionRequest {
        ConversionRequest {
            job_id: Uuid::new_v4(),
            unit_id: Uuid::new_v4(),
            source_ref: source_ref.to_string(),
            attempt: 1,
        }
    }

    #[test]
    fn test_expected_output_swaps_extension() {
        let converter = CommandConverter::new("libreoffice", "pdf", "/work");
        let path = converter.expected_output("/work/j/input/report.docx", Path::new("/work/j/output"));
        assert_eq!(path, PathBuf::from("/work/j/output/report.pdf"));
    }

    #[test]
    fn test_members_sharing_a_stem_get_distinct_outputs() {
        let converter = CommandConverter::new("libreoffice", "pdf", "/work");
        let job_id = Uuid::new_v4();
        let lower = request("/work/j/input/report.docx");
        let upper = request("/work/j/input/report.DOCX");

        let lower_out = converter.expected_output(
            &lower.source_ref,
            &converter.output_dir(job_id, lower.unit_id),
        );
        let upper_out = converter.expected_output(
            &upper.source_ref,
            &converter.output_dir(job_id, upper.unit_id),
        );

        assert_ne!(lower_out, upper_out);
        assert_eq!(lower_out.file_name(), upper_out.file_name());
        assert!(lower_out.starts_with(format!("/work/{job_id}/output/{}", lower.unit_id)));
    }

    #[test]
    fn test_stderr_excerpt_is_bounded() {
        let long = "x".repeat(STDERR_EXCERPT_LIMIT * 2);
        let text = excerpt(long.as_bytes());
        assert!(text.len() <= STDERR_EXCERPT_LIMIT + 3);
        assert!(text.ends_with("..."));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let converter = CommandConverter::new("docbatch-no-such-converter", "pdf", dir.path());
        let err = converter.convert(&request("/tmp/a.docx")).await.unwrap_err();
        assert!(matches!(err, ConversionError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_command_failure() {
        let dir = TempDir::new().unwrap();
        let converter = CommandConverter::new("false", "pdf", dir.path());
        let err = converter.convert(&request("/tmp/a.docx")).await.unwrap_err();
        assert!(matches!(err, ConversionError::CommandFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_without_output_is_missing_output() {
        let dir = TempDir::new().unwrap();
        let converter = CommandConverter::new("true", "pdf", dir.path());
        let err = converter.convert(&request("/tmp/a.docx")).await.unwrap_err();
        assert!(matches!(err, ConversionError::MissingOutput { .. }));
    }
}

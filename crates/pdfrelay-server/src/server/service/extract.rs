//! The text extraction step run by workers.

use pdfrelay_core::{Error, Result};
use std::{path::Path, process::Stdio};
use tokio::process::Command;

/// Turns the file at `input` into text written to `output`.
#[tonic::async_trait]
pub trait Extractor: Send + Sync + 'static {
    async fn extract(&self, input: &Path, output: &Path) -> Result<()>;
}

/// Runs `<program> [args...] <input> <output>` as a child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
}

impl CommandExtractor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Default for CommandExtractor {
    fn default() -> Self {
        Self::new("pdftotext", Vec::new())
    }
}

#[tonic::async_trait]
impl Extractor for CommandExtractor {
    async fn extract(&self, input: &Path, output: &Path) -> Result<()> {
        let out = Command::new(&self.program)
            .args(&self.args)
            .arg(input)
            .arg(output)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Extraction {
                reason: format!("failed to run {}: {e}", self.program),
            })?;

        if out.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        Err(Error::Extraction {
            reason: format!("{} exited with {}: {}", self.program, out.status, stderr.trim()),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_program_with_paths() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.pdf");
        let output = dir.path().join("out.txt");
        tokio::fs::write(&input, b"hello").await.unwrap();

        CommandExtractor::new("cp", Vec::new())
            .extract(&input, &output)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&output).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn failing_program_is_extraction_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommandExtractor::new("false", Vec::new())
            .extract(&dir.path().join("a"), &dir.path().join("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Extraction { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_extraction_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommandExtractor::new("/nonexistent/pdftotext", Vec::new())
            .extract(&dir.path().join("a"), &dir.path().join("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Extraction { reason } if reason.starts_with("failed to run")));
    }
}

//! Staging directories for files that are between two hops.
//!
//! The dispatcher writes client uploads to `<root>/incoming` and worker
//! results to `<root>/outgoing`. Names embed the job id so concurrent calls
//! never share a file.

use pdfrelay_core::{Error, JobId, Result};
use std::path::{Path, PathBuf};

const FILE_PREFIX: &str = "pdftotext";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingDirs {
    pub incoming: PathBuf,
    pub outgoing: PathBuf,
}

impl StagingDirs {
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            incoming: root.join("incoming"),
            outgoing: root.join("outgoing"),
        }
    }

    /// Creates both directories if they are missing.
    pub async fn create(&self) -> Result<()> {
        for dir in [&self.incoming, &self.outgoing] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                Error::io(format!("failed to create staging dir {}", dir.display()), &e)
            })?;
        }
        Ok(())
    }

    pub fn upload_path(&self, id: &JobId) -> PathBuf {
        upload_path(&self.incoming, id)
    }

    pub fn result_path(&self, id: &JobId) -> PathBuf {
        result_path(&self.outgoing, id)
    }
}

/// `<dir>/pdftotext<id>.pdf`
pub fn upload_path(dir: &Path, id: &JobId) -> PathBuf {
    dir.join(format!("{FILE_PREFIX}{id}.pdf"))
}

/// `<dir>/pdftotext<id>.txt`
pub fn result_path(dir: &Path, id: &JobId) -> PathBuf {
    dir.join(format!("{FILE_PREFIX}{id}.txt"))
}

/// Removes a staged file. A file that is already gone counts as removed.
pub async fn remove_staged(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::cleanup(path, &e)),
    }
}

/// Best-effort [`remove_staged`] for exit paths that already carry a result.
pub async fn discard(path: &Path) {
    if let Err(e) = remove_staged(path).await {
        tracing::warn!("{e}");
    }
}

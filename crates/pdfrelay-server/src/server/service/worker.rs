//! Worker-side `TextWorker` service.
//!
//! One call handles one file: the upload is staged, the extractor writes the
//! text next to it, and the whole text goes back in a single reply. Both
//! staged files are removed before the reply is sent, whatever the outcome.

use super::extract::Extractor;
use crate::server::{
    staging::{discard, result_path, upload_path},
    telemetry::{increment_call_errors, increment_requests, record_bytes_uploaded},
};
use bytes::Bytes;
use pdfrelay_core::{
    Error, JobId, Result,
    proto::{Chunk, TextAndStatus, text_worker_server::TextWorker},
    transfer::{ChunkSource, receive_file},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

#[derive(Clone)]
pub struct WorkerService {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    staging_dir: PathBuf,
    extractor: Arc<dyn Extractor>,
    shutdown: CancellationToken,
}

impl WorkerService {
    /// Creates the staging directory and the service around `extractor`.
    pub async fn new(staging_dir: PathBuf, extractor: Arc<dyn Extractor>) -> Result<Self> {
        tokio::fs::create_dir_all(&staging_dir).await.map_err(|e| {
            Error::io(
                format!("failed to create staging dir {}", staging_dir.display()),
                &e,
            )
        })?;
        Ok(Self {
            inner: Arc::new(WorkerInner {
                staging_dir,
                extractor,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn staging_dir(&self) -> &Path {
        &self.inner.staging_dir
    }

    /// Receives one file from `source` and returns its extracted text.
    pub async fn process_upload<S>(&self, source: &mut S) -> Result<Bytes>
    where
        S: ChunkSource + ?Sized,
    {
        let id = JobId::mint();
        let input = upload_path(&self.inner.staging_dir, &id);
        let output = result_path(&self.inner.staging_dir, &id);

        let text = self.extract_staged(source, &input, &output).await;
        discard(&input).await;
        discard(&output).await;
        text
    }

    async fn extract_staged<S>(&self, source: &mut S, input: &Path, output: &Path) -> Result<Bytes>
    where
        S: ChunkSource + ?Sized,
    {
        let received = receive_file(source, input).await?;
        record_bytes_uploaded(received.stats.bytes);

        self.inner.extractor.extract(input, output).await?;

        tokio::fs::read(output)
            .await
            .map(Bytes::from)
            .map_err(|e| Error::Extraction {
                reason: format!("failed to read extracted text {}: {e}", output.display()),
            })
    }

    /// Rejects further calls. In-flight calls run to completion.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

#[tonic::async_trait]
impl TextWorker for WorkerService {
    #[tracing::instrument(skip_all)]
    async fn process(
        &self,
        request: Request<Streaming<Chunk>>,
    ) -> core::result::Result<Response<TextAndStatus>, Status> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ServiceShutdown.into());
        }
        increment_requests("Process");

        let mut stream = request.into_inner();
        let reply = match self.process_upload(&mut stream).await {
            Ok(text) => {
                tracing::debug!(bytes = text.len(), "text extracted");
                TextAndStatus::ok("File received with success", text)
            }
            Err(e) => {
                increment_call_errors("Process");
                tracing::warn!("extraction call failed: {e}");
                TextAndStatus::error(e.to_string())
            }
        };
        Ok(Response::new(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct Upper;

    #[tonic::async_trait]
    impl Extractor for Upper {
        async fn extract(&self, input: &Path, output: &Path) -> Result<()> {
            let text = tokio::fs::read(input).await.unwrap().to_ascii_uppercase();
            tokio::fs::write(output, text).await.unwrap();
            Ok(())
        }
    }

    struct Broken;

    #[tonic::async_trait]
    impl Extractor for Broken {
        async fn extract(&self, _input: &Path, _output: &Path) -> Result<()> {
            Err(Error::Extraction {
                reason: "pdftotext exited with 1".into(),
            })
        }
    }

    async fn upload(service: &WorkerService, parts: &[&'static [u8]]) -> Result<Bytes> {
        let (tx, mut rx) = mpsc::channel(parts.len().max(1));
        for part in parts {
            tx.send(Chunk {
                content: Bytes::from_static(part),
            })
            .await
            .unwrap();
        }
        drop(tx);
        service.process_upload(&mut rx).await
    }

    async fn is_empty(dir: &Path) -> bool {
        let mut entries = tokio::fs::read_dir(dir).await.unwrap();
        entries.next_entry().await.unwrap().is_none()
    }

    #[tokio::test]
    async fn returns_text_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let service = WorkerService::new(dir.path().join("worker"), Arc::new(Upper))
            .await
            .unwrap();

        let text = upload(&service, &[b"hello ", b"world"]).await.unwrap();

        assert_eq!(text, Bytes::from_static(b"HELLO WORLD"));
        assert!(is_empty(service.staging_dir()).await);
    }

    #[tokio::test]
    async fn extraction_failure_still_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let service = WorkerService::new(dir.path().to_path_buf(), Arc::new(Broken))
            .await
            .unwrap();

        let err = upload(&service, &[b"%PDF"]).await.unwrap_err();

        assert!(matches!(err, Error::Extraction { .. }));
        assert!(is_empty(service.staging_dir()).await);
    }
}

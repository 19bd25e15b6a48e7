//! Client stub for one worker endpoint.

use bytes::Bytes;
use pdfrelay_core::{
    ChunkSize, Error, Result,
    channel::ConnectOptions,
    proto::{TextAndStatus, text_worker_client::TextWorkerClient},
    transfer::upload,
};
use portable_atomic::{AtomicUsize, Ordering};
use std::path::{Path, PathBuf};
use tonic::{codec::CompressionEncoding, transport::Channel};

/// Static description of a worker, fixed at dispatcher startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEndpoint {
    pub connect: ConnectOptions,
    /// Fragment size used when forwarding uploads to this worker.
    pub chunk_size: ChunkSize,
}

/// A connected worker plus its in-flight call counter.
///
/// The underlying channel connects lazily, so an unreachable worker surfaces
/// as a transport error on the call routed to it rather than at startup.
#[derive(Debug)]
pub struct WorkerProxy {
    index: usize,
    endpoint: WorkerEndpoint,
    client: TextWorkerClient<Channel>,
    inflight: AtomicUsize,
}

impl WorkerProxy {
    pub async fn connect(
        index: usize,
        endpoint: WorkerEndpoint,
        max_message_size: usize,
    ) -> Result<Self> {
        let channel = endpoint.connect.connect_lazy().await?;
        let mut client = TextWorkerClient::new(channel)
            .max_decoding_message_size(max_message_size)
            .max_encoding_message_size(max_message_size)
            .accept_compressed(CompressionEncoding::Gzip);
        if let Some(encoding) = endpoint.connect.compression() {
            client = client.send_compressed(encoding);
        }

        Ok(Self {
            index,
            endpoint,
            client,
            inflight: AtomicUsize::new(0),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn address(&self) -> &str {
        &self.endpoint.connect.address
    }

    /// Calls currently routed to this worker.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub(crate) fn track(&self) -> InflightGuard<'_> {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        InflightGuard {
            inflight: &self.inflight,
        }
    }

    /// Streams `path` to the worker and returns the extracted text.
    ///
    /// The source file is left in place.
    ///
    /// # Errors
    ///
    /// The local read error, a transport failure, or the worker's error reply
    /// as [`Error::Remote`]. Remote and transport errors are prefixed with the
    /// worker address.
    pub async fn extract(&self, path: &Path) -> Result<Bytes> {
        let _inflight = self.track();
        let mut client = self.client.clone();

        upload(path, self.endpoint.chunk_size, |stream| async move {
            client.process(stream).await
        })
        .await
        .and_then(TextAndStatus::into_text)
        .map_err(|e| e.from_hop(&format!("worker {}", self.address())))
    }

    /// Like [`extract`](Self::extract), but stores the text as
    /// `<outgoing>/<upload stem>.txt` and returns that path.
    pub async fn forward(&self, upload: &Path, outgoing: &Path) -> Result<PathBuf> {
        let stem = upload.file_stem().ok_or_else(|| Error::Io {
            context: format!("upload path {} has no file name", upload.display()),
        })?;
        let result = outgoing.join(format!("{}.txt", stem.to_string_lossy()));

        let text = self.extract(upload).await?;
        tokio::fs::write(&result, &text).await.map_err(|e| {
            Error::io(format!("failed to write result {}", result.display()), &e)
        })?;

        tracing::debug!(
            worker = self.address(),
            result = %result.display(),
            bytes = text.len(),
            "forward complete"
        );
        Ok(result)
    }
}

/// Decrements the owning proxy's in-flight counter on drop.
#[derive(Debug)]
pub(crate) struct InflightGuard<'a> {
    inflight: &'a AtomicUsize,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

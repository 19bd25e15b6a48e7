#![doc = include_str!("../README.md")]

use pdfrelay_core::{
    ChunkSize, Error, JobId, Result,
    channel::ConnectOptions,
    proto::{
        IdAndStatus, JobRequest, JobStatusReply, TextAndStatus,
        text_dispatcher_client::TextDispatcherClient,
    },
    transfer::{receive_file, upload},
};
use std::path::{Path, PathBuf};
use tonic::{Code, Status, codec::CompressionEncoding, transport::Channel};

/// Settings for [`FrontEndClient::connect`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect: ConnectOptions,
    pub chunk_size: ChunkSize,
    /// Directory for result files named by [`FrontEndClient::result_path`].
    pub txt_dir: PathBuf,
    pub max_message_size: usize,
}

/// Client for the dispatcher's synchronous and two-phase asynchronous calls.
///
/// Cloning is cheap and clones share the underlying connection.
#[derive(Debug, Clone)]
pub struct FrontEndClient {
    client: TextDispatcherClient<Channel>,
    chunk_size: ChunkSize,
    txt_dir: PathBuf,
}

impl FrontEndClient {
    /// Connects to the dispatcher, failing if it is unreachable.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let channel = config.connect.connect().await?;
        let mut client = TextDispatcherClient::new(channel)
            .max_decoding_message_size(config.max_message_size)
            .max_encoding_message_size(config.max_message_size)
            .accept_compressed(CompressionEncoding::Gzip);
        if let Some(encoding) = config.connect.compression() {
            client = client.send_compressed(encoding);
        }

        Ok(Self {
            client,
            chunk_size: config.chunk_size,
            txt_dir: config.txt_dir,
        })
    }

    /// `<txt_dir>/<file stem><call>.txt`
    pub fn result_path(&self, file: &Path, call: usize) -> PathBuf {
        let stem = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.txt_dir.join(format!("{stem}{call}.txt"))
    }

    /// Uploads `file`, waits for its text and writes it to `out`.
    pub async fn process_sync(&self, file: &Path, out: &Path) -> Result<PathBuf> {
        let mut client = self.client.clone();
        let reply: TextAndStatus = upload(file, self.chunk_size, |stream| async move {
            client.process_sync(stream).await
        })
        .await?;
        let text = reply.into_text().map_err(|e| e.from_hop("dispatcher"))?;

        tokio::fs::write(out, &text)
            .await
            .map_err(|e| Error::io(format!("failed to write {}", out.display()), &e))?;
        tracing::debug!(file = %file.display(), out = %out.display(), "text received");
        Ok(out.to_path_buf())
    }

    /// Uploads `file` and returns the id to fetch its text with.
    pub async fn submit(&self, file: &Path) -> Result<JobId> {
        let mut client = self.client.clone();
        let reply: IdAndStatus = upload(file, self.chunk_size, |stream| async move {
            client.submit(stream).await
        })
        .await?;
        let id = reply.into_job_id().map_err(|e| e.from_hop("dispatcher"))?;
        tracing::debug!(job_id = %id, file = %file.display(), "job submitted");
        Ok(id)
    }

    /// Waits for job `id` and writes its text to `out`.
    ///
    /// A job can be fetched once. On failure any partially written `out` is
    /// removed and the job stays on the dispatcher.
    pub async fn fetch(&self, id: &JobId, out: &Path) -> Result<PathBuf> {
        let mut client = self.client.clone();
        let mut stream = client
            .fetch(JobRequest {
                job_id: id.to_string(),
            })
            .await
            .map_err(|status| job_error(id, &status))?
            .into_inner();

        match receive_file(&mut stream, out).await {
            Ok(received) => {
                tracing::debug!(
                    job_id = %id,
                    out = %out.display(),
                    chunks = received.stats.chunks,
                    bytes = received.stats.bytes,
                    "text received"
                );
                Ok(received.path)
            }
            Err(e) => {
                remove_partial(out).await;
                Err(e.from_hop("dispatcher"))
            }
        }
    }

    /// Current state of job `id`, without waiting or consuming it.
    pub async fn status(&self, id: &JobId) -> Result<JobStatusReply> {
        let mut client = self.client.clone();
        client
            .job_status(JobRequest {
                job_id: id.to_string(),
            })
            .await
            .map(tonic::Response::into_inner)
            .map_err(|status| job_error(id, &status))
    }

    /// [`submit`](Self::submit) followed by [`fetch`](Self::fetch).
    pub async fn process_async(&self, file: &Path, out: &Path) -> Result<PathBuf> {
        let id = self.submit(file).await?;
        self.fetch(&id, out).await
    }
}

async fn remove_partial(out: &Path) {
    match tokio::fs::remove_file(out).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("failed to remove partial result {}: {e}", out.display()),
    }
}

/// Maps a job-scoped call status back onto [`Error`].
fn job_error(id: &JobId, status: &Status) -> Error {
    match status.code() {
        Code::NotFound => Error::UnknownJob { id: id.to_string() },
        Code::DeadlineExceeded => Error::Timeout { id: id.to_string() },
        Code::Unavailable => Error::Transport {
            context: format!("dispatcher: {}", status.message()),
        },
        _ => Error::Remote {
            message: format!("dispatcher: {}", status.message()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_errors_follow_status_code() {
        let id = JobId::from("abc");
        assert_eq!(
            job_error(&id, &Status::not_found("Unknown job abc")),
            Error::UnknownJob { id: "abc".into() }
        );
        assert_eq!(
            job_error(&id, &Status::deadline_exceeded("slow")),
            Error::Timeout { id: "abc".into() }
        );
        assert_eq!(
            job_error(&id, &Status::internal("Job abc failed: bad pdf")),
            Error::Remote {
                message: "dispatcher: Job abc failed: bad pdf".into()
            }
        );
    }

    #[tokio::test]
    async fn result_path_uses_stem_and_call_number() {
        let client = FrontEndClient {
            client: TextDispatcherClient::new(
                ConnectOptions::plaintext("127.0.0.1:1")
                    .connect_lazy()
                    .await
                    .unwrap(),
            ),
            chunk_size: ChunkSize::default(),
            txt_dir: PathBuf::from("./out"),
        };
        assert_eq!(
            client.result_path(Path::new("/data/report.pdf"), 3),
            PathBuf::from("./out/report3.txt")
        );
    }
}

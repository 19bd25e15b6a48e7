//! Client-facing `TextDispatcher` service.
//!
//! [`DispatchService`] accepts uploads from front-end clients and routes each
//! one to a worker chosen by the [`WorkerPool`]. It offers two modes:
//!
//! - `ProcessSync` forwards the upload and waits for the text.
//! - `Submit` registers a job, starts the forward as a background task and
//!   replies with the job id at once. `Fetch` later waits for that job and
//!   streams its text back. `JobStatus` reports progress without waiting.
//!
//! ## Ownership of staged files
//!
//! - An upload belongs to the call that received it. For `Submit` it is
//!   handed to the background forward, which removes it when done.
//! - A result file belongs to its job record. A `Fetch` claims the record,
//!   and only once every chunk has been sent are the file and the record
//!   removed. If the stream breaks first, the claim is released and the job
//!   can be fetched again. The reaper removes unclaimed results on eviction.
//!
//! ## Shutdown
//!
//! [`DispatchService::shutdown`] rejects new `ProcessSync`, `Submit` and
//! `Fetch` calls, stops the reaper, and waits for background forwards and
//! result streams up to the configured timeout. Forwards are never cancelled.

use crate::server::{
    config::DispatcherConfig,
    jobs::{
        reaper::reap_expired,
        table::{ClaimedResult, JobHandle, JobTable},
    },
    pool::{manager::WorkerPool, proxy::WorkerProxy},
    staging::{StagingDirs, discard, remove_staged},
    telemetry::{
        decrement_jobs_pending, increment_call_errors, increment_jobs_pending, increment_requests,
        record_bytes_uploaded, record_forward_duration,
    },
};
use bytes::Bytes;
use core::{pin::Pin, time::Duration};
use pdfrelay_core::{
    ChunkSize, Error, JobId, Result,
    proto::{
        Chunk, IdAndStatus, JobRequest, JobStatusReply, TextAndStatus,
        text_dispatcher_server::TextDispatcher,
    },
    transfer::{ChunkSource, UPLOAD_BUFFER_SIZE, receive_file, send_file},
};
use std::{path::PathBuf, sync::Arc, time::Instant};
use tokio::sync::mpsc;
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tonic::{Request, Response, Status, Streaming};
use tracing::Instrument;

#[derive(Clone)]
pub struct DispatchService {
    inner: Arc<Dispatcher>,
}

#[derive(Debug)]
struct Dispatcher {
    pool: WorkerPool,
    jobs: Arc<JobTable>,
    staging: StagingDirs,
    chunk_size: ChunkSize,
    fetch_timeout: Option<Duration>,
    shutdown_timeout: Duration,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl DispatchService {
    /// Prepares the staging directories, connects the worker pool and starts
    /// the job reaper when a TTL is configured.
    pub async fn new(config: DispatcherConfig) -> Result<Self> {
        let staging = StagingDirs::under(&config.staging_dir);
        staging.create().await?;

        let pool = WorkerPool::connect(
            &config.workers,
            config.selection,
            config.listen.max_message_size,
        )
        .await?;

        let jobs = Arc::new(JobTable::default());
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        if let Some(ttl) = config.job_ttl {
            tasks.spawn(reap_expired(
                Arc::clone(&jobs),
                ttl,
                config.reap_interval,
                shutdown.child_token(),
            ));
        }

        Ok(Self {
            inner: Arc::new(Dispatcher {
                pool,
                jobs,
                staging,
                chunk_size: config.chunk_size,
                fetch_timeout: config.fetch_timeout,
                shutdown_timeout: config.listen.shutdown_timeout,
                shutdown,
                tasks,
            }),
        })
    }

    /// Stops accepting work and drains background tasks.
    pub async fn shutdown(&self) {
        tracing::info!("refusing new requests");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();

        tracing::info!(
            pending = self.inner.tasks.len(),
            "draining background tasks"
        );
        match tokio::time::timeout(self.inner.shutdown_timeout, self.inner.tasks.wait()).await {
            Ok(()) => tracing::debug!("all background tasks finished"),
            Err(_) => tracing::warn!(
                pending = self.inner.tasks.len(),
                "graceful drain timed out"
            ),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }
        Ok(())
    }
}

impl Dispatcher {
    /// Receives one upload into `incoming/` under a fresh id.
    async fn stage_upload<S>(&self, source: &mut S) -> Result<(JobId, PathBuf)>
    where
        S: ChunkSource + ?Sized,
    {
        let id = JobId::mint();
        let upload = self.staging.upload_path(&id);
        match receive_file(source, &upload).await {
            Ok(received) => {
                record_bytes_uploaded(received.stats.bytes);
                Ok((id, upload))
            }
            Err(e) => {
                discard(&upload).await;
                Err(e)
            }
        }
    }

    async fn process_sync<S>(&self, source: &mut S) -> Result<Bytes>
    where
        S: ChunkSource + ?Sized,
    {
        let (id, upload) = self.stage_upload(source).await?;
        let worker = self.pool.next_worker();
        tracing::debug!(job_id = %id, worker = worker.address(), "forwarding");

        let started = Instant::now();
        let forwarded = worker.forward(&upload, &self.staging.outgoing).await;
        record_forward_duration(started.elapsed().as_secs_f64() * 1000.0);

        let text = match forwarded {
            Ok(result) => {
                let text = tokio::fs::read(&result).await.map(Bytes::from).map_err(|e| {
                    Error::io(format!("failed to read result {}", result.display()), &e)
                });
                let removed = remove_staged(&result).await;
                text.and_then(|text| removed.map(|()| text))
            }
            Err(e) => Err(e),
        };
        let removed = remove_staged(&upload).await;

        let text = text?;
        removed?;
        Ok(text)
    }

    async fn submit<S>(&self, source: &mut S) -> Result<JobId>
    where
        S: ChunkSource + ?Sized,
    {
        let (id, upload) = self.stage_upload(source).await?;
        let job = self.jobs.register(id.clone());
        let worker = self.pool.next_worker();

        let span = tracing::info_span!("forward", job_id = %id, worker = worker.address());
        self.tasks.spawn(
            forward_job(worker, job, upload, self.staging.outgoing.clone()).instrument(span),
        );
        Ok(id)
    }

    /// Waits for the job and claims its result file.
    async fn claim(&self, id: &JobId) -> Result<ClaimedResult> {
        self.jobs.wait(id, self.fetch_timeout).await?;
        self.jobs.claim(id)
    }
}

/// Background half of `Submit`: forwards the upload and records the outcome.
async fn forward_job(worker: Arc<WorkerProxy>, job: JobHandle, upload: PathBuf, outgoing: PathBuf) {
    job.running(worker.address());
    increment_jobs_pending();

    let started = Instant::now();
    let outcome = worker.forward(&upload, &outgoing).await;
    record_forward_duration(started.elapsed().as_secs_f64() * 1000.0);

    discard(&upload).await;
    decrement_jobs_pending();

    match outcome {
        Ok(result) => {
            tracing::info!("job completed");
            job.complete(result);
        }
        Err(e) => {
            tracing::warn!("job failed: {e}");
            job.fail(e.to_string());
        }
    }
}

#[tonic::async_trait]
impl TextDispatcher for DispatchService {
    type FetchStream = Pin<Box<dyn Stream<Item = core::result::Result<Chunk, Status>> + Send>>;

    #[tracing::instrument(skip_all)]
    async fn process_sync(
        &self,
        request: Request<Streaming<Chunk>>,
    ) -> core::result::Result<Response<TextAndStatus>, Status> {
        self.ensure_running()?;
        increment_requests("ProcessSync");

        let mut stream = request.into_inner();
        let reply = match self.inner.process_sync(&mut stream).await {
            Ok(text) => TextAndStatus::ok("File received with success", text),
            Err(e) => {
                increment_call_errors("ProcessSync");
                tracing::warn!("synchronous call failed: {e}");
                TextAndStatus::error(e.to_string())
            }
        };
        Ok(Response::new(reply))
    }

    #[tracing::instrument(skip_all)]
    async fn submit(
        &self,
        request: Request<Streaming<Chunk>>,
    ) -> core::result::Result<Response<IdAndStatus>, Status> {
        self.ensure_running()?;
        increment_requests("Submit");

        let mut stream = request.into_inner();
        let reply = match self.inner.submit(&mut stream).await {
            Ok(id) => {
                tracing::info!(job_id = %id, "job accepted");
                IdAndStatus::accepted(&id)
            }
            Err(e) => {
                increment_call_errors("Submit");
                tracing::warn!("submit failed: {e}");
                IdAndStatus::error(e.to_string())
            }
        };
        Ok(Response::new(reply))
    }

    #[tracing::instrument(skip_all, fields(job_id = %request.get_ref().job_id))]
    async fn fetch(
        &self,
        request: Request<JobRequest>,
    ) -> core::result::Result<Response<Self::FetchStream>, Status> {
        self.ensure_running()?;
        increment_requests("Fetch");

        let id = JobId::from(request.into_inner().job_id);
        let result = self.inner.claim(&id).await.inspect_err(|e| {
            increment_call_errors("Fetch");
            tracing::warn!("fetch failed: {e}");
        })?;

        let (tx, rx) = mpsc::channel::<core::result::Result<Chunk, Status>>(UPLOAD_BUFFER_SIZE);
        let chunk_size = self.inner.chunk_size;
        self.inner.tasks.spawn(
            async move {
                let mut tx = tx;
                let sent = send_file(&mut tx, result.path(), chunk_size, true).await;
                match sent {
                    Ok(stats) => {
                        tracing::debug!(bytes = stats.bytes, "result delivered");
                        result.consume();
                    }
                    // Every chunk went out; only the deletion failed.
                    Err(e @ Error::Cleanup { .. }) => {
                        tracing::warn!("{e}");
                        result.consume();
                    }
                    Err(e) => {
                        tracing::warn!("result stream failed, job stays fetchable: {e}");
                        let _ = tx.send(Err(e.into())).await;
                    }
                }
            }
            .in_current_span(),
        );

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    #[tracing::instrument(skip_all, fields(job_id = %request.get_ref().job_id))]
    async fn job_status(
        &self,
        request: Request<JobRequest>,
    ) -> core::result::Result<Response<JobStatusReply>, Status> {
        increment_requests("JobStatus");
        let id = JobId::from(request.into_inner().job_id);
        let state = self.inner.jobs.state(&id)?;
        Ok(Response::new(state.status_reply(&id)))
    }
}

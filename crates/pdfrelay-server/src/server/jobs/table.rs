//! Correlation table for asynchronous jobs.
//!
//! Each job moves through `Submitted → Running → Completed | Failed`. The
//! state lives in a `watch` channel so a `Fetch` can suspend on one job while
//! every other call proceeds. A record has exactly one writer, the
//! [`JobHandle`] given to the background forward.
//!
//! Reading a result is two-step. [`JobTable::claim`] hands one fetch an
//! exclusive [`ClaimedResult`]; the record is removed only when that claim is
//! [consumed](ClaimedResult::consume). Dropping the claim makes the job
//! fetchable again, so a broken result stream does not lose the job.

use pdfrelay_core::{
    Error, JobId, Result,
    proto::{JobState as WireJobState, JobStatusReply},
};
use parking_lot::RwLock;
use portable_atomic::{AtomicBool, Ordering};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Running { worker: String },
    Completed { result: PathBuf },
    Failed { reason: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    pub fn status_reply(&self, id: &JobId) -> JobStatusReply {
        let (state, message) = match self {
            Self::Submitted => (WireJobState::Submitted, String::new()),
            Self::Running { worker } => (WireJobState::Running, worker.clone()),
            Self::Completed { .. } => (WireJobState::Completed, String::new()),
            Self::Failed { reason } => (WireJobState::Failed, reason.clone()),
        };
        JobStatusReply {
            job_id: id.to_string(),
            state: state.into(),
            message,
        }
    }
}

#[derive(Debug)]
struct JobRecord {
    state: watch::Sender<JobState>,
    finished_at: OnceLock<Instant>,
    claimed: AtomicBool,
}

impl JobRecord {
    fn new() -> Self {
        Self {
            state: watch::Sender::new(JobState::Submitted),
            finished_at: OnceLock::new(),
            claimed: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> JobState {
        self.state.borrow().clone()
    }

    fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    fn expired(&self, now: Instant, ttl: Duration) -> bool {
        !self.is_claimed()
            && self
                .finished_at
                .get()
                .is_some_and(|at| now.saturating_duration_since(*at) >= ttl)
    }
}

#[derive(Debug, Default)]
pub struct JobTable {
    jobs: RwLock<HashMap<JobId, Arc<JobRecord>>>,
}

impl JobTable {
    /// Inserts a `Submitted` record and returns its only writer.
    pub fn register(&self, id: JobId) -> JobHandle {
        let record = Arc::new(JobRecord::new());
        self.jobs.write().insert(id.clone(), Arc::clone(&record));
        JobHandle { id, record }
    }

    fn get(&self, id: &JobId) -> Result<Arc<JobRecord>> {
        self.jobs
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownJob { id: id.to_string() })
    }

    /// Current state, without waiting or consuming.
    pub fn state(&self, id: &JobId) -> Result<JobState> {
        Ok(self.get(id)?.snapshot())
    }

    /// Waits until the job reaches a terminal state.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownJob`] immediately if no record exists.
    /// - [`Error::Timeout`] if `timeout` elapses first. The record is kept.
    pub async fn wait(&self, id: &JobId, timeout: Option<Duration>) -> Result<JobState> {
        let record = self.get(id)?;
        let mut rx = record.state.subscribe();
        let finished = async {
            rx.wait_for(JobState::is_terminal)
                .await
                .map(|state| state.clone())
                .map_err(|_| Error::JobFailed {
                    id: id.to_string(),
                    reason: "job record closed".to_string(),
                })
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, finished)
                .await
                .map_err(|_| Error::Timeout { id: id.to_string() })?,
            None => finished.await,
        }
    }

    /// Takes exclusive hold of a finished job's result.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownJob`] if there is no record or another fetch holds
    ///   the claim.
    /// - [`Error::JobFailed`] if the job failed. Its record is removed.
    /// - [`Error::JobFailed`] if the job has not finished. Its record is kept.
    pub fn claim(self: &Arc<Self>, id: &JobId) -> Result<ClaimedResult> {
        let mut jobs = self.jobs.write();
        let record = jobs
            .get(id)
            .filter(|record| !record.is_claimed())
            .cloned()
            .ok_or_else(|| Error::UnknownJob { id: id.to_string() })?;

        match record.snapshot() {
            JobState::Completed { result } => {
                record.claimed.store(true, Ordering::Release);
                Ok(ClaimedResult {
                    table: Arc::clone(self),
                    id: id.clone(),
                    result,
                    record,
                })
            }
            JobState::Failed { reason } => {
                jobs.remove(id);
                Err(Error::JobFailed {
                    id: id.to_string(),
                    reason,
                })
            }
            JobState::Submitted | JobState::Running { .. } => Err(Error::JobFailed {
                id: id.to_string(),
                reason: "job has not finished".to_string(),
            }),
        }
    }

    /// Removes every unclaimed terminal record that finished at least `ttl`
    /// ago.
    pub fn evict_expired(&self, ttl: Duration) -> Vec<(JobId, JobState)> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.jobs.write().retain(|id, record| {
            if record.expired(now, ttl) {
                evicted.push((id.clone(), record.snapshot()));
                false
            } else {
                true
            }
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

/// Sole writer of one job's state.
///
/// Dropping a handle before [`complete`](Self::complete) or
/// [`fail`](Self::fail) marks the job `Failed`, so a waiting fetch always
/// wakes up.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    record: Arc<JobRecord>,
}

impl JobHandle {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn running(&self, worker: impl Into<String>) {
        let worker = worker.into();
        self.record.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = JobState::Running { worker };
            true
        });
    }

    pub fn complete(self, result: PathBuf) {
        self.finish(JobState::Completed { result });
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.finish(JobState::Failed {
            reason: reason.into(),
        });
    }

    fn finish(&self, outcome: JobState) {
        let changed = self.record.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = outcome;
            true
        });
        if changed {
            let _ = self.record.finished_at.set(Instant::now());
        }
    }
}

/// One fetch's exclusive hold on a completed job.
///
/// While held, other fetches of the job fail with [`Error::UnknownJob`] and
/// the reaper leaves it alone.
#[derive(Debug)]
pub struct ClaimedResult {
    table: Arc<JobTable>,
    id: JobId,
    result: PathBuf,
    record: Arc<JobRecord>,
}

impl ClaimedResult {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.result
    }

    /// The result was delivered: removes the job record.
    pub fn consume(self) {
        self.table.jobs.write().remove(&self.id);
    }
}

impl Drop for ClaimedResult {
    fn drop(&mut self) {
        self.record.claimed.store(false, Ordering::Release);
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.finish(JobState::Failed {
            reason: "job abandoned before completion".to_string(),
        });
    }
}

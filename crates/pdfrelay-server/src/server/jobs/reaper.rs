//! Background eviction of jobs nobody fetched.

use super::table::{JobState, JobTable};
use crate::server::{staging::discard, telemetry::record_jobs_evicted};
use core::time::Duration;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Runs [`reap_once`] every `interval` until `shutdown` is cancelled.
pub async fn reap_expired(
    jobs: Arc<JobTable>,
    ttl: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                reap_once(&jobs, ttl).await;
            }
        }
    }
    tracing::debug!("job reaper stopped");
}

/// Evicts terminal jobs older than `ttl` and deletes their result files.
/// Returns how many jobs were evicted.
pub async fn reap_once(jobs: &JobTable, ttl: Duration) -> usize {
    let evicted = jobs.evict_expired(ttl);
    for (id, state) in &evicted {
        if let JobState::Completed { result } = state {
            discard(result).await;
        }
        tracing::info!(job_id = %id, "evicted unfetched job");
    }
    record_jobs_evicted(evicted.len() as u64);
    evicted.len()
}

//! The dispatcher's fixed set of workers.
//!
//! [`WorkerPool`] owns one [`WorkerProxy`] per configured endpoint and hands
//! them out according to its [`SelectionStrategy`]. The pool itself holds no
//! locks: selection state lives in the strategy's atomics and every proxy is
//! shared behind an [`Arc`], so a background forward can keep its worker
//! after the caller has moved on.

use super::{
    proxy::{WorkerEndpoint, WorkerProxy},
    strategy::{Selection, SelectionStrategy},
};
use pdfrelay_core::{Error, Result};
use std::sync::Arc;

#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Arc<WorkerProxy>>,
    strategy: Box<dyn SelectionStrategy>,
}

impl WorkerPool {
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `workers` is empty.
    pub fn new(workers: Vec<Arc<WorkerProxy>>, strategy: Box<dyn SelectionStrategy>) -> Result<Self> {
        if workers.is_empty() {
            return Err(Error::configuration("worker pool needs at least one worker"));
        }
        Ok(Self { workers, strategy })
    }

    /// Builds a proxy for every endpoint, in order.
    pub async fn connect(
        endpoints: &[WorkerEndpoint],
        selection: Selection,
        max_message_size: usize,
    ) -> Result<Self> {
        let mut workers = Vec::with_capacity(endpoints.len());
        for (index, endpoint) in endpoints.iter().enumerate() {
            let proxy = WorkerProxy::connect(index, endpoint.clone(), max_message_size).await?;
            tracing::debug!(index, address = proxy.address(), "worker registered");
            workers.push(Arc::new(proxy));
        }
        Self::new(workers, selection.build())
    }

    /// Selects the worker for the next dispatch attempt.
    ///
    /// Every call advances the selection state, whether or not the dispatch
    /// that follows succeeds.
    pub fn next_worker(&self) -> Arc<WorkerProxy> {
        let index = self.strategy.select(&self.workers);
        Arc::clone(&self.workers[index])
    }

    pub fn workers(&self) -> &[Arc<WorkerProxy>] {
        &self.workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

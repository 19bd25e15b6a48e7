//! Worker selection policies.

use super::proxy::WorkerProxy;
use core::fmt;
use portable_atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Picks the worker that receives the next dispatch.
///
/// Implementations are called with a non-empty slice and must return an index
/// into it.
pub trait SelectionStrategy: Send + Sync + fmt::Debug {
    fn select(&self, workers: &[Arc<WorkerProxy>]) -> usize;
}

/// Configurable choice of [`SelectionStrategy`].
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Selection {
    /// Cycle through the workers in configuration order.
    #[default]
    RoundRobin,
    /// Prefer the worker with the fewest calls in flight.
    LeastLoaded,
}

impl Selection {
    pub fn build(self) -> Box<dyn SelectionStrategy> {
        match self {
            Self::RoundRobin => Box::new(RoundRobin::default()),
            Self::LeastLoaded => Box::new(LeastLoaded::default()),
        }
    }
}

/// Strict round robin.
///
/// The counter is read and advanced in a single atomic step, so concurrent
/// callers never receive the same index for the same turn and the stored
/// value stays within `[0, len)`.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    fn advance(&self, len: usize) -> usize {
        let prev = match self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| Some((i + 1) % len))
        {
            Ok(prev) | Err(prev) => prev,
        };
        prev % len
    }
}

impl SelectionStrategy for RoundRobin {
    fn select(&self, workers: &[Arc<WorkerProxy>]) -> usize {
        self.advance(workers.len())
    }
}

/// Fewest in-flight calls wins. Ties go to the first candidate after a
/// rotating start position, so idle pools still spread work.
#[derive(Debug, Default)]
pub struct LeastLoaded {
    start: RoundRobin,
}

impl SelectionStrategy for LeastLoaded {
    fn select(&self, workers: &[Arc<WorkerProxy>]) -> usize {
        let len = workers.len();
        let start = self.start.advance(len);
        (0..len)
            .map(|offset| (start + offset) % len)
            .min_by_key(|&i| workers[i].inflight())
            .unwrap_or(start)
    }
}

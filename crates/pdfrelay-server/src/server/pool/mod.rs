//! Worker pool for the dispatcher.
//!
//! - [`proxy`] - one gRPC client per worker endpoint.
//! - [`strategy`] - worker selection (round robin, least loaded).
//! - [`manager`] - the pool that ties the two together.

pub mod manager;
pub mod proxy;
pub mod strategy;

//! Asynchronous job bookkeeping.
//!
//! - [`table`] - job states, the correlation table and the per-job writer.
//! - [`reaper`] - TTL eviction of finished jobs that were never fetched.

pub mod reaper;
pub mod table;

//! gRPC service implementations.
//!
//! - [`dispatcher`] - `TextDispatcher`, the client-facing entry point.
//! - [`worker`] - `TextWorker`, the text extraction endpoint.
//! - [`extract`] - the extraction command run by workers.

pub mod dispatcher;
pub mod extract;
pub mod worker;

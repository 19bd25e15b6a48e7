//! Shared protocol types and helpers used by every pdfrelay tier.
//!
//! ## Submodules
//!
//! - [`error`] - Unified error type and its mapping onto `tonic::Status`.
//! - [`types`] - Chunk size bound, job identifiers and wire constants.
//! - [`reply`] - Constructors for the status-carrying reply messages.
//! - [`transfer`] - Chunked file streaming (send, receive, upload).
//! - [`channel`] - Client connection setup (plaintext or TLS, compression).
//! - [`proto`] - Generated Protobuf messages and gRPC stubs.

pub mod channel;
pub mod error;
pub mod reply;
pub mod transfer;
pub mod types;

pub use error::{Error, Result};
pub use types::{ChunkSize, JobId};

/// gRPC service and message definitions generated from `proto/pdfrelay.proto`.
///
/// ## Services
///
/// - `TextDispatcher` - front-end facing: `ProcessSync`, `Submit`, `Fetch`,
///   `JobStatus`.
/// - `TextWorker` - dispatcher facing: `Process`.
///
/// ## Invariants
///
/// - `Chunk.content.len() <= ChunkSize::MAX`
/// - A reply whose `code` is not `StatusCode::Ok` is terminal for that call.
pub mod proto {
    tonic::include_proto!("pdfrelay");

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("pdfrelay_descriptor");
}

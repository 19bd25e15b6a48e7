//! Error types for the pdfrelay services.
//!
//! This module defines the central `Error` enum, which captures every failure
//! a call can end with on any of the three tiers (client, dispatcher, worker).
//! It implements `From<Error>` for `tonic::Status` so handlers can propagate
//! errors to the immediate caller with `?`.
//!
//! ## Error Cases
//! - `Configuration`: invalid startup configuration. Fatal.
//! - `Transport`: a connection or stream failed on some hop.
//! - `Io`: a local staging file could not be opened, written or read.
//! - `Extraction`: the external text extraction command failed.
//! - `Remote`: the peer answered with a non-Ok status reply.
//! - `Cleanup`: a temporary file could not be removed.
//! - `UnknownJob`: no record exists for the requested job id.
//! - `JobFailed`: the job finished with an error.
//! - `Timeout`: waiting for a job exceeded the configured fetch timeout.
//! - `ServiceShutdown`: the call arrived while the service was shutting down.

use std::path::Path;
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the pdfrelay services.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Invalid port, chunk size, worker list or TLS material.
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Connection or stream failure on a hop.
    #[error("Transport error: {context}")]
    Transport { context: String },

    /// Local file failure while staging a transfer.
    #[error("I/O error: {context}")]
    Io { context: String },

    /// The extraction command failed or its output could not be read.
    #[error("Extraction failed: {reason}")]
    Extraction { reason: String },

    /// The peer replied with an error status.
    #[error("{message}")]
    Remote { message: String },

    /// A temporary file could not be deleted.
    #[error("Failed to remove {path}: {reason}")]
    Cleanup { path: String, reason: String },

    /// Fetch or status query for an id with no job record.
    #[error("Unknown job {id}")]
    UnknownJob { id: String },

    /// The job's forward to a worker failed.
    #[error("Job {id} failed: {reason}")]
    JobFailed { id: String, reason: String },

    /// The job did not finish within the fetch timeout.
    #[error("Timed out waiting for job {id}")]
    Timeout { id: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn transport(context: impl core::fmt::Display, cause: impl core::fmt::Display) -> Self {
        Self::Transport {
            context: format!("{context}: {cause}"),
        }
    }

    pub fn io(context: impl core::fmt::Display, cause: &std::io::Error) -> Self {
        Self::Io {
            context: format!("{context}: {cause}"),
        }
    }

    pub fn cleanup(path: &Path, cause: &std::io::Error) -> Self {
        Self::Cleanup {
            path: path.display().to_string(),
            reason: cause.to_string(),
        }
    }

    /// Prefixes a `Remote` or `Transport` error with the hop that reported it.
    /// Other variants are returned unchanged.
    #[must_use]
    pub fn from_hop(self, hop: &str) -> Self {
        match self {
            Self::Remote { message } => Self::Remote {
                message: format!("{hop}: {message}"),
            },
            Self::Transport { context } => Self::Transport {
                context: format!("{hop}: {context}"),
            },
            other => other,
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Configuration { reason } => Status::failed_precondition(reason),
            Error::Transport { context } => Status::unavailable(context),
            Error::Io { context } => Status::internal(context),
            Error::Extraction { reason } => Status::internal(format!("Extraction failed: {reason}")),
            Error::Remote { message } => Status::internal(message),
            e @ Error::Cleanup { .. } => Status::internal(e.to_string()),
            e @ Error::UnknownJob { .. } => Status::not_found(e.to_string()),
            e @ Error::JobFailed { .. } => Status::internal(e.to_string()),
            e @ Error::Timeout { .. } => Status::deadline_exceeded(e.to_string()),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn unknown_job_maps_to_not_found() {
        let status = Status::from(Error::UnknownJob {
            id: "nonexistent".to_string(),
        });
        assert_eq!(status.code(), Code::NotFound);
        assert!(status.message().contains("nonexistent"));
    }

    #[test]
    fn timeout_and_shutdown_codes() {
        let timeout = Status::from(Error::Timeout { id: "a".into() });
        assert_eq!(timeout.code(), Code::DeadlineExceeded);
        assert_eq!(
            Status::from(Error::ServiceShutdown).code(),
            Code::Unavailable
        );
    }

    #[test]
    fn from_hop_prefixes_remote_and_transport_only() {
        let remote = Error::Remote {
            message: "pdftotext exited with status 1".into(),
        }
        .from_hop("worker 10.0.0.2:1313");
        assert_eq!(
            remote.to_string(),
            "worker 10.0.0.2:1313: pdftotext exited with status 1"
        );

        let unknown = Error::UnknownJob { id: "x".into() }.from_hop("dispatcher");
        assert_eq!(unknown, Error::UnknownJob { id: "x".into() });
    }
}

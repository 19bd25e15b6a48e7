//! Constructors and accessors for the status-carrying reply messages.

use crate::{
    Error, JobId, Result,
    proto::{IdAndStatus, StatusCode, TextAndStatus},
};
use bytes::Bytes;

impl TextAndStatus {
    pub fn ok(message: impl Into<String>, text: Bytes) -> Self {
        Self {
            message: message.into(),
            text,
            code: StatusCode::Ok.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            text: Bytes::new(),
            code: StatusCode::Error.into(),
        }
    }

    /// Returns the text payload, or [`Error::Remote`] carrying the peer's
    /// message when the code is anything but `Ok`.
    pub fn into_text(self) -> Result<Bytes> {
        match self.code() {
            StatusCode::Ok => Ok(self.text),
            _ => Err(Error::Remote {
                message: self.message,
            }),
        }
    }
}

impl IdAndStatus {
    pub fn accepted(id: &JobId) -> Self {
        Self {
            job_id: id.to_string(),
            message: "File is received and will be processed soon".to_string(),
            code: StatusCode::Ok.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            job_id: String::new(),
            message: message.into(),
            code: StatusCode::Error.into(),
        }
    }

    pub fn into_job_id(self) -> Result<JobId> {
        match self.code() {
            StatusCode::Ok => Ok(JobId::from(self.job_id)),
            _ => Err(Error::Remote {
                message: self.message,
            }),
        }
    }
}

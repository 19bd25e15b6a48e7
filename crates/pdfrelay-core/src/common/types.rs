//! # Shared types and constants
//!
//! - [`ChunkSize`] - validated upper bound for one streamed file fragment.
//! - [`JobId`] - opaque token correlating an asynchronous submission with its
//!   later retrieval.
//!
//! ## Constants
//!
//! - [`MAX_CHUNK_SIZE`] - hard limit for a fragment (4 MiB).
//! - [`DEFAULT_CHUNK_SIZE`] - fragment size used when none is configured.
//! - [`DEFAULT_MAX_MESSAGE_SIZE`] - gRPC message limit applied to servers and
//!   clients. Must exceed `MAX_CHUNK_SIZE` plus framing, and bounds the size of
//!   a whole-text reply.

use crate::{Error, Result};
use core::{fmt, num::NonZeroUsize};

/// Largest allowed fragment, in bytes.
pub const MAX_CHUNK_SIZE: usize = 1 << 22;

/// Fragment size used by the binaries when none is given.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 12;

/// Encoding/decoding limit for a single gRPC message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 << 20;

/// Upper bound on the size of one streamed fragment.
///
/// Always within `(0, MAX_CHUNK_SIZE]`; the only way to obtain one is through
/// [`ChunkSize::new`], which rejects anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChunkSize(NonZeroUsize);

impl ChunkSize {
    /// Largest accepted value.
    pub const MAX: usize = MAX_CHUNK_SIZE;

    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when `bytes` is `0` or greater than
    /// [`MAX_CHUNK_SIZE`].
    pub fn new(bytes: usize) -> Result<Self> {
        match NonZeroUsize::new(bytes) {
            None => Err(Error::configuration("chunk size must be greater than 0")),
            Some(size) if size.get() > MAX_CHUNK_SIZE => Err(Error::configuration(format!(
                "chunk size {bytes} exceeds the 4 MiB limit ({MAX_CHUNK_SIZE} bytes)"
            ))),
            Some(size) => Ok(Self(size)),
        }
    }

    pub const fn get(self) -> usize {
        self.0.get()
    }

    /// Number of fragments a file of `len` bytes is split into.
    pub const fn chunks_for(self, len: u64) -> u64 {
        len.div_ceil(self.0.get() as u64)
    }
}

impl Default for ChunkSize {
    fn default() -> Self {
        match NonZeroUsize::new(DEFAULT_CHUNK_SIZE) {
            Some(size) => Self(size),
            None => unreachable!(),
        }
    }
}

impl TryFrom<usize> for ChunkSize {
    type Error = Error;

    fn try_from(bytes: usize) -> Result<Self> {
        Self::new(bytes)
    }
}

impl fmt::Display for ChunkSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.get())
    }
}

/// Identifier minted by the dispatcher when a file is submitted.
///
/// The token is opaque to clients: they only hand it back to `Fetch` or
/// `JobStatus`. Ids are random (UUID v4), so they are unique within and across
/// dispatcher processes, and are safe to embed in staging file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(String);

impl JobId {
    /// Mints a fresh, process-unique id.
    pub fn mint() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

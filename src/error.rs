//! Error taxonomy for decoding, sinks and the ingestion pipeline.
use std::fmt;
use std::io;

use thiserror::Error;

/// Which part of a transport frame ran out of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truncation {
    Header,
    LengthPrefix,
    MessageBody,
}

impl fmt::Display for Truncation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Truncation::Header => "header",
            Truncation::LengthPrefix => "length prefix",
            Truncation::MessageBody => "message body",
        };
        f.write_str(s)
    }
}

/// Failure while walking a transport frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ended inside a fixed-size structure.
    #[error("truncated {what} at offset {offset} (need {needed} bytes, have {available})")]
    Truncated {
        what: Truncation,
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// The cursor cannot be resynchronized to the frame boundary.
    #[error("protocol violation at offset {offset}: {reason}")]
    ProtocolViolation { offset: usize, reason: String },
}

impl DecodeError {
    pub fn truncation(&self) -> Option<Truncation> {
        match self {
            DecodeError::Truncated { what, .. } => Some(*what),
            DecodeError::ProtocolViolation { .. } => None,
        }
    }
}

/// Failure reported by a storage backend.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("batch encoding failed: {0}")]
    Encode(#[from] bincode::Error),

    /// The dedicated writer stage is gone or already failed.
    #[error("writer stage failed: {0}")]
    Writer(String),

    #[error("lock poisoned: {0}")]
    Poisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for SinkError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SinkError::Poisoned(err.to_string())
    }
}

/// Fatal outcome of an ingestion run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("worker {worker}: decode failed: {source}")]
    Decode {
        worker: usize,
        #[source]
        source: DecodeError,
    },

    #[error("worker {worker}: sink write failed: {source}")]
    SinkWrite {
        worker: usize,
        #[source]
        source: SinkError,
    },

    #[error("sink finish failed: {0}")]
    SinkFinish(#[source] SinkError),

    /// Submission after a worker reported a fatal error.
    #[error("pipeline aborted")]
    Aborted,

    #[error("worker {0} panicked")]
    WorkerPanicked(usize),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("payload source failed: {0}")]
    Source(#[from] io::Error),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

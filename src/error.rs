//! Error types for tasq-rs.

use thiserror::Error;

use crate::model::AwaitingState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("request timed out: {state}")]
    Timeout { state: AwaitingState },

    #[error("method failed to execute: {state} (status {status})")]
    Rejected { state: AwaitingState, status: u32 },

    #[error("unknown method called: {state}")]
    UnknownMethod { state: AwaitingState },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("submission failed: {0}")]
    Submission(#[source] Box<Error>),

    #[error("store error: {0}")]
    Store(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("caller was destroyed before the request completed")]
    Destroyed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The `(topic, method, args)` of the call that failed, for request-level errors.
    pub fn state(&self) -> Option<&AwaitingState> {
        match self {
            Error::Timeout { state }
            | Error::Rejected { state, .. }
            | Error::UnknownMethod { state } => Some(state),
            _ => None,
        }
    }

    /// Wire status carried by the response that produced this error, if any.
    pub fn status(&self) -> Option<u32> {
        match self {
            Error::Rejected { status, .. } => Some(*status),
            Error::UnknownMethod { .. } => Some(crate::model::Status::UnknownMethod.code()),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

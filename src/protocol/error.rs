use std::path::PathBuf;

use thiserror::Error;

use crate::{ports::http_client::HttpClientError, protocol::messages::MessageKind};

/// Errors of the hub/module control protocol.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The peer refused our token, or presented one we refuse
    #[error("authentication token mismatch")]
    AuthMismatch,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unexpected message type: expected {expected:?}, got {actual:?}")]
    UnexpectedKind {
        expected: MessageKind,
        actual: MessageKind,
    },

    #[error("handshake rejected (status {0})")]
    Rejected(u16),

    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("peer unreachable: {0}")]
    Unreachable(HttpClientError),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<HttpClientError> for ProtocolError {
    fn from(err: HttpClientError) -> Self {
        match err {
            HttpClientError::Timeout(after) => ProtocolError::Timeout(after),
            other => ProtocolError::Unreachable(other),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}

/// Failure to read or create the shared secret file.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SecretError {
    #[error("cannot access secret file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("secret file {0} is empty")]
    Empty(PathBuf),
}

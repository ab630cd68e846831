use thiserror::Error;

use crate::{core::state::ModuleState, protocol::ProtocolError};

/// Errors surfaced by lifecycle operations (setup, start, stop, command relay).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LifecycleError {
    #[error("module '{name}' is not running (state {state})")]
    NotRunning { name: String, state: ModuleState },

    #[error("unknown module '{0}'")]
    UnknownModule(String),

    #[error("module '{0}' has no managed process")]
    NotManaged(String),

    #[error("module '{0}' is online or loading; stop it first")]
    Busy(String),

    #[error("fetching module '{name}' failed: {reason}")]
    FetchFailure { name: String, reason: String },

    #[error("launching module '{name}' failed: {reason}")]
    ProcessLaunchFailure { name: String, reason: String },

    #[error("module '{name}' unreachable: {source}")]
    Unreachable {
        name: String,
        #[source]
        source: ProtocolError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a handshake is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HandshakeError {
    #[error("authentication token mismatch")]
    AuthMismatch,

    #[error("malformed handshake: {0}")]
    Malformed(String),

    #[error("module '{0}' presented an identity that differs from the recorded one")]
    IdentityConflict(String),

    #[error("no port available for module '{0}'")]
    NoPortAvailable(String),
}

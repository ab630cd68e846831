//! Traits for the collaborators the core depends on.
pub mod credentials;
pub mod file_system;
pub mod http_client;
pub mod liveness;
pub mod persistence;
pub mod process;

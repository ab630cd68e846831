//! modhub - a hub for independently launched HTTP modules.
//!
//! The hub keeps a registry of modules, each with a lifecycle state
//! (`UNKNOWN`, `DOWNLOADED`, `LOADING`, `ONLINE`, `STOPPED`, `ERROR`). Modules register
//! through an authenticated handshake, a supervisor polls their liveness and drives
//! state transitions, and a reverse proxy dispatches public requests to a module
//! according to its current state.
//!
//! # Architecture
//! - [`core`]: records, the state machine, registry, route table, hub and lifecycle
//!   service. No I/O besides what goes through the ports.
//! - [`protocol`]: shared secret tokens, wire messages and the control client.
//! - [`ports`] / [`adapters`]: traits for external collaborators and their
//!   implementations (hyper client, process table, launcher, persistence, HTTP API).
//! - [`module_kit`]: the module side of the protocol, for writing modules in Rust.
//!
//! # Concurrency
//! Records are published through `arc-swap` snapshots inside an `scc::HashMap`, so
//! the proxy reads a module's state without taking a lock. Writers serialize on a
//! per-record async mutex.
pub mod config;
pub mod ports;
pub mod protocol;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;
pub mod module_kit;

pub use crate::{
    adapters::{FileSystemAdapter, HttpClientAdapter, HttpHandler, Supervisor},
    core::{Hub, Lifecycle, ModuleRecord, ModuleState},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::models::ExecSpec;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProcessError {
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resource usage of one process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProcessUsage {
    pub pid: u32,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// Read-only view of the OS process table
#[async_trait]
pub trait ProcessTable: Send + Sync + 'static {
    async fn is_running(&self, pid: u32) -> bool;

    async fn usage(&self, pid: u32) -> Option<ProcessUsage>;
}

/// A process started by a [`ModuleLauncher`].
#[derive(Debug)]
pub struct LaunchedProcess {
    pub pid: u32,
    /// Resolves with the exit code once the process is reaped
    pub exited: Option<oneshot::Receiver<Option<i32>>>,
}

/// Turns an ExecSpec into a running process
#[async_trait]
pub trait ModuleLauncher: Send + Sync + 'static {
    async fn launch(&self, name: &str, exec: &ExecSpec) -> Result<LaunchedProcess, ProcessError>;
}

/// Builds a local runnable checkout from a remote source reference
#[async_trait]
pub trait SourceFetcher: Send + Sync + 'static {
    /// Returns the directory the module was fetched into
    async fn fetch(&self, name: &str, exec: &ExecSpec) -> Result<PathBuf, ProcessError>;
}

use async_trait::async_trait;
use serde::Serialize;

use crate::core::module::ModuleRecord;

/// Which check confirmed a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LivenessChannel {
    Pid,
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessReport {
    pub alive: bool,
    /// Attempts made, including the successful one
    pub attempts: u32,
    pub via: Option<LivenessChannel>,
}

impl LivenessReport {
    pub fn alive(attempts: u32, via: LivenessChannel) -> Self {
        Self {
            alive: true,
            attempts,
            via: Some(via),
        }
    }

    pub fn not_running(attempts: u32) -> Self {
        Self {
            alive: false,
            attempts,
            via: None,
        }
    }
}

/// Decides whether a module is currently serviceable
#[async_trait]
pub trait LivenessProbe: Send + Sync + 'static {
    async fn check(&self, record: &ModuleRecord) -> LivenessReport;
}

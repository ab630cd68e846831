use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    core::ModuleRecord,
    ports::{
        liveness::{LivenessChannel, LivenessProbe, LivenessReport},
        process::ProcessTable,
    },
    protocol::ControlClient,
};

/// Attempts made before a module is reported not running
pub const MAX_LIVENESS_ATTEMPTS: u32 = 5;

/// Combines a local PID lookup with a protocol ping.
///
/// Each attempt first looks the remembered pid up in the process table (only for
/// modules the hub launched itself), then pings the module's control endpoint. The
/// first positive answer ends the check.
pub struct LivenessChecker {
    process_table: Arc<dyn ProcessTable>,
    control: Arc<ControlClient>,
}

impl LivenessChecker {
    pub fn new(process_table: Arc<dyn ProcessTable>, control: Arc<ControlClient>) -> Self {
        Self {
            process_table,
            control,
        }
    }
}

#[async_trait]
impl LivenessProbe for LivenessChecker {
    async fn check(&self, record: &ModuleRecord) -> LivenessReport {
        let pid = record.pid().filter(|_| record.is_managed());

        for attempt in 1..=MAX_LIVENESS_ATTEMPTS {
            if let Some(pid) = pid {
                if self.process_table.is_running(pid).await {
                    return LivenessReport::alive(attempt, LivenessChannel::Pid);
                }
            }

            match self.control.ping(record).await {
                Ok(reply) if reply.confirms_alive(&record.name) => {
                    return LivenessReport::alive(attempt, LivenessChannel::Ping);
                }
                Ok(reply) => tracing::trace!(
                    module = %record.name,
                    attempt,
                    "Unexpected ping reply ({}): {}",
                    reply.code,
                    reply.message
                ),
                Err(e) => tracing::trace!(module = %record.name, attempt, "Ping failed: {}", e),
            }
        }

        LivenessReport::not_running(MAX_LIVENESS_ATTEMPTS)
    }
}

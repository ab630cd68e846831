use std::{sync::Arc, time::Duration};

use chrono::Utc;
use eyre::Result;
use futures_util::future::join_all;
use tokio::time::sleep;
use tracing::Instrument;

use crate::{
    core::Hub,
    ports::liveness::{LivenessProbe, LivenessReport},
    tracing_setup::configure_component_tracing,
    utils::ShutdownToken,
};

/// Outcome of one supervision pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub checked: usize,
    pub changed: usize,
    pub untracked: usize,
}

/// Background loop that keeps tracked modules' states in line with their liveness
pub struct Supervisor {
    hub: Arc<Hub>,
    probe: Arc<dyn LivenessProbe>,
}

impl Supervisor {
    pub fn new(hub: Arc<Hub>, probe: Arc<dyn LivenessProbe>) -> Self {
        Self { hub, probe }
    }

    /// Run until the shutdown token fires.
    pub async fn run(&self, mut shutdown: ShutdownToken) -> Result<()> {
        let config = &self.hub.config().supervisor;
        if !config.enabled {
            tracing::info!("Module supervision is disabled");
            return Ok(());
        }

        let interval = Duration::from_millis(config.interval_ms);
        tracing::info!(
            "Starting supervisor with interval: {}ms, loading timeout: {}ms",
            config.interval_ms,
            config.loading_timeout_ms
        );

        let span = configure_component_tracing("supervisor");
        loop {
            tokio::select! {
                reason = shutdown.wait_for_shutdown() => {
                    tracing::info!("Supervisor stopping: {:?}", reason);
                    return Ok(());
                }
                _ = sleep(interval) => {}
            }

            let summary = self.tick().instrument(span.clone()).await;
            if summary.changed > 0 {
                tracing::debug!(
                    "Supervision pass: {} checked, {} changed, {} untracked",
                    summary.checked,
                    summary.changed,
                    summary.untracked
                );
            }
        }
    }

    /// One pass: probe every tracked module concurrently, then apply the results.
    ///
    /// The tracked set is only locked to copy it and to remove names; each result is
    /// applied under that module's record lock.
    pub async fn tick(&self) -> TickSummary {
        let names = self.hub.tracked().snapshot();
        let mut summary = TickSummary {
            checked: names.len(),
            ..TickSummary::default()
        };

        let probes = names.into_iter().map(|name| async move {
            let report = match self.hub.registry().get(&name).await {
                Some(record) => Some(self.probe.check(&record).await),
                None => None,
            };
            (name, report)
        });
        let results: Vec<(String, Option<LivenessReport>)> = join_all(probes).await;

        let loading_timeout = self.hub.loading_timeout();
        for (name, report) in results {
            let (Some(report), Some(guard)) = (report, self.hub.registry().lock(&name).await)
            else {
                self.hub.tracked().remove(&name);
                summary.untracked += 1;
                continue;
            };

            let before = guard.record().state();
            let (transition, record) =
                guard.update(|r| r.apply_liveness(report.alive, Utc::now(), loading_timeout));
            // untrack before releasing the record, a handshake waiting on it re-adds the name
            if transition.untrack && self.hub.tracked().remove(&name) {
                summary.untracked += 1;
                tracing::info!("Module '{}' is no longer tracked", name);
            }
            drop(guard);
            if transition.next != before {
                summary.changed += 1;
                self.hub.persist(&record);
                tracing::info!(
                    module = %name,
                    attempts = report.attempts,
                    via = ?report.via,
                    "Module state {} -> {}",
                    before,
                    transition.next
                );
            }
        }

        summary
    }
}

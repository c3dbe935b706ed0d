//! Releases sessions that have gone quiet.

use crate::service::{ReleaseReport, SandboxService};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct IdleReaper {
    service: SandboxService,
    pub check_interval: Duration,
    pub max_idle: Duration,
}

impl IdleReaper {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(service: SandboxService, max_idle: Duration) -> Self {
        Self {
            service,
            check_interval: Duration::from_secs(60),
            max_idle,
        }
    }

    /// Loop until `cancel` fires.
    #[tracing::instrument(level = "info", skip_all, fields(max_idle_secs = self.max_idle.as_secs()))]
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("idle reaper cancelled");
                    return;
                }
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if !report.is_clean() {
                        tracing::warn!(failed = report.failed.len(), "idle reaper released with failures");
                    }
                }
            }
        }
    }

    /// One pass: release every session idle beyond `max_idle`.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn tick(&self) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        for (user_id, session_id) in self.service.idle_sessions(self.max_idle) {
            tracing::info!(%user_id, %session_id, "releasing idle session");
            report.merge(self.service.release(&session_id, &user_id).await);
        }
        report
    }
}

use crate::sandbox::Sandbox;
use crate::Result;
use std::sync::Arc;

/// Closes a sandbox when dropped unless closed or disarmed first.
///
/// Drop cannot await, so drop-time close runs on a spawned task.
pub struct SandboxGuard {
    sandbox: Arc<Sandbox>,
    disarmed: bool,
}

impl SandboxGuard {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self {
            sandbox,
            disarmed: false,
        }
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    pub async fn close(mut self) -> Result<()> {
        self.disarmed = true;
        self.sandbox.close().await
    }

    /// Keep the sandbox alive past the guard.
    pub fn disarm(mut self) -> Arc<Sandbox> {
        self.disarmed = true;
        self.sandbox.clone()
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        if self.disarmed {
            return;
        }
        self.disarmed = true;

        let sandbox = self.sandbox.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = sandbox.close().await {
                    tracing::warn!(sandbox_id = %sandbox.id(), %e, "failed to close sandbox during drop cleanup");
                }
                tracing::debug!(sandbox_id = %sandbox.id(), "sandbox closed from drop");
            });
        } else {
            tracing::warn!(sandbox_id = %sandbox.id(), "no tokio runtime available for sandbox drop cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{cloud_sandbox, RecordingProvider};
    use std::time::Duration;

    async fn wait_for_delete(provider: &RecordingProvider) -> Vec<String> {
        for _ in 0..50 {
            let deleted = provider.deleted();
            if !deleted.is_empty() {
                return deleted;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        provider.deleted()
    }

    #[tokio::test]
    async fn drop_closes_sandbox() {
        let provider = RecordingProvider::new("e2b");
        let sandbox = cloud_sandbox(&provider).await;
        drop(SandboxGuard::new(sandbox));
        assert_eq!(wait_for_delete(&provider).await, vec!["e2b-1".to_string()]);
    }

    #[tokio::test]
    async fn disarm_keeps_sandbox_alive() {
        let provider = RecordingProvider::new("e2b");
        let sandbox = cloud_sandbox(&provider).await;
        let kept = SandboxGuard::new(sandbox).disarm();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(provider.deleted().is_empty());
        assert_eq!(kept.id(), "e2b-1");
    }

    #[tokio::test]
    async fn explicit_close_runs_once() {
        let provider = RecordingProvider::new("e2b");
        let sandbox = cloud_sandbox(&provider).await;
        let guard = SandboxGuard::new(sandbox.clone());
        assert_eq!(guard.sandbox().id(), "e2b-1");
        guard.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(provider.deleted(), vec!["e2b-1".to_string()]);
    }
}

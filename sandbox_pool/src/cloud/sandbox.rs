use crate::cloud::traits::{CloudProvider, CloudSandboxRequest};
use crate::models::{tool_response, BackendKind, ConnectionInfo, SandboxInfo};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Vendor-facing summary returned by [`CloudSandbox::get_info`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudSandboxInfo {
    pub sandbox_id: String,
    pub sandbox_type: String,
    pub provider: String,
    #[serde(with = "crate::models::duration_secs")]
    pub timeout: Duration,
}

/// A sandbox living at a remote vendor.
///
/// A successful deletion happens at most once, however many times `cleanup`
/// is called and from however many tasks. A failed deletion is retried by the
/// next `cleanup`.
pub struct CloudSandbox {
    provider: Arc<dyn CloudProvider>,
    sandbox_id: String,
    sandbox_type: String,
    timeout: Duration,
    owner: Option<(String, String)>,
    created_at: DateTime<Utc>,
    cleaned: OnceCell<()>,
}

impl std::fmt::Debug for CloudSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudSandbox")
            .field("provider", &self.provider.provider_name())
            .field("sandbox_id", &self.sandbox_id)
            .field("sandbox_type", &self.sandbox_type)
            .finish()
    }
}

impl CloudSandbox {
    /// Adopt `existing_id` or ask the provider for a new sandbox.
    ///
    /// A missing or empty id fails with `Error::Provisioning`. Nothing is
    /// deleted on that path since nothing was created.
    #[tracing::instrument(level = "info", skip(provider, request), fields(provider = %provider.provider_name(), sandbox_type = %request.sandbox_type))]
    pub async fn connect(
        provider: Arc<dyn CloudProvider>,
        request: &CloudSandboxRequest,
        existing_id: Option<String>,
    ) -> Result<Self> {
        let sandbox_id = match existing_id {
            Some(id) => {
                tracing::info!(sandbox_id = %id, "adopting existing cloud sandbox");
                Some(id)
            }
            None => provider
                .create_sandbox(request)
                .await
                .map_err(|e| Error::Provisioning(format!("{} create failed: {e}", provider.provider_name())))?,
        };

        let sandbox_id = match sandbox_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                return Err(Error::Provisioning(format!(
                    "{} returned no sandbox id",
                    provider.provider_name()
                )))
            }
        };

        tracing::info!(%sandbox_id, "cloud sandbox ready");
        Ok(Self {
            provider,
            sandbox_id,
            sandbox_type: request.sandbox_type.clone(),
            timeout: request.timeout,
            owner: None,
            created_at: Utc::now(),
            cleaned: OnceCell::new(),
        })
    }

    pub fn with_owner(mut self, user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        self.owner = Some((user_id.into(), session_id.into()));
        self
    }

    pub fn id(&self) -> &str {
        &self.sandbox_id
    }

    pub fn sandbox_type(&self) -> &str {
        &self.sandbox_type
    }

    pub fn provider_name(&self) -> &str {
        self.provider.provider_name()
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned.initialized()
    }

    /// Tool failures come back as an `isError` response, never as `Err`.
    #[tracing::instrument(level = "debug", skip(self, arguments), fields(sandbox_id = %self.sandbox_id))]
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Value {
        if self.is_cleaned_up() {
            return tool_response::error(format!(
                "sandbox {} has already been cleaned up",
                self.sandbox_id
            ));
        }
        match self.provider.call_tool(&self.sandbox_id, name, arguments).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(tool = %name, %e, "cloud tool call failed");
                tool_response::error(format!("tool {name} failed: {e}"))
            }
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<Value>> {
        self.provider.list_tools(&self.sandbox_id).await
    }

    pub async fn add_mcp_servers(&self, server_configs: Value, overwrite: bool) -> Result<Value> {
        self.provider
            .add_mcp_servers(&self.sandbox_id, server_configs, overwrite)
            .await
    }

    pub fn get_info(&self) -> CloudSandboxInfo {
        CloudSandboxInfo {
            sandbox_id: self.sandbox_id.clone(),
            sandbox_type: self.sandbox_type.clone(),
            provider: self.provider_name().to_string(),
            timeout: self.timeout,
        }
    }

    pub fn sandbox_info(&self) -> SandboxInfo {
        let (user_id, session_id) = match &self.owner {
            Some((u, s)) => (Some(u.clone()), Some(s.clone())),
            None => (None, None),
        };
        SandboxInfo {
            sandbox_id: self.sandbox_id.clone(),
            sandbox_type: self.sandbox_type.clone(),
            backend: BackendKind::Cloud,
            connection: ConnectionInfo::Cloud {
                provider: self.provider_name().to_string(),
            },
            timeout: self.timeout,
            user_id,
            session_id,
            created_at: self.created_at,
        }
    }

    /// Delete the vendor sandbox. Returns whether deletion succeeded; never errors.
    #[tracing::instrument(level = "info", skip(self), fields(sandbox_id = %self.sandbox_id, provider = %self.provider_name()))]
    pub async fn cleanup(&self) -> bool {
        self.cleaned
            .get_or_try_init(|| async {
                match self.provider.delete_sandbox(&self.sandbox_id).await {
                    Ok(true) => {
                        tracing::info!("cloud sandbox deleted");
                        Ok(())
                    }
                    Ok(false) => {
                        tracing::warn!("provider reported cloud sandbox not deleted");
                        Err(())
                    }
                    Err(e) => {
                        tracing::warn!(%e, "failed to delete cloud sandbox");
                        Err(())
                    }
                }
            })
            .await
            .is_ok()
    }

    /// Run `f` with the sandbox, then clean up whether `f` finished or was dropped.
    pub async fn scoped<F, Fut, T>(self: Arc<Self>, f: F) -> T
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut guard = CleanupGuard {
            sandbox: Some(self.clone()),
        };
        let out = f(self).await;
        if let Some(sandbox) = guard.sandbox.take() {
            sandbox.cleanup().await;
        }
        out
    }
}

struct CleanupGuard {
    sandbox: Option<Arc<CloudSandbox>>,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(sandbox) = self.sandbox.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                sandbox.cleanup().await;
                tracing::warn!(sandbox_id = %sandbox.id(), "cloud sandbox cleanup executed from drop");
            });
        } else {
            tracing::warn!(sandbox_id = %sandbox.id(), "no tokio runtime available for cloud sandbox drop cleanup");
        }
    }
}

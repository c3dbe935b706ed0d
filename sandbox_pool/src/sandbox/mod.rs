//! One tool-invocation surface over container and cloud sandboxes.

pub mod client;
pub mod container;
pub mod guard;

pub use client::ToolServerClient;
pub use container::{ContainerSandbox, LaunchRequest};
pub use guard::SandboxGuard;

use crate::cloud::CloudSandbox;
use crate::models::{BackendKind, SandboxInfo};
use crate::{Error, Result};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// A live sandbox. The variant is fixed at construction by the sandbox type's backend.
#[derive(Debug)]
pub enum Sandbox {
    Container(ContainerSandbox),
    Cloud(CloudSandbox),
}

impl Sandbox {
    pub fn id(&self) -> &str {
        match self {
            Self::Container(c) => c.id(),
            Self::Cloud(c) => c.id(),
        }
    }

    pub fn sandbox_type(&self) -> &str {
        match self {
            Self::Container(c) => &c.info().sandbox_type,
            Self::Cloud(c) => c.sandbox_type(),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        match self {
            Self::Container(_) => BackendKind::Container,
            Self::Cloud(_) => BackendKind::Cloud,
        }
    }

    pub fn info(&self) -> SandboxInfo {
        match self {
            Self::Container(c) => c.info().clone(),
            Self::Cloud(c) => c.sandbox_info(),
        }
    }

    /// JSON view of [`Sandbox::info`] for tool-facing callers.
    pub fn get_info(&self) -> Value {
        serde_json::to_value(self.info()).unwrap_or(Value::Null)
    }

    pub async fn list_tools(&self) -> Result<Vec<Value>> {
        match self {
            Self::Container(c) => c.list_tools().await,
            Self::Cloud(c) => c.list_tools().await,
        }
    }

    /// Failures are reported inside the returned response (`isError: true`).
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Value {
        match self {
            Self::Container(c) => c.call_tool(name, arguments).await,
            Self::Cloud(c) => c.call_tool(name, arguments).await,
        }
    }

    pub async fn add_mcp_servers(&self, server_configs: Value, overwrite: bool) -> Result<Value> {
        match self {
            Self::Container(c) => c.add_mcp_servers(server_configs, overwrite).await,
            Self::Cloud(c) => c.add_mcp_servers(server_configs, overwrite).await,
        }
    }

    /// Tear down the backing resource. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        match self {
            Self::Container(c) => c.close().await,
            Self::Cloud(c) => {
                if c.cleanup().await {
                    Ok(())
                } else {
                    Err(Error::Teardown(format!(
                        "{} sandbox {} was not deleted",
                        c.provider_name(),
                        c.id()
                    )))
                }
            }
        }
    }

    /// Run `f`, then close the sandbox whether `f` finished or was dropped.
    pub async fn scoped<F, Fut, T>(self: Arc<Self>, f: F) -> T
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = SandboxGuard::new(self.clone());
        let out = f(self).await;
        if let Err(e) = guard.close().await {
            tracing::warn!(%e, "scoped sandbox close failed");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{cloud_sandbox, RecordingProvider};
    use serde_json::json;

    #[tokio::test]
    async fn cloud_variant_dispatches_through_facade() {
        let provider = RecordingProvider::new("e2b");
        let sandbox = cloud_sandbox(&provider).await;
        assert_eq!(sandbox.backend_kind(), BackendKind::Cloud);
        assert_eq!(sandbox.sandbox_type(), "e2b");
        assert_eq!(sandbox.get_info()["connection"]["provider"], json!("e2b"));

        let out = sandbox
            .call_tool("run_shell_command", Some(json!({"command": "pwd"})))
            .await;
        assert_eq!(out["success"], json!(true));

        let err = sandbox.list_tools().await.unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[tokio::test]
    async fn failed_cloud_delete_surfaces_as_teardown() {
        let provider = RecordingProvider::new("e2b");
        provider.fail_delete("e2b-1");
        let sandbox = cloud_sandbox(&provider).await;
        assert!(matches!(sandbox.close().await, Err(Error::Teardown(_))));
    }

    #[tokio::test]
    async fn scoped_closes_after_body() {
        let provider = RecordingProvider::new("e2b");
        let sandbox = cloud_sandbox(&provider).await;
        let id = sandbox.scoped(|sb| async move { sb.id().to_string() }).await;
        assert_eq!(id, "e2b-1");
        assert_eq!(provider.deleted(), vec!["e2b-1".to_string()]);
    }
}

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// What to ask a vendor for when provisioning a cloud sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudSandboxRequest {
    pub sandbox_type: String,
    /// Vendor-side template or image name, if the vendor needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(with = "crate::models::duration_secs")]
    pub timeout: Duration,
}

/// Primitives a remote sandbox vendor must provide.
///
/// Implementations hold their own client handle; `CloudSandbox` layers the
/// adopt-or-create, at-most-once cleanup and tool-error shaping on top.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    /// Returns the new sandbox id, or `None` if the vendor declined.
    async fn create_sandbox(&self, request: &CloudSandboxRequest) -> Result<Option<String>>;

    /// `Ok(true)` when the sandbox is gone afterwards.
    async fn delete_sandbox(&self, sandbox_id: &str) -> Result<bool>;

    /// `arguments` is forwarded as given, including `None`.
    async fn call_tool(
        &self,
        sandbox_id: &str,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<Value>;

    async fn list_tools(&self, sandbox_id: &str) -> Result<Vec<Value>> {
        let _ = sandbox_id;
        Err(Error::Unsupported(format!(
            "{} does not list tools",
            self.provider_name()
        )))
    }

    async fn add_mcp_servers(
        &self,
        sandbox_id: &str,
        server_configs: Value,
        overwrite: bool,
    ) -> Result<Value> {
        let _ = (sandbox_id, server_configs, overwrite);
        Err(Error::Unsupported(format!(
            "{} does not accept MCP servers",
            self.provider_name()
        )))
    }
}

use crate::config::LocalSandboxSpec;
use crate::container::{ContainerBackend, ContainerRequest, CreatedContainer};
use crate::models::{tool_response, BackendKind, ConnectionInfo, SandboxInfo};
use crate::sandbox::client::ToolServerClient;
use crate::{Error, Result};
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Env var carrying the per-container bearer token for the tool server.
pub const AUTH_TOKEN_ENV: &str = "SANDBOX_AUTH_TOKEN";

const READINESS_LOG_TAIL: usize = 50;

/// Parameters for launching one container sandbox.
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    pub sandbox_type: &'a str,
    pub spec: &'a LocalSandboxSpec,
    pub user_id: &'a str,
    pub session_id: &'a str,
    pub timeout: Duration,
    /// `None` skips the `/healthz` wait.
    pub readiness_timeout: Option<Duration>,
}

/// A sandbox backed by a local container.
///
/// Holds only a weak reference to its backend; the backend owns the port
/// records and outlives every sandbox it handed out.
pub struct ContainerSandbox {
    info: SandboxInfo,
    container_id: String,
    client: ToolServerClient,
    backend: Weak<ContainerBackend>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ContainerSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSandbox")
            .field("container_id", &self.container_id)
            .field("base_url", &self.client.base_url())
            .finish()
    }
}

impl ContainerSandbox {
    /// Create the container, then wait for its tool server.
    ///
    /// A container that never becomes ready is removed before the error is
    /// returned, so nothing leaks on failure.
    #[tracing::instrument(level = "info", skip(backend, req), fields(sandbox_type = %req.sandbox_type, image = %req.spec.image))]
    pub async fn launch(backend: &Arc<ContainerBackend>, req: LaunchRequest<'_>) -> Result<Self> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let mut environment = req.spec.environment.clone();
        environment.insert(AUTH_TOKEN_ENV.to_string(), token.clone());

        let container_req = ContainerRequest {
            image: req.spec.image.clone(),
            name: None,
            ports: req.spec.ports.clone(),
            volumes: req.spec.volumes.clone(),
            environment,
            runtime: req.spec.runtime.clone(),
        };
        let created = backend.create(&container_req).await?;

        match Self::connect_tool_server(backend, &created, &req, token).await {
            Ok(sandbox) => Ok(sandbox),
            Err(e) => {
                if let Err(remove_err) = backend.remove(&created.container_id).await {
                    tracing::warn!(container_id = %created.container_id, %remove_err, "failed to remove unready container");
                }
                Err(e)
            }
        }
    }

    async fn connect_tool_server(
        backend: &Arc<ContainerBackend>,
        created: &CreatedContainer,
        req: &LaunchRequest<'_>,
        token: String,
    ) -> Result<Self> {
        let tool_port = req
            .spec
            .ports
            .first()
            .and_then(|p| created.host_port_for(*p))
            .ok_or_else(|| {
                Error::Provisioning(format!(
                    "sandbox type {} publishes no tool server port",
                    req.sandbox_type
                ))
            })?;
        let base_url = format!("http://{}:{tool_port}", created.host_address);
        let client = ToolServerClient::new(base_url.clone(), Some(token))
            .map_err(|e| Error::Provisioning(format!("tool server client: {e}")))?;

        if let Some(timeout) = req.readiness_timeout {
            if let Err(e) = client.wait_ready(timeout).await {
                let logs = backend.logs(&created.container_id, READINESS_LOG_TAIL).await;
                return Err(Error::Provisioning(format!(
                    "{e}\n--- container logs (last {READINESS_LOG_TAIL} lines) ---\n{logs}"
                )));
            }
        }

        let info = SandboxInfo {
            sandbox_id: created.container_id.clone(),
            sandbox_type: req.sandbox_type.to_string(),
            backend: BackendKind::Container,
            connection: ConnectionInfo::Container {
                host_address: created.host_address.clone(),
                port_map: created.port_map.clone(),
                base_url,
            },
            timeout: req.timeout,
            user_id: Some(req.user_id.to_string()),
            session_id: Some(req.session_id.to_string()),
            created_at: Utc::now(),
        };

        Ok(Self {
            info,
            container_id: created.container_id.clone(),
            client,
            backend: Arc::downgrade(backend),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.container_id
    }

    pub fn info(&self) -> &SandboxInfo {
        &self.info
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn list_tools(&self) -> Result<Vec<Value>> {
        self.client.list_tools().await
    }

    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Value {
        if self.is_closed() {
            return tool_response::error(format!("sandbox {} is closed", self.container_id));
        }
        match self.client.call_tool(name, arguments.as_ref()).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(container_id = %self.container_id, tool = %name, %e, "container tool call failed");
                tool_response::error(format!("tool {name} failed: {e}"))
            }
        }
    }

    pub async fn add_mcp_servers(&self, server_configs: Value, overwrite: bool) -> Result<Value> {
        self.client.add_mcp_servers(server_configs, overwrite).await
    }

    /// Remove the container and release its ports. Later calls are no-ops.
    #[tracing::instrument(level = "info", skip(self), fields(container_id = %self.container_id))]
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(backend) = self.backend.upgrade() else {
            return Err(Error::Teardown(format!(
                "container backend dropped before {} was removed",
                self.container_id
            )));
        };
        backend.remove(&self.container_id).await
    }
}

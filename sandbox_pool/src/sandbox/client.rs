//! HTTP client for the tool server running inside a local container.

use crate::{Error, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Serialize)]
struct ToolCall<'a> {
    name: &'a str,
    arguments: Option<&'a Value>,
}

#[derive(Debug, Deserialize)]
struct ToolList {
    #[serde(default)]
    tools: Vec<Value>,
}

/// One client per container sandbox, pointed at its published tool-server port.
#[derive(Debug, Clone)]
pub struct ToolServerClient {
    base_url: String,
    http: Client,
    auth_token: Option<String>,
}

impl ToolServerClient {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(Error::backend_reqwest)?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            auth_token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.auth_token {
            req.bearer_auth(token)
        } else {
            req
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn health(&self) -> Result<bool> {
        let req = self.apply_auth(
            self.http
                .get(self.url("/healthz"))
                .timeout(Duration::from_secs(5)),
        );
        let resp = req.send().await.map_err(Error::backend_reqwest)?;
        Ok(resp.status().is_success())
    }

    /// Poll `/healthz` until it answers 2xx or `timeout` elapses.
    #[tracing::instrument(level = "info", skip(self), fields(base_url = %self.base_url))]
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let start = std::time::Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut retries: u64 = 0;

        loop {
            match self.health().await {
                Ok(true) => {
                    tracing::info!(
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        retries,
                        "tool server is healthy"
                    );
                    return Ok(());
                }
                Ok(false) => tracing::debug!(retries, "tool server not ready yet"),
                Err(e) => tracing::debug!(retries, %e, "tool server unreachable"),
            }
            retries += 1;

            if tokio::time::Instant::now() + READY_POLL_INTERVAL > deadline {
                return Err(Error::Provisioning(format!(
                    "tool server at {} not ready after {}s",
                    self.base_url,
                    start.elapsed().as_secs()
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn list_tools(&self) -> Result<Vec<Value>> {
        let req = self.apply_auth(self.http.get(self.url("/tools")));
        let resp = req.send().await.map_err(Error::backend_reqwest)?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::BackendMessage(format!(
                "tool server list_tools failed: {body}"
            )));
        }
        let list: ToolList = resp.json().await.map_err(Error::backend_reqwest)?;
        Ok(list.tools)
    }

    #[tracing::instrument(level = "debug", skip(self, arguments))]
    pub async fn call_tool(&self, name: &str, arguments: Option<&Value>) -> Result<Value> {
        let req = self.apply_auth(
            self.http
                .post(self.url("/tools/call"))
                .json(&ToolCall { name, arguments }),
        );
        let resp = req.send().await.map_err(Error::backend_reqwest)?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::BackendMessage(format!(
                "tool server call_tool({name}) failed ({status}): {body}"
            )));
        }
        resp.json::<Value>().await.map_err(Error::backend_reqwest)
    }

    #[tracing::instrument(level = "info", skip(self, server_configs))]
    pub async fn add_mcp_servers(&self, server_configs: Value, overwrite: bool) -> Result<Value> {
        let req = self.apply_auth(
            self.http
                .post(self.url("/mcp/servers"))
                .json(&serde_json::json!({
                    "server_configs": server_configs,
                    "overwrite": overwrite,
                })),
        );
        let resp = req.send().await.map_err(Error::backend_reqwest)?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::BackendMessage(format!(
                "tool server add_mcp_servers failed: {body}"
            )));
        }
        resp.json::<Value>().await.map_err(Error::backend_reqwest)
    }
}

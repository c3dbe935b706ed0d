//! Generic REST vendor: bearer-token JSON API with one resource per sandbox.
//!
//! ```text
//! POST   /sandboxes                       -> {"id": "..."}
//! DELETE /sandboxes/{id}
//! POST   /sandboxes/{id}/tools/call       {"name", "arguments"}
//! GET    /sandboxes/{id}/tools            -> {"tools": [...]}
//! POST   /sandboxes/{id}/mcp/servers      {"server_configs", "overwrite"}
//! ```

use crate::cloud::config::CloudProviderConfig;
use crate::cloud::traits::{CloudProvider, CloudSandboxRequest};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(default, alias = "sandbox_id", alias = "sandboxId")]
    id: Option<String>,
}

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

#[derive(Debug, Clone)]
pub struct RestCloudProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    http: Client,
}

impl RestCloudProvider {
    pub fn initialize_client(cfg: CloudProviderConfig) -> Result<Self> {
        cfg.validate()?;
        let http = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(Error::backend_reqwest)?;
        Ok(Self {
            name: cfg.name,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key,
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn expect_json(&self, op: &str, resp: reqwest::Response) -> Result<Value> {
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::BackendMessage(format!(
                "{} {op} failed ({status}): {body}",
                self.name
            )));
        }
        resp.json::<Value>().await.map_err(Error::backend_reqwest)
    }
}

#[async_trait]
impl CloudProvider for RestCloudProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(level = "info", skip(self, request), fields(provider = %self.name))]
    async fn create_sandbox(&self, request: &CloudSandboxRequest) -> Result<Option<String>> {
        let req = self.apply_auth(self.http.post(self.url("/sandboxes")).json(request));
        let resp = req.send().await.map_err(Error::backend_reqwest)?;
        let body = self.expect_json("create_sandbox", resp).await?;
        let parsed: CreateResponse =
            serde_json::from_value(body).map_err(|e| Error::backend("parse create response", e))?;
        Ok(parsed.id.filter(|id| !id.is_empty()))
    }

    #[tracing::instrument(level = "info", skip(self), fields(provider = %self.name))]
    async fn delete_sandbox(&self, sandbox_id: &str) -> Result<bool> {
        let req = self.apply_auth(
            self.http
                .delete(self.url(&format!("/sandboxes/{sandbox_id}"))),
        );
        let resp = req.send().await.map_err(Error::backend_reqwest)?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(true),
            status => {
                let body = resp.text().await.unwrap_or_default();
                tracing::warn!(%status, %body, "delete_sandbox rejected");
                Ok(false)
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, arguments), fields(provider = %self.name))]
    async fn call_tool(
        &self,
        sandbox_id: &str,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<Value> {
        let req = self.apply_auth(
            self.http
                .post(self.url(&format!("/sandboxes/{sandbox_id}/tools/call")))
                .json(&ToolCall {
                    name,
                    arguments: arguments.as_ref(),
                }),
        );
        let resp = req.send().await.map_err(Error::backend_reqwest)?;
        self.expect_json("call_tool", resp).await
    }

    async fn list_tools(&self, sandbox_id: &str) -> Result<Vec<Value>> {
        let req = self.apply_auth(
            self.http
                .get(self.url(&format!("/sandboxes/{sandbox_id}/tools"))),
        );
        let resp = req.send().await.map_err(Error::backend_reqwest)?;
        let body = self.expect_json("list_tools", resp).await?;
        let list: ToolList =
            serde_json::from_value(body).map_err(|e| Error::backend("parse tool list", e))?;
        Ok(list.tools)
    }

    async fn add_mcp_servers(
        &self,
        sandbox_id: &str,
        server_configs: Value,
        overwrite: bool,
    ) -> Result<Value> {
        let req = self.apply_auth(
            self.http
                .post(self.url(&format!("/sandboxes/{sandbox_id}/mcp/servers")))
                .json(&serde_json::json!({
                    "server_configs": server_configs,
                    "overwrite": overwrite,
                })),
        );
        let resp = req.send().await.map_err(Error::backend_reqwest)?;
        self.expect_json("add_mcp_servers", resp).await
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Which provisioning strategy backs a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Container,
    Cloud,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Cloud => "cloud",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binding table key: one live sandbox per (user, session, sandbox type).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BindingKey {
    pub user_id: String,
    pub session_id: String,
    pub sandbox_type: String,
}

impl BindingKey {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        sandbox_type: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            sandbox_type: sandbox_type.into(),
        }
    }

    /// True when this key belongs to the given (user, session) pair.
    pub fn owned_by(&self, user_id: &str, session_id: &str) -> bool {
        self.user_id == user_id && self.session_id == session_id
    }
}

impl std::fmt::Display for BindingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.session_id, self.sandbox_type)
    }
}

/// How to reach a provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionInfo {
    Container {
        host_address: String,
        /// Container port -> host port.
        port_map: BTreeMap<u16, u16>,
        /// Base URL of the tool server inside the container.
        base_url: String,
    },
    Cloud {
        provider: String,
    },
}

/// Descriptive snapshot of a live sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub sandbox_id: String,
    pub sandbox_type: String,
    pub backend: BackendKind,
    pub connection: ConnectionInfo,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SandboxInfo {
    /// Provider name for cloud sandboxes, `None` for containers.
    pub fn provider(&self) -> Option<&str> {
        match &self.connection {
            ConnectionInfo::Cloud { provider } => Some(provider),
            ConnectionInfo::Container { .. } => None,
        }
    }
}

/// A tool that a caller wants available; its `sandbox_type` selects the backing sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub sandbox_type: String,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, sandbox_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sandbox_type: sandbox_type.into(),
        }
    }
}

/// Builders for the pass-through tool-response shapes.
pub mod tool_response {
    use serde_json::{json, Value};

    /// `{content: [{type: text, text}], isError: true}`.
    pub fn error(message: impl std::fmt::Display) -> Value {
        json!({
            "content": [{"type": "text", "text": message.to_string()}],
            "isError": true,
        })
    }

    /// Whether a tool response reports failure in either of the two wire shapes.
    pub fn is_error(response: &Value) -> bool {
        if let Some(flag) = response.get("isError").and_then(|v| v.as_bool()) {
            return flag;
        }
        matches!(response.get("success").and_then(|v| v.as_bool()), Some(false))
    }
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

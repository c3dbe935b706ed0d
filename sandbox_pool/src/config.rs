use crate::cloud::CloudProviderConfig;
use crate::collections::config::CollectionsConfig;
use crate::container::{ContainerBackendConfig, PortRange, RuntimeConfig, VolumeMount};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A sandbox type served by a local container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSandboxSpec {
    pub image: String,
    /// Container ports to publish. The first one is the tool server.
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// A sandbox type served by a registered cloud provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudSandboxSpec {
    pub provider: String,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum SandboxTypeSpec {
    Local(LocalSandboxSpec),
    Cloud(CloudSandboxSpec),
}

impl SandboxTypeSpec {
    fn validate(&self, name: &str) -> Result<()> {
        match self {
            Self::Local(local) => {
                if local.image.trim().is_empty() {
                    return Err(Error::InvalidInput(format!("sandbox type {name}: image is empty")));
                }
                if local.ports.is_empty() {
                    return Err(Error::InvalidInput(format!(
                        "sandbox type {name}: at least one port is required"
                    )));
                }
            }
            Self::Cloud(cloud) => {
                if cloud.provider.trim().is_empty() {
                    return Err(Error::InvalidInput(format!(
                        "sandbox type {name}: provider is empty"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Port the built-in images serve their tool API on.
pub const TOOL_SERVER_PORT: u16 = 80;

/// Port the `gui` image serves VNC on.
pub const VNC_PORT: u16 = 5900;

/// Built-in local types: `base`, `browser`, `filesystem`, `gui`.
pub fn default_sandbox_types() -> BTreeMap<String, SandboxTypeSpec> {
    ["base", "browser", "filesystem", "gui"]
        .into_iter()
        .map(|name| {
            let mut ports = vec![TOOL_SERVER_PORT];
            if name == "gui" {
                ports.push(VNC_PORT);
            }
            let spec = SandboxTypeSpec::Local(LocalSandboxSpec {
                image: format!("sandbox-pool/{name}:latest"),
                ports,
                environment: BTreeMap::new(),
                volumes: Vec::new(),
                runtime: RuntimeConfig::default(),
            });
            (name.to_string(), spec)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub sandbox_types: BTreeMap<String, SandboxTypeSpec>,
    /// Lifetime advertised on each sandbox and handed to cloud vendors.
    pub default_timeout: Duration,
    /// `None` skips the container `/healthz` wait.
    pub readiness_timeout: Option<Duration>,
    pub worker_pool_size: usize,
    pub container: ContainerBackendConfig,
    pub collections: CollectionsConfig,
    pub cloud_providers: Vec<CloudProviderConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            sandbox_types: default_sandbox_types(),
            default_timeout: Duration::from_secs(3600),
            readiness_timeout: Some(Duration::from_secs(60)),
            worker_pool_size: 16,
            container: ContainerBackendConfig::default(),
            collections: CollectionsConfig::default(),
            cloud_providers: Vec::new(),
        }
    }
}

fn parse_port_range(raw: &str) -> Result<PortRange> {
    let (low, high) = raw
        .split_once("..")
        .or_else(|| raw.split_once('-'))
        .ok_or_else(|| Error::InvalidInput(format!("port range {raw:?} must look like low-high")))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<u16>()
            .map_err(|_| Error::InvalidInput(format!("port range {raw:?} has invalid bound {v:?}")))
    };
    PortRange::new(parse(low)?, parse(high)?)
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    lookup(key)
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| Error::InvalidInput(format!("{key} must be an integer")))
        })
        .transpose()
}

impl PoolConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|k| std::env::var(k).ok())
    }

    /// Start from defaults and override from `SANDBOX_POOL_*` variables.
    ///
    /// `SANDBOX_POOL_SANDBOX_TYPES` holds a JSON object of extra or replacement
    /// types, merged over the built-in ones.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(bin) = lookup("SANDBOX_POOL_DOCKER_BIN") {
            cfg.container.docker_bin = bin;
        }
        if let Some(host) = lookup("SANDBOX_POOL_HOST_ADDRESS") {
            cfg.container.host_address = host;
        }
        if let Some(bind) = lookup("SANDBOX_POOL_BIND_HOST") {
            cfg.container.bind_host = bind;
        }
        if let Some(range) = lookup("SANDBOX_POOL_PORT_RANGE") {
            cfg.container.port_range = parse_port_range(&range)?;
        }
        if let Some(secs) = parse_secs(&lookup, "SANDBOX_POOL_STOP_TIMEOUT_SECS")? {
            cfg.container.stop_timeout_secs = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "SANDBOX_POOL_DEFAULT_TIMEOUT_SECS")? {
            cfg.default_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_secs(&lookup, "SANDBOX_POOL_READINESS_TIMEOUT_SECS")? {
            cfg.readiness_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(size) = lookup("SANDBOX_POOL_WORKER_POOL_SIZE") {
            cfg.worker_pool_size = size.trim().parse::<usize>().map_err(|_| {
                Error::InvalidInput("SANDBOX_POOL_WORKER_POOL_SIZE must be an integer".to_string())
            })?;
        }
        if let Some(raw) = lookup("SANDBOX_POOL_SANDBOX_TYPES") {
            let extra: BTreeMap<String, SandboxTypeSpec> = serde_json::from_str(&raw)
                .map_err(|e| Error::InvalidInput(format!("SANDBOX_POOL_SANDBOX_TYPES: {e}")))?;
            cfg.sandbox_types.extend(extra);
        }

        cfg.collections = CollectionsConfig::from_env_with(&lookup)?;
        cfg.cloud_providers = CloudProviderConfig::list_from_env_with(&lookup)?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            return Err(Error::InvalidInput("worker_pool_size must be > 0".to_string()));
        }
        if self.default_timeout.is_zero() {
            return Err(Error::InvalidInput("default_timeout must be > 0".to_string()));
        }
        for (name, spec) in &self.sandbox_types {
            if name.trim().is_empty() {
                return Err(Error::InvalidInput("sandbox type name is empty".to_string()));
            }
            spec.validate(name)?;
        }
        self.container.validate()?;
        self.collections.validate()?;
        for provider in &self.cloud_providers {
            provider.validate()?;
        }
        Ok(())
    }
}

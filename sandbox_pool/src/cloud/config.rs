use crate::{Error, Result};
use std::time::Duration;

/// Connection settings for one REST cloud vendor.
#[derive(Debug, Clone)]
pub struct CloudProviderConfig {
    /// Name sandbox types refer to, e.g. `"e2b"`.
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl CloudProviderConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Reads `SANDBOX_POOL_CLOUD_PROVIDERS` (comma-separated names) and, per
    /// name, `SANDBOX_POOL_CLOUD_<NAME>_URL`, `_API_KEY` and `_TIMEOUT_SECS`.
    pub fn list_from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Vec<Self>> {
        let Some(names) = lookup("SANDBOX_POOL_CLOUD_PROVIDERS") else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let var = name.to_ascii_uppercase().replace('-', "_");
            let url_key = format!("SANDBOX_POOL_CLOUD_{var}_URL");
            let base_url = lookup(&url_key)
                .ok_or_else(|| Error::InvalidInput(format!("{url_key} is required")))?;
            let timeout = lookup(&format!("SANDBOX_POOL_CLOUD_{var}_TIMEOUT_SECS"))
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(60));
            let cfg = Self {
                name: name.to_string(),
                base_url,
                api_key: lookup(&format!("SANDBOX_POOL_CLOUD_{var}_API_KEY")),
                timeout,
            };
            cfg.validate()?;
            out.push(cfg);
        }
        Ok(out)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("cloud provider name is empty".to_string()));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(Error::InvalidInput(format!(
                "cloud provider {} base_url must be http(s)",
                self.name
            )));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidInput(format!(
                "cloud provider {} timeout must be > 0",
                self.name
            )));
        }
        Ok(())
    }
}

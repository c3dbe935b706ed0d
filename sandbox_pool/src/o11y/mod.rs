//! Process-wide tracing setup.

use crate::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Used when `RUST_LOG` is unset.
    pub default_filter: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LogConfig {
    /// Reads `SANDBOX_POOL_LOG_FORMAT` (`json` | `pretty`) and `SANDBOX_POOL_LOG_FILTER`.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(format) = lookup("SANDBOX_POOL_LOG_FORMAT") {
            cfg.format = match format.trim().to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" | "text" => LogFormat::Pretty,
                other => {
                    return Err(Error::InvalidInput(format!(
                        "SANDBOX_POOL_LOG_FORMAT must be json or pretty, got {other:?}"
                    )))
                }
            };
        }
        if let Some(filter) = lookup("SANDBOX_POOL_LOG_FILTER") {
            cfg.default_filter = filter;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        EnvFilter::try_new(&self.default_filter)
            .map_err(|e| Error::InvalidInput(format!("invalid log filter: {e}")))?;
        Ok(())
    }
}

pub fn init_tracing_from_env() -> Result<()> {
    let cfg = LogConfig::from_env_with(|k| std::env::var(k).ok())?;
    init_tracing(&cfg)
}

/// Install the global subscriber. `Error::Conflict` if one is already set.
pub fn init_tracing(cfg: &LogConfig) -> Result<()> {
    cfg.validate()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.default_filter));
    let fmt = match cfg.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .try_init()
        .map_err(|e| Error::Conflict(format!("tracing already initialized: {e}")))
}

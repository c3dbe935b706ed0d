use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: Option<String>,
}

impl RedisConfig {
    /// URL with any password replaced, for logging.
    pub fn redacted_url(&self) -> String {
        let Some((scheme, rest)) = self.url.split_once("://") else {
            return self.url.clone();
        };
        match rest.rsplit_once('@') {
            Some((creds, host)) => {
                let user = creds.split(':').next().unwrap_or_default();
                format!("{scheme}://{user}:***@{host}")
            }
            None => self.url.clone(),
        }
    }
}

/// Where port reservations and container→ports records live.
#[derive(Debug, Clone, Default)]
pub enum CollectionsConfig {
    /// Single-process allocation.
    #[default]
    Memory,
    /// Allocation shared by every process pointing at the same Redis and prefix.
    Redis(RedisConfig),
}

impl CollectionsConfig {
    /// Reads `SANDBOX_POOL_REDIS_URL` / `SANDBOX_POOL_REDIS_KEY_PREFIX`; absent URL means memory.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let Some(url) = lookup("SANDBOX_POOL_REDIS_URL") else {
            return Ok(Self::Memory);
        };
        let cfg = Self::Redis(RedisConfig {
            url,
            key_prefix: lookup("SANDBOX_POOL_REDIS_KEY_PREFIX")
                .or_else(|| Some("sandbox_pool".to_string())),
        });
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if let Self::Redis(redis) = self {
            if redis.url.trim().is_empty() {
                return Err(Error::InvalidInput("redis.url is empty".to_string()));
            }
            if !redis.url.starts_with("redis://") && !redis.url.starts_with("rediss://") {
                return Err(Error::InvalidInput(
                    "redis.url must use redis:// or rediss://".to_string(),
                ));
            }
        }
        Ok(())
    }
}

//! Keyed collections backing port reservations: in-process or Redis-shared,
//! behind the same two traits so the allocator never knows which it has.

pub mod config;
pub mod memory;
pub mod redis;
pub mod traits;

use crate::collections::config::CollectionsConfig;
use crate::collections::memory::{InMemoryMapping, InMemorySet};
use crate::collections::redis::{RedisMapping, RedisSet};
use crate::collections::traits::{KeyedMapping, KeyedSet};
use crate::Result;
use std::sync::Arc;

/// Set name holding reserved host ports.
pub const PORT_SET_NAME: &str = "ports";

/// Mapping name holding container id -> reserved host ports.
pub const CONTAINER_PORTS_NAME: &str = "container_ports";

/// A set/mapping pair drawn from the same store.
#[derive(Clone)]
pub struct PortCollections {
    pub ports: Arc<dyn KeyedSet>,
    pub containers: Arc<dyn KeyedMapping>,
}

impl PortCollections {
    pub fn in_memory() -> Self {
        Self {
            ports: Arc::new(InMemorySet::new()),
            containers: Arc::new(InMemoryMapping::new()),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn from_config(cfg: &CollectionsConfig) -> Result<Self> {
        cfg.validate()?;
        match cfg {
            CollectionsConfig::Memory => {
                tracing::info!("using in-process port collections");
                Ok(Self::in_memory())
            }
            CollectionsConfig::Redis(redis) => {
                tracing::info!(url = %redis.redacted_url(), "using redis port collections");
                let ports = RedisSet::connect(redis, PORT_SET_NAME).await?;
                let containers = RedisMapping::connect(redis, CONTAINER_PORTS_NAME).await?;
                Ok(Self {
                    ports: Arc::new(ports),
                    containers: Arc::new(containers),
                })
            }
        }
    }
}

//! Reserve-then-verify host port allocation.
//!
//! A candidate is first claimed in the shared port set (atomic `add`), then
//! confirmed with a local bind test. The set only prevents double allocation
//! among allocators sharing it; processes outside this system are visible
//! only through the bind test, so a failed bind gives the claim back.

use crate::collections::PortCollections;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Half-open port range `[low, high)`. Only built through [`PortRange::new`],
/// so `0 < low < high` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    low: u16,
    high: u16,
}

impl PortRange {
    /// Dynamic/private range handed to containers by default.
    pub const DYNAMIC: PortRange = PortRange {
        low: 49152,
        high: 59152,
    };

    pub fn new(low: u16, high: u16) -> Result<Self> {
        if low == 0 || low >= high {
            return Err(Error::InvalidInput(format!(
                "invalid port range ({low}, {high}): need 0 < low < high"
            )));
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> u16 {
        self.low
    }

    pub fn high(&self) -> u16 {
        self.high
    }

    pub fn len(&self) -> usize {
        self.high.saturating_sub(self.low) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.high <= self.low
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.low..self.high
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.low && port < self.high
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.low, self.high)
    }
}

/// Local bind test.
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_bindable(&self, host: &str, port: u16) -> bool;
}

/// Binds a TCP listener and drops it immediately.
pub struct TcpBindProbe;

#[async_trait]
impl PortProbe for TcpBindProbe {
    async fn is_bindable(&self, host: &str, port: u16) -> bool {
        tokio::net::TcpListener::bind((host, port)).await.is_ok()
    }
}

pub struct PortAllocator {
    collections: PortCollections,
    range: PortRange,
    bind_host: String,
    probe: Arc<dyn PortProbe>,
}

impl PortAllocator {
    pub fn new(
        collections: PortCollections,
        range: PortRange,
        bind_host: impl Into<String>,
        probe: Arc<dyn PortProbe>,
    ) -> Self {
        Self {
            collections,
            range,
            bind_host: bind_host.into(),
            probe,
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Reserve `count` ports. On failure nothing stays reserved.
    #[tracing::instrument(level = "debug", skip(self), fields(range = %self.range))]
    pub async fn allocate(&self, count: usize) -> Result<Vec<u16>> {
        let mut reserved: Vec<u16> = Vec::with_capacity(count);
        if count == 0 {
            return Ok(reserved);
        }
        // Unbindable claims whose give-back failed; retried before returning.
        let mut stranded: Vec<u16> = Vec::new();

        for port in self.range.iter() {
            if reserved.len() == count {
                break;
            }
            let member = port.to_string();
            match self.collections.ports.add(&member).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    self.release_ports(&reserved).await;
                    self.return_stranded(&stranded).await;
                    return Err(e);
                }
            }

            if self.probe.is_bindable(&self.bind_host, port).await {
                reserved.push(port);
                continue;
            }

            tracing::debug!(port, "port claimed but bind test failed, giving it back");
            if let Err(e) = self.collections.ports.remove(&member).await {
                tracing::warn!(port, %e, "failed to return unbindable port to the pool");
                stranded.push(port);
            }
        }
        self.return_stranded(&stranded).await;

        if reserved.len() < count {
            self.release_ports(&reserved).await;
            return Err(Error::Provisioning(format!(
                "no free ports in {} (needed {count}, found {})",
                self.range,
                reserved.len()
            )));
        }
        Ok(reserved)
    }

    async fn return_stranded(&self, ports: &[u16]) {
        if ports.is_empty() {
            return;
        }
        let failures = self.release_ports(ports).await;
        if failures > 0 {
            tracing::warn!(failures, "unbindable ports still reserved after retry");
        }
    }

    /// Persist container → ports so `release_container` can find them later.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn record(&self, container_id: &str, ports: &[u16]) -> Result<()> {
        self.collections
            .containers
            .set(container_id, serde_json::json!(ports))
            .await
    }

    /// Ports recorded for a container, or `None` if there is no record.
    pub async fn ports_for(&self, container_id: &str) -> Result<Option<Vec<u16>>> {
        let Some(raw) = self.collections.containers.get(container_id).await? else {
            return Ok(None);
        };
        let ports: Vec<u16> = serde_json::from_value(raw)
            .map_err(|e| Error::backend("decode container ports", e))?;
        Ok(Some(ports))
    }

    /// Drop a container's record and return its ports to the pool.
    ///
    /// Every port is attempted even if some removals fail; the record is deleted last.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn release_container(&self, container_id: &str) -> Result<Vec<u16>> {
        let ports = self.ports_for(container_id).await?.unwrap_or_default();
        let failures = self.release_ports(&ports).await;
        self.collections.containers.delete(container_id).await?;
        if failures > 0 {
            return Err(Error::BackendMessage(format!(
                "{failures} port(s) of {container_id} could not be released"
            )));
        }
        Ok(ports)
    }

    /// Best-effort removal from the port set. Returns how many removals failed.
    pub async fn release_ports(&self, ports: &[u16]) -> usize {
        let mut failures = 0;
        for port in ports {
            if let Err(e) = self.collections.ports.remove(&port.to_string()).await {
                tracing::warn!(port, %e, "failed to release port");
                failures += 1;
            }
        }
        failures
    }

    /// Currently reserved ports, parsed from the shared set.
    pub async fn reserved(&self) -> Result<Vec<u16>> {
        let mut ports: Vec<u16> = self
            .collections
            .ports
            .to_list()
            .await?
            .iter()
            .filter_map(|p| p.parse().ok())
            .collect();
        ports.sort_unstable();
        Ok(ports)
    }

    pub fn collections(&self) -> &PortCollections {
        &self.collections
    }
}

//! Sandbox lifecycle and pooling.
//!
//! Provisions isolated tool-execution sandboxes (local containers or cloud
//! vendor sandboxes), binds them to (user, session, sandbox type), and tears
//! them down when the session ends.

pub mod cloud;
pub mod collections;
pub mod config;
pub mod container;
pub mod error;
pub mod models;
pub mod o11y;
pub mod pool;
pub mod sandbox;
pub mod service;

#[cfg(test)]
mod test_support;

pub use cloud::{CloudProvider, CloudProviderConfig, CloudSandbox, RestCloudProvider};
pub use collections::config::{CollectionsConfig, RedisConfig};
pub use collections::traits::{KeyedMapping, KeyedSet};
pub use config::{PoolConfig, SandboxTypeSpec};
pub use container::{ContainerBackend, ContainerBackendConfig, ContainerStatus, PortRange};
pub use error::{Error, Result};
pub use models::{BackendKind, BindingKey, ConnectionInfo, SandboxInfo, ToolSpec};
pub use pool::WorkerPool;
pub use sandbox::{Sandbox, SandboxGuard};
pub use service::{IdleReaper, ReleaseReport, SandboxService};

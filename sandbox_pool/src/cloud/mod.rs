//! Remote sandbox vendors.

pub mod config;
pub mod rest;
pub mod sandbox;
pub mod traits;

pub use config::CloudProviderConfig;
pub use rest::RestCloudProvider;
pub use sandbox::{CloudSandbox, CloudSandboxInfo};
pub use traits::{CloudProvider, CloudSandboxRequest};

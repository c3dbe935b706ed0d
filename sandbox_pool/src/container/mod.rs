//! Local container backend: docker CLI driver plus host port allocation.

pub mod docker;
pub mod models;
pub mod ports;
pub mod runner;

pub use docker::{ContainerBackend, ContainerBackendConfig};
pub use models::{
    ContainerInspect, ContainerRequest, ContainerStatus, CreatedContainer, RuntimeConfig,
    VolumeMount,
};
pub use ports::{PortAllocator, PortProbe, PortRange, TcpBindProbe};
pub use runner::{CmdOutput, CommandRunner, TokioCommandRunner};

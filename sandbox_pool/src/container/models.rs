use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Host path mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeMount {
    /// `-v` argument value.
    pub fn to_flag(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{mode}", self.host_path, self.container_path)
    }
}

/// Engine-level knobs applied at `docker run`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// e.g. `"2g"`.
    #[serde(default)]
    pub memory: Option<String>,
    /// e.g. `"1.5"`.
    #[serde(default)]
    pub cpus: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub shm_size: Option<String>,
    /// Extra flags passed through before the image name.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Command override appended after the image name.
    #[serde(default)]
    pub command: Vec<String>,
}

impl RuntimeConfig {
    pub fn to_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        let pairs = [
            ("--memory", &self.memory),
            ("--cpus", &self.cpus),
            ("--network", &self.network),
            ("--shm-size", &self.shm_size),
        ];
        for (flag, value) in pairs {
            if let Some(v) = value {
                flags.push(flag.to_string());
                flags.push(v.clone());
            }
        }
        flags.extend(self.extra_args.iter().cloned());
        flags
    }
}

/// Input to `ContainerBackend::create`.
#[derive(Debug, Clone, Default)]
pub struct ContainerRequest {
    pub image: String,
    /// Container name; generated when absent.
    pub name: Option<String>,
    /// Container ports to publish. One host port is allocated per entry.
    pub ports: Vec<u16>,
    pub volumes: Vec<VolumeMount>,
    pub environment: BTreeMap<String, String>,
    pub runtime: RuntimeConfig,
}

/// A container that was launched and whose ports are recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedContainer {
    pub container_id: String,
    pub name: String,
    pub image: String,
    /// Host ports in the same order as `ContainerRequest::ports`.
    pub host_ports: Vec<u16>,
    /// Container port -> host port.
    pub port_map: BTreeMap<u16, u16>,
    pub host_address: String,
}

impl CreatedContainer {
    pub fn host_port_for(&self, container_port: u16) -> Option<u16> {
        self.port_map.get(&container_port).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    /// The container no longer exists.
    NotFound,
    Unknown(String),
}

impl ContainerStatus {
    pub fn from_engine(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Read-only view of a container, parsed from `docker inspect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInspect {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub started_at: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct EngineInspect {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: Option<EngineConfig>,
    #[serde(default)]
    pub state: Option<EngineState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct EngineConfig {
    #[serde(default)]
    pub image: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct EngineState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub started_at: Option<String>,
}

impl From<EngineInspect> for ContainerInspect {
    fn from(raw: EngineInspect) -> Self {
        let (status, started_at) = match raw.state {
            Some(s) => (ContainerStatus::from_engine(&s.status), s.started_at),
            None => (ContainerStatus::Unknown(String::new()), None),
        };
        Self {
            id: raw.id,
            name: raw.name.trim_start_matches('/').to_string(),
            image: raw.config.map(|c| c.image).unwrap_or_default(),
            status,
            started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_flags_in_stable_order() {
        let rt = RuntimeConfig {
            memory: Some("2g".into()),
            cpus: None,
            network: Some("sandboxes".into()),
            shm_size: None,
            extra_args: vec!["--cap-drop=ALL".into()],
            command: vec![],
        };
        assert_eq!(
            rt.to_flags(),
            vec!["--memory", "2g", "--network", "sandboxes", "--cap-drop=ALL"]
        );
    }

    #[test]
    fn volume_flag_includes_mode() {
        let v = VolumeMount {
            host_path: "/data".into(),
            container_path: "/workspace".into(),
            read_only: true,
        };
        assert_eq!(v.to_flag(), "/data:/workspace:ro");
    }

    #[test]
    fn parses_engine_inspect() {
        let raw: Vec<EngineInspect> = serde_json::from_str(
            r#"[{"Id":"abc","Name":"/sandbox-base","Config":{"Image":"img:1"},
                 "State":{"Status":"running","StartedAt":"2026-01-01T00:00:00Z"}}]"#,
        )
        .unwrap();
        let inspect: ContainerInspect = raw.into_iter().next().unwrap().into();
        assert_eq!(inspect.name, "sandbox-base");
        assert_eq!(inspect.image, "img:1");
        assert!(inspect.status.is_running());
    }

    #[test]
    fn unknown_engine_state_is_preserved() {
        assert_eq!(
            ContainerStatus::from_engine("weird"),
            ContainerStatus::Unknown("weird".into())
        );
    }
}

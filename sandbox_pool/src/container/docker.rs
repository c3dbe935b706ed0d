//! Docker container backend.
//!
//! Shells out to the `docker` CLI through a [`CommandRunner`] and owns host
//! port allocation for the containers it creates. Every failure path of
//! `create` hands reserved ports back and removes any half-created container.

use crate::collections::PortCollections;
use crate::container::models::{
    ContainerInspect, ContainerRequest, ContainerStatus, CreatedContainer, EngineInspect,
};
use crate::container::ports::{PortAllocator, PortProbe, PortRange};
use crate::container::runner::{CmdOutput, CommandRunner};
use crate::{Error, Result};
use futures_util::TryStreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ContainerBackendConfig {
    pub docker_bin: String,
    /// Address callers use to reach published ports.
    pub host_address: String,
    /// Address used for the local bind test and for publishing.
    pub bind_host: String,
    pub port_range: PortRange,
    /// Grace period passed to `docker stop -t`.
    pub stop_timeout_secs: u64,
}

impl Default for ContainerBackendConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            host_address: "127.0.0.1".to_string(),
            bind_host: "0.0.0.0".to_string(),
            port_range: PortRange::DYNAMIC,
            stop_timeout_secs: 10,
        }
    }
}

impl ContainerBackendConfig {
    pub fn validate(&self) -> Result<()> {
        if self.docker_bin.trim().is_empty() {
            return Err(Error::InvalidInput("docker_bin is empty".to_string()));
        }
        if self.host_address.trim().is_empty() {
            return Err(Error::InvalidInput("host_address is empty".to_string()));
        }
        if self.bind_host.trim().is_empty() {
            return Err(Error::InvalidInput("bind_host is empty".to_string()));
        }
        Ok(())
    }
}

pub struct ContainerBackend {
    cfg: ContainerBackendConfig,
    runner: Arc<dyn CommandRunner>,
    ports: PortAllocator,
}

impl ContainerBackend {
    #[tracing::instrument(level = "debug", skip(runner, collections, probe))]
    pub fn new(
        cfg: ContainerBackendConfig,
        runner: Arc<dyn CommandRunner>,
        collections: PortCollections,
        probe: Arc<dyn PortProbe>,
    ) -> Result<Self> {
        cfg.validate()?;
        let ports = PortAllocator::new(collections, cfg.port_range, cfg.bind_host.clone(), probe);
        Ok(Self { cfg, runner, ports })
    }

    pub fn host_address(&self) -> &str {
        &self.cfg.host_address
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    async fn docker<I, S>(&self, args: I) -> Result<CmdOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        self.runner.run(&self.cfg.docker_bin, &args).await
    }

    async fn image_present(&self, image: &str) -> Result<bool> {
        let out = self
            .docker(["image", "inspect", "--format", "{{.Id}}", image])
            .await?;
        Ok(out.success())
    }

    /// Check-then-pull. A failed pull is tolerated if the image shows up
    /// anyway (another process pulled it concurrently).
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_present(image).await? {
            return Ok(());
        }

        tracing::info!("image not present locally, pulling");
        let pull = self.docker(["pull", image]).await?;
        if pull.success() {
            return Ok(());
        }

        if self.image_present(image).await? {
            tracing::info!("pull failed but image appeared, assuming concurrent pull");
            return Ok(());
        }

        Err(Error::Provisioning(format!(
            "image {image} unavailable: {}",
            pull.stderr.trim()
        )))
    }

    fn run_args(req: &ContainerRequest, name: &str, host_ports: &[u16], bind_host: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        for (container_port, host_port) in req.ports.iter().zip(host_ports) {
            args.push("-p".to_string());
            args.push(format!("{bind_host}:{host_port}:{container_port}"));
        }
        for volume in &req.volumes {
            args.push("-v".to_string());
            args.push(volume.to_flag());
        }
        for (key, value) in &req.environment {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.extend(req.runtime.to_flags());
        args.push(req.image.clone());
        args.extend(req.runtime.command.iter().cloned());
        args
    }

    /// Pull if needed, reserve host ports, launch, and record the container.
    ///
    /// Returns `Error::Provisioning` on any failure, with no ports left
    /// reserved and no container left behind.
    #[tracing::instrument(level = "info", skip(self, req), fields(image = %req.image, ports = req.ports.len()))]
    pub async fn create(&self, req: &ContainerRequest) -> Result<CreatedContainer> {
        if req.image.trim().is_empty() {
            return Err(Error::InvalidInput("container image is empty".to_string()));
        }

        self.ensure_image(&req.image)
            .await
            .map_err(|e| match e {
                Error::Provisioning(_) => e,
                other => Error::Provisioning(format!("image check failed: {other}")),
            })?;

        let host_ports = self.ports.allocate(req.ports.len()).await?;
        let name = req
            .name
            .clone()
            .unwrap_or_else(|| format!("sandbox-{}", ulid::Ulid::new().to_string().to_lowercase()));

        let args = Self::run_args(req, &name, &host_ports, &self.cfg.bind_host);
        let container_id = match self.docker(args).await {
            Ok(out) if out.success() && !out.stdout.trim().is_empty() => out.stdout.trim().to_string(),
            Ok(out) => {
                self.abandon(&name, &host_ports).await;
                return Err(Error::Provisioning(format!(
                    "docker run failed: {}",
                    out.stderr.trim()
                )));
            }
            Err(e) => {
                self.abandon(&name, &host_ports).await;
                return Err(Error::Provisioning(format!("docker run failed: {e}")));
            }
        };

        if let Err(e) = self.ports.record(&container_id, &host_ports).await {
            self.abandon(&container_id, &host_ports).await;
            return Err(Error::Provisioning(format!(
                "failed to record ports for {container_id}: {e}"
            )));
        }

        let port_map: BTreeMap<u16, u16> = req
            .ports
            .iter()
            .copied()
            .zip(host_ports.iter().copied())
            .collect();

        tracing::info!(%container_id, %name, ?host_ports, "container created");
        Ok(CreatedContainer {
            container_id,
            name,
            image: req.image.clone(),
            host_ports,
            port_map,
            host_address: self.cfg.host_address.clone(),
        })
    }

    /// Failure-path cleanup for `create`: remove whatever the engine left and free the ports.
    async fn abandon(&self, container: &str, host_ports: &[u16]) {
        match self.docker(["rm", "-f", container]).await {
            Ok(out) if out.success() || out.is_not_found() => {}
            Ok(out) => {
                tracing::warn!(%container, stderr = %out.stderr.trim(), "failed to remove container after failed create")
            }
            Err(e) => tracing::warn!(%container, %e, "failed to remove container after failed create"),
        }
        self.ports.release_ports(host_ports).await;
    }

    /// Start a stopped container. `Ok(false)` if it does not exist.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn start(&self, container_id: &str) -> Result<bool> {
        let out = self.docker(["start", container_id]).await?;
        if out.success() {
            return Ok(true);
        }
        if out.is_not_found() {
            return Ok(false);
        }
        Err(Error::BackendMessage(format!(
            "docker start failed for {container_id}: {}",
            out.stderr.trim()
        )))
    }

    /// Stop a container. `Ok(false)` if it does not exist.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn stop(&self, container_id: &str) -> Result<bool> {
        let timeout = self.cfg.stop_timeout_secs.to_string();
        let out = self.docker(["stop", "-t", timeout.as_str(), container_id]).await?;
        if out.success() {
            return Ok(true);
        }
        if out.is_not_found() {
            return Ok(false);
        }
        Err(Error::BackendMessage(format!(
            "docker stop failed for {container_id}: {}",
            out.stderr.trim()
        )))
    }

    /// Force-remove a container and release its ports.
    ///
    /// Ports are released even when engine removal fails; that failure is
    /// still reported as `Error::Teardown` so the caller can log it.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn remove(&self, container_id: &str) -> Result<()> {
        let engine_error = match self.docker(["rm", "-f", container_id]).await {
            Ok(out) if out.success() || out.is_not_found() => None,
            Ok(out) => Some(out.stderr.trim().to_string()),
            Err(e) => Some(e.to_string()),
        };

        let port_error = match self.ports.release_container(container_id).await {
            Ok(ports) => {
                tracing::debug!(?ports, "released container ports");
                None
            }
            Err(e) => Some(e.to_string()),
        };

        match (engine_error, port_error) {
            (None, None) => {
                tracing::info!("container removed");
                Ok(())
            }
            (engine, ports) => {
                let msg = [engine.map(|e| format!("engine: {e}")), ports.map(|e| format!("ports: {e}"))]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join("; ");
                tracing::warn!(%msg, "container removal incomplete");
                Err(Error::Teardown(format!("{container_id}: {msg}")))
            }
        }
    }

    /// `None` when the container does not exist.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn inspect(&self, container_id: &str) -> Result<Option<ContainerInspect>> {
        let out = self
            .docker(["inspect", "--type", "container", container_id])
            .await?;
        if !out.success() {
            if out.is_not_found() {
                return Ok(None);
            }
            return Err(Error::BackendMessage(format!(
                "docker inspect failed for {container_id}: {}",
                out.stderr.trim()
            )));
        }
        let parsed: Vec<EngineInspect> = serde_json::from_str(&out.stdout)
            .map_err(|e| Error::backend("parse docker inspect", e))?;
        Ok(parsed.into_iter().next().map(ContainerInspect::from))
    }

    pub async fn get_status(&self, container_id: &str) -> Result<ContainerStatus> {
        Ok(self
            .inspect(container_id)
            .await?
            .map(|i| i.status)
            .unwrap_or(ContainerStatus::NotFound))
    }

    /// Last `tail` log lines. Best-effort: empty on any failure.
    pub async fn logs(&self, container_id: &str, tail: usize) -> String {
        let tail = tail.to_string();
        match self.docker(["logs", "--tail", tail.as_str(), container_id]).await {
            Ok(out) => format!("{}{}", out.stdout, out.stderr),
            Err(_) => String::new(),
        }
    }

    /// Release port records whose container no longer exists, e.g. after a crash.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn reclaim_orphans(&self) -> Result<usize> {
        let ids: Vec<String> = self.ports.collections().containers.scan("").try_collect().await?;
        let mut reclaimed = 0;
        for id in ids {
            if self.inspect(&id).await?.is_some() {
                continue;
            }
            match self.ports.release_container(&id).await {
                Ok(ports) => {
                    tracing::info!(container_id = %id, ?ports, "reclaimed orphaned ports");
                    reclaimed += 1;
                }
                Err(e) => tracing::warn!(container_id = %id, %e, "failed to reclaim orphaned ports"),
            }
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{container_backend, FakeDocker};

    fn request(image: &str, ports: Vec<u16>) -> ContainerRequest {
        ContainerRequest {
            image: image.to_string(),
            ports,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_allocates_ports_sequentially_until_exhausted() {
        let docker = FakeDocker::with_images(&["img"]);
        let backend = container_backend(docker.clone(), 9000, 9003, &[]);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let created = backend.create(&request("img", vec![1])).await.unwrap();
            seen.push(created.host_ports[0]);
        }
        assert_eq!(seen, vec![9000, 9001, 9002]);

        let err = backend.create(&request("img", vec![1])).await.unwrap_err();
        assert!(err.to_string().contains("no free ports"), "{err}");
        assert_eq!(docker.count("run"), 3);
    }

    #[tokio::test]
    async fn create_publishes_mapping_and_records_ports() {
        let docker = FakeDocker::with_images(&["img"]);
        let backend = container_backend(docker.clone(), 9000, 9010, &[]);
        let mut req = request("img", vec![80, 5900]);
        req.environment.insert("TOKEN".into(), "t".into());

        let created = backend.create(&req).await.unwrap();
        assert_eq!(created.host_port_for(80), Some(9000));
        assert_eq!(created.host_port_for(5900), Some(9001));
        assert_eq!(created.host_address, "127.0.0.1");

        let run = docker.last_call("run").unwrap();
        assert!(run.contains(&"0.0.0.0:9000:80".to_string()));
        assert!(run.contains(&"TOKEN=t".to_string()));
        assert_eq!(
            backend.ports().ports_for(&created.container_id).await.unwrap(),
            Some(vec![9000, 9001])
        );
    }

    #[tokio::test]
    async fn pulls_missing_image_and_tolerates_pull_race() {
        let docker = FakeDocker::with_images(&[]);
        let backend = container_backend(docker.clone(), 9000, 9010, &[]);
        backend.create(&request("fresh", vec![80])).await.unwrap();
        assert_eq!(docker.count("pull"), 1);

        let racing = FakeDocker::with_images(&[]);
        racing.pull_races();
        let backend = container_backend(racing.clone(), 9000, 9010, &[]);
        backend.create(&request("contended", vec![80])).await.unwrap();
    }

    #[tokio::test]
    async fn failed_pull_is_a_provisioning_error_without_reservations() {
        let docker = FakeDocker::with_images(&[]);
        docker.fail_pulls();
        let backend = container_backend(docker.clone(), 9000, 9010, &[]);
        let err = backend.create(&request("missing", vec![80])).await.unwrap_err();
        assert!(err.is_provisioning());
        assert_eq!(docker.count("run"), 0);
        assert!(backend.ports().reserved().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_run_releases_ports_and_removes_leftover() {
        let docker = FakeDocker::with_images(&["img"]);
        docker.fail_runs();
        let backend = container_backend(docker.clone(), 9000, 9010, &[]);
        let err = backend.create(&request("img", vec![80, 81])).await.unwrap_err();
        assert!(err.is_provisioning());
        assert!(backend.ports().reserved().await.unwrap().is_empty());
        assert_eq!(docker.count("rm"), 1);
    }

    #[tokio::test]
    async fn remove_releases_ports_even_when_engine_fails() {
        let docker = FakeDocker::with_images(&["img"]);
        let backend = container_backend(docker.clone(), 9000, 9010, &[]);
        let created = backend.create(&request("img", vec![80])).await.unwrap();

        docker.fail_rm(&created.container_id);
        let err = backend.remove(&created.container_id).await.unwrap_err();
        assert!(matches!(err, Error::Teardown(_)));
        assert!(backend.ports().reserved().await.unwrap().is_empty());
        assert_eq!(backend.ports().ports_for(&created.container_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn lifecycle_ops_are_idempotent_for_missing_containers() {
        let docker = FakeDocker::with_images(&["img"]);
        let backend = container_backend(docker.clone(), 9000, 9010, &[]);
        let created = backend.create(&request("img", vec![80])).await.unwrap();
        let id = created.container_id.clone();

        assert_eq!(backend.get_status(&id).await.unwrap(), ContainerStatus::Running);
        assert!(backend.stop(&id).await.unwrap());
        assert_eq!(backend.get_status(&id).await.unwrap(), ContainerStatus::Exited);
        assert!(backend.start(&id).await.unwrap());

        backend.remove(&id).await.unwrap();
        backend.remove(&id).await.unwrap();
        assert!(!backend.stop(&id).await.unwrap());
        assert!(!backend.start(&id).await.unwrap());
        assert_eq!(backend.inspect(&id).await.unwrap(), None);
        assert_eq!(backend.get_status(&id).await.unwrap(), ContainerStatus::NotFound);
    }

    #[tokio::test]
    async fn reclaim_orphans_frees_ports_of_vanished_containers() {
        let docker = FakeDocker::with_images(&["img"]);
        let backend = container_backend(docker.clone(), 9000, 9010, &[]);
        let kept = backend.create(&request("img", vec![80])).await.unwrap();
        let lost = backend.create(&request("img", vec![80])).await.unwrap();

        docker.forget(&lost.container_id);
        assert_eq!(backend.reclaim_orphans().await.unwrap(), 1);
        assert_eq!(backend.ports().reserved().await.unwrap(), kept.host_ports);
    }
}

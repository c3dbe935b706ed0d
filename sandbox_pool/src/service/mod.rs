//! Session-scoped sandbox pooling.
//!
//! Maps (user, session, sandbox type) to one live [`Sandbox`]. The first
//! `connect` for a key provisions; later calls reuse. Calls for the same key
//! are serialized on that key's slot lock; distinct keys never wait on each other.

pub mod reaper;

pub use reaper::IdleReaper;

use crate::cloud::{CloudProvider, CloudSandbox, CloudSandboxRequest, RestCloudProvider};
use crate::collections::PortCollections;
use crate::config::{PoolConfig, SandboxTypeSpec};
use crate::container::{ContainerBackend, TcpBindProbe, TokioCommandRunner};
use crate::models::{BackendKind, BindingKey, ToolSpec};
use crate::pool::WorkerPool;
use crate::sandbox::{ContainerSandbox, LaunchRequest, Sandbox};
use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Per-key state. `None` means absent or still provisioning.
struct Slot {
    sandbox: Mutex<Option<Arc<Sandbox>>>,
    last_used_ms: AtomicI64,
    /// Callers handed the bound sandbox after the one that provisioned it.
    /// Only changed under the `sandbox` lock.
    reuses: AtomicUsize,
}

impl Slot {
    fn new() -> Self {
        Self {
            sandbox: Mutex::new(None),
            last_used_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            reuses: AtomicUsize::new(0),
        }
    }

    fn touch(&self) {
        self.last_used_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    fn last_used(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_used_ms.load(Ordering::SeqCst))
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// One row of [`SandboxService::list_bindings`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BindingSummary {
    pub key: BindingKey,
    pub sandbox_id: String,
    pub backend: BackendKind,
    pub last_used_at: DateTime<Utc>,
}

/// Outcome of a release or stop. Failures are logged and listed, never raised.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReleaseReport {
    /// Sandbox ids torn down cleanly.
    pub released: Vec<String>,
    /// `(sandbox_id, error)` for teardowns that failed.
    pub failed: Vec<(String, String)>,
}

impl ReleaseReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn merge(&mut self, other: ReleaseReport) {
        self.released.extend(other.released);
        self.failed.extend(other.failed);
    }
}

struct ServiceInner {
    config: PoolConfig,
    bindings: DashMap<BindingKey, Arc<Slot>>,
    providers: DashMap<String, Arc<dyn CloudProvider>>,
    containers: Arc<ContainerBackend>,
    pool: WorkerPool,
}

/// Cheap to clone; all clones share one binding table.
#[derive(Clone)]
pub struct SandboxService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for SandboxService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxService")
            .field("bindings", &self.inner.bindings.len())
            .field("providers", &self.inner.providers.len())
            .finish()
    }
}

impl SandboxService {
    pub fn new(config: PoolConfig, containers: Arc<ContainerBackend>) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new(config.worker_pool_size)?;
        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                bindings: DashMap::new(),
                providers: DashMap::new(),
                containers,
                pool,
            }),
        })
    }

    /// Build the docker backend, shared collections and REST providers the config names.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn from_config(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let collections = PortCollections::from_config(&config.collections).await?;
        let containers = Arc::new(ContainerBackend::new(
            config.container.clone(),
            Arc::new(TokioCommandRunner),
            collections,
            Arc::new(TcpBindProbe),
        )?);

        match containers.reclaim_orphans().await {
            Ok(0) => {}
            Ok(n) => tracing::info!(reclaimed = n, "reclaimed orphaned port records"),
            Err(e) => tracing::warn!(%e, "orphan reclamation failed"),
        }

        let provider_cfgs = config.cloud_providers.clone();
        let service = Self::new(config, containers)?;
        for cfg in provider_cfgs {
            let provider = RestCloudProvider::initialize_client(cfg)?;
            service.register_provider(Arc::new(provider));
        }
        Ok(service)
    }

    /// Returns the provider previously registered under the same name, if any.
    pub fn register_provider(&self, provider: Arc<dyn CloudProvider>) -> Option<Arc<dyn CloudProvider>> {
        let name = provider.provider_name().to_string();
        tracing::info!(provider = %name, "registered cloud provider");
        self.inner.providers.insert(name, provider)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn containers(&self) -> &Arc<ContainerBackend> {
        &self.inner.containers
    }

    /// Return one sandbox per requested type, provisioning those not yet bound.
    ///
    /// Types named by `tools` are added to `sandbox_types`. Every type is
    /// checked before anything is provisioned. If any type fails, sandboxes
    /// this call created are torn down again and the error is returned.
    /// A sandbox another caller has already been handed stays bound.
    #[tracing::instrument(level = "info", skip_all, fields(%session_id, %user_id))]
    pub async fn connect(
        &self,
        session_id: &str,
        user_id: &str,
        sandbox_types: &[String],
        tools: Option<&[ToolSpec]>,
    ) -> Result<Vec<Arc<Sandbox>>> {
        if session_id.trim().is_empty() || user_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "session_id and user_id are required".to_string(),
            ));
        }

        let mut types: Vec<String> = Vec::new();
        let tool_types = tools.unwrap_or_default().iter().map(|t| &t.sandbox_type);
        for t in sandbox_types.iter().chain(tool_types) {
            if !types.contains(t) {
                types.push(t.clone());
            }
        }
        for t in &types {
            self.inner.backend_for(t)?;
        }

        let acquisitions = types.iter().map(|t| {
            let key = BindingKey::new(user_id, session_id, t.as_str());
            let inner = self.inner.clone();
            async move {
                let task = tokio::spawn({
                    let key = key.clone();
                    async move { inner.acquire(key).await }
                });
                let result = task
                    .await
                    .map_err(|e| Error::BackendMessage(format!("provisioning task failed: {e}")))
                    .and_then(|r| r);
                (key, result)
            }
        });
        let results = futures_util::future::join_all(acquisitions).await;

        let mut sandboxes = Vec::with_capacity(results.len());
        let mut fresh = Vec::new();
        let mut first_error = None;
        for (key, result) in results {
            match result {
                Ok((sandbox, created)) => {
                    if created {
                        fresh.push((key, sandbox.clone()));
                    }
                    sandboxes.push(sandbox);
                }
                Err(e) => {
                    tracing::warn!(%key, %e, "sandbox provisioning failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            for (key, sandbox) in fresh {
                if let Some(Err(rollback)) = self.inner.unbind(&key, Some(&sandbox)).await {
                    tracing::warn!(%key, %rollback, "rollback teardown failed");
                }
            }
            return Err(e);
        }
        Ok(sandboxes)
    }

    /// Tear down every binding of (user, session). One failure never stops the others.
    #[tracing::instrument(level = "info", skip_all, fields(%session_id, %user_id))]
    pub async fn release(&self, session_id: &str, user_id: &str) -> ReleaseReport {
        let keys: Vec<BindingKey> = self
            .inner
            .bindings
            .iter()
            .filter(|e| e.key().owned_by(user_id, session_id))
            .map(|e| e.key().clone())
            .collect();
        self.inner.teardown(keys).await
    }

    /// Tear down every binding the service holds.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn stop(&self) -> ReleaseReport {
        let keys: Vec<BindingKey> = self.inner.bindings.iter().map(|e| e.key().clone()).collect();
        let report = self.inner.teardown(keys).await;
        tracing::info!(
            released = report.released.len(),
            failed = report.failed.len(),
            "sandbox service stopped"
        );
        report
    }

    /// Live sandbox for a key. Waits if that key is mid-provisioning.
    pub async fn get(
        &self,
        session_id: &str,
        user_id: &str,
        sandbox_type: &str,
    ) -> Option<Arc<Sandbox>> {
        let key = BindingKey::new(user_id, session_id, sandbox_type);
        let slot = self.inner.bindings.get(&key).map(|s| s.value().clone())?;
        let current = slot.sandbox.lock().await;
        current.clone()
    }

    /// Snapshot of live bindings. Keys mid-provisioning are skipped.
    pub fn list_bindings(&self) -> Vec<BindingSummary> {
        let mut out: Vec<BindingSummary> = self
            .inner
            .bindings
            .iter()
            .filter_map(|entry| {
                let guard = entry.value().sandbox.try_lock().ok()?;
                let sandbox = guard.as_ref()?;
                Some(BindingSummary {
                    key: entry.key().clone(),
                    sandbox_id: sandbox.id().to_string(),
                    backend: sandbox.backend_kind(),
                    last_used_at: entry.value().last_used(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Record activity for every binding of (user, session).
    pub fn touch(&self, session_id: &str, user_id: &str) {
        for entry in self.inner.bindings.iter() {
            if entry.key().owned_by(user_id, session_id) {
                entry.value().touch();
            }
        }
    }

    /// `(user_id, session_id)` pairs whose most recent activity is older than `max_idle`.
    pub fn idle_sessions(&self, max_idle: Duration) -> Vec<(String, String)> {
        let idle_ms = i64::try_from(max_idle.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(idle_ms);
        let mut newest: BTreeMap<(String, String), i64> = BTreeMap::new();
        for entry in self.inner.bindings.iter() {
            let key = entry.key();
            let used = entry.value().last_used_ms.load(Ordering::SeqCst);
            newest
                .entry((key.user_id.clone(), key.session_id.clone()))
                .and_modify(|v| *v = (*v).max(used))
                .or_insert(used);
        }
        newest
            .into_iter()
            .filter(|(_, used)| *used < cutoff)
            .map(|(pair, _)| pair)
            .collect()
    }
}

impl ServiceInner {
    fn backend_for(&self, sandbox_type: &str) -> Result<&SandboxTypeSpec> {
        let spec = self.config.sandbox_types.get(sandbox_type).ok_or_else(|| {
            Error::InvalidInput(format!("unknown sandbox type {sandbox_type:?}"))
        })?;
        if let SandboxTypeSpec::Cloud(cloud) = spec {
            if !self.providers.contains_key(&cloud.provider) {
                return Err(Error::NotFound(format!(
                    "cloud provider {:?} for sandbox type {sandbox_type:?} is not registered",
                    cloud.provider
                )));
            }
        }
        Ok(spec)
    }

    /// Existing sandbox for `key`, or a new one. The bool is true when this call created it.
    async fn acquire(self: Arc<Self>, key: BindingKey) -> Result<(Arc<Sandbox>, bool)> {
        loop {
            let slot = self
                .bindings
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Slot::new()))
                .clone();
            let mut current = slot.sandbox.lock().await;

            let still_bound = self
                .bindings
                .get(&key)
                .is_some_and(|s| Arc::ptr_eq(s.value(), &slot));
            if !still_bound {
                // Released while we waited; start over on a fresh slot.
                continue;
            }

            if let Some(sandbox) = current.as_ref() {
                slot.reuses.fetch_add(1, Ordering::SeqCst);
                slot.touch();
                tracing::debug!(%key, sandbox_id = %sandbox.id(), "reusing bound sandbox");
                return Ok((sandbox.clone(), false));
            }

            match self.provision(&key).await {
                Ok(sandbox) => {
                    tracing::info!(%key, sandbox_id = %sandbox.id(), backend = %sandbox.backend_kind(), "sandbox bound");
                    *current = Some(sandbox.clone());
                    slot.touch();
                    return Ok((sandbox, true));
                }
                Err(e) => {
                    self.bindings.remove_if(&key, |_, s| Arc::ptr_eq(s, &slot));
                    return Err(e);
                }
            }
        }
    }

    async fn provision(&self, key: &BindingKey) -> Result<Arc<Sandbox>> {
        let spec = self.backend_for(&key.sandbox_type)?.clone();
        let timeout = self.config.default_timeout;

        let sandbox = match spec {
            SandboxTypeSpec::Local(local) => {
                let launch = LaunchRequest {
                    sandbox_type: &key.sandbox_type,
                    spec: &local,
                    user_id: &key.user_id,
                    session_id: &key.session_id,
                    timeout,
                    readiness_timeout: self.config.readiness_timeout,
                };
                let container = self
                    .pool
                    .run(ContainerSandbox::launch(&self.containers, launch))
                    .await?;
                Sandbox::Container(container)
            }
            SandboxTypeSpec::Cloud(cloud) => {
                let provider = self
                    .providers
                    .get(&cloud.provider)
                    .map(|p| p.value().clone())
                    .ok_or_else(|| {
                        Error::NotFound(format!("cloud provider {:?} is not registered", cloud.provider))
                    })?;
                let request = CloudSandboxRequest {
                    sandbox_type: key.sandbox_type.clone(),
                    template: cloud.template,
                    environment: cloud.environment,
                    timeout,
                };
                let sandbox = self
                    .pool
                    .run(CloudSandbox::connect(provider, &request, None))
                    .await?;
                Sandbox::Cloud(sandbox.with_owner(&key.user_id, &key.session_id))
            }
        };
        Ok(Arc::new(sandbox))
    }

    /// Drop the binding for `key` and close what it held.
    ///
    /// With `expected`, only unbinds if the slot still holds that sandbox and
    /// no other caller has been handed it.
    async fn unbind(&self, key: &BindingKey, expected: Option<&Arc<Sandbox>>) -> Option<Result<String>> {
        let slot = self.bindings.get(key).map(|s| s.value().clone())?;
        let sandbox = {
            let mut current = slot.sandbox.lock().await;
            if let Some(expected) = expected {
                match current.as_ref() {
                    Some(held) if Arc::ptr_eq(held, expected) => {}
                    _ => return None,
                }
                if slot.reuses.load(Ordering::SeqCst) > 0 {
                    tracing::debug!(%key, "sandbox shared with another caller; keeping binding");
                    return None;
                }
            }
            self.bindings.remove_if(key, |_, s| Arc::ptr_eq(s, &slot));
            current.take()
        }?;

        let id = sandbox.id().to_string();
        let closed = self.pool.run(sandbox.close()).await;
        Some(closed.map(|()| id))
    }

    /// Close every key concurrently, each in its own task so an abandoned
    /// caller cannot strand a half-finished teardown.
    async fn teardown(self: &Arc<Self>, keys: Vec<BindingKey>) -> ReleaseReport {
        let tasks = keys.into_iter().map(|key| {
            let inner = self.clone();
            let task_key = key.clone();
            let handle = tokio::spawn(async move { inner.unbind(&task_key, None).await });
            async move { (key, handle.await) }
        });

        let mut report = ReleaseReport::default();
        for (key, joined) in futures_util::future::join_all(tasks).await {
            let mut one = ReleaseReport::default();
            match joined {
                Ok(None) => {}
                Ok(Some(Ok(id))) => one.released.push(id),
                Ok(Some(Err(e))) => {
                    tracing::warn!(%key, %e, "sandbox teardown failed");
                    one.failed.push((key.to_string(), e.to_string()));
                }
                Err(e) => {
                    tracing::warn!(%key, %e, "sandbox teardown task failed");
                    one.failed.push((key.to_string(), e.to_string()));
                }
            }
            report.merge(one);
        }
        report
    }
}

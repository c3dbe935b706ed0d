#![cfg(test)]

use crate::cloud::{CloudProvider, CloudSandbox, CloudSandboxRequest};
use crate::collections::memory::InMemorySet;
use crate::collections::traits::KeyedSet;
use crate::collections::PortCollections;
use crate::config::{CloudSandboxSpec, LocalSandboxSpec, PoolConfig, SandboxTypeSpec};
use crate::container::{
    CmdOutput, CommandRunner, ContainerBackend, ContainerBackendConfig, PortProbe, PortRange,
};
use crate::sandbox::Sandbox;
use crate::service::SandboxService;
use crate::{Error, Result};
use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Redis-backed tests run only when `SANDBOX_POOL_TEST_REDIS_URL` is set,
/// e.g. `redis://127.0.0.1:6379/`.
pub(crate) fn redis_url_from_env() -> Option<String> {
    std::env::var("SANDBOX_POOL_TEST_REDIS_URL").ok()
}

// ---------------------------------------------------------------------------
// Docker CLI fake
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum PullMode {
    Ok,
    /// Pull fails but the image shows up anyway.
    Race,
    Fail,
}

#[derive(Debug)]
struct FakeContainer {
    name: String,
    running: bool,
}

#[derive(Debug)]
struct DockerState {
    images: HashSet<String>,
    containers: HashMap<String, FakeContainer>,
    calls: Vec<Vec<String>>,
    next_id: usize,
    pull_mode: PullMode,
    fail_runs: bool,
    fail_rm: HashSet<String>,
    run_delay: Option<Duration>,
}

/// Scripted stand-in for the docker CLI. Clones share state.
#[derive(Debug, Clone)]
pub(crate) struct FakeDocker {
    state: Arc<Mutex<DockerState>>,
}

fn out(status: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> CmdOutput {
    CmdOutput {
        status,
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

impl FakeDocker {
    pub(crate) fn with_images(images: &[&str]) -> Self {
        Self {
            state: Arc::new(Mutex::new(DockerState {
                images: images.iter().map(|s| s.to_string()).collect(),
                containers: HashMap::new(),
                calls: Vec::new(),
                next_id: 0,
                pull_mode: PullMode::Ok,
                fail_runs: false,
                fail_rm: HashSet::new(),
                run_delay: None,
            })),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut DockerState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub(crate) fn pull_races(&self) {
        self.with_state(|s| s.pull_mode = PullMode::Race);
    }

    pub(crate) fn fail_pulls(&self) {
        self.with_state(|s| s.pull_mode = PullMode::Fail);
    }

    pub(crate) fn fail_runs(&self) {
        self.with_state(|s| s.fail_runs = true);
    }

    pub(crate) fn fail_rm(&self, container_id: &str) {
        self.with_state(|s| s.fail_rm.insert(container_id.to_string()));
    }

    pub(crate) fn delay_runs(&self, delay: Duration) {
        self.with_state(|s| s.run_delay = Some(delay));
    }

    /// Make a container vanish behind the backend's back.
    pub(crate) fn forget(&self, container_id: &str) {
        self.with_state(|s| s.containers.remove(container_id));
    }

    /// Number of invocations whose first argument is `command`.
    pub(crate) fn count(&self, command: &str) -> usize {
        self.with_state(|s| {
            s.calls
                .iter()
                .filter(|c| c.first().map(String::as_str) == Some(command))
                .count()
        })
    }

    pub(crate) fn last_call(&self, command: &str) -> Option<Vec<String>> {
        self.with_state(|s| {
            s.calls
                .iter()
                .rev()
                .find(|c| c.first().map(String::as_str) == Some(command))
                .cloned()
        })
    }

    fn resolve(state: &DockerState, target: &str) -> Option<String> {
        if state.containers.contains_key(target) {
            return Some(target.to_string());
        }
        state
            .containers
            .iter()
            .find(|(_, c)| c.name == target)
            .map(|(id, _)| id.clone())
    }

    fn handle(state: &mut DockerState, args: &[String]) -> CmdOutput {
        let target = args.last().cloned().unwrap_or_default();
        match args.first().map(String::as_str) {
            Some("image") => {
                if state.images.contains(&target) {
                    out(0, format!("sha256:{target}\n"), "")
                } else {
                    out(1, "", format!("Error: No such image: {target}\n"))
                }
            }
            Some("pull") => match state.pull_mode {
                PullMode::Ok => {
                    state.images.insert(target);
                    out(0, "pulled\n", "")
                }
                PullMode::Race => {
                    state.images.insert(target);
                    out(1, "", "error pulling image: layer already being pulled\n")
                }
                PullMode::Fail => out(1, "", "pull access denied\n"),
            },
            Some("run") => {
                if state.fail_runs {
                    return out(125, "", "docker: Error response from daemon: port is already allocated.\n");
                }
                let name = args
                    .iter()
                    .position(|a| a == "--name")
                    .and_then(|i| args.get(i + 1))
                    .cloned()
                    .unwrap_or_default();
                state.next_id += 1;
                let id = format!("cont{}", state.next_id);
                state.containers.insert(
                    id.clone(),
                    FakeContainer {
                        name,
                        running: true,
                    },
                );
                out(0, format!("{id}\n"), "")
            }
            Some("rm") => {
                if state.fail_rm.contains(&target) {
                    return out(1, "", "Error response from daemon: device or resource busy\n");
                }
                match Self::resolve(state, &target) {
                    Some(id) => {
                        state.containers.remove(&id);
                        out(0, format!("{target}\n"), "")
                    }
                    None => out(1, "", format!("Error: No such container: {target}\n")),
                }
            }
            Some(cmd @ ("start" | "stop")) => match Self::resolve(state, &target) {
                Some(id) => {
                    if let Some(c) = state.containers.get_mut(&id) {
                        c.running = cmd == "start";
                    }
                    out(0, format!("{target}\n"), "")
                }
                None => out(
                    1,
                    "",
                    format!("Error response from daemon: No such container: {target}\n"),
                ),
            },
            Some("inspect") => match Self::resolve(state, &target) {
                Some(id) => {
                    let c = &state.containers[&id];
                    let status = if c.running { "running" } else { "exited" };
                    let body = json!([{
                        "Id": id,
                        "Name": format!("/{}", c.name),
                        "Config": {"Image": "img"},
                        "State": {"Status": status, "StartedAt": "2026-01-01T00:00:00Z"},
                    }]);
                    out(0, body.to_string(), "")
                }
                None => out(1, "[]\n", format!("Error: No such object: {target}\n")),
            },
            Some("logs") => out(0, "booting tool server\n", ""),
            _ => out(1, "", "unknown command\n"),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeDocker {
    async fn run(&self, _program: &str, args: &[String]) -> Result<CmdOutput> {
        let is_run = args.first().map(String::as_str) == Some("run");
        let delay = self.with_state(|s| {
            s.calls.push(args.to_vec());
            s.run_delay
        });
        if let (true, Some(delay)) = (is_run, delay) {
            tokio::time::sleep(delay).await;
        }
        Ok(self.with_state(|s| Self::handle(s, args)))
    }
}

// ---------------------------------------------------------------------------
// Port probe
// ---------------------------------------------------------------------------

/// Reports the listed ports as taken by someone outside the allocator.
pub(crate) struct FixedProbe {
    busy: HashSet<u16>,
}

impl FixedProbe {
    pub(crate) fn busy(ports: &[u16]) -> Self {
        Self {
            busy: ports.iter().copied().collect(),
        }
    }
}

#[async_trait]
impl PortProbe for FixedProbe {
    async fn is_bindable(&self, _host: &str, port: u16) -> bool {
        !self.busy.contains(&port)
    }
}

/// In-memory set whose next `n` removals fail.
pub(crate) struct FlakySet {
    inner: InMemorySet,
    failing_removes: AtomicUsize,
}

impl FlakySet {
    pub(crate) fn failing_removes(n: usize) -> Self {
        Self {
            inner: InMemorySet::new(),
            failing_removes: AtomicUsize::new(n),
        }
    }
}

#[async_trait]
impl KeyedSet for FlakySet {
    async fn add(&self, member: &str) -> Result<bool> {
        self.inner.add(member).await
    }

    async fn remove(&self, member: &str) -> Result<bool> {
        let failing = self
            .failing_removes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::BackendMessage("store unavailable".to_string()));
        }
        self.inner.remove(member).await
    }

    async fn contains(&self, member: &str) -> Result<bool> {
        self.inner.contains(member).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    async fn to_list(&self) -> Result<Vec<String>> {
        self.inner.to_list().await
    }
}

pub(crate) fn container_backend(docker: FakeDocker, low: u16, high: u16, busy: &[u16]) -> ContainerBackend {
    let cfg = ContainerBackendConfig {
        port_range: PortRange::new(low, high).unwrap(),
        stop_timeout_secs: 1,
        ..Default::default()
    };
    ContainerBackend::new(
        cfg,
        Arc::new(docker),
        PortCollections::in_memory(),
        Arc::new(FixedProbe::busy(busy)),
    )
    .unwrap()
}

pub(crate) fn local_spec(image: &str, ports: &[u16]) -> LocalSandboxSpec {
    LocalSandboxSpec {
        image: image.to_string(),
        ports: ports.to_vec(),
        environment: Default::default(),
        volumes: Vec::new(),
        runtime: Default::default(),
    }
}

// ---------------------------------------------------------------------------
// Cloud provider fake
// ---------------------------------------------------------------------------

/// Records every call; failure modes are switched on per test.
pub(crate) struct RecordingProvider {
    name: String,
    next_id: AtomicUsize,
    decline: AtomicBool,
    create_delay_ms: AtomicU64,
    fail_tools: AtomicBool,
    fail_deletes: Mutex<HashSet<String>>,
    creates: Mutex<Vec<CloudSandboxRequest>>,
    deletes: Mutex<Vec<String>>,
    calls: Mutex<Vec<(String, String, Option<Value>)>>,
}

impl RecordingProvider {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            next_id: AtomicUsize::new(0),
            decline: AtomicBool::new(false),
            create_delay_ms: AtomicU64::new(0),
            fail_tools: AtomicBool::new(false),
            fail_deletes: Mutex::new(HashSet::new()),
            creates: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// `create_sandbox` answers `Ok(None)`.
    pub(crate) fn decline_creates(&self) {
        self.decline.store(true, Ordering::SeqCst);
    }

    /// `create_sandbox` sleeps this long before answering.
    pub(crate) fn delay_creates(&self, delay: Duration) {
        self.create_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn fail_tools(&self) {
        self.fail_tools.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_delete(&self, sandbox_id: &str) {
        self.fail_deletes
            .lock()
            .unwrap()
            .insert(sandbox_id.to_string());
    }

    pub(crate) fn recover_delete(&self, sandbox_id: &str) {
        self.fail_deletes.lock().unwrap().remove(sandbox_id);
    }

    pub(crate) fn create_count(&self) -> usize {
        self.creates.lock().unwrap().len()
    }

    /// Every id `delete_sandbox` was called with, failed attempts included.
    pub(crate) fn deleted(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    pub(crate) fn calls(&self) -> Vec<(String, String, Option<Value>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CloudProvider for RecordingProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn create_sandbox(&self, request: &CloudSandboxRequest) -> Result<Option<String>> {
        self.creates.lock().unwrap().push(request.clone());
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.decline.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(format!("{}-{n}", self.name)))
    }

    async fn delete_sandbox(&self, sandbox_id: &str) -> Result<bool> {
        self.deletes.lock().unwrap().push(sandbox_id.to_string());
        if self.fail_deletes.lock().unwrap().contains(sandbox_id) {
            return Err(Error::BackendMessage("vendor refused delete".to_string()));
        }
        Ok(true)
    }

    async fn call_tool(
        &self,
        sandbox_id: &str,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<Value> {
        self.calls
            .lock()
            .unwrap()
            .push((sandbox_id.to_string(), name.to_string(), arguments));
        if self.fail_tools.load(Ordering::SeqCst) {
            return Err(Error::BackendMessage("vendor unavailable".to_string()));
        }
        Ok(json!({"success": true, "output": ""}))
    }
}

pub(crate) async fn cloud_sandbox(provider: &Arc<RecordingProvider>) -> Arc<Sandbox> {
    let request = CloudSandboxRequest {
        sandbox_type: "e2b".to_string(),
        timeout: Duration::from_secs(300),
        ..Default::default()
    };
    let sandbox = CloudSandbox::connect(provider.clone(), &request, None)
        .await
        .unwrap();
    Arc::new(Sandbox::Cloud(sandbox))
}

/// Service over a fake docker with `e2b` registered and `daytona` configured but not registered.
pub(crate) fn test_service(docker: FakeDocker, provider: Arc<RecordingProvider>) -> SandboxService {
    let mut config = PoolConfig {
        readiness_timeout: None,
        ..Default::default()
    };
    for name in ["e2b", "daytona"] {
        config.sandbox_types.insert(
            name.to_string(),
            SandboxTypeSpec::Cloud(CloudSandboxSpec {
                provider: name.to_string(),
                template: None,
                environment: Default::default(),
            }),
        );
    }
    let backend = container_backend(docker, 42000, 42100, &[]);
    let service = SandboxService::new(config, Arc::new(backend)).unwrap();
    service.register_provider(provider);
    service
}

// ---------------------------------------------------------------------------
// In-process HTTP fixtures
// ---------------------------------------------------------------------------

/// Requests captured by fixture handlers, tagged by kind.
#[derive(Debug, Clone, Default)]
pub(crate) struct Recorded(Arc<Mutex<Vec<(String, Value)>>>);

impl Recorded {
    pub(crate) fn push(&self, kind: &str, value: Value) {
        self.0.lock().unwrap().push((kind.to_string(), value));
    }

    /// Remove and return every entry of `kind`, oldest first.
    pub(crate) fn take(&self, kind: &str) -> Vec<Value> {
        let mut all = self.0.lock().unwrap();
        let (taken, kept): (Vec<_>, Vec<_>) = all.drain(..).partition(|(k, _)| k == kind);
        *all = kept;
        taken.into_iter().map(|(_, v)| v).collect()
    }
}

pub(crate) async fn serve_addr(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

pub(crate) async fn serve(router: Router) -> String {
    format!("http://{}", serve_addr(router).await)
}

#[derive(Clone)]
struct ToolServerState {
    recorded: Recorded,
    /// `"*"` accepts any bearer token.
    token: String,
}

impl ToolServerState {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(presented) = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        else {
            return false;
        };
        self.token == "*" || presented == self.token
    }
}

/// Minimal container tool server: `/healthz`, `/tools`, `/tools/call`, `/mcp/servers`.
pub(crate) fn tool_server(recorded: Recorded, token: &str) -> Router {
    let state = ToolServerState {
        recorded,
        token: token.to_string(),
    };
    Router::new()
        .route(
            "/healthz",
            get(|State(s): State<ToolServerState>, headers: HeaderMap| async move {
                if s.authorized(&headers) {
                    StatusCode::OK
                } else {
                    StatusCode::UNAUTHORIZED
                }
            }),
        )
        .route(
            "/tools",
            get(|State(s): State<ToolServerState>, headers: HeaderMap| async move {
                if !s.authorized(&headers) {
                    return Err(StatusCode::UNAUTHORIZED);
                }
                Ok(Json(json!({"tools": [{"name": "run_shell_command"}, {"name": "read_file"}]})))
            }),
        )
        .route(
            "/tools/call",
            post(|State(s): State<ToolServerState>, headers: HeaderMap, Json(body): Json<Value>| async move {
                if !s.authorized(&headers) {
                    return Err(StatusCode::UNAUTHORIZED);
                }
                s.recorded.push("call", body);
                Ok(Json(json!({"success": true, "output": "ok"})))
            }),
        )
        .route(
            "/mcp/servers",
            post(|State(s): State<ToolServerState>, headers: HeaderMap, Json(body): Json<Value>| async move {
                if !s.authorized(&headers) {
                    return Err(StatusCode::UNAUTHORIZED);
                }
                s.recorded.push("mcp", body);
                Ok(Json(json!({"added": true})))
            }),
        )
        .with_state(state)
}

/// Tool server accepting any token; returns its port.
pub(crate) async fn bound_tool_server(recorded: Recorded) -> u16 {
    serve_addr(tool_server(recorded, "*")).await.port()
}

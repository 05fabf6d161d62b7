//! Shared fixtures: an in-memory control plane and a local agent endpoint.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use fly_api::{App, LaunchMachineRequest, Machine, MachineState};
use tokio::sync::{broadcast, watch};

use crate::credentials::{AGENT_AUTH_TOKEN, MemoryCredentialStore};
use crate::frame::{ControlMessage, Frame};
use crate::{ControlPlane, CredentialStore, Error, Result, SessionConfig, SessionSnapshot, Supervisor, SupervisorHandle};

pub const APP: &str = "agents";

pub fn machine(id: &str, state: MachineState) -> Machine {
    Machine {
        id: id.to_string(),
        name: format!("agent-{id}"),
        state,
        region: "iad".into(),
        private_ip: None,
        config: None,
    }
}

// ── Control plane ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub enum FakeFailure {
    Unauthorized,
    NotFound,
    Server,
}

impl FakeFailure {
    fn error(self, endpoint: &'static str) -> Error {
        let err = match self {
            Self::Unauthorized => fly_api::Error::Unauthorized { endpoint },
            Self::NotFound => fly_api::Error::NotFound { endpoint },
            Self::Server => fly_api::Error::Server {
                endpoint,
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                body: "boom".into(),
            },
        };
        Error::ControlPlane(err)
    }
}

/// Control plane backed by a vector of machines.
///
/// Starting a machine leaves it `starting`; the first status read after that
/// reports `starting` and flips it to `started`, so boot takes two polls.
pub struct FakeControlPlane {
    apps: Mutex<HashSet<String>>,
    machines: Mutex<Vec<Machine>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    failures: Mutex<HashMap<&'static str, FakeFailure>>,
    launch_state: Mutex<MachineState>,
    gate: watch::Sender<bool>,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            apps: Mutex::new(HashSet::from([APP.to_string()])),
            machines: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            launch_state: Mutex::new(MachineState::Started),
            gate,
        }
    }

    pub fn without_app(self) -> Self {
        self.apps.lock().unwrap().clear();
        self
    }

    pub fn with_machine(self, id: &str, state: MachineState) -> Self {
        self.machines.lock().unwrap().push(machine(id, state));
        self
    }

    pub fn set_state(&self, id: &str, state: MachineState) {
        if let Some(m) = self.machines.lock().unwrap().iter_mut().find(|m| m.id == id) {
            m.state = state;
        }
    }

    pub fn state_of(&self, id: &str) -> Option<MachineState> {
        self.machines.lock().unwrap().iter().find(|m| m.id == id).map(|m| m.state)
    }

    pub fn set_launch_state(&self, state: MachineState) {
        *self.launch_state.lock().unwrap() = state;
    }

    pub fn has_app(&self, name: &str) -> bool {
        self.apps.lock().unwrap().contains(name)
    }

    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    pub fn fail(&self, method: &'static str, failure: FakeFailure) {
        self.failures.lock().unwrap().insert(method, failure);
    }

    /// Park every call after it has been counted until `release`.
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    async fn enter(&self, method: &'static str) -> Result<()> {
        *self.calls.lock().unwrap().entry(method).or_default() += 1;

        let mut gate = self.gate.subscribe();
        let _opened = gate.wait_for(|open| *open).await.is_ok();

        match self.failures.lock().unwrap().get(method) {
            Some(failure) => Err(failure.error(method)),
            None => Ok(()),
        }
    }

    fn find(&self, id: &str) -> Result<Machine> {
        self.machines
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or(FakeFailure::NotFound.error("get machine"))
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn create_app(&self, name: &str, _org: &str) -> Result<()> {
        self.enter("create_app").await?;
        self.apps.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn get_app(&self, name: &str) -> Result<App> {
        self.enter("get_app").await?;
        if !self.has_app(name) {
            return Err(FakeFailure::NotFound.error("get app"));
        }
        Ok(App {
            id: None,
            name: name.to_string(),
            organization: None,
            status: Some("deployed".into()),
        })
    }

    async fn launch_machine(&self, _app: &str, spec: &LaunchMachineRequest) -> Result<Machine> {
        self.enter("launch_machine").await?;
        let mut machines = self.machines.lock().unwrap();
        let mut launched = machine(&format!("m{}", machines.len() + 1), *self.launch_state.lock().unwrap());
        launched.name = spec.name.clone();
        launched.config = Some(spec.config.clone());
        machines.push(launched.clone());
        Ok(launched)
    }

    async fn get_machine_status(&self, _app: &str, machine_id: &str) -> Result<Machine> {
        self.enter("get_machine_status").await?;
        let current = self.find(machine_id)?;
        if current.state == MachineState::Starting {
            self.set_state(machine_id, MachineState::Started);
        }
        Ok(current)
    }

    async fn start_machine(&self, _app: &str, machine_id: &str) -> Result<()> {
        self.enter("start_machine").await?;
        self.find(machine_id)?;
        self.set_state(machine_id, MachineState::Starting);
        Ok(())
    }

    async fn stop_machine(&self, _app: &str, machine_id: &str) -> Result<()> {
        self.enter("stop_machine").await?;
        self.find(machine_id)?;
        self.set_state(machine_id, MachineState::Stopped);
        Ok(())
    }

    async fn delete_machine(&self, _app: &str, machine_id: &str) -> Result<()> {
        self.enter("delete_machine").await?;
        self.machines.lock().unwrap().retain(|m| m.id != machine_id);
        Ok(())
    }

    async fn list_machines(&self, _app: &str) -> Result<Vec<Machine>> {
        self.enter("list_machines").await?;
        Ok(self.machines.lock().unwrap().clone())
    }
}

// ── Agent endpoint ───────────────────────────────────────────────────

struct AgentState {
    token: String,
    healthy: AtomicBool,
    accept_streams: AtomicBool,
    close_after_greeting: AtomicBool,
    probe_hits: AtomicUsize,
    stream_hits: AtomicUsize,
    resizes: Mutex<Vec<(u16, u16)>>,
    kick: broadcast::Sender<()>,
}

/// Local stand-in for the agent server a machine runs: `GET /` health check
/// and `/agents/{id}/stream` terminal socket that echoes input.
pub struct AgentServer {
    addr: SocketAddr,
    state: Arc<AgentState>,
}

impl AgentServer {
    pub async fn start(token: &str) -> Self {
        let (kick, _) = broadcast::channel(4);
        let state = Arc::new(AgentState {
            token: token.to_string(),
            healthy: AtomicBool::new(true),
            accept_streams: AtomicBool::new(true),
            close_after_greeting: AtomicBool::new(false),
            probe_hits: AtomicUsize::new(0),
            stream_hits: AtomicUsize::new(0),
            resizes: Mutex::new(Vec::new()),
            kick,
        });

        let app = Router::new()
            .route("/", get(health))
            .route("/agents/{machine_id}/stream", get(stream))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn stream_url(&self, machine_id: &str) -> String {
        format!("{}/agents/{machine_id}/stream", self.base_url())
    }

    pub fn token(&self) -> &str {
        &self.state.token
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn accept_streams(&self, accept: bool) {
        self.state.accept_streams.store(accept, Ordering::SeqCst);
    }

    pub fn close_after_greeting(&self, close: bool) {
        self.state.close_after_greeting.store(close, Ordering::SeqCst);
    }

    pub fn probe_hits(&self) -> usize {
        self.state.probe_hits.load(Ordering::SeqCst)
    }

    pub fn stream_hits(&self) -> usize {
        self.state.stream_hits.load(Ordering::SeqCst)
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.state.resizes.lock().unwrap().clone()
    }

    /// Close every open session from the agent side.
    pub fn kick(&self) {
        let _ = self.state.kick.send(());
    }
}

async fn health(State(state): State<Arc<AgentState>>) -> Response {
    state.probe_hits.fetch_add(1, Ordering::SeqCst);
    if !state.healthy.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    axum::Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn stream(
    State(state): State<Arc<AgentState>>,
    Path(machine_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    state.stream_hits.fetch_add(1, Ordering::SeqCst);
    if !state.accept_streams.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let authorized = bearer == Some(state.token.as_str())
        && query.get("token").map(String::as_str) == Some(state.token.as_str());
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| agent_session(socket, machine_id, state))
}

async fn agent_session(mut socket: WebSocket, machine_id: String, state: Arc<AgentState>) {
    let greeting = format!("Connected to agent {machine_id}\r\n");
    if socket.send(Message::Text(greeting.into())).await.is_err() {
        return;
    }
    if state.close_after_greeting.load(Ordering::SeqCst) {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let mut kick = state.kick.subscribe();
    loop {
        tokio::select! {
            _ = kick.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { return };
                let Message::Text(text) = msg else { continue };
                match Frame::classify(text.as_str()) {
                    Frame::Control(ControlMessage::Resize { rows, cols }) => {
                        state.resizes.lock().unwrap().push((rows, cols));
                    }
                    Frame::Terminal(input) => {
                        let echo = format!("echo:{input}");
                        if socket.send(Message::Text(echo.into())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

// ── Supervisor fixtures ──────────────────────────────────────────────

pub fn test_config(server: &AgentServer) -> SessionConfig {
    let mut config = SessionConfig::new(APP);
    config.stream_base_url = server.base_url();
    config.settle_delay = Duration::from_millis(30);
    config.retry_delay = Duration::from_millis(10);
    config.probe_timeout = Duration::from_secs(1);
    config.poll_after_start = Duration::from_millis(20);
    config.poll_after_stop = Duration::from_millis(20);
    config.poll_interval = Duration::from_millis(20);
    config.max_polls = 5;
    config
}

pub fn spawn_supervisor(
    control: Arc<FakeControlPlane>,
    server: &AgentServer,
) -> SupervisorHandle {
    spawn_with_config(control, server, test_config(server))
}

pub fn spawn_with_config(
    control: Arc<FakeControlPlane>,
    server: &AgentServer,
    config: SessionConfig,
) -> SupervisorHandle {
    let credentials = MemoryCredentialStore::new();
    credentials.set(AGENT_AUTH_TOKEN, server.token());
    Supervisor::spawn(config, control, Arc::new(credentials))
}

/// Wait until a published snapshot satisfies `pred`.
pub async fn wait_for(
    handle: &SupervisorHandle,
    pred: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut snapshots = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        snapshots.wait_for(|s| pred(s)).await.map(|s| s.clone())
    })
    .await
    .expect("timed out waiting for snapshot")
    .expect("supervisor stopped")
}

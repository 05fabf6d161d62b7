//! The supervisor task and its handle.
//!
//! All state lives inside one tokio task. User commands and the completions
//! of spawned work (control-plane calls, connect attempts, polls, connection
//! watchers) arrive on the same channel and are applied one at a time, so
//! nothing outside this task ever mutates a record.

use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use fly_api::Machine;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionState, StreamingConnection};
use crate::credentials::{self, CredentialStore};
use crate::endpoint::{self, Endpoint};
use crate::frame::ControlMessage;
use crate::store::{MachineRecord, MachineStore, Operation, SessionPhase};
use crate::{ControlPlane, Error, Failure, FailureReason, Result, SessionConfig, probe};

const OUTPUT_BUFFER: usize = 1024;

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Everything published to observers after each applied command.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub machines: Vec<MachineRecord>,
    pub active: Option<String>,
    pub launching: bool,
    pub last_error: Option<Failure>,
}

impl SessionSnapshot {
    pub fn record(&self, machine_id: &str) -> Option<&MachineRecord> {
        self.machines.iter().find(|r| r.id() == machine_id)
    }

    pub fn active_record(&self) -> Option<&MachineRecord> {
        self.record(self.active.as_deref()?)
    }

    /// Machines with a session that is connecting or live.
    pub fn busy_sessions(&self) -> usize {
        self.machines
            .iter()
            .filter(|r| r.session != SessionPhase::Idle)
            .count()
    }
}

/// Inbound text from the live session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminalOutput {
    pub machine_id: String,
    pub text: String,
}

pub(crate) enum Command {
    Discover {
        reply: Reply<()>,
    },
    Launch {
        name: Option<String>,
        reply: Reply<Machine>,
    },
    Select {
        machine_id: String,
        reply: Reply<()>,
    },
    Activate {
        machine_id: String,
        reply: Reply<()>,
    },
    Suspend {
        machine_id: String,
        reply: Reply<()>,
    },
    Delete {
        machine_id: String,
        reply: Reply<()>,
    },
    Refresh {
        machine_id: String,
        reply: Reply<()>,
    },
    Send {
        text: String,
        reply: Reply<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },

    Discovered {
        result: Result<Vec<Machine>>,
        reply: Reply<()>,
    },
    Launched {
        result: Result<Machine>,
        reply: Reply<Machine>,
    },
    Settled {
        machine_id: String,
        operation: Operation,
        seq: u64,
        result: Result<Option<Machine>>,
        reply: Reply<()>,
    },
    Polled {
        machine_id: String,
        seq: u64,
        budget: u32,
        result: Result<Machine>,
    },
    AttemptFinished {
        machine_id: String,
        generation: u64,
        attempt: u32,
        result: std::result::Result<Attempt, Failure>,
    },
    ConnectionChanged {
        machine_id: String,
        generation: u64,
        state: ConnectionState,
    },
}

/// A connection that survived its settle delay, with the message receiver
/// that was subscribed before the handshake.
pub(crate) struct Attempt {
    connection: StreamingConnection,
    messages: broadcast::Receiver<String>,
}

struct LiveSession {
    generation: u64,
    connection: StreamingConnection,
    forwarder: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

struct ConnectCycle {
    generation: u64,
    task: Option<AbortHandle>,
    waiters: Vec<Reply<()>>,
}

pub struct Supervisor {
    pub(crate) config: Arc<SessionConfig>,
    pub(crate) control: Arc<dyn ControlPlane>,
    pub(crate) credentials: Arc<dyn CredentialStore>,
    http: reqwest::Client,
    pub(crate) store: MachineStore,
    pub(crate) active: Option<String>,
    sessions: HashMap<String, LiveSession>,
    cycles: HashMap<String, ConnectCycle>,
    pub(crate) polls: HashMap<String, Vec<AbortHandle>>,
    pub(crate) launching: bool,
    pub(crate) last_error: Option<Failure>,
    /// Sequence number of the latest `activate` or `select`. A start that
    /// settles after a newer one does not move the pointer.
    pub(crate) activation: u64,
    next_seq: u64,
    next_generation: u64,
    commands: mpsc::WeakUnboundedSender<Command>,
    snapshot: watch::Sender<SessionSnapshot>,
    output: broadcast::Sender<TerminalOutput>,
}

impl Supervisor {
    /// Start the supervisor task. It runs until `shutdown` or until every
    /// handle has been dropped.
    pub fn spawn(
        config: SessionConfig,
        control: Arc<dyn ControlPlane>,
        credentials: Arc<dyn CredentialStore>,
    ) -> SupervisorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let (output, _) = broadcast::channel(OUTPUT_BUFFER);

        let supervisor = Self {
            config: Arc::new(config),
            control,
            credentials,
            http: reqwest::Client::new(),
            store: MachineStore::new(),
            active: None,
            sessions: HashMap::new(),
            cycles: HashMap::new(),
            polls: HashMap::new(),
            launching: false,
            last_error: None,
            activation: 0,
            next_seq: 0,
            next_generation: 0,
            commands: tx.downgrade(),
            snapshot,
            output: output.clone(),
        };
        tokio::spawn(supervisor.run(rx));

        SupervisorHandle {
            commands: tx,
            snapshot: snapshot_rx,
            output,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!(app = %self.config.app_name, "session supervisor started");
        while let Some(command) = commands.recv().await {
            if self.handle(command).await.is_break() {
                break;
            }
            self.publish();
        }
        self.shutdown().await;
        info!(app = %self.config.app_name, "session supervisor stopped");
    }

    async fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Discover { reply } => self.discover(reply),
            Command::Launch { name, reply } => self.launch(name, reply),
            Command::Select { machine_id, reply } => self.select(&machine_id, reply).await,
            Command::Activate { machine_id, reply } => self.activate(&machine_id, reply).await,
            Command::Suspend { machine_id, reply } => self.suspend(&machine_id, reply).await,
            Command::Delete { machine_id, reply } => self.delete(&machine_id, reply).await,
            Command::Refresh { machine_id, reply } => self.refresh(&machine_id, reply),
            Command::Send { text, reply } => {
                let result = self.send_to_active(text).await;
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                self.publish();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }

            Command::Discovered { result, reply } => self.on_discovered(result, reply).await,
            Command::Launched { result, reply } => self.on_launched(result, reply).await,
            Command::Settled {
                machine_id,
                operation,
                seq,
                result,
                reply,
            } => self.on_settled(machine_id, operation, seq, result, reply).await,
            Command::Polled {
                machine_id,
                seq,
                budget,
                result,
            } => self.on_polled(machine_id, seq, budget, result).await,
            Command::AttemptFinished {
                machine_id,
                generation,
                attempt,
                result,
            } => {
                self.on_attempt_finished(machine_id, generation, attempt, result)
                    .await
            }
            Command::ConnectionChanged {
                machine_id,
                generation,
                state,
            } => self.on_connection_changed(machine_id, generation, state).await,
        }
        ControlFlow::Continue(())
    }

    pub(crate) fn publish(&self) {
        let next = SessionSnapshot {
            machines: self.store.records().to_vec(),
            active: self.active.clone(),
            launching: self.launching,
            last_error: self.last_error.clone(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Publish, then answer. Callers that read the snapshot after their
    /// command resolves see its effects.
    pub(crate) fn respond<T>(&self, reply: Reply<T>, result: Result<T>) {
        self.publish();
        let _ = reply.send(result);
    }

    /// Run `task` on its own tokio task and feed its result back in as a
    /// command. Returns `None` once no handle is left to act on the result.
    pub(crate) fn spawn_task<F>(&self, task: F) -> Option<AbortHandle>
    where
        F: Future<Output = Command> + Send + 'static,
    {
        let commands = self.commands.upgrade()?;
        let handle = tokio::spawn(async move {
            let _ = commands.send(task.await);
        });
        Some(handle.abort_handle())
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub(crate) fn is_active(&self, machine_id: &str) -> bool {
        self.active.as_deref() == Some(machine_id)
    }

    pub(crate) fn is_connecting(&self, machine_id: &str) -> bool {
        self.cycles.contains_key(machine_id)
    }

    /// Move the active pointer. Every other machine's session and connect
    /// cycle is torn down first.
    pub(crate) async fn switch_active(&mut self, machine_id: Option<&str>) {
        let stale: Vec<String> = self
            .sessions
            .keys()
            .chain(self.cycles.keys())
            .filter(|id| Some(id.as_str()) != machine_id)
            .cloned()
            .collect();
        for id in stale {
            self.teardown(&id).await;
        }

        if self.active.as_deref() != machine_id {
            debug!(from = ?self.active, to = ?machine_id, "active machine changed");
            self.active = machine_id.map(str::to_string);
        }
    }

    /// Cancel any connect cycle and close any session for the machine, leaving
    /// it idle. Returns once the socket is closed.
    pub(crate) async fn teardown(&mut self, machine_id: &str) {
        if let Some(cycle) = self.cycles.remove(machine_id) {
            if let Some(task) = cycle.task {
                task.abort();
            }
            for waiter in cycle.waiters {
                let _ = waiter.send(Err(Error::Superseded(machine_id.to_string())));
            }
            debug!(machine_id, "connect cycle cancelled");
        }

        if let Some(session) = self.sessions.remove(machine_id) {
            session.forwarder.abort();
            session.watcher.abort();
            let mut connection = session.connection;
            connection.disconnect().await;
            info!(machine_id, "session closed");
        }

        if let Some(record) = self.store.get_mut(machine_id)
            && (record.session != SessionPhase::Idle || record.pending == Some(Operation::Connecting))
        {
            record.session = SessionPhase::Idle;
            record.connect_attempt = 0;
            if record.pending == Some(Operation::Connecting) {
                record.pending = None;
            }
            record.touch();
        }
    }

    /// Make sure a connect cycle is running (or a session is live) for the
    /// machine. `waiter` is answered when the cycle settles.
    pub(crate) fn begin_connect(&mut self, machine_id: &str, waiter: Option<Reply<()>>) {
        if self.sessions.contains_key(machine_id) {
            if let Some(waiter) = waiter {
                self.respond(waiter, Ok(()));
            }
            return;
        }
        if let Some(cycle) = self.cycles.get_mut(machine_id) {
            cycle.waiters.extend(waiter);
            return;
        }
        let Some(record) = self.store.get_mut(machine_id) else {
            if let Some(waiter) = waiter {
                let _ = waiter.send(Err(Error::UnknownMachine(machine_id.to_string())));
            }
            return;
        };

        record.session = SessionPhase::Connecting;
        record.connect_attempt = 1;
        if record.pending.is_none() {
            record.pending = Some(Operation::Connecting);
        }
        record.touch();

        self.next_generation += 1;
        let generation = self.next_generation;
        info!(machine_id, generation, "connecting to agent");

        let task = self.spawn_attempt(machine_id, generation, 1, Duration::ZERO);
        self.cycles.insert(
            machine_id.to_string(),
            ConnectCycle {
                generation,
                task,
                waiters: waiter.into_iter().collect(),
            },
        );
    }

    fn spawn_attempt(
        &self,
        machine_id: &str,
        generation: u64,
        attempt: u32,
        delay: Duration,
    ) -> Option<AbortHandle> {
        let http = self.http.clone();
        let config = self.config.clone();
        let token = credentials::stream_token(self.credentials.as_ref());
        let machine_id = machine_id.to_string();

        self.spawn_task(async move {
            tokio::time::sleep(delay).await;
            let result = open_session(&http, &config, token, &machine_id).await;
            Command::AttemptFinished {
                machine_id,
                generation,
                attempt,
                result,
            }
        })
    }

    async fn on_attempt_finished(
        &mut self,
        machine_id: String,
        generation: u64,
        attempt: u32,
        result: std::result::Result<Attempt, Failure>,
    ) {
        let current = self
            .cycles
            .get(&machine_id)
            .is_some_and(|c| c.generation == generation);
        if !current {
            debug!(%machine_id, generation, "discarding superseded connect attempt");
            if let Ok(mut stale) = result {
                stale.connection.disconnect().await;
            }
            return;
        }

        let failure = match result {
            Ok(opened) => {
                self.install_session(machine_id, generation, opened);
                return;
            }
            Err(failure) => failure,
        };

        let max = self.config.connect_attempts;
        if failure.reason.is_retryable() && attempt < max {
            warn!(%machine_id, attempt, max, reason = ?failure.reason, error = %failure, "connect attempt failed, retrying");
            let task = self.spawn_attempt(&machine_id, generation, attempt + 1, self.config.retry_delay);
            if let Some(cycle) = self.cycles.get_mut(&machine_id) {
                cycle.task = task;
            }
            if let Some(record) = self.store.get_mut(&machine_id) {
                record.connect_attempt = attempt + 1;
                record.last_error = Some(failure);
                record.touch();
            }
            return;
        }

        warn!(%machine_id, attempt, reason = ?failure.reason, error = %failure, "connect failed");
        let waiters = self
            .cycles
            .remove(&machine_id)
            .map(|c| c.waiters)
            .unwrap_or_default();
        if let Some(record) = self.store.get_mut(&machine_id) {
            record.session = SessionPhase::Idle;
            record.connect_attempt = 0;
            record.last_error = Some(failure.clone());
            if record.pending == Some(Operation::Connecting) {
                record.pending = None;
            }
            record.touch();
        }
        self.publish();
        for waiter in waiters {
            let _ = waiter.send(Err(Error::Connection(failure.clone())));
        }
    }

    fn install_session(&mut self, machine_id: String, generation: u64, opened: Attempt) {
        let Attempt {
            connection,
            messages,
        } = opened;
        let waiters = self
            .cycles
            .remove(&machine_id)
            .map(|c| c.waiters)
            .unwrap_or_default();

        let forwarder = tokio::spawn(forward_output(
            machine_id.clone(),
            messages,
            self.output.clone(),
        ));
        let watcher = tokio::spawn(watch_connection(
            machine_id.clone(),
            generation,
            connection.subscribe_state(),
            self.commands.clone(),
        ));
        self.sessions.insert(
            machine_id.clone(),
            LiveSession {
                generation,
                connection,
                forwarder,
                watcher,
            },
        );

        if let Some(record) = self.store.get_mut(&machine_id) {
            record.session = SessionPhase::Live;
            record.connect_attempt = 0;
            record.last_error = None;
            if record.pending == Some(Operation::Connecting) {
                record.pending = None;
            }
            record.touch();
        }
        info!(%machine_id, generation, "session live");

        self.publish();
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    async fn on_connection_changed(
        &mut self,
        machine_id: String,
        generation: u64,
        state: ConnectionState,
    ) {
        let current = self
            .sessions
            .get(&machine_id)
            .is_some_and(|s| s.generation == generation);
        if !current {
            return;
        }

        let failure = match state {
            ConnectionState::Failed(failure) => failure,
            _ => Failure::closed(),
        };
        warn!(%machine_id, reason = ?failure.reason, error = %failure, "live session dropped");
        self.teardown(&machine_id).await;
        if let Some(record) = self.store.get_mut(&machine_id) {
            record.last_error = Some(failure);
            record.touch();
        }
    }

    async fn send_to_active(&self, text: String) -> Result<()> {
        let session = self
            .active
            .as_ref()
            .and_then(|id| self.sessions.get(id))
            .ok_or(Error::NotConnected)?;
        session.connection.send(text).await
    }

    async fn shutdown(&mut self) {
        for polls in std::mem::take(&mut self.polls).into_values() {
            for poll in polls {
                poll.abort();
            }
        }
        let ids: Vec<String> = self
            .sessions
            .keys()
            .chain(self.cycles.keys())
            .cloned()
            .collect();
        for id in ids {
            self.teardown(&id).await;
        }
    }
}

async fn open_session(
    http: &reqwest::Client,
    config: &SessionConfig,
    token: Option<String>,
    machine_id: &str,
) -> std::result::Result<Attempt, Failure> {
    let token = token.ok_or_else(|| {
        Failure::new(FailureReason::Unauthorized, "no stream credential configured")
    })?;
    let url = endpoint::stream_url(&config.stream_base_url, machine_id).map_err(|e| e.failure())?;

    if config.probe_before_connect {
        let endpoint = Endpoint::parse(&url).map_err(|e| e.failure())?;
        probe::check(http, &endpoint, config.probe_timeout).await?;
    }

    let mut connection = StreamingConnection::new(config.settle_delay);
    let messages = connection.subscribe_messages();
    connection
        .connect(&url, &token)
        .await
        .map_err(|e| e.failure())?;
    Ok(Attempt {
        connection,
        messages,
    })
}

async fn forward_output(
    machine_id: String,
    mut messages: broadcast::Receiver<String>,
    output: broadcast::Sender<TerminalOutput>,
) {
    loop {
        match messages.recv().await {
            Ok(text) => {
                let _ = output.send(TerminalOutput {
                    machine_id: machine_id.clone(),
                    text,
                });
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(%machine_id, skipped, "terminal output lagged, frames dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn watch_connection(
    machine_id: String,
    generation: u64,
    mut states: watch::Receiver<ConnectionState>,
    commands: mpsc::WeakUnboundedSender<Command>,
) {
    let state = match states
        .wait_for(|s| matches!(s, ConnectionState::Failed(_) | ConnectionState::Disconnected))
        .await
    {
        Ok(state) => ConnectionState::clone(&state),
        Err(_) => return,
    };
    if let Some(commands) = commands.upgrade() {
        let _ = commands.send(Command::ConnectionChanged {
            machine_id,
            generation,
            state,
        });
    }
}

/// Cloneable front end to a running [`Supervisor`].
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    output: broadcast::Sender<TerminalOutput>,
}

impl SupervisorHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Make sure the app exists, list its machines and merge them in.
    pub async fn discover(&self) -> Result<()> {
        self.request(|reply| Command::Discover { reply }).await
    }

    /// Create a new machine from the configured image. `name` defaults to a
    /// generated `agent-` name.
    pub async fn launch(&self, name: Option<String>) -> Result<Machine> {
        self.request(|reply| Command::Launch { name, reply }).await
    }

    /// Point at a machine, connecting if it is already running.
    pub async fn select(&self, machine_id: &str) -> Result<()> {
        let machine_id = machine_id.to_string();
        self.request(|reply| Command::Select { machine_id, reply })
            .await
    }

    /// Connect to a running machine, or start a stopped one. For a running
    /// machine this resolves when the connect cycle settles; for a stopped one
    /// when the start request is accepted.
    pub async fn activate(&self, machine_id: &str) -> Result<()> {
        let machine_id = machine_id.to_string();
        self.request(|reply| Command::Activate { machine_id, reply })
            .await
    }

    pub async fn suspend(&self, machine_id: &str) -> Result<()> {
        let machine_id = machine_id.to_string();
        self.request(|reply| Command::Suspend { machine_id, reply })
            .await
    }

    pub async fn delete(&self, machine_id: &str) -> Result<()> {
        let machine_id = machine_id.to_string();
        self.request(|reply| Command::Delete { machine_id, reply })
            .await
    }

    pub async fn refresh(&self, machine_id: &str) -> Result<()> {
        let machine_id = machine_id.to_string();
        self.request(|reply| Command::Refresh { machine_id, reply })
            .await
    }

    /// Write raw terminal input to the active session.
    pub async fn send(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| Command::Send { text, reply }).await
    }

    pub async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let frame = ControlMessage::Resize { rows, cols }.to_frame()?;
        self.send(frame).await
    }

    /// Close every session and stop the supervisor task.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply: tx }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<TerminalOutput> {
        self.output.subscribe()
    }
}

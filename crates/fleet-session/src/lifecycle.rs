//! User-facing machine operations: activate, suspend, delete, refresh,
//! select and launch.
//!
//! Each per-machine operation is single-flight. The record's `pending` slot is
//! claimed before the control-plane call goes out and released when the call
//! settles, whatever the outcome.

use std::future::Future;

use fly_api::{LaunchMachineRequest, Machine, MachineConfig, MachinePort, MachineService, MachineState};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::credentials::AGENT_AUTH_TOKEN;
use crate::store::Operation;
use crate::supervisor::{Command, Reply, Supervisor};
use crate::{Error, Result};

const AGENT_PORT: u16 = 8080;

fn agent_service() -> MachineService {
    MachineService {
        protocol: "tcp".into(),
        internal_port: AGENT_PORT,
        ports: vec![
            MachinePort {
                port: Some(443),
                handlers: vec!["tls".into(), "http".into()],
            },
            MachinePort {
                port: Some(80),
                handlers: vec!["http".into()],
            },
        ],
    }
}

fn generated_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("agent-{}", &id[..8])
}

impl Supervisor {
    /// Claim the machine's pending slot for `operation` and return the
    /// operation's sequence number.
    pub(crate) fn begin_operation(&mut self, machine_id: &str, operation: Operation) -> Result<u64> {
        let record = self
            .store
            .get(machine_id)
            .ok_or_else(|| Error::UnknownMachine(machine_id.to_string()))?;
        if let Some(current) = record.pending {
            debug!(machine_id, %current, requested = %operation, "rejecting operation, machine busy");
            return Err(Error::Busy {
                machine_id: machine_id.to_string(),
                operation: current,
            });
        }

        let seq = self.next_seq();
        if let Some(record) = self.store.get_mut(machine_id) {
            record.pending = Some(operation);
            record.op_seq = seq;
            record.last_error = None;
            record.touch();
        }
        debug!(machine_id, %operation, seq, "operation started");
        Ok(seq)
    }

    fn spawn_operation<F>(
        &self,
        machine_id: &str,
        operation: Operation,
        seq: u64,
        reply: Reply<()>,
        call: F,
    ) where
        F: Future<Output = Result<Option<Machine>>> + Send + 'static,
    {
        let machine_id = machine_id.to_string();
        self.spawn_task(async move {
            let result = call.await;
            Command::Settled {
                machine_id,
                operation,
                seq,
                result,
                reply,
            }
        });
    }

    pub(crate) async fn activate(&mut self, machine_id: &str, reply: Reply<()>) {
        let Some(record) = self.store.get(machine_id) else {
            self.respond(reply, Err(Error::UnknownMachine(machine_id.to_string())));
            return;
        };

        if record.remote_state() != MachineState::Started {
            let seq = match self.begin_operation(machine_id, Operation::Starting) {
                Ok(seq) => seq,
                Err(e) => return self.respond(reply, Err(e)),
            };
            self.activation = seq;
            info!(machine_id, "starting machine");
            let control = self.control.clone();
            let app = self.config.app_name.clone();
            let id = machine_id.to_string();
            self.spawn_operation(machine_id, Operation::Starting, seq, reply, async move {
                control.start_machine(&app, &id).await.map(|()| None)
            });
            return;
        }

        if self.is_active(machine_id) {
            let connected = record.connected();
            let connecting = self.is_connecting(machine_id);
            if connected || connecting {
                self.activation = self.next_seq();
            }
            if connected {
                return self.respond(reply, Ok(()));
            }
            if connecting {
                return self.begin_connect(machine_id, Some(reply));
            }
        }

        match self.begin_operation(machine_id, Operation::Connecting) {
            Ok(seq) => self.activation = seq,
            Err(e) => return self.respond(reply, Err(e)),
        }
        self.switch_active(Some(machine_id)).await;
        self.begin_connect(machine_id, Some(reply));
    }

    pub(crate) async fn suspend(&mut self, machine_id: &str, reply: Reply<()>) {
        let seq = match self.begin_operation(machine_id, Operation::Suspending) {
            Ok(seq) => seq,
            Err(e) => return self.respond(reply, Err(e)),
        };
        self.teardown(machine_id).await;

        info!(machine_id, "suspending machine");
        let control = self.control.clone();
        let app = self.config.app_name.clone();
        let id = machine_id.to_string();
        self.spawn_operation(machine_id, Operation::Suspending, seq, reply, async move {
            control.stop_machine(&app, &id).await.map(|()| None)
        });
    }

    pub(crate) async fn delete(&mut self, machine_id: &str, reply: Reply<()>) {
        let seq = match self.begin_operation(machine_id, Operation::Deleting) {
            Ok(seq) => seq,
            Err(e) => return self.respond(reply, Err(e)),
        };
        self.cancel_polls(machine_id);
        self.teardown(machine_id).await;

        info!(machine_id, "deleting machine");
        let control = self.control.clone();
        let app = self.config.app_name.clone();
        let id = machine_id.to_string();
        self.spawn_operation(machine_id, Operation::Deleting, seq, reply, async move {
            control.delete_machine(&app, &id).await.map(|()| None)
        });
    }

    pub(crate) fn refresh(&mut self, machine_id: &str, reply: Reply<()>) {
        let seq = match self.begin_operation(machine_id, Operation::Refreshing) {
            Ok(seq) => seq,
            Err(e) => return self.respond(reply, Err(e)),
        };

        let control = self.control.clone();
        let app = self.config.app_name.clone();
        let id = machine_id.to_string();
        self.spawn_operation(machine_id, Operation::Refreshing, seq, reply, async move {
            control.get_machine_status(&app, &id).await.map(Some)
        });
    }

    pub(crate) async fn on_settled(
        &mut self,
        machine_id: String,
        operation: Operation,
        seq: u64,
        result: Result<Option<Machine>>,
        reply: Reply<()>,
    ) {
        if let Some(record) = self.store.get_mut(&machine_id)
            && record.pending == Some(operation)
        {
            record.pending = None;
            record.touch();
        }

        let machine = match result {
            Ok(machine) => machine,
            Err(e) => {
                error!(%machine_id, %operation, error = %e, "machine operation failed");
                if let Some(record) = self.store.get_mut(&machine_id) {
                    record.last_error = Some(e.failure());
                }
                return self.respond(reply, Err(e));
            }
        };

        match operation {
            Operation::Starting => {
                if let Some(record) = self.store.get_mut(&machine_id) {
                    record.machine.state = MachineState::Starting;
                    record.touch();
                }
                if seq >= self.activation {
                    self.switch_active(Some(&machine_id)).await;
                } else {
                    debug!(%machine_id, seq, latest = self.activation, "newer activation since start, keeping pointer");
                }
                self.schedule_poll(&machine_id, seq, self.config.poll_after_start, self.config.max_polls);
            }
            Operation::Suspending => {
                self.schedule_poll(&machine_id, seq, self.config.poll_after_stop, self.config.max_polls);
            }
            Operation::Deleting => {
                self.forget(&machine_id).await;
                info!(%machine_id, "machine deleted");
            }
            Operation::Refreshing => {
                // earlier polls are stale now, keep watching under this seq
                if let Some(machine) = machine {
                    let transitional = machine.state.is_transitional();
                    self.reconcile(machine).await;
                    if transitional {
                        self.schedule_poll(&machine_id, seq, self.config.poll_interval, self.config.max_polls);
                    }
                }
            }
            Operation::Connecting => {}
        }
        self.respond(reply, Ok(()));
    }

    /// Drop a deleted machine. If it was active the pointer falls back to the
    /// default selection without connecting.
    async fn forget(&mut self, machine_id: &str) {
        self.cancel_polls(machine_id);
        self.teardown(machine_id).await;
        self.store.remove(machine_id);

        if self.is_active(machine_id) {
            self.active = self.store.default_selection().map(str::to_string);
            debug!(machine_id, fallback = ?self.active, "active machine removed");
        }
    }

    pub(crate) async fn select(&mut self, machine_id: &str, reply: Reply<()>) {
        if !self.store.contains(machine_id) {
            return self.respond(reply, Err(Error::UnknownMachine(machine_id.to_string())));
        }
        self.activation = self.next_seq();
        self.make_active(machine_id).await;
        self.respond(reply, Ok(()));
    }

    /// Point at the machine and connect if it is running and otherwise
    /// untouched.
    pub(crate) async fn make_active(&mut self, machine_id: &str) {
        self.switch_active(Some(machine_id)).await;

        let ready = self.store.get(machine_id).is_some_and(|r| {
            r.remote_state() == MachineState::Started && !r.connected() && r.pending.is_none()
        });
        if ready {
            self.begin_connect(machine_id, None);
        }
    }

    pub(crate) fn launch(&mut self, name: Option<String>, reply: Reply<Machine>) {
        if self.launching {
            return self.respond(reply, Err(Error::LaunchInProgress));
        }
        self.launching = true;
        self.last_error = None;

        let request = self.launch_request(name);
        info!(name = %request.name, image = %request.config.image, region = %request.region, "launching machine");

        let control = self.control.clone();
        let app = self.config.app_name.clone();
        self.spawn_task(async move {
            let result = control.launch_machine(&app, &request).await;
            Command::Launched { result, reply }
        });
    }

    fn launch_request(&self, name: Option<String>) -> LaunchMachineRequest {
        let mut env = self.config.env.clone();
        if let Some(token) = self.credentials.get(AGENT_AUTH_TOKEN) {
            env.insert("AUTH_TOKEN".into(), token);
        }

        LaunchMachineRequest {
            name: name.unwrap_or_else(generated_name),
            region: self.config.region.clone(),
            config: MachineConfig {
                image: self.config.image.clone(),
                env: (!env.is_empty()).then_some(env),
                guest: Some(self.config.guest()),
                services: Some(vec![agent_service()]),
                files: None,
                auto_destroy: Some(false),
            },
        }
    }

    pub(crate) async fn on_launched(&mut self, result: Result<Machine>, reply: Reply<Machine>) {
        self.launching = false;

        let machine = match result {
            Ok(machine) => machine,
            Err(e) => {
                error!(error = %e, "machine launch failed");
                self.last_error = Some(e.failure());
                return self.respond(reply, Err(e));
            }
        };
        info!(machine_id = %machine.id, state = %machine.state, "machine launched");

        let id = machine.id.clone();
        let started = machine.state == MachineState::Started;
        self.reconcile(machine.clone()).await;

        let seq = self.next_seq();
        if let Some(record) = self.store.get_mut(&id) {
            record.op_seq = seq;
        }
        if !started {
            self.schedule_poll(&id, seq, self.config.poll_after_start, self.config.max_polls);
        }
        self.respond(reply, Ok(machine));
    }
}

//! Discovery and remote-state reconciliation.

use std::time::Duration;

use fly_api::{Machine, MachineState};
use tracing::{debug, error, info, warn};

use crate::control::ensure_app;
use crate::{Failure, FailureReason, Result};
use crate::store::SessionPhase;
use crate::supervisor::{Command, Reply, Supervisor};

impl Supervisor {
    pub(crate) fn discover(&mut self, reply: Reply<()>) {
        let control = self.control.clone();
        let app = self.config.app_name.clone();
        let org = self.config.org_slug.clone();

        self.spawn_task(async move {
            let result = async {
                ensure_app(control.as_ref(), &app, &org).await?;
                control.list_machines(&app).await
            }
            .await;
            Command::Discovered { result, reply }
        });
    }

    pub(crate) async fn on_discovered(&mut self, result: Result<Vec<Machine>>, reply: Reply<()>) {
        let machines = match result {
            Ok(machines) => machines,
            Err(e) => {
                error!(app = %self.config.app_name, error = %e, "machine discovery failed");
                self.last_error = Some(e.failure());
                return self.respond(reply, Err(e));
            }
        };
        info!(app = %self.config.app_name, count = machines.len(), "machines discovered");

        for machine in machines {
            self.reconcile(machine).await;
        }
        self.last_error = None;

        if self.active.is_none()
            && let Some(default) = self.store.default_selection().map(str::to_string)
        {
            debug!(machine_id = %default, "selecting default machine");
            self.make_active(&default).await;
        }
        self.respond(reply, Ok(()));
    }

    /// Merge a fresh descriptor and react to the state change: connect the
    /// active machine when it finishes booting, close any session on a machine
    /// that went down.
    pub(crate) async fn reconcile(&mut self, machine: Machine) {
        let machine_id = machine.id.clone();
        let transition = self.store.merge(machine);
        if transition.changed() {
            debug!(%machine_id, from = ?transition.previous, to = %transition.current, "remote state changed");
        }

        let Some(record) = self.store.get(&machine_id) else {
            return;
        };
        let idle = record.session == SessionPhase::Idle;
        let untouched = record.pending.is_none();

        if transition.became(MachineState::Started) && self.is_active(&machine_id) && idle && untouched {
            info!(%machine_id, "machine is up, connecting");
            self.begin_connect(&machine_id, None);
        } else if transition.current.is_down() && !idle {
            info!(%machine_id, state = %transition.current, "machine went down, closing session");
            self.teardown(&machine_id).await;
        }
    }

    /// Check the machine's state after `delay`, and keep checking every
    /// `poll_interval` while it is transitional, at most `budget` times.
    pub(crate) fn schedule_poll(&mut self, machine_id: &str, seq: u64, delay: Duration, budget: u32) {
        if budget == 0 {
            return;
        }

        let control = self.control.clone();
        let app = self.config.app_name.clone();
        let id = machine_id.to_string();
        let Some(task) = self.spawn_task(async move {
            tokio::time::sleep(delay).await;
            let result = control.get_machine_status(&app, &id).await;
            Command::Polled {
                machine_id: id,
                seq,
                budget,
                result,
            }
        }) else {
            return;
        };

        let polls = self.polls.entry(machine_id.to_string()).or_default();
        polls.retain(|poll| !poll.is_finished());
        polls.push(task);
    }

    pub(crate) fn cancel_polls(&mut self, machine_id: &str) {
        if let Some(polls) = self.polls.remove(machine_id) {
            for poll in polls {
                poll.abort();
            }
        }
    }

    pub(crate) async fn on_polled(
        &mut self,
        machine_id: String,
        seq: u64,
        budget: u32,
        result: Result<Machine>,
    ) {
        let Some(record) = self.store.get(&machine_id) else {
            debug!(%machine_id, "poll result for a machine no longer known");
            return;
        };
        if seq < record.op_seq {
            debug!(%machine_id, seq, current = record.op_seq, "discarding stale poll result");
            return;
        }

        match result {
            Ok(machine) => {
                let state = machine.state;
                self.reconcile(machine).await;
                if state.is_transitional() {
                    if budget > 1 {
                        self.schedule_poll(&machine_id, seq, self.config.poll_interval, budget - 1);
                    } else {
                        warn!(%machine_id, %state, "machine still transitional, giving up polling");
                        if let Some(record) = self.store.get_mut(&machine_id) {
                            record.last_error = Some(Failure::new(
                                FailureReason::Timeout,
                                format!("machine still {state} after {} status checks", self.config.max_polls),
                            ));
                            record.touch();
                        }
                    }
                }
            }
            Err(e) => {
                warn!(%machine_id, error = %e, "machine status poll failed");
                if let Some(record) = self.store.get_mut(&machine_id) {
                    record.last_error = Some(e.failure());
                    record.touch();
                }
            }
        }
    }
}

//! In-memory table of known machines and their local supervisory state.

use std::fmt;

use chrono::{DateTime, Utc};
use fly_api::{Machine, MachineState};
use serde::Serialize;

use crate::Failure;

/// User-triggered operation in flight for a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Starting,
    Suspending,
    Deleting,
    Connecting,
    Refreshing,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Suspending => "suspending",
            Self::Deleting => "deleting",
            Self::Connecting => "connecting",
            Self::Refreshing => "refreshing",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervisor-side view of a machine's terminal session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    #[default]
    Idle,
    Connecting,
    Live,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineRecord {
    pub machine: Machine,
    pub session: SessionPhase,
    pub pending: Option<Operation>,
    /// Logical recency of the last user command issued for this machine.
    pub op_seq: u64,
    /// Attempt number within the running connect cycle, 0 when none runs.
    pub connect_attempt: u32,
    pub last_error: Option<Failure>,
    pub updated_at: DateTime<Utc>,
}

impl MachineRecord {
    pub fn new(machine: Machine) -> Self {
        Self {
            machine,
            session: SessionPhase::Idle,
            pending: None,
            op_seq: 0,
            connect_attempt: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.machine.id
    }

    pub fn remote_state(&self) -> MachineState {
        self.machine.state
    }

    pub fn connected(&self) -> bool {
        self.session == SessionPhase::Live
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Remote state before and after a merge. `previous` is `None` for a record
/// the merge created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: Option<MachineState>,
    pub current: MachineState,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.previous != Some(self.current)
    }

    pub fn became(&self, state: MachineState) -> bool {
        self.changed() && self.current == state
    }
}

/// Machine records in discovery order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MachineStore {
    records: Vec<MachineRecord>,
}

impl MachineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&MachineRecord> {
        self.records.iter().find(|r| r.id() == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut MachineRecord> {
        self.records.iter_mut().find(|r| r.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn records(&self) -> &[MachineRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Update the record with the same id in place, or append a new one.
    ///
    /// Local state (pending operation, session, errors) is left alone.
    pub fn merge(&mut self, machine: Machine) -> Transition {
        let current = machine.state;
        match self.get_mut(&machine.id) {
            Some(record) => {
                let previous = record.machine.state;
                if record.machine != machine {
                    record.machine = machine;
                    record.touch();
                }
                Transition {
                    previous: Some(previous),
                    current,
                }
            }
            None => {
                self.records.push(MachineRecord::new(machine));
                Transition {
                    previous: None,
                    current,
                }
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<MachineRecord> {
        let index = self.records.iter().position(|r| r.id() == id)?;
        Some(self.records.remove(index))
    }

    /// First started machine, otherwise the first machine at all.
    pub fn default_selection(&self) -> Option<&str> {
        self.records
            .iter()
            .find(|r| r.remote_state() == MachineState::Started)
            .or_else(|| self.records.first())
            .map(MachineRecord::id)
    }
}

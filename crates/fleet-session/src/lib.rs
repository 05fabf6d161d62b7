//! Session and connection supervisor for terminal agents running on Fly
//! machines.
//!
//! A single [`Supervisor`] task owns every machine record, the active-machine
//! pointer and the one streaming connection that may exist per machine.
//! Consumers talk to it through a cloneable [`SupervisorHandle`] and observe
//! it through published [`SessionSnapshot`]s.

pub mod config;
pub mod connection;
pub mod control;
pub mod credentials;
pub mod endpoint;
pub mod failure;
pub mod fly;
pub mod frame;
mod lifecycle;
mod probe;
mod reconcile;
pub mod store;
pub mod supervisor;

#[cfg(test)]
mod test_helpers;

pub use config::SessionConfig;
pub use connection::{ConnectionState, StreamingConnection};
pub use control::ControlPlane;
pub use credentials::{CredentialStore, MemoryCredentialStore};
pub use failure::{Failure, FailureReason};
pub use store::{MachineRecord, Operation, SessionPhase};
pub use supervisor::{SessionSnapshot, Supervisor, SupervisorHandle, TerminalOutput};

pub use fly_api::{Machine, MachineState};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("control plane error: {0}")]
    ControlPlane(#[from] fly_api::Error),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("connection failed: {0}")]
    Connection(Failure),

    #[error("session is not connected")]
    NotConnected,

    #[error("unknown machine: {0}")]
    UnknownMachine(String),

    #[error("machine {machine_id} is busy {operation}")]
    Busy {
        machine_id: String,
        operation: Operation,
    },

    #[error("a machine launch is already in progress")]
    LaunchInProgress,

    #[error("connect to {0} was superseded")]
    Superseded(String),

    #[error("failed to encode control message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("missing env var: {0}")]
    MissingEnv(String),

    #[error("invalid env var {name}: {value}")]
    InvalidEnv { name: String, value: String },

    #[error("supervisor is no longer running")]
    Closed,
}

impl Error {
    /// Structured form of this error, as attached to machine records.
    pub fn failure(&self) -> Failure {
        match self {
            Self::Connection(failure) => failure.clone(),
            Self::ControlPlane(e) => Failure::new(FailureReason::from(e), e.to_string()),
            Self::InvalidEndpoint(_) => Failure::new(FailureReason::InvalidEndpoint, self.to_string()),
            Self::NotConnected => Failure::new(FailureReason::Closed, self.to_string()),
            _ => Failure::new(FailureReason::Internal, self.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

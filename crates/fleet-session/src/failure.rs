use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_tungstenite::tungstenite;

/// Why something failed, in a form the presentation layer can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "status")]
pub enum FailureReason {
    /// Socket-level I/O error, refused connection, dropped network.
    Network,
    /// TLS handshake or certificate failure.
    Tls,
    /// WebSocket protocol violation or a rejected upgrade.
    Protocol,
    /// Peer closed the stream.
    Closed,
    /// Health probe did not get a successful answer.
    Probe,
    /// Machine was still transitional when status polling gave up.
    Timeout,
    Unauthorized,
    NotFound,
    InvalidRequest,
    Server(u16),
    Decode,
    InvalidEndpoint,
    Internal,
}

impl FailureReason {
    /// Transport-level failures are retried by the connect cycle; everything
    /// else ends it immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::Tls | Self::Protocol | Self::Closed | Self::Probe
        )
    }
}

impl From<&fly_api::Error> for FailureReason {
    fn from(err: &fly_api::Error) -> Self {
        match err {
            fly_api::Error::Request(_) => Self::Network,
            fly_api::Error::InvalidRequest { .. } => Self::InvalidRequest,
            fly_api::Error::Unauthorized { .. } => Self::Unauthorized,
            fly_api::Error::NotFound { .. } => Self::NotFound,
            fly_api::Error::Server { status, .. } => Self::Server(status.as_u16()),
            fly_api::Error::Decode { .. } => Self::Decode,
        }
    }
}

/// A failure attached to a machine record or published globally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    pub reason: FailureReason,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Failure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            at: Utc::now(),
        }
    }

    /// Classify a WebSocket transport error.
    pub fn from_transport(err: &tungstenite::Error) -> Self {
        use tungstenite::Error as E;

        let reason = match err {
            E::Io(_) => FailureReason::Network,
            E::Tls(_) => FailureReason::Tls,
            E::ConnectionClosed | E::AlreadyClosed => FailureReason::Closed,
            E::Http(resp) => match resp.status().as_u16() {
                401 | 403 => FailureReason::Unauthorized,
                404 => FailureReason::NotFound,
                _ => FailureReason::Protocol,
            },
            E::Url(_) => FailureReason::InvalidEndpoint,
            _ => FailureReason::Protocol,
        };
        Self::new(reason, err.to_string())
    }

    pub fn closed() -> Self {
        Self::new(FailureReason::Closed, "stream closed by peer")
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

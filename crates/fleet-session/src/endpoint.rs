//! Stream and health-probe URLs for a machine's agent endpoint.

use reqwest::Url;

use crate::{Error, Result};

pub fn default_base_url(app: &str) -> String {
    format!("wss://{app}.fly.dev")
}

/// Stream URL for one machine: `{base}/agents/{machine_id}/stream`.
pub fn stream_url(base: &str, machine_id: &str) -> Result<String> {
    if machine_id.is_empty() || machine_id.contains(['/', '?', '#']) {
        return Err(Error::InvalidEndpoint(format!(
            "bad machine id {machine_id:?}"
        )));
    }
    Ok(format!(
        "{}/agents/{machine_id}/stream",
        base.trim_end_matches('/')
    ))
}

/// A validated WebSocket endpoint plus the HTTP root used for health probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    stream: Url,
    probe: Url,
}

impl Endpoint {
    /// Accepts absolute `ws://` or `wss://` URLs with a host.
    pub fn parse(raw: &str) -> Result<Self> {
        let stream =
            Url::parse(raw).map_err(|e| Error::InvalidEndpoint(format!("{raw}: {e}")))?;

        let probe_scheme = match stream.scheme() {
            "wss" => "https",
            "ws" => "http",
            other => {
                return Err(Error::InvalidEndpoint(format!(
                    "{raw}: unsupported scheme {other}"
                )));
            }
        };
        let host = stream
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidEndpoint(format!("{raw}: missing host")))?;

        let authority = match stream.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let probe = Url::parse(&format!("{probe_scheme}://{authority}/"))
            .map_err(|e| Error::InvalidEndpoint(format!("{raw}: {e}")))?;

        Ok(Self { stream, probe })
    }

    pub fn stream_url(&self) -> &Url {
        &self.stream
    }

    pub fn probe_url(&self) -> &Url {
        &self.probe
    }

    /// Stream URL carrying the token as a query parameter, for transports
    /// that cannot set headers on the upgrade request.
    pub fn with_token(&self, token: &str) -> Url {
        let mut url = self.stream.clone();
        url.query_pairs_mut().append_pair("token", token);
        url
    }
}

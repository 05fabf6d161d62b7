//! Typed Rust client for the Fly.io Machines API.
//!
//! Covers the subset needed to run terminal agents:
//! apps (create, get) and machines (launch, list, get, start, stop, delete).

mod types;

pub use types::*;

use serde::de::DeserializeOwned;

const BASE_URL: &str = "https://api.machines.dev/v1";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("fly api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("fly api {endpoint} rejected the request ({status}): {body}")]
    InvalidRequest {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("fly api {endpoint} unauthorized")]
    Unauthorized { endpoint: &'static str },

    #[error("fly api {endpoint} not found")]
    NotFound { endpoint: &'static str },

    #[error("fly api {endpoint} returned {status}: {body}")]
    Server {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("fly api {endpoint} returned an undecodable body: {source}")]
    Decode {
        endpoint: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// Classify an unsuccessful response status.
    pub fn from_status(endpoint: &'static str, status: reqwest::StatusCode, body: String) -> Self {
        match status.as_u16() {
            401 | 403 => Self::Unauthorized { endpoint },
            404 => Self::NotFound { endpoint },
            400..=499 => Self::InvalidRequest {
                endpoint,
                status,
                body,
            },
            _ => Self::Server {
                endpoint,
                status,
                body,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// HTTP status behind the failure, when there was a response at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            Self::InvalidRequest { status, .. } | Self::Server { status, .. } => {
                Some(status.as_u16())
            }
            Self::Unauthorized { .. } => Some(401),
            Self::NotFound { .. } => Some(404),
            Self::Decode { .. } => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the Fly.io Machines REST API.
#[derive(Clone)]
pub struct FlyClient {
    token: String,
    base_url: String,
    http: reqwest::Client,
}

impl FlyClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base_url(token, BASE_URL)
    }

    /// Point the client at a different API root (proxies, test servers).
    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn machines_url(&self, app: &str, path: &str) -> String {
        self.url(&format!("/apps/{app}/machines{path}"))
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::from_status(endpoint, status, body));
        }
        Ok(resp)
    }

    /// Like `check` but also treats 404 as success (for delete idempotency).
    async fn check_allow_404(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() && status.as_u16() != 404 {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::from_status(endpoint, status, body));
        }
        Ok(resp)
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response, endpoint: &'static str) -> Result<T> {
        let bytes = Self::check(resp, endpoint).await?.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|source| Error::Decode { endpoint, source })
    }

    // ── Apps ─────────────────────────────────────────────────────────

    pub async fn create_app(&self, name: &str, org_slug: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url("/apps"))
            .header("Authorization", self.auth())
            .json(&CreateAppRequest {
                app_name: name.to_string(),
                org_slug: org_slug.to_string(),
            })
            .send()
            .await?;

        Self::check(resp, "create app").await?;
        Ok(())
    }

    pub async fn get_app(&self, name: &str) -> Result<App> {
        let resp = self
            .http
            .get(self.url(&format!("/apps/{name}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::decode(resp, "get app").await
    }

    // ── Machines ─────────────────────────────────────────────────────

    pub async fn launch_machine(&self, app: &str, req: &LaunchMachineRequest) -> Result<Machine> {
        let resp = self
            .http
            .post(self.machines_url(app, ""))
            .header("Authorization", self.auth())
            .json(req)
            .send()
            .await?;

        Self::decode(resp, "launch machine").await
    }

    pub async fn list_machines(&self, app: &str) -> Result<Vec<Machine>> {
        let resp = self
            .http
            .get(self.machines_url(app, ""))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::decode(resp, "list machines").await
    }

    pub async fn get_machine(&self, app: &str, machine_id: &str) -> Result<Machine> {
        let resp = self
            .http
            .get(self.machines_url(app, &format!("/{machine_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::decode(resp, "get machine").await
    }

    pub async fn start_machine(&self, app: &str, machine_id: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.machines_url(app, &format!("/{machine_id}/start")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "start machine").await?;
        Ok(())
    }

    pub async fn stop_machine(&self, app: &str, machine_id: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.machines_url(app, &format!("/{machine_id}/stop")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "stop machine").await?;
        Ok(())
    }

    pub async fn delete_machine(&self, app: &str, machine_id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.machines_url(app, &format!("/{machine_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check_allow_404(resp, "delete machine").await?;
        Ok(())
    }
}

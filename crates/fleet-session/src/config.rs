use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::endpoint;
use crate::{Error, Result};

/// Supervisor configuration: which Fly app to manage, what to launch, and the
/// timing of the connect and reconciliation protocols.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub app_name: String,
    pub org_slug: String,
    pub region: String,
    pub image: String,
    /// Root the stream endpoint is derived from, e.g. `wss://{app}.fly.dev`.
    pub stream_base_url: String,
    /// Attempts per connect cycle before the failure is surfaced.
    pub connect_attempts: u32,
    pub retry_delay: Duration,
    /// How long a freshly opened socket must stay up before it counts as connected.
    pub settle_delay: Duration,
    pub probe_before_connect: bool,
    pub probe_timeout: Duration,
    pub poll_after_start: Duration,
    pub poll_after_stop: Duration,
    pub poll_interval: Duration,
    pub max_polls: u32,
    pub guest_cpus: u32,
    pub guest_cpu_kind: String,
    pub guest_memory_mb: u32,
    pub env: HashMap<String, String>,
}

impl SessionConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        let app_name = app_name.into();
        Self {
            stream_base_url: endpoint::default_base_url(&app_name),
            app_name,
            org_slug: "personal".into(),
            region: "iad".into(),
            image: "registry.fly.io/fleet-agent:latest".into(),
            connect_attempts: 3,
            retry_delay: Duration::from_secs(2),
            settle_delay: Duration::from_millis(1000),
            probe_before_connect: true,
            probe_timeout: Duration::from_secs(5),
            poll_after_start: Duration::from_secs(10),
            poll_after_stop: Duration::from_secs(3),
            poll_interval: Duration::from_secs(5),
            max_polls: 12,
            guest_cpus: 1,
            guest_cpu_kind: "shared".into(),
            guest_memory_mb: 1024,
            env: HashMap::new(),
        }
    }

    /// Load from env vars: `FLY_APP_NAME`, `FLY_ORG`, `FLY_REGION`, and the
    /// `FLEET_*` tuning knobs. Everything has a default.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let app = env::var("FLY_APP_NAME").unwrap_or_else(|_| "fleet-agents".into());
        let mut config = Self::new(app);

        if let Ok(org) = env::var("FLY_ORG") {
            config.org_slug = org;
        }
        if let Ok(region) = env::var("FLY_REGION") {
            config.region = region;
        }
        if let Ok(image) = env::var("FLEET_IMAGE") {
            config.image = image;
        }
        if let Ok(base) = env::var("FLEET_STREAM_BASE_URL") {
            config.stream_base_url = base.trim_end_matches('/').to_string();
        }

        config.connect_attempts = parse_var("FLEET_CONNECT_ATTEMPTS", config.connect_attempts)?;
        config.retry_delay = millis_var("FLEET_RETRY_DELAY_MS", config.retry_delay)?;
        config.settle_delay = millis_var("FLEET_SETTLE_DELAY_MS", config.settle_delay)?;
        config.probe_before_connect = parse_var("FLEET_PROBE", config.probe_before_connect)?;
        config.probe_timeout = millis_var("FLEET_PROBE_TIMEOUT_MS", config.probe_timeout)?;
        config.poll_after_start = millis_var("FLEET_POLL_AFTER_START_MS", config.poll_after_start)?;
        config.poll_after_stop = millis_var("FLEET_POLL_AFTER_STOP_MS", config.poll_after_stop)?;
        config.poll_interval = millis_var("FLEET_POLL_INTERVAL_MS", config.poll_interval)?;
        config.max_polls = parse_var("FLEET_MAX_POLLS", config.max_polls)?;

        if config.connect_attempts == 0 {
            return Err(Error::InvalidEnv {
                name: "FLEET_CONNECT_ATTEMPTS".into(),
                value: "0".into(),
            });
        }

        Ok(config)
    }

    pub(crate) fn guest(&self) -> fly_api::GuestConfig {
        fly_api::GuestConfig {
            cpus: self.guest_cpus,
            cpu_kind: self.guest_cpu_kind.clone(),
            memory_mb: self.guest_memory_mb,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| Error::InvalidEnv {
            name: name.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

fn millis_var(name: &str, default: Duration) -> Result<Duration> {
    let ms = parse_var(name, u64::try_from(default.as_millis()).unwrap_or(u64::MAX))?;
    Ok(Duration::from_millis(ms))
}

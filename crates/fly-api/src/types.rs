use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ── App types ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CreateAppRequest {
    pub app_name: String,
    pub org_slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub organization: Option<Organization>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    #[serde(default)]
    pub name: Option<String>,
    pub slug: String,
}

// ── Machine types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct LaunchMachineRequest {
    pub name: String,
    pub region: String,
    pub config: MachineConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<GuestConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<MachineService>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<MachineFile>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_destroy: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestConfig {
    pub cpus: u32,
    pub cpu_kind: String,
    pub memory_mb: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineService {
    pub protocol: String,
    pub internal_port: u16,
    #[serde(default)]
    pub ports: Vec<MachinePort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachinePort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub handlers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineFile {
    pub guest_path: String,
    pub raw_value: String,
}

/// Machine state as reported by the Machines API.
///
/// States the supervisor does not act on (`created`, `stopping`,
/// `destroying`, ...) decode as `Unknown`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Started,
    Starting,
    Stopped,
    Suspended,
    #[default]
    #[serde(other)]
    Unknown,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Starting => "starting",
            Self::Stopped => "stopped",
            Self::Suspended => "suspended",
            Self::Unknown => "unknown",
        }
    }

    /// Still on its way somewhere; worth polling again.
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Starting | Self::Unknown)
    }

    /// Powered down, either stopped or suspended.
    pub fn is_down(&self) -> bool {
        matches!(self, Self::Stopped | Self::Suspended)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: MachineState,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub config: Option<MachineConfig>,
}

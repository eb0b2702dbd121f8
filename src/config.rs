use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// How aggressively the agent claims host resources. Selected by the user,
/// immutable for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceMode {
    Aggressive,
    Balanced,
    Conservative,
    IdleOnly,
}

impl Default for ResourceMode {
    fn default() -> Self {
        ResourceMode::Balanced
    }
}

impl std::fmt::Display for ResourceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceMode::Aggressive => write!(f, "aggressive"),
            ResourceMode::Balanced => write!(f, "balanced"),
            ResourceMode::Conservative => write!(f, "conservative"),
            ResourceMode::IdleOnly => write!(f, "idle-only"),
        }
    }
}

impl FromStr for ResourceMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "aggressive" => Ok(ResourceMode::Aggressive),
            "balanced" => Ok(ResourceMode::Balanced),
            "conservative" => Ok(ResourceMode::Conservative),
            "idle-only" => Ok(ResourceMode::IdleOnly),
            other => Err(format!(
                "unknown resource mode '{}' (expected aggressive, balanced, conservative or idle-only)",
                other
            )),
        }
    }
}

/// Limits applied to every sandboxed guest.
#[derive(Debug, Clone)]
pub struct WasmLimits {
    /// Default linear memory budget when the job does not carry one (64KB pages).
    pub max_memory_pages: u64,
    /// Hard wall-clock ceiling for a single execution.
    pub max_execution: Duration,
    /// CPU-time budget the fuel quota is derived from.
    pub cpu_time: Duration,
    /// Fuel granted per second of CPU budget. Calibration constant, not a
    /// structural requirement.
    pub fuel_per_cpu_second: u64,
}

impl Default for WasmLimits {
    fn default() -> Self {
        Self {
            max_memory_pages: 64, // 4MB
            max_execution: Duration::from_secs(30),
            cpu_time: Duration::from_secs(10),
            fuel_per_cpu_second: 1_000_000,
        }
    }
}

impl WasmLimits {
    pub fn default_memory_bytes(&self) -> usize {
        (self.max_memory_pages as usize) * 64 * 1024
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the coordinator API.
    pub api_base: String,
    /// Version string reported on registration, compared against releases.
    pub version: String,
    pub mode: ResourceMode,
    /// Root under which per-job scratch directories are created.
    pub work_root: PathBuf,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub cleanup_interval: Duration,
    pub update_interval: Duration,
    /// Ceiling applied to every job regardless of its declared budget.
    pub max_job_timeout: Duration,
    pub auto_update: bool,
    pub update_feed_url: String,
    pub wasm: WasmLimits,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8787".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            mode: ResourceMode::default(),
            work_root: agent_dir().join("work"),
            poll_interval: Duration::from_secs(20),
            heartbeat_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(3600),
            update_interval: Duration::from_secs(6 * 3600),
            max_job_timeout: Duration::from_secs(30 * 60),
            auto_update: true,
            update_feed_url: "https://api.github.com/repos/idlegrid/agent/releases/latest"
                .to_string(),
            wasm: WasmLimits::default(),
        }
    }
}

impl AgentConfig {
    pub fn with_api_base(mut self, api_base: String) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_mode(mut self, mode: ResourceMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_work_root(mut self, work_root: PathBuf) -> Self {
        self.work_root = work_root;
        self
    }
}

/// Per-user directory holding the identity file and the work root.
pub fn agent_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".idlegrid")
}

/// Persisted agent identity. Created on first run, stable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub referral: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(default)]
    pub registered: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl DeviceIdentity {
    fn fresh() -> Self {
        let now = Utc::now();
        Self {
            email: String::new(),
            referral: String::new(),
            device_id: Uuid::new_v4().to_string(),
            registered: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Load the identity from the default location, creating it on first run.
    pub fn load() -> Result<Self> {
        Self::load_from(&agent_dir().join("config.json"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let mut identity: DeviceIdentity = serde_json::from_slice(&bytes)?;
                if identity.device_id.is_empty() {
                    identity.device_id = Uuid::new_v4().to_string();
                    identity.save_to(path)?;
                }
                Ok(identity)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::fresh();
                identity.save_to(path)?;
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&agent_dir().join("config.json"))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
            }
        }
        let mut updated = self.clone();
        updated.updated_at = Utc::now();
        let bytes = serde_json::to_vec_pretty(&updated)?;
        std::fs::write(path, bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

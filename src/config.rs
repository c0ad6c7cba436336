//! Service configuration.
//!
//! Loaded from a TOML file in which every key is optional; missing keys take
//! the defaults below. Command-line flags are applied on top in `main`.
//!
//! ```toml
//! bind = "0.0.0.0:8000"
//! public_host = "203.0.113.7"
//! state_file = "/home/ubuntu/jupyter_service/instances/jupyter_instances.json"
//! launcher = "/home/ubuntu/jupyter_service/scripts/start_jupyter.sh"
//!
//! [admission]
//! min_reserved_mb = 1024
//! per_instance_budget_mb = 1024
//!
//! [sessions]
//! default_minutes = 60
//! port_range_start = 8000
//! port_range_end = 9999
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::instance::admission::{
    AdmissionPolicy, DEFAULT_MIN_RESERVED_MB, DEFAULT_PER_INSTANCE_BUDGET_MB,
};
use crate::instance::manager::ManagerSettings;
use crate::paths::KeeperPaths;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct KeeperConfig {
    /// Address the HTTP API listens on.
    pub bind: SocketAddr,
    /// Host name or IP put into session URLs handed back to callers.
    pub public_host: String,
    /// Registry file. Defaults to the XDG data directory.
    pub state_file: Option<PathBuf>,
    /// External launcher program.
    pub launcher: PathBuf,
    pub launcher_timeout_secs: u64,
    /// Seconds between background sweeps; 0 disables the background sweep.
    pub sweep_interval_secs: u64,
    pub admission: AdmissionConfig,
    pub sessions: SessionConfig,
    pub credentials: CredentialConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub min_reserved_mb: u64,
    pub per_instance_budget_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub default_minutes: u32,
    pub max_minutes: Option<u32>,
    pub port_range_start: u16,
    pub port_range_end: u16,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Random bytes in a generated password.
    pub password_length_bytes: usize,
    /// External hashing program; the plaintext arrives on stdin and the hash
    /// is read from stdout. Salted SHA-256 is used when absent.
    pub hash_command: Option<Vec<String>>,
    pub hash_timeout_secs: u64,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
            public_host: "127.0.0.1".to_string(),
            state_file: None,
            launcher: PathBuf::from("/usr/local/libexec/jupyter-keeper/start_jupyter.sh"),
            launcher_timeout_secs: 60,
            sweep_interval_secs: 60,
            admission: AdmissionConfig::default(),
            sessions: SessionConfig::default(),
            credentials: CredentialConfig::default(),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            min_reserved_mb: DEFAULT_MIN_RESERVED_MB,
            per_instance_budget_mb: DEFAULT_PER_INSTANCE_BUDGET_MB,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_minutes: 60,
            max_minutes: None,
            port_range_start: 8000,
            port_range_end: 9999,
        }
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            password_length_bytes: 10,
            hash_command: None,
            hash_timeout_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl KeeperConfig {
    /// Deserialize from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Load `path`, or the default config file when `path` is `None`.
    ///
    /// An explicitly named file must exist; a missing default file yields the
    /// built-in defaults.
    pub fn load(path: Option<&Path>, paths: &KeeperPaths) -> anyhow::Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (paths.config_file(), false),
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading config {}", path.display()));
            }
        };

        let config = Self::from_toml(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sessions.port_range_start > self.sessions.port_range_end {
            bail!(
                "port range {}..={} is empty",
                self.sessions.port_range_start,
                self.sessions.port_range_end
            );
        }
        if self.sessions.default_minutes == 0 {
            bail!("sessions.default_minutes must be at least 1");
        }
        if let Some(max) = self.sessions.max_minutes {
            if self.sessions.default_minutes > max {
                bail!(
                    "sessions.default_minutes ({}) exceeds sessions.max_minutes ({max})",
                    self.sessions.default_minutes
                );
            }
        }
        if self.launcher_timeout_secs == 0 {
            bail!("launcher_timeout_secs must be at least 1");
        }
        if matches!(&self.credentials.hash_command, Some(cmd) if cmd.is_empty()) {
            bail!("credentials.hash_command must name a program");
        }
        Ok(())
    }

    pub fn state_file(&self, paths: &KeeperPaths) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| paths.state_file.clone())
    }

    pub fn launcher_timeout(&self) -> Duration {
        Duration::from_secs(self.launcher_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            policy: AdmissionPolicy {
                min_reserved_mb: self.admission.min_reserved_mb,
                per_instance_budget_mb: self.admission.per_instance_budget_mb,
            },
            default_session_minutes: self.sessions.default_minutes,
            max_session_minutes: self.sessions.max_minutes,
            port_range: self.sessions.port_range_start..=self.sessions.port_range_end,
            password_length_bytes: self.credentials.password_length_bytes,
        }
    }
}

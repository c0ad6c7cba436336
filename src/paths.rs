//! Standard directories for jupyter-keeper.
//!
//! Provides a single `KeeperPaths` struct that resolves the default config
//! file, state file and log directory following XDG conventions:
//!
//! - Config: `$XDG_CONFIG_HOME/jupyter-keeper/keeper.toml` (`~/.config/...`)
//! - Data:   `$XDG_DATA_HOME/jupyter-keeper/` (`~/.local/share/...`)
//! - State:  `<data>/instances/jupyter_instances.json`
//! - Logs:   `<data>/logs/`

use std::path::{Path, PathBuf};
use tracing::info;

const APP_NAME: &str = "jupyter-keeper";
const CONFIG_FILE: &str = "keeper.toml";
const STATE_FILE: &str = "jupyter_instances.json";

/// All resolved default paths.
#[derive(Debug, Clone)]
pub struct KeeperPaths {
    /// Directory holding `keeper.toml`.
    pub config: PathBuf,
    /// Machine-managed data root.
    pub data: PathBuf,
    /// Registry file tracking running sessions.
    pub state_file: PathBuf,
    /// Log directory used when file logging is enabled.
    pub logs: PathBuf,
}

impl KeeperPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        Some(Self::from_dirs(
            resolve_config_dir(&home),
            resolve_data_dir(&home),
        ))
    }

    /// Fallback when `HOME` is unset (system services).
    pub fn system() -> Self {
        Self::from_dirs(
            PathBuf::from("/etc").join(APP_NAME),
            PathBuf::from("/var/lib").join(APP_NAME),
        )
    }

    fn from_dirs(config: PathBuf, data: PathBuf) -> Self {
        Self {
            config,
            state_file: data.join("instances").join(STATE_FILE),
            logs: data.join("logs"),
            data,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join(CONFIG_FILE)
    }

    /// Create the data and log directories if they don't already exist.
    /// The state file's own directory is created on first write.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.data, &self.logs] {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }
        Ok(())
    }
}

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

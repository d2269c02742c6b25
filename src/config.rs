//! Path resolution for jim's on-disk layout
//!
//! Everything lives under a single per-user config directory (mode 0700):
//! the encrypted inventory, the IPC socket, the daemon log and the search
//! index directories.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

/// Environment variable overriding the encrypted inventory path.
pub const ENV_CONFIG_FILE: &str = "JIM_CONFIG_FILE";

/// Environment variable overriding the idle-lock duration (minutes).
pub const ENV_IDLE_LOCK_MINUTES: &str = "JIM_IDLE_LOCK_MINUTES";

const DEFAULT_DIR_NAME: &str = ".jim";
const DEFAULT_INVENTORY_NAME: &str = "config.json.enc";
const DEFAULT_IDLE_LOCK_MINUTES: u64 = 90;

/// Resolved filesystem layout.
#[derive(Debug, Clone)]
pub struct JimPaths {
    config_dir: PathBuf,
    inventory_file: PathBuf,
}

impl JimPaths {
    /// Resolve the layout. `JIM_CONFIG_FILE` has the highest priority; its
    /// parent directory becomes the config directory. The fallback is
    /// `~/.jim/config.json.enc`.
    pub fn resolve() -> Result<Self> {
        if let Ok(path) = std::env::var(ENV_CONFIG_FILE) {
            if !path.is_empty() {
                let inventory_file = PathBuf::from(path);
                let config_dir = inventory_file
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                return Ok(Self {
                    config_dir,
                    inventory_file,
                });
            }
        }

        let home = dirs::home_dir().context("could not determine the user home directory")?;
        let config_dir = home.join(DEFAULT_DIR_NAME);
        let inventory_file = config_dir.join(DEFAULT_INVENTORY_NAME);
        Ok(Self {
            config_dir,
            inventory_file,
        })
    }

    /// Build a layout rooted at an explicit directory.
    pub fn rooted_at(config_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        let inventory_file = config_dir.join(DEFAULT_INVENTORY_NAME);
        Self {
            config_dir,
            inventory_file,
        }
    }

    /// Create the config directory if missing, mode 0700.
    pub fn ensure_config_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config_dir).with_context(|| {
            format!(
                "failed to create config directory {}",
                self.config_dir.display()
            )
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.config_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Path of the encrypted inventory file.
    pub fn inventory_file(&self) -> &Path {
        &self.inventory_file
    }

    /// IPC endpoint; removed and re-created on daemon startup.
    pub fn socket(&self) -> PathBuf {
        self.config_dir.join("socket")
    }

    /// Daemon log, truncated on each start.
    pub fn log_file(&self) -> PathBuf {
        self.config_dir.join("jim-server.log")
    }

    /// Parent of the per-content-hash index directories.
    pub fn indices_dir(&self) -> PathBuf {
        self.config_dir.join("indices")
    }
}

/// Idle-lock duration, overridable via `JIM_IDLE_LOCK_MINUTES`.
pub fn idle_lock_duration() -> Duration {
    let minutes = std::env::var(ENV_IDLE_LOCK_MINUTES)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&m| m > 0)
        .unwrap_or(DEFAULT_IDLE_LOCK_MINUTES);
    Duration::from_secs(minutes * 60)
}

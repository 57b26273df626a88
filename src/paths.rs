//! Host directory structure for qvm.
//!
//! Provides a single `QvmPaths` struct that resolves the standard
//! directories:
//!
//! - Config:    `~/.config/qvm/`  (human-editable `config.toml`)
//! - Data:      `~/.local/share/qvm/` (`~/Library/Application Support/qvm` on macOS)
//! - VMs:       `<data>/vms/<name>/`
//! - Registry:  `<data>/registry.json`
//! - Logs:      `<data>/logs/` (`~/Library/Logs/qvm` on macOS)
//!
//! Each entry can be overridden through [`crate::config::Settings`]; these
//! are only the defaults.

use std::path::{Path, PathBuf};
use tracing::debug;

const APP_NAME: &str = "qvm";

#[derive(Debug, Clone)]
pub struct QvmPaths {
    pub config: PathBuf,
    pub data: PathBuf,
    pub vms: PathBuf,
    pub registry: PathBuf,
    pub logs: PathBuf,
}

impl QvmPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        Some(Self::under_home(&home))
    }

    pub fn under_home(home: &Path) -> Self {
        let data = resolve_data_dir(home);
        Self {
            config: resolve_config_dir(home),
            vms: data.join("vms"),
            registry: data.join("registry.json"),
            logs: resolve_log_dir(home),
            data,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }

    /// Create the directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.data, &self.vms, &self.logs] {
            std::fs::create_dir_all(dir)?;
            debug!("ensured directory: {}", dir.display());
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

#[cfg(target_os = "macos")]
fn resolve_data_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Application Support").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    resolve_data_dir(home).join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_produces_valid_paths() {
        let paths = QvmPaths::under_home(Path::new("/home/tester"));
        assert!(paths.config.to_string_lossy().contains("qvm"));
        assert!(paths.vms.ends_with("vms"));
        assert!(paths.registry.ends_with("registry.json"));
        assert!(paths.config_file().ends_with("config.toml"));
    }

    #[test]
    fn ensure_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = QvmPaths {
            config: tmp.path().join("config"),
            data: tmp.path().join("data"),
            vms: tmp.path().join("data/vms"),
            registry: tmp.path().join("data/registry.json"),
            logs: tmp.path().join("logs"),
        };

        paths.ensure().expect("ensure should succeed");

        assert!(paths.config.is_dir());
        assert!(paths.vms.is_dir());
        assert!(paths.logs.is_dir());
        assert!(!paths.registry.exists());
    }
}

//! Where the config file, the device database and the logs live.
//!
//! Resolution order:
//! 1. `--config <file>`: everything sits next to that file.
//! 2. `COACHLINK_HOME`: an explicit base directory.
//! 3. Portable mode: a `.portable` marker next to the executable.
//! 4. Per-user data directory (`~/.local/share/Coachlink` and friends).

use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory name under the per-user data dir
const APP_NAME: &str = "Coachlink";

/// Environment variable overriding the base directory
pub const HOME_ENV: &str = "COACHLINK_HOME";

/// Resolved on-disk locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    /// YAML config file
    pub config: PathBuf,
    /// Holds the device database
    pub state_dir: PathBuf,
    /// Daily rolling log files
    pub logs_dir: PathBuf,
    /// Whether everything lives in one self-contained directory
    pub is_portable: bool,
}

impl AppPaths {
    /// Lay out paths under one base directory
    pub fn in_dir(base: impl AsRef<Path>, is_portable: bool) -> Self {
        let base = base.as_ref();
        Self {
            config: base.join("config.yaml"),
            state_dir: base.join("state"),
            logs_dir: base.join("logs"),
            is_portable,
        }
    }

    /// Paths for an explicit config file
    pub fn for_config_file(config: impl Into<PathBuf>) -> Self {
        let config = config.into();
        let base = config
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            config,
            ..Self::in_dir(base, true)
        }
    }

    /// Resolve paths from the command line and environment.
    ///
    /// Called before logging is initialized.
    pub fn detect(config_override: Option<&Path>) -> Self {
        if let Some(config) = config_override {
            return Self::for_config_file(config);
        }

        if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Self::in_dir(PathBuf::from(home), true);
        }

        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."));

        if exe_dir.join(".portable").exists() {
            return Self::in_dir(exe_dir, true);
        }

        let data_dir = dirs::data_dir().unwrap_or_else(|| {
            eprintln!("[paths] no per-user data directory, falling back to executable directory");
            exe_dir.clone()
        });
        Self::in_dir(data_dir.join(APP_NAME), false)
    }

    /// Directory holding the config file
    pub fn base_dir(&self) -> PathBuf {
        self.config
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Ensure the state and log directories exist.
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        for dir in [&self.state_dir, &self.logs_dir] {
            if !dir.exists() {
                debug!("Creating directory: {}", dir.display());
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
        }
        Ok(())
    }

    /// Snapshot and offline queue database
    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("coachlink.sled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_dir_layout() {
        let paths = AppPaths::in_dir("/data/coach", false);
        assert_eq!(paths.config, PathBuf::from("/data/coach/config.yaml"));
        assert_eq!(paths.database_path(), PathBuf::from("/data/coach/state/coachlink.sled"));
        assert_eq!(paths.logs_dir, PathBuf::from("/data/coach/logs"));
        assert!(!paths.is_portable);
    }

    #[test]
    fn test_explicit_config_file() {
        let paths = AppPaths::detect(Some(Path::new("/etc/coachlink/panel.yaml")));
        assert_eq!(paths.config, PathBuf::from("/etc/coachlink/panel.yaml"));
        assert_eq!(paths.state_dir, PathBuf::from("/etc/coachlink/state"));
        assert_eq!(paths.base_dir(), PathBuf::from("/etc/coachlink"));
    }

    #[test]
    fn test_bare_config_file_name_uses_cwd() {
        let paths = AppPaths::for_config_file("config.yaml");
        assert_eq!(paths.state_dir, PathBuf::from("./state"));
    }

    #[test]
    fn test_ensure_directories() {
        let temp = tempfile::tempdir().unwrap();
        let paths = AppPaths::in_dir(temp.path().join("nested"), true);
        paths.ensure_directories().unwrap();
        assert!(paths.state_dir.is_dir());
        assert!(paths.logs_dir.is_dir());
    }
}

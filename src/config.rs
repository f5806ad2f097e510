use crate::update::applier::ExecutablePaths;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const AUTO_UPDATE_ENV: &str = "AUTO_UPDATE";

/// Version compiled into this binary; compared against release tags.
pub const CURRENT_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default)]
    pub updater: UpdaterConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UpdaterConfig {
    #[serde(default)]
    pub auto_update: bool,
    /// `owner/name` of the repository whose latest release is tracked.
    #[serde(default)]
    pub repo: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_executable")]
    pub executable: PathBuf,
    #[serde(default = "default_backup")]
    pub backup: PathBuf,
    #[serde(default = "default_download_temp")]
    pub download_temp: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            auto_update: false,
            repo: String::new(),
            api_base_url: default_api_base_url(),
            log_dir: default_log_dir(),
            state_file: default_state_file(),
            check_interval_secs: default_check_interval_secs(),
            metadata_timeout_secs: default_metadata_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
            executable: default_executable(),
            backup: default_backup(),
            download_temp: default_download_temp(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            pid: None,
            interval_secs: default_monitor_interval_secs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }

        validate_updater(&self.updater)?;
        if self.monitor.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "monitor.interval_secs must be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Applies the `AUTO_UPDATE` environment override, if set.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        match std::env::var(AUTO_UPDATE_ENV) {
            Ok(raw) => {
                self.updater.auto_update = parse_flag(&raw).ok_or_else(|| {
                    ConfigError::Validation(format!(
                        "{AUTO_UPDATE_ENV} must be a boolean, got '{raw}'"
                    ))
                })?;
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl UpdaterConfig {
    pub fn executable_paths(&self) -> ExecutablePaths {
        ExecutablePaths {
            canonical: self.executable.clone(),
            backup: self.backup.clone(),
            temp: self.download_temp.clone(),
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

fn validate_updater(cfg: &UpdaterConfig) -> Result<(), ConfigError> {
    if cfg.auto_update {
        let mut parts = cfg.repo.split('/');
        let valid = matches!(
            (parts.next(), parts.next(), parts.next()),
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
        );
        if !valid {
            return Err(ConfigError::Validation(
                "updater.repo must be 'owner/name' when auto_update is enabled".to_string(),
            ));
        }
    }
    if cfg.check_interval_secs < 60 {
        return Err(ConfigError::Validation(
            "updater.check_interval_secs must be >= 60".to_string(),
        ));
    }
    if cfg.metadata_timeout_secs == 0 || cfg.download_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "updater timeouts must be > 0".to_string(),
        ));
    }
    let paths = [&cfg.executable, &cfg.backup, &cfg.download_temp];
    if paths.iter().any(|p| p.as_os_str().is_empty()) {
        return Err(ConfigError::Validation(
            "updater executable, backup and download_temp paths are required".to_string(),
        ));
    }
    if cfg.executable == cfg.backup
        || cfg.executable == cfg.download_temp
        || cfg.backup == cfg.download_temp
    {
        return Err(ConfigError::Validation(
            "updater executable, backup and download_temp must be distinct".to_string(),
        ));
    }
    Ok(())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Some(true),
        "0" | "f" | "false" => Some(false),
        _ => None,
    }
}

fn default_api_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("update_state.json")
}

const fn default_check_interval_secs() -> u64 {
    3 * 24 * 60 * 60
}

const fn default_metadata_timeout_secs() -> u64 {
    5
}

const fn default_download_timeout_secs() -> u64 {
    30 * 60
}

fn default_executable() -> PathBuf {
    PathBuf::from(if cfg!(windows) { "main.exe" } else { "main" })
}

fn default_backup() -> PathBuf {
    PathBuf::from(if cfg!(windows) { "main.exe.bk" } else { "main.bk" })
}

fn default_download_temp() -> PathBuf {
    PathBuf::from(if cfg!(windows) { "main_new.exe" } else { "main_new" })
}

const fn default_monitor_interval_secs() -> u64 {
    2
}

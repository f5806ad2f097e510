use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, UNIX_EPOCH};
use thiserror::Error;

/// Single persisted record describing the updater's last known state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateState {
    pub version: String,
    #[serde(default)]
    pub last_check: Option<i64>,
    pub status: String,
    #[serde(default)]
    pub error: String,
    pub updated_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    Initialized,
    Checking,
    UpdatedTo(String),
    LatestVersion,
    UpdateFailed,
    AutoUpdateDisabled,
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateStatus::Initialized => f.write_str("initialized"),
            UpdateStatus::Checking => f.write_str("checking"),
            UpdateStatus::UpdatedTo(tag) => write!(f, "updated to {tag}"),
            UpdateStatus::LatestVersion => f.write_str("latest version"),
            UpdateStatus::UpdateFailed => f.write_str("update failed"),
            UpdateStatus::AutoUpdateDisabled => f.write_str("auto update disabled"),
        }
    }
}

impl UpdateState {
    pub fn initial(version: &str, now_unix: i64) -> Self {
        Self {
            version: version.to_string(),
            last_check: None,
            status: UpdateStatus::Initialized.to_string(),
            error: String::new(),
            updated_time: now_unix,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read update state {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("failed to parse update state {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("failed to write update state {path}: {source}")]
    Write { path: String, source: io::Error },
}

/// Persistence collaborator for [`UpdateState`]. Readers only ever get copies.
pub trait UpdateStore: Send + Sync {
    fn load(&self) -> UpdateState;

    fn modify(&self, apply: &mut dyn FnMut(&mut UpdateState)) -> Result<(), StoreError>;

    fn set_status(&self, status: &UpdateStatus) -> Result<(), StoreError> {
        let status = status.to_string();
        self.modify(&mut |s| s.status = status.clone())
    }

    fn set_last_check(&self, at_unix: i64) -> Result<(), StoreError> {
        self.modify(&mut |s| s.last_check = Some(at_unix))
    }

    fn set_version(&self, version: &str) -> Result<(), StoreError> {
        self.modify(&mut |s| s.version = version.to_string())
    }

    fn touch_updated_time(&self, at_unix: i64) -> Result<(), StoreError> {
        self.modify(&mut |s| s.updated_time = at_unix)
    }

    /// Appends `[timestamp] msg` as a new line of the error trail.
    fn append_error(&self, msg: &str, at_unix: i64) -> Result<(), StoreError> {
        let line = format!("[{}] {msg}", format_unix(at_unix));
        self.modify(&mut |s| {
            s.error.push('\n');
            s.error.push_str(&line);
        })
    }

    fn clear_error(&self) -> Result<(), StoreError> {
        self.modify(&mut |s| s.error.clear())
    }
}

/// JSON file store. The file is rewritten atomically on every change.
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<UpdateState>,
}

impl JsonFileStore {
    /// Loads the record, creating it with status `initialized` on first boot.
    pub fn open(
        path: impl AsRef<Path>,
        running_version: &str,
        now_unix: i64,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let path_display = path.display().to_string();

        let state = match fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
                    path: path_display,
                    source,
                })?
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let state = UpdateState::initial(running_version, now_unix);
                write_atomic(&path, &state)?;
                tracing::info!(path = %path.display(), "update state initialized");
                state
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: path_display,
                    source,
                })
            }
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }
}

impl UpdateStore for JsonFileStore {
    fn load(&self) -> UpdateState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn modify(&self, apply: &mut dyn FnMut(&mut UpdateState)) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = state.clone();
        apply(&mut next);
        write_atomic(&self.path, &next)?;
        *state = next;
        Ok(())
    }
}

fn write_atomic(path: &Path, state: &UpdateState) -> Result<(), StoreError> {
    let write_err = |source| StoreError::Write {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let json = serde_json::to_vec_pretty(state).map_err(|err| write_err(io::Error::other(err)))?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)
    })();

    if let Err(err) = result {
        let _ = fs::remove_file(&tmp);
        return Err(write_err(err));
    }
    Ok(())
}

pub fn format_unix(ts: i64) -> String {
    let st = UNIX_EPOCH + Duration::from_secs(ts.max(0) as u64);
    humantime::format_rfc3339_seconds(st).to_string()
}

#[cfg(test)]
pub(crate) struct MemoryStore {
    state: Mutex<UpdateState>,
}

#[cfg(test)]
impl MemoryStore {
    pub(crate) fn new(version: &str) -> Self {
        Self {
            state: Mutex::new(UpdateState::initial(version, 0)),
        }
    }
}

#[cfg(test)]
impl UpdateStore for MemoryStore {
    fn load(&self) -> UpdateState {
        self.state.lock().unwrap().clone()
    }

    fn modify(&self, apply: &mut dyn FnMut(&mut UpdateState)) -> Result<(), StoreError> {
        apply(&mut self.state.lock().unwrap());
        Ok(())
    }
}

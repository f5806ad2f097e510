use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Error)]
pub enum RestartError {
    #[error("failed to start new process {path}: {source}")]
    Spawn { path: String, source: io::Error },
}

/// Brings up the freshly installed executable.
pub trait Restarter: Send + Sync {
    fn restart(&self) -> Result<(), RestartError>;
}

/// Spawns the canonical executable as a sibling process with the current
/// arguments, then asks this process to shut down.
///
/// The canonical path is used rather than `current_exe()`: after the swap the
/// running image lives at the backup path.
pub struct ReexecRestarter {
    program: PathBuf,
    args: Vec<OsString>,
    shutdown: watch::Sender<bool>,
}

impl ReexecRestarter {
    pub fn new(program: PathBuf, shutdown: watch::Sender<bool>) -> Self {
        Self {
            program,
            args: std::env::args_os().skip(1).collect(),
            shutdown,
        }
    }
}

impl Restarter for ReexecRestarter {
    fn restart(&self) -> Result<(), RestartError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| RestartError::Spawn {
                path: self.program.display().to_string(),
                source,
            })?;
        info!(pid = child.id(), "new process started");
        self.shutdown.send_replace(true);
        Ok(())
    }
}

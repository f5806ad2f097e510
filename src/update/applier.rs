use crate::update::logsink::UpdateLog;
use crate::update::release::ExpectedDigest;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

/// On-disk locations the applier is allowed to touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutablePaths {
    pub canonical: PathBuf,
    pub backup: PathBuf,
    pub temp: PathBuf,
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("failed to download: {0}")]
    Download(#[source] reqwest::Error),
    #[error("unexpected status: {0}")]
    UnexpectedStatus(StatusCode),
    #[error("failed to create temp file {path}: {source}")]
    TempFile { path: String, source: io::Error },
    #[error("failed to save update: {0}")]
    Write(#[source] io::Error),
    #[error("failed to sync: {0}")]
    Sync(#[source] io::Error),
    #[error("hash mismatch: expected {expected} got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("failed to set permissions on {path}: {source}")]
    Permissions { path: String, source: io::Error },
    #[error("failed to backup {from} to {to}: {source}")]
    Backup {
        from: String,
        to: String,
        source: io::Error,
    },
    #[error("failed to replace exe {path}: {source}")]
    Replace { path: String, source: io::Error },
}

impl ApplyError {
    /// True when the canonical executable may be missing and has to be
    /// restored from the backup by hand.
    pub fn leaves_recovery_window(&self) -> bool {
        matches!(self, ApplyError::Replace { .. })
    }
}

#[async_trait]
pub trait UpdateApplier: Send + Sync {
    /// Downloads `url`, verifies it against `expected` and swaps it in as the
    /// canonical executable. Returns the number of bytes written.
    async fn apply(
        &self,
        url: &str,
        expected: &ExpectedDigest,
        log: &UpdateLog,
    ) -> Result<u64, ApplyError>;
}

pub struct HttpApplier {
    client: Client,
    paths: ExecutablePaths,
    timeout: Duration,
}

impl HttpApplier {
    pub fn new(client: Client, paths: ExecutablePaths, timeout: Duration) -> Self {
        Self {
            client,
            paths,
            timeout,
        }
    }

    async fn download(&self, url: &str) -> Result<Response, ApplyError> {
        let resp = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(ApplyError::Download)?;
        if !resp.status().is_success() {
            return Err(ApplyError::UnexpectedStatus(resp.status()));
        }
        Ok(resp)
    }

    async fn backup_current(&self, log: &UpdateLog) -> Result<(), ApplyError> {
        let ExecutablePaths {
            canonical, backup, ..
        } = &self.paths;
        let backup_err = |source| ApplyError::Backup {
            from: canonical.display().to_string(),
            to: backup.display().to_string(),
            source,
        };

        if !fs::try_exists(canonical).await.map_err(backup_err)? {
            return Ok(());
        }

        log.info("Backing up old executable");
        match fs::remove_file(backup).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(backup_err(err)),
        }
        fs::rename(canonical, backup).await.map_err(backup_err)
    }
}

#[async_trait]
impl UpdateApplier for HttpApplier {
    async fn apply(
        &self,
        url: &str,
        expected: &ExpectedDigest,
        log: &UpdateLog,
    ) -> Result<u64, ApplyError> {
        log.info("Downloading update...");
        let resp = self.download(url).await?;

        let temp = &self.paths.temp;
        let mut file = File::create(temp)
            .await
            .map_err(|source| ApplyError::TempFile {
                path: temp.display().to_string(),
                source,
            })?;
        let streamed = stream_to_file(resp, &mut file).await;
        drop(file);
        let (written, actual) = match streamed {
            Ok(done) => done,
            Err(err) => {
                discard(temp).await;
                return Err(err);
            }
        };
        log.info(format!("Downloaded {written} bytes"));

        if actual != expected.as_hex() {
            discard(temp).await;
            return Err(ApplyError::HashMismatch {
                expected: expected.as_hex().to_string(),
                actual,
            });
        }
        log.info("Hash verified successfully");

        if let Err(err) = copy_mode(&self.paths.canonical, temp).await {
            discard(temp).await;
            return Err(err);
        }
        if let Err(err) = self.backup_current(log).await {
            discard(temp).await;
            return Err(err);
        }

        log.info("Replacing executable");
        fs::rename(temp, &self.paths.canonical)
            .await
            .map_err(|source| ApplyError::Replace {
                path: self.paths.canonical.display().to_string(),
                source,
            })?;

        Ok(written)
    }
}

/// Single pass: every chunk goes to the file and the hasher, then the file
/// is flushed to stable storage. Returns bytes written and the hex digest.
async fn stream_to_file(mut resp: Response, file: &mut File) -> Result<(u64, String), ApplyError> {
    let mut hasher = Sha256::new();
    let mut written = 0_u64;

    while let Some(chunk) = resp.chunk().await.map_err(ApplyError::Download)? {
        file.write_all(&chunk).await.map_err(ApplyError::Write)?;
        hasher.update(&chunk);
        written += chunk.len() as u64;
    }

    file.flush().await.map_err(ApplyError::Write)?;
    file.sync_all().await.map_err(ApplyError::Sync)?;
    Ok((written, hex::encode(hasher.finalize())))
}

async fn discard(temp: &Path) {
    if let Err(err) = fs::remove_file(temp).await {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %temp.display(), error = %err, "failed to remove temp download");
        }
    }
}

#[cfg(unix)]
async fn copy_mode(canonical: &Path, temp: &Path) -> Result<(), ApplyError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = match fs::metadata(canonical).await {
        Ok(meta) => meta.permissions().mode(),
        Err(_) => 0o755,
    };
    fs::set_permissions(temp, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|source| ApplyError::Permissions {
            path: temp.display().to_string(),
            source,
        })
}

#[cfg(not(unix))]
async fn copy_mode(_canonical: &Path, _temp: &Path) -> Result<(), ApplyError> {
    Ok(())
}

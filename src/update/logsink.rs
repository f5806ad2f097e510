use regex::bytes::Regex;
use std::fs::{self, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, PoisonError};
use thiserror::Error;

const COLOR_GREEN: &str = "\x1b[92m";
const COLOR_RED: &str = "\x1b[31m";
const COLOR_RESET: &str = "\x1b[0m";

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("ANSI pattern is valid"));

#[derive(Debug, Error)]
pub enum LogSinkError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir { path: String, source: io::Error },
    #[error("failed to open log file {path}: {source}")]
    Open { path: String, source: io::Error },
}

/// Writes to both sinks; the secondary one sees the same bytes after any
/// transform it applies itself.
pub struct Tee<A, B> {
    primary: A,
    secondary: B,
}

impl<A: Write, B: Write> Tee<A, B> {
    pub fn new(primary: A, secondary: B) -> Self {
        Self { primary, secondary }
    }
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.primary.write_all(buf)?;
        self.secondary.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.primary.flush()?;
        self.secondary.flush()
    }
}

/// Removes terminal colour sequences before handing bytes on.
///
/// Callers write whole lines, so an escape sequence never straddles two
/// `write` calls.
pub struct StripAnsi<W> {
    inner: W,
}

impl<W: Write> StripAnsi<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for StripAnsi<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let clean = ANSI_ESCAPE.replace_all(buf, &b""[..]);
        self.inner.write_all(&clean)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Operator-facing audit log for update checks: coloured on the console,
/// plain text in the log file.
pub struct UpdateLog {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl UpdateLog {
    /// Opens `dir/file_name`, keeping the previous run's file as `file_name.1`.
    pub fn open(dir: &Path, file_name: &str) -> Result<Self, LogSinkError> {
        fs::create_dir_all(dir).map_err(|source| LogSinkError::CreateDir {
            path: dir.display().to_string(),
            source,
        })?;

        let path = dir.join(file_name);
        rotate(&path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| LogSinkError::Open {
                path: path.display().to_string(),
                source,
            })?;

        Ok(Self::from_parts(io::stdout(), LineWriter::new(file)))
    }

    pub fn from_parts<C, F>(console: C, file: F) -> Self
    where
        C: Write + Send + 'static,
        F: Write + Send + 'static,
    {
        Self {
            sink: Mutex::new(Box::new(Tee::new(console, StripAnsi::new(file)))),
        }
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        self.line(COLOR_GREEN, "[UPDT][INFO]", msg.as_ref());
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        self.line(COLOR_RED, "[UPDT][ERROR]", msg.as_ref());
    }

    fn line(&self, color: &str, tag: &str, msg: &str) {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = writeln!(sink, "{color}{tag}{COLOR_RESET}|{msg}");
    }
}

fn rotate(path: &Path) {
    if !path.exists() {
        return;
    }
    let mut rotated = path.as_os_str().to_owned();
    rotated.push(".1");
    let rotated = PathBuf::from(rotated);
    if let Err(err) = fs::rename(path, &rotated) {
        tracing::warn!(path = %path.display(), error = %err, "failed to rotate update log");
    }
}

/// Captures the plain-text side and drops the console side.
#[cfg(test)]
pub(crate) fn capture(buf: SharedBuf) -> UpdateLog {
    UpdateLog::from_parts(io::sink(), buf)
}

#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct SharedBuf(std::sync::Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl SharedBuf {
    pub(crate) fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[cfg(test)]
impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_keeps_colours_and_file_is_stripped() {
        let console = SharedBuf::default();
        let file = SharedBuf::default();
        let log = UpdateLog::from_parts(console.clone(), file.clone());

        log.info("Checking for updates...");
        log.error("hash mismatch");

        let console = console.text();
        assert!(console.contains("\x1b[92m[UPDT][INFO]\x1b[0m|Checking for updates..."));
        assert!(console.contains("\x1b[31m[UPDT][ERROR]"));

        assert_eq!(
            file.text(),
            "[UPDT][INFO]|Checking for updates...\n[UPDT][ERROR]|hash mismatch\n"
        );
    }

    #[test]
    fn strip_ansi_handles_compound_sequences() {
        let out = SharedBuf::default();
        let mut writer = StripAnsi::new(out.clone());
        writer.write_all(b"\x1b[1;32mok\x1b[0m plain\x1b[2K\n").unwrap();
        assert_eq!(out.text(), "ok plain\n");
    }

    #[test]
    fn open_creates_dir_and_rotates_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");

        {
            let log = UpdateLog::open(&log_dir, "update.log").unwrap();
            log.info("first run");
        }
        {
            let log = UpdateLog::open(&log_dir, "update.log").unwrap();
            log.info("second run");
        }

        let current = fs::read_to_string(log_dir.join("update.log")).unwrap();
        let previous = fs::read_to_string(log_dir.join("update.log.1")).unwrap();
        assert_eq!(current, "[UPDT][INFO]|second run\n");
        assert_eq!(previous, "[UPDT][INFO]|first run\n");
    }

    #[test]
    fn open_fails_when_dir_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("logs");
        fs::write(&blocker, b"not a dir").unwrap();

        assert!(matches!(
            UpdateLog::open(&blocker, "update.log"),
            Err(LogSinkError::CreateDir { .. })
        ));
    }
}

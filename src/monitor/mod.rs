pub mod probe;

use probe::{ProbeError, ProcessProbe, SysinfoProbe};
use serde::Serialize;
use std::fmt::Display;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{info, warn};

/// Latest observation of the monitored process. CPU may exceed 100 on
/// multi-core hosts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub pid: u32,
    pub cpu_percent: f64,
    pub rss_bytes: u64,
    pub vms_bytes: u64,
    pub threads: u32,
    pub status: Vec<String>,
    #[serde(rename = "started_at")]
    pub started_at_unix: i64,
    #[serde(rename = "at")]
    pub at_unix_ms: i64,
    pub running: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub err: String,
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to attach to process {pid}: {source}")]
    Attach { pid: u32, source: ProbeError },
}

pub struct Monitor {
    pid: u32,
    probe: Arc<dyn ProcessProbe>,
    last: Arc<RwLock<Snapshot>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    /// Binds to a live OS process. Fails when `pid` does not exist.
    pub fn attach(pid: u32) -> Result<Self, MonitorError> {
        let probe =
            SysinfoProbe::attach(pid).map_err(|source| MonitorError::Attach { pid, source })?;
        Ok(Self::with_probe(pid, Arc::new(probe)))
    }

    pub fn with_probe(pid: u32, probe: Arc<dyn ProcessProbe>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            pid,
            probe,
            last: Arc::new(RwLock::new(Snapshot {
                pid,
                ..Snapshot::default()
            })),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Takes the CPU baseline and starts sampling every `interval`.
    /// The first sample lands one interval after the call.
    pub fn start(&self, interval: Duration) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if *self.shutdown.borrow() {
            warn!(pid = self.pid, "monitor already stopped, not restarting");
            return;
        }
        if task.is_some() {
            warn!(pid = self.pid, "monitor already started");
            return;
        }

        let _ = self.probe.cpu_percent();

        let pid = self.pid;
        let probe = self.probe.clone();
        let last = self.last.clone();
        let mut shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let sample = sample_once(pid, probe.as_ref(), now_unix_ms());
                        *last.write().unwrap_or_else(PoisonError::into_inner) = sample;
                    }
                }
            }
            info!(pid, "process monitor stopped");
        }));
        info!(pid, interval_ms = interval.as_millis() as u64, "process monitor started");
    }

    /// Cancels sampling after the tick in progress, if any. Safe to repeat.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn snapshot(&self) -> Snapshot {
        self.last
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Collects one snapshot. A metric that fails is reported in `err` and does
/// not stop the remaining ones.
pub fn sample_once(pid: u32, probe: &dyn ProcessProbe, now_unix_ms: i64) -> Snapshot {
    let mut s = Snapshot {
        pid,
        at_unix_ms: now_unix_ms,
        ..Snapshot::default()
    };

    match probe.is_running() {
        Ok(true) => s.running = true,
        Ok(false) => s.err = "process not running".to_string(),
        Err(err) => s.err = err.to_string(),
    }
    if !s.running {
        return s;
    }

    match probe.cpu_percent() {
        Ok(cpu) => s.cpu_percent = cpu,
        Err(err) => join_err(&mut s.err, err),
    }
    match probe.memory_info() {
        Ok(mem) => {
            s.rss_bytes = mem.rss;
            s.vms_bytes = mem.vms;
        }
        Err(err) => join_err(&mut s.err, err),
    }
    match probe.num_threads() {
        Ok(threads) => s.threads = threads,
        Err(err) => join_err(&mut s.err, err),
    }
    match probe.status() {
        Ok(status) => s.status = status,
        Err(err) => join_err(&mut s.err, err),
    }
    match probe.create_time() {
        Ok(started) => s.started_at_unix = started,
        Err(err) => join_err(&mut s.err, err),
    }

    s
}

fn join_err(acc: &mut String, err: impl Display) {
    if !acc.is_empty() {
        acc.push_str("; ");
    }
    acc.push_str(&err.to_string());
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(target_os = "linux")]
use std::fs;
use std::sync::{Mutex, PoisonError};
use sysinfo::{
    Pid, PidExt, Process, ProcessExt, ProcessRefreshKind, ProcessStatus, System, SystemExt,
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    pub rss: u64,
    pub vms: u64,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("process {0} not found")]
    NotFound(u32),
    #[error("{metric}: {reason}")]
    Unavailable {
        metric: &'static str,
        reason: String,
    },
}

/// OS view of one process. Every call may fail independently.
pub trait ProcessProbe: Send + Sync {
    fn is_running(&self) -> Result<bool, ProbeError>;
    /// Usage since the previous call; the first call only sets the baseline.
    fn cpu_percent(&self) -> Result<f64, ProbeError>;
    fn memory_info(&self) -> Result<MemoryInfo, ProbeError>;
    fn num_threads(&self) -> Result<u32, ProbeError>;
    fn status(&self) -> Result<Vec<String>, ProbeError>;
    /// Start time in unix seconds.
    fn create_time(&self) -> Result<i64, ProbeError>;
}

pub struct SysinfoProbe {
    pid: Pid,
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn attach(pid: u32) -> Result<Self, ProbeError> {
        let sys_pid = Pid::from_u32(pid);
        let mut system = System::new();
        // Per-process CPU usage is computed against the global CPU counters.
        system.refresh_cpu();
        if !system.refresh_process_specifics(sys_pid, ProcessRefreshKind::new()) {
            return Err(ProbeError::NotFound(pid));
        }
        Ok(Self {
            pid: sys_pid,
            system: Mutex::new(system),
        })
    }

    fn read<T>(
        &self,
        metric: &'static str,
        refresh: Option<ProcessRefreshKind>,
        f: impl FnOnce(&Process) -> T,
    ) -> Result<T, ProbeError> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(kind) = refresh {
            if !system.refresh_process_specifics(self.pid, kind) {
                return Err(gone(metric));
            }
        }
        system.process(self.pid).map(f).ok_or_else(|| gone(metric))
    }
}

impl ProcessProbe for SysinfoProbe {
    fn is_running(&self) -> Result<bool, ProbeError> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        if !system.refresh_process_specifics(self.pid, ProcessRefreshKind::new()) {
            return Ok(false);
        }
        Ok(system
            .process(self.pid)
            .map(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .unwrap_or(false))
    }

    fn cpu_percent(&self) -> Result<f64, ProbeError> {
        self.read("cpu", Some(ProcessRefreshKind::new().with_cpu()), |p| {
            p.cpu_usage() as f64
        })
    }

    fn memory_info(&self) -> Result<MemoryInfo, ProbeError> {
        self.read("memory", None, |p| MemoryInfo {
            rss: p.memory(),
            vms: p.virtual_memory(),
        })
    }

    #[cfg(target_os = "linux")]
    fn num_threads(&self) -> Result<u32, ProbeError> {
        let path = format!("/proc/{}/status", self.pid.as_u32());
        let text = fs::read_to_string(&path).map_err(|err| ProbeError::Unavailable {
            metric: "threads",
            reason: err.to_string(),
        })?;
        parse_proc_threads(&text).ok_or_else(|| ProbeError::Unavailable {
            metric: "threads",
            reason: format!("no Threads line in {path}"),
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn num_threads(&self) -> Result<u32, ProbeError> {
        Err(ProbeError::Unavailable {
            metric: "threads",
            reason: "not supported on this platform".to_string(),
        })
    }

    fn status(&self) -> Result<Vec<String>, ProbeError> {
        self.read("status", None, |p| vec![status_flag(p.status())])
    }

    fn create_time(&self) -> Result<i64, ProbeError> {
        self.read("create_time", None, |p| p.start_time() as i64)
    }
}

fn gone(metric: &'static str) -> ProbeError {
    ProbeError::Unavailable {
        metric,
        reason: "process not found".to_string(),
    }
}

fn status_flag(status: ProcessStatus) -> String {
    format!("{status:?}").to_lowercase()
}

#[cfg(target_os = "linux")]
fn parse_proc_threads(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Threads:"))
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn parses_thread_count_from_proc_status() {
        let text = "Name:\tjava\nState:\tS (sleeping)\nThreads:\t42\nSigQ:\t0/63\n";
        assert_eq!(parse_proc_threads(text), Some(42));
        assert_eq!(parse_proc_threads("Name:\tx\n"), None);
    }

    #[test]
    fn status_flags_are_lowercase() {
        assert_eq!(status_flag(ProcessStatus::Sleep), "sleep");
        assert_eq!(status_flag(ProcessStatus::Zombie), "zombie");
    }

    #[test]
    fn attach_to_self_reads_metrics() {
        let probe = SysinfoProbe::attach(std::process::id()).unwrap();

        assert!(probe.is_running().unwrap());
        probe.cpu_percent().unwrap();
        let mem = probe.memory_info().unwrap();
        assert!(mem.rss > 0);
        assert!(probe.create_time().unwrap() > 0);
        assert_eq!(probe.status().unwrap().len(), 1);
        #[cfg(target_os = "linux")]
        assert!(probe.num_threads().unwrap() >= 1);
    }
}

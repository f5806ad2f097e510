use crate::metrics::Metrics;
use crate::update::applier::{ApplyError, UpdateApplier};
use crate::update::guard::{RunGuard, RunPermit};
use crate::update::logsink::{LogSinkError, UpdateLog};
use crate::update::release::{ReleaseError, ReleaseSource, UpdateTarget};
use crate::update::restart::Restarter;
use crate::update::store::{StoreError, UpdateStatus, UpdateStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, warn};

pub const STARTUP_LOG: &str = "update.log";
pub const CHECKER_LOG: &str = "update_checker.log";

#[derive(Debug, Clone)]
pub struct UpdateSettings {
    pub auto_update: bool,
    pub current_version: String,
    pub log_dir: PathBuf,
}

#[derive(Debug)]
pub enum CycleOutcome {
    AlreadyRunning,
    Disabled,
    Latest,
    Applied { tag: String },
    Failed(CycleError),
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::AlreadyRunning => "already_running",
            CycleOutcome::Disabled => "disabled",
            CycleOutcome::Latest => "latest",
            CycleOutcome::Applied { .. } => "applied",
            CycleOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Release(#[from] ReleaseError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

/// States of one check-and-apply cycle. The permit travels with the
/// non-terminal states and is released when the cycle reaches `Done`.
enum Phase {
    Idle,
    Checking(RunPermit),
    Applying {
        permit: RunPermit,
        tag: String,
        target: UpdateTarget,
    },
    Done(CycleOutcome),
}

pub struct UpdateScheduler {
    settings: UpdateSettings,
    source: Arc<dyn ReleaseSource>,
    applier: Arc<dyn UpdateApplier>,
    store: Arc<dyn UpdateStore>,
    restarter: Arc<dyn Restarter>,
    guard: RunGuard,
    metrics: Option<Arc<Metrics>>,
}

impl UpdateScheduler {
    pub fn new(
        settings: UpdateSettings,
        source: Arc<dyn ReleaseSource>,
        applier: Arc<dyn UpdateApplier>,
        store: Arc<dyn UpdateStore>,
        restarter: Arc<dyn Restarter>,
        guard: RunGuard,
    ) -> Self {
        Self {
            settings,
            source,
            applier,
            store,
            restarter,
            guard,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn guard(&self) -> &RunGuard {
        &self.guard
    }

    /// Startup check. Fails only when the audit log cannot be opened, in
    /// which case no check is attempted.
    pub async fn check_now(&self) -> Result<CycleOutcome, LogSinkError> {
        let log = match UpdateLog::open(&self.settings.log_dir, STARTUP_LOG) {
            Ok(log) => log,
            Err(err) => {
                self.persist(
                    "error trail",
                    self.store.append_error("startup logger failed", now_unix()),
                );
                return Err(err);
            }
        };
        Ok(self.run_once(&log).await)
    }

    /// Periodic checker. Runs until an update is applied or `shutdown` flips;
    /// a cycle that already started always runs to completion.
    pub fn spawn_background(
        self: Arc<Self>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_background(interval, shutdown).await })
    }

    async fn run_background(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let log = match UpdateLog::open(&self.settings.log_dir, CHECKER_LOG) {
            Ok(log) => log,
            Err(err) => {
                error!(error = %err, "failed to start update checker logger");
                return;
            }
        };
        log.info(format!(
            "Update checker started, interval: {}",
            humantime::format_duration(interval)
        ));

        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log.info("Update checker stopped");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    log.info("Running scheduled update check...");
                    match self.run_once(&log).await {
                        CycleOutcome::Applied { .. } => return,
                        CycleOutcome::Latest => log.info("Already at latest version"),
                        CycleOutcome::Disabled => log.info("Auto update is disabled"),
                        CycleOutcome::AlreadyRunning => {
                            log.info("Another update check is in flight, skipping")
                        }
                        CycleOutcome::Failed(_) => {}
                    }
                }
            }
        }
    }

    /// One cycle followed by the restart trigger when it applied an update.
    pub async fn run_once(&self, log: &UpdateLog) -> CycleOutcome {
        let outcome = self.run_cycle(log).await;
        if let Some(metrics) = &self.metrics {
            metrics.inc_update_check(outcome.label());
        }
        if matches!(outcome, CycleOutcome::Applied { .. }) {
            self.trigger_restart(log);
        }
        outcome
    }

    pub async fn run_cycle(&self, log: &UpdateLog) -> CycleOutcome {
        let mut phase = Phase::Idle;
        loop {
            phase = match phase {
                Phase::Idle => self.begin(log),
                Phase::Checking(permit) => self.check(permit, log).await,
                Phase::Applying {
                    permit,
                    tag,
                    target,
                } => self.apply(permit, tag, target, log).await,
                Phase::Done(outcome) => return outcome,
            };
        }
    }

    fn begin(&self, log: &UpdateLog) -> Phase {
        let Some(permit) = self.guard.try_acquire() else {
            log.info("update check already running, skipping...");
            return Phase::Done(CycleOutcome::AlreadyRunning);
        };

        self.persist("last check", self.store.set_last_check(now_unix()));

        if !self.settings.auto_update {
            log.info("Auto update is disabled");
            self.persist(
                "status",
                self.store.set_status(&UpdateStatus::AutoUpdateDisabled),
            );
            return Phase::Done(CycleOutcome::Disabled);
        }

        self.persist("status", self.store.set_status(&UpdateStatus::Checking));
        Phase::Checking(permit)
    }

    async fn check(&self, permit: RunPermit, log: &UpdateLog) -> Phase {
        log.info("Checking for updates...");
        let release = match self.source.fetch_latest().await {
            Ok(release) => release,
            Err(err) => return self.fail(log, err.into()),
        };

        if release.tag_name == self.settings.current_version {
            log.info(format!(
                "You are running the latest version: {}",
                self.settings.current_version
            ));
            self.persist("status", self.store.set_status(&UpdateStatus::LatestVersion));
            return Phase::Done(CycleOutcome::Latest);
        }

        let target = match release.target() {
            Ok(target) => target,
            Err(err) => return self.fail(log, err.into()),
        };
        log.info(format!("New version available: {}", release.tag_name));
        Phase::Applying {
            permit,
            tag: release.tag_name,
            target,
        }
    }

    async fn apply(
        &self,
        _permit: RunPermit,
        tag: String,
        target: UpdateTarget,
        log: &UpdateLog,
    ) -> Phase {
        if let Err(err) = self
            .applier
            .apply(&target.url, &target.digest, log)
            .await
        {
            return self.fail(log, err.into());
        }

        self.persist("version", self.store.set_version(&tag));
        self.persist(
            "status",
            self.store.set_status(&UpdateStatus::UpdatedTo(tag.clone())),
        );
        self.persist("updated time", self.store.touch_updated_time(now_unix()));
        self.persist("error trail", self.store.clear_error());
        log.info(format!("Update to {tag} applied successfully"));
        Phase::Done(CycleOutcome::Applied { tag })
    }

    fn fail(&self, log: &UpdateLog, err: CycleError) -> Phase {
        if let CycleError::Apply(apply_err) = &err {
            if apply_err.leaves_recovery_window() {
                log.error(
                    "executable replacement failed after backup; the canonical executable may be \
                     missing and must be restored from the backup before the next start",
                );
            }
        }
        let msg = format!("Update check failed: {err}");
        log.error(&msg);
        self.persist("error trail", self.store.append_error(&msg, now_unix()));
        self.persist("status", self.store.set_status(&UpdateStatus::UpdateFailed));
        Phase::Done(CycleOutcome::Failed(err))
    }

    fn trigger_restart(&self, log: &UpdateLog) {
        log.info("Update successful! Triggering restart...");
        if let Err(err) = self.restarter.restart() {
            let msg = format!("failed to restart application: {err}");
            log.error(&msg);
            self.persist("error trail", self.store.append_error(&msg, now_unix()));
        }
    }

    fn persist(&self, field: &str, result: Result<(), StoreError>) {
        if let Err(err) = result {
            warn!(field, error = %err, "failed to persist update state");
        }
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

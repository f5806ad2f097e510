mod config;
mod http;
mod metrics;
mod monitor;
mod update;

use axum::serve;
use clap::Parser;
use config::Config;
use http::HttpAppState;
use metrics::Metrics;
use monitor::Monitor;
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use update::applier::HttpApplier;
use update::guard::RunGuard;
use update::release::GithubReleaseSource;
use update::restart::ReexecRestarter;
use update::scheduler::{CycleOutcome, UpdateScheduler, UpdateSettings};
use update::store::{JsonFileStore, UpdateStore};

#[derive(Parser, Debug)]
#[command(name = "panelkeeper")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long, conflicts_with = "no_auto_update")]
    auto_update: bool,
    #[arg(long, conflicts_with = "auto_update")]
    no_auto_update: bool,
    /// Process to sample; overrides monitor.pid from the config file.
    #[arg(long)]
    pid: Option<u32>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if let Err(err) = cfg.apply_env() {
        error!(error = %err, "invalid environment override");
        std::process::exit(1);
    }
    if cli.auto_update {
        cfg.updater.auto_update = true;
    } else if cli.no_auto_update {
        cfg.updater.auto_update = false;
    }
    if let Some(pid) = cli.pid {
        cfg.monitor.pid = Some(pid);
    }
    if let Err(err) = cfg.validate() {
        error!(error = %err, "invalid configuration after overrides");
        std::process::exit(1);
    }

    info!(
        listen = %cfg.listen,
        version = config::CURRENT_VERSION,
        auto_update = cfg.updater.auto_update,
        "starting panelkeeper"
    );

    let store: Arc<dyn UpdateStore> = match JsonFileStore::open(
        &cfg.updater.state_file,
        config::CURRENT_VERSION,
        now_unix(),
    ) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(error = %err, "failed to open update state");
            std::process::exit(1);
        }
    };
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialize metrics");
            std::process::exit(1);
        }
    };
    let client = match Client::builder()
        .user_agent(concat!("panelkeeper/", env!("CARGO_PKG_VERSION")))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, "failed to build HTTP client");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let source = GithubReleaseSource::new(
        client.clone(),
        &cfg.updater.api_base_url,
        &cfg.updater.repo,
        cfg.updater.metadata_timeout(),
    );
    info!(url = %source.url(), "release source configured");
    let paths = cfg.updater.executable_paths();
    let restarter = ReexecRestarter::new(paths.canonical.clone(), shutdown_tx.clone());
    let applier = HttpApplier::new(client, paths, cfg.updater.download_timeout());
    let guard = RunGuard::new();
    let scheduler = Arc::new(
        UpdateScheduler::new(
            UpdateSettings {
                auto_update: cfg.updater.auto_update,
                current_version: config::CURRENT_VERSION.to_string(),
                log_dir: cfg.updater.log_dir.clone(),
            },
            Arc::new(source),
            Arc::new(applier),
            store.clone(),
            Arc::new(restarter),
            guard.clone(),
        )
        .with_metrics(metrics.clone()),
    );

    match scheduler.check_now().await {
        Ok(CycleOutcome::Applied { tag }) => {
            info!(%tag, "update applied at startup, handing over to the new process");
            return;
        }
        Ok(CycleOutcome::Failed(err)) => error!(error = %err, "startup update check failed"),
        Ok(outcome) => info!(outcome = outcome.label(), "startup update check finished"),
        Err(err) => error!(error = %err, "startup update check skipped"),
    }

    let monitor = match cfg.monitor.pid {
        Some(pid) => match Monitor::attach(pid) {
            Ok(monitor) => {
                let monitor = Arc::new(monitor);
                info!(pid = monitor.pid(), "process monitor attached");
                monitor.start(Duration::from_secs(cfg.monitor.interval_secs));
                Some(monitor)
            }
            Err(err) => {
                error!(error = %err, "failed to attach process monitor");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let http_task = {
        let listen = cfg.listen.clone();
        let state = HttpAppState {
            metrics: metrics.clone(),
            store: store.clone(),
            guard,
            monitor: monitor.clone(),
        };
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(state);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to bind HTTP server");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let checker_task = scheduler
        .clone()
        .spawn_background(cfg.updater.check_interval(), shutdown_rx.clone());

    let mut restart_rx = shutdown_rx;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                error!(error = %err, "failed to wait for Ctrl+C");
            }
            info!("received Ctrl+C, shutting down");
        }
        _ = restart_rx.changed() => {
            info!("new process started, shutting down");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(monitor) = &monitor {
        monitor.stop();
    }

    let _ = checker_task.await;
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

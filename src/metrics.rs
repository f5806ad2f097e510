use crate::monitor::Snapshot;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub panelkeeper_update_checks_total: CounterVec,
    pub panelkeeper_process_running: Gauge,
    pub panelkeeper_process_cpu_percent: Gauge,
    pub panelkeeper_process_rss_bytes: Gauge,
    pub panelkeeper_process_vms_bytes: Gauge,
    pub panelkeeper_process_threads: Gauge,
    pub panelkeeper_process_last_sample_timestamp_seconds: Gauge,
    pub panelkeeper_uptime_seconds: Gauge,
    pub panelkeeper_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let panelkeeper_update_checks_total = CounterVec::new(
            opts!(
                "panelkeeper_update_checks_total",
                "Update check cycles by outcome"
            ),
            &["outcome"],
        )?;
        let panelkeeper_process_running = Gauge::with_opts(opts!(
            "panelkeeper_process_running",
            "1 if the monitored process was running at the last sample"
        ))?;
        let panelkeeper_process_cpu_percent = Gauge::with_opts(opts!(
            "panelkeeper_process_cpu_percent",
            "CPU usage of the monitored process in percent, may exceed 100"
        ))?;
        let panelkeeper_process_rss_bytes = Gauge::with_opts(opts!(
            "panelkeeper_process_rss_bytes",
            "Resident memory of the monitored process in bytes"
        ))?;
        let panelkeeper_process_vms_bytes = Gauge::with_opts(opts!(
            "panelkeeper_process_vms_bytes",
            "Virtual memory of the monitored process in bytes"
        ))?;
        let panelkeeper_process_threads = Gauge::with_opts(opts!(
            "panelkeeper_process_threads",
            "Thread count of the monitored process"
        ))?;
        let panelkeeper_process_last_sample_timestamp_seconds = Gauge::with_opts(opts!(
            "panelkeeper_process_last_sample_timestamp_seconds",
            "Unix timestamp of the last process sample"
        ))?;
        let panelkeeper_uptime_seconds =
            Gauge::with_opts(opts!("panelkeeper_uptime_seconds", "Uptime in seconds"))?;
        let panelkeeper_scrape_count_total = Counter::with_opts(opts!(
            "panelkeeper_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &panelkeeper_update_checks_total)?;
        register(&registry, &panelkeeper_process_running)?;
        register(&registry, &panelkeeper_process_cpu_percent)?;
        register(&registry, &panelkeeper_process_rss_bytes)?;
        register(&registry, &panelkeeper_process_vms_bytes)?;
        register(&registry, &panelkeeper_process_threads)?;
        register(&registry, &panelkeeper_process_last_sample_timestamp_seconds)?;
        register(&registry, &panelkeeper_uptime_seconds)?;
        register(&registry, &panelkeeper_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            panelkeeper_update_checks_total,
            panelkeeper_process_running,
            panelkeeper_process_cpu_percent,
            panelkeeper_process_rss_bytes,
            panelkeeper_process_vms_bytes,
            panelkeeper_process_threads,
            panelkeeper_process_last_sample_timestamp_seconds,
            panelkeeper_uptime_seconds,
            panelkeeper_scrape_count_total,
        }))
    }

    pub fn update_from_snapshot(&self, snapshot: &Snapshot) {
        self.panelkeeper_process_running.set(if snapshot.running { 1.0 } else { 0.0 });
        self.panelkeeper_process_cpu_percent.set(snapshot.cpu_percent);
        self.panelkeeper_process_rss_bytes.set(snapshot.rss_bytes as f64);
        self.panelkeeper_process_vms_bytes.set(snapshot.vms_bytes as f64);
        self.panelkeeper_process_threads.set(snapshot.threads as f64);
        self.panelkeeper_process_last_sample_timestamp_seconds
            .set((snapshot.at_unix_ms / 1000) as f64);
    }

    pub fn refresh_uptime(&self) {
        let uptime = now_unix().saturating_sub(self.started_at_unix) as f64;
        self.panelkeeper_uptime_seconds.set(uptime);
    }

    pub fn inc_update_check(&self, outcome: &str) {
        self.panelkeeper_update_checks_total.with_label_values(&[outcome]).inc();
    }

    pub fn inc_scrape_count(&self) {
        self.panelkeeper_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

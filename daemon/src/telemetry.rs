//! Telemetry module for logging and metrics collection
//!
//! This module provides:
//! - Structured logging with pretty console and JSON file formatters
//! - Rolling log files through a non-blocking writer
//! - Prometheus metrics for task runs, remote mutations and host events

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use o365_sync::ReconcileMetrics;
use prometheus::{HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tracing::{error, info};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};
use uuid::Uuid;

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Enable console logging
    pub console_logging: bool,
    /// Write JSON lines to `log_file_path`
    pub json_logging: bool,
    /// Local log file path
    pub log_file_path: Option<PathBuf>,
    /// Log file rotation settings
    pub log_rotation: LogRotationConfig,
    /// Metrics settings
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRotationConfig {
    /// Enable log rotation
    pub enabled: bool,
    /// Rotation frequency (daily, hourly, never)
    pub frequency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics
    pub enabled: bool,
    /// Metrics server bind address
    pub bind_address: String,
    /// Metrics server port
    pub port: u16,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            console_logging: true,
            json_logging: true,
            log_file_path: Some(PathBuf::from("logs/o365-sync.log")),
            log_rotation: LogRotationConfig {
                enabled: true,
                frequency: "daily".to_string(),
            },
            metrics: MetricsConfig {
                enabled: true,
                bind_address: "127.0.0.1".to_string(),
                port: 9090,
            },
        }
    }
}

pub const ROTATION_FREQUENCIES: [&str; 3] = ["daily", "hourly", "never"];

/// Prometheus metrics registry and collectors
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: Registry,

    // Task metrics
    pub task_runs_total: IntCounterVec,
    pub task_duration: HistogramVec,
    pub task_requeues_total: IntCounterVec,
    pub task_items_skipped: IntCounterVec,

    // Remote side effects
    pub remote_mutations_total: IntCounterVec,
    pub item_errors_total: IntCounterVec,

    // Intake
    pub host_events_total: IntCounterVec,

    // Daemon health
    pub daemon_uptime_seconds: IntGauge,
    pub pending_requeues: IntGauge,
}

impl DaemonMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let task_runs_total = IntCounterVec::new(
            Opts::new("o365_sync_task_runs_total", "Total number of task executions"),
            &["task", "status"],
        )?;

        let task_duration = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "o365_sync_task_duration_seconds",
                "Duration of task executions in seconds",
            ),
            &["task"],
        )?;

        let task_requeues_total = IntCounterVec::new(
            Opts::new("o365_sync_task_requeues_total", "Failed executions put back on the queue"),
            &["task"],
        )?;

        let task_items_skipped = IntCounterVec::new(
            Opts::new("o365_sync_items_skipped_total", "Items with nothing to do or missing prerequisites"),
            &["task"],
        )?;

        let remote_mutations_total = IntCounterVec::new(
            Opts::new("o365_sync_remote_mutations_total", "Mutations applied to the remote directory"),
            &["task", "mutation"],
        )?;

        let item_errors_total = IntCounterVec::new(
            Opts::new("o365_sync_item_errors_total", "Item-level failures that did not abort a run"),
            &["task"],
        )?;

        let host_events_total = IntCounterVec::new(
            Opts::new("o365_sync_host_events_total", "Host events received"),
            &["kind", "status"],
        )?;

        let daemon_uptime_seconds = IntGauge::new(
            "o365_sync_daemon_uptime_seconds",
            "Daemon uptime in seconds",
        )?;

        let pending_requeues = IntGauge::new(
            "o365_sync_pending_requeues",
            "Failed requests waiting out their backoff",
        )?;

        registry.register(Box::new(task_runs_total.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(task_requeues_total.clone()))?;
        registry.register(Box::new(task_items_skipped.clone()))?;
        registry.register(Box::new(remote_mutations_total.clone()))?;
        registry.register(Box::new(item_errors_total.clone()))?;
        registry.register(Box::new(host_events_total.clone()))?;
        registry.register(Box::new(daemon_uptime_seconds.clone()))?;
        registry.register(Box::new(pending_requeues.clone()))?;

        Ok(Self {
            registry,
            task_runs_total,
            task_duration,
            task_requeues_total,
            task_items_skipped,
            remote_mutations_total,
            item_errors_total,
            host_events_total,
            daemon_uptime_seconds,
            pending_requeues,
        })
    }

    /// Fold one successful run summary into the counters
    pub fn record_run(&self, task: &str, run: &ReconcileMetrics) {
        self.task_runs_total.with_label_values(&[task, "success"]).inc();
        self.task_duration
            .with_label_values(&[task])
            .observe(run.duration.as_secs_f64());
        self.task_items_skipped
            .with_label_values(&[task])
            .inc_by(run.skipped as u64);
        self.item_errors_total
            .with_label_values(&[task])
            .inc_by(run.errors.total_errors as u64);
        for (mutation, count) in &run.mutations {
            self.remote_mutations_total
                .with_label_values(&[task, mutation.as_str()])
                .inc_by(*count as u64);
        }
    }

    pub fn record_failure(&self, task: &str, elapsed: Duration) {
        self.task_runs_total.with_label_values(&[task, "failure"]).inc();
        self.task_duration
            .with_label_values(&[task])
            .observe(elapsed.as_secs_f64());
    }

    /// Render the registry in the Prometheus text format
    pub fn encode(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Telemetry system for the daemon
pub struct TelemetrySystem {
    config: TelemetryConfig,
    metrics: DaemonMetrics,
    _file_guard: Option<WorkerGuard>,
    daemon_id: String,
    start_time: SystemTime,
}

impl TelemetrySystem {
    pub fn new(config: TelemetryConfig) -> Result<Self> {
        Ok(Self {
            config,
            metrics: DaemonMetrics::new()?,
            _file_guard: None,
            daemon_id: Uuid::new_v4().to_string(),
            start_time: SystemTime::now(),
        })
    }

    /// Install the global subscriber; fails when one is already installed
    pub fn initialize_logging(&mut self) -> Result<()> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directives(&self.config.log_level)));

        let console_layer = if self.config.console_logging {
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .pretty(),
            )
        } else {
            None
        };

        let (file_layer, guard) = match (&self.config.log_file_path, self.config.json_logging) {
            (Some(log_path), true) => {
                let directory = log_path.parent().unwrap_or_else(|| Path::new("."));
                std::fs::create_dir_all(directory)?;
                let file_name = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("o365-sync.log"));

                let frequency = if self.config.log_rotation.enabled {
                    self.config.log_rotation.frequency.as_str()
                } else {
                    "never"
                };
                let file_appender = match frequency {
                    "daily" => rolling::daily(directory, file_name),
                    "hourly" => rolling::hourly(directory, file_name),
                    _ => rolling::never(directory, file_name),
                };

                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                let layer = fmt::layer()
                    .with_writer(non_blocking)
                    .json()
                    .with_current_span(true)
                    .with_span_list(true);
                (Some(layer), Some(guard))
            }
            _ => (None, None),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()?;
        self._file_guard = guard;

        info!(daemon_id = %self.daemon_id, "Telemetry system initialized");
        Ok(())
    }

    /// Keep the uptime gauge current
    pub fn start_background_tasks(&self) -> tokio::task::JoinHandle<()> {
        let uptime_gauge = self.metrics.daemon_uptime_seconds.clone();
        let start_time = self.start_time;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(15));
            loop {
                interval.tick().await;
                if let Ok(duration) = start_time.elapsed() {
                    uptime_gauge.set(duration.as_secs() as i64);
                }
            }
        })
    }

    pub fn create_metrics_server(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(self.metrics.clone())
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn metrics(&self) -> &DaemonMetrics {
        &self.metrics
    }

    pub fn daemon_id(&self) -> &str {
        &self.daemon_id
    }
}

/// Fallback logging for one-shot commands
pub fn init_basic_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(log_level)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()?;
    Ok(())
}

fn default_directives(log_level: &str) -> String {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    format!(
        "o365_sync_daemon={level},o365_sync={level},o365_sync_core={level},tower_http=info"
    )
}

async fn metrics_handler(State(metrics): State<DaemonMetrics>) -> Response {
    match metrics.encode() {
        Ok(output) => (StatusCode::OK, output).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

use std::{env, net::SocketAddr, sync::Arc};

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::hydrate_env_file;

static SUBSCRIBER_INSTALLED: OnceCell<()> = OnceCell::new();
static METRICS_HANDLE: OnceCell<Arc<PrometheusHandle>> = OnceCell::new();

/// Logging and metrics options for one process, read from
/// `<PREFIX>_LOG_FILTER` and `<PREFIX>_METRICS_ADDRESS`.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    service: String,
    log_filter: String,
    metrics_address: Option<String>,
}

impl TelemetryConfig {
    pub const DEFAULT_LOG_FILTER: &'static str = "info";

    pub fn from_env(prefix: &str) -> Self {
        let _ = hydrate_env_file();
        let service = prefix.trim().to_ascii_uppercase();
        let read = |suffix: &str| {
            env::var(format!("{service}_{suffix}"))
                .ok()
                .filter(|value| !value.trim().is_empty())
        };

        Self {
            log_filter: read("LOG_FILTER").unwrap_or_else(|| Self::DEFAULT_LOG_FILTER.to_string()),
            metrics_address: read("METRICS_ADDRESS"),
            service,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    pub fn metrics_address(&self) -> Option<&str> {
        self.metrics_address.as_deref()
    }
}

/// Handle to the process-wide Prometheus recorder.
#[derive(Clone)]
pub struct TelemetryGuard {
    metrics: Arc<PrometheusHandle>,
}

impl TelemetryGuard {
    pub fn render_metrics(&self) -> String {
        self.metrics.render()
    }
}

/// Installs the tracing subscriber and the Prometheus recorder. Later calls
/// reuse whatever the first call installed.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let fresh = install_tracing(config)?;
    let metrics = install_metrics(config)?;
    if fresh {
        info!(
            service = config.service(),
            metrics_address = config.metrics_address(),
            "telemetry ready"
        );
    }
    Ok(TelemetryGuard { metrics })
}

fn install_tracing(config: &TelemetryConfig) -> Result<bool, TelemetryError> {
    if SUBSCRIBER_INSTALLED.get().is_some() {
        return Ok(false);
    }
    let env_filter = EnvFilter::try_new(config.log_filter())
        .map_err(|err| TelemetryError::InvalidLogFilter(err.to_string()))?;
    if SUBSCRIBER_INSTALLED.set(()).is_err() {
        return Ok(false);
    }
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .map_err(|err| TelemetryError::Tracing(err.to_string()))?;
    Ok(true)
}

fn install_metrics(config: &TelemetryConfig) -> Result<Arc<PrometheusHandle>, TelemetryError> {
    METRICS_HANDLE
        .get_or_try_init(|| {
            let mut builder = PrometheusBuilder::new();
            if let Some(raw) = config.metrics_address() {
                let address = raw.parse::<SocketAddr>().map_err(|err| {
                    TelemetryError::InvalidMetricsAddress(raw.to_string(), err.to_string())
                })?;
                builder = builder.with_http_listener(address);
            }
            let handle = builder
                .install_recorder()
                .map_err(|err| TelemetryError::Metrics(err.to_string()))?;
            describe_metrics();
            Ok(Arc::new(handle))
        })
        .cloned()
}

fn describe_metrics() {
    describe_counter!("ledger_reservations_total", "Balance reservations by result.");
    describe_counter!("ledger_refunded_credits_total", Unit::Count, "Credits given back.");
    describe_counter!("ledger_credited_total", Unit::Count, "Credits added by payments or operators.");
    describe_counter!("ledger_tasks_finalized_total", "Tasks moved to a terminal status.");
    describe_counter!("ledger_payments_total", "Payment state transitions.");
    describe_counter!("orchestrator_requests_total", "Generation requests by kind and outcome.");
    describe_counter!("orchestrator_subjobs_total", "Remote sub-jobs by result.");
    describe_counter!("orchestrator_settle_retries_total", "Retried ledger writes by step.");
    describe_histogram!("orchestrator_request_seconds", Unit::Seconds, "End-to-end request latency.");
    describe_counter!("reconciler_payments_total", "Payment observations by result.");
    describe_gauge!("reconciler_active_watchers", "Payment watchers currently polling.");
    describe_counter!("gateway_requests_total", "Gateway requests by route and status.");
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    InvalidLogFilter(String),
    #[error("failed to install tracing subscriber: {0}")]
    Tracing(String),
    #[error("invalid metrics address `{0}`: {1}")]
    InvalidMetricsAddress(String, String),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}

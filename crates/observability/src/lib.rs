use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global tracing subscriber: EnvFilter (RUST_LOG wins) with a
/// per-service default, writing through a non-blocking stdout appender.
/// Keep the returned guard alive for the lifetime of the process.
pub fn init_tracing(service_name: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}=info,polybook=info,info")));

    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_target(true)
        .try_init();

    Some(guard)
}

/// Install the process-wide Prometheus recorder once; later callers get the
/// same handle back.
pub fn init_metrics() -> PrometheusHandle {
    if let Some(handle) = PROM_HANDLE.get() {
        return handle.clone();
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("install prometheus recorder");

    let _ = PROM_HANDLE.set(handle.clone());
    handle
}

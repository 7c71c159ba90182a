use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs the global Prometheus recorder. Called once at startup; every
/// `metrics` macro in the workspace feeds into the returned handle.
pub(crate) fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}

/// Router exposing the scrape endpoint on the metrics listener.
pub(crate) fn router(handle: PrometheusHandle) -> Router {
    Router::new().route("/metrics", get(move || std::future::ready(handle.render())))
}

pub(crate) fn record_request(kubectl_version: String) {
    metrics::counter!("azad_proxy_requests_total", "kubectl_version" => kubectl_version).increment(1);
}

pub(crate) fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };

    metrics::counter!("azad_proxy_user_cache_total", "result" => result).increment(1);
}

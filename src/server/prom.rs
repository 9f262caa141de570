use std::sync::OnceLock;

use axum::extract::Extension;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

use crate::config::Config;

/// Get a handle to the metrics recorder, initializing it as needed.
///
/// The config of the first call determines the recorder's global labels.
pub fn get_metrics_recorder(config: &Config) -> &'static PrometheusRecorder {
    static RECORDER: OnceLock<PrometheusRecorder> = OnceLock::new();
    RECORDER.get_or_init(|| PrometheusBuilder::new().add_global_label("node", config.node_id.clone()).build())
}

/// Handle Prometheus metrics scraping.
pub(super) async fn prometheus_scrape(Extension(state): Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, state.render())
}

//! Prometheus metrics wiring.

use axum::extract::State;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::state::AppState;

/// Install the global recorder and return the render handle. Called once
/// at startup, before any component records a metric.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("metrics recorder already installed");

    // Pre-register the gauges the dashboards expect even at zero load.
    metrics::gauge!("calls_active").set(0.0);
    metrics::counter!("events_dropped_total").increment(0);
    metrics::counter!("session_interims_dropped_total").increment(0);
    metrics::counter!("tc_ws_reconnects_total").increment(0);

    handle
}

pub async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render()
}

//! Optional Prometheus metrics exporter, mounted behind an env flag.
//!
//! Grounded in the reference server's `metrics.rs`: a `PrometheusHandle`
//! installed once at startup, describing the domain counters this system
//! actually emits, exposed at `/metrics` only when the operator opts in.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");

        metrics::describe_counter!("messages_processed_total", "Messages written through the outbox store");
        metrics::describe_counter!("outbox_rows_dispatched_total", "Outbox rows published to the downstream broker");
        metrics::describe_counter!("fanout_slow_consumer_evictions_total", "Subscribers evicted for missing the fan-out deadline");
        metrics::describe_counter!("history_cache_hits_total", "HistoryReader page requests served from cache");
        metrics::describe_counter!("history_cache_misses_total", "HistoryReader page requests that fell through to the store");

        Self { handle }
    }

    pub fn handle(&self) -> PrometheusHandle {
        self.handle.clone()
    }

    /// Whether the operator opted into mounting `/metrics` (`METRICS_ENABLED=1`).
    pub fn enabled_by_env() -> bool {
        std::env::var("METRICS_ENABLED").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (StatusCode::OK, handle.render())
}

//! Prometheus metrics HTTP server.
//!
//! Exposes the aggregate counters (spots by mode/source, dedup, broadcast
//! drops, CTY lookups) in Prometheus text format.

use std::net::SocketAddr;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use tokio::net::TcpListener;
use tracing::info;

use crate::cty::CtyDatabase;
use crate::dedup::DedupStats;
use crate::pipeline::PipelineStats;
use crate::server::BroadcastStats;
use crate::stats::Tracker;

/// Everything the metrics endpoint reports on.
pub struct MetricsState {
    pub tracker: Arc<Tracker>,
    pub dedup: Option<Arc<DedupStats>>,
    pub broadcast: Option<Arc<BroadcastStats>>,
    pub pipeline: Option<Arc<PipelineStats>>,
    pub cty: Option<Arc<CtyDatabase>>,
}

/// Start the metrics HTTP server; serves `/metrics` and `/health`.
pub async fn start_metrics_server(
    port: u16,
    state: Arc<MetricsState>,
) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!("metrics server listening on http://{addr}/metrics");
    axum::serve(listener, app)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn metrics_handler(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        format_prometheus_metrics(&state),
    )
}

fn format_prometheus_metrics(state: &MetricsState) -> String {
    let summary = state.tracker.summary();
    let mut out = String::with_capacity(4096);

    out.push_str("# HELP dxhub_uptime_seconds Time since the server started\n");
    out.push_str("# TYPE dxhub_uptime_seconds gauge\n");
    out.push_str(&format!("dxhub_uptime_seconds {:.3}\n", summary.uptime_secs));

    out.push_str("# HELP dxhub_spots_total Spots processed, by mode\n");
    out.push_str("# TYPE dxhub_spots_total counter\n");
    for (mode, count) in &summary.by_mode {
        out.push_str(&format!("dxhub_spots_total{{mode=\"{mode}\"}} {count}\n"));
    }
    if summary.by_mode.is_empty() {
        out.push_str(&format!("dxhub_spots_total {}\n", summary.total));
    }

    out.push_str("# HELP dxhub_spots_by_source_total Spots processed, by source node\n");
    out.push_str("# TYPE dxhub_spots_by_source_total counter\n");
    for (source, count) in &summary.by_source {
        out.push_str(&format!(
            "dxhub_spots_by_source_total{{source=\"{source}\"}} {count}\n"
        ));
    }

    if let Some(dedup) = &state.dedup {
        let (processed, duplicates, cache_size) = dedup.snapshot();
        out.push_str("# HELP dxhub_dedup_processed_total Spots through the dedup engine\n");
        out.push_str("# TYPE dxhub_dedup_processed_total counter\n");
        out.push_str(&format!("dxhub_dedup_processed_total {processed}\n"));
        out.push_str("# HELP dxhub_dedup_duplicates_total Duplicate spots suppressed\n");
        out.push_str("# TYPE dxhub_dedup_duplicates_total counter\n");
        out.push_str(&format!("dxhub_dedup_duplicates_total {duplicates}\n"));
        out.push_str("# HELP dxhub_dedup_cache_size Current dedup cache entries\n");
        out.push_str("# TYPE dxhub_dedup_cache_size gauge\n");
        out.push_str(&format!("dxhub_dedup_cache_size {cache_size}\n"));
    }

    if let Some(broadcast) = &state.broadcast {
        let (queue_drops, client_drops) = broadcast.snapshot();
        out.push_str("# HELP dxhub_broadcast_queue_drops_total Spots dropped at worker queues\n");
        out.push_str("# TYPE dxhub_broadcast_queue_drops_total counter\n");
        out.push_str(&format!("dxhub_broadcast_queue_drops_total {queue_drops}\n"));
        out.push_str("# HELP dxhub_broadcast_client_drops_total Lines dropped at session queues\n");
        out.push_str("# TYPE dxhub_broadcast_client_drops_total counter\n");
        out.push_str(&format!("dxhub_broadcast_client_drops_total {client_drops}\n"));
    }

    if let Some(pipeline) = &state.pipeline {
        let pairs = [
            ("dxhub_pipeline_stale_drops_total", &pipeline.stale_drops),
            ("dxhub_pipeline_secondary_dupes_total", &pipeline.secondary_dupes),
            ("dxhub_pipeline_harmonic_drops_total", &pipeline.harmonic_drops),
            ("dxhub_pipeline_frequency_rewrites_total", &pipeline.frequency_rewrites),
            ("dxhub_pipeline_emitted_total", &pipeline.emitted),
        ];
        for (name, counter) in pairs {
            out.push_str(&format!("# TYPE {name} counter\n"));
            out.push_str(&format!("{name} {}\n", counter.load(Relaxed)));
        }
    }

    if let Some(cty) = &state.cty {
        let m = cty.metrics();
        out.push_str("# HELP dxhub_cty_lookups_total CTY prefix lookups\n");
        out.push_str("# TYPE dxhub_cty_lookups_total counter\n");
        out.push_str(&format!("dxhub_cty_lookups_total {}\n", m.total_lookups));
        out.push_str("# TYPE dxhub_cty_cache_hits_total counter\n");
        out.push_str(&format!("dxhub_cty_cache_hits_total {}\n", m.cache_hits));
        out.push_str("# TYPE dxhub_cty_validated_total counter\n");
        out.push_str(&format!("dxhub_cty_validated_total {}\n", m.validated));
    }

    if let Some(ref p) = summary.report_percentiles {
        out.push_str("# HELP dxhub_report_db Signal report distribution in dB\n");
        out.push_str("# TYPE dxhub_report_db summary\n");
        out.push_str(&format!("dxhub_report_db{{quantile=\"0.5\"}} {}\n", p.p50));
        out.push_str(&format!("dxhub_report_db{{quantile=\"0.9\"}} {}\n", p.p90));
        out.push_str(&format!("dxhub_report_db{{quantile=\"0.99\"}} {}\n", p.p99));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spot::{SourceType, Spot};

    fn state_with_data() -> MetricsState {
        let tracker = Arc::new(Tracker::new());
        let mut spot = Spot::new("K1ABC", "W3LPL-#", 14025.0, "CW");
        spot.source = SourceType::Rbn;
        spot.source_node = "RBN".to_string();
        spot.report = 19;
        spot.has_report = true;
        tracker.record(&spot);
        MetricsState {
            tracker,
            dedup: Some(Arc::new(DedupStats::default())),
            broadcast: Some(Arc::new(BroadcastStats::default())),
            pipeline: Some(Arc::new(PipelineStats::default())),
            cty: None,
        }
    }

    #[test]
    fn test_format_includes_core_metrics() {
        let output = format_prometheus_metrics(&state_with_data());
        assert!(output.contains("dxhub_uptime_seconds"));
        assert!(output.contains("dxhub_spots_total{mode=\"CW\"} 1"));
        assert!(output.contains("dxhub_spots_by_source_total{source=\"RBN\"} 1"));
        assert!(output.contains("dxhub_dedup_processed_total 0"));
        assert!(output.contains("dxhub_broadcast_queue_drops_total 0"));
        assert!(output.contains("dxhub_pipeline_emitted_total 0"));
    }

    #[test]
    fn test_format_is_valid_prometheus_text() {
        let output = format_prometheus_metrics(&state_with_data());
        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            assert!(parts.len() >= 2, "invalid metric line: {line}");
        }
    }
}

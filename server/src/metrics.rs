//! # Prometheus Metrics
//!
//! Operational metrics for the roster server, scraped at `/metrics` on the
//! metrics port. Everything is registered in a dedicated registry with the
//! `roster` prefix.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// All metric handles for the server. Prometheus handles are internally
/// reference-counted, so cloning is cheap.
#[derive(Clone)]
pub struct ServerMetrics {
    registry: Registry,
    /// Record signatures produced (creates plus email changes).
    pub signatures_issued_total: IntCounter,
    /// Export requests served.
    pub exports_total: IntCounter,
    /// Records in the most recent export.
    pub exported_records: IntGauge,
    /// Size of export payloads in bytes.
    pub export_size_bytes: Histogram,
    /// Users currently stored.
    pub users_total: IntGauge,
}

impl ServerMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("roster".into()), None)?;

        let signatures_issued_total = IntCounter::new(
            "signatures_issued_total",
            "Total number of record signatures issued",
        )?;
        registry.register(Box::new(signatures_issued_total.clone()))?;

        let exports_total = IntCounter::new("exports_total", "Total number of exports served")?;
        registry.register(Box::new(exports_total.clone()))?;

        let exported_records =
            IntGauge::new("exported_records", "Number of records in the latest export")?;
        registry.register(Box::new(exported_records.clone()))?;

        let export_size_bytes = Histogram::with_opts(
            HistogramOpts::new("export_size_bytes", "Size of encoded export payloads in bytes")
                .buckets(prometheus::exponential_buckets(256.0, 4.0, 8)?),
        )?;
        registry.register(Box::new(export_size_bytes.clone()))?;

        let users_total = IntGauge::new("users_total", "Number of users currently stored")?;
        registry.register(Box::new(users_total.clone()))?;

        Ok(Self {
            registry,
            signatures_issued_total,
            exports_total,
            exported_records,
            export_size_bytes,
            users_total,
        })
    }

    /// Encodes all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<ServerMetrics>;

/// Renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

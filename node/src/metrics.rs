//! # Prometheus Metrics
//!
//! Operational metrics for the daemon, scraped at `/metrics`. Everything is
//! registered in a dedicated [`prometheus::Registry`] under the `walletd`
//! prefix.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use walletd_engine::lock::UnlockSummary;

/// Metric handles shared by the unlock loop and the HTTP handler.
#[derive(Clone)]
pub struct WalletdMetrics {
    registry: Registry,
    /// Completed timelock unlock passes.
    pub unlock_runs_total: IntCounter,
    /// UTXOs moved from locked to unlocked.
    pub utxos_unlocked_total: IntCounter,
    /// Unlock passes that returned an error.
    pub unlock_failures_total: IntCounter,
    /// Height of the best stored block, `-1` on an empty chain.
    pub best_height: IntGauge,
    pub unlock_latency_seconds: Histogram,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).expect("metric creation");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric registration");
    metric
}

impl WalletdMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("walletd".into()), None)
            .expect("failed to create prometheus registry");

        let unlock_runs_total = counter(&registry, "unlock_runs_total", "Completed timelock unlock passes");
        let utxos_unlocked_total =
            counter(&registry, "utxos_unlocked_total", "UTXOs moved from locked to unlocked");
        let unlock_failures_total =
            counter(&registry, "unlock_failures_total", "Unlock passes that returned an error");

        let best_height = IntGauge::new("best_height", "Height of the best stored block")
            .expect("metric creation");
        registry
            .register(Box::new(best_height.clone()))
            .expect("metric registration");

        let unlock_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("unlock_latency_seconds", "Duration of a timelock unlock pass")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .expect("metric creation");
        registry
            .register(Box::new(unlock_latency_seconds.clone()))
            .expect("metric registration");

        Self {
            registry,
            unlock_runs_total,
            utxos_unlocked_total,
            unlock_failures_total,
            best_height,
            unlock_latency_seconds,
        }
    }

    pub fn record_unlock(&self, summary: &UnlockSummary) {
        self.unlock_runs_total.inc();
        self.utxos_unlocked_total.inc_by(summary.utxos as u64);
    }

    pub fn set_best_height(&self, height: Option<u32>) {
        self.best_height.set(height.map_or(-1, i64::from));
    }

    /// Encodes all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus output is valid utf-8"))
    }
}

pub type SharedMetrics = Arc<WalletdMetrics>;

/// Renders `/metrics`.
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
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

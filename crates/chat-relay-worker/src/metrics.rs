use chat_relay_core::WorkStatus;
use chat_relay_persistence::QueueStats;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use tracing::info;

/// Prometheus metrics for the relay
pub struct RelayMetrics {
    pub registry: Registry,

    // Ingestion
    pub updates_ingested: IntCounter,
    pub updates_duplicate: IntCounter,

    // Dispatch
    pub items_claimed: IntCounter,
    pub items_finished: IntCounterVec,
    pub items_reclaimed: IntCounter,
    pub handler_duration: Histogram,

    // Retrier
    pub retries_exhausted: IntCounterVec,

    // Queue depth by status
    pub queue_depth: IntGaugeVec,
}

impl RelayMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let updates_ingested = IntCounter::new("cr_updates_ingested_total", "Updates enqueued from the source")?;
        registry.register(Box::new(updates_ingested.clone()))?;

        let updates_duplicate = IntCounter::new(
            "cr_updates_duplicate_total",
            "Updates skipped because their sequence was already enqueued",
        )?;
        registry.register(Box::new(updates_duplicate.clone()))?;

        let items_claimed = IntCounter::new("cr_items_claimed_total", "Work items claimed by the dispatcher")?;
        registry.register(Box::new(items_claimed.clone()))?;

        let items_finished = IntCounterVec::new(
            Opts::new("cr_items_finished_total", "Work items reaching a terminal status"),
            &["status"],
        )?;
        registry.register(Box::new(items_finished.clone()))?;

        let items_reclaimed = IntCounter::new(
            "cr_items_reclaimed_total",
            "Processing items returned to pending after lease expiry",
        )?;
        registry.register(Box::new(items_reclaimed.clone()))?;

        let handler_duration = Histogram::with_opts(HistogramOpts::new(
            "cr_handler_duration_seconds",
            "Time spent in the work handler",
        ))?;
        registry.register(Box::new(handler_duration.clone()))?;

        let retries_exhausted = IntCounterVec::new(
            Opts::new("cr_retries_exhausted_total", "Operations abandoned after the retry budget ran out"),
            &["op"],
        )?;
        registry.register(Box::new(retries_exhausted.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("cr_queue_items", "Work items by status"),
            &["status"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(RelayMetrics {
            registry,
            updates_ingested,
            updates_duplicate,
            items_claimed,
            items_finished,
            items_reclaimed,
            handler_duration,
            retries_exhausted,
            queue_depth,
        })
    }

    pub fn inc_finished(&self, status: WorkStatus) {
        self.items_finished.with_label_values(&[status.as_str()]).inc();
    }

    pub fn inc_exhausted(&self, op: &str) {
        self.retries_exhausted.with_label_values(&[op]).inc();
    }

    /// Update queue depth gauges from a stats snapshot
    pub fn update_queue_depth(&self, stats: &QueueStats) {
        for status in WorkStatus::ALL {
            self.queue_depth
                .with_label_values(&[status.as_str()])
                .set(stats.count(status) as i64);
        }
    }

    /// Render in the Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Serve `GET /metrics` until the process exits
pub async fn serve(metrics: Arc<RelayMetrics>, port: u16) -> anyhow::Result<()> {
    use axum::{extract::State, http::StatusCode, routing::get, Router};

    async fn metrics_handler(State(metrics): State<Arc<RelayMetrics>>) -> Result<String, StatusCode> {
        metrics.render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let addr = format!("0.0.0.0:{}", port);
    info!("Metrics server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_depth_and_counters() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.updates_ingested.inc();
        metrics.inc_finished(WorkStatus::Error);
        metrics.update_queue_depth(&QueueStats {
            pending: 3,
            ..QueueStats::default()
        });

        let text = metrics.render().unwrap();
        assert!(text.contains("cr_updates_ingested_total 1"));
        assert!(text.contains("cr_items_finished_total{status=\"error\"} 1"));
        assert!(text.contains("cr_queue_items{status=\"pending\"} 3"));
    }
}

//! Prometheus metrics for the broker client
//!
//! Records through the `metrics` facade; nothing is exported until a
//! recorder is installed with [`init_metrics`].

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, BuildError>(handle)
    })?;
    Ok(())
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Record a dial attempt (`success`, `failure` or `fatal`).
pub(crate) fn record_dial(outcome: &'static str) {
    counter!("broker_dial_attempts_total", "outcome" => outcome).increment(1);
}

pub(crate) fn set_connection_ready(ready: bool) {
    gauge!("broker_connection_ready").set(if ready { 1.0 } else { 0.0 });
}

/// Per-queue metrics helper
#[derive(Debug, Clone)]
pub(crate) struct QueueMetrics {
    queue: String,
}

impl QueueMetrics {
    pub(crate) fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    /// Record a channel initialization attempt
    pub(crate) fn channel_init(&self, outcome: &'static str) {
        counter!(
            "broker_channel_inits_total",
            "queue" => self.queue.clone(),
            "outcome" => outcome
        )
        .increment(1);
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        gauge!("broker_queue_ready", "queue" => self.queue.clone()).set(if ready { 1.0 } else { 0.0 });
    }

    /// Record a publish attempt
    pub(crate) fn publish(&self, outcome: &'static str) {
        counter!(
            "broker_publish_total",
            "queue" => self.queue.clone(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// Record a confirmation verdict, with the round trip for acks
    pub(crate) fn confirmation(&self, outcome: &'static str, elapsed: Option<Duration>) {
        counter!(
            "broker_confirmations_total",
            "queue" => self.queue.clone(),
            "outcome" => outcome
        )
        .increment(1);

        if let Some(elapsed) = elapsed {
            histogram!("broker_publish_confirm_seconds", "queue" => self.queue.clone())
                .record(elapsed.as_secs_f64());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_without_recorder() {
        // Recording without a recorder is a no-op
        let metrics = QueueMetrics::new("orders");
        metrics.publish("success");
        metrics.confirmation("ack", Some(Duration::from_millis(5)));
        record_dial("failure");

        if prometheus_handle().is_none() {
            assert_eq!(render_metrics(), "");
        }
    }
}

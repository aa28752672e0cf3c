//! Prometheus metrics exposition
//!
//! The library crates emit through the `metrics` facade:
//!
//! - `poll_cycles_total` (counter): labels `stream`, `outcome`
//! - `poll_request_duration_seconds` (histogram): label `stream`
//! - `credential_pool_mints_total` (counter): label `result`
//! - `credential_pool_evictions_total` (counter)
//! - `credential_pool_healthy` (gauge)
//!
//! This module installs the recorder and adds the service-level series:
//!
//! - `auctions_stored_total` (counter): label `stream`
//! - `auctions_rejected_total` (counter): label `stream`
//! - `poll_stream_exits_total` (counter): labels `stream`, `reason`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Bucket boundaries for `poll_request_duration_seconds`, 5ms to 60s.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("poll_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Must run before any metric is emitted; earlier emissions go to the no-op
/// recorder and are lost.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record auction rows appended to the output file.
pub fn record_auctions_stored(stream: &str, count: usize) {
    metrics::counter!("auctions_stored_total", "stream" => stream.to_string())
        .increment(count as u64);
}

/// Record auction rows that failed normalization.
pub fn record_auctions_rejected(stream: &str, count: usize) {
    metrics::counter!("auctions_rejected_total", "stream" => stream.to_string())
        .increment(count as u64);
}

/// Record a polling stream ending, with why it stopped.
pub fn record_stream_exit(stream: &str, reason: &str) {
    metrics::counter!(
        "poll_stream_exits_total",
        "stream" => stream.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

#[cfg(test)]
pub(crate) fn isolated_recorder() -> (
    metrics_exporter_prometheus::PrometheusRecorder,
    PrometheusHandle,
) {
    let recorder = builder().build_recorder();
    let handle = recorder.handle();
    (recorder, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_auctions_stored("auctions", 3);
        record_auctions_rejected("auctions", 1);
        record_stream_exit("auctions", "cancelled");
    }

    #[test]
    fn service_counters_render_with_labels() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_auctions_stored("qb-gold", 4);
        record_auctions_stored("qb-gold", 2);
        record_auctions_rejected("qb-gold", 1);
        record_stream_exit("qb-gold", "circuit_open");

        let output = handle.render();
        assert!(
            output.contains("auctions_stored_total{stream=\"qb-gold\"} 6"),
            "stored counter must accumulate, got:\n{output}"
        );
        assert!(output.contains("auctions_rejected_total{stream=\"qb-gold\"} 1"));
        assert!(output.contains("poll_stream_exits_total"));
        assert!(output.contains("reason=\"circuit_open\""));
    }

    #[test]
    fn poll_duration_renders_as_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        metrics::histogram!("poll_request_duration_seconds", "stream" => "auctions")
            .record(0.042);

        let output = handle.render();
        assert!(
            output.contains("poll_request_duration_seconds_bucket"),
            "histogram must render _bucket lines, got:\n{output}"
        );
        assert!(output.contains("le=\"0.05\""));
    }
}

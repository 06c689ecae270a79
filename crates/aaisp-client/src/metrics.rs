//! Per-attempt call instrumentation.

use aaisp_common::metrics::{MetricsSink, SinkError};
use aaisp_common::types::{MetricDesc, Subsystem};
use prometheus::{CounterVec, GaugeVec, HistogramVec};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const API_REQUESTS_TOTAL: MetricDesc = MetricDesc::counter(
    "aaisp_api_requests_total",
    "Total API requests made to CHAOS API",
    &["subsystem", "command", "status_code"],
);

pub const API_REQUEST_DURATION: MetricDesc = MetricDesc::histogram(
    "aaisp_api_request_duration_seconds",
    "Duration of API requests to CHAOS API",
    &["subsystem", "command"],
);

pub const API_REQUESTS_IN_FLIGHT: MetricDesc = MetricDesc::gauge(
    "aaisp_api_requests_in_flight",
    "CHAOS API requests currently in flight",
    &[],
);

#[derive(Clone)]
pub(crate) struct CallMetrics {
    requests: CounterVec,
    duration: HistogramVec,
    in_flight_gauge: GaugeVec,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl CallMetrics {
    pub(crate) fn new(sink: &MetricsSink) -> Result<Self, SinkError> {
        Ok(Self {
            requests: sink.counter_vec(&API_REQUESTS_TOTAL)?,
            duration: sink.histogram_vec(&API_REQUEST_DURATION)?,
            in_flight_gauge: sink.gauge_vec(&API_REQUESTS_IN_FLIGHT)?,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Records one attempt. Failures are logged, never returned.
    pub(crate) fn record(&self, subsystem: Subsystem, command: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        match self
            .requests
            .get_metric_with_label_values(&[subsystem.as_str(), command, &status])
        {
            Ok(counter) => counter.inc(),
            Err(e) => tracing::warn!(error = %e, "failed to record request counter"),
        }
        match self
            .duration
            .get_metric_with_label_values(&[subsystem.as_str(), command])
        {
            Ok(histogram) => histogram.observe(elapsed.as_secs_f64()),
            Err(e) => tracing::warn!(error = %e, "failed to record request duration"),
        }
    }

    pub(crate) fn enter(&self) -> InFlight {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        self.publish(now);
        InFlight {
            metrics: self.clone(),
        }
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    pub(crate) fn current(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn publish(&self, value: usize) {
        if let Ok(gauge) = self.in_flight_gauge.get_metric_with_label_values(&[]) {
            gauge.set(value as f64);
        }
    }
}

/// Held for the duration of one admitted attempt.
pub(crate) struct InFlight {
    metrics: CallMetrics,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let now = self.metrics.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        self.metrics.publish(now);
    }
}

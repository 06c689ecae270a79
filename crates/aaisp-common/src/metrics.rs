//! Thread-safe store of the latest value per metric series.
//!
//! Collectors write [`Observation`]s; the HTTP exposition reads the text
//! encoding. Every series update is independently atomic (the `prometheus`
//! types use atomics internally); there is no cross-series transaction.
//!
//! A series that has never been written is absent from the output rather
//! than reported as zero.

use crate::types::{MetricDesc, MetricKind, Observation};
use prometheus::core::Collector;
use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

/// Buckets for request and cycle durations, in seconds.
pub const DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 900.0,
];

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("metric '{0}' has not been described")]
    UnknownMetric(String),

    #[error("metric '{name}' is a {declared}, observation is a {observed}")]
    KindMismatch {
        name: String,
        declared: MetricKind,
        observed: MetricKind,
    },

    #[error("metric '{name}' expects labels {expected:?}, got {got:?}")]
    LabelMismatch {
        name: String,
        expected: Vec<String>,
        got: Vec<String>,
    },

    #[error("metric '{name}' was already described with a different shape")]
    Conflict { name: String },

    #[error("metric '{name}' received a non-finite or negative counter value {value}")]
    InvalidValue { name: String, value: f64 },

    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("encoded metrics are not valid UTF-8")]
    Encoding,
}

pub type Result<T> = std::result::Result<T, SinkError>;

#[derive(Clone)]
enum Family {
    Gauge(GaugeVec),
    Counter(CounterVec),
    Histogram(HistogramVec),
}

struct Entry {
    desc: MetricDesc,
    family: Family,
}

/// Metrics registry shared by collectors, the client and the scheduler.
pub struct MetricsSink {
    registry: Registry,
    families: RwLock<HashMap<String, Entry>>,
    // Serialises the read-modify-write of cumulative counter updates.
    counter_guard: Mutex<()>,
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            families: RwLock::new(HashMap::new()),
            counter_guard: Mutex::new(()),
        }
    }

    /// Declares a metric family. Describing the same descriptor twice is a
    /// no-op; a different shape under an existing name is an error.
    pub fn describe(&self, desc: &MetricDesc) -> Result<()> {
        let mut families = self
            .families
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = families.get(desc.name) {
            if existing.desc.kind == desc.kind && existing.desc.labels == desc.labels {
                return Ok(());
            }
            return Err(SinkError::Conflict {
                name: desc.name.to_string(),
            });
        }

        let family = match desc.kind {
            MetricKind::Gauge => {
                let vec = GaugeVec::new(Opts::new(desc.name, desc.help), desc.labels)?;
                self.registry.register(Box::new(vec.clone()))?;
                Family::Gauge(vec)
            }
            MetricKind::Counter => {
                let vec = CounterVec::new(Opts::new(desc.name, desc.help), desc.labels)?;
                self.registry.register(Box::new(vec.clone()))?;
                Family::Counter(vec)
            }
            MetricKind::Histogram => {
                let opts = HistogramOpts::new(desc.name, desc.help).buckets(DURATION_BUCKETS.to_vec());
                let vec = HistogramVec::new(opts, desc.labels)?;
                self.registry.register(Box::new(vec.clone()))?;
                Family::Histogram(vec)
            }
        };

        families.insert(
            desc.name.to_string(),
            Entry {
                desc: *desc,
                family,
            },
        );
        Ok(())
    }

    /// Declares every descriptor in `descs`.
    pub fn describe_all(&self, descs: &[MetricDesc]) -> Result<()> {
        for desc in descs {
            self.describe(desc)?;
        }
        Ok(())
    }

    pub fn gauge_vec(&self, desc: &MetricDesc) -> Result<GaugeVec> {
        match self.family(desc)? {
            Family::Gauge(vec) => Ok(vec),
            _ => Err(self.kind_mismatch(desc, MetricKind::Gauge)),
        }
    }

    pub fn counter_vec(&self, desc: &MetricDesc) -> Result<CounterVec> {
        match self.family(desc)? {
            Family::Counter(vec) => Ok(vec),
            _ => Err(self.kind_mismatch(desc, MetricKind::Counter)),
        }
    }

    pub fn histogram_vec(&self, desc: &MetricDesc) -> Result<HistogramVec> {
        match self.family(desc)? {
            Family::Histogram(vec) => Ok(vec),
            _ => Err(self.kind_mismatch(desc, MetricKind::Histogram)),
        }
    }

    fn family(&self, desc: &MetricDesc) -> Result<Family> {
        self.describe(desc)?;
        let families = self
            .families
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        families
            .get(desc.name)
            .map(|entry| entry.family.clone())
            .ok_or_else(|| SinkError::UnknownMetric(desc.name.to_string()))
    }

    fn kind_mismatch(&self, desc: &MetricDesc, observed: MetricKind) -> SinkError {
        SinkError::KindMismatch {
            name: desc.name.to_string(),
            declared: desc.kind,
            observed,
        }
    }

    /// Writes one observation.
    ///
    /// Gauges are set, histograms observe the value, and counters treat the
    /// value as the upstream cumulative total: the series advances by the
    /// delta, and a smaller total (an upstream reset) restarts the series.
    pub fn record(&self, obs: &Observation) -> Result<()> {
        let (desc, family) = {
            let families = self
                .families
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let entry = families
                .get(&obs.metric_name)
                .ok_or_else(|| SinkError::UnknownMetric(obs.metric_name.clone()))?;
            (entry.desc, entry.family.clone())
        };

        if desc.kind != obs.kind {
            return Err(SinkError::KindMismatch {
                name: obs.metric_name.clone(),
                declared: desc.kind,
                observed: obs.kind,
            });
        }

        let values = ordered_label_values(&desc, &obs.labels)?;

        if !obs.value.is_finite() || (desc.kind == MetricKind::Counter && obs.value < 0.0) {
            return Err(SinkError::InvalidValue {
                name: obs.metric_name.clone(),
                value: obs.value,
            });
        }

        match family {
            Family::Gauge(vec) => {
                vec.get_metric_with_label_values(&values)?.set(obs.value);
            }
            Family::Counter(vec) => {
                let _guard = self
                    .counter_guard
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let counter = vec.get_metric_with_label_values(&values)?;
                let current = counter.get();
                if obs.value >= current {
                    counter.inc_by(obs.value - current);
                } else {
                    counter.reset();
                    counter.inc_by(obs.value);
                }
            }
            Family::Histogram(vec) => {
                vec.get_metric_with_label_values(&values)?.observe(obs.value);
            }
        }
        Ok(())
    }

    /// Encodes every family in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|_| SinkError::Encoding)
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Current value of the first series of `name` whose labels include
    /// every pair in `labels`. Histograms report their sample count.
    ///
    /// Never creates a series.
    pub fn sample(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let family = {
            let families = self
                .families
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            families.get(name)?.family.clone()
        };

        let gathered = match &family {
            Family::Gauge(vec) => vec.collect(),
            Family::Counter(vec) => vec.collect(),
            Family::Histogram(vec) => vec.collect(),
        };

        gathered
            .iter()
            .flat_map(|mf| mf.get_metric().iter())
            .find(|metric| {
                labels.iter().all(|(key, value)| {
                    metric
                        .get_label()
                        .iter()
                        .any(|pair| pair.get_name() == *key && pair.get_value() == *value)
                })
            })
            .map(|metric| match family {
                Family::Gauge(_) => metric.get_gauge().get_value(),
                Family::Counter(_) => metric.get_counter().get_value(),
                Family::Histogram(_) => metric.get_histogram().get_sample_count() as f64,
            })
    }

    /// Number of live series under `name`.
    pub fn series_count(&self, name: &str) -> usize {
        let families = self
            .families
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(entry) = families.get(name) else {
            return 0;
        };
        let gathered = match &entry.family {
            Family::Gauge(vec) => vec.collect(),
            Family::Counter(vec) => vec.collect(),
            Family::Histogram(vec) => vec.collect(),
        };
        gathered.iter().map(|mf| mf.get_metric().len()).sum()
    }
}

fn ordered_label_values<'a>(
    desc: &MetricDesc,
    labels: &'a BTreeMap<String, String>,
) -> Result<Vec<&'a str>> {
    let matches = labels.len() == desc.labels.len()
        && desc.labels.iter().all(|key| labels.contains_key(*key));
    if !matches {
        return Err(SinkError::LabelMismatch {
            name: desc.name.to_string(),
            expected: desc.labels.iter().map(|s| s.to_string()).collect(),
            got: labels.keys().cloned().collect(),
        });
    }
    Ok(desc
        .labels
        .iter()
        .filter_map(|key| labels.get(*key).map(String::as_str))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUOTA: MetricDesc = MetricDesc::gauge("test_quota_bytes", "Quota", &["service", "login"]);
    const CALLS: MetricDesc = MetricDesc::counter("test_calls_total", "Calls", &["number"]);
    const LATENCY: MetricDesc = MetricDesc::histogram("test_latency_seconds", "Latency", &["tier"]);

    #[test]
    fn gauge_keeps_last_value_and_absent_series_stay_absent() {
        let sink = MetricsSink::new();
        sink.describe(&QUOTA).unwrap();

        assert_eq!(sink.sample("test_quota_bytes", &[("service", "a")]), None);

        let obs = QUOTA.observe(10.0).labels([("service", "a"), ("login", "x@a")]);
        sink.record(&obs).unwrap();
        sink.record(&QUOTA.observe(12.0).labels([("service", "a"), ("login", "x@a")]))
            .unwrap();

        assert_eq!(sink.sample("test_quota_bytes", &[("service", "a")]), Some(12.0));
        assert_eq!(sink.sample("test_quota_bytes", &[("service", "b")]), None);
        assert_eq!(sink.series_count("test_quota_bytes"), 1);
    }

    #[test]
    fn partial_label_sets_are_rejected_without_writing() {
        let sink = MetricsSink::new();
        sink.describe(&QUOTA).unwrap();

        let err = sink
            .record(&QUOTA.observe(1.0).label("service", "a"))
            .unwrap_err();
        assert!(matches!(err, SinkError::LabelMismatch { .. }));
        assert_eq!(sink.series_count("test_quota_bytes"), 0);

        let err = sink
            .record(&QUOTA.observe(1.0).labels([("service", "a"), ("login", "b"), ("extra", "c")]))
            .unwrap_err();
        assert!(matches!(err, SinkError::LabelMismatch { .. }));
    }

    #[test]
    fn counters_follow_cumulative_totals_and_handle_resets() {
        let sink = MetricsSink::new();
        sink.describe(&CALLS).unwrap();

        sink.record(&CALLS.observe(5.0).label("number", "1")).unwrap();
        sink.record(&CALLS.observe(8.0).label("number", "1")).unwrap();
        assert_eq!(sink.sample("test_calls_total", &[("number", "1")]), Some(8.0));

        sink.record(&CALLS.observe(2.0).label("number", "1")).unwrap();
        assert_eq!(sink.sample("test_calls_total", &[("number", "1")]), Some(2.0));

        let err = sink.record(&CALLS.observe(-1.0).label("number", "1")).unwrap_err();
        assert!(matches!(err, SinkError::InvalidValue { .. }));
    }

    #[test]
    fn histograms_report_sample_count() {
        let sink = MetricsSink::new();
        let vec = sink.histogram_vec(&LATENCY).unwrap();
        vec.with_label_values(&["fast"]).observe(0.2);
        vec.with_label_values(&["fast"]).observe(0.4);
        assert_eq!(sink.sample("test_latency_seconds", &[("tier", "fast")]), Some(2.0));
    }

    #[test]
    fn describe_is_idempotent_but_rejects_conflicting_shapes() {
        let sink = MetricsSink::new();
        sink.describe(&QUOTA).unwrap();
        sink.describe(&QUOTA).unwrap();

        let clash = MetricDesc::gauge("test_quota_bytes", "Quota", &["service"]);
        assert!(matches!(sink.describe(&clash), Err(SinkError::Conflict { .. })));
    }

    #[test]
    fn unknown_metric_and_kind_mismatch_are_errors() {
        let sink = MetricsSink::new();
        sink.describe(&QUOTA).unwrap();
        assert!(matches!(
            sink.record(&CALLS.observe(1.0).label("number", "1")),
            Err(SinkError::UnknownMetric(_))
        ));
        assert!(sink.counter_vec(&QUOTA).is_err());
    }

    #[test]
    fn encode_renders_text_exposition() {
        let sink = MetricsSink::new();
        sink.describe(&QUOTA).unwrap();
        sink.record(&QUOTA.observe(42.0).labels([("service", "0123456789"), ("login", "unknown")]))
            .unwrap();

        let text = sink.encode().unwrap();
        assert!(text.contains("# TYPE test_quota_bytes gauge"));
        assert!(text.contains("service=\"0123456789\""));
        assert!(text.contains(" 42"));
    }
}

//! Broadband collectors: quota, line info and usage.

use crate::fields::{Extractor, FieldSpec};
use crate::{
    collect_per_service, CollectContext, CollectionOutcome, Collector, CollectorDescriptor, Scope,
};
use aaisp_common::metrics::MetricsSink;
use aaisp_common::types::{MetricDesc, ServiceId, Subsystem, Tier};
use async_trait::async_trait;
use serde_json::Value;

const SERVICE_LABELS: &[&str] = &["service", "login"];

/// `login` comes from the payload only, never from the configured credentials.
const LOGIN: FieldSpec = FieldSpec::new("login", &["login"]);
const UNKNOWN: &str = "unknown";

// ---------------------------------------------------------------------------
// Quota
// ---------------------------------------------------------------------------

pub const QUOTA_TOTAL: MetricDesc = MetricDesc::gauge(
    "aaisp_broadband_quota_total_bytes",
    "Total monthly quota in bytes",
    SERVICE_LABELS,
);
pub const QUOTA_USED: MetricDesc = MetricDesc::gauge(
    "aaisp_broadband_quota_used_bytes",
    "Used quota in bytes for current month",
    SERVICE_LABELS,
);
pub const QUOTA_REMAINING: MetricDesc = MetricDesc::gauge(
    "aaisp_broadband_quota_remaining_bytes",
    "Remaining quota in bytes for current month",
    SERVICE_LABELS,
);
pub const QUOTA_PERCENTAGE: MetricDesc = MetricDesc::gauge(
    "aaisp_broadband_quota_percentage",
    "Percentage of quota used",
    SERVICE_LABELS,
);
pub const QUOTA_TIMESTAMP: MetricDesc = MetricDesc::gauge(
    "aaisp_broadband_quota_timestamp_seconds",
    "Timestamp of quota snapshot (epoch seconds)",
    SERVICE_LABELS,
);

const QUOTA_TOTAL_FIELD: FieldSpec = FieldSpec::new("total", &["quota_monthly", "quota", "total"]);
const QUOTA_REMAINING_FIELD: FieldSpec = FieldSpec::new("remaining", &["quota_remaining", "remaining"]);
const QUOTA_USED_FIELD: FieldSpec = FieldSpec::new("used", &["quota_used", "used"]);
const QUOTA_TIMESTAMP_FIELD: FieldSpec = FieldSpec::new("timestamp", &["quota_timestamp", "timestamp"]);

/// Monthly quota per broadband line.
///
/// `used` is derived as `total - remaining` when both are reported, and read
/// from the payload otherwise.
pub struct QuotaCollector {
    descriptor: CollectorDescriptor,
}

impl QuotaCollector {
    pub const NAME: &'static str = "broadband_quota";

    pub fn new() -> Self {
        Self {
            descriptor: CollectorDescriptor {
                name: Self::NAME,
                tier: Tier::Fast,
                scope: Scope::PerService(Subsystem::Broadband),
            },
        }
    }

    fn extract(sink: &MetricsSink, service: &ServiceId, payload: &Value, outcome: &mut CollectionOutcome) {
        let mut ex = Extractor::new(payload, Some(service));
        let login = ex.label_or(&LOGIN, UNKNOWN);
        let labels = [("service", service.as_str()), ("login", login.as_str())];

        let total = ex.bytes(&QUOTA_TOTAL_FIELD);
        let remaining = ex.bytes(&QUOTA_REMAINING_FIELD);
        let used = match (total, remaining) {
            (Some(total), Some(remaining)) => Some((total - remaining).max(0.0)),
            _ => ex.bytes(&QUOTA_USED_FIELD),
        };
        let percentage = match (used, total) {
            (Some(used), Some(total)) if total > 0.0 => Some(used / total * 100.0),
            _ => None,
        };
        let timestamp = ex.timestamp(&QUOTA_TIMESTAMP_FIELD);

        for (desc, value) in [
            (&QUOTA_TOTAL, total),
            (&QUOTA_USED, used),
            (&QUOTA_REMAINING, remaining),
            (&QUOTA_PERCENTAGE, percentage),
            (&QUOTA_TIMESTAMP, timestamp),
        ] {
            if let Some(value) = value {
                outcome.emit(sink, desc.observe(value).labels(labels));
            }
        }

        tracing::debug!(
            service = %service,
            total = ?total,
            used = ?used,
            remaining = ?remaining,
            "collected quota metrics"
        );
        outcome.extend(ex.into_errors());
    }
}

impl Default for QuotaCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for QuotaCollector {
    fn descriptor(&self) -> &CollectorDescriptor {
        &self.descriptor
    }

    fn metrics(&self) -> &'static [MetricDesc] {
        &[QUOTA_TOTAL, QUOTA_USED, QUOTA_REMAINING, QUOTA_PERCENTAGE, QUOTA_TIMESTAMP]
    }

    async fn collect(&self, ctx: &CollectContext, services: &[ServiceId]) -> CollectionOutcome {
        let sink = ctx.sink.clone();
        collect_per_service(ctx, Subsystem::Broadband, "quota", services, |service, payload, outcome| {
            Self::extract(&sink, service, payload, outcome)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Line info
// ---------------------------------------------------------------------------

pub const LINE_SYNC_DOWNLOAD: MetricDesc = MetricDesc::gauge(
    "aaisp_broadband_line_sync_download_bps",
    "Line sync download speed in bits per second",
    SERVICE_LABELS,
);
pub const LINE_SYNC_UPLOAD: MetricDesc = MetricDesc::gauge(
    "aaisp_broadband_line_sync_upload_bps",
    "Line sync upload speed in bits per second",
    SERVICE_LABELS,
);
pub const LINE_SYNC_DOWNLOAD_ADJUSTED: MetricDesc = MetricDesc::gauge(
    "aaisp_broadband_line_sync_download_adjusted_bps",
    "Adjusted line sync download speed in bits per second",
    SERVICE_LABELS,
);
pub const LINE_UP: MetricDesc = MetricDesc::gauge(
    "aaisp_broadband_line_up",
    "Whether the line is in sync (1) or not (0)",
    SERVICE_LABELS,
);
pub const SERVICE_INFO: MetricDesc = MetricDesc::gauge(
    "aaisp_broadband_service_info",
    "Service information (value always 1, info in labels)",
    &["service", "login", "postcode", "line_state"],
);

const SYNC_DOWN_FIELD: FieldSpec = FieldSpec::new("sync_download", &["tx_rate", "sync_down", "down_rate"]);
const SYNC_UP_FIELD: FieldSpec = FieldSpec::new("sync_upload", &["rx_rate", "sync_up", "up_rate"]);
const SYNC_ADJUSTED_FIELD: FieldSpec =
    FieldSpec::new("sync_download_adjusted", &["tx_rate_adjusted", "adjusted_rate"]);
const LINE_UP_FIELD: FieldSpec = FieldSpec::new("line_up", &["line_up", "up", "in_sync"]);
const POSTCODE_FIELD: FieldSpec = FieldSpec::new("postcode", &["postcode", "post_code"]);
const LINE_STATE_FIELD: FieldSpec = FieldSpec::new("line_state", &["line_state", "state", "status"]);

/// Sync speeds and descriptive labels per broadband line.
pub struct LineInfoCollector {
    descriptor: CollectorDescriptor,
}

impl LineInfoCollector {
    pub const NAME: &'static str = "broadband_line_info";

    pub fn new() -> Self {
        Self {
            descriptor: CollectorDescriptor {
                name: Self::NAME,
                tier: Tier::Medium,
                scope: Scope::PerService(Subsystem::Broadband),
            },
        }
    }

    fn extract(sink: &MetricsSink, service: &ServiceId, payload: &Value, outcome: &mut CollectionOutcome) {
        let mut ex = Extractor::new(payload, Some(service));
        let login = ex.label_or(&LOGIN, UNKNOWN);
        let labels = [("service", service.as_str()), ("login", login.as_str())];

        let sync_down = ex.number(&SYNC_DOWN_FIELD);
        let sync_up = ex.number(&SYNC_UP_FIELD);
        let adjusted = ex.number(&SYNC_ADJUSTED_FIELD);
        // No explicit flag: a reported downstream sync rate tells us the state.
        let line_up = ex
            .flag(&LINE_UP_FIELD)
            .or_else(|| sync_down.map(|rate| if rate > 0.0 { 1.0 } else { 0.0 }));

        for (desc, value) in [
            (&LINE_SYNC_DOWNLOAD, sync_down),
            (&LINE_SYNC_UPLOAD, sync_up),
            (&LINE_SYNC_DOWNLOAD_ADJUSTED, adjusted),
            (&LINE_UP, line_up),
        ] {
            if let Some(value) = value {
                outcome.emit(sink, desc.observe(value).labels(labels));
            }
        }

        let postcode = ex.label_or(&POSTCODE_FIELD, UNKNOWN);
        let line_state = ex.label_or(&LINE_STATE_FIELD, UNKNOWN);
        outcome.emit(
            sink,
            SERVICE_INFO.observe(1.0).labels([
                ("service", service.as_str()),
                ("login", login.as_str()),
                ("postcode", postcode.as_str()),
                ("line_state", line_state.as_str()),
            ]),
        );

        outcome.extend(ex.into_errors());
    }
}

impl Default for LineInfoCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for LineInfoCollector {
    fn descriptor(&self) -> &CollectorDescriptor {
        &self.descriptor
    }

    fn metrics(&self) -> &'static [MetricDesc] {
        &[
            LINE_SYNC_DOWNLOAD,
            LINE_SYNC_UPLOAD,
            LINE_SYNC_DOWNLOAD_ADJUSTED,
            LINE_UP,
            SERVICE_INFO,
        ]
    }

    async fn collect(&self, ctx: &CollectContext, services: &[ServiceId]) -> CollectionOutcome {
        let sink = ctx.sink.clone();
        collect_per_service(ctx, Subsystem::Broadband, "info", services, |service, payload, outcome| {
            Self::extract(&sink, service, payload, outcome)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

pub const USAGE_DOWNLOAD: MetricDesc = MetricDesc::gauge(
    "aaisp_broadband_usage_download_bytes",
    "Bytes downloaded in the current usage period",
    &["service"],
);
pub const USAGE_UPLOAD: MetricDesc = MetricDesc::gauge(
    "aaisp_broadband_usage_upload_bytes",
    "Bytes uploaded in the current usage period",
    &["service"],
);

const USAGE_SCOPE: FieldSpec = FieldSpec::new("usage", &["usage", "total"]);
const USAGE_DOWNLOAD_FIELD: FieldSpec =
    FieldSpec::new("download", &["download_bytes", "download", "total_download", "rx_bytes"]);
const USAGE_UPLOAD_FIELD: FieldSpec =
    FieldSpec::new("upload", &["upload_bytes", "upload", "total_upload", "tx_bytes"]);

/// Accumulated transfer per broadband line.
///
/// Only the aggregate-totals shape is understood. A time-series shape (a
/// `usage` array) is reported as a shape error and produces no observation.
pub struct UsageCollector {
    descriptor: CollectorDescriptor,
}

impl UsageCollector {
    pub const NAME: &'static str = "broadband_usage";

    pub fn new() -> Self {
        Self {
            descriptor: CollectorDescriptor {
                name: Self::NAME,
                tier: Tier::Slow,
                scope: Scope::PerService(Subsystem::Broadband),
            },
        }
    }

    fn extract(sink: &MetricsSink, service: &ServiceId, payload: &Value, outcome: &mut CollectionOutcome) {
        let mut ex = Extractor::new(payload, Some(service));

        if USAGE_SCOPE.lookup(payload).is_some_and(Value::is_array) {
            ex.shape_error(USAGE_SCOPE.name, "time-series usage is not supported");
            outcome.extend(ex.into_errors());
            return;
        }

        let (download, upload) = match ex.nested(&USAGE_SCOPE) {
            Some(mut totals) => {
                let values = (totals.bytes(&USAGE_DOWNLOAD_FIELD), totals.bytes(&USAGE_UPLOAD_FIELD));
                ex.absorb(totals);
                values
            }
            None => (ex.bytes(&USAGE_DOWNLOAD_FIELD), ex.bytes(&USAGE_UPLOAD_FIELD)),
        };

        for (desc, value) in [(&USAGE_DOWNLOAD, download), (&USAGE_UPLOAD, upload)] {
            if let Some(value) = value {
                outcome.emit(sink, desc.observe(value).label("service", service.as_str()));
            }
        }
        outcome.extend(ex.into_errors());
    }
}

impl Default for UsageCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for UsageCollector {
    fn descriptor(&self) -> &CollectorDescriptor {
        &self.descriptor
    }

    fn metrics(&self) -> &'static [MetricDesc] {
        &[USAGE_DOWNLOAD, USAGE_UPLOAD]
    }

    async fn collect(&self, ctx: &CollectContext, services: &[ServiceId]) -> CollectionOutcome {
        let sink = ctx.sink.clone();
        collect_per_service(ctx, Subsystem::Broadband, "usage", services, |service, payload, outcome| {
            Self::extract(&sink, service, payload, outcome)
        })
        .await
    }
}

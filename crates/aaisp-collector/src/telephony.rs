//! Telephony collectors: per-number call statistics and the account rate card.

use crate::fields::{to_label, to_number, Extractor, FieldSpec};
use crate::{
    collect_per_service, CollectContext, CollectionOutcome, Collector, CollectorDescriptor,
    FieldError, Scope,
};
use aaisp_common::metrics::MetricsSink;
use aaisp_common::types::{MetricDesc, ServiceId, Subsystem, Tier};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Call statistics
// ---------------------------------------------------------------------------

pub const TELEPHONY_SERVICE_INFO: MetricDesc = MetricDesc::gauge(
    "aaisp_telephony_service_info",
    "Telephony service information (value always 1, info in labels)",
    &["number", "status", "call_forwarding", "voicemail", "service_type"],
);
pub const CALLS_TOTAL: MetricDesc = MetricDesc::counter(
    "aaisp_telephony_calls_total",
    "Total number of calls",
    &["number", "direction"],
);
pub const CALL_DURATION_TOTAL: MetricDesc = MetricDesc::counter(
    "aaisp_telephony_call_duration_seconds_total",
    "Total call duration in seconds",
    &["number", "direction"],
);
pub const CALL_COST_TOTAL: MetricDesc = MetricDesc::counter(
    "aaisp_telephony_call_cost_total",
    "Total call cost",
    &["number", "direction", "currency"],
);
pub const ACTIVE_CALLS: MetricDesc = MetricDesc::gauge(
    "aaisp_telephony_active_calls",
    "Number of currently active calls",
    &["number"],
);

const STATUS_FIELD: FieldSpec = FieldSpec::new("status", &["status"]);
const FORWARDING_FIELD: FieldSpec = FieldSpec::new("call_forwarding", &["call_forwarding", "forwarding"]);
const VOICEMAIL_FIELD: FieldSpec = FieldSpec::new("voicemail", &["voicemail", "voicemail_enabled"]);
const SERVICE_TYPE_FIELD: FieldSpec = FieldSpec::new("service_type", &["service_type", "type"]);
const CURRENCY_FIELD: FieldSpec = FieldSpec::new("currency", &["currency"]);
const ACTIVE_FIELD: FieldSpec = FieldSpec::new("active_calls", &["active_calls", "current_calls"]);
const STATS_FIELD: FieldSpec = FieldSpec::new("call_stats", &["call_stats", "statistics"]);

struct DirectionFields {
    direction: &'static str,
    count: FieldSpec,
    duration: FieldSpec,
    cost: FieldSpec,
}

const DIRECTIONS: [DirectionFields; 2] = [
    DirectionFields {
        direction: "inbound",
        count: FieldSpec::new("inbound_calls", &["inbound_calls", "calls_in"]),
        duration: FieldSpec::new("inbound_duration", &["inbound_duration", "duration_in"]),
        cost: FieldSpec::new("inbound_cost", &["inbound_cost", "cost_in"]),
    },
    DirectionFields {
        direction: "outbound",
        count: FieldSpec::new("outbound_calls", &["outbound_calls", "calls_out"]),
        duration: FieldSpec::new("outbound_duration", &["outbound_duration", "duration_out"]),
        cost: FieldSpec::new("outbound_cost", &["outbound_cost", "cost_out"]),
    },
];

/// Call volume, duration and cost per telephony number.
///
/// Upstream reports running totals, which are written as cumulative counter
/// values; the sink turns them into monotonic increments.
pub struct CallStatsCollector {
    descriptor: CollectorDescriptor,
}

impl CallStatsCollector {
    pub const NAME: &'static str = "telephony_call_stats";

    pub fn new() -> Self {
        Self {
            descriptor: CollectorDescriptor {
                name: Self::NAME,
                tier: Tier::Medium,
                scope: Scope::PerService(Subsystem::Telephony),
            },
        }
    }

    fn extract(sink: &MetricsSink, number: &ServiceId, payload: &Value, outcome: &mut CollectionOutcome) {
        let mut ex = Extractor::new(payload, Some(number));
        let number_str = number.as_str();

        let forwarding = ex.label_or(&FORWARDING_FIELD, "unknown").to_lowercase();
        let voicemail = ex.label_or(&VOICEMAIL_FIELD, "unknown").to_lowercase();
        let status = ex.label_or(&STATUS_FIELD, "unknown");
        let service_type = ex.label_or(&SERVICE_TYPE_FIELD, "unknown");
        outcome.emit(
            sink,
            TELEPHONY_SERVICE_INFO.observe(1.0).labels([
                ("number", number_str),
                ("status", status.as_str()),
                ("call_forwarding", forwarding.as_str()),
                ("voicemail", voicemail.as_str()),
                ("service_type", service_type.as_str()),
            ]),
        );

        let currency = ex.label_or(&CURRENCY_FIELD, "GBP");
        if let Some(mut stats) = ex.nested(&STATS_FIELD) {
            for fields in &DIRECTIONS {
                let base = [("number", number_str), ("direction", fields.direction)];
                if let Some(count) = stats.number(&fields.count) {
                    outcome.emit(sink, CALLS_TOTAL.observe(count.trunc()).labels(base));
                }
                if let Some(duration) = stats.number(&fields.duration) {
                    outcome.emit(sink, CALL_DURATION_TOTAL.observe(duration).labels(base));
                }
                if let Some(cost) = stats.number(&fields.cost) {
                    outcome.emit(
                        sink,
                        CALL_COST_TOTAL
                            .observe(cost)
                            .labels(base)
                            .label("currency", currency.as_str()),
                    );
                }
            }
            ex.absorb(stats);
        }

        if let Some(active) = ex.number(&ACTIVE_FIELD) {
            outcome.emit(sink, ACTIVE_CALLS.observe(active.trunc()).label("number", number_str));
        }

        outcome.extend(ex.into_errors());
    }
}

impl Default for CallStatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for CallStatsCollector {
    fn descriptor(&self) -> &CollectorDescriptor {
        &self.descriptor
    }

    fn metrics(&self) -> &'static [MetricDesc] {
        &[
            TELEPHONY_SERVICE_INFO,
            CALLS_TOTAL,
            CALL_DURATION_TOTAL,
            CALL_COST_TOTAL,
            ACTIVE_CALLS,
        ]
    }

    async fn collect(&self, ctx: &CollectContext, services: &[ServiceId]) -> CollectionOutcome {
        let sink = ctx.sink.clone();
        collect_per_service(ctx, Subsystem::Telephony, "info", services, |number, payload, outcome| {
            Self::extract(&sink, number, payload, outcome)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Rate card
// ---------------------------------------------------------------------------

pub const RATE_PPM: MetricDesc = MetricDesc::gauge(
    "aaisp_telephony_rate_ppm",
    "Telephony rate per minute in pence for period",
    &["rate_name", "period"],
);
pub const RATE_MIN_CHARGE: MetricDesc = MetricDesc::gauge(
    "aaisp_telephony_rate_min_charge_pence",
    "Minimum call charge in pence for rate",
    &["rate_name"],
);
pub const RATE_PREFIXES: MetricDesc = MetricDesc::gauge(
    "aaisp_telephony_prefixes_total",
    "Number of dial prefixes mapped to this rate",
    &["rate_name"],
);
pub const RATECARD_LAST_UPDATED: MetricDesc = MetricDesc::gauge(
    "aaisp_telephony_ratecard_last_updated_timestamp_seconds",
    "Unix timestamp when rate card was last updated",
    &[],
);

const PERIODS: [(&str, &str); 3] = [
    ("peak_ppm", "peak"),
    ("offpeak_ppm", "offpeak"),
    ("weekend_ppm", "weekend"),
];

/// Account-wide call pricing. Runs once per cycle.
pub struct RateCardCollector {
    descriptor: CollectorDescriptor,
}

impl RateCardCollector {
    pub const NAME: &'static str = "telephony_ratecard";
    const COMMAND: &'static str = "ratecard";

    pub fn new() -> Self {
        Self {
            descriptor: CollectorDescriptor {
                name: Self::NAME,
                tier: Tier::Slow,
                scope: Scope::OncePerCycle,
            },
        }
    }

    fn extract(sink: &MetricsSink, payload: &Value, outcome: &mut CollectionOutcome) {
        let mut ex = Extractor::new(payload, None);
        let Some(card) = payload.get("rate_card").filter(|v| v.is_object()) else {
            ex.shape_error("rate_card", "missing rate_card object");
            outcome.extend(ex.into_errors());
            return;
        };

        let codes = entries(card.get("codes").and_then(|c| c.get("code")));
        let rates = entries(card.get("rates").and_then(|r| r.get("rate")));

        let mut prefixes: BTreeMap<String, usize> = BTreeMap::new();
        for code in &codes {
            if let Some(rate) = code.get("rate").and_then(to_label) {
                *prefixes.entry(rate).or_default() += 1;
            }
        }

        for rate in &rates {
            let Some(name) = rate.get("rate").and_then(to_label) else {
                tracing::debug!("skipping rate entry without a name");
                continue;
            };

            for (key, period) in PERIODS {
                if let Some(value) = number_field(&mut ex, rate, &name, key) {
                    outcome.emit(
                        sink,
                        RATE_PPM
                            .observe(value)
                            .labels([("rate_name", name.as_str()), ("period", period)]),
                    );
                }
            }
            if let Some(value) = number_field(&mut ex, rate, &name, "min_charge") {
                outcome.emit(sink, RATE_MIN_CHARGE.observe(value).label("rate_name", name.as_str()));
            }
            let count = prefixes.get(&name).copied().unwrap_or(0);
            outcome.emit(
                sink,
                RATE_PREFIXES
                    .observe(count as f64)
                    .label("rate_name", name.as_str()),
            );
        }

        outcome.emit(
            sink,
            RATECARD_LAST_UPDATED.observe(chrono::Utc::now().timestamp() as f64),
        );
        tracing::debug!(rates = rates.len(), codes = codes.len(), "collected ratecard metrics");
        outcome.extend(ex.into_errors());
    }
}

impl Default for RateCardCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// The API renders single-element lists as a bare object.
fn entries(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().filter(|v| v.is_object()).collect(),
        Some(item @ Value::Object(_)) => vec![item],
        _ => Vec::new(),
    }
}

fn number_field(ex: &mut Extractor<'_>, rate: &Value, name: &str, key: &str) -> Option<f64> {
    let value = rate.get(key).filter(|v| !v.is_null())?;
    match to_number(value) {
        Ok(v) => Some(v),
        Err(reason) => {
            ex.conversion_error(&format!("{name}.{key}"), reason);
            None
        }
    }
}

#[async_trait]
impl Collector for RateCardCollector {
    fn descriptor(&self) -> &CollectorDescriptor {
        &self.descriptor
    }

    fn metrics(&self) -> &'static [MetricDesc] {
        &[RATE_PPM, RATE_MIN_CHARGE, RATE_PREFIXES, RATECARD_LAST_UPDATED]
    }

    async fn collect(&self, ctx: &CollectContext, _services: &[ServiceId]) -> CollectionOutcome {
        let mut outcome = CollectionOutcome::default();
        match ctx
            .client
            .call(Subsystem::Telephony, Self::COMMAND, &[], &ctx.budget)
            .await
        {
            Ok(payload) => Self::extract(&ctx.sink, &payload, &mut outcome),
            Err(err) => {
                tracing::warn!(error = %err, "telephony ratecard call failed");
                outcome.push(FieldError::call(None, Self::COMMAND, err));
            }
        }
        outcome
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Collection cadence class. Each tier runs its own independent loop.
///
/// # Examples
///
/// ```
/// use aaisp_common::types::Tier;
///
/// let tier: Tier = "medium".parse().unwrap();
/// assert_eq!(tier, Tier::Medium);
/// assert_eq!(tier.to_string(), "medium");
/// assert_eq!(Tier::Fast.default_interval_secs(), 60);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Fast,
    Medium,
    Slow,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Fast, Tier::Medium, Tier::Slow];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Medium => "medium",
            Tier::Slow => "slow",
        }
    }

    pub fn default_interval_secs(&self) -> u64 {
        match self {
            Tier::Fast => 60,
            Tier::Medium => 300,
            Tier::Slow => 900,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fast" => Ok(Tier::Fast),
            "medium" => Ok(Tier::Medium),
            "slow" => Ok(Tier::Slow),
            _ => Err(format!("unknown tier: {s}")),
        }
    }
}

/// CHAOS API subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    Broadband,
    Login,
    Telephony,
    Domain,
    Email,
    Sim,
}

impl Subsystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Broadband => "broadband",
            Subsystem::Login => "login",
            Subsystem::Telephony => "telephony",
            Subsystem::Domain => "domain",
            Subsystem::Email => "email",
            Subsystem::Sim => "sim",
        }
    }
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque key scoping a collector invocation to one account service
/// (phone number, line id, login name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ServiceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
    Histogram,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Histogram => write!(f, "histogram"),
        }
    }
}

/// Static description of a metric family. The label key set is fixed for
/// the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDesc {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
    pub labels: &'static [&'static str],
}

impl MetricDesc {
    pub const fn gauge(
        name: &'static str,
        help: &'static str,
        labels: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            help,
            kind: MetricKind::Gauge,
            labels,
        }
    }

    pub const fn counter(
        name: &'static str,
        help: &'static str,
        labels: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            help,
            kind: MetricKind::Counter,
            labels,
        }
    }

    pub const fn histogram(
        name: &'static str,
        help: &'static str,
        labels: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            help,
            kind: MetricKind::Histogram,
            labels,
        }
    }

    /// Starts an observation for this family.
    pub fn observe(&self, value: f64) -> Observation {
        Observation {
            metric_name: self.name.to_string(),
            kind: self.kind,
            labels: BTreeMap::new(),
            value,
        }
    }
}

/// One value for one series, ready to be written into the sink.
///
/// # Examples
///
/// ```
/// use aaisp_common::types::MetricDesc;
///
/// const TOTAL: MetricDesc = MetricDesc::gauge("quota_total_bytes", "Quota", &["service"]);
/// let obs = TOTAL.observe(5.0e11).label("service", "0123456789");
/// assert_eq!(obs.labels["service"], "0123456789");
/// assert_eq!(obs.value, 5.0e11);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub metric_name: String,
    pub kind: MetricKind,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl Observation {
    pub fn label(mut self, key: &str, value: impl Into<String>) -> Self {
        self.labels.insert(key.to_string(), value.into());
        self
    }

    pub fn labels<'a, I>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (key, value) in pairs {
            self.labels.insert(key.to_string(), value.to_string());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_round_trips_through_serde_as_lowercase() {
        let json = serde_json::to_string(&Tier::Slow).unwrap();
        assert_eq!(json, "\"slow\"");
        let back: Tier = serde_json::from_str("\"fast\"").unwrap();
        assert_eq!(back, Tier::Fast);
    }

    #[test]
    fn tier_rejects_unknown_names() {
        assert!("hourly".parse::<Tier>().is_err());
        assert_eq!("FAST".parse::<Tier>().unwrap(), Tier::Fast);
    }

    #[test]
    fn observation_builder_collects_labels() {
        const D: MetricDesc = MetricDesc::counter("calls_total", "Calls", &["number", "direction"]);
        let obs = D
            .observe(3.0)
            .labels([("number", "0201234"), ("direction", "inbound")]);
        assert_eq!(obs.kind, MetricKind::Counter);
        assert_eq!(obs.labels.len(), 2);
        assert_eq!(obs.labels["direction"], "inbound");
    }
}

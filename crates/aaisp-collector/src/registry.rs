use crate::Collector;
use aaisp_common::metrics::{MetricsSink, SinkError};
use aaisp_common::types::Tier;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("collector '{0}' is registered more than once")]
    Duplicate(String),
}

/// Collects registrations during startup. Frozen into a
/// [`CollectorRegistry`] by [`CollectorRegistryBuilder::build`].
///
/// # Examples
///
/// ```
/// use aaisp_collector::{builtin_collectors, CollectorRegistryBuilder, RegistryError};
/// use aaisp_common::types::Tier;
///
/// let mut builder = CollectorRegistryBuilder::new();
/// for collector in builtin_collectors() {
///     builder.register(collector, true).unwrap();
/// }
/// let again = builtin_collectors().remove(0);
/// assert!(matches!(builder.register(again, false), Err(RegistryError::Duplicate(_))));
///
/// let registry = builder.build();
/// assert_eq!(registry.collectors_for(Tier::Fast)[0].name(), "broadband_quota");
/// ```
#[derive(Default)]
pub struct CollectorRegistryBuilder {
    names: HashSet<&'static str>,
    by_tier: BTreeMap<Tier, Vec<Arc<dyn Collector>>>,
    disabled: Vec<&'static str>,
}

impl CollectorRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `collector`. Disabled collectors are remembered by name
    /// (so duplicates are still caught) but never scheduled.
    pub fn register(&mut self, collector: Arc<dyn Collector>, enabled: bool) -> Result<(), RegistryError> {
        let name = collector.name();
        if !self.names.insert(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }

        if enabled {
            tracing::debug!(collector = name, tier = %collector.tier(), "registered collector");
            self.by_tier.entry(collector.tier()).or_default().push(collector);
        } else {
            tracing::debug!(collector = name, "collector disabled");
            self.disabled.push(name);
        }
        Ok(())
    }

    pub fn build(self) -> CollectorRegistry {
        CollectorRegistry {
            by_tier: self.by_tier,
            disabled: self.disabled,
        }
    }
}

/// Tier-to-collectors table. Immutable once built.
pub struct CollectorRegistry {
    by_tier: BTreeMap<Tier, Vec<Arc<dyn Collector>>>,
    disabled: Vec<&'static str>,
}

impl CollectorRegistry {
    /// Enabled collectors of `tier` in registration order.
    pub fn collectors_for(&self, tier: Tier) -> &[Arc<dyn Collector>] {
        self.by_tier.get(&tier).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Collector>> {
        self.by_tier.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_tier.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn disabled(&self) -> &[&'static str] {
        &self.disabled
    }

    /// Describes every metric family of every enabled collector.
    pub fn describe_metrics(&self, sink: &MetricsSink) -> Result<(), SinkError> {
        for collector in self.iter() {
            sink.describe_all(collector.metrics())?;
        }
        Ok(())
    }
}

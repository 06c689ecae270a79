//! AAISP CHAOS API exporter: configuration, tier scheduling and the HTTP
//! exposition layer.

pub mod app;
pub mod config;
pub mod logging;
pub mod scheduler;
pub mod state;
pub mod status;

use aaisp_collector::{
    builtin_collectors, Collector, CollectorRegistry, CollectorRegistryBuilder, RegistryError,
};
use config::CollectorsConfig;

/// Registers every built-in collector, enabled or not per `collectors`.
pub fn build_registry(collectors: &CollectorsConfig) -> Result<CollectorRegistry, RegistryError> {
    let mut builder = CollectorRegistryBuilder::new();
    for collector in builtin_collectors() {
        let enabled = collectors.is_enabled(collector.name());
        builder.register(collector, enabled)?;
    }
    Ok(builder.build())
}

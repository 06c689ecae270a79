//! Shared types for the AAISP CHAOS exporter.
//!
//! [`types`] holds the domain vocabulary (tiers, subsystems, service ids,
//! metric descriptors) and [`metrics`] the thread-safe sink that collectors
//! write into and the `/metrics` endpoint reads from.

pub mod metrics;
pub mod shutdown;
pub mod types;

//! Collectors turn CHAOS API payloads into metric observations.
//!
//! A collector never fails as a whole: conversion problems and call
//! failures are reported per service in its [`CollectionOutcome`] and the
//! remaining fields and services are still collected.

pub mod broadband;
pub mod fields;
pub mod registry;
pub mod telephony;


pub use registry::{CollectorRegistry, CollectorRegistryBuilder, RegistryError};

use aaisp_client::{CallError, ChaosClient, RetryBudget};
use aaisp_common::metrics::MetricsSink;
use aaisp_common::types::{MetricDesc, Observation, ServiceId, Subsystem, Tier};
use async_trait::async_trait;
use std::sync::Arc;

/// How a collector is fanned out within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// One unit per service id discovered in the subsystem.
    PerService(Subsystem),
    /// A single unit per cycle, no discovery.
    OncePerCycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorDescriptor {
    pub name: &'static str,
    pub tier: Tier,
    pub scope: Scope,
}

/// What every collection unit gets to work with.
#[derive(Clone)]
pub struct CollectContext {
    pub client: Arc<ChaosClient>,
    pub sink: Arc<MetricsSink>,
    /// Shared by every unit of the current cycle.
    pub budget: RetryBudget,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FieldErrorKind {
    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("unexpected payload shape: {0}")]
    Shape(String),

    #[error("observation rejected by sink: {0}")]
    Sink(String),

    #[error("call failed: {0}")]
    Call(CallError),
}

/// A recoverable failure for one field (or one whole service when the
/// call itself failed).
#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    pub service: Option<ServiceId>,
    pub field: String,
    pub reason: FieldErrorKind,
}

impl FieldError {
    pub fn call(service: Option<ServiceId>, command: &str, err: CallError) -> Self {
        Self {
            service,
            field: command.to_string(),
            reason: FieldErrorKind::Call(err),
        }
    }

    pub fn is_call_error(&self) -> bool {
        matches!(self.reason, FieldErrorKind::Call(_))
    }

    /// Label value for the error counter.
    pub fn error_type(&self) -> &'static str {
        match &self.reason {
            FieldErrorKind::Conversion(_) => "conversion",
            FieldErrorKind::Shape(_) => "shape",
            FieldErrorKind::Sink(_) => "sink",
            FieldErrorKind::Call(err) => err.kind(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.service {
            Some(service) => write!(f, "{service}/{}: {}", self.field, self.reason),
            None => write!(f, "{}: {}", self.field, self.reason),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CollectionOutcome {
    pub observations_written: usize,
    pub errors: Vec<FieldError>,
}

impl CollectionOutcome {
    /// Writes `obs` into the sink, counting it or recording the rejection.
    pub fn emit(&mut self, sink: &MetricsSink, obs: Observation) {
        match sink.record(&obs) {
            Ok(()) => self.observations_written += 1,
            Err(e) => {
                tracing::warn!(metric = %obs.metric_name, error = %e, "observation rejected");
                self.errors.push(FieldError {
                    service: obs
                        .labels
                        .get("service")
                        .or_else(|| obs.labels.get("number"))
                        .map(|s| ServiceId::new(s.as_str())),
                    field: obs.metric_name.clone(),
                    reason: FieldErrorKind::Sink(e.to_string()),
                });
            }
        }
    }

    pub fn push(&mut self, error: FieldError) {
        self.errors.push(error);
    }

    pub fn extend(&mut self, errors: Vec<FieldError>) {
        self.errors.extend(errors);
    }

    pub fn merge(&mut self, other: CollectionOutcome) {
        self.observations_written += other.observations_written;
        self.errors.extend(other.errors);
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_call_error(&self) -> bool {
        self.errors.iter().any(FieldError::is_call_error)
    }
}

#[async_trait]
pub trait Collector: Send + Sync {
    fn descriptor(&self) -> &CollectorDescriptor;

    /// Every metric family this collector may write.
    fn metrics(&self) -> &'static [MetricDesc];

    /// Collects for each of `services` (ignored for [`Scope::OncePerCycle`]).
    async fn collect(&self, ctx: &CollectContext, services: &[ServiceId]) -> CollectionOutcome;

    fn name(&self) -> &'static str {
        self.descriptor().name
    }

    fn tier(&self) -> Tier {
        self.descriptor().tier
    }
}

/// Calls `command` once per service and hands each payload to `extract`.
/// A failed call is recorded against its service and the loop moves on.
pub(crate) async fn collect_per_service<F>(
    ctx: &CollectContext,
    subsystem: Subsystem,
    command: &str,
    services: &[ServiceId],
    mut extract: F,
) -> CollectionOutcome
where
    F: FnMut(&ServiceId, &serde_json::Value, &mut CollectionOutcome) + Send,
{
    let mut outcome = CollectionOutcome::default();
    for service in services {
        let params = [("service", service.as_str())];
        match ctx.client.call(subsystem, command, &params, &ctx.budget).await {
            Ok(payload) => extract(service, &payload, &mut outcome),
            Err(err) => {
                tracing::warn!(
                    subsystem = %subsystem,
                    command,
                    service = %service,
                    error = %err,
                    "collection call failed"
                );
                outcome.push(FieldError::call(Some(service.clone()), command, err));
            }
        }
    }
    outcome
}

/// Every collector this crate provides, in registration order.
pub fn builtin_collectors() -> Vec<Arc<dyn Collector>> {
    vec![
        Arc::new(broadband::QuotaCollector::new()),
        Arc::new(broadband::LineInfoCollector::new()),
        Arc::new(broadband::UsageCollector::new()),
        Arc::new(telephony::CallStatsCollector::new()),
        Arc::new(telephony::RateCardCollector::new()),
    ]
}

use crate::status::StatusBoard;
use aaisp_collector::CollectorRegistry;
use aaisp_common::metrics::MetricsSink;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Shared by every HTTP handler. Read-only.
#[derive(Clone)]
pub struct AppState {
    pub sink: Arc<MetricsSink>,
    pub board: StatusBoard,
    pub registry: Arc<CollectorRegistry>,
    pub start_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(sink: Arc<MetricsSink>, board: StatusBoard, registry: Arc<CollectorRegistry>) -> Self {
        Self {
            sink,
            board,
            registry,
            start_time: Utc::now(),
        }
    }
}

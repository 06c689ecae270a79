//! HTTP exposition: `/metrics`, `/health` and a landing page.

use crate::logging;
use crate::state::AppState;
use crate::status::{Health, TierStatus};
use aaisp_common::metrics::{MetricsSink, SinkError};
use aaisp_common::types::MetricDesc;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{middleware, Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const BUILD_INFO: MetricDesc = MetricDesc::gauge(
    "aaisp_exporter_build_info",
    "Exporter build information",
    &["version"],
);

pub const EXPORTER_UP: MetricDesc =
    MetricDesc::gauge("aaisp_exporter_up", "Exporter is running", &[]);

/// Publishes the exporter's own constant gauges.
pub fn register_exporter_metrics(sink: &MetricsSink) -> Result<(), SinkError> {
    sink.describe_all(&[BUILD_INFO, EXPORTER_UP])?;
    sink.record(&BUILD_INFO.observe(1.0).label("version", VERSION))?;
    sink.record(&EXPORTER_UP.observe(1.0))?;
    Ok(())
}

pub fn build_http_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state)
        .layer(middleware::from_fn(logging::request_logging))
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.sink.encode() {
        Ok(body) => (
            [(header::CONTENT_TYPE, state.sink.content_type())],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to encode metrics: {e}")).into_response()
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: Health,
    version: &'static str,
    uptime_secs: i64,
    tiers: BTreeMap<&'static str, TierStatus>,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (status, all_failed) = state.board.health();
    let tiers = state
        .board
        .snapshot()
        .into_iter()
        .map(|s| (s.tier.as_str(), s))
        .collect();
    let code = if all_failed {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        code,
        Json(HealthResponse {
            status,
            version: VERSION,
            uptime_secs: (Utc::now() - state.start_time).num_seconds(),
            tiers,
        }),
    )
}

async fn index(State(state): State<AppState>) -> Html<String> {
    let mut rows = String::new();
    for status in state.board.snapshot() {
        let collectors = if status.collectors.is_empty() {
            "<em>none</em>".to_string()
        } else {
            status.collectors.join(", ")
        };
        let _ = write!(
            rows,
            "<tr><td>{}</td><td>{}s</td><td>{}</td></tr>",
            status.tier, status.interval_secs, collectors
        );
    }
    let disabled = state.registry.disabled().join(", ");

    Html(format!(
        "<!DOCTYPE html>\n<html>\n<head><title>AAISP Exporter</title></head>\n<body>\n\
         <h1>AAISP Prometheus Exporter</h1>\n\
         <p>Version {VERSION}</p>\n\
         <ul>\n<li><a href=\"/metrics\">/metrics</a></li>\n<li><a href=\"/health\">/health</a></li>\n</ul>\n\
         <table>\n<tr><th>Tier</th><th>Interval</th><th>Collectors</th></tr>\n{rows}\n</table>\n\
         <p>Disabled: {disabled}</p>\n\
         </body>\n</html>\n"
    ))
}

//! Remote call client for the AAISP CHAOS API.
//!
//! Every call passes through one process-wide admission semaphore, is
//! bounded by a per-attempt timeout, honours the shutdown signal, and is
//! recorded in the metrics sink once per attempt. Read-only commands are
//! retried on transient failures with jittered exponential backoff.

pub mod auth;
pub mod error;
mod metrics;
pub mod retry;
pub mod transport;


pub use auth::{Credentials, Secret};
pub use error::{CallError, Result, TransportError};
pub use metrics::{API_REQUESTS_IN_FLIGHT, API_REQUESTS_TOTAL, API_REQUEST_DURATION};
pub use retry::{is_idempotent, Backoff, RetryBudget};
pub use transport::{HttpTransport, RawResponse, Transport};

use aaisp_common::metrics::{MetricsSink, SinkError};
use aaisp_common::shutdown::Shutdown;
use aaisp_common::types::{ServiceId, Subsystem};
use metrics::CallMetrics;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Longest slice of an error body kept in a [`CallError::HttpError`].
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub concurrency_limit: usize,
    pub backoff: Backoff,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: "https://chaos2.aa.net.uk".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            concurrency_limit: 5,
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(30)),
        }
    }
}

pub struct ChaosClient {
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    settings: ClientSettings,
    admission: Semaphore,
    metrics: CallMetrics,
    shutdown: Shutdown,
}

impl ChaosClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Credentials,
        settings: ClientSettings,
        sink: &MetricsSink,
        shutdown: Shutdown,
    ) -> std::result::Result<Self, SinkError> {
        let metrics = CallMetrics::new(sink)?;
        tracing::info!(
            base_url = %settings.base_url,
            auth_mode = credentials.mode(),
            concurrency_limit = settings.concurrency_limit,
            max_retries = settings.max_retries,
            "CHAOS API client initialized"
        );
        Ok(Self {
            transport,
            credentials,
            admission: Semaphore::new(settings.concurrency_limit),
            settings,
            metrics,
            shutdown,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn concurrency_limit(&self) -> usize {
        self.settings.concurrency_limit
    }

    /// Highest number of simultaneously admitted attempts seen so far.
    pub fn peak_in_flight(&self) -> usize {
        self.metrics.peak()
    }

    pub fn in_flight(&self) -> usize {
        self.metrics.current()
    }

    /// Calls `{base_url}/{subsystem}/{command}/json` and returns the
    /// decoded JSON object.
    pub async fn call(
        &self,
        subsystem: Subsystem,
        command: &str,
        params: &[(&str, &str)],
        budget: &RetryBudget,
    ) -> Result<Value> {
        let url = format!(
            "{}/{}/{}/json",
            self.settings.base_url.trim_end_matches('/'),
            subsystem,
            command
        );
        let mut form = self.credentials.form_params();
        form.extend(params.iter().map(|(k, v)| (k.to_string(), v.to_string())));

        let retryable = is_idempotent(command);
        let mut attempt = 0u32;

        loop {
            let err = match self.attempt(subsystem, command, &url, &form).await {
                Ok(payload) => return Ok(payload),
                Err(err) => err,
            };

            let max_retries = budget.retries(self.settings.max_retries);
            if !retryable || !err.is_transient() || attempt >= max_retries {
                if err == CallError::RateLimited {
                    budget.mark_throttled();
                }
                tracing::debug!(
                    subsystem = %subsystem,
                    command,
                    attempts = attempt + 1,
                    error = %err,
                    "CHAOS API call failed"
                );
                return Err(err);
            }

            let delay = self.settings.backoff.delay(attempt);
            tracing::warn!(
                subsystem = %subsystem,
                command,
                attempt = attempt + 1,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "CHAOS API call failed, retrying"
            );

            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = shutdown.cancelled() => return Err(CallError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        subsystem: Subsystem,
        command: &str,
        url: &str,
        form: &[(String, String)],
    ) -> Result<Value> {
        let mut shutdown = self.shutdown.clone();

        let _permit = tokio::select! {
            _ = shutdown.cancelled() => return Err(CallError::Cancelled),
            permit = self.admission.acquire() => permit.map_err(|_| CallError::Cancelled)?,
        };
        let _in_flight = self.metrics.enter();

        let started = Instant::now();
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => return Err(CallError::Cancelled),
            res = tokio::time::timeout(self.settings.timeout, self.transport.post(url, form)) => res,
        };
        let elapsed = started.elapsed();

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(TransportError::Network(msg))) => {
                self.metrics.record(subsystem, command, 0, elapsed);
                return Err(CallError::NetworkError(self.credentials.redact(&msg)));
            }
            Ok(Err(TransportError::Timeout)) | Err(_) => {
                self.metrics.record(subsystem, command, 0, elapsed);
                return Err(CallError::Timeout);
            }
        };

        self.metrics.record(subsystem, command, response.status, elapsed);
        tracing::debug!(
            subsystem = %subsystem,
            command,
            status_code = response.status,
            elapsed_ms = elapsed.as_millis() as u64,
            "CHAOS API response"
        );
        self.interpret(response)
    }

    fn interpret(&self, response: RawResponse) -> Result<Value> {
        match response.status {
            401 => return Err(CallError::AuthFailed),
            429 => return Err(CallError::RateLimited),
            200..=299 => {}
            status => {
                // Redact before truncating so a value split by the cut cannot survive.
                let body: String = self
                    .credentials
                    .redact(&response.body)
                    .chars()
                    .take(MAX_ERROR_BODY)
                    .collect();
                return Err(CallError::HttpError { status, body });
            }
        }

        let payload: Value = serde_json::from_str(&response.body)
            .map_err(|e| CallError::Malformed(e.to_string()))?;
        let Some(object) = payload.as_object() else {
            return Err(CallError::Malformed("expected a JSON object".to_string()));
        };

        if let Some(error) = object.get("error") {
            let message = match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Err(CallError::Api {
                message: self.credentials.redact(&message),
            });
        }

        Ok(payload)
    }

    /// Lists the current service ids of `subsystem`.
    pub async fn services(&self, subsystem: Subsystem, budget: &RetryBudget) -> Result<Vec<ServiceId>> {
        let payload = self.call(subsystem, "services", &[], budget).await?;
        Ok(service_ids(&payload))
    }
}

/// Reads the `service` key of a `services` payload, which may hold a list
/// or a single value. A missing key means no services.
pub fn service_ids(payload: &Value) -> Vec<ServiceId> {
    let scalar = |value: &Value| match value {
        Value::String(s) if !s.is_empty() => Some(ServiceId::new(s.as_str())),
        Value::Number(n) => Some(ServiceId::new(n.to_string())),
        _ => None,
    };

    match payload.get("service") {
        Some(Value::Array(items)) => items.iter().filter_map(scalar).collect(),
        Some(value) => scalar(value).into_iter().collect(),
        None => Vec::new(),
    }
}

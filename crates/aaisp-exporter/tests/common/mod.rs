#![allow(dead_code)]

use aaisp_client::{
    Backoff, ChaosClient, ClientSettings, Credentials, RawResponse, Transport, TransportError,
};
use aaisp_collector::CollectorRegistry;
use aaisp_common::metrics::MetricsSink;
use aaisp_common::shutdown::{self, ShutdownTrigger};
use aaisp_common::types::Tier;
use aaisp_exporter::app;
use aaisp_exporter::config::{CollectorsConfig, TierSchedule};
use aaisp_exporter::scheduler::CollectionManager;
use aaisp_exporter::state::AppState;
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::util::ServiceExt;

pub type Reply = Result<RawResponse, TransportError>;

/// Fake CHAOS API answering by command, optionally narrowed to one service.
#[derive(Default)]
pub struct StubApi {
    routes: Mutex<HashMap<(String, Option<String>), Reply>>,
    delays: HashMap<String, Duration>,
    calls: AtomicUsize,
}

impl StubApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, command: &str, service: Option<&str>, reply: Reply) -> Self {
        self.set(command, service, reply);
        self
    }

    /// Replaces a route while the API is already in use.
    pub fn set(&self, command: &str, service: Option<&str>, reply: Reply) {
        self.routes
            .lock()
            .unwrap()
            .insert((command.to_string(), service.map(str::to_string)), reply);
    }

    pub fn json(self, command: &str, service: Option<&str>, body: Value) -> Self {
        self.reply(command, service, Ok(RawResponse::new(200, body.to_string())))
    }

    pub fn status(self, command: &str, status: u16) -> Self {
        self.reply(command, None, Ok(RawResponse::new(status, "")))
    }

    pub fn services(self, ids: &[&str]) -> Self {
        self.json("services", None, json!({ "service": ids }))
    }

    pub fn delay(mut self, command: &str, delay: Duration) -> Self {
        self.delays.insert(command.to_string(), delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for StubApi {
    async fn post(&self, url: &str, form: &[(String, String)]) -> Reply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // {base}/{subsystem}/{command}/json
        let command = url.rsplit('/').nth(1).unwrap_or_default().to_string();
        if let Some(delay) = self.delays.get(&command) {
            tokio::time::sleep(*delay).await;
        }
        let service = form
            .iter()
            .find(|(k, _)| k == "service")
            .map(|(_, v)| v.clone());

        let routes = self.routes.lock().unwrap();
        routes
            .get(&(command.clone(), service))
            .or_else(|| routes.get(&(command, None)))
            .cloned()
            .unwrap_or_else(|| Ok(RawResponse::new(404, "not found")))
    }
}

pub const SERVICE: &str = "0123456789";

pub fn quota_api() -> StubApi {
    StubApi::new().services(&[SERVICE]).json(
        "quota",
        None,
        json!({"total": 500_000_000_000u64, "used": 100_000_000_000u64}),
    )
}

pub fn only_quota() -> CollectorsConfig {
    CollectorsConfig {
        broadband_quota: true,
        broadband_line_info: false,
        broadband_usage: false,
        telephony_call_stats: false,
        telephony_ratecard: false,
    }
}

pub fn schedule(interval: Duration, deadline: Duration) -> TierSchedule {
    TierSchedule { interval, deadline }
}

pub fn schedules(interval: Duration) -> BTreeMap<Tier, TierSchedule> {
    Tier::ALL
        .into_iter()
        .map(|tier| (tier, schedule(interval, interval)))
        .collect()
}

pub struct Harness {
    pub api: Arc<StubApi>,
    pub sink: Arc<MetricsSink>,
    pub client: Arc<ChaosClient>,
    pub registry: Arc<CollectorRegistry>,
    pub manager: Arc<CollectionManager>,
    pub trigger: ShutdownTrigger,
}

pub struct HarnessOptions {
    pub collectors: CollectorsConfig,
    pub schedules: BTreeMap<Tier, TierSchedule>,
    pub concurrency_limit: usize,
    pub max_retries: u32,
    pub timeout: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            collectors: only_quota(),
            schedules: schedules(Duration::from_secs(60)),
            concurrency_limit: 5,
            max_retries: 1,
            timeout: Duration::from_secs(5),
        }
    }
}

pub fn harness(api: StubApi, options: HarnessOptions) -> Harness {
    let registry =
        aaisp_exporter::build_registry(&options.collectors).expect("registry should build");
    harness_with_registry(api, options, registry)
}

/// Like [`harness`] but schedules `registry` instead of the configured builtins.
pub fn harness_with_registry(
    api: StubApi,
    options: HarnessOptions,
    registry: CollectorRegistry,
) -> Harness {
    let api = Arc::new(api);
    let sink = Arc::new(MetricsSink::new());
    app::register_exporter_metrics(&sink).expect("exporter metrics should register");
    let (trigger, shutdown) = shutdown::channel();

    let client = Arc::new(
        ChaosClient::new(
            api.clone(),
            Credentials::control_login("me@a.1", "s3cret-password"),
            ClientSettings {
                base_url: "http://chaos.test".to_string(),
                timeout: options.timeout,
                max_retries: options.max_retries,
                concurrency_limit: options.concurrency_limit,
                backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
            },
            &sink,
            shutdown.clone(),
        )
        .expect("client should build"),
    );

    let registry = Arc::new(registry);
    registry
        .describe_metrics(&sink)
        .expect("collector metrics should describe");

    let manager = Arc::new(
        CollectionManager::new(
            registry.clone(),
            client.clone(),
            sink.clone(),
            options.schedules,
            shutdown,
        )
        .expect("manager should build"),
    );

    Harness {
        api,
        sink,
        client,
        registry,
        manager,
        trigger,
    }
}

impl Harness {
    pub fn app(&self) -> axum::Router {
        let state = AppState::new(
            self.sink.clone(),
            self.manager.status_board(),
            self.registry.clone(),
        );
        app::build_http_app(state)
    }
}

pub async fn get(app: &axum::Router, uri: &str) -> (StatusCode, Option<String>, String) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("request should build");
    let resp = app
        .clone()
        .oneshot(req)
        .await
        .expect("request should be handled");
    let status = resp.status();
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());
    let bytes = to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body should read");
    (status, content_type, String::from_utf8_lossy(&bytes).to_string())
}

pub async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let (status, _, body) = get(app, uri).await;
    let json = serde_json::from_str(&body).expect("body should be JSON");
    (status, json)
}

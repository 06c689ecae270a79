mod common;

use aaisp_client::RawResponse;
use aaisp_collector::{
    CollectContext, CollectionOutcome, Collector, CollectorDescriptor, CollectorRegistryBuilder, Scope,
};
use aaisp_common::types::{MetricDesc, ServiceId, Tier};
use aaisp_exporter::config::CollectorsConfig;
use aaisp_exporter::scheduler::CycleState;
use aaisp_exporter::status::CycleOutcome;
use async_trait::async_trait;
use common::{
    harness, harness_with_registry, only_quota, quota_api, schedule, schedules, HarnessOptions, StubApi,
    SERVICE,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const TOTAL: &str = "aaisp_broadband_quota_total_bytes";
const USED: &str = "aaisp_broadband_quota_used_bytes";
const REMAINING: &str = "aaisp_broadband_quota_remaining_bytes";

#[tokio::test]
async fn fast_tier_publishes_quota_and_advances_last_success() {
    let h = harness(
        quota_api(),
        HarnessOptions {
            schedules: schedules(Duration::from_secs(1)),
            ..Default::default()
        },
    );
    let board = h.manager.status_board();
    let mut tiers = h.manager.start();

    let first = timeout(Duration::from_secs(5), board.wait_for_cycles(Tier::Fast, 1))
        .await
        .expect("first cycle should finish")
        .expect("fast tier should be scheduled");
    let third = timeout(Duration::from_secs(5), board.wait_for_cycles(Tier::Fast, 3))
        .await
        .expect("third cycle should finish")
        .expect("fast tier should be scheduled");

    assert_eq!(first.last_outcome, Some(CycleOutcome::Succeeded));
    assert!(third.successful_cycles >= 3);
    assert!(third.last_success_end > first.last_success_end);

    assert_eq!(h.sink.sample(TOTAL, &[("service", SERVICE)]), Some(500_000_000_000.0));
    assert_eq!(h.sink.sample(USED, &[("service", SERVICE)]), Some(100_000_000_000.0));
    assert_eq!(h.sink.sample(REMAINING, &[("service", SERVICE)]), None);
    assert!(h
        .sink
        .sample("aaisp_collection_last_success_timestamp_seconds", &[("tier", "fast")])
        .is_some());

    // Idle tiers never get a loop.
    assert_eq!(board.get(Tier::Slow).map(|s| s.cycles_completed), Some(0));

    h.trigger.trigger();
    timeout(Duration::from_secs(2), async {
        while let Some(joined) = tiers.join_next().await {
            joined.expect("tier loop should not panic");
        }
    })
    .await
    .expect("tier loops should stop on shutdown");
}

#[tokio::test]
async fn rate_limited_upstream_fails_the_cycle_and_keeps_last_values() {
    let h = harness(quota_api(), HarnessOptions::default());
    let mut state = CycleState::new();

    let report = h.manager.run_cycle(Tier::Fast, &mut state).await;
    assert_eq!(report.outcome, CycleOutcome::Succeeded);
    let success_at = h
        .sink
        .sample("aaisp_collection_last_success_timestamp_seconds", &[("tier", "fast")]);
    assert!(success_at.is_some());

    h.api.set("services", None, Ok(RawResponse::new(429, "")));
    h.api.set("quota", None, Ok(RawResponse::new(429, "")));
    let report = h.manager.run_cycle(Tier::Fast, &mut state).await;

    assert_eq!(report.outcome, CycleOutcome::Failed);
    assert_eq!(report.units_failed, 1);
    assert_eq!(state.consecutive_failures, 1);
    // Previously collected values are still served, not cleared.
    assert_eq!(h.sink.sample(TOTAL, &[("service", SERVICE)]), Some(500_000_000_000.0));
    assert_eq!(h.sink.sample(USED, &[("service", SERVICE)]), Some(100_000_000_000.0));
    assert_eq!(h.sink.series_count(TOTAL), 1);
    assert_eq!(
        h.sink.sample(
            "aaisp_collection_errors_total",
            &[("tier", "fast"), ("collector", "broadband_quota"), ("error_type", "rate_limited")]
        ),
        Some(1.0)
    );
    assert_eq!(
        h.sink.sample("aaisp_collection_consecutive_failures", &[("tier", "fast")]),
        Some(1.0)
    );
    assert_eq!(
        h.sink
            .sample("aaisp_collection_last_success_timestamp_seconds", &[("tier", "fast")]),
        success_at
    );

    let report = h.manager.run_cycle(Tier::Fast, &mut state).await;
    assert_eq!(report.outcome, CycleOutcome::Failed);
    assert_eq!(state.consecutive_failures, 2);
    assert_eq!(h.sink.sample(TOTAL, &[("service", SERVICE)]), Some(500_000_000_000.0));
}

#[tokio::test]
async fn rate_limited_first_cycle_publishes_nothing() {
    let h = harness(StubApi::new().status("services", 429).status("quota", 429), HarnessOptions::default());
    let mut state = CycleState::new();

    let report = h.manager.run_cycle(Tier::Fast, &mut state).await;

    assert_eq!(report.outcome, CycleOutcome::Failed);
    assert!(state.last_success_end.is_none());
    assert_eq!(h.sink.series_count(TOTAL), 0);
    assert!(h
        .sink
        .sample("aaisp_collection_last_success_timestamp_seconds", &[("tier", "fast")])
        .is_none());
}

#[tokio::test]
async fn one_malformed_service_does_not_stop_its_siblings() {
    let api = StubApi::new()
        .services(&["svc-a", "svc-b", "svc-c"])
        .json("quota", None, json!({"total": 1000, "used": 250}))
        .json("quota", Some("svc-b"), json!({"total": "lots", "used": 10}));
    let h = harness(api, HarnessOptions::default());
    let mut state = CycleState::new();

    let report = h.manager.run_cycle(Tier::Fast, &mut state).await;

    assert_eq!(report.outcome, CycleOutcome::PartiallyFailed);
    assert_eq!(report.units_total, 3);
    assert_eq!(report.units_ok, 2);
    assert_eq!(report.units_degraded, 1);
    assert_eq!(h.sink.sample(TOTAL, &[("service", "svc-a")]), Some(1000.0));
    assert_eq!(h.sink.sample(TOTAL, &[("service", "svc-c")]), Some(1000.0));
    assert_eq!(h.sink.sample(TOTAL, &[("service", "svc-b")]), None);
    assert_eq!(h.sink.sample(USED, &[("service", "svc-b")]), Some(10.0));
    assert_eq!(
        h.sink.sample(
            "aaisp_collection_errors_total",
            &[("tier", "fast"), ("error_type", "conversion")]
        ),
        Some(1.0)
    );

    // A partial cycle still counts as producing data.
    assert_eq!(state.consecutive_failures, 0);
    assert!(state.last_success_end.is_some());
}

#[tokio::test]
async fn deadline_stops_admitting_new_units() {
    let mut plan = schedules(Duration::from_secs(60));
    plan.insert(
        Tier::Fast,
        schedule(Duration::from_secs(60), Duration::from_millis(150)),
    );
    let api = quota_api()
        .services(&["svc-a", "svc-b", "svc-c"])
        .delay("quota", Duration::from_millis(400));
    let h = harness(
        api,
        HarnessOptions {
            schedules: plan,
            concurrency_limit: 1,
            ..Default::default()
        },
    );
    let mut state = CycleState::new();

    let report = h.manager.run_cycle(Tier::Fast, &mut state).await;

    assert_eq!(report.units_total, 3);
    assert_eq!(report.units_ok, 1);
    assert_eq!(report.units_unadmitted, 2);
    assert_eq!(report.outcome, CycleOutcome::PartiallyFailed);
    assert!(report.duration >= Duration::from_millis(400));
    assert_eq!(
        h.sink.sample(
            "aaisp_collection_errors_total",
            &[("tier", "fast"), ("error_type", "deadline_exceeded")]
        ),
        Some(2.0)
    );
}

#[tokio::test]
async fn units_share_the_client_admission_limit() {
    let ids: Vec<String> = (0..20).map(|i| format!("svc-{i:02}")).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let api = quota_api()
        .services(&id_refs)
        .delay("quota", Duration::from_millis(30));
    let h = harness(api, HarnessOptions::default());
    let mut state = CycleState::new();

    let report = h.manager.run_cycle(Tier::Fast, &mut state).await;

    assert_eq!(report.outcome, CycleOutcome::Succeeded);
    assert_eq!(report.units_ok, 20);
    assert!(h.client.peak_in_flight() <= 5, "peak {}", h.client.peak_in_flight());
    assert!(h.client.peak_in_flight() > 1);
    assert_eq!(h.client.in_flight(), 0);
}

#[tokio::test]
async fn failed_discovery_fails_only_dependent_collectors() {
    let api = StubApi::new().status("services", 500).json(
        "ratecard",
        None,
        json!({"rate_card": {"rates": {"rate": {
            "rate": "UK",
            "peak_ppm": "1.5",
            "offpeak_ppm": "1.0",
            "weekend_ppm": "0.5"
        }}}}),
    );
    let h = harness(
        api,
        HarnessOptions {
            collectors: CollectorsConfig {
                broadband_usage: true,
                telephony_ratecard: true,
                ..only_quota()
            },
            max_retries: 0,
            ..Default::default()
        },
    );
    let mut state = CycleState::new();

    let report = h.manager.run_cycle(Tier::Slow, &mut state).await;

    assert_eq!(report.units_total, 2);
    assert_eq!(report.units_failed, 1);
    assert_eq!(report.units_ok, 1);
    assert_eq!(report.outcome, CycleOutcome::PartiallyFailed);
    assert_eq!(
        h.sink.sample(
            "aaisp_collection_errors_total",
            &[("collector", "broadband_usage"), ("error_type", "http_error")]
        ),
        Some(1.0)
    );
    assert_eq!(
        h.sink
            .sample("aaisp_telephony_rate_ppm", &[("rate_name", "UK"), ("period", "peak")]),
        Some(1.5)
    );
}

#[tokio::test]
async fn overrunning_cycles_are_skipped_not_overlapped() {
    let api = quota_api().delay("quota", Duration::from_millis(700));
    let h = harness(
        api,
        HarnessOptions {
            schedules: schedules(Duration::from_millis(200)),
            ..Default::default()
        },
    );
    let board = h.manager.status_board();
    let mut tiers = h.manager.start();

    let status = timeout(Duration::from_secs(5), board.wait_for_cycles(Tier::Fast, 2))
        .await
        .expect("two cycles should finish")
        .expect("fast tier should be scheduled");

    assert!(status.skipped_cycles >= 1, "{status:?}");
    assert!(h.client.peak_in_flight() <= 1);
    assert!(
        h.sink
            .sample("aaisp_collection_cycles_total", &[("tier", "fast"), ("outcome", "skipped")])
            .unwrap_or_default()
            >= 1.0
    );

    h.trigger.trigger();
    timeout(Duration::from_secs(2), async {
        while tiers.join_next().await.is_some() {}
    })
    .await
    .expect("tier loops should stop on shutdown");
}

#[tokio::test]
async fn due_time_during_an_overrun_waits_for_the_next_aligned_tick() {
    let api = quota_api().delay("quota", Duration::from_millis(700));
    let h = harness(
        api,
        HarnessOptions {
            schedules: schedules(Duration::from_millis(500)),
            ..Default::default()
        },
    );
    let board = h.manager.status_board();
    let mut tiers = h.manager.start();

    let first = timeout(Duration::from_secs(5), board.wait_for_cycles(Tier::Fast, 1))
        .await
        .expect("first cycle should finish")
        .expect("fast tier should be scheduled");
    let second = timeout(Duration::from_secs(5), board.wait_for_cycles(Tier::Fast, 2))
        .await
        .expect("second cycle should finish")
        .expect("fast tier should be scheduled");

    let first_start = first.last_start.expect("first cycle started");
    let first_end = first.last_end.expect("first cycle ended");
    let second_start = second.last_start.expect("second cycle started");
    let idle = (second_start - first_end).to_std().unwrap_or_default();
    let period = (second_start - first_start).to_std().unwrap_or_default();

    assert!(second.skipped_cycles >= 1, "{second:?}");
    // The 500ms due time fell inside the first cycle; the next run is at 1000ms.
    assert!(idle >= Duration::from_millis(200), "idle {idle:?}");
    assert!(period >= Duration::from_millis(900), "period {period:?}");
    assert!(
        h.sink
            .sample("aaisp_collection_cycles_total", &[("tier", "fast"), ("outcome", "skipped")])
            .unwrap_or_default()
            >= 1.0
    );

    h.trigger.trigger();
    timeout(Duration::from_secs(2), async {
        while tiers.join_next().await.is_some() {}
    })
    .await
    .expect("tier loops should stop on shutdown");
}

#[tokio::test]
async fn shutdown_cancels_in_flight_calls() {
    let api = quota_api().delay("quota", Duration::from_secs(30));
    let h = harness(
        api,
        HarnessOptions {
            schedules: schedules(Duration::from_secs(1)),
            timeout: Duration::from_secs(60),
            ..Default::default()
        },
    );
    let mut tiers = h.manager.start();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.client.in_flight(), 1);
    h.trigger.trigger();

    timeout(Duration::from_secs(2), async {
        while let Some(joined) = tiers.join_next().await {
            joined.expect("tier loop should not panic");
        }
    })
    .await
    .expect("shutdown should not wait for the call timeout");
    assert_eq!(h.client.in_flight(), 0);
}

struct ExplodingCollector {
    descriptor: CollectorDescriptor,
}

impl ExplodingCollector {
    fn new() -> Self {
        Self {
            descriptor: CollectorDescriptor {
                name: "exploding",
                tier: Tier::Fast,
                scope: Scope::OncePerCycle,
            },
        }
    }
}

#[async_trait]
impl Collector for ExplodingCollector {
    fn descriptor(&self) -> &CollectorDescriptor {
        &self.descriptor
    }

    fn metrics(&self) -> &'static [MetricDesc] {
        &[]
    }

    async fn collect(&self, _ctx: &CollectContext, _services: &[ServiceId]) -> CollectionOutcome {
        panic!("collector blew up");
    }
}

#[tokio::test]
async fn per_collector_metrics_name_the_collector_that_failed() {
    let mut builder = CollectorRegistryBuilder::new();
    for collector in aaisp_collector::builtin_collectors() {
        let enabled = collector.name() == "broadband_quota";
        builder.register(collector, enabled).expect("builtin names are unique");
    }
    builder
        .register(Arc::new(ExplodingCollector::new()), true)
        .expect("name is unique");
    let h = harness_with_registry(quota_api(), HarnessOptions::default(), builder.build());
    let mut state = CycleState::new();

    let report = h.manager.run_cycle(Tier::Fast, &mut state).await;

    assert_eq!(report.units_total, 2);
    assert_eq!(report.units_ok, 1);
    assert_eq!(report.units_failed, 1);
    assert_eq!(report.outcome, CycleOutcome::PartiallyFailed);
    assert_eq!(
        h.sink.sample(
            "aaisp_collection_errors_total",
            &[("tier", "fast"), ("collector", "exploding"), ("error_type", "panic")]
        ),
        Some(1.0)
    );
    assert_eq!(
        h.sink.sample("aaisp_collection_errors_total", &[("collector", "unknown")]),
        None
    );
    assert!(h
        .sink
        .sample(
            "aaisp_collector_last_success_timestamp_seconds",
            &[("tier", "fast"), ("collector", "broadband_quota")]
        )
        .is_some());
    assert!(h
        .sink
        .sample(
            "aaisp_collector_last_success_timestamp_seconds",
            &[("collector", "exploding")]
        )
        .is_none());

    let (_, _, body) = common::get(&h.app(), "/metrics").await;
    assert!(body.contains(
        "aaisp_collector_duration_seconds_count{collector=\"broadband_quota\",tier=\"fast\"} 1"
    ));
}

//! Collection manager: one independent loop per tier.
//!
//! Each cycle discovers the current service set, fans collection units out
//! over a process-wide worker pool, and folds the unit results into a single
//! [`CycleOutcome`]. Cycles of one tier never overlap; a due time that
//! arrives while a cycle is still running is skipped and counted.

use crate::config::TierSchedule;
use crate::status::{CycleOutcome, StatusBoard, TierStatus};
use aaisp_client::{CallError, ChaosClient, RetryBudget};
use aaisp_collector::{CollectContext, CollectionOutcome, Collector, CollectorRegistry, Scope};
use aaisp_common::metrics::{MetricsSink, SinkError};
use aaisp_common::shutdown::Shutdown;
use aaisp_common::types::{MetricDesc, ServiceId, Subsystem, Tier};
use chrono::{DateTime, Utc};
use prometheus::{CounterVec, GaugeVec, HistogramVec};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{self, JoinSet};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};

pub const CYCLE_DURATION: MetricDesc = MetricDesc::histogram(
    "aaisp_collection_cycle_duration_seconds",
    "Duration of collection cycles",
    &["tier"],
);

pub const COLLECTION_ERRORS: MetricDesc = MetricDesc::counter(
    "aaisp_collection_errors_total",
    "Collection errors by tier, collector and error type",
    &["tier", "collector", "error_type"],
);

pub const LAST_SUCCESS: MetricDesc = MetricDesc::gauge(
    "aaisp_collection_last_success_timestamp_seconds",
    "Unix time of the last cycle that produced data",
    &["tier"],
);

pub const CONSECUTIVE_FAILURES: MetricDesc = MetricDesc::gauge(
    "aaisp_collection_consecutive_failures",
    "Failed cycles in a row",
    &["tier"],
);

pub const CYCLES_TOTAL: MetricDesc = MetricDesc::counter(
    "aaisp_collection_cycles_total",
    "Collection cycles by outcome, including skipped due times",
    &["tier", "outcome"],
);

pub const COLLECTOR_DURATION: MetricDesc = MetricDesc::histogram(
    "aaisp_collector_duration_seconds",
    "Duration of single collection units by collector",
    &["tier", "collector"],
);

pub const COLLECTOR_LAST_SUCCESS: MetricDesc = MetricDesc::gauge(
    "aaisp_collector_last_success_timestamp_seconds",
    "Unix time a collector last finished a unit that produced data",
    &["tier", "collector"],
);

const SKIPPED: &str = "skipped";

/// Lateness of a tick that still counts as on time.
const SKIP_TOLERANCE: Duration = Duration::from_millis(50);

struct SchedulerMetrics {
    duration: HistogramVec,
    errors: CounterVec,
    last_success: GaugeVec,
    consecutive_failures: GaugeVec,
    cycles: CounterVec,
    unit_duration: HistogramVec,
    unit_success: GaugeVec,
}

impl SchedulerMetrics {
    fn new(sink: &MetricsSink) -> Result<Self, SinkError> {
        Ok(Self {
            duration: sink.histogram_vec(&CYCLE_DURATION)?,
            errors: sink.counter_vec(&COLLECTION_ERRORS)?,
            last_success: sink.gauge_vec(&LAST_SUCCESS)?,
            consecutive_failures: sink.gauge_vec(&CONSECUTIVE_FAILURES)?,
            cycles: sink.counter_vec(&CYCLES_TOTAL)?,
            unit_duration: sink.histogram_vec(&COLLECTOR_DURATION)?,
            unit_success: sink.gauge_vec(&COLLECTOR_LAST_SUCCESS)?,
        })
    }

    fn error(&self, tier: Tier, collector: &str, error_type: &str) {
        match self
            .errors
            .get_metric_with_label_values(&[tier.as_str(), collector, error_type])
        {
            Ok(counter) => counter.inc(),
            Err(e) => tracing::warn!(error = %e, "failed to record collection error"),
        }
    }

    fn cycle(&self, tier: Tier, outcome: &str, by: u64) {
        match self
            .cycles
            .get_metric_with_label_values(&[tier.as_str(), outcome])
        {
            Ok(counter) => counter.inc_by(by as f64),
            Err(e) => tracing::warn!(error = %e, "failed to record cycle count"),
        }
    }

    fn unit(&self, tier: Tier, collector: &str, elapsed: Duration, result: UnitResult) {
        let labels = [tier.as_str(), collector];
        match self.unit_duration.get_metric_with_label_values(&labels) {
            Ok(h) => h.observe(elapsed.as_secs_f64()),
            Err(e) => tracing::warn!(error = %e, "failed to record unit duration"),
        }
        if result != UnitResult::Failed {
            match self.unit_success.get_metric_with_label_values(&labels) {
                Ok(g) => g.set(Utc::now().timestamp_millis() as f64 / 1000.0),
                Err(e) => tracing::warn!(error = %e, "failed to record collector success"),
            }
        }
    }

    fn finished(&self, tier: Tier, report: &CycleReport, state: &CycleState) {
        let tier_label = [tier.as_str()];
        match self.duration.get_metric_with_label_values(&tier_label) {
            Ok(h) => h.observe(report.duration.as_secs_f64()),
            Err(e) => tracing::warn!(error = %e, "failed to record cycle duration"),
        }
        match self.consecutive_failures.get_metric_with_label_values(&tier_label) {
            Ok(g) => g.set(f64::from(state.consecutive_failures)),
            Err(e) => tracing::warn!(error = %e, "failed to record consecutive failures"),
        }
        if let Some(end) = state.last_success_end.filter(|_| report.outcome.is_success()) {
            match self.last_success.get_metric_with_label_values(&tier_label) {
                Ok(g) => g.set(end.timestamp_millis() as f64 / 1000.0),
                Err(e) => tracing::warn!(error = %e, "failed to record last success"),
            }
        }
        self.cycle(tier, report.outcome.as_str(), 1);
    }
}

/// Loop-local state of one tier. Only that tier's loop mutates it.
#[derive(Debug, Clone, Default)]
pub struct CycleState {
    pub in_flight: bool,
    pub last_start: Option<DateTime<Utc>>,
    pub last_end: Option<DateTime<Utc>>,
    pub last_success_end: Option<DateTime<Utc>>,
    pub last_outcome: Option<CycleOutcome>,
    pub last_duration: Option<Duration>,
    pub consecutive_failures: u32,
    pub cycles_completed: u64,
    pub successful_cycles: u64,
    pub skipped_cycles: u64,
}

impl CycleState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// How one collection unit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitResult {
    /// No errors.
    Ok,
    /// Field errors only; some data was written.
    Degraded,
    /// The remote call failed.
    Failed,
}

impl UnitResult {
    fn classify(outcome: &CollectionOutcome) -> Self {
        if outcome.has_call_error() {
            UnitResult::Failed
        } else if outcome.is_clean() {
            UnitResult::Ok
        } else {
            UnitResult::Degraded
        }
    }
}

/// Aggregate of one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub tier: Tier,
    pub outcome: CycleOutcome,
    pub units_total: usize,
    pub units_ok: usize,
    pub units_degraded: usize,
    pub units_failed: usize,
    /// Units never started because the deadline passed or shutdown began.
    pub units_unadmitted: usize,
    pub observations: usize,
    pub duration: Duration,
}

impl CycleReport {
    fn new(tier: Tier) -> Self {
        Self {
            tier,
            outcome: CycleOutcome::Succeeded,
            units_total: 0,
            units_ok: 0,
            units_degraded: 0,
            units_failed: 0,
            units_unadmitted: 0,
            observations: 0,
            duration: Duration::ZERO,
        }
    }

    fn count(&mut self, result: UnitResult) {
        match result {
            UnitResult::Ok => self.units_ok += 1,
            UnitResult::Degraded => self.units_degraded += 1,
            UnitResult::Failed => self.units_failed += 1,
        }
    }

    fn settle(&mut self) {
        let troubled = self.units_degraded + self.units_failed + self.units_unadmitted;
        self.outcome = if troubled == 0 {
            CycleOutcome::Succeeded
        } else if self.units_ok + self.units_degraded == 0 {
            CycleOutcome::Failed
        } else {
            CycleOutcome::PartiallyFailed
        };
    }
}

/// Operator hint for discovery failures with a well-known cause.
fn discovery_hint(subsystem: Subsystem, err: &CallError) -> Option<&'static str> {
    match (subsystem, err) {
        (Subsystem::Telephony, CallError::HttpError { status: 500, .. }) => Some(
            "the account appears to have no telephony services; \
             disable telephony_call_stats and telephony_ratecard if none are expected",
        ),
        _ => None,
    }
}

struct Unit {
    collector: Arc<dyn Collector>,
    services: Vec<ServiceId>,
}

pub struct CollectionManager {
    registry: Arc<CollectorRegistry>,
    client: Arc<ChaosClient>,
    sink: Arc<MetricsSink>,
    pool: Arc<Semaphore>,
    schedules: BTreeMap<Tier, TierSchedule>,
    metrics: SchedulerMetrics,
    status: BTreeMap<Tier, watch::Sender<TierStatus>>,
    shutdown: Shutdown,
}

impl CollectionManager {
    pub fn new(
        registry: Arc<CollectorRegistry>,
        client: Arc<ChaosClient>,
        sink: Arc<MetricsSink>,
        schedules: BTreeMap<Tier, TierSchedule>,
        shutdown: Shutdown,
    ) -> Result<Self, SinkError> {
        let metrics = SchedulerMetrics::new(&sink)?;
        let mut status = BTreeMap::new();
        let mut full = BTreeMap::new();
        for tier in Tier::ALL {
            let schedule = schedules.get(&tier).copied().unwrap_or_else(|| {
                let interval = Duration::from_secs(tier.default_interval_secs());
                TierSchedule {
                    interval,
                    deadline: interval,
                }
            });
            let names = registry
                .collectors_for(tier)
                .iter()
                .map(|c| c.name())
                .collect();
            let (tx, _) = watch::channel(TierStatus::new(
                tier,
                schedule.interval.as_secs(),
                names,
            ));
            status.insert(tier, tx);
            full.insert(tier, schedule);
        }

        Ok(Self {
            pool: Arc::new(Semaphore::new(client.concurrency_limit())),
            registry,
            client,
            sink,
            schedules: full,
            metrics,
            status,
            shutdown,
        })
    }

    pub fn status_board(&self) -> StatusBoard {
        let mut board = StatusBoard::default();
        for (tier, tx) in &self.status {
            board.insert(*tier, tx.subscribe());
        }
        board
    }

    pub fn schedule(&self, tier: Tier) -> Option<TierSchedule> {
        self.schedules.get(&tier).copied()
    }

    /// Spawns one loop per tier that has collectors.
    pub fn start(self: &Arc<Self>) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        for (tier, schedule) in &self.schedules {
            if self.registry.collectors_for(*tier).is_empty() {
                tracing::info!(tier = %tier, "no collectors enabled, tier idle");
                continue;
            }
            let manager = Arc::clone(self);
            let (tier, schedule) = (*tier, *schedule);
            tasks.spawn(async move { manager.run_tier(tier, schedule).await });
        }
        tasks
    }

    async fn run_tier(&self, tier: Tier, schedule: TierSchedule) {
        tracing::info!(
            tier = %tier,
            interval_secs = schedule.interval.as_secs_f64(),
            deadline_secs = schedule.deadline.as_secs_f64(),
            collectors = self.registry.collectors_for(tier).len(),
            "tier scheduler started"
        );

        let mut state = CycleState::new();
        let mut ticker = interval(schedule.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown.clone();

        loop {
            let due = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                due = ticker.tick() => due,
            };

            // A due time that passed while the previous cycle ran is skipped,
            // together with any further due times the ticker already dropped.
            let late = Instant::now().saturating_duration_since(due);
            if late > SKIP_TOLERANCE.min(schedule.interval / 2) {
                let skipped = 1 + (late.as_nanos() / schedule.interval.as_nanos().max(1)) as u64;
                state.skipped_cycles += skipped;
                self.metrics.cycle(tier, SKIPPED, skipped);
                self.publish(tier, &state);
                tracing::warn!(
                    tier = %tier,
                    skipped,
                    late_ms = late.as_millis() as u64,
                    "previous cycle overran its interval, skipping due cycle"
                );
                continue;
            }

            self.run_cycle(tier, &mut state).await;
        }

        tracing::info!(tier = %tier, "tier scheduler stopped");
    }

    /// Runs one full cycle of `tier` and records its outcome.
    pub async fn run_cycle(&self, tier: Tier, state: &mut CycleState) -> CycleReport {
        let collectors = self.registry.collectors_for(tier);
        let deadline_after = self
            .schedules
            .get(&tier)
            .map(|s| s.deadline)
            .unwrap_or_else(|| Duration::from_secs(tier.default_interval_secs()));
        let started = Instant::now();
        let deadline = started + deadline_after;

        state.in_flight = true;
        state.last_start = Some(Utc::now());
        self.publish(tier, state);
        tracing::debug!(tier = %tier, collectors = collectors.len(), "cycle started");

        let ctx = CollectContext {
            client: Arc::clone(&self.client),
            sink: Arc::clone(&self.sink),
            budget: RetryBudget::new(),
        };
        let mut report = CycleReport::new(tier);

        let units = self.plan_units(tier, collectors, &ctx, &mut report).await;
        report.units_total += units.len();
        self.execute(tier, units, &ctx, deadline, &mut report).await;

        report.settle();
        report.duration = started.elapsed();

        let now = Utc::now();
        state.in_flight = false;
        state.last_end = Some(now);
        state.last_outcome = Some(report.outcome);
        state.last_duration = Some(report.duration);
        state.cycles_completed += 1;
        if report.outcome.is_success() {
            state.consecutive_failures = 0;
            state.last_success_end = Some(now);
            state.successful_cycles += 1;
        } else {
            state.consecutive_failures += 1;
        }
        self.metrics.finished(tier, &report, state);
        self.publish(tier, state);

        match report.outcome {
            CycleOutcome::Failed => tracing::error!(
                tier = %tier,
                units = report.units_total,
                failed = report.units_failed,
                unadmitted = report.units_unadmitted,
                consecutive_failures = state.consecutive_failures,
                duration_secs = report.duration.as_secs_f64(),
                "collection cycle failed"
            ),
            outcome => tracing::info!(
                tier = %tier,
                outcome = %outcome,
                units = report.units_total,
                ok = report.units_ok,
                degraded = report.units_degraded,
                failed = report.units_failed,
                unadmitted = report.units_unadmitted,
                observations = report.observations,
                duration_secs = report.duration.as_secs_f64(),
                "collection cycle finished"
            ),
        }

        report
    }

    /// Discovers services once per subsystem and expands collectors into
    /// units. A failed discovery counts as one failed unit per collector
    /// that depended on it.
    async fn plan_units(
        &self,
        tier: Tier,
        collectors: &[Arc<dyn Collector>],
        ctx: &CollectContext,
        report: &mut CycleReport,
    ) -> Vec<Unit> {
        let subsystems: BTreeSet<Subsystem> = collectors
            .iter()
            .filter_map(|c| match c.descriptor().scope {
                Scope::PerService(subsystem) => Some(subsystem),
                Scope::OncePerCycle => None,
            })
            .collect();

        let mut discovered: BTreeMap<Subsystem, Vec<ServiceId>> = BTreeMap::new();
        let mut failed: BTreeMap<Subsystem, &'static str> = BTreeMap::new();
        for subsystem in subsystems {
            match self.client.services(subsystem, &ctx.budget).await {
                Ok(services) => {
                    tracing::debug!(
                        tier = %tier,
                        subsystem = %subsystem,
                        count = services.len(),
                        "services discovered"
                    );
                    discovered.insert(subsystem, services);
                }
                Err(err) => {
                    tracing::warn!(
                        tier = %tier,
                        subsystem = %subsystem,
                        error = %err,
                        "service discovery failed"
                    );
                    if let Some(hint) = discovery_hint(subsystem, &err) {
                        tracing::warn!(tier = %tier, subsystem = %subsystem, "{hint}");
                    }
                    failed.insert(subsystem, err.kind());
                }
            }
        }

        let mut units = Vec::new();
        for collector in collectors {
            match collector.descriptor().scope {
                Scope::OncePerCycle => units.push(Unit {
                    collector: Arc::clone(collector),
                    services: Vec::new(),
                }),
                Scope::PerService(subsystem) => {
                    if let Some(kind) = failed.get(&subsystem) {
                        report.units_total += 1;
                        report.count(UnitResult::Failed);
                        self.metrics.error(tier, collector.name(), kind);
                        continue;
                    }
                    for service in discovered.get(&subsystem).into_iter().flatten() {
                        units.push(Unit {
                            collector: Arc::clone(collector),
                            services: vec![service.clone()],
                        });
                    }
                }
            }
        }
        units
    }

    /// Admits units through the shared pool until `deadline`. Admitted units
    /// always run to completion.
    async fn execute(
        &self,
        tier: Tier,
        units: Vec<Unit>,
        ctx: &CollectContext,
        deadline: Instant,
        report: &mut CycleReport,
    ) {
        let mut running = JoinSet::new();
        let mut names: HashMap<task::Id, &'static str> = HashMap::new();
        let mut pending = units.into_iter();
        let mut shutdown = self.shutdown.clone();

        while let Some(unit) = pending.next() {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                _ = sleep_until(deadline) => None,
                permit = Arc::clone(&self.pool).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                let reason = if self.shutdown.is_triggered() {
                    "cancelled"
                } else {
                    "deadline_exceeded"
                };
                let left: Vec<Unit> = std::iter::once(unit).chain(pending.by_ref()).collect();
                tracing::warn!(
                    tier = %tier,
                    unadmitted = left.len(),
                    reason,
                    "cycle stopped admitting units"
                );
                for unit in &left {
                    self.metrics.error(tier, unit.collector.name(), reason);
                }
                report.units_unadmitted += left.len();
                break;
            };

            let ctx = ctx.clone();
            let name = unit.collector.name();
            let handle = running.spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                let outcome = unit.collector.collect(&ctx, &unit.services).await;
                (outcome, started.elapsed())
            });
            names.insert(handle.id(), name);
        }

        while let Some(joined) = running.join_next_with_id().await {
            match joined {
                Ok((id, (outcome, elapsed))) => {
                    let name = names.get(&id).copied().unwrap_or("unknown");
                    for error in &outcome.errors {
                        tracing::debug!(tier = %tier, collector = name, error = %error, "collection error");
                        self.metrics.error(tier, name, error.error_type());
                    }
                    let result = UnitResult::classify(&outcome);
                    self.metrics.unit(tier, name, elapsed, result);
                    report.observations += outcome.observations_written;
                    report.count(result);
                }
                Err(e) => {
                    let name = names.get(&e.id()).copied().unwrap_or("unknown");
                    tracing::error!(tier = %tier, collector = name, error = %e, "collection unit aborted");
                    self.metrics.error(tier, name, "panic");
                    report.count(UnitResult::Failed);
                }
            }
        }
    }

    fn publish(&self, tier: Tier, state: &CycleState) {
        let Some(tx) = self.status.get(&tier) else {
            return;
        };
        tx.send_modify(|status| {
            status.running = state.in_flight;
            status.last_start = state.last_start;
            status.last_end = state.last_end;
            status.last_success_end = state.last_success_end;
            status.last_outcome = state.last_outcome;
            status.last_duration_secs = state.last_duration.map(|d| d.as_secs_f64());
            status.consecutive_failures = state.consecutive_failures;
            status.cycles_completed = state.cycles_completed;
            status.successful_cycles = state.successful_cycles;
            status.skipped_cycles = state.skipped_cycles;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(ok: usize, degraded: usize, failed: usize, unadmitted: usize) -> CycleReport {
        let mut r = CycleReport::new(Tier::Fast);
        r.units_ok = ok;
        r.units_degraded = degraded;
        r.units_failed = failed;
        r.units_unadmitted = unadmitted;
        r.units_total = ok + degraded + failed + unadmitted;
        r.settle();
        r
    }

    #[test]
    fn outcome_follows_unit_results() {
        assert_eq!(report(3, 0, 0, 0).outcome, CycleOutcome::Succeeded);
        assert_eq!(report(0, 0, 0, 0).outcome, CycleOutcome::Succeeded);
        assert_eq!(report(2, 1, 0, 0).outcome, CycleOutcome::PartiallyFailed);
        assert_eq!(report(0, 1, 2, 0).outcome, CycleOutcome::PartiallyFailed);
        assert_eq!(report(1, 0, 0, 4).outcome, CycleOutcome::PartiallyFailed);
        assert_eq!(report(0, 0, 3, 0).outcome, CycleOutcome::Failed);
        assert_eq!(report(0, 0, 1, 2).outcome, CycleOutcome::Failed);
    }

    #[test]
    fn telephony_server_errors_get_a_hint() {
        let server_error = CallError::HttpError {
            status: 500,
            body: String::new(),
        };
        assert!(discovery_hint(Subsystem::Telephony, &server_error)
            .is_some_and(|hint| hint.contains("telephony_call_stats")));
        assert_eq!(discovery_hint(Subsystem::Broadband, &server_error), None);
        assert_eq!(discovery_hint(Subsystem::Telephony, &CallError::RateLimited), None);
    }
}

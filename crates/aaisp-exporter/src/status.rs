//! Read-only view of tier health, published by the tier loops.

use aaisp_common::types::Tier;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Succeeded => "succeeded",
            CycleOutcome::PartiallyFailed => "partially_failed",
            CycleOutcome::Failed => "failed",
        }
    }

    /// At least one unit produced data.
    pub fn is_success(&self) -> bool {
        !matches!(self, CycleOutcome::Failed)
    }
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one tier, replaced wholesale after every state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierStatus {
    pub tier: Tier,
    pub interval_secs: u64,
    pub collectors: Vec<&'static str>,
    pub running: bool,
    pub last_start: Option<DateTime<Utc>>,
    pub last_end: Option<DateTime<Utc>>,
    pub last_success_end: Option<DateTime<Utc>>,
    pub last_outcome: Option<CycleOutcome>,
    pub last_duration_secs: Option<f64>,
    pub consecutive_failures: u32,
    pub cycles_completed: u64,
    pub successful_cycles: u64,
    pub skipped_cycles: u64,
}

impl TierStatus {
    pub fn new(tier: Tier, interval_secs: u64, collectors: Vec<&'static str>) -> Self {
        Self {
            tier,
            interval_secs,
            collectors,
            running: false,
            last_start: None,
            last_end: None,
            last_success_end: None,
            last_outcome: None,
            last_duration_secs: None,
            consecutive_failures: 0,
            cycles_completed: 0,
            successful_cycles: 0,
            skipped_cycles: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Starting,
    Healthy,
    Degraded,
}

/// Receivers for every tier's status channel.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    tiers: BTreeMap<Tier, watch::Receiver<TierStatus>>,
}

impl StatusBoard {
    pub(crate) fn insert(&mut self, tier: Tier, rx: watch::Receiver<TierStatus>) {
        self.tiers.insert(tier, rx);
    }

    pub fn get(&self, tier: Tier) -> Option<TierStatus> {
        self.tiers.get(&tier).map(|rx| rx.borrow().clone())
    }

    pub fn snapshot(&self) -> Vec<TierStatus> {
        self.tiers.values().map(|rx| rx.borrow().clone()).collect()
    }

    /// Waits until `tier` has completed at least `cycles` cycles.
    pub async fn wait_for_cycles(&self, tier: Tier, cycles: u64) -> Option<TierStatus> {
        let mut rx = self.tiers.get(&tier)?.clone();
        let status = rx.wait_for(|s| s.cycles_completed >= cycles).await.ok()?;
        Some(status.clone())
    }

    /// Overall health, and whether every scheduled tier is failing.
    pub fn health(&self) -> (Health, bool) {
        overall(&self.snapshot())
    }
}

/// Tiers without collectors are ignored. A tier counts once it has
/// finished a cycle.
pub fn overall(statuses: &[TierStatus]) -> (Health, bool) {
    let active: Vec<&TierStatus> = statuses.iter().filter(|s| !s.collectors.is_empty()).collect();
    let reported: Vec<CycleOutcome> = active.iter().filter_map(|s| s.last_outcome).collect();

    if reported.is_empty() {
        return (Health::Starting, false);
    }
    let all_failed =
        reported.len() == active.len() && reported.iter().all(|o| *o == CycleOutcome::Failed);
    if reported.contains(&CycleOutcome::Failed) {
        (Health::Degraded, all_failed)
    } else {
        (Health::Healthy, false)
    }
}

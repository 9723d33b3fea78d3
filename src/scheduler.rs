//! Polling scheduler: decides when to check which (target, kind) pair with
//! which credential, runs the fetch → diff → notify → persist pipeline for
//! each dispatch, and keeps per-pair schedule bookkeeping.
//!
//! The tick loop never blocks on a pipeline: dispatch is fire-and-forget and
//! outcomes come back over an mpsc channel, applied at the next tick.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::credentials::{CredentialLease, CredentialOutcome, CredentialPool, PoolError};
use crate::diff::DiffEngine;
use crate::fetcher::{FetchError, SnapshotFetcher};
use crate::health::{HealthEvent, HealthSink};
use crate::notify::{deliver_with_retry, render_event, NotificationDispatcher};
use crate::store::StateStore;
use crate::types::{PairKey, Target};

/// Maximum left-shift applied to a suspended pair's period.
const MAX_BACKOFF_SHIFT: u32 = 6;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Base tick interval `I`; the highest-weight pair re-polls roughly this
    /// often.
    pub tick_interval_secs: u64,
    /// Abandon an in-flight fetch after this long (maps to Unreachable).
    pub fetch_timeout_secs: u64,
    /// Consecutive deferred ticks before a pair escalates to health.
    pub max_deferred_ticks: u32,
    /// Consecutive errors before a pair's period starts backing off.
    pub error_suspend_threshold: u32,
    /// Cap on a suspended pair's effective period.
    pub max_backoff_secs: u64,
    /// Cold-start spacing between pairs, weight-descending.
    pub cold_start_stagger_ms: u64,
    /// Where ScheduleState is persisted at graceful shutdown.
    pub state_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            fetch_timeout_secs: 30,
            max_deferred_ticks: 5,
            error_suspend_threshold: 3,
            max_backoff_secs: 3600,
            cold_start_stagger_ms: 250,
            state_path: None,
        }
    }
}

/// Per-pair bookkeeping, updated after every poll attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairSchedule {
    pub last_poll: Option<DateTime<Utc>>,
    pub next_due: DateTime<Utc>,
    pub consecutive_errors: u32,
    #[serde(skip)]
    pub deferred_ticks: u32,
}

/// Serialized schedule rows for shutdown persistence.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedSchedule {
    pairs: Vec<(PairKey, PairSchedule)>,
}

/// Result of one completed pipeline, reported back asynchronously.
#[derive(Debug)]
pub struct PollOutcome {
    pub pair: PairKey,
    pub result: PollResult,
}

#[derive(Debug)]
pub enum PollResult {
    Accepted { events: usize },
    Failed { error: String },
}

/// Everything a pipeline task needs, shared behind one Arc.
struct PipelineShared {
    pool: Arc<CredentialPool>,
    fetcher: Arc<dyn SnapshotFetcher>,
    store: Arc<dyn StateStore>,
    diff: DiffEngine,
    dispatcher: Arc<dyn NotificationDispatcher>,
    health: HealthSink,
    fetch_timeout: Duration,
}

pub struct Scheduler {
    config: SchedulerConfig,
    targets: HashMap<String, Arc<Target>>,
    /// `tick_interval * max_weight`, so `base / weight` gives each pair its
    /// effective period and the heaviest pair lands on the tick interval.
    base_period_ms: i64,
    entries: HashMap<PairKey, PairSchedule>,
    in_flight: HashSet<PairKey>,
    shared: Arc<PipelineShared>,
    outcome_tx: mpsc::Sender<PollOutcome>,
    outcome_rx: mpsc::Receiver<PollOutcome>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        targets: Vec<Target>,
        pool: Arc<CredentialPool>,
        fetcher: Arc<dyn SnapshotFetcher>,
        store: Arc<dyn StateStore>,
        diff: DiffEngine,
        dispatcher: Arc<dyn NotificationDispatcher>,
        health: HealthSink,
    ) -> Self {
        let max_weight = targets.iter().map(|t| t.weight).max().unwrap_or(1).max(1);
        let base_period_ms = config.tick_interval_secs as i64 * 1000 * max_weight as i64;

        // Cold start: everything is due now, staggered by weight order so the
        // first tick does not burst the whole target list at once.
        let now = Utc::now();
        let mut pairs: Vec<(PairKey, u32)> = targets
            .iter()
            .flat_map(|t| t.pairs().map(move |p| (p, t.weight)))
            .collect();
        pairs.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| a.0.username.cmp(&b.0.username))
                .then_with(|| a.0.kind.rank().cmp(&b.0.kind.rank()))
        });
        let entries = pairs
            .into_iter()
            .enumerate()
            .map(|(i, (pair, _))| {
                let schedule = PairSchedule {
                    last_poll: None,
                    next_due: now
                        + ChronoDuration::milliseconds(i as i64 * config.cold_start_stagger_ms as i64),
                    consecutive_errors: 0,
                    deferred_ticks: 0,
                };
                (pair, schedule)
            })
            .collect();

        let (outcome_tx, outcome_rx) = mpsc::channel(256);
        let targets = targets
            .into_iter()
            .map(|t| (t.username.clone(), Arc::new(t)))
            .collect();
        let fetch_timeout = Duration::from_secs(config.fetch_timeout_secs);

        Self {
            config,
            targets,
            base_period_ms,
            entries,
            in_flight: HashSet::new(),
            shared: Arc::new(PipelineShared {
                pool,
                fetcher,
                store,
                diff,
                dispatcher,
                health,
                fetch_timeout,
            }),
            outcome_tx,
            outcome_rx,
        }
    }

    /// Overlay schedule state persisted by a previous run. Unknown pairs are
    /// dropped; pairs without saved state keep their cold-start slot.
    pub fn restore_state(&mut self) {
        let Some(path) = self.config.state_path.clone() else {
            return;
        };
        let persisted = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<PersistedSchedule>(&contents) {
                Ok(p) => p,
                Err(e) => {
                    warn!("ignoring unreadable schedule state: {}", e);
                    return;
                }
            },
            Err(_) => return,
        };

        let mut restored = 0usize;
        for (pair, schedule) in persisted.pairs {
            if let Some(entry) = self.entries.get_mut(&pair) {
                *entry = schedule;
                restored += 1;
            }
        }
        info!(restored, path = %path.display(), "schedule state restored");
    }

    fn persist_state(&self) -> Result<()> {
        let Some(path) = &self.config.state_path else {
            return Ok(());
        };
        let persisted = PersistedSchedule {
            pairs: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let json = serde_json::to_string_pretty(&persisted)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write schedule state to {}", path.display()))?;
        info!(path = %path.display(), "schedule state persisted");
        Ok(())
    }

    fn weight_of(&self, pair: &PairKey) -> u32 {
        self.targets
            .get(&pair.username)
            .map(|t| t.weight)
            .unwrap_or(1)
    }

    /// Effective re-poll period for a pair: `base_period / weight`, doubled
    /// per error past the suspension threshold, capped.
    fn effective_period(&self, weight: u32, consecutive_errors: u32) -> ChronoDuration {
        let mut ms = self.base_period_ms / weight.max(1) as i64;
        if consecutive_errors >= self.config.error_suspend_threshold {
            let shift = (consecutive_errors - self.config.error_suspend_threshold + 1)
                .min(MAX_BACKOFF_SHIFT);
            let cap = (self.config.max_backoff_secs as i64 * 1000).max(ms);
            ms = ms.saturating_mul(1i64 << shift).min(cap);
        }
        ChronoDuration::milliseconds(ms.max(1000))
    }

    /// Due pairs, ordered weight-descending, then longest-overdue, then the
    /// per-cycle kind order (profile, following, tweets). In-flight pairs are
    /// never re-dispatched.
    pub fn due_pairs(&self, now: DateTime<Utc>) -> Vec<PairKey> {
        let mut due: Vec<(&PairKey, &PairSchedule)> = self
            .entries
            .iter()
            .filter(|(pair, schedule)| {
                schedule.next_due <= now && !self.in_flight.contains(*pair)
            })
            .collect();
        due.sort_by(|a, b| {
            self.weight_of(b.0)
                .cmp(&self.weight_of(a.0))
                .then_with(|| a.1.next_due.cmp(&b.1.next_due))
                .then_with(|| a.0.kind.rank().cmp(&b.0.kind.rank()))
                .then_with(|| a.0.username.cmp(&b.0.username))
        });
        due.into_iter().map(|(pair, _)| pair.clone()).collect()
    }

    /// Fold one pipeline outcome back into the schedule. The pair's
    /// `last_poll` always advances, success or failure, so a broken pair
    /// cannot hot-loop.
    pub fn apply_outcome(&mut self, outcome: PollOutcome, now: DateTime<Utc>) {
        self.in_flight.remove(&outcome.pair);
        let weight = self.weight_of(&outcome.pair);
        let threshold = self.config.error_suspend_threshold;
        let Some(entry) = self.entries.get_mut(&outcome.pair) else {
            return;
        };

        match outcome.result {
            PollResult::Accepted { events } => {
                entry.consecutive_errors = 0;
                if events > 0 {
                    info!(pair = %outcome.pair, events, "changes detected");
                } else {
                    debug!(pair = %outcome.pair, "no changes");
                }
            }
            PollResult::Failed { error } => {
                entry.consecutive_errors += 1;
                if entry.consecutive_errors == threshold {
                    warn!(
                        pair = %outcome.pair,
                        errors = entry.consecutive_errors,
                        error = %error,
                        "pair suspended with exponential backoff"
                    );
                } else {
                    debug!(pair = %outcome.pair, error = %error, "poll failed");
                }
            }
        }

        entry.last_poll = Some(now);
        entry.deferred_ticks = 0;
        let errors = entry.consecutive_errors;
        let period = self.effective_period(weight, errors);
        if let Some(entry) = self.entries.get_mut(&outcome.pair) {
            entry.next_due = now + period;
        }
    }

    fn drain_outcomes(&mut self, now: DateTime<Utc>) {
        while let Ok(outcome) = self.outcome_rx.try_recv() {
            self.apply_outcome(outcome, now);
        }
    }

    /// One scheduling decision: dispatch due pairs up to the pool's budget,
    /// defer the surplus.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        self.drain_outcomes(now);

        let due = self.due_pairs(now);
        if due.is_empty() {
            self.shared
                .health
                .record(HealthEvent::CycleCompleted { dispatched: 0 });
            return;
        }

        let budget = self
            .shared
            .pool
            .available()
            .await
            .saturating_sub(self.in_flight.len());

        let mut dispatched = 0usize;
        let mut deferred: Vec<PairKey> = Vec::new();
        let mut exhausted = false;

        for pair in due {
            if exhausted || dispatched >= budget {
                deferred.push(pair);
                continue;
            }
            match self.shared.pool.acquire().await {
                Ok(lease) => {
                    self.dispatch(pair, lease);
                    dispatched += 1;
                }
                Err(PoolError::Exhausted) => {
                    warn!("credential pool exhausted; deferring remaining pairs this tick");
                    self.shared.health.record(HealthEvent::PoolExhausted);
                    exhausted = true;
                    deferred.push(pair);
                }
            }
        }

        self.record_deferrals(&deferred);
        self.shared
            .health
            .record(HealthEvent::CycleCompleted { dispatched });
    }

    fn record_deferrals(&mut self, deferred: &[PairKey]) {
        for pair in deferred {
            let Some(entry) = self.entries.get_mut(pair) else {
                continue;
            };
            entry.deferred_ticks += 1;
            if entry.deferred_ticks > self.config.max_deferred_ticks {
                self.shared.health.record(HealthEvent::PairDeferredTooLong {
                    pair: pair.clone(),
                    ticks: entry.deferred_ticks,
                });
                entry.deferred_ticks = 0;
            }
        }
    }

    fn dispatch(&mut self, pair: PairKey, lease: CredentialLease) {
        let Some(target) = self.targets.get(&pair.username).cloned() else {
            return;
        };
        debug!(pair = %pair, credential = %lease.label, "dispatching poll");
        self.in_flight.insert(pair.clone());
        let shared = Arc::clone(&self.shared);
        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = run_pipeline(&pair, &target, &lease, &shared).await;
            // Send fails only when the scheduler is already gone.
            let _ = outcome_tx.send(PollOutcome { pair, result }).await;
        });
    }

    #[cfg(test)]
    pub fn force_due(&mut self, pair: &PairKey, now: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(pair) {
            entry.next_due = now;
        }
    }

    #[cfg(test)]
    pub fn schedule_of(&self, pair: &PairKey) -> Option<&PairSchedule> {
        self.entries.get(pair)
    }

    /// Drive the tick loop until cancellation, then drain in-flight
    /// pipelines and persist schedule state.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            pairs = self.entries.len(),
            tick_secs = self.config.tick_interval_secs,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }

        info!(
            in_flight = self.in_flight.len(),
            "scheduler stopping; draining in-flight pipelines"
        );
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.fetch_timeout_secs + 5);
        while !self.in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, self.outcome_rx.recv()).await {
                Ok(Some(outcome)) => self.apply_outcome(outcome, Utc::now()),
                _ => {
                    warn!(
                        abandoned = self.in_flight.len(),
                        "drain deadline reached with pipelines still in flight"
                    );
                    break;
                }
            }
        }

        if let Err(e) = self.persist_state() {
            error!("failed to persist schedule state: {}", e);
        }
        info!("scheduler stopped");
    }
}

/// One fetch → diff → notify → persist pipeline. Holds its credential lease
/// for the whole duration and reports the outcome exactly once.
async fn run_pipeline(
    pair: &PairKey,
    target: &Target,
    lease: &CredentialLease,
    shared: &PipelineShared,
) -> PollResult {
    let fetched = match tokio::time::timeout(
        shared.fetch_timeout,
        shared.fetcher.fetch(target, pair.kind, lease),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(FetchError::Unreachable("fetch timed out".to_string())),
    };

    let snapshot = match fetched {
        Ok(snapshot) => snapshot,
        Err(e) => {
            shared.pool.report(lease, e.credential_outcome()).await;
            shared.health.record(HealthEvent::FetchFailure {
                pair: pair.clone(),
                error: e.to_string(),
            });
            // A malformed payload is a no-op poll: nothing accepted, nothing
            // diffed, so the store cannot be corrupted by partial data.
            return PollResult::Failed {
                error: e.to_string(),
            };
        }
    };
    shared.pool.report(lease, CredentialOutcome::Success).await;

    let previous = match shared.store.get(pair).await {
        Ok(previous) => previous,
        Err(e) => {
            error!(pair = %pair, "state read failed: {:#}", e);
            shared.health.record(HealthEvent::FetchFailure {
                pair: pair.clone(),
                error: format!("state read failed: {e}"),
            });
            return PollResult::Failed {
                error: e.to_string(),
            };
        }
    };

    let diff_result = match shared
        .diff
        .diff(pair, previous.as_ref(), &snapshot, Utc::now())
    {
        Ok(result) => result,
        Err(e) => {
            error!(pair = %pair, "diff failed: {:#}", e);
            shared.health.record(HealthEvent::FetchFailure {
                pair: pair.clone(),
                error: format!("diff failed: {e}"),
            });
            return PollResult::Failed {
                error: e.to_string(),
            };
        }
    };

    for event in &diff_result.events {
        let text = render_event(event);
        if let Err(e) = deliver_with_retry(&*shared.dispatcher, target.chat_id, &text).await {
            warn!(pair = %pair, "notification dropped after retry: {}", e);
        }
    }

    if let Err(e) = shared.store.put(pair, &diff_result.accepted).await {
        error!(pair = %pair, "state write failed: {:#}", e);
        shared.health.record(HealthEvent::FetchFailure {
            pair: pair.clone(),
            error: format!("state write failed: {e}"),
        });
        return PollResult::Failed {
            error: e.to_string(),
        };
    }

    PollResult::Accepted {
        events: diff_result.events.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialMaterial;
    use crate::diff::DiffConfig;
    use crate::notify::DeliveryError;
    use crate::store::MemoryStateStore;
    use crate::types::{MonitorKind, ProfileSnapshot, Snapshot};
    use async_trait::async_trait;

    struct StaticFetcher {
        snapshot: Snapshot,
    }

    #[async_trait]
    impl SnapshotFetcher for StaticFetcher {
        async fn fetch(
            &self,
            _target: &Target,
            _kind: MonitorKind,
            _lease: &CredentialLease,
        ) -> Result<Snapshot, FetchError> {
            Ok(self.snapshot.clone())
        }
    }

    struct NullDispatcher;

    #[async_trait]
    impl NotificationDispatcher for NullDispatcher {
        async fn deliver(&self, _chat_id: i64, _text: &str) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn pool(n: usize) -> Arc<CredentialPool> {
        let creds = (0..n)
            .map(|i| CredentialMaterial {
                label: format!("c{i}"),
                auth_token: format!("t{i}"),
                ct0: format!("x{i}"),
            })
            .collect();
        Arc::new(CredentialPool::new(creds, 3, HealthSink::disconnected()))
    }

    fn scheduler(targets: Vec<Target>, credentials: usize) -> Scheduler {
        Scheduler::new(
            SchedulerConfig {
                tick_interval_secs: 60,
                cold_start_stagger_ms: 0,
                ..Default::default()
            },
            targets,
            pool(credentials),
            Arc::new(StaticFetcher {
                snapshot: Snapshot::Profile(ProfileSnapshot::default()),
            }),
            Arc::new(MemoryStateStore::new()),
            DiffEngine::new(DiffConfig::default()),
            Arc::new(NullDispatcher),
            HealthSink::disconnected(),
        )
    }

    fn accepted(pair: &PairKey) -> PollOutcome {
        PollOutcome {
            pair: pair.clone(),
            result: PollResult::Accepted { events: 0 },
        }
    }

    fn failed(pair: &PairKey) -> PollOutcome {
        PollOutcome {
            pair: pair.clone(),
            result: PollResult::Failed {
                error: "boom".into(),
            },
        }
    }

    #[tokio::test]
    async fn test_cold_start_all_pairs_due() {
        let s = scheduler(
            vec![
                Target::new("alice", [MonitorKind::Tweets], 2, 1),
                Target::new("bob", [], 1, 1),
            ],
            2,
        );
        let due = s.due_pairs(Utc::now() + ChronoDuration::seconds(5));
        assert_eq!(due.len(), 3);
        // Weight-descending: alice's pairs first, profile before tweets.
        assert_eq!(due[0], PairKey::new("alice", MonitorKind::Profile));
        assert_eq!(due[1], PairKey::new("alice", MonitorKind::Tweets));
        assert_eq!(due[2], PairKey::new("bob", MonitorKind::Profile));
    }

    #[tokio::test]
    async fn test_failure_advances_schedule_and_counts_errors() {
        let mut s = scheduler(vec![Target::new("alice", [], 1, 1)], 1);
        let pair = PairKey::new("alice", MonitorKind::Profile);
        let now = Utc::now();

        s.apply_outcome(failed(&pair), now);
        let entry = s.schedule_of(&pair).unwrap();
        assert_eq!(entry.consecutive_errors, 1);
        assert_eq!(entry.last_poll, Some(now));
        // Advanced into the future: no hot-looping a broken pair.
        assert!(entry.next_due > now);

        s.apply_outcome(accepted(&pair), now);
        assert_eq!(s.schedule_of(&pair).unwrap().consecutive_errors, 0);
    }

    #[tokio::test]
    async fn test_error_threshold_backs_off_exponentially() {
        let mut s = scheduler(vec![Target::new("alice", [], 1, 1)], 1);
        let pair = PairKey::new("alice", MonitorKind::Profile);
        let now = Utc::now();

        for _ in 0..2 {
            s.apply_outcome(failed(&pair), now);
        }
        let normal_due = s.schedule_of(&pair).unwrap().next_due;

        s.apply_outcome(failed(&pair), now);
        let suspended_due = s.schedule_of(&pair).unwrap().next_due;
        assert!(suspended_due > normal_due);

        // Backoff is capped.
        for _ in 0..20 {
            s.apply_outcome(failed(&pair), now);
        }
        let capped = s.schedule_of(&pair).unwrap().next_due;
        assert!(capped - now <= ChronoDuration::seconds(3600 + 1));
    }

    #[tokio::test]
    async fn test_weighted_pairs_poll_proportionally() {
        // Weights 1 and 4, base tick 60s: the weight-4 pair should come due
        // about four times as often over a long simulated run.
        let mut s = scheduler(
            vec![
                Target::new("heavy", [], 4, 1),
                Target::new("light", [], 1, 1),
            ],
            2,
        );
        let heavy = PairKey::new("heavy", MonitorKind::Profile);
        let light = PairKey::new("light", MonitorKind::Profile);

        let mut now = Utc::now();
        let mut polls: HashMap<PairKey, u32> = HashMap::new();
        for _ in 0..240 {
            now += ChronoDuration::seconds(60);
            for pair in s.due_pairs(now) {
                *polls.entry(pair.clone()).or_default() += 1;
                s.apply_outcome(accepted(&pair), now);
            }
        }

        let heavy_polls = *polls.get(&heavy).unwrap() as f64;
        let light_polls = *polls.get(&light).unwrap() as f64;
        let ratio = heavy_polls / light_polls;
        assert!(
            (3.0..=5.0).contains(&ratio),
            "expected ~4x ratio, got {ratio} ({heavy_polls}/{light_polls})"
        );
    }

    #[tokio::test]
    async fn test_dispatch_bounded_by_credentials() {
        let mut s = scheduler(
            vec![
                Target::new("a", [], 1, 1),
                Target::new("b", [], 1, 1),
                Target::new("c", [], 1, 1),
            ],
            2,
        );
        let now = Utc::now() + ChronoDuration::seconds(5);
        s.tick(now).await;
        // Two credentials, three due pairs: exactly two dispatched.
        assert_eq!(s.in_flight.len(), 2);

        // The deferred pair accumulated a deferral mark.
        let deferred: Vec<_> = s
            .entries
            .values()
            .filter(|e| e.deferred_ticks > 0)
            .collect();
        assert_eq!(deferred.len(), 1);
    }

    #[tokio::test]
    async fn test_long_deferral_escalates_to_health() {
        let (sink, mut rx) = crate::health::health_channel(16);
        let mut s = Scheduler::new(
            SchedulerConfig {
                tick_interval_secs: 60,
                cold_start_stagger_ms: 0,
                max_deferred_ticks: 2,
                ..Default::default()
            },
            vec![Target::new("alice", [], 1, 1)],
            pool(1),
            Arc::new(StaticFetcher {
                snapshot: Snapshot::Profile(ProfileSnapshot::default()),
            }),
            Arc::new(MemoryStateStore::new()),
            DiffEngine::new(DiffConfig::default()),
            Arc::new(NullDispatcher),
            sink,
        );
        let pair = PairKey::new("alice", MonitorKind::Profile);
        let deferred = vec![pair.clone()];

        s.record_deferrals(&deferred);
        s.record_deferrals(&deferred);
        assert!(
            rx.try_recv().is_err(),
            "no escalation within the deferral allowance"
        );

        s.record_deferrals(&deferred);
        assert_eq!(
            rx.try_recv().unwrap(),
            HealthEvent::PairDeferredTooLong {
                pair: pair.clone(),
                ticks: 3
            }
        );
        // The counter resets after escalating, so the warning does not repeat
        // every subsequent tick.
        assert_eq!(s.schedule_of(&pair).unwrap().deferred_ticks, 0);
    }

    #[tokio::test]
    async fn test_in_flight_pair_not_redispatched() {
        let mut s = scheduler(vec![Target::new("a", [], 1, 1)], 3);
        let pair = PairKey::new("a", MonitorKind::Profile);
        let now = Utc::now() + ChronoDuration::seconds(5);

        s.tick(now).await;
        assert!(s.in_flight.contains(&pair));
        assert!(s.due_pairs(now).is_empty());

        // Once the outcome lands the pair is schedulable again.
        s.apply_outcome(accepted(&pair), now);
        assert!(!s.in_flight.contains(&pair));
        s.force_due(&pair, now);
        assert_eq!(s.due_pairs(now), vec![pair]);
    }
}

//! End-to-end pipeline tests: scheduler tick through fetch, diff, notify,
//! and persistence with scripted fetchers and a recording dispatcher.

use async_trait::async_trait;
use birdwatch::credentials::{CredentialLease, CredentialMaterial, CredentialPool};
use birdwatch::diff::{DiffConfig, DiffEngine};
use birdwatch::fetcher::{FetchError, SnapshotFetcher};
use birdwatch::health::HealthSink;
use birdwatch::notify::{DeliveryError, NotificationDispatcher};
use birdwatch::scheduler::{Scheduler, SchedulerConfig};
use birdwatch::store::{MemoryStateStore, StateStore};
use birdwatch::types::{
    FollowingSnapshot, MonitorKind, PairKey, ProfileSnapshot, Snapshot, Target,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// Returns the scripted snapshots in sequence, repeating the last one.
struct ScriptedFetcher {
    script: Vec<Snapshot>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    fn new(script: Vec<Snapshot>) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SnapshotFetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        _target: &Target,
        _kind: MonitorKind,
        _lease: &CredentialLease,
    ) -> Result<Snapshot, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let index = call.min(self.script.len() - 1);
        Ok(self.script[index].clone())
    }
}

#[derive(Default)]
struct RecordingDispatcher {
    messages: Mutex<Vec<(i64, String)>>,
}

impl RecordingDispatcher {
    fn messages(&self) -> Vec<(i64, String)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn deliver(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError> {
        self.messages.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }
}

fn credentials(n: usize) -> Vec<CredentialMaterial> {
    (0..n)
        .map(|i| CredentialMaterial {
            label: format!("cred-{i}"),
            auth_token: format!("token-{i}"),
            ct0: format!("ct0-{i}"),
        })
        .collect()
}

fn profile(bio: &str) -> Snapshot {
    Snapshot::Profile(ProfileSnapshot {
        user_id: "1".into(),
        display_name: "Alice".into(),
        bio: bio.into(),
        avatar_url: "https://img/a.jpg".into(),
        location: "moon".into(),
    })
}

fn following(accounts: &[&str]) -> Snapshot {
    Snapshot::Following(FollowingSnapshot::from_set(
        accounts.iter().map(|a| a.to_string()).collect(),
    ))
}

struct Harness {
    scheduler: Scheduler,
    store: Arc<MemoryStateStore>,
    dispatcher: Arc<RecordingDispatcher>,
}

fn harness(targets: Vec<Target>, fetcher: Arc<dyn SnapshotFetcher>, creds: usize) -> Harness {
    let store = Arc::new(MemoryStateStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = Scheduler::new(
        SchedulerConfig {
            tick_interval_secs: 60,
            cold_start_stagger_ms: 0,
            ..Default::default()
        },
        targets,
        Arc::new(CredentialPool::new(
            credentials(creds),
            3,
            HealthSink::disconnected(),
        )),
        fetcher,
        store.clone() as Arc<dyn StateStore>,
        DiffEngine::new(DiffConfig::default()),
        dispatcher.clone() as Arc<dyn NotificationDispatcher>,
        HealthSink::disconnected(),
    );
    Harness {
        scheduler,
        store,
        dispatcher,
    }
}

/// Drive one poll round: a tick far enough in simulated time to make every
/// pair due again, a pause for the spawned pipelines to finish, and a second
/// tick to fold the outcomes back into the schedule.
async fn poll_round(h: &mut Harness, base: chrono::DateTime<Utc>, round: i64) {
    let t = base + ChronoDuration::seconds(round * 200);
    h.scheduler.tick(t).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.scheduler.tick(t + ChronoDuration::seconds(61)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_profile_change_produces_one_notification() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![profile("A"), profile("B")]));
    let mut h = harness(vec![Target::new("alice", [], 1, 42)], fetcher, 1);
    let base = Utc::now();

    // First poll establishes the baseline; no notification.
    poll_round(&mut h, base, 0).await;
    assert!(h.dispatcher.messages().is_empty());

    // Second poll sees the changed bio.
    poll_round(&mut h, base, 1).await;

    let messages = h.dispatcher.messages();
    let bio_changes: Vec<_> = messages
        .iter()
        .filter(|(_, text)| text.contains("changed bio"))
        .collect();
    assert_eq!(bio_changes.len(), 1);
    assert_eq!(bio_changes[0].0, 42);
    assert!(bio_changes[0].1.contains("old: A"));
    assert!(bio_changes[0].1.contains("new: B"));

    // The store holds the accepted snapshot.
    let pair = PairKey::new("alice", MonitorKind::Profile);
    assert_eq!(h.store.get(&pair).await.unwrap(), Some(profile("B")));
}

#[tokio::test]
async fn test_unchanged_snapshot_is_silent() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![profile("same")]));
    let mut h = harness(vec![Target::new("alice", [], 1, 42)], fetcher, 1);
    let base = Utc::now();

    for round in 0..4 {
        poll_round(&mut h, base, round).await;
    }
    assert!(h.dispatcher.messages().is_empty());
}

#[tokio::test]
async fn test_following_removal_is_debounced_across_polls() {
    // "bob" vanishes from the listing twice in a row; only the second
    // absence produces the unfollow notification.
    let fetcher = Arc::new(ScriptedFetcher::new(vec![
        following(&["bob", "carol"]),
        following(&["carol"]),
        following(&["carol"]),
    ]));
    let target = Target {
        username: "alice".into(),
        kinds: [MonitorKind::Following].into_iter().collect(),
        weight: 1,
        chat_id: 7,
    };
    let mut h = harness(vec![target], fetcher, 1);
    let base = Utc::now();

    poll_round(&mut h, base, 0).await;
    poll_round(&mut h, base, 1).await;
    assert!(
        h.dispatcher.messages().is_empty(),
        "first absence must not notify"
    );

    poll_round(&mut h, base, 2).await;
    let messages = h.dispatcher.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].1, "@alice unfollowed @bob");
}

#[tokio::test]
async fn test_failed_fetch_sends_nothing_and_keeps_state() {
    struct FailingFetcher;

    #[async_trait]
    impl SnapshotFetcher for FailingFetcher {
        async fn fetch(
            &self,
            _target: &Target,
            _kind: MonitorKind,
            _lease: &CredentialLease,
        ) -> Result<Snapshot, FetchError> {
            Err(FetchError::MalformedResponse("truncated body".into()))
        }
    }

    let mut h = harness(
        vec![Target::new("alice", [], 1, 42)],
        Arc::new(FailingFetcher),
        1,
    );
    let base = Utc::now();

    poll_round(&mut h, base, 0).await;
    poll_round(&mut h, base, 1).await;

    assert!(h.dispatcher.messages().is_empty());
    let pair = PairKey::new("alice", MonitorKind::Profile);
    assert!(h.store.get(&pair).await.unwrap().is_none());
}

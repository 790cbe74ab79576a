//! End-to-end properties of the sync pipeline, run against stub adapters
//! and an in-memory store: idempotent resync, natural-key dedup across
//! overlapping fetch windows, high-water-mark monotonicity, per-source
//! failure isolation and the all-or-nothing commit.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use pulse_core::normalize::RawTimestamp;
use pulse_core::{
    Event, EventStore, NoIdentityResolver, RawCommit, RawFeedEntry, SourceId, SourceOrigin,
    SourceRegistry, StoreError, SyncConfig, SyncStore, TrackedSource, VcsKind,
};
use pulse_daemon::feed::{FeedError, FeedSource};
use pulse_daemon::vcs::{CloneResult, VcsBackend, VcsError};
use pulse_daemon::{Orchestrator, SqliteStore, SyncWorker};

fn dt(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2010, 5, day)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

fn entry(title: &str, day: u32) -> RawFeedEntry {
    RawFeedEntry {
        title: title.to_string(),
        description: format!("{title} body"),
        author_name: "Ada".to_string(),
        timestamp: RawTimestamp::parse(&format!("2010-05-{day:02}T10:00:00+02:00")).unwrap(),
    }
}

fn feed_source(slug: &str) -> TrackedSource {
    TrackedSource {
        id: SourceId::new(),
        web_url: format!("https://example.org/{slug}"),
        slug: slug.to_string(),
        origin: SourceOrigin::Feed {
            feed_url: format!("https://example.org/{slug}/feed.xml"),
        },
        most_recent_event_time: None,
    }
}

/// Feed stub: scripted batches per URL, with an optional failure set.
#[derive(Default)]
struct StubFeed {
    batches: Mutex<HashMap<String, VecDeque<Vec<RawFeedEntry>>>>,
    failing: Mutex<HashSet<String>>,
}

impl StubFeed {
    fn push(&self, url: &str, entries: Vec<RawFeedEntry>) {
        self.batches
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(entries);
    }

    fn fail(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }
}

#[async_trait]
impl FeedSource for StubFeed {
    async fn fetch_feed(&self, feed_url: &str) -> Result<Vec<RawFeedEntry>, FeedError> {
        if self.failing.lock().unwrap().contains(feed_url) {
            return Err(FeedError::Http("connection refused".to_string()));
        }
        Ok(self
            .batches
            .lock()
            .unwrap()
            .get_mut(feed_url)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default())
    }
}

/// VCS stub: a fixed set of commits, no subprocesses.
#[derive(Default)]
struct StubVcs {
    commits: Vec<RawCommit>,
}

#[async_trait]
impl VcsBackend for StubVcs {
    async fn sync_repository(
        &self,
        _vcs: VcsKind,
        _clone_url: &str,
        local_path: &Path,
    ) -> Result<CloneResult, VcsError> {
        let fresh = !local_path.is_dir();
        std::fs::create_dir_all(local_path)?;
        Ok(CloneResult { fresh })
    }

    async fn extract_recent_commits(
        &self,
        _vcs: VcsKind,
        _local_path: &Path,
    ) -> Result<Vec<RawCommit>, VcsError> {
        Ok(self.commits.clone())
    }
}

/// Store wrapper that fails the commit step, after reads succeeded.
struct FailingCommitStore {
    inner: Arc<SqliteStore>,
}

impl SourceRegistry for FailingCommitStore {
    fn list_due_sources(&self) -> Result<Vec<TrackedSource>, StoreError> {
        self.inner.list_due_sources()
    }

    fn get_source(&self, id: SourceId) -> Result<Option<TrackedSource>, StoreError> {
        self.inner.get_source(id)
    }

    fn register_source(&self, source: &TrackedSource) -> Result<(), StoreError> {
        self.inner.register_source(source)
    }

    fn update_high_water_mark(
        &self,
        id: SourceId,
        mark: NaiveDateTime,
    ) -> Result<(), StoreError> {
        self.inner.update_high_water_mark(id, mark)
    }
}

impl EventStore for FailingCommitStore {
    fn append_events(&self, source_id: SourceId, events: &[Event]) -> Result<usize, StoreError> {
        self.inner.append_events(source_id, events)
    }

    fn natural_keys(&self, source_id: SourceId) -> Result<HashSet<String>, StoreError> {
        self.inner.natural_keys(source_id)
    }

    fn events_for_source(&self, source_id: SourceId) -> Result<Vec<Event>, StoreError> {
        self.inner.events_for_source(source_id)
    }
}

impl SyncStore for FailingCommitStore {
    fn commit_sync(
        &self,
        _source_id: SourceId,
        _events: &[Event],
        _mark: Option<NaiveDateTime>,
    ) -> Result<usize, StoreError> {
        Err(StoreError::Database("injected commit failure".to_string()))
    }
}

fn orchestrator_with(
    store: Arc<dyn SyncStore>,
    vcs: Arc<dyn VcsBackend>,
    feed: Arc<dyn FeedSource>,
    clones_root: &Path,
) -> Orchestrator {
    let mut config = SyncConfig::default();
    config.clones_root = clones_root.to_path_buf();
    Orchestrator::new(config, store, Arc::new(NoIdentityResolver), vcs, feed)
}

fn feed_orchestrator(store: Arc<dyn SyncStore>, feed: Arc<StubFeed>) -> Orchestrator {
    let clones = tempfile::tempdir().unwrap();
    orchestrator_with(store, Arc::new(StubVcs::default()), feed, clones.path())
}

#[tokio::test]
async fn unchanged_upstream_resync_is_a_no_op() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let source = feed_source("proj");
    store.register_source(&source).unwrap();
    let url = "https://example.org/proj/feed.xml";

    let feed = Arc::new(StubFeed::default());
    feed.push(url, vec![entry("First", 1), entry("Second", 2)]);
    feed.push(url, vec![entry("First", 1), entry("Second", 2)]);

    let orchestrator = feed_orchestrator(store.clone(), feed);

    let first = orchestrator.sync_source(&source).await.unwrap();
    assert_eq!(first.inserted, 2);

    let source = store.get_source(source.id).unwrap().unwrap();
    assert_eq!(source.most_recent_event_time, Some(dt(2, 8)));

    let second = orchestrator.sync_source(&source).await.unwrap();
    assert_eq!(second.fetched, 2);
    assert_eq!(second.inserted, 0);

    let reloaded = store.get_source(source.id).unwrap().unwrap();
    assert_eq!(reloaded.most_recent_event_time, Some(dt(2, 8)));
    assert_eq!(store.events_for_source(source.id).unwrap().len(), 2);
}

#[tokio::test]
async fn overlapping_fetch_windows_insert_only_unseen_entries() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let source = feed_source("proj");
    store.register_source(&source).unwrap();
    let url = "https://example.org/proj/feed.xml";

    let feed = Arc::new(StubFeed::default());
    feed.push(url, vec![entry("First", 1), entry("Second", 2)]);
    feed.push(url, vec![entry("Second", 2), entry("Third", 3)]);

    let orchestrator = feed_orchestrator(store.clone(), feed);

    assert_eq!(orchestrator.sync_source(&source).await.unwrap().inserted, 2);
    let source = store.get_source(source.id).unwrap().unwrap();
    assert_eq!(orchestrator.sync_source(&source).await.unwrap().inserted, 1);

    let events = store.events_for_source(source.id).unwrap();
    assert_eq!(events.len(), 3);

    let keys = store.natural_keys(source.id).unwrap();
    assert_eq!(keys.len(), 3, "no two stored events share a natural key");
}

#[tokio::test]
async fn high_water_mark_never_decreases() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let source = feed_source("proj");
    store.register_source(&source).unwrap();
    let url = "https://example.org/proj/feed.xml";

    let feed = Arc::new(StubFeed::default());
    feed.push(url, vec![entry("Newest", 4)]);
    // A later run surfacing only older, unseen entries.
    feed.push(url, vec![entry("Backfill", 1)]);

    let orchestrator = feed_orchestrator(store.clone(), feed);

    orchestrator.sync_source(&source).await.unwrap();
    let source = store.get_source(source.id).unwrap().unwrap();
    assert_eq!(source.most_recent_event_time, Some(dt(4, 8)));

    let outcome = orchestrator.sync_source(&source).await.unwrap();
    assert_eq!(outcome.inserted, 1, "older unseen entry is still an event");

    let reloaded = store.get_source(source.id).unwrap().unwrap();
    assert_eq!(
        reloaded.most_recent_event_time,
        Some(dt(4, 8)),
        "mark must not move backward"
    );
}

#[tokio::test]
async fn one_failing_source_does_not_abort_the_batch() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let first = feed_source("alpha");
    let second = feed_source("beta");
    let third = feed_source("gamma");
    for source in [&first, &second, &third] {
        store.register_source(source).unwrap();
    }

    let feed = Arc::new(StubFeed::default());
    feed.push("https://example.org/alpha/feed.xml", vec![entry("A", 1)]);
    feed.fail("https://example.org/beta/feed.xml");
    feed.push("https://example.org/gamma/feed.xml", vec![entry("C", 3)]);

    let orchestrator = Arc::new(feed_orchestrator(store.clone(), feed));
    let worker = SyncWorker::new(orchestrator, 2, std::time::Duration::from_secs(60));

    let report = worker.run_once().await;
    assert_eq!(report.attempted, 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.inserted, 2);

    assert_eq!(store.events_for_source(first.id).unwrap().len(), 1);
    assert_eq!(store.events_for_source(third.id).unwrap().len(), 1);

    // The failing source keeps its prior state untouched.
    assert!(store.events_for_source(second.id).unwrap().is_empty());
    let beta = store.get_source(second.id).unwrap().unwrap();
    assert_eq!(beta.most_recent_event_time, None);
}

#[tokio::test]
async fn persistence_failure_leaves_no_partial_state() {
    let inner = Arc::new(SqliteStore::open_in_memory().unwrap());
    let source = feed_source("proj");
    inner.register_source(&source).unwrap();
    let url = "https://example.org/proj/feed.xml";

    let feed = Arc::new(StubFeed::default());
    feed.push(url, vec![entry("First", 1)]);

    let failing = Arc::new(FailingCommitStore {
        inner: Arc::clone(&inner),
    });
    let orchestrator = feed_orchestrator(failing, feed);

    let err = orchestrator.sync_source(&source).await.unwrap_err();
    assert!(matches!(
        err,
        pulse_daemon::SyncError::Store(StoreError::Database(_))
    ));

    assert!(inner.events_for_source(source.id).unwrap().is_empty());
    let reloaded = inner.get_source(source.id).unwrap().unwrap();
    assert_eq!(reloaded.most_recent_event_time, None);
}

#[tokio::test]
async fn cloned_sources_normalize_commits_with_diff_payloads() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let source = TrackedSource {
        id: SourceId::new(),
        web_url: "https://example.org/proj".to_string(),
        slug: "proj".to_string(),
        origin: SourceOrigin::Cloned {
            clone_url: "https://example.org/proj.git".to_string(),
            vcs: VcsKind::Git,
            clone_command_override: None,
        },
        most_recent_event_time: None,
    };
    store.register_source(&source).unwrap();

    let vcs = Arc::new(StubVcs {
        commits: vec![RawCommit {
            vcs_id: "deadbeef".to_string(),
            author: "Ada".to_string(),
            message: "Fix bug\n\nLonger description".to_string(),
            timestamp: RawTimestamp::parse("2010-05-01T10:00:00+02:00").unwrap(),
            diff: Some("diff --git a/x b/x\nindex 1..2\n--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n".to_string()),
        }],
    });

    let clones = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator_with(
        store.clone(),
        vcs,
        Arc::new(StubFeed::default()),
        clones.path(),
    );

    let outcome = orchestrator.sync_source(&source).await.unwrap();
    assert_eq!(outcome.inserted, 1);
    assert_eq!(outcome.fresh_clone, Some(true));

    let events = store.events_for_source(source.id).unwrap();
    assert_eq!(events[0].title, "Fix bug");
    assert_eq!(events[0].timestamp, dt(1, 8));
    assert!(!events[0].from_feed);
    match &events[0].payload {
        Some(pulse_core::EventPayload::Diff { text }) => {
            assert!(text.contains("@@ -1 +1 @@"));
            assert!(!text.contains("index 1..2"), "diff noise is formatted away");
        },
        other => panic!("expected a diff payload, got {other:?}"),
    }

    // The second run clones nothing and re-extracts the same commit.
    let vcs_path = clones.path().join("proj");
    assert!(vcs_path.is_dir());
    let source = store.get_source(source.id).unwrap().unwrap();
    let again = orchestrator.sync_source(&source).await.unwrap();
    assert_eq!(again.fresh_clone, Some(false));
    assert_eq!(again.inserted, 0);
}

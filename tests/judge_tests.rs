//! Project judging flow tests
//!
//! `ProjectJudge` against an in-memory store, a scripted executor and a
//! stub commit history, both directly and through the scheduler.

mod common;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use common::{project, BrokenRetrieval, ScriptedExecutor, StaticRetrieval};
use judge_engine::config::{ChunkerConfig, IrregularityConfig, PipelineConfig, SchedulerConfig};
use judge_engine::pipeline::TOO_LARGE_NOTE;
use judge_engine::{
    CodeRetrieval, CommitRecord, EvaluationPipeline, EventDispatcher, EventSink, FileBacklog,
    HistoryError, HistorySource, IrregularityDetector, JobContext, JobProcessor, JobScheduler,
    JobState, JudgeEvent, LocalVerdictStore, MemoryCache, Project, ProjectJudge,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DOCUMENT: &str = "<file path=\"app.py\">print('hi')</file>";

struct StubHistory {
    commits: Option<Vec<CommitRecord>>,
    calls: AtomicUsize,
}

impl StubHistory {
    fn new(commits: Option<Vec<CommitRecord>>) -> Arc<Self> {
        Arc::new(Self {
            commits,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl HistorySource for StubHistory {
    async fn commits(&self, _repo_url: &str) -> Result<Vec<CommitRecord>, HistoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.commits
            .clone()
            .ok_or_else(|| HistoryError::Git("fatal: repository not found".into()))
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<JudgeEvent>>,
}

#[async_trait]
impl EventSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, event: &JudgeEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

fn single_dump_commit() -> CommitRecord {
    CommitRecord {
        hash: "a1b2c3d4e5f6".into(),
        author: "dev".into(),
        timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        message: "initial".into(),
        lines_added: 5000,
        lines_deleted: 0,
        files_changed: 40,
        is_code_commit: true,
    }
}

struct Harness {
    store: Arc<LocalVerdictStore>,
    executor: Arc<ScriptedExecutor>,
    sink: Arc<RecordingSink>,
    judge: ProjectJudge,
}

fn harness(
    ids: &[&str],
    pipeline_config: PipelineConfig,
    history: Option<Arc<StubHistory>>,
) -> Harness {
    let retrieval = Arc::new(StaticRetrieval::new(DOCUMENT));
    harness_with(ScriptedExecutor::new(ids), retrieval, pipeline_config, history)
}

fn harness_with(
    executor: ScriptedExecutor,
    retrieval: Arc<dyn CodeRetrieval>,
    pipeline_config: PipelineConfig,
    history: Option<Arc<StubHistory>>,
) -> Harness {
    let store = Arc::new(LocalVerdictStore::in_memory().unwrap());
    let executor = Arc::new(executor);
    let sink = Arc::new(RecordingSink::default());
    let (events, _handle) = EventDispatcher::start(vec![sink.clone()]);

    let pipeline = EvaluationPipeline::new(
        executor.clone(),
        retrieval,
        Arc::new(MemoryCache::new(Duration::from_secs(60))),
        pipeline_config,
        ChunkerConfig::default(),
    )
    .with_store(store.clone());

    let mut judge = ProjectJudge::new(Arc::new(pipeline), store.clone()).with_events(events);
    if let Some(history) = history {
        judge = judge.with_history(history, IrregularityDetector::new(IrregularityConfig::default()));
    }
    Harness {
        store,
        executor,
        sink,
        judge,
    }
}

fn fast() -> PipelineConfig {
    PipelineConfig {
        dimension_backoff_ms: 1,
        ..Default::default()
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn test_judged_project_is_persisted_with_irregularities() {
    let h = harness(
        &["c1", "c2"],
        fast(),
        Some(StubHistory::new(Some(vec![single_dump_commit()]))),
    );
    let p = project("100", &["c1", "c2"]);

    let result = h.judge.process(JobContext::detached(p)).await.unwrap();
    assert_eq!(result["status"], "judged");
    assert_eq!(result["risk_score"], 65);

    let stored = h.store.get("100", "c2").unwrap().unwrap();
    assert!(stored.ai_judged);
    assert_eq!(stored.risk_score, Some(65));
    assert!(stored
        .irregularity_summary
        .unwrap()
        .contains("Overall Risk Score: 65/100"));
    let verdict = stored.verdict.unwrap();
    assert!(verdict.irregularities.is_some());
    assert_eq!(h.store.judged_count().unwrap(), 2);

    settle().await;
    let events = h.sink.events.lock().clone();
    assert!(events.iter().any(|e| matches!(
        e,
        JudgeEvent::ProjectJudged { project_id, risk_score: Some(65), .. } if project_id == "100"
    )));
}

#[tokio::test]
async fn test_history_failure_does_not_block_judging() {
    let h = harness(&["c1"], fast(), Some(StubHistory::new(None)));
    let p = project("101", &["c1"]);

    let result = h.judge.process(JobContext::detached(p)).await.unwrap();
    assert_eq!(result["status"], "judged");
    assert!(result["risk_score"].is_null());
    let stored = h.store.get("101", "c1").unwrap().unwrap();
    assert!(stored.verdict.unwrap().irregularities.is_none());
}

#[tokio::test]
async fn test_invalid_project_gets_review_note() {
    let h = harness(&["c1"], fast(), None);
    let mut p = project("102", &["c1"]);
    p.name = "  ".into();
    p.description = String::new();

    let result = h.judge.process(JobContext::detached(p)).await.unwrap();
    assert_eq!(result["status"], "invalid");
    assert_eq!(h.executor.calls(), 0);

    let stored = h.store.get("102", "c1").unwrap().unwrap();
    assert!(!stored.ai_judged);
    assert_eq!(stored.review_note.as_deref(), Some("name: must not be empty"));

    settle().await;
    assert!(h
        .sink
        .events
        .lock()
        .iter()
        .any(|e| matches!(e, JudgeEvent::NeedsManualReview { .. })));
}

#[tokio::test]
async fn test_too_large_project_is_flagged_not_failed() {
    let config = PipelineConfig {
        max_input_tokens: 4,
        ..fast()
    };
    let h = harness(&["c1"], config, None);
    let p = project("103", &["c1"]);

    let result = h.judge.process(JobContext::detached(p)).await.unwrap();
    assert_eq!(result["status"], "too_large");
    assert_eq!(h.executor.calls(), 0);

    let stored = h.store.get("103", "c1").unwrap().unwrap();
    assert_eq!(stored.review_note.as_deref(), Some(TOO_LARGE_NOTE));
    assert!(!stored.ai_judged);
}

#[tokio::test]
async fn test_unreachable_repository_is_noted_not_retried() {
    let h = harness_with(ScriptedExecutor::new(&["c1"]), Arc::new(BrokenRetrieval), fast(), None);
    let p = project("106", &["c1"]);

    let result = h.judge.process(JobContext::detached(p)).await.unwrap();
    assert_eq!(result["status"], "unavailable");
    assert_eq!(h.executor.calls(), 0);

    let stored = h.store.get("106", "c1").unwrap().unwrap();
    assert!(!stored.ai_judged);
    let note = stored.review_note.unwrap();
    assert!(note.starts_with("Repository could not be retrieved"));
    assert!(note.contains("repository not found"));
}

#[tokio::test]
async fn test_disabled_event_and_judged_projects_are_skipped() {
    let history = StubHistory::new(Some(vec![]));
    let h = harness(&["c1"], fast(), Some(history.clone()));

    let mut disabled = project("104", &["c1"]);
    disabled.hackathon.use_judge_bot = false;
    let result = h.judge.process(JobContext::detached(disabled)).await.unwrap();
    assert_eq!(result["status"], "skipped");

    let p = project("105", &["c1"]);
    h.judge.process(JobContext::detached(p.clone())).await.unwrap();
    let calls = h.executor.calls();
    let again = h.judge.process(JobContext::detached(p)).await.unwrap();
    assert_eq!(again["status"], "already_judged");
    assert_eq!(h.executor.calls(), calls);
    // History is only read for the run that judged it
    assert_eq!(history.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_backlog_to_verdicts_through_scheduler() {
    let h = harness(&["c1"], fast(), None);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backlog.json");
    let projects: Vec<Project> = vec![project("200", &["c1"]), project("201", &["c1"])];
    std::fs::write(&path, serde_json::to_string(&projects).unwrap()).unwrap();

    let backlog = FileBacklog::new(&path).with_store(h.store.clone());
    let scheduler = JobScheduler::builder(SchedulerConfig::default(), Arc::new(h.judge))
        .backlog(Arc::new(backlog))
        .build();
    scheduler.start().await;

    for _ in 0..500 {
        if scheduler.stats().completed == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    scheduler.stop().await;

    assert_eq!(scheduler.stats().completed, 2);
    assert_eq!(h.store.judged_count().unwrap(), 2);
    for job in scheduler.jobs() {
        assert_eq!(job.result.unwrap()["status"], "judged");
    }
}

#[tokio::test]
async fn test_too_large_project_is_bundled_once_through_scheduler() {
    let retrieval = Arc::new(StaticRetrieval::new(DOCUMENT));
    let config = PipelineConfig {
        max_input_tokens: 4,
        ..fast()
    };
    let h = harness_with(ScriptedExecutor::new(&["c1"]), retrieval.clone(), config, None);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backlog.json");
    std::fs::write(&path, serde_json::to_string(&vec![project("300", &["c1"])]).unwrap()).unwrap();

    let backlog = FileBacklog::new(&path).with_store(h.store.clone());
    let scheduler = JobScheduler::builder(SchedulerConfig::default(), Arc::new(h.judge))
        .backlog(Arc::new(backlog))
        .build();
    scheduler.start().await;

    for _ in 0..500 {
        if scheduler.stats().completed >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Each completion triggers a refill; the noted project must not come back
    for _ in 0..5 {
        scheduler.trigger_refill();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    scheduler.stop().await;

    assert_eq!(retrieval.calls(), 1);
    let stats = scheduler.stats();
    assert_eq!((stats.total, stats.completed), (1, 1));
    assert_eq!(scheduler.jobs()[0].result.clone().unwrap()["status"], "too_large");
    let stored = h.store.get("300", "c1").unwrap().unwrap();
    assert_eq!(stored.review_note.as_deref(), Some(TOO_LARGE_NOTE));
}

#[tokio::test(start_paused = true)]
async fn test_lost_lease_leaves_note_and_no_verdict() {
    let executor = ScriptedExecutor::new(&["c1"]).with_delay(Duration::from_secs(30));
    let h = harness_with(executor, Arc::new(StaticRetrieval::new(DOCUMENT)), fast(), None);
    let config = SchedulerConfig {
        max_attempts: 1,
        lease_secs: 2,
        lease_check_interval_secs: 1,
        ..Default::default()
    };
    let scheduler = JobScheduler::builder(config, Arc::new(h.judge)).build();
    let id = scheduler.enqueue(project("400", &["c1"]));
    scheduler.start().await;

    for _ in 0..1_000 {
        if scheduler.stats().failed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let job = scheduler.job(&id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.last_error.as_deref(), Some("lease expired"));

    // The abandoned attempt runs to its checkpoint and stops there
    tokio::time::sleep(Duration::from_secs(1800)).await;
    scheduler.stop().await;

    assert!(h.executor.calls() > 0);
    assert_eq!(h.store.judged_count().unwrap(), 0);
    let stored = h.store.get("400", "c1").unwrap().unwrap();
    assert!(!stored.ai_judged);
    assert!(stored.verdict.is_none());
    assert!(stored
        .review_note
        .unwrap()
        .starts_with("Automated judging gave up after attempt 1: lease expired"));
}

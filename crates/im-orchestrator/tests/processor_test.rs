//! OperationProcessor lifecycle, driven by scripted executors and by the real
//! sync engine over in-memory stubs.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use im_core::config::SyncSettings;
use im_core::types::{IssueData, IssueFields, IssuePage, IssueRecord, NamedRef, ProjectInfo, UserInfo};
use im_orchestrator::{
    GraphError, Operation, OperationConfig, OperationError, OperationEvent, OperationKind,
    OperationProcessor, OperationStatus, ProcessorConfig, Task, TaskContext, TaskError,
    TaskExecutor, TaskOutput, TaskSpec, TaskStatus,
};
use im_source::{SourceClient, SourceError};
use im_sync::git_writer::{FileChange, FileWrite, GitWriteError, RepoState, WriteMode};
use im_sync::{GitWriter, SyncEngine, SyncStateStore};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

// ===========================================================================
// Scripted executor
// ===========================================================================

#[derive(Clone)]
enum Step {
    Fail(&'static str),
    Unreachable,
    /// Run until the task's token fires.
    Hang,
    /// Block until the gate token is cancelled, then succeed.
    Gate(CancellationToken),
}

#[derive(Default)]
struct Scripted {
    steps: HashMap<&'static str, Step>,
    calls: Mutex<Vec<String>>,
}

impl Scripted {
    fn with(steps: Vec<(&'static str, Step)>) -> Arc<Self> {
        Arc::new(Self {
            steps: steps.into_iter().collect(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskExecutor for Scripted {
    async fn execute(&self, spec: &TaskSpec, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        self.calls.lock().unwrap().push(spec.name().to_string());
        match self.steps.get(spec.name()).cloned() {
            Some(Step::Fail(msg)) => return Err(TaskError::Other(msg.to_string())),
            Some(Step::Unreachable) => {
                return Err(SourceError::Connection("connection refused".into()).into())
            }
            Some(Step::Hang) => {
                ctx.cancel.cancelled().await;
                return Err(TaskError::Cancelled);
            }
            Some(Step::Gate(gate)) => gate.cancelled().await,
            None => {}
        }
        Ok(TaskOutput::RepoReady {
            head: Some(spec.name().to_string()),
        })
    }
}

fn processor(executor: Arc<dyn TaskExecutor>) -> (OperationProcessor, Arc<SyncStateStore>) {
    let state = Arc::new(SyncStateStore::in_memory());
    let config = ProcessorConfig {
        wait_poll_interval: Duration::from_millis(5),
        ..ProcessorConfig::default()
    };
    (
        OperationProcessor::with_executor(executor, state.clone(), config),
        state,
    )
}

async fn wait(processor: &OperationProcessor, op: &Operation) -> Operation {
    processor
        .wait_for_completion(op.id, WAIT, &CancellationToken::new())
        .await
        .unwrap()
}

async fn until_running(processor: &OperationProcessor, op: &Operation) {
    for _ in 0..500 {
        if processor.get_operation(op.id).unwrap().status == OperationStatus::Running {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("operation never started");
}

async fn until_summarized(processor: &OperationProcessor, op: &Operation) -> Operation {
    for _ in 0..500 {
        let current = processor.get_operation(op.id).unwrap();
        if current.result_summary.is_some() {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("operation never finalized");
}

fn status_of(op: &Operation, name: &str) -> TaskStatus {
    op.task_by_name(name).unwrap().status
}

// ===========================================================================
// Lifecycle
// ===========================================================================

#[tokio::test]
async fn start_returns_pending_and_runs_to_completion() {
    let executor = Scripted::with(vec![]);
    let (processor, state) = processor(executor.clone());

    let started = processor
        .start_operation(OperationKind::Bootstrap, OperationConfig::new("PROJ"))
        .unwrap();
    assert_eq!(started.status, OperationStatus::Pending);
    assert_eq!(started.tasks.len(), 3);

    let done = wait(&processor, &started).await;
    assert_eq!(done.status, OperationStatus::Completed);
    assert!(done.tasks.iter().all(|t| t.status == TaskStatus::Completed));
    assert_eq!(done.progress.completed_steps, 3);
    assert_eq!(done.progress.total_steps, 3);
    assert!(done.end_time.is_some());
    assert_eq!(done.result_summary.as_ref().unwrap().tasks_completed, 3);

    // BootstrapSync runs last; the other two in priority order.
    assert_eq!(executor.calls(), vec!["InitRepo", "FetchProjectInfo", "BootstrapSync"]);

    let mark = state.watermark("PROJ").unwrap();
    assert_eq!(mark.last_synced_at, started.start_time);
    assert_eq!(mark.last_operation_id, Some(started.id));
}

#[tokio::test]
async fn file_watermark_is_stored_before_completion_is_observed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("sync-state.json");
    let state = Arc::new(SyncStateStore::open(&path).unwrap());
    let processor = OperationProcessor::with_executor(
        Scripted::with(vec![]),
        state.clone(),
        ProcessorConfig {
            wait_poll_interval: Duration::from_millis(5),
            ..ProcessorConfig::default()
        },
    );

    let started = processor
        .start_operation(OperationKind::Reconcile, OperationConfig::new("PROJ"))
        .unwrap();
    let done = wait(&processor, &started).await;
    assert_eq!(done.status, OperationStatus::Completed);

    let reopened = SyncStateStore::open(&path).unwrap();
    let mark = reopened.watermark("PROJ").unwrap();
    assert_eq!(mark.last_synced_at, started.start_time);
    assert_eq!(mark.last_operation_id, Some(started.id));
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_storage() {
    let (processor, _) = processor(Scripted::with(vec![]));

    let err = processor
        .start_operation(OperationKind::Bootstrap, OperationConfig::new(""))
        .unwrap_err();
    assert!(matches!(err, OperationError::InvalidConfig(_)));

    let mut a = Task::new(TaskSpec::IdentifyOrphans);
    let b = Task::new(TaskSpec::RemoveOrphans).depends_on(&a);
    a.dependencies.push(b.id);
    let err = processor
        .start_with_tasks(OperationKind::Cleanup, OperationConfig::new("PROJ"), vec![a, b])
        .unwrap_err();
    assert!(matches!(err, OperationError::Validation(GraphError::Cycle(_))));

    assert!(processor.list_operations(None).is_empty());
}

#[tokio::test]
async fn one_active_operation_per_project() {
    let gate = CancellationToken::new();
    let executor = Scripted::with(vec![("InitRepo", Step::Gate(gate.clone()))]);
    let (processor, _) = processor(executor);

    let first = processor
        .start_operation(OperationKind::Bootstrap, OperationConfig::new("PROJ"))
        .unwrap();
    let err = processor
        .start_operation(OperationKind::Reconcile, OperationConfig::new("PROJ"))
        .unwrap_err();
    match err {
        OperationError::AlreadyActive { project, operation_id } => {
            assert_eq!(project, "PROJ");
            assert_eq!(operation_id, first.id);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(processor.active_operation("PROJ").unwrap().id, first.id);

    // Another project is independent.
    let other = processor
        .start_operation(OperationKind::Cleanup, OperationConfig::new("OTHER"))
        .unwrap();
    assert_eq!(wait(&processor, &other).await.status, OperationStatus::Completed);

    gate.cancel();
    assert_eq!(wait(&processor, &first).await.status, OperationStatus::Completed);
    assert!(processor.active_operation("PROJ").is_none());
    processor
        .start_operation(OperationKind::Reconcile, OperationConfig::new("PROJ"))
        .unwrap();
}

// ===========================================================================
// Cancellation
// ===========================================================================

#[tokio::test]
async fn cancelling_a_running_operation() {
    let executor = Scripted::with(vec![("InitRepo", Step::Hang)]);
    let (processor, state) = processor(executor.clone());
    let op = processor
        .start_operation(OperationKind::Bootstrap, OperationConfig::new("PROJ"))
        .unwrap();
    until_running(&processor, &op).await;

    let cancelled = processor.cancel_operation(op.id).unwrap();
    assert_eq!(cancelled.status, OperationStatus::Cancelled);
    assert!(cancelled.end_time.is_some());
    assert_eq!(status_of(&cancelled, "InitRepo"), TaskStatus::Cancelled);
    assert_eq!(status_of(&cancelled, "BootstrapSync"), TaskStatus::Cancelled);

    let finished = until_summarized(&processor, &op).await;
    assert_eq!(finished.status, OperationStatus::Cancelled);
    assert_eq!(finished.end_time, cancelled.end_time);
    assert!(!executor.calls().contains(&"BootstrapSync".to_string()));
    assert!(state.watermark("PROJ").is_none());

    let err = processor.cancel_operation(op.id).unwrap_err();
    assert!(matches!(
        err,
        OperationError::InvalidState { status: OperationStatus::Cancelled, .. }
    ));
}

#[tokio::test]
async fn pending_and_unknown_operations_cannot_be_cancelled() {
    let (processor, _) = processor(Scripted::with(vec![]));
    let op = processor
        .start_operation(OperationKind::Bootstrap, OperationConfig::new("PROJ"))
        .unwrap();

    // The current-thread runtime has not polled the operation yet.
    let err = processor.cancel_operation(op.id).unwrap_err();
    assert!(matches!(
        err,
        OperationError::InvalidState { status: OperationStatus::Pending, .. }
    ));

    let done = wait(&processor, &op).await;
    assert_eq!(done.status, OperationStatus::Completed);
    let err = processor.cancel_operation(op.id).unwrap_err();
    assert!(matches!(
        err,
        OperationError::InvalidState { status: OperationStatus::Completed, .. }
    ));
    assert_eq!(processor.get_operation(op.id).unwrap(), done);

    let missing = uuid::Uuid::new_v4();
    assert!(matches!(
        processor.cancel_operation(missing),
        Err(OperationError::NotFound(id)) if id == missing
    ));
}

#[tokio::test]
async fn shutdown_cancels_active_operations() {
    let (processor, _) = processor(Scripted::with(vec![("FetchProjectInfo", Step::Hang)]));
    let op = processor
        .start_operation(OperationKind::Bootstrap, OperationConfig::new("PROJ"))
        .unwrap();
    until_running(&processor, &op).await;

    assert_eq!(processor.shutdown(WAIT).await, 1);
    let after = processor.get_operation(op.id).unwrap();
    assert_eq!(after.status, OperationStatus::Cancelled);
    assert!(after.result_summary.is_some());
}

// ===========================================================================
// Failures
// ===========================================================================

#[tokio::test]
async fn failed_dependency_skips_downstream_tasks() {
    let executor = Scripted::with(vec![("FetchProjectInfo", Step::Fail("project lookup failed"))]);
    let (processor, state) = processor(executor.clone());
    let op = processor
        .start_operation(OperationKind::Bootstrap, OperationConfig::new("PROJ"))
        .unwrap();

    let done = wait(&processor, &op).await;
    assert_eq!(done.status, OperationStatus::Failed);
    assert_eq!(
        done.error_message.as_deref(),
        Some("FetchProjectInfo: project lookup failed")
    );
    assert_eq!(status_of(&done, "InitRepo"), TaskStatus::Completed);
    assert_eq!(status_of(&done, "FetchProjectInfo"), TaskStatus::Failed);
    let sync = done.task_by_name("BootstrapSync").unwrap();
    assert_eq!(sync.status, TaskStatus::Failed);
    assert_eq!(sync.error.as_deref(), Some("skipped: dependency failed"));
    assert!(!executor.calls().contains(&"BootstrapSync".to_string()));

    let summary = done.result_summary.unwrap();
    assert_eq!(summary.tasks_completed, 1);
    assert_eq!(summary.tasks_failed, 2);
    assert_eq!(done.progress.completed_steps, 1);
    assert!(state.watermark("PROJ").is_none());
}

#[tokio::test]
async fn unreachable_source_aborts_the_operation() {
    let executor = Scripted::with(vec![
        ("UpdateRepo", Step::Unreachable),
        ("CheckSourceUpdates", Step::Hang),
    ]);
    let (processor, _) = processor(executor.clone());
    let op = processor
        .start_operation(OperationKind::Reconcile, OperationConfig::new("PROJ"))
        .unwrap();

    let done = until_summarized(&processor, &op).await;
    assert_eq!(done.status, OperationStatus::Failed);
    assert!(done.error_message.as_deref().unwrap().starts_with("UpdateRepo: "));
    assert_eq!(status_of(&done, "UpdateRepo"), TaskStatus::Failed);
    assert_eq!(status_of(&done, "CheckSourceUpdates"), TaskStatus::Cancelled);
    let sync = done.task_by_name("SyncUpdatedIssues").unwrap();
    assert_eq!(sync.status, TaskStatus::Cancelled);
    assert_eq!(sync.error.as_deref(), Some("aborted: source unreachable"));
}

// ===========================================================================
// Waiting and retention
// ===========================================================================

#[tokio::test]
async fn wait_times_out_with_the_current_snapshot() {
    let (processor, _) = processor(Scripted::with(vec![("InitRepo", Step::Hang)]));
    let op = processor
        .start_operation(OperationKind::Bootstrap, OperationConfig::new("PROJ"))
        .unwrap();
    until_running(&processor, &op).await;

    let err = processor
        .wait_for_completion(op.id, Duration::from_millis(30), &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        OperationError::Timeout { operation } => {
            assert_eq!(operation.id, op.id);
            assert_eq!(operation.status, OperationStatus::Running);
        }
        other => panic!("unexpected error {other:?}"),
    }

    let stop = CancellationToken::new();
    stop.cancel();
    let err = processor.wait_for_completion(op.id, WAIT, &stop).await.unwrap_err();
    assert!(matches!(err, OperationError::WaitCancelled { .. }));

    processor.shutdown(WAIT).await;
}

#[tokio::test]
async fn cleanup_keeps_unfinished_operations() {
    let gate = CancellationToken::new();
    let executor = Scripted::with(vec![("IdentifyOrphans", Step::Gate(gate.clone()))]);
    let (processor, _) = processor(executor);

    let done = processor
        .start_operation(OperationKind::Bootstrap, OperationConfig::new("DONE"))
        .unwrap();
    wait(&processor, &done).await;
    let running = processor
        .start_operation(OperationKind::Cleanup, OperationConfig::new("BUSY"))
        .unwrap();
    until_running(&processor, &running).await;

    assert_eq!(processor.cleanup_old_operations(1), 0);
    assert_eq!(
        processor.cleanup_older_than(Utc::now() + chrono::Duration::seconds(1)),
        1
    );
    assert!(processor.get_operation(done.id).is_none());
    assert!(processor.get_operation(running.id).is_some());

    let listed = processor.list_operations(Some(OperationStatus::Running));
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, running.id);

    gate.cancel();
    wait(&processor, &running).await;
}

// ===========================================================================
// Events
// ===========================================================================

#[tokio::test]
async fn subscription_streams_until_finished() {
    let (processor, _) = processor(Scripted::with(vec![]));
    let op = processor
        .start_operation(OperationKind::Cleanup, OperationConfig::new("PROJ"))
        .unwrap();
    let rx = processor.subscribe(op.id).unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.recv_async().await {
        events.push(event);
    }

    assert_eq!(
        events.first(),
        Some(&OperationEvent::StatusChanged {
            operation_id: op.id,
            status: OperationStatus::Running,
        })
    );
    assert!(events.iter().any(|e| matches!(
        e,
        OperationEvent::TaskStatusChanged { task_name, status: TaskStatus::Completed, .. }
            if task_name == "RemoveOrphans"
    )));
    let progress: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            OperationEvent::Progress { completed_steps, .. } => Some(*completed_steps),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![1, 2]);
    match events.last() {
        Some(OperationEvent::Finished { status, summary, .. }) => {
            assert_eq!(*status, OperationStatus::Completed);
            assert!(summary.is_some());
        }
        other => panic!("stream did not end with Finished: {other:?}"),
    }

    let late = processor.subscribe(op.id).unwrap();
    assert!(late.recv_async().await.is_err(), "finished operation has a closed stream");
    assert!(matches!(
        processor.subscribe(uuid::Uuid::new_v4()),
        Err(OperationError::NotFound(_))
    ));
}

// ===========================================================================
// End to end over the sync engine
// ===========================================================================

#[derive(Default)]
struct Tracker {
    issues: Vec<IssueRecord>,
    searches: Mutex<Vec<String>>,
}

#[async_trait]
impl SourceClient for Tracker {
    async fn authenticate(&self, _cancel: &CancellationToken) -> Result<(), SourceError> {
        Ok(())
    }

    async fn current_user(&self, _cancel: &CancellationToken) -> Result<UserInfo, SourceError> {
        Ok(UserInfo {
            name: Some("bot".into()),
            display_name: None,
            email_address: None,
        })
    }

    async fn get_project(&self, key: &str, _cancel: &CancellationToken) -> Result<ProjectInfo, SourceError> {
        Ok(ProjectInfo {
            id: "10000".into(),
            key: key.into(),
            name: "Project".into(),
        })
    }

    async fn search_issues(
        &self,
        jql: &str,
        offset: usize,
        page_size: usize,
        _fields: &[&str],
        _cancel: &CancellationToken,
    ) -> Result<IssuePage, SourceError> {
        self.searches.lock().unwrap().push(jql.to_string());
        Ok(IssuePage {
            items: self.issues.iter().skip(offset).take(page_size).cloned().collect(),
            total_count: self.issues.len(),
            page_offset: offset,
            page_size,
        })
    }

    async fn get_issue(
        &self,
        key: &str,
        _fields: &[&str],
        _cancel: &CancellationToken,
    ) -> Result<IssueRecord, SourceError> {
        self.issues
            .iter()
            .find(|i| i.key == key)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(key.to_string()))
    }
}

#[derive(Default)]
struct Repo {
    files: Mutex<BTreeMap<String, String>>,
    /// Writes of this key fail with a disk error.
    broken_key: Option<&'static str>,
}

#[async_trait]
impl GitWriter for Repo {
    async fn prepare(&self) -> Result<RepoState, GitWriteError> {
        Ok(RepoState {
            path: PathBuf::from("/repo"),
            branch: "main".into(),
            head: None,
            has_remote: false,
        })
    }

    async fn refresh(&self) -> Result<RepoState, GitWriteError> {
        self.prepare().await
    }

    async fn create_or_update_issue_file(
        &self,
        data: &IssueData,
        mode: WriteMode,
    ) -> Result<FileWrite, GitWriteError> {
        if self.broken_key == Some(data.key.as_str()) {
            return Err(std::io::Error::other("disk full").into());
        }
        let body = format!("{}|{}", data.status, data.summary);
        let mut files = self.files.lock().unwrap();
        let change = match files.insert(data.key.clone(), body.clone()) {
            Some(old) if old == body && mode == WriteMode::SkipUnchanged => FileChange::Unchanged,
            Some(_) => FileChange::Updated,
            None => FileChange::Created,
        };
        let commit_hash = (change != FileChange::Unchanged).then(|| format!("commit-{}", data.key));
        Ok(FileWrite {
            path: PathBuf::from(format!("/repo/issues/{}.md", data.key)),
            change,
            commit_hash,
        })
    }

    async fn delete_issue_file(&self, key: &str) -> Result<PathBuf, GitWriteError> {
        self.files
            .lock()
            .unwrap()
            .remove(key)
            .map(|_| PathBuf::from(format!("/repo/issues/{key}.md")))
            .ok_or_else(|| GitWriteError::NotFound(key.to_string()))
    }

    async fn push_changes(&self, _branch: Option<&str>) -> Result<(), GitWriteError> {
        Ok(())
    }

    async fn list_issue_keys(&self) -> Result<Vec<String>, GitWriteError> {
        Ok(self.files.lock().unwrap().keys().cloned().collect())
    }
}

fn issue(key: &str) -> IssueRecord {
    IssueRecord {
        id: None,
        key: key.into(),
        fields: IssueFields {
            summary: format!("Summary of {key}"),
            status: Some(NamedRef { name: "Open".into() }),
            ..IssueFields::default()
        },
    }
}

#[tokio::test]
async fn bootstrap_then_reconcile_and_cleanup_over_the_engine() {
    let tracker = Arc::new(Tracker {
        issues: vec![issue("PROJ-1"), issue("PROJ-2")],
        ..Tracker::default()
    });
    let repo = Arc::new(Repo::default());
    repo.files
        .lock()
        .unwrap()
        .insert("PROJ-99".into(), "stale".into());
    let engine = Arc::new(SyncEngine::new(
        tracker.clone(),
        repo.clone(),
        SyncSettings::default(),
    ));
    let state = Arc::new(SyncStateStore::in_memory());
    let processor = OperationProcessor::new(engine, state.clone(), ProcessorConfig::default());

    let op = processor
        .start_operation(OperationKind::Bootstrap, OperationConfig::new("PROJ"))
        .unwrap();
    let done = wait(&processor, &op).await;
    assert_eq!(done.status, OperationStatus::Completed, "{:?}", done.error_message);
    let summary = done.result_summary.clone().unwrap();
    assert_eq!(summary.processed_issues(), 2);
    assert_eq!(summary.counters.created_files, 2);
    assert_eq!(summary.counters.commits, 2);
    assert_eq!(done.progress.completed_steps, 3);
    match &done.task_by_name("FetchProjectInfo").unwrap().output {
        Some(TaskOutput::ProjectFetched { project }) => assert_eq!(project.id, "10000"),
        other => panic!("unexpected output {other:?}"),
    }
    assert!(state.watermark("PROJ").is_some());

    // With a watermark, reconcile scans recent updates only.
    let op = processor
        .start_operation(OperationKind::Reconcile, OperationConfig::new("PROJ"))
        .unwrap();
    let done = wait(&processor, &op).await;
    assert_eq!(done.status, OperationStatus::Completed, "{:?}", done.error_message);
    assert!(tracker
        .searches
        .lock()
        .unwrap()
        .last()
        .unwrap()
        .contains("updated >="));
    assert_eq!(done.result_summary.unwrap().counters.unchanged_files, 2);

    let op = processor
        .start_operation(OperationKind::Cleanup, OperationConfig::new("PROJ"))
        .unwrap();
    let done = wait(&processor, &op).await;
    assert_eq!(done.status, OperationStatus::Completed, "{:?}", done.error_message);
    assert_eq!(done.result_summary.unwrap().counters.deleted_files, 1);
    let keys: Vec<String> = repo.files.lock().unwrap().keys().cloned().collect();
    assert_eq!(keys, vec!["PROJ-1", "PROJ-2"]);
}

fn engine_processor(
    tracker: Arc<Tracker>,
    repo: Arc<Repo>,
) -> (OperationProcessor, Arc<SyncStateStore>) {
    let engine = Arc::new(SyncEngine::new(tracker, repo, SyncSettings::default()));
    let state = Arc::new(SyncStateStore::in_memory());
    let processor = OperationProcessor::new(engine, state.clone(), ProcessorConfig::default());
    (processor, state)
}

#[tokio::test]
async fn first_reconcile_pages_past_the_search_limit() {
    let tracker = Arc::new(Tracker {
        issues: (1..=150).map(|n| issue(&format!("PROJ-{n}"))).collect(),
        ..Tracker::default()
    });
    let repo = Arc::new(Repo::default());
    let (processor, state) = engine_processor(tracker, repo.clone());
    assert!(SyncSettings::default().search_limit < 150);

    let op = processor
        .start_operation(OperationKind::Reconcile, OperationConfig::new("PROJ"))
        .unwrap();
    let done = wait(&processor, &op).await;
    assert_eq!(done.status, OperationStatus::Completed, "{:?}", done.error_message);
    assert_eq!(done.result_summary.as_ref().unwrap().processed_issues(), 150);
    assert_eq!(repo.files.lock().unwrap().len(), 150);
    assert!(state.watermark("PROJ").is_some());
}

#[tokio::test]
async fn failed_items_hold_the_watermark_back() {
    let tracker = Arc::new(Tracker {
        issues: vec![issue("PROJ-1"), issue("PROJ-2"), issue("PROJ-3")],
        ..Tracker::default()
    });
    let repo = Arc::new(Repo {
        broken_key: Some("PROJ-2"),
        ..Repo::default()
    });
    let (processor, state) = engine_processor(tracker, repo.clone());

    let op = processor
        .start_operation(OperationKind::Bootstrap, OperationConfig::new("PROJ"))
        .unwrap();
    let done = wait(&processor, &op).await;
    // The batch itself survives the item failure.
    assert_eq!(done.status, OperationStatus::Completed, "{:?}", done.error_message);
    let counters = done.result_summary.as_ref().unwrap().counters;
    assert_eq!(counters.failed_items, 1);
    assert_eq!(counters.created_files, 2);
    assert!(state.watermark("PROJ").is_none());
}

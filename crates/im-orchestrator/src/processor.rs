use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use im_sync::{ProgressSink, ProgressTracker, SyncEngine, SyncStateStore};
use im_telemetry::tracing_setup::{create_child_span, create_operation_span};
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::events::{OperationEvent, OperationEventBus, DEFAULT_EVENT_CAPACITY};
use crate::graph::{blocked_tasks, ready_tasks, GraphError, TaskGraph};
use crate::operation::{
    Operation, OperationConfig, OperationKind, OperationStatus, Task, TaskOutput, TaskStatus,
};
use crate::tasks::{SyncTaskExecutor, TaskContext, TaskError, TaskExecutor};

// ---------------------------------------------------------------------------
// Errors / config
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("operation {0} not found")]
    NotFound(Uuid),
    #[error("operation {id} is {status}")]
    InvalidState { id: Uuid, status: OperationStatus },
    #[error("project {project} already has active operation {operation_id}")]
    AlreadyActive { project: String, operation_id: Uuid },
    #[error("invalid task graph: {0}")]
    Validation(#[from] GraphError),
    #[error("invalid operation config: {0}")]
    InvalidConfig(String),
    #[error("timed out waiting for operation {}", operation.id)]
    Timeout { operation: Box<Operation> },
    #[error("stopped waiting for operation {}", operation.id)]
    WaitCancelled { operation: Box<Operation> },
}

pub type Result<T> = std::result::Result<T, OperationError>;

type TaskOutcome = std::result::Result<std::result::Result<TaskOutput, TaskError>, JoinError>;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// How often `wait_for_completion` re-reads the operation.
    pub wait_poll_interval: Duration,
    /// Buffer size of each event subscription.
    pub event_capacity: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            wait_poll_interval: Duration::from_millis(100),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

// ---------------------------------------------------------------------------
// OperationProcessor
// ---------------------------------------------------------------------------

struct OperationEntry {
    operation: Operation,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    operations: RwLock<HashMap<Uuid, OperationEntry>>,
    executor: Arc<dyn TaskExecutor>,
    state: Arc<SyncStateStore>,
    events: OperationEventBus,
    config: ProcessorConfig,
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, OperationEntry>> {
        self.operations.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, OperationEntry>> {
        self.operations.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Registry and executor of sync operations.
///
/// Every operation runs its task graph on a background tokio task. Callers
/// get snapshots (`Operation` clones); the live state stays behind the
/// registry lock and every status transition happens under it.
#[derive(Clone)]
pub struct OperationProcessor {
    inner: Arc<Inner>,
}

impl OperationProcessor {
    pub fn new(engine: Arc<SyncEngine>, state: Arc<SyncStateStore>, config: ProcessorConfig) -> Self {
        let executor = Arc::new(SyncTaskExecutor::new(engine, Arc::clone(&state)));
        Self::with_executor(executor, state, config)
    }

    pub fn with_executor(
        executor: Arc<dyn TaskExecutor>,
        state: Arc<SyncStateStore>,
        config: ProcessorConfig,
    ) -> Self {
        let events = OperationEventBus::with_capacity(config.event_capacity);
        Self {
            inner: Arc::new(Inner {
                operations: RwLock::new(HashMap::new()),
                executor,
                state,
                events,
                config,
            }),
        }
    }

    pub fn events(&self) -> &OperationEventBus {
        &self.inner.events
    }

    /// Register an operation of `kind` with its standard task graph and start
    /// it in the background. The returned snapshot is still `Pending`.
    pub fn start_operation(&self, kind: OperationKind, config: OperationConfig) -> Result<Operation> {
        check_config(&config)?;
        let graph = TaskGraph::template(kind)?;
        self.launch(kind, config, graph)
    }

    /// Like [`start_operation`](Self::start_operation) with a caller-built
    /// task graph. An invalid graph is rejected before anything is stored.
    pub fn start_with_tasks(
        &self,
        kind: OperationKind,
        config: OperationConfig,
        tasks: Vec<Task>,
    ) -> Result<Operation> {
        check_config(&config)?;
        let graph = TaskGraph::new(tasks)?;
        self.launch(kind, config, graph)
    }

    fn launch(&self, kind: OperationKind, config: OperationConfig, graph: TaskGraph) -> Result<Operation> {
        let operation = Operation::new(kind, config, graph.into_tasks());
        let id = operation.id;
        let snapshot = operation.clone();
        let cancel = CancellationToken::new();

        {
            let mut ops = self.inner.write();
            if let Some(active) = ops.values().find(|e| {
                e.operation.config.project == snapshot.config.project && e.operation.status.is_active()
            }) {
                return Err(OperationError::AlreadyActive {
                    project: snapshot.config.project.clone(),
                    operation_id: active.operation.id,
                });
            }
            ops.insert(
                id,
                OperationEntry {
                    operation,
                    cancel: cancel.clone(),
                    handle: None,
                },
            );
        }

        let (span, trace_id) =
            create_operation_span(&kind.to_string(), &id.to_string(), &snapshot.config.project);
        let processor = self.clone();
        let handle = tokio::spawn(
            async move { processor.run_operation(id, cancel, trace_id).await }.instrument(span),
        );
        if let Some(entry) = self.inner.write().get_mut(&id) {
            entry.handle = Some(handle);
        }

        info!(
            operation_id = %id,
            %kind,
            project = %snapshot.config.project,
            tasks = snapshot.tasks.len(),
            "operation started"
        );
        self.inner.events.publish(OperationEvent::StatusChanged {
            operation_id: id,
            status: OperationStatus::Pending,
        });
        Ok(snapshot)
    }

    /// Cancel a running operation. Pending and finished operations are
    /// rejected and left untouched.
    pub fn cancel_operation(&self, id: Uuid) -> Result<Operation> {
        let snapshot = {
            let mut ops = self.inner.write();
            let entry = ops.get_mut(&id).ok_or(OperationError::NotFound(id))?;
            let status = entry.operation.status;
            if status != OperationStatus::Running {
                return Err(OperationError::InvalidState { id, status });
            }
            mark_cancelled(&mut entry.operation);
            entry.cancel.cancel();
            entry.operation.clone()
        };
        info!(operation_id = %id, "operation cancelled");
        self.inner.events.publish(OperationEvent::StatusChanged {
            operation_id: id,
            status: OperationStatus::Cancelled,
        });
        Ok(snapshot)
    }

    /// Poll until the operation reaches a terminal status.
    pub async fn wait_for_completion(
        &self,
        id: Uuid,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Operation> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let operation = self.get_operation(id).ok_or(OperationError::NotFound(id))?;
            if operation.status.is_terminal() {
                return Ok(operation);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(OperationError::Timeout {
                    operation: Box::new(operation),
                });
            }
            let pause = self.inner.config.wait_poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(OperationError::WaitCancelled { operation: Box::new(operation) });
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    pub fn get_operation(&self, id: Uuid) -> Option<Operation> {
        self.inner.read().get(&id).map(|e| e.operation.clone())
    }

    /// Snapshots ordered by start time, optionally filtered by status.
    pub fn list_operations(&self, status: Option<OperationStatus>) -> Vec<Operation> {
        let mut list: Vec<Operation> = self
            .inner
            .read()
            .values()
            .filter(|e| status.map_or(true, |s| e.operation.status == s))
            .map(|e| e.operation.clone())
            .collect();
        list.sort_by_key(|op| op.start_time);
        list
    }

    /// The pending or running operation of `project`, if any.
    pub fn active_operation(&self, project: &str) -> Option<Operation> {
        self.inner
            .read()
            .values()
            .find(|e| e.operation.config.project == project && e.operation.status.is_active())
            .map(|e| e.operation.clone())
    }

    /// Events of one operation. The stream ends after its `Finished` event;
    /// for an operation that has already finished it is closed from the
    /// start.
    pub fn subscribe(&self, id: Uuid) -> Result<flume::Receiver<OperationEvent>> {
        let ops = self.inner.read();
        let entry = ops.get(&id).ok_or(OperationError::NotFound(id))?;
        if entry.operation.result_summary.is_some() {
            let (_, rx) = flume::bounded(1);
            return Ok(rx);
        }
        Ok(self.inner.events.subscribe(id))
    }

    pub fn subscribe_all(&self) -> flume::Receiver<OperationEvent> {
        self.inner.events.subscribe_all()
    }

    /// Forget finished operations that ended more than `days` days ago.
    pub fn cleanup_old_operations(&self, days: u32) -> usize {
        self.cleanup_older_than(Utc::now() - chrono::Duration::days(i64::from(days)))
    }

    /// Forget finished operations that ended before `cutoff`. Operations
    /// without an end time are always kept.
    pub fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut ops = self.inner.write();
        let before = ops.len();
        ops.retain(|_, e| {
            !e.operation.status.is_terminal() || e.operation.end_time.map_or(true, |end| end >= cutoff)
        });
        let removed = before - ops.len();
        if removed > 0 {
            info!(removed, "old operations cleaned up");
        }
        removed
    }

    /// Cancel every active operation and wait up to `grace` for their
    /// background tasks to drain.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let (cancelled, handles) = {
            let mut ops = self.inner.write();
            let mut cancelled = Vec::new();
            let mut handles = Vec::new();
            for entry in ops.values_mut() {
                if entry.operation.status.is_active() {
                    mark_cancelled(&mut entry.operation);
                    entry.cancel.cancel();
                    cancelled.push(entry.operation.id);
                }
                if let Some(handle) = entry.handle.take() {
                    handles.push(handle);
                }
            }
            (cancelled, handles)
        };
        for id in &cancelled {
            self.inner.events.publish(OperationEvent::StatusChanged {
                operation_id: *id,
                status: OperationStatus::Cancelled,
            });
        }

        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("operations still running after shutdown grace period");
        }
        cancelled.len()
    }

    // -----------------------------------------------------------------------
    // Executor loop
    // -----------------------------------------------------------------------

    async fn run_operation(self, id: Uuid, cancel: CancellationToken, trace_id: String) {
        let started = {
            let mut ops = self.inner.write();
            let Some(entry) = ops.get_mut(&id) else {
                return;
            };
            let op = &mut entry.operation;
            match op.status {
                OperationStatus::Pending if cancel.is_cancelled() => {
                    mark_cancelled(op);
                    false
                }
                OperationStatus::Pending => {
                    op.status = OperationStatus::Running;
                    true
                }
                _ => false,
            }
        };
        if started {
            self.inner.events.publish(OperationEvent::StatusChanged {
                operation_id: id,
                status: OperationStatus::Running,
            });
        }

        let tasks_cancel = cancel.child_token();
        let mut running: JoinSet<(Uuid, TaskOutcome)> = JoinSet::new();
        let mut base: Option<(OperationKind, DateTime<Utc>, OperationConfig)> = None;

        loop {
            let mut events = Vec::new();
            let mut launches = Vec::new();
            let settled = {
                let mut ops = self.inner.write();
                let Some(entry) = ops.get_mut(&id) else {
                    return;
                };
                let op = &mut entry.operation;

                for blocked in blocked_tasks(&op.tasks) {
                    if let Some(task) = op.task_mut(blocked) {
                        task.finish(TaskStatus::Failed, Some("skipped: dependency failed".into()));
                        events.push(task_event(id, task));
                    }
                }

                if !op.status.is_terminal() && !tasks_cancel.is_cancelled() {
                    for ready in ready_tasks(&op.tasks) {
                        let upstream: Vec<TaskOutput> = op
                            .task(ready)
                            .map(|t| {
                                t.dependencies
                                    .iter()
                                    .filter_map(|d| op.task(*d).and_then(|dep| dep.output.clone()))
                                    .collect()
                            })
                            .unwrap_or_default();
                        if let Some(task) = op.task_mut(ready) {
                            task.status = TaskStatus::Running;
                            task.started_at = Some(Utc::now());
                            events.push(task_event(id, task));
                            launches.push((task.id, task.name.clone(), task.spec.clone(), upstream));
                        }
                    }
                }
                base.get_or_insert_with(|| (op.kind, op.start_time, op.config.clone()));

                if running.is_empty() && launches.is_empty() {
                    Some(watermark_due(op))
                } else {
                    None
                }
            };

            for event in events {
                self.inner.events.publish(event);
            }

            if let Some(due) = settled {
                // Stored before the operation turns terminal, outside the
                // registry lock.
                if let Some((project, synced_at)) = due {
                    self.record_watermark(id, project, synced_at).await;
                }
                let finished = {
                    let mut ops = self.inner.write();
                    let Some(entry) = ops.get_mut(&id) else {
                        return;
                    };
                    self.finalize(&mut entry.operation)
                };
                self.inner.events.publish(finished);
                self.inner.events.close(id);
                return;
            }

            let Some((kind, start, config)) = base.clone() else {
                return;
            };
            for (task_id, name, spec, upstream) in launches {
                let ctx = TaskContext {
                    operation_id: id,
                    operation_kind: kind,
                    operation_start: start,
                    config: config.clone(),
                    upstream,
                    cancel: tasks_cancel.clone(),
                    progress: Arc::new(TaskProgress {
                        inner: Arc::clone(&self.inner),
                        operation_id: id,
                        task_name: name.clone(),
                    }),
                };
                let executor = Arc::clone(&self.inner.executor);
                let span = create_child_span(&trace_id, &name);
                debug!(task = %name, "task started");
                let handle = tokio::spawn(
                    async move { executor.execute(&spec, &ctx).await }.instrument(span),
                );
                running.spawn(async move { (task_id, handle.await) });
            }

            match running.join_next().await {
                Some(Ok((task_id, outcome))) => {
                    self.record_outcome(id, task_id, outcome, &tasks_cancel);
                }
                Some(Err(e)) => error!(error = %e, "task supervisor failed"),
                None => {}
            }
        }
    }

    fn record_outcome(
        &self,
        id: Uuid,
        task_id: Uuid,
        outcome: TaskOutcome,
        tasks_cancel: &CancellationToken,
    ) {
        let mut events = Vec::new();
        {
            let mut ops = self.inner.write();
            let Some(entry) = ops.get_mut(&id) else {
                return;
            };
            let op = &mut entry.operation;
            let Some(task) = op.task_mut(task_id) else {
                return;
            };
            // Cancellation already settled this task.
            if task.status != TaskStatus::Running {
                return;
            }
            let name = task.name.clone();

            let failure = match outcome {
                Ok(Ok(output)) => {
                    task.output = Some(output);
                    task.finish(TaskStatus::Completed, None);
                    events.push(task_event(id, task));
                    info!(task = %name, "task completed");
                    op.progress.advance(format!("{name} completed"));
                    events.push(OperationEvent::Progress {
                        operation_id: id,
                        completed_steps: op.progress.completed_steps,
                        total_steps: op.progress.total_steps,
                        message: format!("{name} completed"),
                    });
                    None
                }
                Ok(Err(e)) if e.is_cancelled() => {
                    task.finish(TaskStatus::Cancelled, None);
                    events.push(task_event(id, task));
                    None
                }
                Ok(Err(e)) => {
                    warn!(task = %name, error = %e, "task failed");
                    task.finish(TaskStatus::Failed, Some(e.to_string()));
                    events.push(task_event(id, task));
                    Some((e.to_string(), e.is_connectivity()))
                }
                Err(join) => {
                    error!(task = %name, error = %join, "task panicked");
                    let message = format!("task panicked: {join}");
                    task.finish(TaskStatus::Failed, Some(message.clone()));
                    events.push(task_event(id, task));
                    Some((message, false))
                }
            };

            if let Some((message, connectivity)) = failure {
                if op.error_message.is_none() {
                    op.error_message = Some(format!("{name}: {message}"));
                }
                if connectivity {
                    warn!(task = %name, "source unreachable, aborting remaining tasks");
                    tasks_cancel.cancel();
                    for task in op.tasks.iter_mut().filter(|t| t.status == TaskStatus::Pending) {
                        task.finish(TaskStatus::Cancelled, Some("aborted: source unreachable".into()));
                        events.push(task_event(id, task));
                    }
                }
            }
        }
        for event in events {
            self.inner.events.publish(event);
        }
    }

    async fn record_watermark(&self, id: Uuid, project: String, synced_at: DateTime<Utc>) {
        let state = Arc::clone(&self.inner.state);
        let stored = tokio::task::spawn_blocking({
            let project = project.clone();
            move || state.record(&project, synced_at, id)
        })
        .await;
        match stored {
            Ok(Ok(())) => debug!(%project, %synced_at, "sync watermark recorded"),
            Ok(Err(e)) => warn!(%project, error = %e, "failed to persist sync watermark"),
            Err(e) => error!(%project, error = %e, "watermark writer panicked"),
        }
    }

    /// Settle the final status and summary. Runs under the registry lock so
    /// observers never see a finished operation without its summary.
    fn finalize(&self, op: &mut Operation) -> OperationEvent {
        for task in op.tasks.iter_mut().filter(|t| t.status == TaskStatus::Pending) {
            task.finish(TaskStatus::Cancelled, None);
        }

        if !op.status.is_terminal() {
            let all_completed = op.tasks.iter().all(|t| t.status == TaskStatus::Completed);
            let any_failed = op.tasks.iter().any(|t| t.status == TaskStatus::Failed);
            op.status = if all_completed {
                OperationStatus::Completed
            } else if any_failed {
                OperationStatus::Failed
            } else {
                OperationStatus::Cancelled
            };
            op.end_time = Some(Utc::now());
        }
        if op.status == OperationStatus::Failed && op.error_message.is_none() {
            op.error_message = Some("one or more tasks failed".into());
        }
        let summary = op.summarize();
        op.result_summary = Some(summary.clone());

        match op.status {
            OperationStatus::Completed => info!(
                processed = summary.processed_issues(),
                commits = summary.counters.commits,
                elapsed_ms = summary.elapsed_ms,
                "operation completed"
            ),
            status => warn!(
                %status,
                error = op.error_message.as_deref().unwrap_or(""),
                "operation did not complete"
            ),
        }

        OperationEvent::Finished {
            operation_id: op.id,
            status: op.status,
            summary: Some(summary),
        }
    }
}

/// Project and time to store as the sync watermark when `op` is about to
/// complete. Any failed item keeps the old watermark so the next reconcile
/// scans that window again.
fn watermark_due(op: &Operation) -> Option<(String, DateTime<Utc>)> {
    let completing =
        !op.status.is_terminal() && op.tasks.iter().all(|t| t.status == TaskStatus::Completed);
    if !completing || !op.kind.advances_watermark() {
        return None;
    }
    let failed_items: usize = op.tasks.iter().map(|t| t.counters().failed_items).sum();
    if failed_items > 0 {
        warn!(
            project = %op.config.project,
            failed_items,
            "items failed to sync, watermark not advanced"
        );
        return None;
    }
    Some((op.config.project.clone(), op.start_time))
}

fn check_config(config: &OperationConfig) -> Result<()> {
    if config.project.trim().is_empty() {
        return Err(OperationError::InvalidConfig("project key is empty".into()));
    }
    Ok(())
}

fn mark_cancelled(op: &mut Operation) {
    op.status = OperationStatus::Cancelled;
    op.end_time = Some(Utc::now());
    for task in op.tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
        task.finish(TaskStatus::Cancelled, None);
    }
}

fn task_event(operation_id: Uuid, task: &Task) -> OperationEvent {
    OperationEvent::TaskStatusChanged {
        operation_id,
        task_id: task.id,
        task_name: task.name.clone(),
        status: task.status,
    }
}

/// Forwards item progress of a running task to the operation and its
/// subscribers.
struct TaskProgress {
    inner: Arc<Inner>,
    operation_id: Uuid,
    task_name: String,
}

impl ProgressSink for TaskProgress {
    fn report(&self, progress: &ProgressTracker) {
        let message = progress.last_message.clone().unwrap_or_default();
        if let Some(entry) = self.inner.write().get_mut(&self.operation_id) {
            entry
                .operation
                .progress
                .note(format!("{}: {}", self.task_name, message));
        }
        self.inner.events.publish(OperationEvent::TaskProgress {
            operation_id: self.operation_id,
            task_name: self.task_name.clone(),
            completed: progress.completed_steps,
            total: progress.total_steps,
            message,
        });
    }
}

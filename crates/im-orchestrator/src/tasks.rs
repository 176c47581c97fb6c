use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use im_source::SourceError;
use im_sync::{GitWriteError, ProgressSink, SyncEngine, SyncError, SyncStateStore};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::operation::{OperationConfig, OperationKind, TaskOutput, TaskSpec};

/// Overlap subtracted from the watermark so edits racing the previous sync
/// or indexed late by the tracker are not missed.
pub const RECONCILE_OVERLAP: Duration = Duration::minutes(1);

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Sync(SyncError),
    #[error("task cancelled")]
    Cancelled,
    #[error("missing input from upstream task: {0}")]
    MissingInput(&'static str),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TaskError>;

impl From<SyncError> for TaskError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Cancelled => TaskError::Cancelled,
            other => TaskError::Sync(other),
        }
    }
}

impl From<SourceError> for TaskError {
    fn from(e: SourceError) -> Self {
        SyncError::from(e).into()
    }
}

impl From<GitWriteError> for TaskError {
    fn from(e: GitWriteError) -> Self {
        SyncError::Git(e).into()
    }
}

impl TaskError {
    /// Neither the tracker nor the repository remote is reachable; the
    /// operation's remaining tasks would fail the same way.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, TaskError::Sync(e) if e.is_connectivity())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

/// Everything a task sees while it runs.
pub struct TaskContext {
    pub operation_id: Uuid,
    pub operation_kind: OperationKind,
    pub operation_start: DateTime<Utc>,
    pub config: OperationConfig,
    /// Outputs of this task's completed dependencies.
    pub upstream: Vec<TaskOutput>,
    pub cancel: CancellationToken,
    pub progress: Arc<dyn ProgressSink>,
}

impl TaskContext {
    fn updates_found(&self) -> Option<(&[String], Option<DateTime<Utc>>)> {
        self.upstream.iter().find_map(|o| match o {
            TaskOutput::UpdatesFound { keys, since } => Some((keys.as_slice(), *since)),
            _ => None,
        })
    }

    fn orphans_found(&self) -> Option<&[String]> {
        self.upstream.iter().find_map(|o| match o {
            TaskOutput::OrphansFound { keys } => Some(keys.as_slice()),
            _ => None,
        })
    }
}

/// Runs one task. The processor calls this for every ready task.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, spec: &TaskSpec, ctx: &TaskContext) -> Result<TaskOutput>;
}

/// [`TaskExecutor`] backed by the sync engine.
pub struct SyncTaskExecutor {
    engine: Arc<SyncEngine>,
    state: Arc<SyncStateStore>,
}

impl SyncTaskExecutor {
    pub fn new(engine: Arc<SyncEngine>, state: Arc<SyncStateStore>) -> Self {
        Self { engine, state }
    }
}

#[async_trait]
impl TaskExecutor for SyncTaskExecutor {
    async fn execute(&self, spec: &TaskSpec, ctx: &TaskContext) -> Result<TaskOutput> {
        if ctx.cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        let project = ctx.config.project.as_str();
        let force = ctx.config.force_refresh;
        let sink = ctx.progress.as_ref();

        match spec {
            TaskSpec::InitRepo => {
                let repo = self.engine.writer().prepare().await?;
                Ok(TaskOutput::RepoReady { head: repo.head })
            }
            TaskSpec::UpdateRepo => {
                let repo = self.engine.writer().refresh().await?;
                Ok(TaskOutput::RepoReady { head: repo.head })
            }
            TaskSpec::FetchProjectInfo => {
                let info = self.engine.source().get_project(project, &ctx.cancel).await?;
                info!(project = %info.key, name = %info.name, "project info fetched");
                Ok(TaskOutput::ProjectFetched { project: info })
            }
            TaskSpec::BootstrapSync { overwrite } => {
                let results = self
                    .engine
                    .bootstrap(project, *overwrite || force, sink, &ctx.cancel)
                    .await?;
                Ok(TaskOutput::Synced { results })
            }
            TaskSpec::CheckSourceUpdates => match self.state.watermark(project) {
                Some(mark) => {
                    let since = mark.last_synced_at - RECONCILE_OVERLAP;
                    let keys = self.engine.find_updated(project, since, &ctx.cancel).await?;
                    info!(%project, %since, updated = keys.len(), "source updates checked");
                    Ok(TaskOutput::UpdatesFound {
                        keys,
                        since: Some(since),
                    })
                }
                None => {
                    info!(%project, "no watermark, reconcile will scan the whole project");
                    Ok(TaskOutput::UpdatesFound {
                        keys: Vec::new(),
                        since: None,
                    })
                }
            },
            TaskSpec::SyncUpdatedIssues => {
                let (keys, since) = ctx
                    .updates_found()
                    .ok_or(TaskError::MissingInput("CheckSourceUpdates"))?;
                let results = match since {
                    Some(_) => {
                        self.engine
                            .synchronize_keys(keys, force, sink, &ctx.cancel)
                            .await?
                    }
                    // Never synced: a paginated scan, so nothing past the
                    // search cap is left behind the new watermark.
                    None => self.engine.bootstrap(project, force, sink, &ctx.cancel).await?,
                };
                Ok(TaskOutput::Synced { results })
            }
            TaskSpec::IdentifyOrphans => {
                let keys = self.engine.find_orphans(project, &ctx.cancel).await?;
                Ok(TaskOutput::OrphansFound { keys })
            }
            TaskSpec::RemoveOrphans => {
                let keys = ctx
                    .orphans_found()
                    .ok_or(TaskError::MissingInput("IdentifyOrphans"))?;
                let results = self.engine.remove_orphans(keys, sink, &ctx.cancel).await?;
                Ok(TaskOutput::OrphansRemoved { results })
            }
        }
    }
}

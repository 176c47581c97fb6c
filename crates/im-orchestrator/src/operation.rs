use std::fmt;
use std::ops::AddAssign;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use im_core::types::ProjectInfo;
use im_sync::engine::{SyncOperation, SyncResult, SyncStatus};
use im_sync::ProgressTracker;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// OperationKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Bootstrap,
    Reconcile,
    ForcedSync,
    Cleanup,
}

impl OperationKind {
    /// Kinds whose success moves the project's sync watermark.
    pub fn advances_watermark(&self) -> bool {
        !matches!(self, OperationKind::Cleanup)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OperationKind::Bootstrap => "bootstrap",
            OperationKind::Reconcile => "reconcile",
            OperationKind::ForcedSync => "forced-sync",
            OperationKind::Cleanup => "cleanup",
        };
        write!(f, "{}", label)
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "bootstrap" => Ok(OperationKind::Bootstrap),
            "reconcile" => Ok(OperationKind::Reconcile),
            "forced-sync" | "forcedsync" => Ok(OperationKind::ForcedSync),
            "cleanup" => Ok(OperationKind::Cleanup),
            other => Err(format!("unknown operation kind '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, OperationStatus::Pending | OperationStatus::Running)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OperationStatus::Pending => "Pending",
            OperationStatus::Running => "Running",
            OperationStatus::Completed => "Completed",
            OperationStatus::Failed => "Failed",
            OperationStatus::Cancelled => "Cancelled",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Running => "Running",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
            TaskStatus::Cancelled => "Cancelled",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// TaskSpec / TaskOutput
// ---------------------------------------------------------------------------

/// What a task does, with its typed parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskSpec {
    InitRepo,
    FetchProjectInfo,
    BootstrapSync { overwrite: bool },
    CheckSourceUpdates,
    UpdateRepo,
    SyncUpdatedIssues,
    IdentifyOrphans,
    RemoveOrphans,
}

impl TaskSpec {
    pub fn name(&self) -> &'static str {
        match self {
            TaskSpec::InitRepo => "InitRepo",
            TaskSpec::FetchProjectInfo => "FetchProjectInfo",
            TaskSpec::BootstrapSync { .. } => "BootstrapSync",
            TaskSpec::CheckSourceUpdates => "CheckSourceUpdates",
            TaskSpec::UpdateRepo => "UpdateRepo",
            TaskSpec::SyncUpdatedIssues => "SyncUpdatedIssues",
            TaskSpec::IdentifyOrphans => "IdentifyOrphans",
            TaskSpec::RemoveOrphans => "RemoveOrphans",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            TaskSpec::InitRepo => "Clone or initialise the target repository",
            TaskSpec::FetchProjectInfo => "Fetch project metadata from the tracker",
            TaskSpec::BootstrapSync { overwrite: false } => "Sync every project issue page by page",
            TaskSpec::BootstrapSync { overwrite: true } => "Rewrite every project issue page by page",
            TaskSpec::CheckSourceUpdates => "Find issues updated since the last sync",
            TaskSpec::UpdateRepo => "Fetch and fast-forward the target repository",
            TaskSpec::SyncUpdatedIssues => "Sync the updated issues",
            TaskSpec::IdentifyOrphans => "Find issue files with no tracker issue",
            TaskSpec::RemoveOrphans => "Delete orphaned issue files",
        }
    }
}

/// Typed result of a completed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutput {
    RepoReady {
        head: Option<String>,
    },
    ProjectFetched {
        project: ProjectInfo,
    },
    Synced {
        results: Vec<SyncResult>,
    },
    /// `since` is `None` when there was no watermark; the sync then covers
    /// the whole project and `keys` is empty.
    UpdatesFound {
        keys: Vec<String>,
        since: Option<DateTime<Utc>>,
    },
    OrphansFound {
        keys: Vec<String>,
    },
    OrphansRemoved {
        results: Vec<SyncResult>,
    },
}

impl TaskOutput {
    pub fn counters(&self) -> TaskCounters {
        match self {
            TaskOutput::Synced { results } | TaskOutput::OrphansRemoved { results } => {
                TaskCounters::from_results(results)
            }
            _ => TaskCounters::default(),
        }
    }
}

/// Counters summed into the operation summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounters {
    pub processed_issues: usize,
    pub created_files: usize,
    pub updated_files: usize,
    pub unchanged_files: usize,
    pub deleted_files: usize,
    pub failed_items: usize,
    pub commits: usize,
}

impl TaskCounters {
    pub fn from_results(results: &[SyncResult]) -> Self {
        let mut c = TaskCounters {
            processed_issues: results.len(),
            ..TaskCounters::default()
        };
        for r in results {
            match (r.status, r.operation) {
                (SyncStatus::Failed, _) => c.failed_items += 1,
                (SyncStatus::Unchanged, _) => c.unchanged_files += 1,
                (SyncStatus::Success, SyncOperation::Create) => c.created_files += 1,
                (SyncStatus::Success, SyncOperation::Update) => c.updated_files += 1,
                (SyncStatus::Success, SyncOperation::Delete) => c.deleted_files += 1,
            }
            let deleted = r.operation == SyncOperation::Delete && r.status == SyncStatus::Success;
            if r.commit_hash.is_some() || deleted {
                c.commits += 1;
            }
        }
        c
    }
}

impl AddAssign for TaskCounters {
    fn add_assign(&mut self, rhs: Self) {
        self.processed_issues += rhs.processed_issues;
        self.created_files += rhs.created_files;
        self.updated_files += rhs.updated_files;
        self.unchanged_files += rhs.unchanged_files;
        self.deleted_files += rhs.deleted_files;
        self.failed_items += rhs.failed_items;
        self.commits += rhs.commits;
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub spec: TaskSpec,
    pub status: TaskStatus,
    /// Higher runs first among tasks that become ready together.
    pub priority: u8,
    pub dependencies: Vec<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output: Option<TaskOutput>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: spec.name().to_string(),
            description: spec.description().to_string(),
            spec,
            status: TaskStatus::Pending,
            priority: 0,
            dependencies: Vec::new(),
            started_at: None,
            ended_at: None,
            output: None,
            error: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, task: &Task) -> Self {
        self.dependencies.push(task.id);
        self
    }

    pub fn counters(&self) -> TaskCounters {
        self.output.as_ref().map(TaskOutput::counters).unwrap_or_default()
    }

    pub(crate) fn finish(&mut self, status: TaskStatus, error: Option<String>) {
        self.status = status;
        self.ended_at = Some(Utc::now());
        if error.is_some() {
            self.error = error;
        }
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationConfig {
    /// Tracker project key the operation mirrors.
    pub project: String,
    /// Rewrite files even when only `syncedAt` would change.
    #[serde(default)]
    pub force_refresh: bool,
}

impl OperationConfig {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            force_refresh: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResultSummary {
    #[serde(flatten)]
    pub counters: TaskCounters,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tasks_cancelled: usize,
    pub elapsed_ms: u64,
}

impl OperationResultSummary {
    pub fn processed_issues(&self) -> usize {
        self.counters.processed_issues
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub tasks: Vec<Task>,
    pub config: OperationConfig,
    pub progress: ProgressTracker,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result_summary: Option<OperationResultSummary>,
}

impl Operation {
    pub(crate) fn new(kind: OperationKind, config: OperationConfig, tasks: Vec<Task>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            status: OperationStatus::Pending,
            progress: ProgressTracker::new(tasks.len()),
            tasks,
            config,
            start_time: Utc::now(),
            end_time: None,
            error_message: None,
            result_summary: None,
        }
    }

    pub fn task(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_by_name(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub(crate) fn task_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Aggregate every task's counters. Called once, when the operation ends.
    pub(crate) fn summarize(&self) -> OperationResultSummary {
        let mut summary = OperationResultSummary::default();
        for task in &self.tasks {
            summary.counters += task.counters();
            match task.status {
                TaskStatus::Completed => summary.tasks_completed += 1,
                TaskStatus::Failed => summary.tasks_failed += 1,
                TaskStatus::Cancelled => summary.tasks_cancelled += 1,
                TaskStatus::Pending | TaskStatus::Running => {}
            }
        }
        let end = self.end_time.unwrap_or_else(Utc::now);
        summary.elapsed_ms = (end - self.start_time).num_milliseconds().max(0) as u64;
        summary
    }
}

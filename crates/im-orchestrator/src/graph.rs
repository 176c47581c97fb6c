use std::collections::{HashMap, HashSet};

use thiserror::Error;
use uuid::Uuid;

use crate::operation::{OperationKind, Task, TaskSpec, TaskStatus};

/// A task graph that cannot be executed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("task graph is empty")]
    Empty,
    #[error("duplicate task id {0}")]
    DuplicateTask(Uuid),
    #[error("task '{task}' depends on unknown task {dependency}")]
    MissingDependency { task: String, dependency: Uuid },
    #[error("dependency cycle through tasks {0:?}")]
    Cycle(Vec<String>),
}

/// Validated, acyclic set of tasks belonging to one operation.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: Vec<Task>,
}

impl TaskGraph {
    /// Validate `tasks`: non-empty, unique ids, every dependency present,
    /// no cycles.
    pub fn new(tasks: Vec<Task>) -> Result<Self, GraphError> {
        if tasks.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut ids = HashSet::new();
        for task in &tasks {
            if !ids.insert(task.id) {
                return Err(GraphError::DuplicateTask(task.id));
            }
        }
        for task in &tasks {
            if let Some(missing) = task.dependencies.iter().find(|d| !ids.contains(d)) {
                return Err(GraphError::MissingDependency {
                    task: task.name.clone(),
                    dependency: *missing,
                });
            }
        }

        let graph = Self { tasks };
        graph.topological_order()?;
        Ok(graph)
    }

    /// The fixed task layout for each operation kind.
    pub fn template(kind: OperationKind) -> Result<Self, GraphError> {
        let tasks = match kind {
            OperationKind::Bootstrap | OperationKind::ForcedSync => {
                let init = Task::new(TaskSpec::InitRepo).with_priority(2);
                let fetch = Task::new(TaskSpec::FetchProjectInfo).with_priority(1);
                let overwrite = kind == OperationKind::ForcedSync;
                let sync = Task::new(TaskSpec::BootstrapSync { overwrite })
                    .depends_on(&init)
                    .depends_on(&fetch);
                vec![init, fetch, sync]
            }
            OperationKind::Reconcile => {
                let check = Task::new(TaskSpec::CheckSourceUpdates).with_priority(1);
                let update = Task::new(TaskSpec::UpdateRepo).with_priority(2);
                let sync = Task::new(TaskSpec::SyncUpdatedIssues)
                    .depends_on(&check)
                    .depends_on(&update);
                vec![check, update, sync]
            }
            OperationKind::Cleanup => {
                let identify = Task::new(TaskSpec::IdentifyOrphans);
                let remove = Task::new(TaskSpec::RemoveOrphans).depends_on(&identify);
                vec![identify, remove]
            }
        };
        Self::new(tasks)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Kahn's algorithm; ties keep declaration order.
    pub fn topological_order(&self) -> Result<Vec<Uuid>, GraphError> {
        let mut indegree: HashMap<Uuid, usize> =
            self.tasks.iter().map(|t| (t.id, t.dependencies.len())).collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        let mut done = HashSet::new();

        while order.len() < self.tasks.len() {
            let next: Vec<Uuid> = self
                .tasks
                .iter()
                .filter(|t| !done.contains(&t.id) && indegree[&t.id] == 0)
                .map(|t| t.id)
                .collect();
            if next.is_empty() {
                let stuck = self
                    .tasks
                    .iter()
                    .filter(|t| !done.contains(&t.id))
                    .map(|t| t.name.clone())
                    .collect();
                return Err(GraphError::Cycle(stuck));
            }
            for id in next {
                done.insert(id);
                order.push(id);
                for t in self.tasks.iter().filter(|t| t.dependencies.contains(&id)) {
                    if let Some(d) = indegree.get_mut(&t.id) {
                        *d -= 1;
                    }
                }
            }
        }
        Ok(order)
    }
}

/// Pending tasks whose dependencies have all completed, highest priority
/// first.
pub fn ready_tasks(tasks: &[Task]) -> Vec<Uuid> {
    let status: HashMap<Uuid, TaskStatus> = tasks.iter().map(|t| (t.id, t.status)).collect();
    let mut ready: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| {
            t.dependencies
                .iter()
                .all(|d| status.get(d) == Some(&TaskStatus::Completed))
        })
        .collect();
    ready.sort_by(|a, b| b.priority.cmp(&a.priority));
    ready.into_iter().map(|t| t.id).collect()
}

/// Pending tasks with a dependency that failed or was cancelled; they can
/// never run.
pub fn blocked_tasks(tasks: &[Task]) -> Vec<Uuid> {
    let status: HashMap<Uuid, TaskStatus> = tasks.iter().map(|t| (t.id, t.status)).collect();
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| {
            t.dependencies.iter().any(|d| {
                matches!(
                    status.get(d),
                    Some(TaskStatus::Failed) | Some(TaskStatus::Cancelled)
                )
            })
        })
        .map(|t| t.id)
        .collect()
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to access sync state {path}: {message}")]
    Io { path: String, message: String },
    #[error("corrupt sync state {path}: {message}")]
    Parse { path: String, message: String },
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Last successful sync of one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub last_synced_at: DateTime<Utc>,
    #[serde(default)]
    pub last_operation_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SyncState {
    #[serde(default)]
    projects: BTreeMap<String, Watermark>,
}

/// Per-project sync watermarks, persisted as JSON when a path is set.
#[derive(Debug)]
pub struct SyncStateStore {
    path: Option<PathBuf>,
    state: Mutex<SyncState>,
}

impl SyncStateStore {
    /// Load the store at `path`; a missing file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| StateError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no sync state yet");
                SyncState::default()
            }
            Err(e) => return Err(io_error(&path, e)),
        };
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(SyncState::default()),
        }
    }

    pub fn watermark(&self, project: &str) -> Option<Watermark> {
        self.lock().projects.get(project).cloned()
    }

    /// Record a successful sync. Watermarks only move forward; an older
    /// timestamp is ignored.
    pub fn record(&self, project: &str, synced_at: DateTime<Utc>, operation_id: Uuid) -> Result<()> {
        let snapshot = {
            let mut state = self.lock();
            if let Some(current) = state.projects.get(project) {
                if current.last_synced_at > synced_at {
                    warn!(%project, "ignoring older watermark");
                    return Ok(());
                }
            }
            state.projects.insert(
                project.to_string(),
                Watermark {
                    last_synced_at: synced_at,
                    last_operation_id: Some(operation_id),
                },
            );
            state.clone()
        };
        self.persist(&snapshot)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write to a sibling temp file, then rename over the target.
    fn persist(&self, state: &SyncState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
        }
        let json = serde_json::to_string_pretty(state).map_err(|e| StateError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| io_error(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| io_error(path, e))?;
        Ok(())
    }
}

fn io_error(path: &Path, e: std::io::Error) -> StateError {
    StateError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

//! Write path of the mirror: issue files in a git repository, the sync
//! engine driving them from the tracker, progress reporting and the
//! per-project watermarks that let reconcile resume after a restart.

pub mod engine;
pub mod git_writer;
pub mod progress;
pub mod state;

pub use engine::{filter_active_issues, SyncEngine, SyncError, SyncResult};
pub use git_writer::{GitWriteError, GitWriter, ShellGitWriter, WriteMode};
pub use progress::{ProgressSink, ProgressTracker};
pub use state::SyncStateStore;

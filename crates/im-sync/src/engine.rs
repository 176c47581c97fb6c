use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use im_core::config::SyncSettings;
use im_core::convert::convert;
use im_core::types::{is_inactive_status, IssueRecord};
use im_source::client::{project_jql, updated_since_jql, SourceClient, KEY_FIELDS, SYNC_FIELDS};
use im_source::SourceError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::git_writer::{FileChange, FileWrite, GitWriteError, GitWriter, WriteMode};
use crate::progress::{ProgressSink, ProgressTracker};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures that end a sync call. Per-issue failures are reported in
/// [`SyncResult`] instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("tracker error: {0}")]
    Source(SourceError),
    #[error("repository error: {0}")]
    Git(#[from] GitWriteError),
    #[error("sync cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl From<SourceError> for SyncError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Cancelled => SyncError::Cancelled,
            other => SyncError::Source(other),
        }
    }
}

impl SyncError {
    /// Neither the tracker nor the repository remote can be used.
    pub fn is_connectivity(&self) -> bool {
        match self {
            SyncError::Source(e) => e.is_connectivity(),
            SyncError::Git(e) => e.is_connectivity(),
            SyncError::Cancelled => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Success,
    /// The file already matched the tracker; nothing was committed.
    Unchanged,
    Failed,
}

/// Outcome for one issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub issue_key: String,
    pub operation: SyncOperation,
    pub status: SyncStatus,
    pub file_path: Option<PathBuf>,
    pub commit_hash: Option<String>,
    pub error: Option<String>,
}

impl SyncResult {
    fn written(key: &str, write: FileWrite) -> Self {
        let (operation, status) = match write.change {
            FileChange::Created => (SyncOperation::Create, SyncStatus::Success),
            FileChange::Updated => (SyncOperation::Update, SyncStatus::Success),
            FileChange::Unchanged => (SyncOperation::Update, SyncStatus::Unchanged),
        };
        Self {
            issue_key: key.to_string(),
            operation,
            status,
            file_path: Some(write.path),
            commit_hash: write.commit_hash,
            error: None,
        }
    }

    fn deleted(key: &str, path: PathBuf) -> Self {
        Self {
            issue_key: key.to_string(),
            operation: SyncOperation::Delete,
            status: SyncStatus::Success,
            file_path: Some(path),
            commit_hash: None,
            error: None,
        }
    }

    fn failed(key: &str, operation: SyncOperation, error: impl ToString) -> Self {
        Self {
            issue_key: key.to_string(),
            operation,
            status: SyncStatus::Failed,
            file_path: None,
            commit_hash: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == SyncStatus::Failed
    }
}

/// Drop issues whose status is Done, Closed, or Resolved, keeping order.
pub fn filter_active_issues(issues: Vec<IssueRecord>) -> Vec<IssueRecord> {
    issues
        .into_iter()
        .filter(|issue| !is_inactive_status(issue.status_name()))
        .collect()
}

// ---------------------------------------------------------------------------
// SyncEngine
// ---------------------------------------------------------------------------

/// Moves issues from the tracker into the repository.
pub struct SyncEngine {
    source: Arc<dyn SourceClient>,
    writer: Arc<dyn GitWriter>,
    settings: SyncSettings,
    branch: Option<String>,
}

impl SyncEngine {
    pub fn new(source: Arc<dyn SourceClient>, writer: Arc<dyn GitWriter>, settings: SyncSettings) -> Self {
        Self {
            source,
            writer,
            settings,
            branch: None,
        }
    }

    /// Push to `branch` instead of the writer's configured branch.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn source(&self) -> &Arc<dyn SourceClient> {
        &self.source
    }

    pub fn writer(&self) -> &Arc<dyn GitWriter> {
        &self.writer
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Fetch, convert, write and push a single issue.
    pub async fn synchronize_issue(
        &self,
        key: &str,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> Result<SyncResult> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let record = self.source.get_issue(key, SYNC_FIELDS, cancel).await?;
        let data = convert(&record);
        let write = self
            .writer
            .create_or_update_issue_file(&data, WriteMode::from_force(force_refresh))
            .await?;
        if write.commit_hash.is_some() {
            self.push().await?;
        }
        Ok(SyncResult::written(&record.key, write))
    }

    /// Sync the project's issues and push once afterwards.
    ///
    /// Without `since` this is a single search capped at `search_limit`.
    /// With `since` every issue updated from then on is fetched page by page.
    pub async fn synchronize_project(
        &self,
        project: &str,
        force_refresh: bool,
        since: Option<DateTime<Utc>>,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<SyncResult>> {
        let issues = match since {
            None => {
                let jql = project_jql(project, self.settings.active_only);
                let page = self
                    .source
                    .search_issues(&jql, 0, self.settings.search_limit, SYNC_FIELDS, cancel)
                    .await?;
                if page.total_count > page.items.len() {
                    warn!(
                        %project,
                        total = page.total_count,
                        fetched = page.items.len(),
                        "project search truncated at search_limit"
                    );
                }
                page.items
            }
            Some(since) => {
                let issues = self
                    .scan(&updated_since_jql(project, since), SYNC_FIELDS, cancel)
                    .await?;
                if self.settings.active_only {
                    filter_active_issues(issues)
                } else {
                    issues
                }
            }
        };

        let mut progress = ProgressTracker::new(issues.len());
        let mut seen = HashSet::new();
        let mut results = Vec::with_capacity(issues.len());
        let committed = self
            .write_batch(
                issues,
                WriteMode::from_force(force_refresh),
                &mut seen,
                &mut progress,
                sink,
                cancel,
                &mut results,
            )
            .await?;
        if committed {
            self.push().await?;
        }

        log_batch(project, "project sync", &results);
        Ok(results)
    }

    /// Full paginated scan of the project, pushing after every page.
    ///
    /// Issues repeated across pages (the result set shifted under us) are
    /// processed once.
    pub async fn bootstrap(
        &self,
        project: &str,
        force_refresh: bool,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<SyncResult>> {
        let mode = WriteMode::from_force(force_refresh);
        let mut progress = ProgressTracker::default();
        let mut seen = HashSet::new();
        let mut results = Vec::new();
        let mut offset = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let page = self
                .source
                .get_project_issues(project, offset, self.settings.page_size, self.settings.active_only, cancel)
                .await?;
            let next = page.next_offset();
            info!(
                %project,
                offset,
                returned = page.items.len(),
                total = page.total_count,
                "bootstrap page fetched"
            );

            progress.set_total(page.total_count);
            let committed = self
                .write_batch(page.items, mode, &mut seen, &mut progress, sink, cancel, &mut results)
                .await?;
            // Earlier pages stay pushed even if a later one fails.
            if committed {
                self.push().await?;
            }

            match next {
                Some(n) if n > offset => offset = n,
                _ => break,
            }
        }

        progress.set_total(progress.completed_steps);
        sink.report(&progress);
        log_batch(project, "bootstrap", &results);
        Ok(results)
    }

    /// Fetch and write the given issues one by one, pushing once.
    ///
    /// An issue that cannot be fetched fails only its own result unless the
    /// tracker is unreachable altogether.
    pub async fn synchronize_keys(
        &self,
        keys: &[String],
        force_refresh: bool,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<SyncResult>> {
        let mode = WriteMode::from_force(force_refresh);
        let mut progress = ProgressTracker::new(keys.len());
        let mut results = Vec::with_capacity(keys.len());
        let mut committed = false;

        for key in keys {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let result = match self.source.get_issue(key, SYNC_FIELDS, cancel).await {
                Ok(record) => self.write_one(&record, mode).await?,
                Err(e) if matches!(e, SourceError::Cancelled) || e.is_connectivity() => {
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(%key, error = %e, "failed to fetch issue");
                    SyncResult::failed(key, SyncOperation::Update, e)
                }
            };
            committed |= result.commit_hash.is_some();
            results.push(result);
            progress.advance(format!("synced {key}"));
            sink.report(&progress);
        }

        if committed {
            self.push().await?;
        }
        Ok(results)
    }

    /// Keys of issues updated at or after `since`.
    pub async fn find_updated(
        &self,
        project: &str,
        since: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut issues = self
            .scan(&updated_since_jql(project, since), KEY_FIELDS, cancel)
            .await?;
        if self.settings.active_only {
            issues = filter_active_issues(issues);
        }
        Ok(issues.into_iter().map(|issue| issue.key).collect())
    }

    /// Issue files of `project` with no matching issue in the tracker.
    pub async fn find_orphans(&self, project: &str, cancel: &CancellationToken) -> Result<Vec<String>> {
        let prefix = format!("{project}-");
        let local: Vec<String> = self
            .writer
            .list_issue_keys()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(&prefix))
            .collect();
        if local.is_empty() {
            return Ok(Vec::new());
        }

        let remote: HashSet<String> = self
            .scan(&project_jql(project, self.settings.active_only), KEY_FIELDS, cancel)
            .await?
            .into_iter()
            .map(|issue| issue.key)
            .collect();

        let orphans: Vec<String> = local.into_iter().filter(|key| !remote.contains(key)).collect();
        info!(%project, orphans = orphans.len(), "orphan scan finished");
        Ok(orphans)
    }

    /// Delete the files for `keys` and push once.
    pub async fn remove_orphans(
        &self,
        keys: &[String],
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<SyncResult>> {
        let mut progress = ProgressTracker::new(keys.len());
        let mut results = Vec::with_capacity(keys.len());

        for key in keys {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let result = match self.writer.delete_issue_file(key).await {
                Ok(path) => SyncResult::deleted(key, path),
                Err(e) if e.is_item_scoped() => {
                    warn!(%key, error = %e, "failed to remove issue file");
                    SyncResult::failed(key, SyncOperation::Delete, e)
                }
                Err(e) => return Err(e.into()),
            };
            results.push(result);
            progress.advance(format!("removed {key}"));
            sink.report(&progress);
        }

        if results.iter().any(|r| !r.is_failed()) {
            self.push().await?;
        }
        Ok(results)
    }

    // -- internals ----------------------------------------------------------

    async fn push(&self) -> Result<()> {
        self.writer.push_changes(self.branch.as_deref()).await?;
        Ok(())
    }

    /// Every issue matching `jql`, page by page, without duplicates.
    async fn scan(&self, jql: &str, fields: &[&str], cancel: &CancellationToken) -> Result<Vec<IssueRecord>> {
        let mut seen = HashSet::new();
        let mut issues = Vec::new();
        let mut offset = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let page = self
                .source
                .search_issues(jql, offset, self.settings.page_size, fields, cancel)
                .await?;
            let next = page.next_offset();
            issues.extend(page.items.into_iter().filter(|i| seen.insert(i.key.clone())));
            match next {
                Some(n) if n > offset => offset = n,
                _ => break,
            }
        }
        Ok(issues)
    }

    /// Convert and write one issue. Item-scoped write failures become a
    /// failed result; anything else aborts the caller's batch.
    async fn write_one(&self, record: &IssueRecord, mode: WriteMode) -> Result<SyncResult> {
        let data = convert(record);
        match self.writer.create_or_update_issue_file(&data, mode).await {
            Ok(write) => Ok(SyncResult::written(&record.key, write)),
            Err(e) if e.is_item_scoped() => {
                warn!(key = %record.key, error = %e, "failed to write issue file");
                Ok(SyncResult::failed(&record.key, SyncOperation::Update, e))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write `issues`, advancing `progress` per issue. Returns whether
    /// anything was committed.
    #[allow(clippy::too_many_arguments)]
    async fn write_batch(
        &self,
        issues: Vec<IssueRecord>,
        mode: WriteMode,
        seen: &mut HashSet<String>,
        progress: &mut ProgressTracker,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
        results: &mut Vec<SyncResult>,
    ) -> Result<bool> {
        let mut committed = false;
        for issue in issues {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if !seen.insert(issue.key.clone()) {
                debug!(key = %issue.key, "duplicate issue in result set, skipping");
                continue;
            }
            let result = self.write_one(&issue, mode).await?;
            committed |= result.commit_hash.is_some();
            results.push(result);
            progress.advance(format!("synced {}", issue.key));
            sink.report(progress);
        }
        Ok(committed)
    }
}

fn log_batch(project: &str, what: &str, results: &[SyncResult]) {
    let failed = results.iter().filter(|r| r.is_failed()).count();
    let unchanged = results
        .iter()
        .filter(|r| r.status == SyncStatus::Unchanged)
        .count();
    info!(
        %project,
        processed = results.len(),
        unchanged,
        failed,
        "{what} finished"
    );
}

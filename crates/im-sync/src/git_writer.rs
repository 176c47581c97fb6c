use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use im_core::config::GitConfig;
use im_core::markdown::{issue_file_name, issue_key_from_file_name, render_issue_markdown, strip_synced_at};
use im_core::types::IssueData;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GitWriteError {
    #[error("issue key cannot be used as a file name: {0:?}")]
    InvalidKey(String),
    #[error("issue file not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git {command} failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("remote '{remote}' unavailable: {message}")]
    Remote { remote: String, message: String },
    #[error("could not run git: {0}")]
    Spawn(String),
}

pub type Result<T> = std::result::Result<T, GitWriteError>;

impl GitWriteError {
    /// Failure confined to one issue file; the rest of a batch can proceed.
    pub fn is_item_scoped(&self) -> bool {
        matches!(
            self,
            GitWriteError::InvalidKey(_) | GitWriteError::NotFound(_) | GitWriteError::Io(_)
        )
    }

    /// The sink cannot be reached at all.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, GitWriteError::Remote { .. })
    }
}

// ---------------------------------------------------------------------------
// Write types
// ---------------------------------------------------------------------------

/// How an existing issue file is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Leave the file alone when only `syncedAt` would change.
    SkipUnchanged,
    /// Rewrite and commit regardless (forced refresh).
    Overwrite,
}

impl WriteMode {
    pub fn from_force(force_refresh: bool) -> Self {
        if force_refresh {
            WriteMode::Overwrite
        } else {
            WriteMode::SkipUnchanged
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileChange {
    Created,
    Updated,
    Unchanged,
}

/// Outcome of writing one issue file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWrite {
    pub path: PathBuf,
    pub change: FileChange,
    /// Commit recording the change; `None` when nothing was committed.
    pub commit_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoState {
    pub path: PathBuf,
    pub branch: String,
    pub head: Option<String>,
    pub has_remote: bool,
}

// ---------------------------------------------------------------------------
// GitWriter trait
// ---------------------------------------------------------------------------

/// The target repository holding one markdown file per issue.
#[async_trait]
pub trait GitWriter: Send + Sync {
    /// Make the repository usable: clone or init when missing, open otherwise.
    async fn prepare(&self) -> Result<RepoState>;

    /// Bring the local branch up to date with the remote, when there is one.
    async fn refresh(&self) -> Result<RepoState>;

    /// Render `data`, write it and commit it.
    async fn create_or_update_issue_file(&self, data: &IssueData, mode: WriteMode) -> Result<FileWrite>;

    /// Remove the file for `key` and commit the removal.
    async fn delete_issue_file(&self, key: &str) -> Result<PathBuf>;

    /// Push local commits. `None` pushes the configured branch.
    async fn push_changes(&self, branch: Option<&str>) -> Result<()>;

    /// Keys of every issue file currently in the repository, sorted.
    async fn list_issue_keys(&self) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI invocations so they can be mocked in tests.
pub trait GitRunner: Send + Sync {
    /// Run `git <args>` in `dir`. `Err` only when git could not be started.
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Shells out to the `git` binary. Prompts are disabled so a push without
/// credentials fails instead of hanging.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// ShellGitWriter
// ---------------------------------------------------------------------------

/// [`GitWriter`] over the git CLI.
///
/// Every mutating call holds `write_lock` for its whole write/commit/push
/// sequence, so commits and pushes to the repository never interleave.
pub struct ShellGitWriter {
    repo_path: PathBuf,
    issues_dir: String,
    remote: String,
    remote_url: Option<String>,
    branch: String,
    author_name: String,
    author_email: String,
    git: Arc<dyn GitRunner>,
    write_lock: Mutex<()>,
}

impl ShellGitWriter {
    pub fn new(config: &GitConfig) -> Self {
        Self::with_git_runner(config, Arc::new(RealGitRunner))
    }

    /// Use a custom git runner (for testing).
    pub fn with_git_runner(config: &GitConfig, git: Arc<dyn GitRunner>) -> Self {
        Self {
            repo_path: PathBuf::from(&config.repo_path),
            issues_dir: config.issues_dir.clone(),
            remote: config.remote.clone(),
            remote_url: config.remote_url.clone(),
            branch: config.branch.clone(),
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
            git,
            write_lock: Mutex::new(()),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Absolute path of the file for `key`.
    pub fn issue_path(&self, key: &str) -> PathBuf {
        self.repo_path.join(self.relative_issue_path(key))
    }

    fn relative_issue_path(&self, key: &str) -> PathBuf {
        Path::new(&self.issues_dir).join(issue_file_name(key))
    }

    async fn run_in(&self, dir: &Path, args: &[&str]) -> Result<GitOutput> {
        let git = Arc::clone(&self.git);
        let dir = dir.to_string_lossy().into_owned();
        let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = owned.iter().map(String::as_str).collect();
            git.run_git(&dir, &refs)
        })
        .await
        .map_err(|e| GitWriteError::Spawn(e.to_string()))?
        .map_err(GitWriteError::Spawn)
    }

    async fn run(&self, args: &[&str]) -> Result<GitOutput> {
        self.run_in(&self.repo_path, args).await
    }

    /// Like [`run`](Self::run) but a non-zero exit is an error.
    async fn run_ok(&self, args: &[&str]) -> Result<GitOutput> {
        let out = self.run(args).await?;
        if out.success {
            Ok(out)
        } else {
            Err(GitWriteError::Command {
                command: args.join(" "),
                stderr: out.stderr.trim().to_string(),
            })
        }
    }

    fn remote_error(&self, out: &GitOutput) -> GitWriteError {
        GitWriteError::Remote {
            remote: self.remote.clone(),
            message: out.stderr.trim().to_string(),
        }
    }

    async fn has_remote(&self) -> Result<bool> {
        Ok(self.run(&["remote", "get-url", &self.remote]).await?.success)
    }

    async fn head(&self) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--verify", "--quiet", "HEAD"]).await?;
        let hash = out.stdout.trim();
        Ok((out.success && !hash.is_empty()).then(|| hash.to_string()))
    }

    async fn state(&self) -> Result<RepoState> {
        Ok(RepoState {
            path: self.repo_path.clone(),
            branch: self.branch.clone(),
            head: self.head().await?,
            has_remote: self.has_remote().await?,
        })
    }

    /// Commit whatever is staged. `Ok(None)` when there was nothing to commit.
    async fn commit(&self, message: &str) -> Result<Option<String>> {
        let name = format!("user.name={}", self.author_name);
        let email = format!("user.email={}", self.author_email);
        let out = self
            .run(&["-c", &name, "-c", &email, "commit", "-q", "-m", message])
            .await?;
        if !out.success {
            let text = format!("{}{}", out.stdout, out.stderr);
            if text.contains("nothing to commit") || text.contains("no changes added") {
                return Ok(None);
            }
            return Err(GitWriteError::Command {
                command: "commit".into(),
                stderr: out.stderr.trim().to_string(),
            });
        }
        self.head().await
    }
}

fn validate_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('.')
        || key.contains(['/', '\\'])
        || key.contains("..")
        || key.chars().any(char::is_control);
    if bad {
        Err(GitWriteError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

#[async_trait]
impl GitWriter for ShellGitWriter {
    async fn prepare(&self) -> Result<RepoState> {
        let _guard = self.write_lock.lock().await;

        if self.repo_path.join(".git").exists() {
            debug!(repo = %self.repo_path.display(), "opening existing repository");
        } else if let Some(url) = &self.remote_url {
            let parent = self
                .repo_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            tokio::fs::create_dir_all(&parent).await?;
            let target = self.repo_path.to_string_lossy().into_owned();

            info!(%url, repo = %target, "cloning target repository");
            let out = self.run_in(&parent, &["clone", "--quiet", url, &target]).await?;
            if !out.success {
                return Err(self.remote_error(&out));
            }
            // An empty remote has no branch to check out yet.
            if !self.run(&["checkout", "--quiet", &self.branch]).await?.success {
                let head_ref = format!("refs/heads/{}", self.branch);
                self.run_ok(&["symbolic-ref", "HEAD", &head_ref]).await?;
            }
        } else {
            info!(repo = %self.repo_path.display(), "initialising local repository");
            tokio::fs::create_dir_all(&self.repo_path).await?;
            self.run_ok(&["init", "--quiet"]).await?;
            let head_ref = format!("refs/heads/{}", self.branch);
            self.run_ok(&["symbolic-ref", "HEAD", &head_ref]).await?;
        }

        tokio::fs::create_dir_all(self.repo_path.join(&self.issues_dir)).await?;
        self.state().await
    }

    async fn refresh(&self) -> Result<RepoState> {
        let _guard = self.write_lock.lock().await;

        if !self.has_remote().await? {
            debug!("no remote configured, nothing to refresh");
            return self.state().await;
        }

        let out = self.run(&["fetch", "--quiet", &self.remote]).await?;
        if !out.success {
            return Err(self.remote_error(&out));
        }

        let tracking = format!("{}/{}", self.remote, self.branch);
        if self
            .run(&["rev-parse", "--verify", "--quiet", &tracking])
            .await?
            .success
        {
            self.run_ok(&["merge", "--ff-only", "--quiet", &tracking]).await?;
        } else {
            debug!(%tracking, "remote branch does not exist yet");
        }

        let state = self.state().await?;
        info!(head = ?state.head, "repository refreshed");
        Ok(state)
    }

    async fn create_or_update_issue_file(&self, data: &IssueData, mode: WriteMode) -> Result<FileWrite> {
        validate_key(&data.key)?;
        let _guard = self.write_lock.lock().await;

        let path = self.issue_path(&data.key);
        let relative = self.relative_issue_path(&data.key);
        let content = render_issue_markdown(data, Utc::now());

        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        if let (Some(old), WriteMode::SkipUnchanged) = (&existing, mode) {
            if strip_synced_at(old) == strip_synced_at(&content) {
                debug!(key = %data.key, "issue file unchanged");
                return Ok(FileWrite {
                    path,
                    change: FileChange::Unchanged,
                    commit_hash: None,
                });
            }
        }

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, &content).await?;

        let relative = relative.to_string_lossy().into_owned();
        self.run_ok(&["add", "--", &relative]).await?;

        let (change, verb) = if existing.is_some() {
            (FileChange::Updated, "Update")
        } else {
            (FileChange::Created, "Create")
        };
        let message = format!("{verb} {}: {}", data.key, data.summary);
        let commit_hash = self.commit(&message).await?;

        if commit_hash.is_none() {
            return Ok(FileWrite {
                path,
                change: FileChange::Unchanged,
                commit_hash: None,
            });
        }

        debug!(key = %data.key, ?change, commit = ?commit_hash, "issue file committed");
        Ok(FileWrite {
            path,
            change,
            commit_hash,
        })
    }

    async fn delete_issue_file(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        let _guard = self.write_lock.lock().await;

        let path = self.issue_path(key);
        if !path.exists() {
            return Err(GitWriteError::NotFound(key.to_string()));
        }

        let relative = self.relative_issue_path(key).to_string_lossy().into_owned();
        self.run_ok(&["rm", "--quiet", "--", &relative]).await?;
        // `git rm` leaves untracked files in place.
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        self.commit(&format!("Remove {key}")).await?;

        debug!(%key, "issue file removed");
        Ok(path)
    }

    async fn push_changes(&self, branch: Option<&str>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let branch = branch.unwrap_or(&self.branch);

        if !self.has_remote().await? {
            debug!("no remote configured, skipping push");
            return Ok(());
        }
        if self.head().await?.is_none() {
            debug!("no commits yet, skipping push");
            return Ok(());
        }

        let refspec = format!("HEAD:refs/heads/{branch}");
        let out = self.run(&["push", "--quiet", &self.remote, &refspec]).await?;
        if !out.success {
            return Err(self.remote_error(&out));
        }
        info!(remote = %self.remote, %branch, "changes pushed");
        Ok(())
    }

    async fn list_issue_keys(&self) -> Result<Vec<String>> {
        let dir = self.repo_path.join(&self.issues_dir);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(issue_key_from_file_name) {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use im_core::config::SourceConfig;
use im_core::credentials::{CredentialProvider, Credentials};
use im_core::types::{IssuePage, IssueRecord, ProjectInfo, UserInfo, INACTIVE_STATUSES};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Result, SourceError};
use crate::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::retry::RetryPolicy;

/// Fields requested for full issue syncs.
pub const SYNC_FIELDS: &[&str] = &[
    "summary",
    "description",
    "status",
    "issuetype",
    "priority",
    "assignee",
    "reporter",
    "labels",
    "components",
    "fixVersions",
    "parent",
    "created",
    "updated",
];

/// Minimal field set for key/status scans.
pub const KEY_FIELDS: &[&str] = &["status", "updated"];

// ---------------------------------------------------------------------------
// JQL composition
// ---------------------------------------------------------------------------

/// `project = "KEY"`, optionally excluding the inactive statuses.
pub fn project_jql(project: &str, active_only: bool) -> String {
    let mut jql = format!("project = \"{project}\"");
    if active_only {
        let excluded = INACTIVE_STATUSES
            .iter()
            .map(|s| format!("\"{s}\""))
            .collect::<Vec<_>>()
            .join(", ");
        jql.push_str(&format!(" AND status NOT IN ({excluded})"));
    }
    jql.push_str(" ORDER BY key ASC");
    jql
}

/// Issues of `project` updated at or after `since`.
///
/// The bound is an epoch-milliseconds literal. Date strings in a query are
/// read in the searching user's time zone, an epoch value is absolute.
pub fn updated_since_jql(project: &str, since: DateTime<Utc>) -> String {
    format!(
        "project = \"{project}\" AND updated >= {} ORDER BY updated ASC",
        since.timestamp_millis()
    )
}

// ---------------------------------------------------------------------------
// SourceClient trait (for testability)
// ---------------------------------------------------------------------------

/// Access to the remote issue tracker.
///
/// Every call takes the caller's cancellation token; implementations must not
/// issue a request once it has fired.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Verify the configured credentials.
    async fn authenticate(&self, cancel: &CancellationToken) -> Result<()>;

    async fn current_user(&self, cancel: &CancellationToken) -> Result<UserInfo>;

    async fn get_project(&self, key: &str, cancel: &CancellationToken) -> Result<ProjectInfo>;

    async fn search_issues(
        &self,
        jql: &str,
        offset: usize,
        page_size: usize,
        fields: &[&str],
        cancel: &CancellationToken,
    ) -> Result<IssuePage>;

    async fn get_issue(
        &self,
        key: &str,
        fields: &[&str],
        cancel: &CancellationToken,
    ) -> Result<IssueRecord>;

    async fn get_project_issues(
        &self,
        project: &str,
        offset: usize,
        page_size: usize,
        active_only: bool,
        cancel: &CancellationToken,
    ) -> Result<IssuePage> {
        self.search_issues(
            &project_jql(project, active_only),
            offset,
            page_size,
            SYNC_FIELDS,
            cancel,
        )
        .await
    }

    /// Re-read credentials from the secret store. No-op by default.
    async fn reload_credentials(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HttpSourceClient
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    start_at: usize,
    #[serde(default)]
    max_results: usize,
    #[serde(default)]
    total: usize,
    #[serde(default)]
    issues: Vec<IssueRecord>,
}

/// [`SourceClient`] over the tracker's REST API (v2) with basic auth.
#[derive(Debug, Clone)]
pub struct HttpSourceClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<RwLock<Credentials>>,
    source_config: SourceConfig,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl HttpSourceClient {
    /// Build a client, resolving credentials from the secret store. Failure
    /// to resolve them is fatal.
    pub fn new(config: &SourceConfig, limits: RateLimitConfig) -> Result<Self> {
        let credentials = CredentialProvider::resolve(config)?;
        Self::with_credentials(config, limits, credentials)
    }

    /// Build a client with already-resolved credentials.
    pub fn with_credentials(
        config: &SourceConfig,
        limits: RateLimitConfig,
        credentials: Credentials,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SourceError::Connection(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials: Arc::new(RwLock::new(credentials)),
            source_config: config.clone(),
            limiter: Arc::new(RateLimiter::new(limits)),
            retry: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.retry_base_delay_ms),
            ),
        })
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn auth_pair(&self) -> (String, String) {
        let creds = self
            .credentials
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (creds.username().to_string(), creds.token().to_string())
    }

    /// GET `path` with `query`, throttled and retried, decoded as `T`.
    async fn get_json<T>(
        &self,
        path: &str,
        query: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        let body = self
            .retry
            .run(cancel, |attempt| {
                let url = url.clone();
                async move {
                    self.limiter.acquire(cancel).await?;
                    let (username, token) = self.auth_pair();
                    debug!(%url, attempt, "tracker request");

                    let resp = self
                        .http
                        .get(&url)
                        .basic_auth(username, Some(token))
                        .header("Accept", "application/json")
                        .query(query)
                        .send()
                        .await?;

                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }

                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.trim().parse::<u64>().ok());
                    let text = resp.text().await.unwrap_or_default();
                    Err(SourceError::from_status(status.as_u16(), text, retry_after))
                }
            })
            .await?;

        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn authenticate(&self, cancel: &CancellationToken) -> Result<()> {
        let user = self.current_user(cancel).await?;
        info!(
            user = user.name.as_deref().or(user.display_name.as_deref()).unwrap_or("?"),
            "authenticated against tracker"
        );
        Ok(())
    }

    async fn current_user(&self, cancel: &CancellationToken) -> Result<UserInfo> {
        self.get_json("/rest/api/2/myself", &[], cancel).await
    }

    async fn get_project(&self, key: &str, cancel: &CancellationToken) -> Result<ProjectInfo> {
        let path = format!("/rest/api/2/project/{}", urlencoding::encode(key));
        self.get_json(&path, &[], cancel).await
    }

    async fn search_issues(
        &self,
        jql: &str,
        offset: usize,
        page_size: usize,
        fields: &[&str],
        cancel: &CancellationToken,
    ) -> Result<IssuePage> {
        let query = [
            ("jql", jql.to_string()),
            ("startAt", offset.to_string()),
            ("maxResults", page_size.to_string()),
            ("fields", fields.join(",")),
        ];
        let resp: SearchResponse = self.get_json("/rest/api/2/search", &query, cancel).await?;
        debug!(
            jql,
            offset,
            returned = resp.issues.len(),
            total = resp.total,
            "search page fetched"
        );
        Ok(IssuePage {
            total_count: resp.total,
            page_offset: resp.start_at,
            page_size: if resp.max_results == 0 { page_size } else { resp.max_results },
            items: resp.issues,
        })
    }

    async fn get_issue(
        &self,
        key: &str,
        fields: &[&str],
        cancel: &CancellationToken,
    ) -> Result<IssueRecord> {
        let path = format!("/rest/api/2/issue/{}", urlencoding::encode(key));
        self.get_json(&path, &[("fields", fields.join(","))], cancel)
            .await
    }

    async fn reload_credentials(&self) -> Result<()> {
        let fresh = CredentialProvider::resolve(&self.source_config)?;
        let mut guard = self
            .credentials
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = fresh;
        info!("tracker credentials reloaded");
        Ok(())
    }
}

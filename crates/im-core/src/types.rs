use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Issue statuses treated as finished by active-only syncs (case-sensitive).
pub const INACTIVE_STATUSES: [&str; 3] = ["Done", "Closed", "Resolved"];

/// Returns `true` when `status` is one of [`INACTIVE_STATUSES`].
pub fn is_inactive_status(status: &str) -> bool {
    INACTIVE_STATUSES.contains(&status)
}

// ---------------------------------------------------------------------------
// Source representation (tracker REST JSON)
// ---------------------------------------------------------------------------

/// One issue as returned by the tracker's REST API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub key: String,
    #[serde(default)]
    pub fields: IssueFields,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueFields {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<NamedRef>,
    #[serde(default)]
    pub issuetype: Option<NamedRef>,
    #[serde(default)]
    pub priority: Option<NamedRef>,
    #[serde(default)]
    pub assignee: Option<UserRef>,
    #[serde(default)]
    pub reporter: Option<UserRef>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub components: Vec<NamedRef>,
    #[serde(default)]
    pub fix_versions: Vec<NamedRef>,
    #[serde(default)]
    pub parent: Option<ParentRef>,
    /// Tracker timestamps, e.g. `2024-03-01T10:15:30.000+0000`.
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
}

impl UserRef {
    /// Display name, falling back to the login name.
    pub fn label(&self) -> Option<&str> {
        self.display_name.as_deref().or(self.name.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub key: String,
}

impl IssueRecord {
    /// Status name, or an empty string when the tracker omitted it.
    pub fn status_name(&self) -> &str {
        self.fields
            .status
            .as_ref()
            .map(|s| s.name.as_str())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Target representation
// ---------------------------------------------------------------------------

/// Canonical issue shape written to the target repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueData {
    pub key: String,
    pub summary: String,
    pub description: String,
    pub status: String,
    pub issue_type: String,
    pub priority: Option<String>,
    pub assignee: Option<String>,
    pub reporter: Option<String>,
    pub labels: Vec<String>,
    pub components: Vec<String>,
    pub fix_versions: Vec<String>,
    pub parent_key: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tracker metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    #[serde(default)]
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
}

/// One page of a paginated issue search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuePage {
    pub items: Vec<IssueRecord>,
    pub total_count: usize,
    pub page_offset: usize,
    pub page_size: usize,
}

impl IssuePage {
    /// Offset of the page that follows this one, or `None` when the scan is done.
    pub fn next_offset(&self) -> Option<usize> {
        let next = self.page_offset + self.items.len();
        if self.items.is_empty() || next >= self.total_count {
            None
        } else {
            Some(next)
        }
    }
}

//! The per-issue markdown file format.
//!
//! ```text
//! ---
//! key: PROJ-1
//! status: In Progress
//! type: Bug
//! priority: High
//! parent: PROJ-0
//! syncedAt: 2024-01-01T00:00:00Z
//! ---
//!
//! # PROJ-1: Summary text
//!
//! **Status:** In Progress
//! **Assignee:** Alice
//! **Labels:** a, b
//!
//! description body
//! ```
//!
//! `priority` and `parent` appear only when present. Downstream readers rely on
//! the exact `---` delimiters and the `key: value` frontmatter form.

use std::borrow::Cow;
use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::types::IssueData;

pub const FRONTMATTER_DELIMITER: &str = "---";
pub const ISSUE_FILE_EXTENSION: &str = "md";
const SYNCED_AT_PREFIX: &str = "syncedAt: ";

/// File name for an issue, e.g. `PROJ-1.md`.
pub fn issue_file_name(key: &str) -> String {
    format!("{key}.{ISSUE_FILE_EXTENSION}")
}

/// Inverse of [`issue_file_name`]; `None` for anything that is not an issue file.
pub fn issue_key_from_file_name(name: &str) -> Option<&str> {
    let key = name.strip_suffix(".md")?;
    if key.is_empty() || key.starts_with('.') {
        None
    } else {
        Some(key)
    }
}

/// Collapse line breaks so a value cannot end its frontmatter line or the
/// title early.
fn one_line(value: &str) -> Cow<'_, str> {
    if !value.contains(['\n', '\r']) {
        return Cow::Borrowed(value);
    }
    let joined = value
        .split(['\n', '\r'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    Cow::Owned(joined)
}

/// Render the full file content for `data`.
pub fn render_issue_markdown(data: &IssueData, synced_at: DateTime<Utc>) -> String {
    let mut out = String::new();

    // Writing into a String cannot fail.
    let _ = writeln!(out, "{FRONTMATTER_DELIMITER}");
    let _ = writeln!(out, "key: {}", one_line(&data.key));
    let _ = writeln!(out, "status: {}", one_line(&data.status));
    let _ = writeln!(out, "type: {}", one_line(&data.issue_type));
    if let Some(priority) = &data.priority {
        let _ = writeln!(out, "priority: {}", one_line(priority));
    }
    if let Some(parent) = &data.parent_key {
        let _ = writeln!(out, "parent: {}", one_line(parent));
    }
    if !data.components.is_empty() {
        let _ = writeln!(out, "components: {}", one_line(&data.components.join(", ")));
    }
    if !data.fix_versions.is_empty() {
        let _ = writeln!(out, "fixVersions: {}", one_line(&data.fix_versions.join(", ")));
    }
    if let Some(reporter) = &data.reporter {
        let _ = writeln!(out, "reporter: {}", one_line(reporter));
    }
    if let Some(created) = data.created {
        let _ = writeln!(out, "created: {}", format_ts(created));
    }
    if let Some(updated) = data.updated {
        let _ = writeln!(out, "updated: {}", format_ts(updated));
    }
    let _ = writeln!(out, "{SYNCED_AT_PREFIX}{}", format_ts(synced_at));
    let _ = writeln!(out, "{FRONTMATTER_DELIMITER}");
    out.push('\n');

    let _ = writeln!(out, "# {}: {}", one_line(&data.key), one_line(&data.summary));
    out.push('\n');
    let _ = writeln!(out, "**Status:** {}", one_line(&data.status));
    let _ = writeln!(
        out,
        "**Assignee:** {}",
        one_line(data.assignee.as_deref().unwrap_or("Unassigned"))
    );
    let _ = writeln!(out, "**Labels:** {}", one_line(&data.labels.join(", ")));

    let body = data.description.trim_end();
    if !body.is_empty() {
        out.push('\n');
        out.push_str(body);
        out.push('\n');
    }
    out
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Content with the `syncedAt` frontmatter line removed, for change detection.
pub fn strip_synced_at(content: &str) -> String {
    content
        .lines()
        .filter(|line| !line.starts_with(SYNCED_AT_PREFIX))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse the `key: value` pairs of the frontmatter block.
pub fn parse_frontmatter(content: &str) -> Vec<(String, String)> {
    let mut lines = content.lines();
    if lines.next() != Some(FRONTMATTER_DELIMITER) {
        return Vec::new();
    }
    lines
        .take_while(|line| *line != FRONTMATTER_DELIMITER)
        .filter_map(|line| {
            let (k, v) = line.split_once(": ")?;
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

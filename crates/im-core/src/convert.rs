//! Mapping from the tracker's issue representation to [`IssueData`].

use chrono::{DateTime, Utc};

use crate::types::{IssueData, IssueRecord, NamedRef};

/// Convert a source issue into the canonical target shape.
///
/// Total: absent associations (assignee, reporter, parent, priority) become
/// `None` and unparseable timestamps become `None`.
pub fn convert(source: &IssueRecord) -> IssueData {
    let f = &source.fields;
    IssueData {
        key: source.key.clone(),
        summary: f.summary.clone(),
        description: f.description.clone().unwrap_or_default(),
        status: source.status_name().to_string(),
        issue_type: f
            .issuetype
            .as_ref()
            .map(|t| t.name.clone())
            .unwrap_or_default(),
        priority: f.priority.as_ref().map(|p| p.name.clone()),
        assignee: f.assignee.as_ref().and_then(|u| u.label()).map(str::to_string),
        reporter: f.reporter.as_ref().and_then(|u| u.label()).map(str::to_string),
        labels: f.labels.clone(),
        components: names(&f.components),
        fix_versions: names(&f.fix_versions),
        parent_key: f.parent.as_ref().map(|p| p.key.clone()),
        created: f.created.as_deref().and_then(parse_timestamp),
        updated: f.updated.as_deref().and_then(parse_timestamp),
    }
}

fn names(refs: &[NamedRef]) -> Vec<String> {
    refs.iter().map(|r| r.name.clone()).collect()
}

/// Parse tracker timestamps. Accepts RFC 3339 and the `+0000` offset form
/// (`2024-03-01T10:15:30.000+0000`) the REST API emits.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

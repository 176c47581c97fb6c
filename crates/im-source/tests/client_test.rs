//! HttpSourceClient against an in-process tracker stub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use im_core::config::SourceConfig;
use im_core::credentials::Credentials;
use im_source::client::{HttpSourceClient, SourceClient, SYNC_FIELDS};
use im_source::rate_limiter::RateLimitConfig;
use im_source::retry::RetryPolicy;
use im_source::SourceError;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

// ===========================================================================
// Tracker stub
// ===========================================================================

#[derive(Default)]
struct Tracker {
    /// Every search request's query string, in arrival order.
    searches: Mutex<Vec<HashMap<String, String>>>,
    /// Remaining forced 503s for `/myself`.
    flaky_failures: AtomicUsize,
    requests: AtomicUsize,
}

fn issue_json(n: usize, status: &str) -> Value {
    json!({
        "id": format!("{}", 10_000 + n),
        "key": format!("PROJ-{n}"),
        "fields": {
            "summary": format!("Issue {n}"),
            "status": {"name": status},
            "issuetype": {"name": "Task"},
            "labels": ["a"],
            "created": "2024-01-01T00:00:00.000+0000",
            "updated": "2024-01-02T00:00:00.000+0000"
        }
    })
}

async fn myself(State(t): State<Arc<Tracker>>, headers: HeaderMap) -> impl IntoResponse {
    t.requests.fetch_add(1, Ordering::SeqCst);
    if t
        .flaky_failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, "try later".to_string()).into_response();
    }
    // "bot:secret" base64-encoded.
    let expected = "Basic Ym90OnNlY3JldA==";
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(v) if v == expected => {
            Json(json!({"name": "bot", "displayName": "Mirror Bot"})).into_response()
        }
        _ => (StatusCode::UNAUTHORIZED, "bad credentials".to_string()).into_response(),
    }
}

async fn project(Path(key): Path<String>, State(t): State<Arc<Tracker>>) -> impl IntoResponse {
    t.requests.fetch_add(1, Ordering::SeqCst);
    if key == "PROJ" {
        Json(json!({"id": "100", "key": "PROJ", "name": "Project"})).into_response()
    } else {
        (StatusCode::NOT_FOUND, format!("No project could be found with key '{key}'.")).into_response()
    }
}

async fn issue(Path(key): Path<String>, State(t): State<Arc<Tracker>>) -> impl IntoResponse {
    t.requests.fetch_add(1, Ordering::SeqCst);
    match key.as_str() {
        "PROJ-1" => Json(issue_json(1, "Open")).into_response(),
        "PROJ-400" => (StatusCode::BAD_REQUEST, "malformed key".to_string()).into_response(),
        _ => (StatusCode::NOT_FOUND, "Issue does not exist".to_string()).into_response(),
    }
}

async fn search(
    Query(q): Query<HashMap<String, String>>,
    State(t): State<Arc<Tracker>>,
) -> impl IntoResponse {
    t.requests.fetch_add(1, Ordering::SeqCst);
    let start: usize = q.get("startAt").and_then(|s| s.parse().ok()).unwrap_or(0);
    let max: usize = q.get("maxResults").and_then(|s| s.parse().ok()).unwrap_or(50);
    t.searches.lock().unwrap().push(q);
    let total = 5;
    let issues: Vec<Value> = (start..(start + max).min(total))
        .map(|n| issue_json(n + 1, "Open"))
        .collect();
    Json(json!({"startAt": start, "maxResults": max, "total": total, "issues": issues}))
}

async fn spawn_tracker(tracker: Arc<Tracker>) -> String {
    let app = Router::new()
        .route("/rest/api/2/myself", get(myself))
        .route("/rest/api/2/project/{key}", get(project))
        .route("/rest/api/2/issue/{key}", get(issue))
        .route("/rest/api/2/search", get(search))
        .with_state(tracker);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn client(base_url: &str, username: &str, token: &str) -> HttpSourceClient {
    let cfg = SourceConfig {
        base_url: base_url.to_string(),
        ..SourceConfig::default()
    };
    HttpSourceClient::with_credentials(
        &cfg,
        RateLimitConfig::per_second(100),
        Credentials::new(username, token),
    )
    .unwrap()
    .with_retry(RetryPolicy::new(2, Duration::from_millis(5)))
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn authenticate_with_valid_credentials() {
    let url = spawn_tracker(Arc::new(Tracker::default())).await;
    let client = client(&url, "bot", "secret");
    let cancel = CancellationToken::new();

    client.authenticate(&cancel).await.unwrap();
    let user = client.current_user(&cancel).await.unwrap();
    assert_eq!(user.display_name.as_deref(), Some("Mirror Bot"));
}

#[tokio::test]
async fn invalid_credentials_are_authentication_errors() {
    let url = spawn_tracker(Arc::new(Tracker::default())).await;
    let client = client(&url, "bot", "wrong");

    let err = client
        .authenticate(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::Authentication { status: 401, .. }));
    assert!(err.is_connectivity());
}

#[tokio::test]
async fn transient_errors_are_retried() {
    let tracker = Arc::new(Tracker::default());
    tracker.flaky_failures.store(2, Ordering::SeqCst);
    let url = spawn_tracker(tracker.clone()).await;
    let client = client(&url, "bot", "secret");

    client.authenticate(&CancellationToken::new()).await.unwrap();
    assert_eq!(tracker.requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn transient_errors_surface_after_retry_budget() {
    let tracker = Arc::new(Tracker::default());
    tracker.flaky_failures.store(10, Ordering::SeqCst);
    let url = spawn_tracker(tracker.clone()).await;
    let client = client(&url, "bot", "secret");

    let err = client
        .authenticate(&CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        SourceError::Transient { status, message, .. } => {
            assert_eq!(status, Some(503));
            assert_eq!(message, "try later");
        }
        other => panic!("expected transient error, got {other:?}"),
    }
    assert_eq!(tracker.requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn get_project_and_missing_project() {
    let url = spawn_tracker(Arc::new(Tracker::default())).await;
    let client = client(&url, "bot", "secret");
    let cancel = CancellationToken::new();

    let project = client.get_project("PROJ", &cancel).await.unwrap();
    assert_eq!(project.name, "Project");

    let err = client.get_project("NOPE", &cancel).await.unwrap_err();
    assert!(matches!(err, SourceError::NotFound(ref body) if body.contains("NOPE")));
}

#[tokio::test]
async fn get_issue_maps_status_codes() {
    let url = spawn_tracker(Arc::new(Tracker::default())).await;
    let client = client(&url, "bot", "secret");
    let cancel = CancellationToken::new();

    let record = client.get_issue("PROJ-1", SYNC_FIELDS, &cancel).await.unwrap();
    assert_eq!(record.key, "PROJ-1");
    assert_eq!(record.status_name(), "Open");

    let missing = client.get_issue("PROJ-99", SYNC_FIELDS, &cancel).await.unwrap_err();
    assert!(matches!(missing, SourceError::NotFound(_)));

    let bad = client.get_issue("PROJ-400", SYNC_FIELDS, &cancel).await.unwrap_err();
    match bad {
        SourceError::Api { status, body } => {
            assert_eq!(status, 400);
            assert_eq!(body, "malformed key");
        }
        other => panic!("expected api error, got {other:?}"),
    }
}

#[tokio::test]
async fn project_issues_paginate_with_active_filter() {
    let tracker = Arc::new(Tracker::default());
    let url = spawn_tracker(tracker.clone()).await;
    let client = client(&url, "bot", "secret");
    let cancel = CancellationToken::new();

    let first = client
        .get_project_issues("PROJ", 0, 2, true, &cancel)
        .await
        .unwrap();
    assert_eq!(first.items.len(), 2);
    assert_eq!(first.total_count, 5);
    assert_eq!(first.page_offset, 0);
    assert_eq!(first.next_offset(), Some(2));

    let last = client
        .get_project_issues("PROJ", 4, 2, true, &cancel)
        .await
        .unwrap();
    assert_eq!(last.items.len(), 1);
    assert_eq!(last.next_offset(), None);

    let searches = tracker.searches.lock().unwrap();
    let jql = &searches[0]["jql"];
    assert!(jql.contains("status NOT IN (\"Done\", \"Closed\", \"Resolved\")"), "{jql}");
    assert_eq!(searches[1]["startAt"], "4");
    assert!(searches[0]["fields"].contains("fixVersions"));
}

#[tokio::test]
async fn cancelled_call_issues_no_request() {
    let tracker = Arc::new(Tracker::default());
    let url = spawn_tracker(tracker.clone()).await;
    let client = client(&url, "bot", "secret");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = client.get_project("PROJ", &cancel).await.unwrap_err();
    assert!(matches!(err, SourceError::Cancelled));
    assert_eq!(tracker.requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unreachable_tracker_is_connectivity_error() {
    // Bind then drop to get a port nothing listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client(&format!("http://{addr}"), "bot", "secret");
    let err = client
        .get_project("PROJ", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_connectivity(), "expected connectivity error, got {err:?}");
}

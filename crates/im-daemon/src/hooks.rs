//! Trigger hook: lets external systems ask for an earlier-than-scheduled
//! poll. Issue data never travels through this endpoint.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use im_orchestrator::OperationKind;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const SECRET_HEADER: &str = "x-hook-secret";

#[derive(Debug, Default, Deserialize)]
struct TriggerRequest {
    #[serde(default)]
    kind: Option<OperationKind>,
}

#[derive(Clone)]
pub struct HookState {
    triggers: flume::Sender<OperationKind>,
    secret: Option<Arc<str>>,
}

impl HookState {
    /// `secret`: when set, every request must present it in `X-Hook-Secret`.
    pub fn new(triggers: flume::Sender<OperationKind>, secret: Option<String>) -> Self {
        Self {
            triggers,
            secret: secret.filter(|s| !s.is_empty()).map(Arc::from),
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.secret else {
            return true;
        };
        headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|provided| bool::from(provided.as_bytes().ct_eq(expected.as_bytes())))
    }
}

pub fn hook_router(state: HookState) -> Router {
    Router::new()
        .route("/hooks/trigger", post(trigger))
        .with_state(state)
}

async fn trigger(State(state): State<HookState>, headers: HeaderMap, body: Bytes) -> Response {
    if !state.authorized(&headers) {
        warn!("trigger hook rejected: bad or missing secret");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "unauthorized"})),
        )
            .into_response();
    }

    let request: TriggerRequest = if body.iter().all(u8::is_ascii_whitespace) {
        TriggerRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": format!("invalid trigger body: {e}")})),
                )
                    .into_response();
            }
        }
    };
    let kind = request.kind.unwrap_or(OperationKind::Reconcile);

    match state.triggers.try_send(kind) {
        Ok(()) => info!(%kind, "trigger hook accepted"),
        // A trigger is already queued; this one folds into it.
        Err(flume::TrySendError::Full(_)) => info!(%kind, "trigger hook coalesced"),
        Err(flume::TrySendError::Disconnected(_)) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"error": "daemon is shutting down"})),
            )
                .into_response();
        }
    }
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"accepted": true, "kind": kind.to_string()})),
    )
        .into_response()
}

/// Serve the hook router until `shutdown` fires.
pub async fn serve_hooks(
    listener: tokio::net::TcpListener,
    state: HookState,
    shutdown: CancellationToken,
) {
    let router = hook_router(state);
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        error!(error = %e, "trigger hook server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn request(secret: Option<&str>, body: &'static str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/hooks/trigger")
            .header("content-type", "application/json");
        if let Some(s) = secret {
            builder = builder.header(SECRET_HEADER, s);
        }
        builder.body(Body::from(body)).unwrap()
    }

    #[tokio::test]
    async fn accepts_with_matching_secret() {
        let (tx, rx) = flume::bounded(4);
        let app = hook_router(HookState::new(tx, Some("hunter2".into())));

        let resp = app
            .oneshot(request(Some("hunter2"), r#"{"kind": "cleanup"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(rx.try_recv().unwrap(), OperationKind::Cleanup);
    }

    #[tokio::test]
    async fn rejects_wrong_or_missing_secret() {
        let (tx, rx) = flume::bounded(4);
        let app = hook_router(HookState::new(tx, Some("hunter2".into())));

        let resp = app.clone().oneshot(request(Some("hunter3"), "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let resp = app.oneshot(request(None, "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn empty_body_means_reconcile() {
        let (tx, rx) = flume::bounded(4);
        let app = hook_router(HookState::new(tx, None));

        let resp = app.oneshot(request(None, "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(rx.try_recv().unwrap(), OperationKind::Reconcile);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let (tx, rx) = flume::bounded(4);
        let app = hook_router(HookState::new(tx, None));

        let resp = app.oneshot(request(None, r#"{"kind": "resync"}"#)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn queued_trigger_coalesces() {
        let (tx, rx) = flume::bounded(1);
        let app = hook_router(HookState::new(tx, None));

        for _ in 0..3 {
            let resp = app.clone().oneshot(request(None, "")).await.unwrap();
            assert_eq!(resp.status(), StatusCode::ACCEPTED);
        }
        assert_eq!(rx.len(), 1);
    }

    #[tokio::test]
    async fn closed_daemon_is_unavailable() {
        let (tx, rx) = flume::bounded(1);
        drop(rx);
        let app = hook_router(HookState::new(tx, None));

        let resp = app.oneshot(request(None, "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

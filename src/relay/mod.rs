//! Result relay service.
//!
//! CI posts results here; the relay keeps the latest results per request for
//! the backend poll channel and rebroadcasts every payload to push
//! subscribers over server-sent events.

pub mod signature;

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::Stream;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::backend::{PushMessage, StoredResults};
use crate::model::RequestId;
use crate::settings::RelaySettings;

pub use signature::{sign, verify, SignatureError, SIGNATURE_HEADER};

/// Buffered push events per subscriber before it starts lagging.
const EVENT_BUFFER: usize = 256;

/// Relay server failures.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The server stopped with an I/O error.
    #[error("relay server error: {0}")]
    Serve(#[from] std::io::Error),
}

struct RelayInner {
    results: Mutex<HashMap<RequestId, StoredResults>>,
    events: broadcast::Sender<PushMessage>,
    secret: Option<String>,
    retention: chrono::Duration,
}

/// Shared relay state: stored results and the push fan-out.
#[derive(Clone)]
pub struct RelayState {
    inner: Arc<RelayInner>,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new(None, Duration::from_secs(3600))
    }
}

impl RelayState {
    pub fn new(secret: Option<String>, retention: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(RelayInner {
                results: Mutex::new(HashMap::new()),
                events,
                secret: secret.filter(|s| !s.is_empty()),
                retention: chrono::Duration::from_std(retention)
                    .unwrap_or_else(|_| chrono::Duration::hours(1)),
            }),
        }
    }

    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self::new(
            settings.webhook_secret.clone(),
            Duration::from_secs(settings.retention_secs),
        )
    }

    fn results_lock(&self) -> MutexGuard<'_, HashMap<RequestId, StoredResults>> {
        self.inner.results.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn purge_expired(results: &mut HashMap<RequestId, StoredResults>, retention: chrono::Duration) {
        let cutoff = Utc::now() - retention;
        results.retain(|_, stored| stored.updated_at >= cutoff);
    }

    /// Store and broadcast a payload. Returns the number of results it carried.
    pub fn record(&self, message: PushMessage) -> usize {
        let count = message.results.len();
        if let Some(request_id) = &message.request_id {
            let mut results = self.results_lock();
            Self::purge_expired(&mut results, self.inner.retention);
            let stored = results
                .entry(request_id.clone())
                .or_insert_with(|| StoredResults {
                    request_id: request_id.clone(),
                    subject_id: message.subject_id.clone(),
                    results: Vec::new(),
                    updated_at: Utc::now(),
                });
            for result in &message.results {
                match stored
                    .results
                    .iter_mut()
                    .find(|existing| existing.test_case_id == result.test_case_id)
                {
                    Some(existing) => *existing = result.clone(),
                    None => stored.results.push(result.clone()),
                }
            }
            if stored.subject_id.is_none() {
                stored.subject_id = message.subject_id.clone();
            }
            stored.updated_at = Utc::now();
        }

        // No subscribers is fine; the results are still stored.
        let _ = self.inner.events.send(message);
        count
    }

    /// Stored results for a request, if any and not expired.
    pub fn results(&self, request_id: &RequestId) -> Option<StoredResults> {
        let mut results = self.results_lock();
        Self::purge_expired(&mut results, self.inner.retention);
        results.get(request_id).cloned()
    }

    /// Receive every payload recorded from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PushMessage> {
        self.inner.events.subscribe()
    }

    fn check_signature(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), SignatureError> {
        let Some(secret) = self.inner.secret.as_deref() else {
            return Ok(());
        };
        let header = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok());
        verify(secret.as_bytes(), body, header)
    }
}

/// Router with every relay endpoint.
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/webhook/results", post(receive_results))
        .route("/api/results/{request_id}", get(stored_results))
        .route("/api/events", get(events))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Serve the relay on `bind` until `shutdown` resolves.
pub async fn serve<F>(bind: &str, state: RelayState, shutdown: F) -> Result<(), RelayError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind).await.map_err(|source| RelayError::Bind {
        addr: bind.to_string(),
        source,
    })?;
    let local = listener.local_addr().map_err(RelayError::Serve)?;
    info!(addr = %local, "result relay listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("result relay stopped");
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn receive_results(
    State(state): State<RelayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(error) = state.check_signature(&headers, &body) {
        warn!(%error, "rejecting webhook");
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": error.to_string() })))
            .into_response();
    }

    let message: PushMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(error) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid payload: {}", error) })),
            )
                .into_response();
        }
    };
    if message.request_id.is_none() && message.subject_id.is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "payload needs a request_id or subject_id" })),
        )
            .into_response();
    }

    debug!(
        request_id = ?message.request_id,
        subject = ?message.subject_id,
        results = message.results.len(),
        "webhook received"
    );
    let accepted = state.record(message);
    (StatusCode::ACCEPTED, Json(json!({ "accepted": accepted }))).into_response()
}

async fn stored_results(
    State(state): State<RelayState>,
    Path(request_id): Path<String>,
) -> Response {
    match state.results(&RequestId::new(request_id)) {
        Some(stored) => Json(stored).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn events(
    State(state): State<RelayState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.subscribe();
    let stream = futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(message) => match Event::default().json_data(&message) {
                    Ok(event) => return Some((Ok(event), receiver)),
                    Err(error) => warn!(%error, "failed to encode push event"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "push subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn webhook(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/webhook/results")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(RelayState::default())
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_webhook_results_are_stored_latest_wins() {
        let state = RelayState::default();
        let mut events = state.subscribe();

        let first = r#"{"requestId":"exec-1","results":[{"testCaseId":"TC_001","status":"running"},{"testCaseId":"TC_002","status":"passed"}]}"#;
        let second = r#"{"request_id":"exec-1","results":[{"test_case_id":"TC_001","status":"failed"}]}"#;
        for body in [first, second] {
            let response = router(state.clone()).oneshot(webhook(body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);
        }

        let response = router(state.clone())
            .oneshot(Request::get("/api/results/exec-1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stored: StoredResults = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(stored.results.len(), 2);
        assert_eq!(stored.results[0].test_case_id, "TC_001");
        assert_eq!(stored.results[0].status, crate::model::TestStatus::Failed);

        assert_eq!(events.recv().await.unwrap().results.len(), 2);
        assert_eq!(events.recv().await.unwrap().results.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_request_is_not_found() {
        let response = router(RelayState::default())
            .oneshot(Request::get("/api/results/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_payload_without_ids_is_rejected() {
        let response = router(RelayState::default())
            .oneshot(webhook(r#"{"results":[]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_signature_required_when_secret_configured() {
        let state = RelayState::new(Some("s3cret".to_string()), Duration::from_secs(60));
        let body = r#"{"requestId":"exec-1","results":[]}"#;

        let response = router(state.clone()).oneshot(webhook(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut request = webhook(body);
        request.headers_mut().insert(
            SIGNATURE_HEADER,
            sign(b"s3cret", body.as_bytes()).unwrap().parse().unwrap(),
        );
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}

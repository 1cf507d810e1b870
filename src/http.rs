use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::protocol::{CallOutcome, RecognitionRequest, TIMEOUT_SENTINEL};
use crate::relay::SpeechRelay;
use crate::RelayError;

/// Build the inbound HTTP surface around a relay
pub fn router(relay: Arc<SpeechRelay>) -> Router {
    Router::new()
        .route("/speech_detection_sphinx4", post(recognize))
        .route("/health", get(health))
        .with_state(relay)
}

/// Accept one recognition call and answer with its outcome
///
/// The handler responds exactly once: the backend payload on resolution, the
/// literal `"false"` sentinel on timeout, and the error taxonomy otherwise.
async fn recognize(
    State(relay): State<Arc<SpeechRelay>>,
    Json(request): Json<RecognitionRequest>,
) -> Response {
    match relay.recognize(request).await {
        Ok(CallOutcome::Reply(payload)) => Json(payload).into_response(),
        Ok(CallOutcome::TimedOut) => {
            debug!("answering caller with the timeout sentinel");
            (StatusCode::OK, TIMEOUT_SENTINEL).into_response()
        }
        Ok(CallOutcome::Disconnected) => (
            StatusCode::BAD_GATEWAY,
            "recognition backend disconnected before answering",
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn health(State(relay): State<Arc<SpeechRelay>>) -> Response {
    let stats = relay.stats().await;
    Json(json!({
        "status": "ok",
        "backend_connected": relay.backend_connected().await,
        "stats": stats,
    }))
    .into_response()
}

/// Map the error taxonomy onto HTTP statuses
fn error_response(err: RelayError) -> Response {
    let status = match &err {
        RelayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        RelayError::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
        RelayError::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::Io(_) | RelayError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

//! Router assembly and request handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;

use switchboard::types::{Request, RequestPayload, UserTier};
use switchboard::Orchestrator;

use crate::dto::{ApiError, ChatBody, ChatResponse, ResearchBody, SearchBody, SynthesisResponse};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// The orchestration core.
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat/complete", post(chat_complete))
        .route("/chat/stream", post(chat_stream))
        .route("/search/basic", post(search_basic))
        .route("/research/deep-dive", post(research_deep_dive))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(metrics))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Caller identity from headers. Authentication proper lives in front of
/// the gateway; anonymous callers are identified by their address header.
fn identity(headers: &HeaderMap) -> (String, UserTier) {
    let tier = headers
        .get("x-user-tier")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| serde_json::from_value(serde_json::Value::String(v.to_string())).ok())
        .unwrap_or(UserTier::Anonymous);
    let user = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .map(|v| format!("ip:{}", v.split(',').next().unwrap_or(v).trim()))
        })
        .unwrap_or_else(|| "anonymous".to_string());
    (user, tier)
}

fn chat_request(headers: &HeaderMap, body: ChatBody) -> Request {
    let (user, tier) = identity(headers);
    let mut request = Request::new(
        user,
        tier,
        RequestPayload::Chat {
            history: body.history,
            message: body.message,
        },
    );
    request.session_id = body.session_id;
    request.constraints = body.constraints;
    request
}

async fn chat_complete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Result<Json<ChatResponse>, ApiError> {
    let request = chat_request(&headers, body);
    let correlation_id = request.id;
    tracing::info!(%correlation_id, "chat request accepted");
    let response = state.orchestrator.handle(request).await.map_err(ApiError)?;
    Ok(Json(response.into()))
}

async fn chat_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Result<Response, ApiError> {
    let request = chat_request(&headers, body);
    let correlation_id = request.id;
    tracing::info!(%correlation_id, "chat stream accepted");

    let (cancel_handle, frames) = state.orchestrator.handle_stream(request).map_err(ApiError)?;

    // The cancel handle rides inside the body stream: when the client
    // disconnects, axum drops the body, the handle drops, and cancellation
    // propagates into the executor.
    let lines = frames.map(move |frame| {
        let _keep_alive = &cancel_handle;
        let mut line = serde_json::to_vec(&frame).unwrap_or_else(|_| b"{}".to_vec());
        line.push(b'\n');
        Ok::<_, Infallible>(line)
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(lines))
        .map_err(|e| ApiError(switchboard::Error::Internal(e.to_string())))?;
    Ok(response)
}

async fn search_basic(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SearchBody>,
) -> Result<Json<SynthesisResponse>, ApiError> {
    let (user, tier) = identity(&headers);
    let mut request = Request::new(
        user,
        tier,
        RequestPayload::Search {
            query: body.query,
            filters: body.filters,
            max_results: body.max_results.unwrap_or(10),
        },
    );
    request.constraints = body.constraints;
    tracing::info!(correlation_id = %request.id, "search request accepted");
    let response = state.orchestrator.handle(request).await.map_err(ApiError)?;
    Ok(Json(response.into()))
}

async fn research_deep_dive(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ResearchBody>,
) -> Result<Json<SynthesisResponse>, ApiError> {
    let (user, tier) = identity(&headers);
    let mut request = Request::new(
        user,
        tier,
        RequestPayload::Research {
            question: body.research_question,
            depth: body.depth,
        },
    );
    request.constraints = body.constraints;
    tracing::info!(correlation_id = %request.id, "research request accepted");
    let response = state.orchestrator.handle(request).await.map_err(ApiError)?;
    Ok(Json(response.into()))
}

async fn health_live() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn health_ready(State(state): State<AppState>) -> impl IntoResponse {
    if state.orchestrator.ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no healthy backend")
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.orchestrator.context().metrics.export() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to export metrics: {e}"),
        )
            .into_response(),
    }
}

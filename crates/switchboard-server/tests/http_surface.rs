//! HTTP surface tests over an in-process router.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request as HttpRequest, StatusCode};
use http_body_util::BodyExt;
use tower::util::ServiceExt;

use switchboard::backend::{
    BackendClient, ChunkStream, GenerateChunk, GenerateRequest, GenerateResponse,
};
use switchboard::error::Result;
use switchboard::GatewayConfig;
use switchboard_server::{build_orchestrator, router, AppState};

struct EchoBackend;

#[async_trait::async_trait]
impl BackendClient for EchoBackend {
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        Ok(GenerateResponse {
            response: format!("echo from {}", request.model),
            prompt_tokens: 5,
            completion_tokens: 10,
        })
    }
    async fn generate_stream(&self, request: &GenerateRequest) -> Result<ChunkStream> {
        let text = format!("echo from {} over the stream", request.model);
        let chunks: Vec<Result<GenerateChunk>> = text
            .split_inclusive(' ')
            .map(|word| {
                Ok(GenerateChunk {
                    delta: word.to_string(),
                    done: false,
                    completion_tokens: 0,
                })
            })
            .chain(std::iter::once(Ok(GenerateChunk {
                delta: String::new(),
                done: true,
                completion_tokens: 6,
            })))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec!["llama3.1:8b".into(), "phi3:mini".into()])
    }
    async fn load_model(&self, _model: &str) -> Result<()> {
        Ok(())
    }
    fn endpoint_url(&self) -> &str {
        "http://echo:11434"
    }
}

async fn app() -> axum::Router {
    let mut config = GatewayConfig::default();
    config.stream_chunk_min_ms = 0;
    let backends = vec![Arc::new(EchoBackend) as Arc<dyn BackendClient>];
    let (orchestrator, _limiter, pool) = build_orchestrator(config, backends, None).unwrap();
    pool.probe_all().await;
    router(AppState { orchestrator })
}

fn json_post(uri: &str, body: serde_json::Value) -> HttpRequest<Body> {
    HttpRequest::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-user-id", "tester")
        .header("x-user-tier", "pro")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_live() {
    let app = app().await;
    let response = app
        .oneshot(
            HttpRequest::builder()
                .uri("/health/live")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_health_ready_requires_healthy_backend() {
    let app = app().await;
    let response = app
        .oneshot(
            HttpRequest::builder()
                .uri("/health/ready")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_chat_complete_round_trip() {
    let app = app().await;
    let response = app
        .oneshot(json_post(
            "/chat/complete",
            serde_json::json!({"message": "hello there", "session_id": "s1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body["answer"].as_str().unwrap().starts_with("echo from"));
    assert!(body["correlation_id"].as_str().is_some());
    assert_eq!(body["cache_hit"], serde_json::json!(false));
}

#[tokio::test]
async fn test_chat_complete_validation_error() {
    let app = app().await;
    let response = app
        .oneshot(json_post(
            "/chat/complete",
            serde_json::json!({"message": "   "}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], serde_json::json!("validation_error"));
}

#[tokio::test]
async fn test_chat_stream_frames() {
    let app = app().await;
    let response = app
        .oneshot(json_post(
            "/chat/stream",
            serde_json::json!({"message": "stream please", "session_id": "s2"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let frames: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert!(frames.len() >= 2);
    let last = frames.last().unwrap();
    assert_eq!(last["done"], serde_json::json!(true));
    assert!(last["summary"]["correlation_id"].as_str().is_some());
    for frame in &frames[..frames.len() - 1] {
        assert_eq!(frame["done"], serde_json::json!(false));
    }
}

#[tokio::test]
async fn test_research_deep_dive() {
    let app = app().await;
    let response = app
        .oneshot(json_post(
            "/research/deep-dive",
            serde_json::json!({
                "research_question": "how do sliding window limiters bound memory",
                "depth": "shallow",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body["answer"].as_str().unwrap().starts_with("echo from"));
}

#[tokio::test]
async fn test_metrics_exposition() {
    let app = app().await;
    // Generate one request so counters exist.
    let _ = app
        .clone()
        .oneshot(json_post(
            "/chat/complete",
            serde_json::json!({"message": "metric me"}),
        ))
        .await
        .unwrap();
    let response = app
        .oneshot(
            HttpRequest::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("switchboard_requests_total"));
}

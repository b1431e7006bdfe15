//! HTTP surface: `/scan`, `/authenticate` and `/health`.

use crate::engine::{EngineError, FaceEngine};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, FromRequest, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    engine: Arc<FaceEngine>,
}

impl AppState {
    pub fn new(engine: FaceEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/scan", post(scan))
        .route("/authenticate", post(authenticate))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
}

// --- Wire types ---

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub id: String,
    pub images: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResponse {
    pub is_register_completed: bool,
}

#[derive(Debug, Deserialize)]
pub struct AuthenticateRequest {
    pub id: String,
    pub image: String,
}

#[derive(Debug, Serialize)]
pub struct AuthenticateResponse {
    pub passcode: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

/// JSON extractor whose rejections use the service's error body.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct Json<T>(pub T);

impl<T: Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}

/// Error with status code and a stable snake_case code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, message = %self.message, "request failed");
        } else {
            tracing::warn!(code = self.code, message = %self.message, "request rejected");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return Self::new(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", rejection.body_text());
        }
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", rejection.body_text())
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::InvalidIdentity(_) => Self::new(StatusCode::BAD_REQUEST, "invalid_identity", message),
            EngineError::Decode(_) => Self::new(StatusCode::BAD_REQUEST, "invalid_image", message),
            EngineError::NoFaceDetected => Self::new(StatusCode::UNPROCESSABLE_ENTITY, "no_face_detected", message),
            EngineError::ModelNotFound(_) => Self::new(StatusCode::NOT_FOUND, "model_not_found", message),
            EngineError::Store(_) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", message),
            EngineError::Detector(_) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "detector_error", message),
            EngineError::Recognizer(_) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "recognizer_error", message),
        }
    }
}

// --- Handlers ---

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn scan(State(state): State<AppState>, Json(req): Json<ScanRequest>) -> Result<Json<ScanResponse>, ApiError> {
    tracing::info!(identity = %req.id, images = req.images.len(), "scan requested");
    let engine = state.engine.clone();
    tokio::task::spawn_blocking(move || engine.register(&req.id, &req.images))
        .await
        .map_err(|e| ApiError::internal(format!("registration task failed: {e}")))??;

    Ok(Json(ScanResponse {
        is_register_completed: true,
    }))
}

async fn authenticate(
    State(state): State<AppState>,
    Json(req): Json<AuthenticateRequest>,
) -> Result<Json<AuthenticateResponse>, ApiError> {
    tracing::info!(identity = %req.id, "authenticate requested");
    let engine = state.engine.clone();
    let outcome = tokio::task::spawn_blocking(move || engine.authenticate(&req.id, &req.image))
        .await
        .map_err(|e| ApiError::internal(format!("authentication task failed: {e}")))??;

    Ok(Json(AuthenticateResponse {
        passcode: outcome.passcode,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{encode, engine_with, flat_face, ramp_face};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const BODY_LIMIT: usize = 8 * 1024 * 1024;

    fn app() -> (tempfile::TempDir, Router) {
        let (dir, _store, engine) = engine_with(None);
        (dir, router(AppState::new(engine), BODY_LIMIT))
    }

    async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        send(app, uri, Body::from(body.to_string())).await
    }

    async fn send(app: &Router, uri: &str, body: Body) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, app) = app();
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_register_then_authenticate() {
        let (_dir, app) = app();
        let face = encode(ramp_face());

        let (status, body) = post_json(&app, "/scan", json!({"id": "alice", "images": [face, face, face]})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"isRegisterCompleted": true}));

        let (status, body) = post_json(&app, "/authenticate", json!({"id": "alice", "image": face})).await;
        assert_eq!(status, StatusCode::OK);
        let passcode = body["passcode"].as_str().unwrap();
        assert_eq!(passcode.len(), 6);
        assert!(passcode.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_unrelated_face_gets_null_passcode() {
        let (_dir, app) = app();
        post_json(&app, "/scan", json!({"id": "alice", "images": [encode(ramp_face())]})).await;

        let (status, body) =
            post_json(&app, "/authenticate", json!({"id": "alice", "image": encode(flat_face())})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"passcode": null}));
    }

    #[tokio::test]
    async fn test_unknown_identity_is_not_found() {
        let (_dir, app) = app();
        let (status, body) =
            post_json(&app, "/authenticate", json!({"id": "ghost", "image": encode(ramp_face())})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "model_not_found");
    }

    #[tokio::test]
    async fn test_missing_field_is_bad_request() {
        let (_dir, app) = app();
        let (status, body) = post_json(&app, "/scan", json!({"id": "alice"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let (_dir, app) = app();
        let (status, body) = send(&app, "/authenticate", Body::from("{\"id\": ")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn test_bad_image_is_bad_request() {
        let (_dir, app) = app();
        let (status, body) = post_json(&app, "/scan", json!({"id": "alice", "images": ["***"]})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "invalid_image");
    }

    #[tokio::test]
    async fn test_invalid_identity_is_bad_request() {
        let (_dir, app) = app();
        let (status, body) =
            post_json(&app, "/scan", json!({"id": "../alice", "images": [encode(ramp_face())]})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "invalid_identity");
    }

    #[tokio::test]
    async fn test_empty_batch_reports_no_face() {
        let (_dir, app) = app();
        let (status, body) = post_json(&app, "/scan", json!({"id": "alice", "images": []})).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "no_face_detected");
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let (_dir, _store, engine) = engine_with(None);
        let app = router(AppState::new(engine), 1024);
        let big = "A".repeat(4096);
        let (status, body) = post_json(&app, "/authenticate", json!({"id": "alice", "image": big})).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"]["code"], "payload_too_large");
    }
}

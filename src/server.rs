use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::logging::{RequestLogger, SharedLogger};
use crate::proxy::{self, ProxyResult, Upstream, UpstreamFailure};
use crate::translate::openai_types::{ChatCompletionRequest, EmbeddingsRequest};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    pub client: reqwest::Client,
    pub logger: SharedLogger,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat/completions", post(handle_chat))
        .route("/chat/completions", post(handle_chat))
        .route("/v1/embeddings", post(handle_embeddings))
        .route("/embeddings", post(handle_embeddings))
        .route("/v1/models", get(handle_models))
        .route("/models", get(handle_models))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}

impl IntoResponse for UpstreamFailure {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut builder = Response::builder().status(status);
        if let Some(ref content_type) = self.content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        builder
            .body(Body::from(self.body))
            .unwrap_or_else(|_| status.into_response())
    }
}

/// Upstream key: the client's bearer token, else the configured env var.
fn api_key(headers: &HeaderMap, config: &GatewayConfig) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .or_else(|| config.env_api_key())
}

fn request_logger(state: &AppState) -> RequestLogger {
    state.logger.for_request(uuid::Uuid::new_v4().to_string())
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, GatewayError> {
    serde_json::from_slice(body).map_err(|e| GatewayError::InvalidRequest(e.to_string()))
}

/// Map a proxy outcome to a response, logging gateway-side failures.
fn respond<T: Serialize>(
    log: &RequestLogger,
    result: crate::error::Result<ProxyResult<T>>,
) -> Response {
    match result {
        Ok(ProxyResult::Success(body)) => Json(body).into_response(),
        Ok(ProxyResult::Upstream(failure)) => failure.into_response(),
        Err(e) => fail(log, e),
    }
}

fn fail(log: &RequestLogger, e: GatewayError) -> Response {
    if e.is_client_error() {
        log.warn("server", format!("Rejected request: {e}"));
    } else {
        log.error("server", format!("Gateway error: {e}"));
    }
    e.into_response()
}

async fn handle_chat(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let log = request_logger(&state);

    let req: ChatCompletionRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(e) => return fail(&log, e),
    };

    log.info(
        "server",
        format!(
            "Chat request: model={} streaming={} messages={}",
            req.model.as_deref().unwrap_or("-"),
            req.is_streaming(),
            req.messages.len()
        ),
    );

    let key = api_key(&headers, &state.config);
    let upstream = Upstream {
        config: &state.config,
        client: &state.client,
        api_key: key.as_deref(),
        log: &log,
    };

    if !req.is_streaming() {
        return respond(&log, proxy::proxy_chat(&req, &upstream).await);
    }

    match proxy::proxy_chat_streaming(&req, &upstream).await {
        Ok(ProxyResult::Success(stream)) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Ok(ProxyResult::Upstream(failure)) => failure.into_response(),
        Err(e) => fail(&log, e),
    }
}

async fn handle_embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let log = request_logger(&state);

    let req: EmbeddingsRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(e) => return fail(&log, e),
    };

    let key = api_key(&headers, &state.config);
    let upstream = Upstream {
        config: &state.config,
        client: &state.client,
        api_key: key.as_deref(),
        log: &log,
    };

    respond(&log, proxy::proxy_embeddings(&req, &upstream).await)
}

async fn handle_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let log = request_logger(&state);
    let key = api_key(&headers, &state.config);
    let upstream = Upstream {
        config: &state.config,
        client: &state.client,
        api_key: key.as_deref(),
        log: &log,
    };

    respond(&log, proxy::proxy_models(&upstream).await)
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

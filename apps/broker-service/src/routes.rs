use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use topic_bus::Severity;
use tracing::{info, warn};

use crate::auth::AuthPayload;
use crate::metrics;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct HandleRequest {
    pub action: String,
    #[serde(default)]
    pub auth_payload: Option<AuthPayload>,
    #[serde(default)]
    pub log_payload: Option<LogRequest>,
}

#[derive(Debug, Deserialize)]
pub struct LogRequest {
    pub name: String,
    pub data: String,
    #[serde(default)]
    pub severity: Option<Severity>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ApiResponse {
    pub error: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApiResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            error: false,
            message: message.into(),
            data: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            error: true,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Serialize)]
struct Welcome {
    success: bool,
    message: &'static str,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(welcome))
        .route("/handle", post(handle_submission))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn welcome() -> Json<Welcome> {
    Json(Welcome {
        success: true,
        message: "Welcome to broker service",
    })
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

fn reply(action: &str, status: StatusCode, body: ApiResponse) -> Response {
    let result = if body.error { "error" } else { "ok" };
    metrics::REQUESTS.with_label_values(&[action, result]).inc();
    (status, Json(body)).into_response()
}

async fn handle_submission(
    State(state): State<AppState>,
    body: Result<Json<HandleRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return reply(
                "invalid",
                StatusCode::BAD_REQUEST,
                ApiResponse::error(rejection.body_text()),
            );
        }
    };

    match request.action.as_str() {
        "log" => match request.log_payload {
            Some(payload) => log_via_broker(&state, payload).await,
            None => reply(
                "log",
                StatusCode::BAD_REQUEST,
                ApiResponse::error("log action requires log_payload"),
            ),
        },
        "auth" => match request.auth_payload {
            Some(payload) => authenticate(&state, payload).await,
            None => reply(
                "auth",
                StatusCode::BAD_REQUEST,
                ApiResponse::error("auth action requires auth_payload"),
            ),
        },
        other => {
            warn!(action = other, "unknown action");
            reply(
                "unknown",
                StatusCode::BAD_REQUEST,
                ApiResponse::error("Unknown action"),
            )
        }
    }
}

async fn log_via_broker(state: &AppState, payload: LogRequest) -> Response {
    let severity = payload.severity.unwrap_or_default();
    match state
        .emitter()
        .emit_log(&payload.name, &payload.data, severity)
        .await
    {
        Ok(()) => {
            info!(name = %payload.name, routing_key = severity.routing_key(), "log event published");
            reply(
                "log",
                StatusCode::ACCEPTED,
                ApiResponse::ok("logged via message broker"),
            )
        }
        Err(err) => {
            warn!(error = %err, "failed to publish log event");
            reply("log", StatusCode::BAD_REQUEST, ApiResponse::error(err.to_string()))
        }
    }
}

async fn authenticate(state: &AppState, payload: AuthPayload) -> Response {
    match state.auth().authenticate(&payload).await {
        Ok(response) => {
            metrics::REQUESTS.with_label_values(&["auth", "ok"]).inc();
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(err) => {
            warn!(error = %err, "auth service call failed");
            reply(
                "auth",
                StatusCode::BAD_GATEWAY,
                ApiResponse::error(format!("auth service error: {err}")),
            )
        }
    }
}

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use topic_bus::LogPayload;
use tracing::{debug, error};

use crate::metrics;
use crate::store::{LogEntry, StoreHandle};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1_000;

#[derive(Clone)]
pub struct AppState {
    store: StoreHandle,
}

impl AppState {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ApiResponse {
    pub error: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/log", post(write_log))
        .route("/logs", get(recent_logs))
        .route("/health", get(|| async { "ok" }))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

fn reply(status: StatusCode, error: bool, message: impl Into<String>) -> Response {
    let result = if error { "error" } else { "ok" };
    metrics::ENTRIES.with_label_values(&[result]).inc();
    (
        status,
        Json(ApiResponse {
            error,
            message: message.into(),
        }),
    )
        .into_response()
}

async fn write_log(
    State(state): State<AppState>,
    body: Result<Json<LogPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match body {
        Ok(body) => body,
        Err(rejection) => return reply(StatusCode::BAD_REQUEST, true, rejection.body_text()),
    };

    debug!(name = %payload.name, "storing log entry");
    match state
        .store
        .append(LogEntry::now(payload.name, payload.data))
        .await
    {
        Ok(()) => reply(StatusCode::ACCEPTED, false, "logged"),
        Err(err) => {
            error!(error = %err, "failed to store log entry");
            reply(StatusCode::INTERNAL_SERVER_ERROR, true, err.to_string())
        }
    }
}

async fn recent_logs(State(state): State<AppState>, Query(query): Query<RecentQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    match state.store.recent(limit).await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => {
            error!(error = %err, "failed to read log entries");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse {
                    error: true,
                    message: err.to_string(),
                }),
            )
                .into_response()
        }
    }
}

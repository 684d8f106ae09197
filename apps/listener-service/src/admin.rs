use axum::{http::header, response::IntoResponse, routing::get, Router};

/// Health and metrics endpoints; the listener has no other HTTP surface.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/metrics", get(metrics))
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        topic_bus::metrics::gather(),
    )
}

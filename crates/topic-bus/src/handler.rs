use async_trait::async_trait;
use tracing::{debug, warn};

use crate::envelope::{Label, LogPayload};
use crate::sink::LogSinkClient;

/// Processes one decoded delivery. Runs on its own task, concurrently with other deliveries.
///
/// The delivery is already acknowledged when this runs, so a handler has nowhere to report
/// failure to; it logs and returns.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, routing_key: String, payload: LogPayload);
}

/// Forwards log and event deliveries to the log sink.
#[derive(Clone, Debug)]
pub struct LogSinkHandler {
    sink: LogSinkClient,
}

impl LogSinkHandler {
    pub fn new(sink: LogSinkClient) -> Self {
        Self { sink }
    }

    async fn forward(&self, routing_key: &str, payload: &LogPayload) {
        match self.sink.write(payload).await {
            Ok(_) => debug!(routing_key, name = %payload.name, "forwarded to log sink"),
            Err(err) => warn!(
                routing_key,
                name = %payload.name,
                error = %err,
                "log sink write failed; entry dropped"
            ),
        }
    }
}

#[async_trait]
impl EventHandler for LogSinkHandler {
    async fn handle(&self, routing_key: String, payload: LogPayload) {
        match payload.label() {
            Label::Log | Label::Event => self.forward(&routing_key, &payload).await,
            Label::Auth => {
                debug!(routing_key = %routing_key, "auth event received; no consumer for it yet");
            }
            Label::Other(name) => {
                debug!(routing_key = %routing_key, name = %name, "unrecognised label; forwarding as log");
                self.forward(&routing_key, &payload).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkConfig;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn recording_sink() -> (String, Arc<Mutex<Vec<LogPayload>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new().route(
            "/log",
            post({
                let seen = seen.clone();
                move |Json(body): Json<LogPayload>| async move {
                    seen.lock().push(body);
                    (
                        StatusCode::ACCEPTED,
                        Json(json!({"error": false, "message": "logged"})),
                    )
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        (format!("http://{addr}"), seen)
    }

    #[tokio::test]
    async fn routes_labels() {
        let (base, seen) = recording_sink().await;
        let handler = LogSinkHandler::new(LogSinkClient::new(&SinkConfig::new(base)).unwrap());

        handler
            .handle("log.INFO".into(), LogPayload::new("log", "a"))
            .await;
        handler
            .handle("log.INFO".into(), LogPayload::new("event", "b"))
            .await;
        handler
            .handle("log.INFO".into(), LogPayload::new("auth", "c"))
            .await;
        handler
            .handle("log.INFO".into(), LogPayload::new("metric", "d"))
            .await;

        let names: Vec<String> = seen.lock().iter().map(|p| p.name.clone()).collect();
        assert_eq!(names, vec!["log", "event", "metric"]);
    }

    #[tokio::test]
    async fn unreachable_sink_is_swallowed() {
        let config = SinkConfig::new("http://127.0.0.1:9")
            .with_timeout(std::time::Duration::from_millis(200));
        let handler = LogSinkHandler::new(LogSinkClient::new(&config).unwrap());
        handler
            .handle("log.ERROR".into(), LogPayload::new("log", "lost"))
            .await;
    }
}

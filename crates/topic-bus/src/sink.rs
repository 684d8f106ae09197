//! HTTP client for the log sink's `POST /log`.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;

use crate::envelope::{LogPayload, LogResponse};
use crate::metrics;

/// Connection limits and timeout of the pooled sink client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
}

impl SinkConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(5),
            pool_max_idle_per_host: 20,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("log sink did not answer within {0:?}")]
    Timeout(Duration),
    #[error("log sink request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    Status { status: StatusCode, body: String },
    #[error("malformed log sink response: {0}")]
    Decode(String),
    #[error("log sink rejected entry: {0}")]
    Rejected(String),
}

/// Shared, pooled client. Cheap to clone; clones share the connection pool.
#[derive(Clone, Debug)]
pub struct LogSinkClient {
    http: Client,
    endpoint: String,
    timeout: Duration,
}

impl LogSinkClient {
    pub fn new(config: &SinkConfig) -> Result<Self, SinkError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/log", config.base_url.trim_end_matches('/')),
            timeout: config.timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Posts `payload` and checks the sink's verdict.
    pub async fn write(&self, payload: &LogPayload) -> Result<LogResponse, SinkError> {
        let result = self.send(payload).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::SINK_WRITES.with_label_values(&[outcome]).inc();
        result
    }

    async fn send(&self, payload: &LogPayload) -> Result<LogResponse, SinkError> {
        let res = self
            .http
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        let status = res.status();
        if status != StatusCode::ACCEPTED && status != StatusCode::OK {
            let body = res.text().await.unwrap_or_default();
            return Err(SinkError::Status { status, body });
        }

        let body: LogResponse = res.json().await.map_err(|err| {
            if err.is_timeout() {
                SinkError::Timeout(self.timeout)
            } else {
                SinkError::Decode(err.to_string())
            }
        })?;
        if body.error {
            return Err(SinkError::Rejected(body.message));
        }
        debug!(endpoint = %self.endpoint, %status, "log sink accepted entry");
        Ok(body)
    }

    fn classify(&self, err: reqwest::Error) -> SinkError {
        if err.is_timeout() {
            SinkError::Timeout(self.timeout)
        } else {
            SinkError::Request(err)
        }
    }
}

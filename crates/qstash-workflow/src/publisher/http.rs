// HTTP queue publisher
// Decision: Transient failures (connect errors, timeouts, 429, 5xx) are retried here with
//           the configured RetryPolicy; the engine above never retries a publish itself

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CancelOutcome, MessageId, PublishRequest, PublisherError, QueuePublisher};
use crate::reliability::RetryPolicy;

pub const DEFAULT_QSTASH_URL: &str = "https://qstash.upstash.io";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    message_id: MessageId,
}

#[derive(Debug, Serialize)]
struct BatchEntry {
    destination: String,
    headers: BTreeMap<String, String>,
    body: String,
}

/// Publishes to a QStash-compatible queue API
#[derive(Debug, Clone)]
pub struct HttpPublisher {
    base_url: String,
    token: String,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpPublisher {
    pub fn new(base_url: &str, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            http: reqwest::Client::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Headers the queue reads from a message: the step headers plus delivery options
    fn message_headers(request: &PublishRequest) -> BTreeMap<String, String> {
        let mut headers = request.headers.clone();
        headers.insert("Upstash-Method".to_string(), request.method.clone());
        if let Some(delay) = request.delay {
            headers.insert("Upstash-Delay".to_string(), format!("{delay}s"));
        }
        if let Some(not_before) = request.not_before {
            headers.insert("Upstash-Not-Before".to_string(), not_before.to_string());
        }
        headers
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response, PublisherError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 1;
        loop {
            let result = build().bearer_auth(&self.token).send().await;

            let retry_reason = match &result {
                Ok(response) if RetryPolicy::is_retryable_status(response.status()) => {
                    Some(format!("status {}", response.status()))
                }
                Err(e) if RetryPolicy::is_retryable_error(e) => Some(e.to_string()),
                _ => None,
            };

            let Some(retry_reason) =
                retry_reason.filter(|_| self.retry.has_attempts_remaining(attempt))
            else {
                return Ok(result?);
            };

            attempt += 1;
            let delay = self.retry.delay_for_attempt(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %retry_reason,
                "queue request failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// `DELETE /v2/workflows/runs/{id}`; `cancel` decides whether the run ends as
    /// cancelled or as finished
    async fn delete_run(
        &self,
        run_id: &str,
        cancel: bool,
    ) -> Result<CancelOutcome, PublisherError> {
        let url = format!("{}/v2/workflows/runs/{}", self.base_url, run_id);
        let cancel_param = if cancel { "true" } else { "false" };

        let response = self
            .send_with_retry(|| self.http.delete(&url).query(&[("cancel", cancel_param)]))
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(%run_id, cancel, "deleted run");
            return Ok(CancelOutcome::Cancelled);
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(CancelOutcome::NotFound);
        }

        Err(Self::error_for(response).await)
    }

    async fn error_for(response: reqwest::Response) -> PublisherError {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return PublisherError::NotFound;
        }
        let message = response.text().await.unwrap_or_default();
        PublisherError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl QueuePublisher for HttpPublisher {
    async fn publish(&self, request: PublishRequest) -> Result<MessageId, PublisherError> {
        let url = format!("{}/v2/publish/{}", self.base_url, request.url);
        let headers = Self::message_headers(&request);

        let response = self
            .send_with_retry(|| {
                headers
                    .iter()
                    .fold(self.http.post(&url), |builder, (name, value)| {
                        builder.header(name.as_str(), value.as_str())
                    })
                    .body(request.body.clone())
            })
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let body: PublishResponse = response.json().await?;
        debug!(message_id = %body.message_id, destination = %request.url, "published message");
        Ok(body.message_id)
    }

    async fn batch_publish(
        &self,
        requests: Vec<PublishRequest>,
    ) -> Result<Vec<MessageId>, PublisherError> {
        let url = format!("{}/v2/batch", self.base_url);
        let entries: Vec<BatchEntry> = requests
            .iter()
            .map(|request| BatchEntry {
                destination: request.url.clone(),
                headers: Self::message_headers(request),
                body: request.body.clone(),
            })
            .collect();
        let payload = serde_json::to_string(&entries)?;

        let response = self
            .send_with_retry(|| {
                self.http
                    .post(&url)
                    .header("Content-Type", "application/json")
                    .body(payload.clone())
            })
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let body: Vec<PublishResponse> = response.json().await?;
        debug!(messages = body.len(), "published batch");
        Ok(body.into_iter().map(|entry| entry.message_id).collect())
    }

    async fn cancel(&self, run_id: &str) -> Result<CancelOutcome, PublisherError> {
        self.delete_run(run_id, true).await
    }

    async fn finish(&self, run_id: &str) -> Result<CancelOutcome, PublisherError> {
        self.delete_run(run_id, false).await
    }
}

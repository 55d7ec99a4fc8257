//! Queue publisher
//!
//! The engine needs four things from the queue service: publish one message, publish a
//! batch, clean up a finished run, and cancel a run. Delivery retries, delays and storage of in-flight runs all
//! live on the other side of this trait.

mod http;
mod memory;

pub use http::{HttpPublisher, DEFAULT_QSTASH_URL};
pub use memory::InMemoryPublisher;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A message to deliver to `url`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    /// Destination the queue delivers to
    pub url: String,

    pub method: String,

    pub body: String,

    pub headers: BTreeMap<String, String>,

    /// Seconds the queue waits before delivering
    pub delay: Option<u64>,

    /// Unix timestamp before which the queue does not deliver
    pub not_before: Option<i64>,
}

impl PublishRequest {
    /// A POST of `body` to `url`
    pub fn new(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            body: body.into(),
            headers: BTreeMap::new(),
            delay: None,
            not_before: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_delay(mut self, seconds: u64) -> Self {
        self.delay = Some(seconds);
        self
    }

    pub fn with_not_before(mut self, timestamp: i64) -> Self {
        self.not_before = Some(timestamp);
        self
    }
}

/// Id the queue assigned to an accepted message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a run cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The queue had no active run with that id
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Not found")]
    NotFound,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Queue operations the workflow engine depends on
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    async fn publish(&self, request: PublishRequest) -> Result<MessageId, PublisherError>;

    /// Publish several messages in one call, ids returned in request order
    async fn batch_publish(
        &self,
        requests: Vec<PublishRequest>,
    ) -> Result<Vec<MessageId>, PublisherError>;

    /// Cancel a run and drop its pending messages; the run is marked cancelled
    async fn cancel(&self, run_id: &str) -> Result<CancelOutcome, PublisherError>;

    /// Clean up a run whose route completed; the run is marked finished
    async fn finish(&self, run_id: &str) -> Result<CancelOutcome, PublisherError>;
}

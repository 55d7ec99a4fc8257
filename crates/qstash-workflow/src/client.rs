// Workflow client
// Decision: Starting a run from outside the endpoint publishes the same first message the
//           endpoint publishes on a first invocation, so both paths share one function

use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{info, instrument, warn};

use crate::error::Result;
use crate::executor::PublishTarget;
use crate::headers::{UserHeaders, DEFAULT_CONTENT_TYPE, DEFAULT_RETRIES};
use crate::publisher::{CancelOutcome, MessageId, PublishRequest, QueuePublisher};

/// Mint a new run id
pub fn generate_run_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(21)
        .map(char::from)
        .collect();
    format!("wfr_{suffix}")
}

/// Publish the message that starts a run
pub(crate) async fn trigger_first_invocation(
    publisher: &dyn QueuePublisher,
    target: &PublishTarget,
    payload: &str,
) -> Result<MessageId> {
    let mut headers = target.headers(true, None);
    let content_type = target
        .user_headers
        .get("content-type")
        .cloned()
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
    headers.insert("Content-Type".to_string(), content_type);

    let request =
        PublishRequest::new(target.workflow_url.clone(), payload).with_headers(headers);
    let message_id = publisher.publish(request).await?;

    info!(
        run_id = %target.run_id,
        %message_id,
        "published first invocation"
    );
    Ok(message_id)
}

/// Options for starting a run
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    /// Workflow endpoint
    pub url: String,

    pub body: String,

    /// Headers the route will see
    pub headers: UserHeaders,

    /// Run id to use instead of a generated one
    pub run_id: Option<String>,

    pub retries: Option<u32>,

    pub failure_url: Option<String>,
}

impl TriggerRequest {
    pub fn new(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            body: body.into(),
            headers: UserHeaders::new(),
            run_id: None,
            retries: None,
            failure_url: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_failure_url(mut self, failure_url: impl Into<String>) -> Self {
        self.failure_url = Some(failure_url.into());
        self
    }
}

/// Starts and cancels runs from outside a workflow endpoint
#[derive(Clone)]
pub struct WorkflowClient {
    publisher: Arc<dyn QueuePublisher>,
}

impl WorkflowClient {
    pub fn new(publisher: Arc<dyn QueuePublisher>) -> Self {
        Self { publisher }
    }

    /// Start a run, returning its id
    #[instrument(skip(self, request), fields(url = %request.url))]
    pub async fn trigger(&self, request: TriggerRequest) -> Result<String> {
        let run_id = request.run_id.unwrap_or_else(generate_run_id);
        let target = PublishTarget {
            run_id: run_id.clone(),
            workflow_url: request.url,
            failure_url: request.failure_url,
            user_headers: request.headers,
            retries: request.retries.unwrap_or(DEFAULT_RETRIES),
        };

        trigger_first_invocation(self.publisher.as_ref(), &target, &request.body).await?;
        Ok(run_id)
    }

    /// Cancel a run
    #[instrument(skip(self))]
    pub async fn cancel(&self, run_id: &str) -> Result<CancelOutcome> {
        let outcome = self.publisher.cancel(run_id).await?;
        if outcome == CancelOutcome::NotFound {
            warn!(%run_id, "no active run to cancel");
        }
        Ok(outcome)
    }
}

//! Invocation driver
//!
//! One call to [`WorkflowHandler::handle`] is one delivery from the queue. The driver
//! authenticates it, figures out what kind of delivery it is, and ends in exactly one
//! [`InvocationOutcome`]:
//!
//! - failure callback: run the failure hook
//! - delegated call response: record it as a step and publish it back to the endpoint
//! - first invocation: publish the payload as the run's first message
//! - trailing duplicate: acknowledge without running anything
//! - otherwise: run the route against the history, then either the route stopped at a
//!   new step (already published) or it finished and the run is cleaned up

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use axum::http::HeaderMap;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::client::{generate_run_id, trigger_first_invocation};
use crate::config::{ConfigError, WorkflowConfig};
use crate::context::{CallResponse, WorkflowContext};
use crate::error::{Result, StepAbort, WorkflowError};
use crate::executor::{ExecutionMode, PublishTarget};
use crate::failure::{handle_failure, FailureHook};
use crate::headers::{
    header_value, recreate_user_headers, CALLBACK_CONCURRENT_HEADER,
    CALLBACK_CONTENT_TYPE_HEADER, CALLBACK_STEP_ID_HEADER, CALLBACK_STEP_NAME_HEADER,
    CALLBACK_STEP_TYPE_HEADER, DEFAULT_RETRIES, REGION_HEADER, SIGNATURE_HEADER,
    WORKFLOW_CALLBACK_HEADER, WORKFLOW_FAILURE_HEADER, WORKFLOW_PROTOCOL_VERSION,
    WORKFLOW_PROTOCOL_VERSION_HEADER, WORKFLOW_RUN_ID_HEADER,
};
use crate::parse::{decode_base64, parse_request};
use crate::publisher::{CancelOutcome, QueuePublisher};
use crate::receiver::{Receiver, VerifyRequest};
use crate::step::{Step, StepKind, StepType};

/// A workflow route: the function re-run on every invocation
pub trait WorkflowRoute: Send + Sync + 'static {
    fn run(&self, ctx: WorkflowContext) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> WorkflowRoute for F
where
    F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn run(&self, ctx: WorkflowContext) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(ctx))
    }
}

/// An inbound delivery
#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    /// Full url the request was received on
    pub url: String,
    pub headers: HeaderMap,
    pub body: String,
}

/// Terminal state of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// First invocation: the run's first message was published
    Started,
    /// Route stopped at a new step, which was published
    StepFinished,
    /// Route returned without requesting a new step; the run was cleaned up
    WorkflowFinished,
    /// The delivery repeated the last recorded step
    DuplicateStep,
    /// A delegated call's response was recorded and published
    CallReturned,
    /// A delegated call got a non-2xx response; the queue retries it
    CallWillRetry,
    /// Pre-flight run returned without reaching any step
    RunEnded,
    /// The failure hook ran
    FailureHandled,
}

impl InvocationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::StepFinished => "step-finished",
            Self::WorkflowFinished => "workflow-finished",
            Self::DuplicateStep => "duplicate-step",
            Self::CallReturned => "is-call-return",
            Self::CallWillRetry => "call-will-retry",
            Self::RunEnded => "run-ended",
            Self::FailureHandled => "failure-callback",
        }
    }
}

/// Successful handling of a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResponse {
    pub workflow_run_id: String,
    pub outcome: InvocationOutcome,
}

impl InvocationResponse {
    fn new(workflow_run_id: impl Into<String>, outcome: InvocationOutcome) -> Self {
        Self {
            workflow_run_id: workflow_run_id.into(),
            outcome,
        }
    }
}

/// How a route run ended
#[derive(Debug, Clone)]
pub enum RouteOutcome {
    /// Returned without stopping at a new step
    Completed,
    /// Stopped at a step boundary
    StepCommitted(StepAbort),
    Failed(WorkflowError),
}

impl RouteOutcome {
    /// Classify a route result, trusting the executor over what the route returned
    ///
    /// Route code that swallows or rewraps the step-boundary signal is still treated as
    /// stopped at that step.
    pub(crate) fn classify(result: Result<()>, ctx: &WorkflowContext) -> Self {
        let recorded_abort = ctx.executor().abort();
        match (result, recorded_abort) {
            (Err(WorkflowError::Aborted(abort)), _) => Self::StepCommitted(abort),
            (result, Some(abort)) => {
                if result.is_ok() {
                    warn!(step_name = %abort.step_name, "route swallowed a step boundary");
                }
                Self::StepCommitted(abort)
            }
            (Ok(()), None) => Self::Completed,
            (Err(e), None) => Self::Failed(e),
        }
    }
}

/// Options for [`WorkflowHandler`]
#[derive(Clone)]
pub struct ServeOptions {
    publisher: Arc<dyn QueuePublisher>,
    receiver: Option<Receiver>,
    url: Option<String>,
    base_url: Option<String>,
    failure_url: Option<String>,
    failure_hook: Option<Arc<dyn FailureHook>>,
    retries: u32,
    preflight: bool,
    clock_tolerance: u64,
}

impl ServeOptions {
    pub fn new(publisher: Arc<dyn QueuePublisher>) -> Self {
        Self {
            publisher,
            receiver: None,
            url: None,
            base_url: None,
            failure_url: None,
            failure_hook: None,
            retries: DEFAULT_RETRIES,
            preflight: true,
            clock_tolerance: 0,
        }
    }

    /// Options backed by an [`HttpPublisher`] and the configured signing keys
    pub fn from_config(config: &WorkflowConfig) -> std::result::Result<Self, ConfigError> {
        let publisher = config.publisher()?;

        let mut options = Self::new(Arc::new(publisher)).with_retries(config.retries);
        options.receiver = config.receiver();
        options.base_url = config.workflow_url_base.clone();
        Ok(options)
    }

    /// Verify every request's signature
    pub fn with_receiver(mut self, receiver: Receiver) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// Endpoint url to publish to instead of the request url
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Origin that replaces the request url's origin (for proxies and tunnels)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_failure_url(mut self, failure_url: impl Into<String>) -> Self {
        self.failure_url = Some(failure_url.into());
        self
    }

    /// Run `hook` on this endpoint when the queue gives up on the run
    pub fn with_failure_hook(mut self, hook: impl FailureHook) -> Self {
        self.failure_hook = Some(Arc::new(hook));
        self
    }

    /// Queue retries attached to every published step
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Whether the route is dry-run before real execution
    pub fn with_preflight(mut self, enabled: bool) -> Self {
        self.preflight = enabled;
        self
    }

    /// Seconds of clock skew tolerated when verifying signatures
    pub fn with_clock_tolerance(mut self, seconds: u64) -> Self {
        self.clock_tolerance = seconds;
        self
    }

    pub fn publisher(&self) -> &Arc<dyn QueuePublisher> {
        &self.publisher
    }

    fn failure_url(&self, workflow_url: &str) -> Option<String> {
        if self.failure_hook.is_some() {
            Some(workflow_url.to_string())
        } else {
            self.failure_url.clone()
        }
    }
}

/// Workflow url for a request: the explicit url or the request url, with its origin
/// replaced by `base_url` when one is set
pub fn resolve_workflow_url(
    request_url: &str,
    url: Option<&str>,
    base_url: Option<&str>,
) -> Result<String> {
    let initial = url.unwrap_or(request_url);
    let Some(base_url) = base_url else {
        return Ok(initial.to_string());
    };

    let parsed = url::Url::parse(initial)
        .map_err(|e| WorkflowError::protocol(format!("invalid workflow url '{initial}': {e}")))?;
    let query = parsed.query().map(|q| format!("?{q}")).unwrap_or_default();

    Ok(format!(
        "{}{}{}",
        base_url.trim_end_matches('/'),
        parsed.path(),
        query
    ))
}

#[derive(Debug, Deserialize)]
struct CallbackMessage {
    status: u16,
    #[serde(default)]
    body: String,
    #[serde(default)]
    header: BTreeMap<String, Vec<String>>,
}

/// Serves a workflow route
#[derive(Clone)]
pub struct WorkflowHandler {
    route: Arc<dyn WorkflowRoute>,
    options: ServeOptions,
}

impl WorkflowHandler {
    pub fn new(route: impl WorkflowRoute, options: ServeOptions) -> Self {
        Self {
            route: Arc::new(route),
            options,
        }
    }

    pub fn options(&self) -> &ServeOptions {
        &self.options
    }

    /// Handle one delivery
    #[instrument(skip_all, fields(url = %request.url))]
    pub async fn handle(&self, request: WorkflowRequest) -> Result<InvocationResponse> {
        let workflow_url = resolve_workflow_url(
            &request.url,
            self.options.url.as_deref(),
            self.options.base_url.as_deref(),
        )?;
        let failure_url = self.options.failure_url(&workflow_url);

        self.verify(&request)?;

        if header_value(&request.headers, WORKFLOW_FAILURE_HEADER) == Some("true") {
            let Some(hook) = &self.options.failure_hook else {
                return Err(WorkflowError::protocol(
                    "received a failure callback but no failure hook is configured",
                ));
            };
            let run_id =
                handle_failure(&request.body, hook.as_ref(), failure_url, self.options.retries)
                    .await?;
            return Ok(InvocationResponse::new(
                run_id,
                InvocationOutcome::FailureHandled,
            ));
        }

        if header_value(&request.headers, WORKFLOW_CALLBACK_HEADER).is_some() {
            return self
                .handle_call_return(&request, workflow_url, failure_url)
                .await;
        }

        let (is_first_invocation, run_id) = validate_request(&request.headers)?;
        let parsed = parse_request(&request.body, is_first_invocation)?;

        if parsed.is_last_duplicate {
            info!(%run_id, "duplicate delivery of the last step, skipping");
            return Ok(InvocationResponse::new(
                run_id,
                InvocationOutcome::DuplicateStep,
            ));
        }

        let target = PublishTarget {
            run_id: run_id.clone(),
            workflow_url,
            failure_url,
            user_headers: recreate_user_headers(&request.headers),
            retries: self.options.retries,
        };

        if self.options.preflight {
            let dry_run = WorkflowContext::new(
                parsed.raw_initial_payload.clone(),
                parsed.steps.clone(),
                target.clone(),
                ExecutionMode::Preflight,
            );
            let result = self.route.run(dry_run.clone()).await;
            match RouteOutcome::classify(result, &dry_run) {
                RouteOutcome::Completed => {
                    info!(%run_id, "route returned before reaching a step, ending run");
                    return Ok(InvocationResponse::new(run_id, InvocationOutcome::RunEnded));
                }
                RouteOutcome::Failed(e) => return Err(e),
                RouteOutcome::StepCommitted(_) => {}
            }
        }

        if is_first_invocation {
            trigger_first_invocation(
                self.options.publisher.as_ref(),
                &target,
                &parsed.raw_initial_payload,
            )
            .await?;
            return Ok(InvocationResponse::new(run_id, InvocationOutcome::Started));
        }

        let ctx = WorkflowContext::new(
            parsed.raw_initial_payload,
            parsed.steps,
            target,
            ExecutionMode::Live(Arc::clone(&self.options.publisher)),
        );
        let result = self.route.run(ctx.clone()).await;

        match RouteOutcome::classify(result, &ctx) {
            RouteOutcome::StepCommitted(abort) => {
                debug!(%run_id, step_name = %abort.step_name, reason = ?abort.reason, "step finished");
                Ok(InvocationResponse::new(run_id, InvocationOutcome::StepFinished))
            }
            RouteOutcome::Completed => {
                if self.options.publisher.finish(&run_id).await? == CancelOutcome::NotFound {
                    warn!(%run_id, "run was already gone when cleaning up");
                }
                info!(%run_id, "workflow finished");
                Ok(InvocationResponse::new(
                    run_id,
                    InvocationOutcome::WorkflowFinished,
                ))
            }
            RouteOutcome::Failed(e) => {
                warn!(%run_id, error = %e, "route failed");
                Err(e)
            }
        }
    }

    fn verify(&self, request: &WorkflowRequest) -> Result<()> {
        let Some(receiver) = &self.options.receiver else {
            return Ok(());
        };

        let signature = header_value(&request.headers, SIGNATURE_HEADER).unwrap_or_default();
        let verify = VerifyRequest::new(signature, request.body.as_bytes())
            .with_clock_tolerance(self.options.clock_tolerance)
            .with_region(header_value(&request.headers, REGION_HEADER));

        receiver.verify(&verify).map_err(|e| {
            warn!(error = %e, "rejected request signature");
            WorkflowError::Signature(e)
        })?;
        Ok(())
    }

    /// Record a delegated call's response as its step and send it back to the endpoint
    async fn handle_call_return(
        &self,
        request: &WorkflowRequest,
        workflow_url: String,
        failure_url: Option<String>,
    ) -> Result<InvocationResponse> {
        let message: CallbackMessage = serde_json::from_str(&request.body)
            .map_err(|e| WorkflowError::protocol(format!("invalid call callback body: {e}")))?;
        let run_id = header_value(&request.headers, WORKFLOW_RUN_ID_HEADER)
            .unwrap_or_default()
            .to_string();

        if !(200..300).contains(&message.status) {
            warn!(
                %run_id,
                status = message.status,
                "delegated call failed, the queue will retry it"
            );
            return Ok(InvocationResponse::new(
                run_id,
                InvocationOutcome::CallWillRetry,
            ));
        }

        let field = |name: &str| header_value(&request.headers, name).filter(|v| !v.is_empty());
        let (Some(step_id), Some(step_name), Some(step_type), Some(concurrent), Some(_)) = (
            field(CALLBACK_STEP_ID_HEADER),
            field(CALLBACK_STEP_NAME_HEADER),
            field(CALLBACK_STEP_TYPE_HEADER),
            field(CALLBACK_CONCURRENT_HEADER),
            field(CALLBACK_CONTENT_TYPE_HEADER),
        ) else {
            return Err(WorkflowError::protocol(
                "missing step information in call callback headers",
            ));
        };
        if run_id.is_empty() {
            return Err(WorkflowError::protocol(
                "missing run id in call callback headers",
            ));
        }

        let invalid = |what: &str, value: &str| {
            WorkflowError::protocol(format!("invalid {what} '{value}' in call callback"))
        };
        let step_id: u64 = step_id.parse().map_err(|_| invalid("step id", step_id))?;
        let concurrent: usize = concurrent
            .parse()
            .map_err(|_| invalid("concurrency", concurrent))?;
        if step_type.parse::<StepType>() != Ok(StepType::Call) {
            return Err(invalid("step type", step_type));
        }

        let text = decode_base64(&message.body)?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        let response = CallResponse {
            status: message.status,
            body,
            header: message.header,
        };

        let step = Step {
            step_id,
            step_name: step_name.to_string(),
            kind: StepKind::Call { request: None },
            out: Some(serde_json::to_value(response)?),
            concurrent,
            target_step: None,
        };

        let target = PublishTarget {
            run_id: run_id.clone(),
            workflow_url,
            failure_url,
            user_headers: recreate_user_headers(&request.headers),
            retries: self.options.retries,
        };
        self.options
            .publisher
            .publish(target.step_request(&step)?)
            .await?;

        info!(%run_id, step_id, %step_name, "recorded delegated call response");
        Ok(InvocationResponse::new(run_id, InvocationOutcome::CallReturned))
    }
}

/// Detect a first invocation and find the run id
fn validate_request(headers: &HeaderMap) -> Result<(bool, String)> {
    let version = header_value(headers, WORKFLOW_PROTOCOL_VERSION_HEADER);
    let is_first_invocation = version.is_none();

    if let Some(version) = version {
        if version != WORKFLOW_PROTOCOL_VERSION {
            return Err(WorkflowError::protocol(format!(
                "Incompatible workflow sdk protocol version. Expected {WORKFLOW_PROTOCOL_VERSION}, \
                 got {version} from the request."
            )));
        }
    }

    let run_id = if is_first_invocation {
        generate_run_id()
    } else {
        header_value(headers, WORKFLOW_RUN_ID_HEADER)
            .unwrap_or_default()
            .to_string()
    };
    if run_id.is_empty() {
        return Err(WorkflowError::protocol(
            "couldn't get the workflow run id from the request headers",
        ));
    }

    Ok((is_first_invocation, run_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_resolve_workflow_url() {
        assert_eq!(
            resolve_workflow_url("http://localhost:3000/api/wf?x=1", None, None).unwrap(),
            "http://localhost:3000/api/wf?x=1"
        );
        assert_eq!(
            resolve_workflow_url(
                "http://localhost:3000/api/wf?x=1",
                None,
                Some("https://tunnel.example.com/")
            )
            .unwrap(),
            "https://tunnel.example.com/api/wf?x=1"
        );
        // Default ports and host case never leak into the rebuilt url
        assert_eq!(
            resolve_workflow_url(
                "http://app.example.com:80/api/wf?x=1",
                None,
                Some("https://tunnel.example.com")
            )
            .unwrap(),
            "https://tunnel.example.com/api/wf?x=1"
        );
        assert_eq!(
            resolve_workflow_url(
                "http://APP.example.com/api/wf?x=1",
                None,
                Some("https://tunnel.example.com")
            )
            .unwrap(),
            "https://tunnel.example.com/api/wf?x=1"
        );
        assert_eq!(
            resolve_workflow_url(
                "http://localhost:3000/api/wf",
                Some("https://app.example.com/workflow"),
                None
            )
            .unwrap(),
            "https://app.example.com/workflow"
        );
    }

    #[test]
    fn test_validate_first_invocation() {
        let (first, run_id) = validate_request(&HeaderMap::new()).unwrap();
        assert!(first);
        assert!(run_id.starts_with("wfr_"));
    }

    #[test]
    fn test_validate_continuation() {
        let mut headers = HeaderMap::new();
        headers.insert(WORKFLOW_PROTOCOL_VERSION_HEADER, HeaderValue::from_static("1"));
        headers.insert(WORKFLOW_RUN_ID_HEADER, HeaderValue::from_static("wfr_abc"));

        assert_eq!(
            validate_request(&headers).unwrap(),
            (false, "wfr_abc".to_string())
        );
    }

    #[test]
    fn test_validate_rejects_other_versions_and_missing_run_id() {
        let mut headers = HeaderMap::new();
        headers.insert(WORKFLOW_PROTOCOL_VERSION_HEADER, HeaderValue::from_static("2"));
        assert!(matches!(
            validate_request(&headers),
            Err(WorkflowError::Protocol(_))
        ));

        let mut headers = HeaderMap::new();
        headers.insert(WORKFLOW_PROTOCOL_VERSION_HEADER, HeaderValue::from_static("1"));
        assert!(matches!(
            validate_request(&headers),
            Err(WorkflowError::Protocol(_))
        ));
    }

    #[test]
    fn test_outcome_names() {
        assert_eq!(InvocationOutcome::StepFinished.as_str(), "step-finished");
        assert_eq!(InvocationOutcome::CallReturned.as_str(), "is-call-return");
    }
}

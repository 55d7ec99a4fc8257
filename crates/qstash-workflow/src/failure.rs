// Failure callbacks
// Decision: When the queue gives up on a step it calls the failure url with the original
//           request attached; the failed run's context is rebuilt from that request so the
//           hook sees the same payload, headers and history the route saw

use std::collections::BTreeMap;
use std::future::Future;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{info, instrument};

use crate::context::WorkflowContext;
use crate::error::{Result, WorkflowError};
use crate::executor::{ExecutionMode, PublishTarget};
use crate::headers::recreate_user_headers;
use crate::parse::{decode_base64, parse_request};

/// Why a run failed, as reported by the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetails {
    /// Status of the last failed delivery
    pub status: u16,

    /// Error message of the failed delivery
    pub message: String,

    /// Response headers of the failed delivery
    pub headers: BTreeMap<String, Vec<String>>,

    /// Url the failing message was delivered to
    pub failed_url: String,
}

/// Called with the failed run's context once the queue exhausted its retries
pub trait FailureHook: Send + Sync + 'static {
    fn on_failure(
        &self,
        ctx: WorkflowContext,
        failure: FailureDetails,
    ) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> FailureHook for F
where
    F: Fn(WorkflowContext, FailureDetails) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn on_failure(
        &self,
        ctx: WorkflowContext,
        failure: FailureDetails,
    ) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(ctx, failure))
    }
}

/// Body of a failure callback
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailurePayload {
    status: u16,
    #[serde(default)]
    header: BTreeMap<String, Vec<String>>,
    /// base64 of the failed delivery's response body
    #[serde(default)]
    body: String,
    url: String,
    #[serde(default)]
    source_header: BTreeMap<String, Vec<String>>,
    /// base64 of the request that failed
    source_body: String,
    workflow_run_id: String,
}

#[derive(Debug, Deserialize)]
struct FailureResponseBody {
    #[serde(default)]
    message: Option<String>,
}

/// Run `hook` for a failure callback request body
#[instrument(skip_all)]
pub(crate) async fn handle_failure(
    body: &str,
    hook: &dyn FailureHook,
    failure_url: Option<String>,
    retries: u32,
) -> Result<String> {
    let payload: FailurePayload = serde_json::from_str(body)
        .map_err(|e| WorkflowError::protocol(format!("invalid failure callback body: {e}")))?;

    let response_body = decode_base64(&payload.body)?;
    let message = serde_json::from_str::<FailureResponseBody>(&response_body)
        .ok()
        .and_then(|parsed| parsed.message)
        .unwrap_or(response_body);

    let source_body = decode_base64(&payload.source_body)?;
    let parsed = parse_request(&source_body, false)?;

    let target = PublishTarget {
        run_id: payload.workflow_run_id.clone(),
        workflow_url: payload.url.clone(),
        failure_url,
        user_headers: recreate_user_headers(&header_map(&payload.source_header)),
        retries,
    };
    let ctx = WorkflowContext::new(
        parsed.raw_initial_payload,
        parsed.steps,
        target,
        ExecutionMode::Preflight,
    );

    info!(
        run_id = %payload.workflow_run_id,
        status = payload.status,
        "running failure hook"
    );

    let failure = FailureDetails {
        status: payload.status,
        message,
        headers: payload.header,
        failed_url: payload.url,
    };

    match hook.on_failure(ctx, failure).await {
        Ok(()) => Ok(payload.workflow_run_id),
        Err(e) if e.is_abort() => Err(WorkflowError::protocol(
            "steps can not be requested from a failure hook",
        )),
        Err(e) => Err(e),
    }
}

fn header_map(headers: &BTreeMap<String, Vec<String>>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, values) in headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                map.append(name.clone(), value);
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::encode_base64;
    use crate::step::{CallType, RawStep};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    fn failure_body() -> String {
        let source = serde_json::to_string(&[RawStep {
            message_id: "m0".to_string(),
            body: encode_base64("{\"order\":42}"),
            call_type: CallType::Step,
        }])
        .unwrap();

        json!({
            "status": 500,
            "header": {"Content-Type": ["application/json"]},
            "body": encode_base64("{\"error\":\"Error\",\"message\":\"card declined\"}"),
            "url": "https://app.example.com/wf",
            "sourceHeader": {
                "Authorization": ["Bearer t"],
                "Upstash-Workflow-RunId": ["wfr_failed"]
            },
            "sourceBody": encode_base64(&source),
            "workflowRunId": "wfr_failed"
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_hook_receives_rebuilt_context() {
        let seen = Arc::new(Mutex::new(None));
        let hook = {
            let seen = seen.clone();
            move |ctx: WorkflowContext, failure: FailureDetails| {
                let seen = seen.clone();
                async move {
                    let payload: serde_json::Value = ctx.request_payload()?;
                    *seen.lock() = Some((
                        ctx.workflow_run_id().to_string(),
                        payload,
                        ctx.headers().clone(),
                        failure,
                    ));
                    Ok::<_, WorkflowError>(())
                }
            }
        };

        let run_id = handle_failure(&failure_body(), &hook, None, 3).await.unwrap();
        assert_eq!(run_id, "wfr_failed");

        let (seen_run_id, payload, headers, failure) = seen.lock().take().unwrap();
        assert_eq!(seen_run_id, "wfr_failed");
        assert_eq!(payload, json!({"order": 42}));
        assert_eq!(headers.get("authorization").map(String::as_str), Some("Bearer t"));
        assert!(!headers.contains_key("upstash-workflow-runid"));
        assert_eq!(failure.status, 500);
        assert_eq!(failure.message, "card declined");
    }

    #[tokio::test]
    async fn test_hook_can_not_request_steps() {
        let hook = |ctx: WorkflowContext, _failure: FailureDetails| async move {
            ctx.run("cleanup", || async { Ok::<_, String>(()) }).await
        };

        let result = handle_failure(&failure_body(), &hook, None, 3).await;
        assert!(matches!(result, Err(WorkflowError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_malformed_failure_body() {
        let hook = |_ctx: WorkflowContext, _failure: FailureDetails| async {
            Ok::<_, WorkflowError>(())
        };
        let result = handle_failure("{}", &hook, None, 3).await;
        assert!(matches!(result, Err(WorkflowError::Protocol(_))));
    }
}

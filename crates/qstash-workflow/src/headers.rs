// Protocol headers
// Decision: Outbound headers are built as an ordered map so published requests are
//           deterministic and easy to assert on in tests

use std::collections::BTreeMap;

use axum::http::HeaderMap;

use crate::step::Step;

pub const WORKFLOW_RUN_ID_HEADER: &str = "Upstash-Workflow-RunId";
pub const WORKFLOW_INIT_HEADER: &str = "Upstash-Workflow-Init";
pub const WORKFLOW_URL_HEADER: &str = "Upstash-Workflow-Url";
pub const WORKFLOW_FAILURE_HEADER: &str = "Upstash-Workflow-Is-Failure";
pub const WORKFLOW_FEATURE_HEADER: &str = "Upstash-Feature-Set";
pub const WORKFLOW_CALLBACK_HEADER: &str = "Upstash-Workflow-Callback";
pub const WORKFLOW_PROTOCOL_VERSION_HEADER: &str = "Upstash-Workflow-Sdk-Version";
pub const WORKFLOW_PROTOCOL_VERSION: &str = "1";
pub const SIGNATURE_HEADER: &str = "Upstash-Signature";
pub const REGION_HEADER: &str = "Upstash-Region";

/// Headers the queue forwards on a delegated call's callback
pub const CALLBACK_STEP_ID_HEADER: &str = "Upstash-Workflow-StepId";
pub const CALLBACK_STEP_NAME_HEADER: &str = "Upstash-Workflow-StepName";
pub const CALLBACK_STEP_TYPE_HEADER: &str = "Upstash-Workflow-StepType";
pub const CALLBACK_CONCURRENT_HEADER: &str = "Upstash-Workflow-Concurrent";
pub const CALLBACK_CONTENT_TYPE_HEADER: &str = "Upstash-Workflow-ContentType";

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";
pub const DEFAULT_RETRIES: u32 = 3;

/// Caller headers, lower-cased names
pub type UserHeaders = BTreeMap<String, String>;

/// Strip protocol and proxy headers, keeping what the caller sent
pub fn recreate_user_headers(headers: &HeaderMap) -> UserHeaders {
    let mut user_headers = UserHeaders::new();

    for (name, value) in headers {
        let name = name.as_str().to_ascii_lowercase();
        if name.starts_with("upstash-workflow-")
            || name.starts_with("x-vercel-")
            || name.starts_with("x-forwarded-")
            || name == "cf-connecting-ip"
        {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };

        user_headers
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    user_headers
}

/// Read a header as a string, case-insensitively
pub(crate) fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Inputs for the headers of one outbound message
pub(crate) struct OutboundHeaders<'a> {
    /// Marks the run's first message
    pub init: bool,
    pub run_id: &'a str,
    pub workflow_url: &'a str,
    pub user_headers: &'a UserHeaders,
    pub step: Option<&'a Step>,
    pub failure_url: Option<&'a str>,
    pub retries: Option<u32>,
    /// Retries for a delegated call's third-party request
    pub call_retries: Option<u32>,
}

impl OutboundHeaders<'_> {
    pub fn build(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        let call = self.step.and_then(|step| step.call_request());

        headers.insert(WORKFLOW_INIT_HEADER.to_string(), self.init.to_string());
        headers.insert(WORKFLOW_RUN_ID_HEADER.to_string(), self.run_id.to_string());
        headers.insert(
            WORKFLOW_URL_HEADER.to_string(),
            self.workflow_url.to_string(),
        );

        if call.is_none() {
            headers.insert(
                format!("Upstash-Forward-{WORKFLOW_PROTOCOL_VERSION_HEADER}"),
                WORKFLOW_PROTOCOL_VERSION.to_string(),
            );
        }

        if let Some(failure_url) = self.failure_url {
            headers.insert(
                format!("Upstash-Failure-Callback-Forward-{WORKFLOW_FAILURE_HEADER}"),
                "true".to_string(),
            );
            if call.is_none() {
                headers.insert(
                    "Upstash-Failure-Callback".to_string(),
                    failure_url.to_string(),
                );
            }
        }

        if call.is_some() {
            headers.insert(
                "Upstash-Retries".to_string(),
                self.call_retries.unwrap_or(0).to_string(),
            );
            headers.insert(
                WORKFLOW_FEATURE_HEADER.to_string(),
                "WF_NoDelete".to_string(),
            );
            if let Some(retries) = self.retries {
                headers.insert("Upstash-Callback-Retries".to_string(), retries.to_string());
                headers.insert(
                    "Upstash-Failure-Callback-Retries".to_string(),
                    retries.to_string(),
                );
            }
        } else if let Some(retries) = self.retries {
            headers.insert("Upstash-Retries".to_string(), retries.to_string());
            headers.insert(
                "Upstash-Failure-Callback-Retries".to_string(),
                retries.to_string(),
            );
        }

        for (name, value) in self.user_headers {
            if call.is_some() {
                headers.insert(format!("Upstash-Callback-Forward-{name}"), value.clone());
            } else {
                headers.insert(format!("Upstash-Forward-{name}"), value.clone());
            }
            headers.insert(
                format!("Upstash-Failure-Callback-Forward-{name}"),
                value.clone(),
            );
        }

        let (Some(step), Some(call)) = (self.step, call) else {
            return headers;
        };

        let content_type = self
            .user_headers
            .get("content-type")
            .map(String::as_str)
            .unwrap_or(DEFAULT_CONTENT_TYPE);

        for (name, value) in &call.headers {
            headers.insert(format!("Upstash-Forward-{name}"), value.clone());
        }

        let callback_headers = [
            ("Upstash-Callback", self.workflow_url.to_string()),
            ("Upstash-Callback-Workflow-RunId", self.run_id.to_string()),
            ("Upstash-Callback-Workflow-CallType", "fromCallback".to_string()),
            ("Upstash-Callback-Workflow-Init", "false".to_string()),
            ("Upstash-Callback-Workflow-Url", self.workflow_url.to_string()),
            (
                "Upstash-Callback-Feature-Set",
                "LazyFetch,InitialBody".to_string(),
            ),
            (
                "Upstash-Callback-Forward-Upstash-Workflow-Callback",
                "true".to_string(),
            ),
            (
                "Upstash-Callback-Forward-Upstash-Workflow-StepId",
                step.step_id.to_string(),
            ),
            (
                "Upstash-Callback-Forward-Upstash-Workflow-StepName",
                step.step_name.clone(),
            ),
            (
                "Upstash-Callback-Forward-Upstash-Workflow-StepType",
                step.step_type().to_string(),
            ),
            (
                "Upstash-Callback-Forward-Upstash-Workflow-Concurrent",
                step.concurrent.to_string(),
            ),
            (
                "Upstash-Callback-Forward-Upstash-Workflow-ContentType",
                content_type.to_string(),
            ),
            ("Upstash-Workflow-CallType", "toCallback".to_string()),
        ];
        for (name, value) in callback_headers {
            headers.insert(name.to_string(), value);
        }

        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{CallRequest, StepKind, NO_CONCURRENCY};
    use axum::http::HeaderValue;

    #[test]
    fn test_recreate_user_headers_strips_protocol_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("Upstash-Workflow-RunId", HeaderValue::from_static("wfr_1"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        headers.insert("cf-connecting-ip", HeaderValue::from_static("10.0.0.2"));
        headers.insert("x-vercel-id", HeaderValue::from_static("abc"));
        headers.insert("authorization", HeaderValue::from_static("Bearer token"));
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.append("x-tag", HeaderValue::from_static("b"));

        let user = recreate_user_headers(&headers);
        assert_eq!(user.len(), 2);
        assert_eq!(user["authorization"], "Bearer token");
        assert_eq!(user["x-tag"], "a, b");
    }

    #[test]
    fn test_step_headers_forward_user_headers_and_version() {
        let mut user = UserHeaders::new();
        user.insert("authorization".to_string(), "Bearer token".to_string());

        let headers = OutboundHeaders {
            init: false,
            run_id: "wfr_1",
            workflow_url: "https://app.example.com/api/workflow",
            user_headers: &user,
            step: None,
            failure_url: Some("https://app.example.com/api/failure"),
            retries: Some(3),
            call_retries: None,
        }
        .build();

        assert_eq!(headers[WORKFLOW_INIT_HEADER], "false");
        assert_eq!(headers[WORKFLOW_RUN_ID_HEADER], "wfr_1");
        assert_eq!(headers["Upstash-Forward-Upstash-Workflow-Sdk-Version"], "1");
        assert_eq!(headers["Upstash-Forward-authorization"], "Bearer token");
        assert_eq!(
            headers["Upstash-Failure-Callback"],
            "https://app.example.com/api/failure"
        );
        assert_eq!(headers["Upstash-Retries"], "3");
        assert!(!headers.contains_key("Upstash-Callback"));
    }

    #[test]
    fn test_call_step_headers_route_the_callback() {
        let user = UserHeaders::new();
        let step = Step {
            step_id: 4,
            step_name: "fetch".to_string(),
            kind: StepKind::Call {
                request: Some(
                    CallRequest::new("https://api.example.com").with_header("X-Api-Key", "k"),
                ),
            },
            out: None,
            concurrent: NO_CONCURRENCY,
            target_step: None,
        };

        let headers = OutboundHeaders {
            init: false,
            run_id: "wfr_1",
            workflow_url: "https://app.example.com/wf",
            user_headers: &user,
            step: Some(&step),
            failure_url: None,
            retries: Some(3),
            call_retries: Some(1),
        }
        .build();

        assert_eq!(headers["Upstash-Callback"], "https://app.example.com/wf");
        assert_eq!(
            headers["Upstash-Callback-Forward-Upstash-Workflow-StepId"],
            "4"
        );
        assert_eq!(
            headers["Upstash-Callback-Forward-Upstash-Workflow-StepType"],
            "Call"
        );
        assert_eq!(headers["Upstash-Forward-X-Api-Key"], "k");
        assert_eq!(headers["Upstash-Retries"], "1");
        assert_eq!(headers["Upstash-Callback-Retries"], "3");
        assert_eq!(headers["Upstash-Workflow-CallType"], "toCallback");
        assert!(!headers.contains_key("Upstash-Forward-Upstash-Workflow-Sdk-Version"));
    }
}

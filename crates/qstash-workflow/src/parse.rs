//! Request body parsing
//!
//! A first invocation carries the caller's payload verbatim. A continuation carries the
//! run's history as an array of [`RawStep`] envelopes, which is decoded here into the
//! ordered step list the executor replays against.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, warn};

use crate::error::{Result, WorkflowError};
use crate::step::{CallType, RawStep, Step};

/// Decoded inbound request
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    /// The caller's original payload, undecoded
    pub raw_initial_payload: String,

    /// History with the synthetic initial step at index 0 (empty on a first invocation)
    pub steps: Vec<Step>,

    /// The final delivered step repeated the one before it
    pub is_last_duplicate: bool,
}

/// Parse an inbound request body
pub fn parse_request(body: &str, is_first_invocation: bool) -> Result<ParsedRequest> {
    if is_first_invocation {
        return Ok(ParsedRequest {
            raw_initial_payload: body.to_string(),
            steps: Vec::new(),
            is_last_duplicate: false,
        });
    }

    if body.trim().is_empty() {
        return Err(WorkflowError::protocol(
            "only the first invocation can have an empty body",
        ));
    }

    let raw_steps: Vec<RawStep> = serde_json::from_str(body).map_err(|e| {
        WorkflowError::protocol(format!("continuation body is not a step array: {e}"))
    })?;

    let mut entries = raw_steps
        .into_iter()
        .filter(|raw| raw.call_type == CallType::Step);

    let initial = entries.next().ok_or_else(|| {
        WorkflowError::protocol("continuation body carries no initial payload")
    })?;
    let raw_initial_payload = decode_base64(&initial.body)?;

    let decoded = entries
        .map(|raw| {
            let json = decode_base64(&raw.body)?;
            serde_json::from_str::<Step>(&json).map_err(|e| {
                WorkflowError::protocol(format!("invalid step in message '{}': {e}", raw.message_id))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let (deduplicated, is_last_duplicate) = deduplicate_steps(decoded);

    let mut steps = Vec::with_capacity(deduplicated.len() + 1);
    steps.push(Step::initial(raw_initial_payload.clone()));
    steps.extend(deduplicated);

    debug!(steps = steps.len(), is_last_duplicate, "parsed step history");

    Ok(ParsedRequest {
        raw_initial_payload,
        steps,
        is_last_duplicate,
    })
}

/// Drop every step identical to the one kept right before it
///
/// Returns whether the final input step was dropped this way.
fn deduplicate_steps(steps: Vec<Step>) -> (Vec<Step>, bool) {
    let mut kept: Vec<Step> = Vec::with_capacity(steps.len());
    let mut last_dropped = false;

    for step in steps {
        if kept.last() == Some(&step) {
            warn!(
                step_id = step.step_id,
                step_name = %step.step_name,
                "step was delivered twice, dropping the duplicate"
            );
            last_dropped = true;
        } else {
            kept.push(step);
            last_dropped = false;
        }
    }

    (kept, last_dropped)
}

pub(crate) fn decode_base64(encoded: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| WorkflowError::protocol(format!("invalid base64 in request body: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| WorkflowError::protocol(format!("request body is not utf-8: {e}")))
}

pub(crate) fn encode_base64(text: &str) -> String {
    STANDARD.encode(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{StepKind, NO_CONCURRENCY};
    use serde_json::json;

    fn run_step(id: u64, name: &str, out: serde_json::Value) -> Step {
        Step {
            step_id: id,
            step_name: name.to_string(),
            kind: StepKind::Run,
            out: Some(out),
            concurrent: NO_CONCURRENCY,
            target_step: None,
        }
    }

    fn raw(message_id: &str, body: &str, call_type: CallType) -> RawStep {
        RawStep {
            message_id: message_id.to_string(),
            body: encode_base64(body),
            call_type,
        }
    }

    fn raw_step(message_id: &str, step: &Step) -> RawStep {
        raw(
            message_id,
            &serde_json::to_string(step).unwrap(),
            CallType::Step,
        )
    }

    fn body(entries: &[RawStep]) -> String {
        serde_json::to_string(entries).unwrap()
    }

    #[test]
    fn test_first_invocation_returns_payload_verbatim() {
        let parsed = parse_request("{\"order\":1}", true).unwrap();
        assert_eq!(parsed.raw_initial_payload, "{\"order\":1}");
        assert!(parsed.steps.is_empty());
        assert!(!parsed.is_last_duplicate);
    }

    #[test]
    fn test_continuation_requires_body() {
        assert!(matches!(
            parse_request("", false),
            Err(WorkflowError::Protocol(_))
        ));
        assert!(matches!(
            parse_request("not json", false),
            Err(WorkflowError::Protocol(_))
        ));
        assert!(matches!(
            parse_request("[]", false),
            Err(WorkflowError::Protocol(_))
        ));
    }

    #[test]
    fn test_initial_step_is_prepended() {
        let step1 = run_step(1, "step1", json!("done"));
        let request = body(&[
            raw("m0", "\"my-payload\"", CallType::Step),
            raw_step("m1", &step1),
        ]);

        let parsed = parse_request(&request, false).unwrap();
        assert_eq!(parsed.raw_initial_payload, "\"my-payload\"");
        assert_eq!(parsed.steps.len(), 2);
        assert_eq!(parsed.steps[0], Step::initial("\"my-payload\""));
        assert_eq!(parsed.steps[1], step1);
    }

    #[test]
    fn test_callback_entries_are_filtered() {
        let step1 = run_step(1, "step1", json!(1));
        let request = body(&[
            raw("m0", "payload", CallType::Step),
            raw("m1", "{\"status\":200}", CallType::ToCallback),
            raw_step("m2", &step1),
            raw("m3", "{\"status\":200}", CallType::FromCallback),
        ]);

        let parsed = parse_request(&request, false).unwrap();
        assert_eq!(parsed.steps.len(), 2);
        assert_eq!(parsed.steps[1].step_name, "step1");
    }

    #[test]
    fn test_trailing_duplicate_is_reported() {
        let step1 = run_step(1, "step1", json!(1));
        let step2 = run_step(2, "step2", json!(2));
        let request = body(&[
            raw("m0", "payload", CallType::Step),
            raw_step("m1", &step1),
            raw_step("m2", &step2),
            raw_step("m3", &step2),
        ]);

        let parsed = parse_request(&request, false).unwrap();
        assert!(parsed.is_last_duplicate);
        assert_eq!(parsed.steps.len(), 3);
    }

    #[test]
    fn test_interior_duplicate_is_dropped_silently() {
        let step1 = run_step(1, "step1", json!(1));
        let step2 = run_step(2, "step2", json!(2));
        let request = body(&[
            raw("m0", "payload", CallType::Step),
            raw_step("m1", &step1),
            raw_step("m2", &step1),
            raw_step("m3", &step2),
        ]);

        let parsed = parse_request(&request, false).unwrap();
        assert!(!parsed.is_last_duplicate);
        assert_eq!(parsed.steps.len(), 3);
        assert_eq!(parsed.steps[2], step2);
    }

    #[test]
    fn test_same_id_with_different_content_is_kept() {
        let first = run_step(1, "step1", json!(1));
        let second = run_step(1, "step1", json!(2));

        let (kept, last_dropped) = deduplicate_steps(vec![first, second]);
        assert_eq!(kept.len(), 2);
        assert!(!last_dropped);
    }
}

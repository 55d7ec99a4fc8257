//! Step records and their wire forms
//!
//! A [`Step`] is the unit of replay. On the wire it is one flat JSON object keyed by
//! `stepType`; in memory the type-specific fields live in [`StepKind`] so a sleep step
//! can never carry call fields and vice versa.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `concurrent` value of a step that is not part of a parallel group
pub const NO_CONCURRENCY: usize = 1;

/// Discriminator of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepType {
    Initial,
    Run,
    SleepFor,
    SleepUntil,
    Call,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "Initial",
            Self::Run => "Run",
            Self::SleepFor => "SleepFor",
            Self::SleepUntil => "SleepUntil",
            Self::Call => "Call",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Initial" => Ok(Self::Initial),
            "Run" => Ok(Self::Run),
            "SleepFor" => Ok(Self::SleepFor),
            "SleepUntil" => Ok(Self::SleepUntil),
            "Call" => Ok(Self::Call),
            other => Err(format!("unknown step type '{other}'")),
        }
    }
}

/// HTTP request delegated to the queue service by a `Call` step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    pub url: String,

    pub method: String,

    pub body: Option<String>,

    pub headers: BTreeMap<String, String>,

    /// How many times the queue retries the third party; not part of the step record
    #[serde(skip)]
    pub retries: Option<u32>,
}

impl CallRequest {
    /// A GET request to `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            body: None,
            headers: BTreeMap::new(),
            retries: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into().to_uppercase();
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `body` as the JSON request body
    pub fn with_json<T: Serialize>(mut self, body: &T) -> Result<Self, serde_json::Error> {
        self.body = Some(serde_json::to_string(body)?);
        Ok(self)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// Type-specific payload of a step
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    /// Synthetic first step holding the caller's original payload
    Initial,

    Run,

    /// `seconds` is only present on plan steps and single (non-parallel) result steps
    SleepFor { seconds: Option<u64> },

    /// `timestamp` (unix seconds) follows the same rule as `SleepFor::seconds`
    SleepUntil { timestamp: Option<i64> },

    /// `request` is present while the call is being scheduled; the step that carries
    /// the third party's response has no request
    Call { request: Option<CallRequest> },
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            Self::Initial => StepType::Initial,
            Self::Run => StepType::Run,
            Self::SleepFor { .. } => StepType::SleepFor,
            Self::SleepUntil { .. } => StepType::SleepUntil,
            Self::Call { .. } => StepType::Call,
        }
    }
}

/// One entry of a run's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireStep", into = "WireStep")]
pub struct Step {
    /// 0 for plan steps (and the initial step), otherwise strictly increasing
    pub step_id: u64,

    pub step_name: String,

    pub kind: StepKind,

    /// Result payload; only present on result steps
    pub out: Option<Value>,

    /// Size of the parallel group this step belongs to
    pub concurrent: usize,

    /// For plan steps, the id of the step that will carry this member's result
    pub target_step: Option<u64>,
}

impl Step {
    /// Synthetic step 0 holding the raw initial payload
    pub fn initial(raw_payload: impl Into<String>) -> Self {
        Self {
            step_id: 0,
            step_name: "init".to_string(),
            kind: StepKind::Initial,
            out: Some(Value::String(raw_payload.into())),
            concurrent: NO_CONCURRENCY,
            target_step: None,
        }
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }

    /// Plan steps announce a parallel member whose result arrives later
    pub fn is_plan_step(&self) -> bool {
        self.target_step.is_some()
    }

    /// Id used to order steps: the target for plan steps, the step id otherwise
    pub fn ordering_id(&self) -> u64 {
        self.target_step.unwrap_or(self.step_id)
    }

    /// The delegated request, if this step schedules a third-party call
    pub fn call_request(&self) -> Option<&CallRequest> {
        match &self.kind {
            StepKind::Call { request } => request.as_ref(),
            _ => None,
        }
    }
}

/// Flat JSON shape of a step
///
/// `out` travels as JSON text inside a string so the queue treats it as opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireStep {
    step_id: u64,
    step_name: String,
    step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    out: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sleep_for: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sleep_until: Option<i64>,
    #[serde(default = "default_concurrent")]
    concurrent: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_step: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    call_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    call_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    call_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    call_headers: Option<BTreeMap<String, String>>,
}

fn default_concurrent() -> usize {
    NO_CONCURRENCY
}

impl From<Step> for WireStep {
    fn from(step: Step) -> Self {
        let step_type = step.step_type();
        let mut wire = WireStep {
            step_id: step.step_id,
            step_name: step.step_name,
            step_type,
            out: step.out.map(|out| Value::String(out.to_string())),
            sleep_for: None,
            sleep_until: None,
            concurrent: step.concurrent,
            target_step: step.target_step,
            call_url: None,
            call_method: None,
            call_body: None,
            call_headers: None,
        };

        match step.kind {
            StepKind::Initial | StepKind::Run => {}
            StepKind::SleepFor { seconds } => wire.sleep_for = seconds,
            StepKind::SleepUntil { timestamp } => wire.sleep_until = timestamp,
            StepKind::Call { request } => {
                if let Some(request) = request {
                    wire.call_url = Some(request.url);
                    wire.call_method = Some(request.method);
                    wire.call_body = request.body;
                    wire.call_headers = Some(request.headers);
                }
            }
        }

        wire
    }
}

impl TryFrom<WireStep> for Step {
    type Error = String;

    fn try_from(wire: WireStep) -> Result<Self, Self::Error> {
        let has_call_fields = wire.call_url.is_some()
            || wire.call_method.is_some()
            || wire.call_body.is_some()
            || wire.call_headers.is_some();
        if has_call_fields && wire.step_type != StepType::Call {
            return Err(format!(
                "step '{}' of type {} carries call fields",
                wire.step_name, wire.step_type
            ));
        }
        if (wire.sleep_for.is_some() && wire.step_type != StepType::SleepFor)
            || (wire.sleep_until.is_some() && wire.step_type != StepType::SleepUntil)
        {
            return Err(format!(
                "step '{}' of type {} carries sleep fields",
                wire.step_name, wire.step_type
            ));
        }

        let kind = match wire.step_type {
            StepType::Initial => StepKind::Initial,
            StepType::Run => StepKind::Run,
            StepType::SleepFor => StepKind::SleepFor {
                seconds: wire.sleep_for,
            },
            StepType::SleepUntil => StepKind::SleepUntil {
                timestamp: wire.sleep_until,
            },
            StepType::Call => {
                let request = match wire.call_url {
                    Some(url) => Some(CallRequest {
                        url,
                        method: wire.call_method.unwrap_or_else(|| "GET".to_string()),
                        body: wire.call_body,
                        headers: wire.call_headers.unwrap_or_default(),
                        retries: None,
                    }),
                    None if has_call_fields => {
                        return Err(format!("call step '{}' has no callUrl", wire.step_name))
                    }
                    None => None,
                };
                StepKind::Call { request }
            }
        };

        Ok(Step {
            step_id: wire.step_id,
            step_name: wire.step_name,
            kind,
            out: wire.out.map(decode_out),
            concurrent: wire.concurrent,
            target_step: wire.target_step.filter(|target| *target > 0),
        })
    }
}

/// `out` is JSON text in a string; anything that isn't valid JSON stays a plain string
fn decode_out(out: Value) -> Value {
    match out {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}

/// How an entry of a continuation request body relates to the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallType {
    #[default]
    Step,
    /// Outbound leg of a delegated call
    ToCallback,
    /// Inbound leg of a delegated call
    FromCallback,
}

/// Envelope of one history entry in a continuation request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStep {
    #[serde(default)]
    pub message_id: String,

    /// Base64-encoded step JSON (or the raw initial payload for the first entry)
    pub body: String,

    #[serde(default)]
    pub call_type: CallType,
}

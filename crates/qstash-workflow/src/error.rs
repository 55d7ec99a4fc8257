// Workflow error types
// Decision: The step-boundary signal travels as an error variant so `?` in route code
//           unwinds straight back to the invocation driver
// Decision: WorkflowError is Clone because one parallel batch resolution is shared by
//           every step future in the batch

use crate::publisher::PublisherError;
use crate::receiver::SignatureError;

/// Why the current invocation stopped running route code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// New step(s) were published to the queue
    Submitted,
    /// A stale parallel delivery; its effects are superseded by another invocation
    Discarded,
    /// The pre-flight run reached its first step
    Preflight,
}

/// Control signal raised when a step boundary is reached
///
/// Not a failure: the driver turns it into a successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepAbort {
    /// Name of the first step in the committed batch
    pub step_name: String,

    pub reason: AbortReason,
}

/// Errors surfaced by the workflow engine
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkflowError {
    /// Malformed or incompatible history, missing headers, non-deterministic replay
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The request could not be authenticated
    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),

    /// User code inside a `run` step returned an error
    #[error("step '{step_name}' failed: {message}")]
    StepFailed { step_name: String, message: String },

    /// The queue rejected a publish or cancel call
    #[error("publish error: {0}")]
    Publish(String),

    /// Step output or payload could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The route function failed on its own terms
    #[error("workflow failed: {0}")]
    Failed(String),

    /// Step boundary reached, stop running route code
    #[error("workflow aborted at step '{}'", .0.step_name)]
    Aborted(StepAbort),
}

impl WorkflowError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a route failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub(crate) fn aborted(step_name: impl Into<String>, reason: AbortReason) -> Self {
        Self::Aborted(StepAbort {
            step_name: step_name.into(),
            reason,
        })
    }

    /// Whether this is the step-boundary signal rather than a failure
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    /// Short machine-readable kind, used as `error` in HTTP error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "WorkflowProtocolError",
            Self::Signature(_) => "SignatureError",
            Self::StepFailed { .. } => "StepFailedError",
            Self::Publish(_) => "PublishError",
            Self::Serialization(_) => "SerializationError",
            Self::Failed(_) => "WorkflowError",
            Self::Aborted(_) => "WorkflowAbort",
        }
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<PublisherError> for WorkflowError {
    fn from(err: PublisherError) -> Self {
        Self::Publish(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type Result<T, E = WorkflowError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_is_not_a_failure_kind() {
        let abort = WorkflowError::aborted("charge card", AbortReason::Submitted);
        assert!(abort.is_abort());
        assert_eq!(abort.to_string(), "workflow aborted at step 'charge card'");

        let failure = WorkflowError::failed("out of stock");
        assert!(!failure.is_abort());
        assert_eq!(failure.kind(), "WorkflowError");
    }

    #[test]
    fn test_step_failed_display() {
        let error = WorkflowError::StepFailed {
            step_name: "fetch".to_string(),
            message: "timeout".to_string(),
        };
        assert_eq!(error.to_string(), "step 'fetch' failed: timeout");
    }
}

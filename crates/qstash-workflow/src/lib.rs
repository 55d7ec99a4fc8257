//! Durable workflows over an at-least-once message queue
//!
//! A workflow is an async route function that is re-run from the top on every delivery.
//! Each step (`run`, `sleep`, `call`, parallel groups) either replays its recorded result
//! from the history carried in the request body, or is published to the queue as the
//! next message and stops the invocation.
//!
//! - [`serve`]: the invocation driver ([`WorkflowHandler`])
//! - [`adapter`]: mounting a handler on an axum router
//! - [`context`]: the step API route code uses
//! - [`executor`]: replay and parallel scheduling
//! - [`receiver`]: request signature verification
//! - [`publisher`]: queue access behind the [`QueuePublisher`] trait

pub mod adapter;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod failure;
pub mod headers;
pub mod parse;
pub mod publisher;
pub mod receiver;
pub mod reliability;
pub mod serve;
pub mod step;

pub use adapter::WorkflowErrorResponse;
pub use client::{generate_run_id, TriggerRequest, WorkflowClient};
pub use config::{ConfigError, WorkflowConfig};
pub use context::{CallResponse, WorkflowContext};
pub use error::{AbortReason, Result, StepAbort, WorkflowError};
pub use executor::{parallel_call_state, ParallelCallState};
pub use failure::{FailureDetails, FailureHook};
pub use headers::{recreate_user_headers, UserHeaders};
pub use parse::{parse_request, ParsedRequest};
pub use publisher::{
    CancelOutcome, HttpPublisher, InMemoryPublisher, MessageId, PublishRequest,
    PublisherError, QueuePublisher,
};
pub use receiver::{
    body_hash, Receiver, Region, SignatureClaims, SignatureError, SigningKeys, VerifyRequest,
};
pub use reliability::RetryPolicy;
pub use serve::{
    resolve_workflow_url, InvocationOutcome, InvocationResponse, ServeOptions,
    WorkflowHandler, WorkflowRequest, WorkflowRoute,
};
pub use step::{
    BoxedLazyStep, CallRequest, LazyCallStep, LazyRunStep, LazySleepStep, LazySleepUntilStep,
    LazyStep, Step, StepKind, StepType,
};

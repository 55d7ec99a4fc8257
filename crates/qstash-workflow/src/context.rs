//! Workflow context
//!
//! The value route code receives on every invocation. It is rebuilt from the request each
//! time and carries the run's history; every step method either returns the recorded
//! result or stops the invocation at the new step.
//!
//! ```no_run
//! use qstash_workflow::{Result, WorkflowContext};
//! use std::time::Duration;
//!
//! async fn onboarding(ctx: WorkflowContext) -> Result<()> {
//!     let email: String = ctx.request_payload()?;
//!
//!     let user_id: u64 = ctx
//!         .run("create-user", {
//!             let email = email.clone();
//!             move || async move { Ok::<_, String>(email.len() as u64) }
//!         })
//!         .await?;
//!
//!     ctx.sleep("wait-a-day", Duration::from_secs(86_400)).await?;
//!
//!     ctx.run("send-follow-up", move || async move {
//!         Ok::<_, String>(format!("followed up with user {user_id}"))
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::executor::{AutoExecutor, ExecutionMode, PublishTarget};
use crate::headers::UserHeaders;
use crate::step::{
    BoxedLazyStep, CallRequest, LazyCallStep, LazyRunStep, LazySleepStep, LazySleepUntilStep,
    Step,
};

/// What a delegated call got back from the third party
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub status: u16,

    /// Response body, parsed as JSON when it is JSON
    pub body: Value,

    #[serde(default)]
    pub header: BTreeMap<String, Vec<String>>,
}

struct ContextInner {
    raw_initial_payload: String,
    executor: AutoExecutor,
}

/// Per-invocation handle passed to route code
///
/// Cheap to clone; clones share the same invocation state.
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<ContextInner>,
}

impl WorkflowContext {
    pub(crate) fn new(
        raw_initial_payload: String,
        steps: Vec<Step>,
        target: PublishTarget,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                raw_initial_payload,
                executor: AutoExecutor::new(steps, target, mode),
            }),
        }
    }

    pub(crate) fn executor(&self) -> &AutoExecutor {
        &self.inner.executor
    }

    /// Id shared by every invocation of this run
    pub fn workflow_run_id(&self) -> &str {
        &self.executor().target().run_id
    }

    /// Endpoint the run keeps publishing to
    pub fn url(&self) -> &str {
        &self.executor().target().workflow_url
    }

    pub fn failure_url(&self) -> Option<&str> {
        self.executor().target().failure_url.as_deref()
    }

    /// Headers of the request that started the run
    pub fn headers(&self) -> &UserHeaders {
        &self.executor().target().user_headers
    }

    /// The payload that started the run, exactly as it was sent
    pub fn raw_initial_payload(&self) -> &str {
        &self.inner.raw_initial_payload
    }

    /// The starting payload, parsed as JSON or taken as a plain string
    pub fn request_payload<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = self.raw_initial_payload();
        match serde_json::from_str(raw) {
            Ok(payload) => Ok(payload),
            Err(_) => Ok(serde_json::from_value(Value::String(raw.to_string()))?),
        }
    }

    /// History this invocation replays against, the initial step first
    pub fn steps(&self) -> &[Step] {
        self.executor().steps()
    }

    /// Run `f` once for the whole run and return its recorded result
    pub async fn run<T, E, F, Fut>(&self, step_name: impl Into<String>, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Serialize + DeserializeOwned,
        E: Display,
    {
        let step = LazyRunStep::new(step_name, f);
        let value = self.executor().add_step(Box::new(step)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Pause the run; the queue delivers the next invocation after `duration`
    ///
    /// The queue counts delays in whole seconds, so sub-second parts round up.
    pub async fn sleep(&self, step_name: impl Into<String>, duration: Duration) -> Result<()> {
        let step = LazySleepStep::new(step_name, delay_seconds(duration));
        self.executor().add_step(Box::new(step)).await?;
        Ok(())
    }

    /// Pause the run until `until`
    pub async fn sleep_until(
        &self,
        step_name: impl Into<String>,
        until: DateTime<Utc>,
    ) -> Result<()> {
        let step = LazySleepUntilStep::new(step_name, until);
        self.executor().add_step(Box::new(step)).await?;
        Ok(())
    }

    /// Have the queue make an HTTP request and resume the run with its response
    pub async fn call(
        &self,
        step_name: impl Into<String>,
        request: CallRequest,
    ) -> Result<CallResponse> {
        let step = LazyCallStep::new(step_name, request);
        let value = self.executor().add_step(Box::new(step)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Run several steps as one parallel group
    ///
    /// Each member runs in its own invocation; the results come back in request order
    /// once all of them are recorded.
    pub async fn parallel(&self, steps: Vec<BoxedLazyStep>) -> Result<Vec<Value>> {
        self.executor().add_parallel(steps).await
    }

    /// Typed [`parallel`](Self::parallel) over `run` steps sharing one closure type
    pub async fn run_all<I, N, T, E, F, Fut>(&self, steps: I) -> Result<Vec<T>>
    where
        I: IntoIterator<Item = (N, F)>,
        N: Into<String>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Serialize + DeserializeOwned,
        E: Display,
    {
        let lazy: Vec<BoxedLazyStep> = steps
            .into_iter()
            .map(|(name, f)| Box::new(LazyRunStep::new(name, f)) as BoxedLazyStep)
            .collect();

        self.parallel(lazy)
            .await?
            .into_iter()
            .map(|value| Ok(serde_json::from_value(value)?))
            .collect()
    }
}

fn delay_seconds(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

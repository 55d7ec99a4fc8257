//! Lazy step builders
//!
//! A lazy step knows how to announce itself (plan step) and how to produce its
//! result step. Nothing runs until the executor decides the step is new.

use std::fmt::Display;
use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use super::model::{CallRequest, Step, StepKind, StepType, NO_CONCURRENCY};
use crate::error::{Result, WorkflowError};

type StepWork = Box<dyn FnOnce() -> BoxFuture<'static, std::result::Result<Value, String>> + Send>;

/// A step requested by route code, not yet resolved against history
#[async_trait]
pub trait LazyStep: Send {
    fn step_name(&self) -> &str;

    fn step_type(&self) -> StepType;

    /// Announcement of this step as member `target_step` of a group of `concurrent`
    fn plan_step(&self, concurrent: usize, target_step: u64) -> Step;

    /// Execute (or schedule) the step and attach its result under `step_id`
    async fn result_step(&mut self, concurrent: usize, step_id: u64) -> Result<Step>;
}

/// Boxed lazy step, as accepted by [`WorkflowContext::parallel`](crate::WorkflowContext::parallel)
pub type BoxedLazyStep = Box<dyn LazyStep>;

fn plan(name: &str, kind: StepKind, concurrent: usize, target_step: u64) -> Step {
    Step {
        step_id: 0,
        step_name: name.to_string(),
        kind,
        out: None,
        concurrent,
        target_step: Some(target_step),
    }
}

/// Runs a user closure and records what it returns
pub struct LazyRunStep {
    name: String,
    work: Option<StepWork>,
}

impl LazyRunStep {
    pub fn new<T, E, F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Serialize,
        E: Display,
    {
        let work: StepWork = Box::new(move || {
            Box::pin(async move {
                let value = f().await.map_err(|e| e.to_string())?;
                serde_json::to_value(value).map_err(|e| e.to_string())
            })
        });

        Self {
            name: name.into(),
            work: Some(work),
        }
    }
}

#[async_trait]
impl LazyStep for LazyRunStep {
    fn step_name(&self) -> &str {
        &self.name
    }

    fn step_type(&self) -> StepType {
        StepType::Run
    }

    fn plan_step(&self, concurrent: usize, target_step: u64) -> Step {
        plan(&self.name, StepKind::Run, concurrent, target_step)
    }

    async fn result_step(&mut self, concurrent: usize, step_id: u64) -> Result<Step> {
        let work = self.work.take().ok_or_else(|| {
            WorkflowError::protocol(format!("step '{}' was already executed", self.name))
        })?;

        let out = work().await.map_err(|message| WorkflowError::StepFailed {
            step_name: self.name.clone(),
            message,
        })?;

        Ok(Step {
            step_id,
            step_name: self.name.clone(),
            kind: StepKind::Run,
            out: Some(out),
            concurrent,
            target_step: None,
        })
    }
}

/// Suspends the run for a duration
pub struct LazySleepStep {
    name: String,
    seconds: u64,
}

impl LazySleepStep {
    pub fn new(name: impl Into<String>, seconds: u64) -> Self {
        Self {
            name: name.into(),
            seconds,
        }
    }
}

#[async_trait]
impl LazyStep for LazySleepStep {
    fn step_name(&self) -> &str {
        &self.name
    }

    fn step_type(&self) -> StepType {
        StepType::SleepFor
    }

    fn plan_step(&self, concurrent: usize, target_step: u64) -> Step {
        let kind = StepKind::SleepFor {
            seconds: Some(self.seconds),
        };
        plan(&self.name, kind, concurrent, target_step)
    }

    async fn result_step(&mut self, concurrent: usize, step_id: u64) -> Result<Step> {
        // In a parallel group the wait already happened on the plan step's delivery
        let seconds = (concurrent == NO_CONCURRENCY).then_some(self.seconds);
        Ok(Step {
            step_id,
            step_name: self.name.clone(),
            kind: StepKind::SleepFor { seconds },
            out: None,
            concurrent,
            target_step: None,
        })
    }
}

/// Suspends the run until a point in time
pub struct LazySleepUntilStep {
    name: String,
    timestamp: i64,
}

impl LazySleepUntilStep {
    pub fn new(name: impl Into<String>, until: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            timestamp: until.timestamp(),
        }
    }
}

#[async_trait]
impl LazyStep for LazySleepUntilStep {
    fn step_name(&self) -> &str {
        &self.name
    }

    fn step_type(&self) -> StepType {
        StepType::SleepUntil
    }

    fn plan_step(&self, concurrent: usize, target_step: u64) -> Step {
        let kind = StepKind::SleepUntil {
            timestamp: Some(self.timestamp),
        };
        plan(&self.name, kind, concurrent, target_step)
    }

    async fn result_step(&mut self, concurrent: usize, step_id: u64) -> Result<Step> {
        let timestamp = (concurrent == NO_CONCURRENCY).then_some(self.timestamp);
        Ok(Step {
            step_id,
            step_name: self.name.clone(),
            kind: StepKind::SleepUntil { timestamp },
            out: None,
            concurrent,
            target_step: None,
        })
    }
}

/// Delegates an HTTP request to the queue service
///
/// The result step carries the request; the response comes back as a callback and is
/// recorded under the same step id by the invocation driver.
pub struct LazyCallStep {
    name: String,
    request: CallRequest,
}

impl LazyCallStep {
    pub fn new(name: impl Into<String>, request: CallRequest) -> Self {
        Self {
            name: name.into(),
            request,
        }
    }
}

#[async_trait]
impl LazyStep for LazyCallStep {
    fn step_name(&self) -> &str {
        &self.name
    }

    fn step_type(&self) -> StepType {
        StepType::Call
    }

    fn plan_step(&self, concurrent: usize, target_step: u64) -> Step {
        plan(
            &self.name,
            StepKind::Call { request: None },
            concurrent,
            target_step,
        )
    }

    async fn result_step(&mut self, concurrent: usize, step_id: u64) -> Result<Step> {
        Ok(Step {
            step_id,
            step_name: self.name.clone(),
            kind: StepKind::Call {
                request: Some(self.request.clone()),
            },
            out: None,
            concurrent,
            target_step: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_run_step_executes_once() {
        let mut step = LazyRunStep::new("double", || async { Ok::<_, String>(21 * 2) });

        let plan = step.plan_step(2, 5);
        assert_eq!(plan.step_id, 0);
        assert_eq!(plan.target_step, Some(5));
        assert_eq!(plan.out, None);

        let result = step.result_step(NO_CONCURRENCY, 5).await.unwrap();
        assert_eq!(result.step_id, 5);
        assert_eq!(result.out, Some(json!(42)));

        let again = step.result_step(NO_CONCURRENCY, 5).await;
        assert!(matches!(again, Err(WorkflowError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_run_step_error_becomes_step_failed() {
        let mut step = LazyRunStep::new("boom", || async { Err::<(), _>("exploded") });

        let result = step.result_step(NO_CONCURRENCY, 1).await;
        match result {
            Err(WorkflowError::StepFailed { step_name, message }) => {
                assert_eq!(step_name, "boom");
                assert_eq!(message, "exploded");
            }
            other => panic!("expected StepFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sleep_duration_only_on_single_execution() {
        let mut sleep = LazySleepStep::new("nap", 60);

        let plan = sleep.plan_step(3, 2);
        assert_eq!(plan.kind, StepKind::SleepFor { seconds: Some(60) });

        let single = sleep.result_step(NO_CONCURRENCY, 2).await.unwrap();
        assert_eq!(single.kind, StepKind::SleepFor { seconds: Some(60) });

        let parallel = sleep.result_step(3, 2).await.unwrap();
        assert_eq!(parallel.kind, StepKind::SleepFor { seconds: None });
    }

    #[tokio::test]
    async fn test_sleep_until_timestamp() {
        let until = DateTime::from_timestamp(1_900_000_000, 0).unwrap();
        let mut sleep = LazySleepUntilStep::new("wake", until);

        let result = sleep.result_step(NO_CONCURRENCY, 1).await.unwrap();
        assert_eq!(
            result.kind,
            StepKind::SleepUntil {
                timestamp: Some(1_900_000_000)
            }
        );
    }

    #[tokio::test]
    async fn test_call_plan_step_has_no_request() {
        let mut call = LazyCallStep::new("notify", CallRequest::new("https://example.com"));

        let plan = call.plan_step(2, 1);
        assert_eq!(plan.kind, StepKind::Call { request: None });

        let result = call.result_step(2, 1).await.unwrap();
        assert_eq!(
            result.call_request().map(|r| r.url.as_str()),
            Some("https://example.com")
        );
    }
}

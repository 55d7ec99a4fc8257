//! Step execution coordinator
//!
//! Route code is re-run from the top on every invocation. The executor decides, for each
//! step request, whether the step already has a recorded result (replay it) or is new
//! (run or schedule it, publish it, and stop the invocation).
//!
//! Step requests issued concurrently (for example through `futures::join!`) are
//! coalesced: each request registers into the active batch and yields twice before the
//! batch is resolved, so siblings polled in the same turn land in the same parallel
//! group. [`WorkflowContext::parallel`](crate::WorkflowContext::parallel) builds a group
//! explicitly without relying on this.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{AbortReason, Result, StepAbort, WorkflowError};
use crate::headers::{OutboundHeaders, UserHeaders, DEFAULT_CONTENT_TYPE};
use crate::publisher::{PublishRequest, QueuePublisher};
use crate::step::{BoxedLazyStep, LazyStep, Step, StepKind, NO_CONCURRENCY};

/// Where a parallel group stands in its publish/resolve lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelCallState {
    /// Nothing recorded for the group yet: publish every plan step
    First,
    /// A plan step was just delivered: run that one member
    Partial,
    /// Stale delivery of a group that has already moved on
    Discard,
    /// Every member has a result: hand them back to route code
    Last,
}

impl ParallelCallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Partial => "partial",
            Self::Discard => "discard",
            Self::Last => "last",
        }
    }
}

impl fmt::Display for ParallelCallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a parallel group of `parallel_step_count` members starting at step id
/// `initial_step_id` against `steps`
pub fn parallel_call_state(
    steps: &[Step],
    parallel_step_count: usize,
    initial_step_id: u64,
) -> ParallelCallState {
    let remaining: Vec<&Step> = steps
        .iter()
        .filter(|step| step.ordering_id() >= initial_step_id)
        .collect();

    match remaining.last() {
        None => ParallelCallState::First,
        Some(_) if remaining.len() >= 2 * parallel_step_count => ParallelCallState::Last,
        Some(last) if last.is_plan_step() => ParallelCallState::Partial,
        Some(_) => ParallelCallState::Discard,
    }
}

/// Everything needed to address messages for the current run
#[derive(Debug, Clone)]
pub(crate) struct PublishTarget {
    pub run_id: String,
    pub workflow_url: String,
    pub failure_url: Option<String>,
    pub user_headers: UserHeaders,
    pub retries: u32,
}

impl PublishTarget {
    pub fn headers(&self, init: bool, step: Option<&Step>) -> BTreeMap<String, String> {
        OutboundHeaders {
            init,
            run_id: &self.run_id,
            workflow_url: &self.workflow_url,
            user_headers: &self.user_headers,
            step,
            failure_url: self.failure_url.as_deref(),
            retries: Some(self.retries),
            call_retries: step.and_then(|s| s.call_request()).and_then(|r| r.retries),
        }
        .build()
    }

    /// Message that carries `step`
    ///
    /// Call steps go to the third party with the queue routing the response back;
    /// everything else comes back to the workflow endpoint.
    pub fn step_request(&self, step: &Step) -> Result<PublishRequest> {
        let mut headers = self.headers(false, Some(step));

        if let Some(call) = step.call_request() {
            return Ok(PublishRequest {
                url: call.url.clone(),
                method: call.method.clone(),
                body: call.body.clone().unwrap_or_default(),
                headers,
                delay: None,
                not_before: None,
            });
        }

        // Inside a parallel group only the plan step waits; its result step must not
        let will_wait = step.concurrent == NO_CONCURRENCY || step.step_id == 0;
        let (delay, not_before) = match step.kind {
            StepKind::SleepFor { seconds } if will_wait => (seconds, None),
            StepKind::SleepUntil { timestamp } if will_wait => (None, timestamp),
            _ => (None, None),
        };

        headers.insert("Content-Type".to_string(), DEFAULT_CONTENT_TYPE.to_string());

        Ok(PublishRequest {
            url: self.workflow_url.clone(),
            method: "POST".to_string(),
            body: serde_json::to_string(step)?,
            headers,
            delay,
            not_before,
        })
    }
}

/// Whether new steps are published or only detected
pub(crate) enum ExecutionMode {
    Live(Arc<dyn QueuePublisher>),
    /// The first step request aborts without publishing anything
    Preflight,
}

/// Step requests registered in the same turn
struct Batch {
    initial_step_id: u64,
    steps: Mutex<Vec<BoxedLazyStep>>,
    outcome: OnceCell<Result<Vec<Value>>>,
}

impl Batch {
    fn new(initial_step_id: u64, steps: Vec<BoxedLazyStep>) -> Self {
        Self {
            initial_step_id,
            steps: Mutex::new(steps),
            outcome: OnceCell::new(),
        }
    }
}

#[derive(Default)]
struct ExecutorState {
    /// Step ids handed out so far in this invocation
    step_count: u64,
    /// Plan steps belonging to parallel groups already resolved
    plan_step_count: u64,
    active_batch: Option<Arc<Batch>>,
    executing: bool,
    abort: Option<StepAbort>,
    committed: bool,
}

pub(crate) struct AutoExecutor {
    steps: Vec<Step>,
    /// Result steps in history, the initial step included
    non_plan_step_count: u64,
    target: PublishTarget,
    mode: ExecutionMode,
    state: Mutex<ExecutorState>,
}

impl AutoExecutor {
    pub fn new(steps: Vec<Step>, target: PublishTarget, mode: ExecutionMode) -> Self {
        let non_plan_step_count = steps.iter().filter(|step| !step.is_plan_step()).count() as u64;
        Self {
            steps,
            non_plan_step_count,
            target,
            mode,
            state: Mutex::new(ExecutorState::default()),
        }
    }

    pub fn target(&self) -> &PublishTarget {
        &self.target
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Whether this invocation published new steps
    pub fn committed(&self) -> bool {
        self.state.lock().committed
    }

    /// The step boundary this invocation stopped at, if any
    pub fn abort(&self) -> Option<StepAbort> {
        self.state.lock().abort.clone()
    }

    /// Request one step, coalescing with siblings requested in the same turn
    pub async fn add_step(&self, step: BoxedLazyStep) -> Result<Value> {
        let (batch, index) = {
            let mut state = self.state.lock();
            if let Some(abort) = &state.abort {
                return Err(WorkflowError::Aborted(abort.clone()));
            }
            state.step_count += 1;

            let batch = match state.active_batch.clone() {
                Some(batch) => batch,
                None => {
                    let batch = Arc::new(Batch::new(state.step_count, Vec::new()));
                    state.active_batch = Some(Arc::clone(&batch));
                    batch
                }
            };

            let mut members = batch.steps.lock();
            members.push(step);
            let index = members.len() - 1;
            drop(members);

            (batch, index)
        };

        // Let sibling requests polled in the same turn register first
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let outcome = batch
            .outcome
            .get_or_init(|| self.resolve_batch(&batch))
            .await;

        match outcome {
            Ok(values) => values.get(index).cloned().ok_or_else(|| {
                WorkflowError::protocol(format!("no result for batch member {index}"))
            }),
            Err(e) => Err(e.clone()),
        }
    }

    /// Request a parallel group explicitly
    pub async fn add_parallel(&self, steps: Vec<BoxedLazyStep>) -> Result<Vec<Value>> {
        if steps.is_empty() {
            return Ok(Vec::new());
        }

        let batch = {
            let mut state = self.state.lock();
            if let Some(abort) = &state.abort {
                return Err(WorkflowError::Aborted(abort.clone()));
            }
            let initial_step_id = state.step_count + 1;
            state.step_count += steps.len() as u64;
            Batch::new(initial_step_id, steps)
        };

        self.resolve_batch(&batch).await
    }

    async fn resolve_batch(&self, batch: &Batch) -> Result<Vec<Value>> {
        let plan_step_count = {
            let mut state = self.state.lock();
            if state
                .active_batch
                .as_ref()
                .is_some_and(|active| std::ptr::eq(Arc::as_ptr(active), batch))
            {
                state.active_batch = None;
            }
            if let Some(abort) = &state.abort {
                return Err(WorkflowError::Aborted(abort.clone()));
            }
            if state.executing {
                return Err(WorkflowError::protocol(
                    "a step can not be requested while another step is executing",
                ));
            }
            state.executing = true;
            state.plan_step_count
        };

        let steps = std::mem::take(&mut *batch.steps.lock());
        let size = steps.len() as u64;
        let result = self
            .execute(steps, batch.initial_step_id, plan_step_count)
            .await;

        let mut state = self.state.lock();
        state.executing = false;
        match &result {
            Ok(_) if size > 1 => state.plan_step_count += size,
            Err(WorkflowError::Aborted(abort)) => state.abort = Some(abort.clone()),
            _ => {}
        }

        result
    }

    async fn execute(
        &self,
        mut steps: Vec<BoxedLazyStep>,
        initial_step_id: u64,
        plan_step_count: u64,
    ) -> Result<Vec<Value>> {
        if let ExecutionMode::Preflight = self.mode {
            let step_name = steps.first().map(|s| s.step_name().to_string()).unwrap_or_default();
            debug!(%step_name, "pre-flight run reached a step");
            return Err(WorkflowError::aborted(step_name, AbortReason::Preflight));
        }

        if steps.len() > 1 {
            return self
                .run_parallel(steps, initial_step_id, plan_step_count)
                .await;
        }

        let Some(single) = steps.first_mut() else {
            return Ok(Vec::new());
        };
        let value = self
            .run_single(&mut **single, initial_step_id, plan_step_count)
            .await?;
        Ok(vec![value])
    }

    async fn run_single(
        &self,
        step: &mut dyn LazyStep,
        step_id: u64,
        plan_step_count: u64,
    ) -> Result<Value> {
        if step_id < self.non_plan_step_count {
            let recorded = self
                .steps
                .get((step_id + plan_step_count) as usize)
                .ok_or_else(|| {
                    WorkflowError::protocol(format!(
                        "history has no entry for step {step_id} ('{}')",
                        step.step_name()
                    ))
                })?;
            validate_step(step, recorded)?;

            debug!(step_id, step_name = %recorded.step_name, "replayed step");
            return Ok(recorded.out.clone().unwrap_or(Value::Null));
        }

        let result = step.result_step(NO_CONCURRENCY, step_id).await?;
        let step_name = result.step_name.clone();
        self.submit_steps(vec![result]).await?;

        Err(WorkflowError::aborted(step_name, AbortReason::Submitted))
    }

    async fn run_parallel(
        &self,
        mut steps: Vec<BoxedLazyStep>,
        initial_step_id: u64,
        plan_step_count: u64,
    ) -> Result<Vec<Value>> {
        let size = steps.len();
        let state = parallel_call_state(&self.steps, size, initial_step_id);
        debug!(%state, size, initial_step_id, "resolving parallel group");

        let mut sorted: Vec<&Step> = self.steps.iter().collect();
        sorted.sort_by_key(|step| step.ordering_id());

        if state != ParallelCallState::First {
            let planned = sorted
                .get((initial_step_id + plan_step_count) as usize)
                .map(|step| step.concurrent);
            if planned != Some(size) {
                return Err(WorkflowError::protocol(format!(
                    "Incompatible number of parallel steps when call state was '{state}'. \
                     Expected {size}, got {} from the request.",
                    planned.map_or_else(|| "none".to_string(), |n| n.to_string())
                )));
            }
        }

        let first_name = steps[0].step_name().to_string();

        match state {
            ParallelCallState::First => {
                let plan_steps = steps
                    .iter()
                    .enumerate()
                    .map(|(index, step)| step.plan_step(size, initial_step_id + index as u64))
                    .collect();
                self.submit_steps(plan_steps).await?;
                Err(WorkflowError::aborted(first_name, AbortReason::Submitted))
            }
            ParallelCallState::Partial => {
                let plan_step = self
                    .steps
                    .last()
                    .filter(|step| step.is_plan_step())
                    .ok_or_else(|| {
                        WorkflowError::protocol("parallel group has no plan step to execute")
                    })?;
                let target = plan_step.ordering_id();
                let member = target
                    .checked_sub(initial_step_id)
                    .map(|index| index as usize)
                    .and_then(|index| steps.get_mut(index))
                    .ok_or_else(|| {
                        WorkflowError::protocol(format!(
                            "plan step target {target} is outside the parallel group"
                        ))
                    })?;
                validate_step(&**member, plan_step)?;

                let result = member.result_step(size, target).await?;
                let step_name = result.step_name.clone();
                self.submit_steps(vec![result]).await?;
                Err(WorkflowError::aborted(step_name, AbortReason::Submitted))
            }
            ParallelCallState::Discard => {
                info!(
                    run_id = %self.target.run_id,
                    step_name = %first_name,
                    "discarding stale parallel delivery"
                );
                Err(WorkflowError::aborted(first_name, AbortReason::Discarded))
            }
            ParallelCallState::Last => {
                let results: Vec<&Step> = sorted
                    .into_iter()
                    .filter(|step| step.step_id >= initial_step_id)
                    .take(size)
                    .collect();
                validate_parallel_steps(&steps, &results)?;

                debug!(size, "replayed parallel group");
                Ok(results
                    .into_iter()
                    .map(|step| step.out.clone().unwrap_or(Value::Null))
                    .collect())
            }
        }
    }

    async fn submit_steps(&self, steps: Vec<Step>) -> Result<()> {
        let ExecutionMode::Live(publisher) = &self.mode else {
            return Err(WorkflowError::protocol("steps can not be published in pre-flight mode"));
        };
        let first = steps.first().ok_or_else(|| {
            WorkflowError::protocol("unable to submit steps: the list is empty")
        })?;
        let step_name = first.step_name.clone();

        let requests = steps
            .iter()
            .map(|step| self.target.step_request(step))
            .collect::<Result<Vec<_>>>()?;

        match <[PublishRequest; 1]>::try_from(requests) {
            Ok([request]) => {
                publisher.publish(request).await?;
            }
            Err(requests) => {
                publisher.batch_publish(requests).await?;
            }
        }

        self.state.lock().committed = true;
        info!(
            run_id = %self.target.run_id,
            %step_name,
            steps = steps.len(),
            "submitted steps"
        );
        Ok(())
    }
}

fn validate_step(lazy: &dyn LazyStep, recorded: &Step) -> Result<()> {
    if lazy.step_name() != recorded.step_name {
        return Err(WorkflowError::protocol(format!(
            "Incompatible step name. Expected '{}', got '{}' from the request",
            lazy.step_name(),
            recorded.step_name
        )));
    }
    if lazy.step_type() != recorded.step_type() {
        return Err(WorkflowError::protocol(format!(
            "Incompatible step type. Expected '{}', got '{}' from the request",
            lazy.step_type(),
            recorded.step_type()
        )));
    }
    Ok(())
}

fn validate_parallel_steps(lazy: &[BoxedLazyStep], recorded: &[&Step]) -> Result<()> {
    let mismatch = if lazy.len() != recorded.len() {
        Some(format!(
            "Expected {} results, got {} from the request",
            lazy.len(),
            recorded.len()
        ))
    } else {
        lazy.iter()
            .zip(recorded)
            .find_map(|(lazy, recorded)| validate_step(&**lazy, recorded).err())
            .map(|e| match e {
                WorkflowError::Protocol(message) => message,
                other => other.to_string(),
            })
    };

    let Some(mismatch) = mismatch else {
        return Ok(());
    };

    let quoted = |names: Vec<String>| {
        let quoted: Vec<String> = names.into_iter().map(|n| format!("\"{n}\"")).collect();
        format!("[{}]", quoted.join(","))
    };

    Err(WorkflowError::protocol(format!(
        "Incompatible steps detected in parallel execution: {mismatch}\
         \n  > Step Names from the request: {}\
         \n    Step Types from the request: {}\
         \n  > Step Names expected: {}\
         \n    Step Types expected: {}",
        quoted(recorded.iter().map(|s| s.step_name.clone()).collect()),
        quoted(recorded.iter().map(|s| s.step_type().to_string()).collect()),
        quoted(lazy.iter().map(|s| s.step_name().to_string()).collect()),
        quoted(lazy.iter().map(|s| s.step_type().to_string()).collect()),
    )))
}

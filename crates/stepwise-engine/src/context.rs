//! The handle a workflow function declares its steps through.

use std::collections::BTreeMap;
use std::fmt;
use std::future::{Future, pending, poll_fn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::Poll;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use stepwise_log::{CallResponse, StepId, StepKind, StepOutcome, WorkflowInvocationPayload};
use tracing::debug;

use crate::clock::{Clock, add_duration};
use crate::config::DivergencePolicy;
use crate::error::StepError;
use crate::executor::{ExecutorState, Lookup, PendingStep, StepExecutor};

/// An HTTP request the queue performs on behalf of a `call` step.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSpec {
  pub url: String,
  pub method: String,
  pub body: Vec<u8>,
  pub headers: BTreeMap<String, String>,
}

impl CallSpec {
  /// A `GET` of `url`.
  pub fn new(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      method: "GET".to_string(),
      body: Vec::new(),
      headers: BTreeMap::new(),
    }
  }

  pub fn method(mut self, method: impl Into<String>) -> Self {
    self.method = method.into();
    self
  }

  pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  /// Send `value` as a JSON body.
  pub fn json<T: Serialize>(self, value: &T) -> Result<Self, serde_json::Error> {
    let body = serde_json::to_vec(value)?;
    Ok(self.body(body).header("Content-Type", "application/json"))
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }
}

/// Handle passed to a workflow function.
///
/// Each step operation gets the next step id when it is first polled, so
/// steps awaited together (for example with `futures::join!`) are numbered
/// in the order they are listed. A step either resolves from the recorded
/// log or never resolves in this invocation: the runner suspends the run
/// and a later invocation sees the outcome.
#[derive(Clone)]
pub struct WorkflowContext {
  inner: Arc<ContextInner>,
}

struct ContextInner {
  workflow_run_id: String,
  workflow_url: String,
  raw_trigger_body: Vec<u8>,
  clock: Arc<dyn Clock>,
  executor: Mutex<StepExecutor>,
}

impl WorkflowContext {
  pub(crate) fn new(
    payload: WorkflowInvocationPayload,
    workflow_url: String,
    divergence: DivergencePolicy,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let WorkflowInvocationPayload {
      workflow_run_id,
      raw_trigger_body,
      steps,
    } = payload;

    Self {
      inner: Arc::new(ContextInner {
        workflow_run_id,
        workflow_url,
        raw_trigger_body,
        clock,
        executor: Mutex::new(StepExecutor::new(steps, divergence)),
      }),
    }
  }

  pub fn workflow_run_id(&self) -> &str {
    &self.inner.workflow_run_id
  }

  /// URL continuations and call responses are delivered to.
  pub fn workflow_url(&self) -> &str {
    &self.inner.workflow_url
  }

  /// Body of the request that started the run.
  pub fn request_payload(&self) -> &[u8] {
    &self.inner.raw_trigger_body
  }

  /// The trigger body decoded as JSON.
  pub fn payload<T: DeserializeOwned>(&self) -> Result<T, StepError> {
    serde_json::from_slice(&self.inner.raw_trigger_body).map_err(|e| StepError::Payload {
      message: e.to_string(),
    })
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.inner.clock.now()
  }

  /// Where this invocation is in its lifecycle.
  pub fn state(&self) -> ExecutorState {
    self.executor().state()
  }

  pub(crate) fn executor(&self) -> MutexGuard<'_, StepExecutor> {
    self
      .inner
      .executor
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Run `body` at most once per run and memoize its result.
  ///
  /// Once recorded, the value (or the error message of a failed body) is
  /// returned on every later invocation without calling `body`.
  pub async fn run<T, E, F, Fut>(&self, step_name: impl Into<String>, body: F) -> Result<T, StepError>
  where
    T: Serialize + DeserializeOwned,
    E: fmt::Display,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    let step_name = step_name.into();
    let (step_id, lookup) = self.executor().begin_step(StepKind::Run, &step_name);

    match lookup {
      Lookup::Replay(outcome) => return replay_run(step_id, step_name, outcome),
      Lookup::Halted => return pending().await,
      Lookup::Miss => {}
    }

    self.released(step_id, &step_name).await;
    debug!(step_id = %step_id, step_name = %step_name, "executing step");
    let outcome = StepOutcome::from_result(self.body_of(step_id, body()).await);
    self.executor().complete_run(step_id, &step_name, outcome);
    pending().await
  }

  /// Pause the run for `duration`, measured from when the step is first
  /// reached.
  pub async fn sleep(&self, step_name: impl Into<String>, duration: Duration) {
    let wake_at = add_duration(self.now(), duration);
    self.sleep_step(step_name.into(), wake_at, Some(duration)).await
  }

  /// Pause the run until `wake_at`.
  pub async fn sleep_until(&self, step_name: impl Into<String>, wake_at: DateTime<Utc>) {
    self.sleep_step(step_name.into(), wake_at, None).await
  }

  async fn sleep_step(&self, step_name: String, wake_at: DateTime<Utc>, delay: Option<Duration>) {
    let (step_id, lookup) = self.executor().begin_step(StepKind::Sleep, &step_name);

    let step = match lookup {
      Lookup::Replay(outcome) => {
        let recorded = outcome.wake_at().unwrap_or(wake_at);
        if recorded <= self.now() {
          return;
        }
        debug!(step_id = %step_id, wake_at = %recorded, "sleep not due yet");
        PendingStep::Wait { wake_at: recorded }
      }
      Lookup::Miss => PendingStep::Sleep { wake_at, delay },
      Lookup::Halted => return pending().await,
    };

    self.park(step_id, &step_name, step).await
  }

  /// Have the queue perform `spec` and resume with its response.
  ///
  /// Non-2xx responses are returned like any other response.
  pub async fn call(&self, step_name: impl Into<String>, spec: CallSpec) -> CallResponse {
    let step_name = step_name.into();
    let (step_id, lookup) = self.executor().begin_step(StepKind::Call, &step_name);

    match lookup {
      Lookup::Replay(outcome) => match outcome.call_response() {
        Some(response) => response,
        None => pending().await,
      },
      Lookup::Miss => self.park(step_id, &step_name, PendingStep::Call(spec)).await,
      Lookup::Halted => pending().await,
    }
  }

  /// Resolves once the runner lets the `run` step execute.
  async fn released(&self, step_id: StepId, step_name: &str) {
    poll_fn(|cx| {
      let mut executor = self.executor();
      if executor.is_released(step_id) {
        return Poll::Ready(());
      }
      executor.park(step_id, step_name, PendingStep::Run, cx.waker());
      Poll::Pending
    })
    .await
  }

  /// Poll a `run` body with `step_id` marked as the step in progress.
  async fn body_of<Fut: Future>(&self, step_id: StepId, body: Fut) -> Fut::Output {
    let mut body = std::pin::pin!(body);
    poll_fn(|cx| {
      let previous = self.executor().enter_body(step_id);
      let poll = body.as_mut().poll(cx);
      self.executor().leave_body(previous);
      poll
    })
    .await
  }

  /// Park a step that cannot finish in this invocation.
  async fn park<T>(&self, step_id: StepId, step_name: &str, step: PendingStep) -> T {
    poll_fn(|cx| {
      self
        .executor()
        .park(step_id, step_name, step.clone(), cx.waker());
      Poll::Pending
    })
    .await
  }
}

impl fmt::Debug for WorkflowContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkflowContext")
      .field("workflow_run_id", &self.inner.workflow_run_id)
      .field("workflow_url", &self.inner.workflow_url)
      .finish_non_exhaustive()
  }
}

fn replay_run<T: DeserializeOwned>(
  step_id: StepId,
  step_name: String,
  outcome: StepOutcome,
) -> Result<T, StepError> {
  match outcome {
    StepOutcome::Failed { error } => Err(StepError::Failed {
      step_id,
      step_name,
      message: error,
    }),
    outcome => outcome.decode_value().map_err(|e| StepError::Decode {
      step_id,
      step_name,
      message: e.to_string(),
    }),
  }
}

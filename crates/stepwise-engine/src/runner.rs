//! Handles one delivery of a workflow run.
//!
//! Each invocation authenticates the request, rebuilds the step log, replays
//! the workflow function against it and then does exactly one unit of new
//! work before handing the run back to the queue:
//!
//! - every `run` step reached in parallel is executed and committed in one
//!   continuation
//! - otherwise every sleep reached in parallel is recorded in one delayed
//!   continuation
//! - otherwise the first call reached is dispatched
//!
//! The run completes when the function returns during replay.

use std::collections::BTreeMap;
use std::fmt;
use std::future::{Future, poll_fn};
use std::sync::Arc;
use std::task::{Poll, Waker};

use serde::Serialize;
use serde_json::json;
use stepwise_gateway::{CallRequest, Delivery, MessageId, PublishRequest, QueueGateway};
use stepwise_log::{
  CallState, StepId, StepOutcome, StepRecord, WorkflowInvocationPayload, decode_call_state,
  decode_callback, decode_payload, encode_call_state, encode_payload,
};
use stepwise_signature::SignatureVerifier;
use tracing::{Span, debug, error, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::RunnerConfig;
use crate::context::{CallSpec, WorkflowContext};
use crate::error::WorkflowError;
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::executor::Plan;
use crate::headers::{
  SIGNATURE, WORKFLOW_CALL_STATE, WORKFLOW_CALLBACK, WORKFLOW_INIT, WORKFLOW_RUN_ID,
  WORKFLOW_STEP_ID,
};
use crate::request::{FrameworkAdapter, WorkflowRequest, WorkflowResponse};

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
  /// New work was handed to the queue; a later delivery continues the run.
  Suspended {
    workflow_run_id: String,
    message_id: MessageId,
  },
  /// The workflow function returned `output`.
  Completed {
    workflow_run_id: String,
    output: serde_json::Value,
  },
}

impl InvocationOutcome {
  pub fn workflow_run_id(&self) -> &str {
    match self {
      InvocationOutcome::Suspended {
        workflow_run_id, ..
      }
      | InvocationOutcome::Completed {
        workflow_run_id, ..
      } => workflow_run_id,
    }
  }

  pub fn into_response(self) -> WorkflowResponse {
    match self {
      InvocationOutcome::Suspended {
        workflow_run_id,
        message_id,
      } => WorkflowResponse::json(
        http::StatusCode::OK,
        &json!({ "workflowRunId": workflow_run_id, "messageId": message_id }),
      ),
      InvocationOutcome::Completed { output, .. } => {
        WorkflowResponse::json(http::StatusCode::OK, &output)
      }
    }
  }
}

enum Progress<O> {
  Returned(O),
  Halted(WorkflowError),
  RunsFinished,
  Plan,
}

/// Serves a workflow function behind a queue.
///
/// # Usage
///
/// ```ignore
/// let gateway = QstashGateway::new(QstashConfig::from_env()?);
/// let runner = WorkflowRunner::new(RunnerConfig::from_env()?, gateway)
///   .with_verifier(SignatureVerifier::new(SigningKeys::from_env()?));
///
/// let response = runner
///   .handle(request, |ctx| async move {
///     let order: Order = ctx.payload()?;
///     let receipt = ctx.run("charge", || charge(&order)).await?;
///     ctx.sleep("cool-off", Duration::from_secs(3600)).await;
///     ctx.run("email", || send_receipt(&receipt)).await
///   })
///   .await;
/// ```
pub struct WorkflowRunner<G, N = NoopNotifier> {
  config: RunnerConfig,
  gateway: G,
  notifier: N,
  verifier: Option<SignatureVerifier>,
  clock: Arc<dyn Clock>,
}

impl<G: QueueGateway> WorkflowRunner<G, NoopNotifier> {
  pub fn new(config: RunnerConfig, gateway: G) -> Self {
    Self::with_notifier(config, gateway, NoopNotifier)
  }
}

impl<G: QueueGateway, N: ExecutionNotifier> WorkflowRunner<G, N> {
  pub fn with_notifier(config: RunnerConfig, gateway: G, notifier: N) -> Self {
    Self {
      config,
      gateway,
      notifier,
      verifier: None,
      clock: Arc::new(SystemClock),
    }
  }

  /// Require every request to carry a valid queue signature.
  pub fn with_verifier(mut self, verifier: SignatureVerifier) -> Self {
    self.verifier = Some(verifier);
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn config(&self) -> &RunnerConfig {
    &self.config
  }

  pub fn gateway(&self) -> &G {
    &self.gateway
  }

  /// Handle a request for a framework through its adapter.
  pub async fn serve<A, F, Fut, R, E>(&self, adapter: &A, request: A::Request, workflow: F) -> A::Response
  where
    A: FrameworkAdapter,
    F: FnOnce(WorkflowContext) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    R: Serialize,
    E: fmt::Display,
  {
    let response = match adapter.parse(request) {
      Ok(request) => self.handle(request, workflow).await,
      Err(e) => {
        warn!(error = %e, "rejected unparseable request");
        WorkflowResponse::error(&e)
      }
    };
    adapter.build(response)
  }

  /// Handle one delivery and answer it.
  ///
  /// `200` once the run was suspended or completed. Any `5xx` makes the
  /// queue redeliver, which is safe: committed steps replay.
  pub async fn handle<F, Fut, R, E>(&self, request: WorkflowRequest, workflow: F) -> WorkflowResponse
  where
    F: FnOnce(WorkflowContext) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    R: Serialize,
    E: fmt::Display,
  {
    match self.invoke(&request, workflow).await {
      Ok(outcome) => outcome.into_response(),
      Err(e) => {
        if e.status().is_server_error() {
          error!(url = %request.url, error = %e, "workflow invocation failed");
        } else {
          warn!(url = %request.url, error = %e, "workflow request rejected");
        }
        WorkflowResponse::error(&e)
      }
    }
  }

  /// Handle one delivery, returning how it ended.
  #[instrument(
    name = "workflow_invocation",
    skip_all,
    fields(url = %request.url, workflow_run_id = tracing::field::Empty)
  )]
  pub async fn invoke<F, Fut, R, E>(
    &self,
    request: &WorkflowRequest,
    workflow: F,
  ) -> Result<InvocationOutcome, WorkflowError>
  where
    F: FnOnce(WorkflowContext) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    R: Serialize,
    E: fmt::Display,
  {
    self.authenticate(request)?;
    let payload = self.decode_invocation(request)?;
    let workflow_run_id = payload.workflow_run_id.clone();
    Span::current().record("workflow_run_id", workflow_run_id.as_str());

    info!(recorded_steps = payload.steps.len(), "invocation started");
    self.notifier.notify(ExecutionEvent::InvocationStarted {
      workflow_run_id: workflow_run_id.clone(),
      recorded_steps: payload.steps.len(),
    });

    let workflow_url = self
      .config
      .workflow_url
      .clone()
      .unwrap_or_else(|| request.url.clone());
    let ctx = WorkflowContext::new(
      payload,
      workflow_url,
      self.config.divergence,
      self.clock.clone(),
    );

    let result = self.drive(&ctx, workflow).await;
    if let Err(e) = &result {
      self.notifier.notify(ExecutionEvent::InvocationFailed {
        workflow_run_id,
        error: e.to_string(),
      });
    }
    result
  }

  fn authenticate(&self, request: &WorkflowRequest) -> Result<(), WorkflowError> {
    let Some(verifier) = &self.verifier else {
      return Ok(());
    };

    let signature = request
      .header(SIGNATURE)
      .ok_or(WorkflowError::MissingSignature)?;
    let source_url = self
      .config
      .verify_source_url
      .then_some(request.url.as_str());
    if !verifier.verify(signature, &request.body, source_url) {
      return Err(WorkflowError::InvalidSignature);
    }
    Ok(())
  }

  fn decode_invocation(
    &self,
    request: &WorkflowRequest,
  ) -> Result<WorkflowInvocationPayload, WorkflowError> {
    if request.header(WORKFLOW_CALLBACK) == Some("true") {
      return self.decode_call_response(request);
    }

    if request.header(WORKFLOW_INIT) == Some("false") {
      return Ok(decode_payload(&request.body)?);
    }

    let workflow_run_id = request
      .header(WORKFLOW_RUN_ID)
      .filter(|id| !id.trim().is_empty())
      .map(str::to_string)
      .unwrap_or_else(new_workflow_run_id);
    debug!(workflow_run_id = %workflow_run_id, "starting new run");
    Ok(WorkflowInvocationPayload::initial(
      workflow_run_id,
      request.body.to_vec(),
    ))
  }

  /// Rebuild the run from the state a call carried and record its response.
  fn decode_call_response(
    &self,
    request: &WorkflowRequest,
  ) -> Result<WorkflowInvocationPayload, WorkflowError> {
    let encoded = request
      .header(WORKFLOW_CALL_STATE)
      .ok_or_else(|| WorkflowError::InvalidRequest {
        message: "call response carries no call state".to_string(),
      })?;
    let CallState {
      step_id,
      step_name,
      mut payload,
    } = decode_call_state(encoded)?;

    if let Some(raw) = request.header(WORKFLOW_STEP_ID) {
      if raw.trim() != step_id.to_string() {
        return Err(WorkflowError::InvalidRequest {
          message: format!(
            "call response for step {} carries the state of step {}",
            raw, step_id
          ),
        });
      }
    }

    let response = decode_callback(&request.body)?;
    if payload.steps.contains(step_id) {
      debug!(step_id = %step_id, "call response already recorded");
    } else {
      info!(step_id = %step_id, status = response.status, "call response received");
      payload.steps.append(StepRecord::new(
        step_id,
        step_name,
        StepOutcome::from_call_response(response),
      ))?;
    }
    Ok(payload)
  }

  async fn drive<F, Fut, R, E>(
    &self,
    ctx: &WorkflowContext,
    workflow: F,
  ) -> Result<InvocationOutcome, WorkflowError>
  where
    F: FnOnce(WorkflowContext) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    R: Serialize,
    E: fmt::Display,
  {
    let mut execution = std::pin::pin!(workflow(ctx.clone()));

    loop {
      let progress = poll_fn(|cx| {
        if let Poll::Ready(result) = execution.as_mut().poll(cx) {
          return Poll::Ready(Progress::Returned(result));
        }

        let mut executor = ctx.executor();
        if let Some(e) = executor.take_halt() {
          Poll::Ready(Progress::Halted(e))
        } else if executor.has_released() {
          if executor.runs_finished() {
            Poll::Ready(Progress::RunsFinished)
          } else {
            Poll::Pending
          }
        } else if executor.has_pending() {
          Poll::Ready(Progress::Plan)
        } else {
          Poll::Pending
        }
      })
      .await;

      match progress {
        Progress::Returned(result) => return self.complete(ctx, result),
        Progress::Halted(e) => {
          self.flush_events(ctx);
          return Err(e);
        }
        Progress::RunsFinished => {
          let records = ctx.executor().finish_runs();
          return self.publish_continuation(ctx, records, Delivery::Immediate).await;
        }
        Progress::Plan => {
          let plan = ctx.executor().plan(self.clock.now());
          match plan {
            Some(Plan::ExecuteRuns(wakers)) => wakers.into_iter().for_each(Waker::wake),
            Some(Plan::Continue { records, delivery }) => {
              return self.publish_continuation(ctx, records, delivery).await;
            }
            Some(Plan::Call {
              step_id,
              step_name,
              spec,
            }) => return self.dispatch_call(ctx, step_id, step_name, spec).await,
            None => {}
          }
        }
      }
    }
  }

  fn complete<R, E>(
    &self,
    ctx: &WorkflowContext,
    result: Result<R, E>,
  ) -> Result<InvocationOutcome, WorkflowError>
  where
    R: Serialize,
    E: fmt::Display,
  {
    let value = match result {
      Ok(value) => value,
      Err(e) => {
        ctx.executor().fail();
        self.flush_events(ctx);
        return Err(WorkflowError::WorkflowFailed {
          message: e.to_string(),
        });
      }
    };

    let completion = ctx.executor().complete();
    self.flush_events(ctx);
    completion?;

    let output = serde_json::to_value(value).map_err(|e| WorkflowError::Output {
      message: e.to_string(),
    })?;
    info!("workflow completed");
    self.notifier.notify(ExecutionEvent::Completed {
      workflow_run_id: ctx.workflow_run_id().to_string(),
    });
    Ok(InvocationOutcome::Completed {
      workflow_run_id: ctx.workflow_run_id().to_string(),
      output,
    })
  }

  /// Publish the run with `records` appended and suspend.
  async fn publish_continuation(
    &self,
    ctx: &WorkflowContext,
    records: Vec<StepRecord>,
    delivery: Delivery,
  ) -> Result<InvocationOutcome, WorkflowError> {
    self.flush_events(ctx);

    let steps = ctx.executor().extended_log(&records)?;
    let payload = WorkflowInvocationPayload {
      workflow_run_id: ctx.workflow_run_id().to_string(),
      raw_trigger_body: ctx.request_payload().to_vec(),
      steps,
    };
    let request = PublishRequest::new(ctx.workflow_url(), encode_payload(&payload)?)
      .content_type("application/json")
      .forward_header(WORKFLOW_INIT, "false")
      .forward_header(WORKFLOW_RUN_ID, ctx.workflow_run_id())
      .delivery(delivery)
      .retries(self.config.retries);

    let message_id = self
      .gateway
      .publish(request)
      .await
      .map_err(|source| WorkflowError::Publish { source })?;

    for record in &records {
      self.notify_record(ctx, record);
    }
    info!(
      message_id = %message_id,
      new_steps = records.len(),
      delivery = ?delivery,
      "workflow suspended"
    );
    self.notifier.notify(ExecutionEvent::Suspended {
      workflow_run_id: ctx.workflow_run_id().to_string(),
      message_id: message_id.to_string(),
    });

    Ok(InvocationOutcome::Suspended {
      workflow_run_id: ctx.workflow_run_id().to_string(),
      message_id,
    })
  }

  /// Hand a call to the queue; its response arrives as a new delivery.
  async fn dispatch_call(
    &self,
    ctx: &WorkflowContext,
    step_id: StepId,
    step_name: String,
    spec: CallSpec,
  ) -> Result<InvocationOutcome, WorkflowError> {
    self.flush_events(ctx);

    let snapshot = WorkflowInvocationPayload {
      workflow_run_id: ctx.workflow_run_id().to_string(),
      raw_trigger_body: ctx.request_payload().to_vec(),
      steps: ctx.executor().log().clone(),
    };
    let state = encode_call_state(&CallState {
      step_id,
      step_name: step_name.clone(),
      payload: snapshot,
    })?;

    let mut callback_headers = BTreeMap::new();
    callback_headers.insert(WORKFLOW_CALLBACK.to_string(), "true".to_string());
    callback_headers.insert(WORKFLOW_RUN_ID.to_string(), ctx.workflow_run_id().to_string());
    callback_headers.insert(WORKFLOW_STEP_ID.to_string(), step_id.to_string());
    callback_headers.insert(WORKFLOW_CALL_STATE.to_string(), state);

    let url = spec.url.clone();
    let request = CallRequest {
      url: spec.url,
      method: spec.method,
      body: spec.body,
      headers: spec.headers,
      callback_url: ctx.workflow_url().to_string(),
      callback_headers,
      retries: self.config.retries,
    };

    let message_id = self
      .gateway
      .schedule_call(request)
      .await
      .map_err(|source| WorkflowError::Publish { source })?;

    info!(
      step_id = %step_id,
      step_name = %step_name,
      target = %url,
      message_id = %message_id,
      "call dispatched"
    );
    self.notifier.notify(ExecutionEvent::CallDispatched {
      workflow_run_id: ctx.workflow_run_id().to_string(),
      step_id,
      step_name,
      url,
      message_id: message_id.to_string(),
    });
    self.notifier.notify(ExecutionEvent::Suspended {
      workflow_run_id: ctx.workflow_run_id().to_string(),
      message_id: message_id.to_string(),
    });

    Ok(InvocationOutcome::Suspended {
      workflow_run_id: ctx.workflow_run_id().to_string(),
      message_id,
    })
  }

  fn notify_record(&self, ctx: &WorkflowContext, record: &StepRecord) {
    let workflow_run_id = ctx.workflow_run_id().to_string();
    let step_id = record.step_id;
    let step_name = record.step_name.clone();

    let event = match &record.outcome {
      StepOutcome::Ok { value } => ExecutionEvent::StepExecuted {
        workflow_run_id,
        step_id,
        step_name,
        value: value.clone(),
      },
      StepOutcome::Failed { error } => {
        warn!(step_id = %step_id, step_name = %step_name, error = %error, "step failed");
        ExecutionEvent::StepFailed {
          workflow_run_id,
          step_id,
          step_name,
          error: error.clone(),
        }
      }
      StepOutcome::Sleep { wake_at } => ExecutionEvent::SleepScheduled {
        workflow_run_id,
        step_id,
        step_name,
        wake_at: *wake_at,
      },
      StepOutcome::CallResult { .. } => return,
    };
    self.notifier.notify(event);
  }

  /// Report replayed steps and divergences seen so far.
  fn flush_events(&self, ctx: &WorkflowContext) {
    let (replayed, divergences) = {
      let mut executor = ctx.executor();
      (executor.take_replayed(), executor.take_divergences())
    };

    for (step_id, step_name) in replayed {
      self.notifier.notify(ExecutionEvent::StepReplayed {
        workflow_run_id: ctx.workflow_run_id().to_string(),
        step_id,
        step_name,
      });
    }
    for divergence in divergences {
      self.notifier.notify(ExecutionEvent::DivergenceDetected {
        workflow_run_id: ctx.workflow_run_id().to_string(),
        step_id: divergence.step_id,
        message: divergence.message,
      });
    }
  }
}

fn new_workflow_run_id() -> String {
  format!("wfr_{}", uuid::Uuid::new_v4())
}

use http::StatusCode;
use stepwise_gateway::GatewayError;
use stepwise_log::{CodecError, StepId};
use thiserror::Error;

/// Why a step handed back no value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
  /// The step body returned an error; replays report the same error.
  #[error("step {step_id} '{step_name}' failed: {message}")]
  Failed {
    step_id: StepId,
    step_name: String,
    message: String,
  },

  /// The recorded value does not deserialize into the requested type.
  #[error("step {step_id} '{step_name}' holds a value of another shape: {message}")]
  Decode {
    step_id: StepId,
    step_name: String,
    message: String,
  },

  #[error("trigger payload is not valid: {message}")]
  Payload { message: String },
}

/// Errors that end an invocation without a suspension or a completion.
#[derive(Debug, Error)]
pub enum WorkflowError {
  #[error("request carries no signature")]
  MissingSignature,

  #[error("request signature is not valid")]
  InvalidSignature,

  #[error("invalid request: {message}")]
  InvalidRequest { message: String },

  #[error("invalid invocation payload: {source}")]
  InvalidPayload {
    #[source]
    source: CodecError,
  },

  #[error("failed to hand the run to the queue: {source}")]
  Publish {
    #[source]
    source: GatewayError,
  },

  #[error("workflow diverged from its step log at step {step_id}: {message}")]
  Divergence { step_id: StepId, message: String },

  #[error("step {step_id} '{step_name}' was started inside another step")]
  NestedStep { step_id: StepId, step_name: String },

  #[error("workflow failed: {message}")]
  WorkflowFailed { message: String },

  #[error("workflow output could not be serialized: {message}")]
  Output { message: String },
}

impl WorkflowError {
  /// Status the HTTP boundary answers with.
  ///
  /// Anything `5xx` makes the queue redeliver the same message.
  pub fn status(&self) -> StatusCode {
    match self {
      WorkflowError::MissingSignature => StatusCode::UNAUTHORIZED,
      WorkflowError::InvalidSignature => StatusCode::FORBIDDEN,
      WorkflowError::InvalidRequest { .. } | WorkflowError::InvalidPayload { .. } => {
        StatusCode::BAD_REQUEST
      }
      WorkflowError::Publish { .. }
      | WorkflowError::Divergence { .. }
      | WorkflowError::NestedStep { .. }
      | WorkflowError::WorkflowFailed { .. }
      | WorkflowError::Output { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl From<CodecError> for WorkflowError {
  fn from(source: CodecError) -> Self {
    WorkflowError::InvalidPayload { source }
  }
}

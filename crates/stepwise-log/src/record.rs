//! Step records and their outcomes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Position of a step within one workflow run.
///
/// Ids are assigned by a counter that starts at 1 and follows the order in
/// which the workflow function first reaches each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(u32);

impl StepId {
  /// The id of the first step of a run.
  pub const FIRST: StepId = StepId(1);

  /// Create a step id, rejecting 0.
  pub fn new(value: u32) -> Result<Self, CodecError> {
    if value == 0 {
      return Err(CodecError::ZeroStepId);
    }
    Ok(Self(value))
  }

  pub fn get(self) -> u32 {
    self.0
  }

  /// The id following this one.
  pub fn next(self) -> StepId {
    StepId(self.0.saturating_add(1))
  }
}

impl fmt::Display for StepId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// The kind of context operation that produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepKind {
  Run,
  Call,
  Sleep,
}

impl fmt::Display for StepKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StepKind::Run => f.write_str("run"),
      StepKind::Call => f.write_str("call"),
      StepKind::Sleep => f.write_str("sleep"),
    }
  }
}

/// Response of an out-of-process HTTP call, as delivered by the queue.
///
/// Error statuses are ordinary responses: the workflow decides how to react.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResponse {
  pub status: u16,
  #[serde(default)]
  pub headers: BTreeMap<String, Vec<String>>,
  #[serde(default, with = "crate::payload::base64_bytes")]
  pub body: Vec<u8>,
}

impl CallResponse {
  /// Whether the status is in the 2xx range.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// The body as UTF-8 text.
  pub fn text(&self) -> Result<&str, CodecError> {
    std::str::from_utf8(&self.body).map_err(|e| CodecError::Value {
      message: format!("response body is not UTF-8: {}", e),
    })
  }

  /// Parse the body as JSON.
  pub fn json<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
    serde_json::from_slice(&self.body).map_err(|e| CodecError::Value {
      message: e.to_string(),
    })
  }
}

/// What a completed step produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StepOutcome {
  /// A `run` step whose body succeeded.
  Ok { value: serde_json::Value },

  /// A `run` step whose body returned an error.
  Failed { error: String },

  /// The response of a `call` step.
  #[serde(rename_all = "camelCase")]
  CallResult {
    status: u16,
    #[serde(default)]
    headers: BTreeMap<String, Vec<String>>,
    /// Raw response bytes, base64 on the wire.
    #[serde(default, with = "crate::payload::base64_bytes")]
    body: Vec<u8>,
  },

  /// A `sleep` step and the moment it is satisfied.
  #[serde(rename_all = "camelCase")]
  Sleep { wake_at: DateTime<Utc> },
}

impl StepOutcome {
  /// Encode the result of a freshly executed `run` body.
  ///
  /// An `Err` becomes a [`StepOutcome::Failed`] so that replay reports the
  /// failure instead of pretending the step succeeded.
  pub fn from_result<T, E>(result: Result<T, E>) -> StepOutcome
  where
    T: Serialize,
    E: fmt::Display,
  {
    match result {
      Ok(value) => match serde_json::to_value(value) {
        Ok(value) => StepOutcome::Ok { value },
        Err(e) => StepOutcome::Failed {
          error: format!("failed to serialize step output: {}", e),
        },
      },
      Err(e) => StepOutcome::Failed {
        error: e.to_string(),
      },
    }
  }

  /// Build a call outcome from a delivered response.
  pub fn from_call_response(response: CallResponse) -> StepOutcome {
    StepOutcome::CallResult {
      status: response.status,
      headers: response.headers,
      body: response.body,
    }
  }

  pub fn kind(&self) -> StepKind {
    match self {
      StepOutcome::Ok { .. } | StepOutcome::Failed { .. } => StepKind::Run,
      StepOutcome::CallResult { .. } => StepKind::Call,
      StepOutcome::Sleep { .. } => StepKind::Sleep,
    }
  }

  /// Decode the memoized value of an `ok` outcome.
  pub fn decode_value<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
    match self {
      StepOutcome::Ok { value } => {
        T::deserialize(value).map_err(|e| CodecError::Value {
          message: e.to_string(),
        })
      }
      other => Err(CodecError::Value {
        message: format!("expected an ok outcome, found a {} outcome", other.kind()),
      }),
    }
  }

  /// The call response held by a `callResult` outcome.
  pub fn call_response(&self) -> Option<CallResponse> {
    match self {
      StepOutcome::CallResult {
        status,
        headers,
        body,
      } => Some(CallResponse {
        status: *status,
        headers: headers.clone(),
        body: body.clone(),
      }),
      _ => None,
    }
  }

  pub fn wake_at(&self) -> Option<DateTime<Utc>> {
    match self {
      StepOutcome::Sleep { wake_at } => Some(*wake_at),
      _ => None,
    }
  }
}

/// One completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
  pub step_id: StepId,
  /// Human-readable name, used for diagnostics only.
  pub step_name: String,
  pub outcome: StepOutcome,
}

impl StepRecord {
  pub fn new(step_id: StepId, step_name: impl Into<String>, outcome: StepOutcome) -> Self {
    Self {
      step_id,
      step_name: step_name.into(),
      outcome,
    }
  }

  pub fn kind(&self) -> StepKind {
    self.outcome.kind()
  }
}

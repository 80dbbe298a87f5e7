//! Codec errors.

use crate::record::StepId;

/// Errors that can occur while encoding or decoding step log data.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
  /// The payload is not valid JSON or does not match the wire format.
  #[error("malformed payload: {source}")]
  Malformed {
    #[source]
    source: serde_json::Error,
  },

  /// A base64 field could not be decoded.
  #[error("invalid base64 in '{field}': {message}")]
  InvalidBase64 { field: String, message: String },

  /// Step ids start at 1.
  #[error("step id 0 is not a valid step id")]
  ZeroStepId,

  /// Two records claim the same step id.
  #[error("duplicate record for step {step_id}")]
  DuplicateStep { step_id: StepId },

  /// A step value could not be converted to or from JSON.
  #[error("step value conversion failed: {message}")]
  Value { message: String },
}

impl From<serde_json::Error> for CodecError {
  fn from(source: serde_json::Error) -> Self {
    Self::Malformed { source }
  }
}

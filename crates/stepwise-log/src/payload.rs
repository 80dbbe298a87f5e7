//! The body of every workflow invocation after the first.

use serde::{Deserialize, Serialize};

use crate::log::StepLog;

/// Everything an invocation needs to replay a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInvocationPayload {
  /// Stable across all invocations of one run.
  pub workflow_run_id: String,
  /// The body of the request that started the run.
  #[serde(with = "base64_bytes")]
  pub raw_trigger_body: Vec<u8>,
  #[serde(default)]
  pub steps: StepLog,
}

impl WorkflowInvocationPayload {
  /// Payload of the first invocation of a run: no completed steps yet.
  pub fn initial(workflow_run_id: impl Into<String>, raw_trigger_body: impl Into<Vec<u8>>) -> Self {
    Self {
      workflow_run_id: workflow_run_id.into(),
      raw_trigger_body: raw_trigger_body.into(),
      steps: StepLog::new(),
    }
  }
}

/// Byte fields travel as standard base64 strings.
pub(crate) mod base64_bytes {
  use base64::Engine;
  use base64::engine::general_purpose::STANDARD;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
      .decode(encoded.as_bytes())
      .map_err(serde::de::Error::custom)
  }
}

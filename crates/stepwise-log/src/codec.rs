//! JSON wire codec for payloads, callbacks and call state.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::payload::WorkflowInvocationPayload;
use crate::record::{CallResponse, StepId};

/// Encode a payload for a continuation message body.
pub fn encode_payload(payload: &WorkflowInvocationPayload) -> Result<Vec<u8>, CodecError> {
  Ok(serde_json::to_vec(payload)?)
}

/// Decode the body of a continuation invocation.
pub fn decode_payload(bytes: &[u8]) -> Result<WorkflowInvocationPayload, CodecError> {
  Ok(serde_json::from_slice(bytes)?)
}

/// Envelope the queue posts to a callback URL once a dispatched call finished.
#[derive(Debug, Deserialize)]
struct CallbackEnvelope {
  status: u16,
  #[serde(default)]
  header: BTreeMap<String, Vec<String>>,
  /// Base64 of the response body.
  #[serde(default)]
  body: Option<String>,
}

/// Decode a callback delivery into the response of the call.
pub fn decode_callback(bytes: &[u8]) -> Result<CallResponse, CodecError> {
  let envelope: CallbackEnvelope = serde_json::from_slice(bytes)?;

  let body = match envelope.body {
    Some(encoded) if !encoded.is_empty() => STANDARD
      .decode(encoded.as_bytes())
      .map_err(|e| CodecError::InvalidBase64 {
        field: "body".to_string(),
        message: e.to_string(),
      })?,
    _ => Vec::new(),
  };

  Ok(CallResponse {
    status: envelope.status,
    headers: envelope.header,
    body,
  })
}

/// What a dispatched call needs to resume its run once the response arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallState {
  pub step_id: StepId,
  pub step_name: String,
  /// The run as it stood when the call was dispatched.
  pub payload: WorkflowInvocationPayload,
}

/// Encode call state so it can travel in a header through the queue.
pub fn encode_call_state(state: &CallState) -> Result<String, CodecError> {
  Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(state)?))
}

/// Decode state produced by [`encode_call_state`].
pub fn decode_call_state(encoded: &str) -> Result<CallState, CodecError> {
  let bytes = URL_SAFE_NO_PAD
    .decode(encoded.trim().as_bytes())
    .map_err(|e| CodecError::InvalidBase64 {
      field: "call state".to_string(),
      message: e.to_string(),
    })?;
  Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::log::StepLog;
  use crate::record::{StepId, StepOutcome, StepRecord};
  use chrono::{TimeZone, Utc};
  use serde_json::json;

  fn sample_payload() -> WorkflowInvocationPayload {
    let wake_at = Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap();
    WorkflowInvocationPayload {
      workflow_run_id: "wfr_test".to_string(),
      raw_trigger_body: br#"{"order":42}"#.to_vec(),
      steps: StepLog::from_records(vec![
        StepRecord::new(StepId::FIRST, "a", StepOutcome::Ok { value: json!(1) }),
        StepRecord::new(
          StepId::new(2).unwrap(),
          "nap",
          StepOutcome::Sleep { wake_at },
        ),
      ])
      .unwrap(),
    }
  }

  #[test]
  fn test_payload_wire_format() {
    let encoded = encode_payload(&sample_payload()).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();

    assert_eq!(value["workflowRunId"], "wfr_test");
    assert_eq!(value["rawTriggerBody"], "eyJvcmRlciI6NDJ9");
    assert_eq!(value["steps"][0]["outcome"]["type"], "ok");
    assert_eq!(value["steps"][1]["outcome"]["wakeAt"], "2030-01-01T12:00:00Z");

    assert_eq!(decode_payload(&encoded).unwrap(), sample_payload());
  }

  #[test]
  fn test_decode_payload_without_steps() {
    let payload = decode_payload(br#"{"workflowRunId":"wfr_1","rawTriggerBody":""}"#).unwrap();
    assert!(payload.steps.is_empty());
    assert!(payload.raw_trigger_body.is_empty());
  }

  #[test]
  fn test_decode_payload_rejects_garbage() {
    assert!(matches!(
      decode_payload(b"not json"),
      Err(CodecError::Malformed { .. })
    ));
    assert!(decode_payload(br#"{"workflowRunId":"x","rawTriggerBody":"%%%"}"#).is_err());
  }

  #[test]
  fn test_decode_callback() {
    let body = json!({
      "status": 404,
      "header": { "Content-Type": ["text/plain"] },
      "body": "bm90IGZvdW5k",
      "retried": 0,
      "sourceMessageId": "msg_1"
    });
    let response = decode_callback(body.to_string().as_bytes()).unwrap();
    assert_eq!(response.status, 404);
    assert_eq!(response.body, b"not found");
    assert_eq!(response.headers["Content-Type"], vec!["text/plain".to_string()]);
  }

  #[test]
  fn test_decode_callback_keeps_binary_body() {
    // bytes 137 80 78 71 255 254
    let body = json!({ "status": 200, "body": "iVBOR//+" });
    let response = decode_callback(body.to_string().as_bytes()).unwrap();
    assert_eq!(response.body, vec![137, 80, 78, 71, 255, 254]);
  }

  #[test]
  fn test_call_state_survives_header_transport() {
    let state = CallState {
      step_id: StepId::new(3).unwrap(),
      step_name: "charge card ✓".to_string(),
      payload: sample_payload(),
    };
    let encoded = encode_call_state(&state).unwrap();
    assert!(encoded.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    assert_eq!(decode_call_state(&encoded).unwrap(), state);
    assert!(matches!(
      decode_call_state("***"),
      Err(CodecError::InvalidBase64 { .. })
    ));
  }
}

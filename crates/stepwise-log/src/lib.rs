//! Stepwise step log.
//!
//! The step log is the only durable state of a workflow run. It travels inside
//! every continuation message as part of a [`WorkflowInvocationPayload`] and is
//! rebuilt from scratch by each invocation.
//!
//! This crate owns the data model and its JSON wire format:
//!
//! ```text
//! {
//!   "workflowRunId": "wfr_...",
//!   "rawTriggerBody": "<base64>",
//!   "steps": [
//!     { "stepId": 1, "stepName": "a", "outcome": { "type": "ok", "value": 1 } },
//!     { "stepId": 2, "stepName": "nap", "outcome": { "type": "sleep", "wakeAt": "..." } }
//!   ]
//! }
//! ```

mod codec;
mod error;
mod log;
mod payload;
mod record;

pub use codec::{
  CallState, decode_call_state, decode_callback, decode_payload, encode_call_state,
  encode_payload,
};
pub use error::CodecError;
pub use log::StepLog;
pub use payload::WorkflowInvocationPayload;
pub use record::{CallResponse, StepId, StepKind, StepOutcome, StepRecord};

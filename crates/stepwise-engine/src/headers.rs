//! Headers the runner exchanges with itself through the queue.
//!
//! They are set as forwarded headers on outgoing messages, so the queue
//! delivers them back with the prefix stripped.

/// Id of the run a delivery belongs to. On a first invocation it may be
/// supplied by the caller to choose the run id.
pub const WORKFLOW_RUN_ID: &str = "Workflow-Run-Id";

/// `false` on continuations, whose body is an invocation payload.
pub const WORKFLOW_INIT: &str = "Workflow-Init";

/// `true` on the delivery of a call response.
pub const WORKFLOW_CALLBACK: &str = "Workflow-Callback";

/// Step id a call response belongs to.
pub const WORKFLOW_STEP_ID: &str = "Workflow-Step-Id";

/// Encoded run state carried through a call.
pub const WORKFLOW_CALL_STATE: &str = "Workflow-Call-State";

/// Signature header set by the queue on every delivery.
pub use stepwise_gateway::headers::SIGNATURE;

//! Execution events and notifiers for observability.
//!
//! The runner emits events while it replays, executes and suspends a run so
//! that consumers can persist progress, stream it to a UI, and so on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stepwise_log::StepId;
use tokio::sync::mpsc;

/// Events emitted while handling one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionEvent {
  /// An invocation passed authentication and decoded its step log.
  InvocationStarted {
    workflow_run_id: String,
    recorded_steps: usize,
  },

  /// A step was answered from the log without running.
  StepReplayed {
    workflow_run_id: String,
    step_id: StepId,
    step_name: String,
  },

  /// A `run` body finished and its value was committed.
  StepExecuted {
    workflow_run_id: String,
    step_id: StepId,
    step_name: String,
    value: serde_json::Value,
  },

  /// A `run` body returned an error, committed as a failed record.
  StepFailed {
    workflow_run_id: String,
    step_id: StepId,
    step_name: String,
    error: String,
  },

  /// A sleep was recorded.
  SleepScheduled {
    workflow_run_id: String,
    step_id: StepId,
    step_name: String,
    wake_at: DateTime<Utc>,
  },

  /// A call was handed to the queue.
  CallDispatched {
    workflow_run_id: String,
    step_id: StepId,
    step_name: String,
    url: String,
    message_id: String,
  },

  /// The run was handed back to the queue.
  Suspended {
    workflow_run_id: String,
    message_id: String,
  },

  /// The log disagreed with the workflow code.
  DivergenceDetected {
    workflow_run_id: String,
    step_id: StepId,
    message: String,
  },

  /// The workflow function returned.
  Completed { workflow_run_id: String },

  /// The invocation ended with an error.
  InvocationFailed {
    workflow_run_id: String,
    error: String,
  },
}

/// Receives execution events.
///
/// The runner calls `notify` for each event; implementations decide what to
/// do with them.
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// Sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls an invocation.
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // receiver may have been dropped
    let _ = self.sender.send(event);
  }
}

impl<N: ExecutionNotifier + ?Sized> ExecutionNotifier for std::sync::Arc<N> {
  fn notify(&self, event: ExecutionEvent) {
    (**self).notify(event)
  }
}

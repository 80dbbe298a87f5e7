//! In-memory gateway for tests and local runs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::QueueGateway;
use crate::error::GatewayError;
use crate::types::{CallRequest, MessageId, PublishRequest};

/// A message accepted by a [`RecordingGateway`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedMessage {
  Publish(PublishRequest),
  Call(CallRequest),
}

/// Gateway that accepts every message and keeps it in memory.
///
/// Message ids are `msg-1`, `msg-2`, ... in acceptance order.
#[derive(Debug, Default)]
pub struct RecordingGateway {
  messages: Mutex<Vec<RecordedMessage>>,
  counter: AtomicU64,
  fail_next: AtomicBool,
}

impl RecordingGateway {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make the next publish or call fail with a `503` rejection.
  pub fn fail_next(&self) {
    self.fail_next.store(true, Ordering::SeqCst);
  }

  /// All accepted messages, oldest first.
  pub fn messages(&self) -> Vec<RecordedMessage> {
    self.lock().clone()
  }

  /// Accepted publishes, oldest first.
  pub fn published(&self) -> Vec<PublishRequest> {
    self
      .lock()
      .iter()
      .filter_map(|m| match m {
        RecordedMessage::Publish(p) => Some(p.clone()),
        RecordedMessage::Call(_) => None,
      })
      .collect()
  }

  /// Accepted call dispatches, oldest first.
  pub fn calls(&self) -> Vec<CallRequest> {
    self
      .lock()
      .iter()
      .filter_map(|m| match m {
        RecordedMessage::Call(c) => Some(c.clone()),
        RecordedMessage::Publish(_) => None,
      })
      .collect()
  }

  /// Forget every recorded message.
  pub fn clear(&self) {
    self.lock().clear();
  }

  fn lock(&self) -> MutexGuard<'_, Vec<RecordedMessage>> {
    self.messages.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn accept(&self, message: RecordedMessage) -> Result<MessageId, GatewayError> {
    if self.fail_next.swap(false, Ordering::SeqCst) {
      return Err(GatewayError::Rejected {
        status: 503,
        message: "recording gateway told to fail".to_string(),
      });
    }

    let id = MessageId(format!("msg-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1));
    debug!(message_id = %id, "recorded message");
    self.lock().push(message);
    Ok(id)
  }
}

#[async_trait]
impl QueueGateway for RecordingGateway {
  async fn publish(&self, request: PublishRequest) -> Result<MessageId, GatewayError> {
    self.accept(RecordedMessage::Publish(request))
  }

  async fn schedule_call(&self, request: CallRequest) -> Result<MessageId, GatewayError> {
    self.accept(RecordedMessage::Call(request))
  }
}

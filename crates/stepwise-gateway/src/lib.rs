//! Queue gateway for stepwise.
//!
//! The engine talks to the remote queue through the [`QueueGateway`] trait:
//! publish a message to a URL (immediately or delayed) to continue a workflow,
//! or dispatch an HTTP call whose response the queue delivers to a callback.
//!
//! Publishing is fire-and-forget: success means the queue accepted the
//! message, not that it was delivered. Delivery retries are the queue's job.
//!
//! - [`QstashGateway`] speaks the queue's HTTP API.
//! - [`RecordingGateway`] keeps messages in memory for tests and local runs.

mod error;
pub mod headers;
mod memory;
mod qstash;
mod types;

use std::sync::Arc;

use async_trait::async_trait;

pub use error::{ConfigError, GatewayError};
pub use memory::{RecordedMessage, RecordingGateway};
pub use qstash::{QstashConfig, QstashGateway};
pub use types::{CallRequest, Delivery, MessageId, PublishRequest};

/// Publishes messages to the remote queue.
#[async_trait]
pub trait QueueGateway: Send + Sync {
  /// Publish `request.body` to `request.destination`.
  async fn publish(&self, request: PublishRequest) -> Result<MessageId, GatewayError>;

  /// Dispatch an HTTP call and have its response delivered to a callback URL.
  async fn schedule_call(&self, request: CallRequest) -> Result<MessageId, GatewayError>;
}

#[async_trait]
impl<T: QueueGateway + ?Sized> QueueGateway for Arc<T> {
  async fn publish(&self, request: PublishRequest) -> Result<MessageId, GatewayError> {
    (**self).publish(request).await
  }

  async fn schedule_call(&self, request: CallRequest) -> Result<MessageId, GatewayError> {
    (**self).schedule_call(request).await
  }
}

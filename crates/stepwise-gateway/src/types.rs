//! Message types handed to the gateway.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Id the queue assigned to an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// When the queue should deliver a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
  #[default]
  Immediate,
  /// Deliver after a relative delay (whole seconds).
  Delay(Duration),
  /// Deliver no earlier than an absolute time.
  NotBefore(DateTime<Utc>),
}

/// A message to publish to a destination URL.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
  pub destination: String,
  pub body: Vec<u8>,
  pub content_type: Option<String>,
  /// Headers the queue forwards to the destination.
  pub forward_headers: BTreeMap<String, String>,
  pub delivery: Delivery,
  pub retries: Option<u32>,
}

impl PublishRequest {
  pub fn new(destination: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
    Self {
      destination: destination.into(),
      body: body.into(),
      content_type: None,
      forward_headers: BTreeMap::new(),
      delivery: Delivery::Immediate,
      retries: None,
    }
  }

  /// A message whose body is `value` serialized as JSON.
  pub fn json<T: Serialize>(destination: impl Into<String>, value: &T) -> Result<Self, GatewayError> {
    let body = serde_json::to_vec(value).map_err(|e| GatewayError::Serialization {
      message: e.to_string(),
    })?;
    Ok(Self::new(destination, body).content_type("application/json"))
  }

  pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
    self.content_type = Some(content_type.into());
    self
  }

  pub fn forward_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.forward_headers.insert(name.into(), value.into());
    self
  }

  pub fn delivery(mut self, delivery: Delivery) -> Self {
    self.delivery = delivery;
    self
  }

  pub fn retries(mut self, retries: Option<u32>) -> Self {
    self.retries = retries;
    self
  }
}

/// An HTTP call the queue performs on our behalf.
///
/// The target's response is posted to `callback_url`, together with the
/// `callback_headers`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
  pub url: String,
  pub method: String,
  pub body: Vec<u8>,
  /// Headers forwarded to the call target.
  pub headers: BTreeMap<String, String>,
  pub callback_url: String,
  /// Headers forwarded to the callback.
  pub callback_headers: BTreeMap<String, String>,
  pub retries: Option<u32>,
}

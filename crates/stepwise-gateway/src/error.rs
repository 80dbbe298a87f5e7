//! Gateway errors.

use thiserror::Error;

/// Errors that can occur while handing a message to the queue.
#[derive(Debug, Error)]
pub enum GatewayError {
  /// The request never got a response.
  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),

  /// The queue answered with a non-success status.
  #[error("queue rejected the message ({status}): {message}")]
  Rejected { status: u16, message: String },

  /// The queue answered with a body we could not read.
  #[error("invalid queue response: {message}")]
  InvalidResponse { message: String },

  /// A destination or callback is not an absolute URL.
  #[error("invalid url '{url}': {message}")]
  InvalidUrl { url: String, message: String },

  /// A call step asked for a method HTTP does not know.
  #[error("unsupported http method '{method}'")]
  InvalidMethod { method: String },

  /// A message body could not be serialized.
  #[error("failed to serialize message body: {message}")]
  Serialization { message: String },
}

/// Errors that can occur while reading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("environment variable '{name}' is not set")]
  Missing { name: String },

  #[error("invalid value for '{name}': {message}")]
  Invalid { name: String, message: String },
}

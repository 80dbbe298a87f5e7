//! Gateway backed by the queue's HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, Request};
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{ConfigError, GatewayError};
use crate::headers;
use crate::types::{CallRequest, Delivery, MessageId, PublishRequest};
use crate::QueueGateway;

const DEFAULT_BASE_URL: &str = "https://qstash.upstash.io";

/// Connection settings for the queue API.
#[derive(Clone)]
pub struct QstashConfig {
  /// Root of the queue API, e.g. `https://qstash.upstash.io`.
  pub base_url: String,
  /// Bearer token for the queue API.
  pub token: String,
}

impl QstashConfig {
  /// Settings for the hosted queue.
  pub fn new(token: impl Into<String>) -> Self {
    Self {
      base_url: DEFAULT_BASE_URL.to_string(),
      token: token.into(),
    }
  }

  pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
    self.base_url = base_url.into();
    self
  }

  /// Read `QSTASH_TOKEN` and, optionally, `QSTASH_URL`.
  pub fn from_env() -> Result<Self, ConfigError> {
    let token = std::env::var("QSTASH_TOKEN")
      .ok()
      .filter(|v| !v.is_empty())
      .ok_or_else(|| ConfigError::Missing {
        name: "QSTASH_TOKEN".to_string(),
      })?;

    let config = Self::new(token);
    match std::env::var("QSTASH_URL") {
      Ok(raw) if !raw.is_empty() => {
        Url::parse(&raw).map_err(|e| ConfigError::Invalid {
          name: "QSTASH_URL".to_string(),
          message: e.to_string(),
        })?;
        Ok(config.with_base_url(raw))
      }
      _ => Ok(config),
    }
  }
}

impl std::fmt::Debug for QstashConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QstashConfig")
      .field("base_url", &self.base_url)
      .finish_non_exhaustive()
  }
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
  #[serde(rename = "messageId")]
  message_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
  error: String,
}

/// Publishes messages through the queue's `/v2/publish` endpoint.
#[derive(Debug, Clone)]
pub struct QstashGateway {
  client: Client,
  config: QstashConfig,
}

impl QstashGateway {
  pub fn new(config: QstashConfig) -> Self {
    Self::with_client(config, Client::new())
  }

  pub fn with_client(config: QstashConfig, client: Client) -> Self {
    Self { client, config }
  }

  fn publish_url(&self, destination: &str) -> Result<String, GatewayError> {
    Url::parse(destination).map_err(|e| GatewayError::InvalidUrl {
      url: destination.to_string(),
      message: e.to_string(),
    })?;
    let base = self.config.base_url.trim_end_matches('/');
    Ok(format!("{}/v2/publish/{}", base, destination))
  }

  /// Build the HTTP request for a publish without sending it.
  pub fn build_publish(&self, request: &PublishRequest) -> Result<Request, GatewayError> {
    let mut builder = self
      .client
      .post(self.publish_url(&request.destination)?)
      .bearer_auth(&self.config.token)
      .header(headers::METHOD, "POST")
      .body(request.body.clone());

    if let Some(content_type) = &request.content_type {
      builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
    }
    match request.delivery {
      Delivery::Immediate => {}
      Delivery::Delay(delay) => {
        builder = builder.header(headers::DELAY, format!("{}s", delay_seconds(delay)));
      }
      Delivery::NotBefore(at) => {
        builder = builder.header(headers::NOT_BEFORE, not_before_seconds(at).to_string());
      }
    }
    if let Some(retries) = request.retries {
      builder = builder.header(headers::RETRIES, retries.to_string());
    }
    for (name, value) in &request.forward_headers {
      builder = builder.header(format!("{}{}", headers::FORWARD_PREFIX, name), value);
    }

    Ok(builder.build()?)
  }

  /// Build the HTTP request for a call dispatch without sending it.
  pub fn build_call(&self, request: &CallRequest) -> Result<Request, GatewayError> {
    Url::parse(&request.callback_url).map_err(|e| GatewayError::InvalidUrl {
      url: request.callback_url.clone(),
      message: e.to_string(),
    })?;
    let method = Method::from_bytes(request.method.to_uppercase().as_bytes()).map_err(|_| {
      GatewayError::InvalidMethod {
        method: request.method.clone(),
      }
    })?;

    let mut builder = self
      .client
      .post(self.publish_url(&request.url)?)
      .bearer_auth(&self.config.token)
      .header(headers::METHOD, method.as_str())
      .header(headers::CALLBACK, &request.callback_url)
      .body(request.body.clone());

    if let Some(retries) = request.retries {
      builder = builder.header(headers::RETRIES, retries.to_string());
    }
    for (name, value) in &request.headers {
      builder = builder.header(format!("{}{}", headers::FORWARD_PREFIX, name), value);
    }
    for (name, value) in &request.callback_headers {
      builder = builder.header(format!("{}{}", headers::CALLBACK_FORWARD_PREFIX, name), value);
    }

    Ok(builder.build()?)
  }

  async fn send(&self, request: Request) -> Result<MessageId, GatewayError> {
    let response = self.client.execute(request).await?;
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
      let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.error)
        .unwrap_or(body);
      warn!(status = status.as_u16(), error = %message, "queue rejected message");
      return Err(GatewayError::Rejected {
        status: status.as_u16(),
        message,
      });
    }

    let parsed: PublishResponse =
      serde_json::from_str(&body).map_err(|e| GatewayError::InvalidResponse {
        message: format!("{}: {}", e, body),
      })?;
    debug!(message_id = %parsed.message_id, "queue accepted message");
    Ok(MessageId(parsed.message_id))
  }
}

#[async_trait]
impl QueueGateway for QstashGateway {
  #[instrument(name = "queue_publish", skip(self, request), fields(destination = %request.destination))]
  async fn publish(&self, request: PublishRequest) -> Result<MessageId, GatewayError> {
    let http_request = self.build_publish(&request)?;
    self.send(http_request).await
  }

  #[instrument(name = "queue_call", skip(self, request), fields(url = %request.url))]
  async fn schedule_call(&self, request: CallRequest) -> Result<MessageId, GatewayError> {
    let http_request = self.build_call(&request)?;
    self.send(http_request).await
  }
}

/// The queue schedules in whole seconds; round up so delivery is never early.
fn delay_seconds(delay: Duration) -> u64 {
  delay
    .as_secs()
    .saturating_add(u64::from(delay.subsec_nanos() > 0))
}

fn not_before_seconds(at: DateTime<Utc>) -> i64 {
  at.timestamp()
    .saturating_add(i64::from(at.timestamp_subsec_nanos() > 0))
}

//! The HTTP boundary of a workflow endpoint.

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde_json::json;

use crate::error::WorkflowError;

/// An incoming delivery, independent of the web framework serving it.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRequest {
  /// Absolute URL the request was delivered to.
  pub url: String,
  pub headers: HeaderMap,
  pub body: Bytes,
}

impl WorkflowRequest {
  pub fn new(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
    Self {
      url: url.into(),
      headers: HeaderMap::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, WorkflowError> {
    let header_name =
      HeaderName::from_bytes(name.as_bytes()).map_err(|e| WorkflowError::InvalidRequest {
        message: format!("invalid header name '{}': {}", name, e),
      })?;
    let header_value = HeaderValue::from_str(value).map_err(|e| WorkflowError::InvalidRequest {
      message: format!("invalid value for header '{}': {}", name, e),
    })?;
    self.headers.insert(header_name, header_value);
    Ok(self)
  }

  /// Header value as text; case-insensitive.
  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(name).and_then(|v| v.to_str().ok())
  }
}

/// What the endpoint answers with.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowResponse {
  pub status: StatusCode,
  pub body: Bytes,
}

impl WorkflowResponse {
  pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
    Self {
      status,
      body: Bytes::from(value.to_string()),
    }
  }

  pub fn error(error: &WorkflowError) -> Self {
    Self::json(error.status(), &json!({ "error": error.to_string() }))
  }

  pub fn body_json(&self) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::from_slice(&self.body)
  }
}

/// Converts between a web framework's request and response types and the
/// runner's.
pub trait FrameworkAdapter {
  type Request;
  type Response;

  fn parse(&self, request: Self::Request) -> Result<WorkflowRequest, WorkflowError>;

  fn build(&self, response: WorkflowResponse) -> Self::Response;
}

/// Adapter for the `http` crate's types, shared by hyper, axum and friends.
#[derive(Debug, Clone, Default)]
pub struct HttpAdapter {
  public_url: Option<String>,
}

impl HttpAdapter {
  pub fn new() -> Self {
    Self::default()
  }

  /// Report `url` as the request URL instead of reconstructing it from the
  /// request, e.g. behind a proxy that rewrites paths.
  pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
    self.public_url = Some(url.into());
    self
  }
}

impl FrameworkAdapter for HttpAdapter {
  type Request = http::Request<Bytes>;
  type Response = http::Response<Bytes>;

  fn parse(&self, request: Self::Request) -> Result<WorkflowRequest, WorkflowError> {
    let (parts, body) = request.into_parts();
    let url = match &self.public_url {
      Some(url) => url.clone(),
      None => request_url(&parts)?,
    };
    Ok(WorkflowRequest {
      url,
      headers: parts.headers,
      body,
    })
  }

  fn build(&self, response: WorkflowResponse) -> Self::Response {
    let mut built = http::Response::new(response.body);
    *built.status_mut() = response.status;
    built
      .headers_mut()
      .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    built
  }
}

fn request_url(parts: &http::request::Parts) -> Result<String, WorkflowError> {
  if parts.uri.scheme().is_some() {
    return Ok(parts.uri.to_string());
  }

  let host = parts
    .headers
    .get(HOST)
    .and_then(|v| v.to_str().ok())
    .ok_or_else(|| WorkflowError::InvalidRequest {
      message: "request has neither an absolute URI nor a Host header".to_string(),
    })?;
  let scheme = parts
    .headers
    .get("x-forwarded-proto")
    .and_then(|v| v.to_str().ok())
    .unwrap_or("https");
  let path = parts.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
  Ok(format!("{}://{}{}", scheme, host, path))
}

//! Runner settings.

use std::str::FromStr;

use stepwise_gateway::ConfigError;

/// What to do when the workflow asks for a step the log recorded differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DivergencePolicy {
  /// Drop the log from the first mismatch on and run from there.
  #[default]
  BestEffort,
  /// Refuse to continue; the invocation answers `500`.
  Strict,
}

impl FromStr for DivergencePolicy {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "best-effort" | "besteffort" | "best_effort" => Ok(DivergencePolicy::BestEffort),
      "strict" => Ok(DivergencePolicy::Strict),
      other => Err(ConfigError::Invalid {
        name: "WORKFLOW_DIVERGENCE".to_string(),
        message: format!("unknown divergence policy '{}'", other),
      }),
    }
  }
}

/// Settings of a [`WorkflowRunner`](crate::WorkflowRunner).
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
  /// Public URL of the workflow endpoint. Continuations and call callbacks
  /// are addressed here. When unset, the URL of the incoming request is used.
  pub workflow_url: Option<String>,
  pub divergence: DivergencePolicy,
  /// Delivery retries requested for every message. `None` keeps the queue's
  /// default.
  pub retries: Option<u32>,
  /// Also require the token subject to match the request URL.
  pub verify_source_url: bool,
}

impl RunnerConfig {
  pub fn with_workflow_url(mut self, url: impl Into<String>) -> Self {
    self.workflow_url = Some(url.into());
    self
  }

  pub fn with_divergence(mut self, divergence: DivergencePolicy) -> Self {
    self.divergence = divergence;
    self
  }

  pub fn with_retries(mut self, retries: u32) -> Self {
    self.retries = Some(retries);
    self
  }

  /// Read `WORKFLOW_URL`, `WORKFLOW_RETRIES`, `WORKFLOW_DIVERGENCE` and
  /// `WORKFLOW_VERIFY_SOURCE_URL`. Unset variables keep their defaults.
  pub fn from_env() -> Result<Self, ConfigError> {
    let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

    let retries = read("WORKFLOW_RETRIES")
      .map(|raw| {
        raw.trim().parse::<u32>().map_err(|e| ConfigError::Invalid {
          name: "WORKFLOW_RETRIES".to_string(),
          message: e.to_string(),
        })
      })
      .transpose()?;
    let divergence = match read("WORKFLOW_DIVERGENCE") {
      Some(raw) => raw.parse()?,
      None => DivergencePolicy::default(),
    };
    let verify_source_url = read("WORKFLOW_VERIFY_SOURCE_URL")
      .is_some_and(|raw| matches!(raw.trim(), "1" | "true" | "yes"));

    Ok(RunnerConfig {
      workflow_url: read("WORKFLOW_URL"),
      divergence,
      retries,
      verify_source_url,
    })
  }
}

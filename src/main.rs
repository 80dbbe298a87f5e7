use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use stepwise_engine::headers::WORKFLOW_RUN_ID;
use stepwise_gateway::{Delivery, PublishRequest, QstashConfig, QstashGateway, QueueGateway};
use stepwise_log::{decode_call_state, decode_payload};
use stepwise_signature::{SignatureVerifier, SigningKeys, sign};

/// Stepwise - durable workflows driven through a message queue
#[derive(Parser)]
#[command(name = "stepwise")]
#[command(version, about, long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Print an invocation payload (or call state) in readable form
  Decode {
    /// File holding the payload; stdin when omitted
    file: Option<PathBuf>,

    /// Treat the input as a `Workflow-Call-State` header value
    #[arg(long)]
    call_state: bool,
  },

  /// Check a delivery signature against the configured signing keys
  Verify {
    /// The `Upstash-Signature` header value
    #[arg(long)]
    signature: String,

    /// Also require the token to be issued for this URL
    #[arg(long)]
    url: Option<String>,

    /// Allowed clock skew in seconds
    #[arg(long, default_value_t = 0)]
    tolerance: u64,

    /// File holding the request body; stdin when omitted
    file: Option<PathBuf>,
  },

  /// Sign a body the way the queue does, for local deliveries
  Sign {
    /// URL the delivery is addressed to
    #[arg(long)]
    url: String,

    /// Token lifetime in seconds
    #[arg(long, default_value_t = 300)]
    ttl: u64,

    /// Sign with the next key instead of the current one
    #[arg(long)]
    next: bool,

    /// File holding the request body; stdin when omitted
    file: Option<PathBuf>,
  },

  /// Start a workflow run by publishing a trigger body to its URL
  Trigger {
    /// Public URL of the workflow endpoint
    workflow_url: String,

    /// Run id to use instead of a generated one
    #[arg(long)]
    run_id: Option<String>,

    /// Delay the first delivery by this many seconds
    #[arg(long)]
    delay: Option<u64>,

    /// Delivery retries
    #[arg(long)]
    retries: Option<u32>,

    /// File holding the trigger body; stdin when omitted
    file: Option<PathBuf>,
  },
}

fn main() -> Result<()> {
  // a missing .env file is fine
  let _ = dotenvy::dotenv();
  let cli = Cli::parse();

  match cli.command {
    Some(Commands::Decode { file, call_state }) => decode(file, call_state),
    Some(Commands::Verify {
      signature,
      url,
      tolerance,
      file,
    }) => verify(signature, url, tolerance, file),
    Some(Commands::Sign {
      url,
      ttl,
      next,
      file,
    }) => sign_body(url, ttl, next, file),
    Some(Commands::Trigger {
      workflow_url,
      run_id,
      delay,
      retries,
      file,
    }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(async { trigger(workflow_url, run_id, delay, retries, file).await })
    }
    None => {
      println!("stepwise - use --help to see available commands");
      Ok(())
    }
  }
}

fn decode(file: Option<PathBuf>, call_state: bool) -> Result<()> {
  let input = read_body(file)?;

  let (payload, pending_call) = if call_state {
    let text = String::from_utf8(input).context("call state is not text")?;
    let state = decode_call_state(&text).context("failed to decode call state")?;
    let pending_call = json!({ "stepId": state.step_id, "stepName": state.step_name });
    (state.payload, Some(pending_call))
  } else {
    let payload = decode_payload(&input).context("failed to decode invocation payload")?;
    (payload, None)
  };

  let trigger = serde_json::from_slice::<serde_json::Value>(&payload.raw_trigger_body)
    .unwrap_or_else(|_| {
      serde_json::Value::String(String::from_utf8_lossy(&payload.raw_trigger_body).into_owned())
    });

  eprintln!("Run: {}", payload.workflow_run_id);
  eprintln!("Recorded steps: {}", payload.steps.len());

  let mut output = json!({
    "workflowRunId": payload.workflow_run_id,
    "trigger": trigger,
    "steps": payload.steps,
  });
  if let Some(pending_call) = pending_call {
    output["pendingCall"] = pending_call;
  }
  println!("{}", serde_json::to_string_pretty(&output)?);

  Ok(())
}

fn verify(signature: String, url: Option<String>, tolerance: u64, file: Option<PathBuf>) -> Result<()> {
  let keys = SigningKeys::from_env().context("signing keys are not configured")?;
  let body = read_body(file)?;

  let claims = SignatureVerifier::new(keys)
    .with_clock_tolerance(Duration::from_secs(tolerance))
    .check(signature.trim(), &body, url.as_deref())
    .context("signature rejected")?;

  eprintln!("Signature valid");
  println!("{}", serde_json::to_string_pretty(&claims)?);

  Ok(())
}

fn sign_body(url: String, ttl: u64, next: bool, file: Option<PathBuf>) -> Result<()> {
  let keys = SigningKeys::from_env().context("signing keys are not configured")?;
  let body = read_body(file)?;
  let key = if next { &keys.next } else { &keys.current };

  let token = sign(key, &body, &url, Duration::from_secs(ttl)).context("failed to sign body")?;
  println!("{}", token);

  Ok(())
}

async fn trigger(
  workflow_url: String,
  run_id: Option<String>,
  delay: Option<u64>,
  retries: Option<u32>,
  file: Option<PathBuf>,
) -> Result<()> {
  let config = QstashConfig::from_env().context("queue is not configured")?;
  let gateway = QstashGateway::new(config);
  let body = read_body(file)?;

  let mut request = PublishRequest::new(&workflow_url, body)
    .content_type("application/json")
    .retries(retries);
  if let Some(run_id) = run_id {
    request = request.forward_header(WORKFLOW_RUN_ID, run_id);
  }
  if let Some(seconds) = delay {
    request = request.delivery(Delivery::Delay(Duration::from_secs(seconds)));
  }

  let message_id = gateway
    .publish(request)
    .await
    .with_context(|| format!("failed to trigger workflow at {}", workflow_url))?;

  eprintln!("Triggered workflow: {}", workflow_url);
  println!("{}", message_id);

  Ok(())
}

fn read_body(file: Option<PathBuf>) -> Result<Vec<u8>> {
  use std::io::IsTerminal;

  match file {
    Some(path) => {
      std::fs::read(&path).with_context(|| format!("failed to read file: {}", path.display()))
    }
    None if io::stdin().is_terminal() => Ok(Vec::new()),
    None => {
      let mut input = Vec::new();
      io::stdin()
        .read_to_end(&mut input)
        .context("failed to read body from stdin")?;
      Ok(input)
    }
  }
}

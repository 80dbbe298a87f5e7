use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use http::StatusCode;
use serde_json::json;
use stepwise_engine::headers::{
  SIGNATURE, WORKFLOW_CALL_STATE, WORKFLOW_CALLBACK, WORKFLOW_INIT, WORKFLOW_RUN_ID,
  WORKFLOW_STEP_ID,
};
use stepwise_engine::{
  CallRequest, CallSpec, ChannelNotifier, Delivery, DivergencePolicy, ExecutionEvent,
  FixedClock, HttpAdapter, InvocationOutcome, PublishRequest, RecordingGateway, RunnerConfig,
  SignatureVerifier, SigningKeys, StepError, StepId, StepKind, StepLog, StepOutcome, StepRecord,
  WorkflowContext, WorkflowError, WorkflowRequest, WorkflowRunner,
};
use stepwise_log::{WorkflowInvocationPayload, decode_payload, encode_payload};
use tokio::sync::mpsc;

const URL: &str = "https://example.com/api/workflow";

fn config() -> RunnerConfig {
  RunnerConfig::default().with_workflow_url(URL)
}

fn runner() -> WorkflowRunner<RecordingGateway> {
  WorkflowRunner::new(config(), RecordingGateway::new())
}

fn start() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
}

fn first(body: &str) -> WorkflowRequest {
  WorkflowRequest::new(URL, body.to_string())
}

/// The delivery the queue makes for a published continuation.
fn deliver(message: &PublishRequest) -> WorkflowRequest {
  let mut request = WorkflowRequest::new(message.destination.clone(), message.body.clone());
  for (name, value) in &message.forward_headers {
    request = request.with_header(name, value).unwrap();
  }
  request
}

/// The delivery the queue makes once a dispatched call got its response.
fn deliver_response(call: &CallRequest, status: u16, body_base64: &str) -> WorkflowRequest {
  let envelope = json!({
    "status": status,
    "header": { "Content-Type": ["text/plain"] },
    "body": body_base64,
    "sourceMessageId": "msg-call",
  });
  let mut request = WorkflowRequest::new(call.callback_url.clone(), envelope.to_string());
  for (name, value) in &call.callback_headers {
    request = request.with_header(name, value).unwrap();
  }
  request
}

fn continuation(records: Vec<StepRecord>) -> WorkflowRequest {
  let payload = WorkflowInvocationPayload {
    workflow_run_id: "wfr_manual".to_string(),
    raw_trigger_body: b"{}".to_vec(),
    steps: StepLog::from_records(records).unwrap(),
  };
  WorkflowRequest::new(URL, encode_payload(&payload).unwrap())
    .with_header(WORKFLOW_INIT, "false")
    .unwrap()
}

fn steps_of(message: &PublishRequest) -> Vec<StepRecord> {
  decode_payload(&message.body).unwrap().steps.iter().cloned().collect()
}

fn id(value: u32) -> StepId {
  StepId::new(value).unwrap()
}

async fn two_steps(ctx: WorkflowContext, executions: Arc<AtomicU32>) -> Result<u32, StepError> {
  let executions = &executions;
  let a = ctx
    .run("a", || async move {
      executions.fetch_add(1, Ordering::SeqCst);
      Ok::<u32, String>(1)
    })
    .await?;
  let b = ctx.run("b", || async move { Ok::<u32, String>(a + 1) }).await?;
  Ok(a + b)
}

#[tokio::test]
async fn test_each_invocation_does_one_unit_of_work() {
  let runner = runner();
  let executions = Arc::new(AtomicU32::new(0));

  // first delivery runs `a` and suspends
  let response = runner
    .handle(first("{}"), |ctx| two_steps(ctx, executions.clone()))
    .await;
  assert_eq!(response.status, StatusCode::OK);
  let body = response.body_json().unwrap();
  assert_eq!(body["messageId"], "msg-1");
  let run_id = body["workflowRunId"].as_str().unwrap().to_string();
  assert!(run_id.starts_with("wfr_"));

  let published = runner.gateway().published();
  assert_eq!(published.len(), 1);
  assert_eq!(published[0].destination, URL);
  assert_eq!(published[0].forward_headers[WORKFLOW_INIT], "false");
  assert_eq!(published[0].forward_headers[WORKFLOW_RUN_ID], run_id);
  assert_eq!(published[0].delivery, Delivery::Immediate);
  assert_eq!(
    steps_of(&published[0]),
    vec![StepRecord::new(id(1), "a", StepOutcome::Ok { value: json!(1) })]
  );

  // second delivery replays `a` and runs `b`
  let response = runner
    .handle(deliver(&published[0]), |ctx| two_steps(ctx, executions.clone()))
    .await;
  assert_eq!(response.status, StatusCode::OK);
  let published = runner.gateway().published();
  assert_eq!(published.len(), 2);
  let steps = steps_of(&published[1]);
  assert_eq!(steps.len(), 2);
  assert_eq!(steps[1], StepRecord::new(id(2), "b", StepOutcome::Ok { value: json!(2) }));

  // third delivery replays both and completes
  let response = runner
    .handle(deliver(&published[1]), |ctx| two_steps(ctx, executions.clone()))
    .await;
  assert_eq!(response.status, StatusCode::OK);
  assert_eq!(response.body_json().unwrap(), json!(3));
  assert_eq!(runner.gateway().published().len(), 2);

  assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_redelivery_is_idempotent() {
  let runner = runner();
  let executions = Arc::new(AtomicU32::new(0));

  runner
    .handle(first("{}"), |ctx| two_steps(ctx, executions.clone()))
    .await;
  let continuation = runner.gateway().published()[0].clone();

  for _ in 0..2 {
    let response = runner
      .handle(deliver(&continuation), |ctx| two_steps(ctx, executions.clone()))
      .await;
    assert_eq!(response.status, StatusCode::OK);
  }

  let published = runner.gateway().published();
  assert_eq!(published.len(), 3);
  assert_eq!(published[1].body, published[2].body);
  assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_supplied_run_id_is_kept() {
  let runner = runner();
  let executions = Arc::new(AtomicU32::new(0));
  let request = first("{}").with_header(WORKFLOW_RUN_ID, "wfr_order_42").unwrap();

  let outcome = runner
    .invoke(&request, |ctx| two_steps(ctx, executions.clone()))
    .await
    .unwrap();
  assert_eq!(outcome.workflow_run_id(), "wfr_order_42");
  let published = runner.gateway().published();
  assert_eq!(decode_payload(&published[0].body).unwrap().workflow_run_id, "wfr_order_42");
}

#[tokio::test]
async fn test_parallel_runs_commit_together() {
  let runner = runner();
  let workflow = |ctx: WorkflowContext| async move {
    let (x, y) = futures::join!(
      ctx.run("x", || async { Ok::<u32, String>(10) }),
      ctx.run("y", || async { Ok::<u32, String>(20) }),
    );
    Ok::<u32, StepError>(x? + y?)
  };

  let response = runner.handle(first("{}"), workflow).await;
  assert_eq!(response.status, StatusCode::OK);
  let published = runner.gateway().published();
  assert_eq!(published.len(), 1);
  assert_eq!(
    steps_of(&published[0]),
    vec![
      StepRecord::new(id(1), "x", StepOutcome::Ok { value: json!(10) }),
      StepRecord::new(id(2), "y", StepOutcome::Ok { value: json!(20) }),
    ]
  );

  let response = runner.handle(deliver(&published[0]), workflow).await;
  assert_eq!(response.body_json().unwrap(), json!(30));
  assert_eq!(runner.gateway().published().len(), 1);
}

#[tokio::test]
async fn test_late_sibling_waits_for_the_next_invocation() {
  let runner = runner();
  let workflow = |ctx: WorkflowContext| async move {
    let (a, b) = futures::join!(
      ctx.run("a", || async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<u32, String>(1)
      }),
      async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.run("b", || async { Ok::<u32, String>(2) }).await
      },
    );
    Ok::<u32, StepError>(a? + b?)
  };

  let response = runner.handle(first("{}"), workflow).await;
  assert_eq!(response.status, StatusCode::OK);
  let published = runner.gateway().published();
  assert_eq!(
    steps_of(&published[0]),
    vec![StepRecord::new(id(1), "a", StepOutcome::Ok { value: json!(1) })]
  );

  runner.handle(deliver(&published[0]), workflow).await;
  let published = runner.gateway().published();
  assert_eq!(published.len(), 2);
  let steps = steps_of(&published[1]);
  assert_eq!(steps[1], StepRecord::new(id(2), "b", StepOutcome::Ok { value: json!(2) }));

  let response = runner.handle(deliver(&published[1]), workflow).await;
  assert_eq!(response.body_json().unwrap(), json!(3));
}

#[tokio::test]
async fn test_runs_go_before_sleeps_in_a_parallel_group() {
  let clock = Arc::new(FixedClock::new(start()));
  let runner = runner().with_clock(clock.clone());
  let workflow = |ctx: WorkflowContext| async move {
    let ((), work) = futures::join!(
      ctx.sleep("nap", Duration::from_secs(60)),
      ctx.run("work", || async { Ok::<String, String>("done".to_string()) }),
    );
    work
  };

  runner.handle(first("{}"), workflow).await;
  let published = runner.gateway().published();
  let steps = steps_of(&published[0]);
  assert_eq!(steps.len(), 1);
  assert_eq!(steps[0].step_id, id(2));
  assert_eq!(steps[0].kind(), StepKind::Run);

  runner.handle(deliver(&published[0]), workflow).await;
  let published = runner.gateway().published();
  let steps = steps_of(&published[1]);
  assert_eq!(steps.len(), 2);
  assert_eq!(steps[0].step_id, id(1));
  assert_eq!(steps[0].kind(), StepKind::Sleep);
  assert_eq!(published[1].delivery, Delivery::Delay(Duration::from_secs(60)));
}

#[tokio::test]
async fn test_sleep_until_waits_for_the_instant() {
  let clock = Arc::new(FixedClock::new(start()));
  let runner = runner().with_clock(clock.clone());
  let wake_at = start() + TimeDelta::hours(1);
  let workflow = |ctx: WorkflowContext| async move {
    ctx.sleep_until("until-noon", wake_at).await;
    ctx.run("after", || async { Ok::<u32, String>(1) }).await
  };

  runner.handle(first("{}"), workflow).await;
  let published = runner.gateway().published();
  assert_eq!(published[0].delivery, Delivery::NotBefore(wake_at));
  assert_eq!(
    steps_of(&published[0]),
    vec![StepRecord::new(id(1), "until-noon", StepOutcome::Sleep { wake_at })]
  );

  // delivered early: suspend again without new records
  runner.handle(deliver(&published[0]), workflow).await;
  let published = runner.gateway().published();
  assert_eq!(published.len(), 2);
  assert_eq!(published[1].delivery, Delivery::NotBefore(wake_at));
  assert_eq!(published[1].body, published[0].body);

  clock.advance(Duration::from_secs(3600));
  runner.handle(deliver(&published[1]), workflow).await;
  let published = runner.gateway().published();
  assert_eq!(published.len(), 3);
  let steps = steps_of(&published[2]);
  assert_eq!(steps.len(), 2);
  assert_eq!(steps[1].step_name, "after");
}

#[tokio::test]
async fn test_call_round_trip() {
  let runner = runner();
  let workflow = |ctx: WorkflowContext| async move {
    let spec = CallSpec::new("https://api.example.com/charge")
      .method("POST")
      .json(&json!({ "amount": 5 }))
      .expect("serializable body");
    let response = ctx.call("charge", spec).await;
    let status = response.status;
    let text = response.text().map(str::to_string).map_err(|e| e.to_string());
    ctx
      .run("record", || async move { Ok::<String, String>(format!("{}:{}", status, text?)) })
      .await
      .map_err(|e| e.to_string())
  };

  let response = runner.handle(first("{}"), workflow).await;
  assert_eq!(response.status, StatusCode::OK);
  assert!(runner.gateway().published().is_empty());
  let calls = runner.gateway().calls();
  assert_eq!(calls.len(), 1);
  let call = &calls[0];
  assert_eq!(call.url, "https://api.example.com/charge");
  assert_eq!(call.method, "POST");
  assert_eq!(call.body, br#"{"amount":5}"#.to_vec());
  assert_eq!(call.callback_url, URL);
  assert_eq!(call.callback_headers[WORKFLOW_CALLBACK], "true");
  assert_eq!(call.callback_headers[WORKFLOW_STEP_ID], "1");
  assert!(call.callback_headers.contains_key(WORKFLOW_CALL_STATE));

  // "charged"
  let delivery = deliver_response(call, 201, "Y2hhcmdlZA==");
  for _ in 0..2 {
    let response = runner.handle(delivery.clone(), workflow).await;
    assert_eq!(response.status, StatusCode::OK);
  }

  let published = runner.gateway().published();
  assert_eq!(published.len(), 2);
  assert_eq!(published[0].body, published[1].body);
  let steps = steps_of(&published[0]);
  let recorded = steps[0].outcome.call_response().unwrap();
  assert_eq!(recorded.status, 201);
  assert_eq!(recorded.body, b"charged");
  assert_eq!(steps[1].outcome, StepOutcome::Ok { value: json!("201:charged") });

  let response = runner.handle(deliver(&published[0]), workflow).await;
  assert_eq!(response.body_json().unwrap(), json!("201:charged"));
}

#[tokio::test]
async fn test_failed_call_is_delivered_to_the_workflow() {
  let runner = runner();
  let workflow = |ctx: WorkflowContext| async move {
    let response = ctx.call("inventory", CallSpec::new("https://api.example.com/stock")).await;
    if response.is_success() {
      return Ok::<String, StepError>("reserved".to_string());
    }
    let status = response.status;
    ctx
      .run("fallback", || async move { Ok::<String, String>(format!("backordered after {}", status)) })
      .await
  };

  runner.handle(first("{}"), workflow).await;
  let call = runner.gateway().calls()[0].clone();

  // "unavailable"
  let response = runner
    .handle(deliver_response(&call, 503, "dW5hdmFpbGFibGU="), workflow)
    .await;
  assert_eq!(response.status, StatusCode::OK);

  let published = runner.gateway().published();
  assert_eq!(published.len(), 1);
  let steps = steps_of(&published[0]);
  let recorded = steps[0].outcome.call_response().unwrap();
  assert_eq!(recorded.status, 503);
  assert_eq!(recorded.body, b"unavailable");
  assert_eq!(
    steps[1].outcome,
    StepOutcome::Ok { value: json!("backordered after 503") }
  );

  let response = runner.handle(deliver(&published[0]), workflow).await;
  assert_eq!(response.body_json().unwrap(), json!("backordered after 503"));
}

#[tokio::test]
async fn test_binary_call_body_is_recorded_exactly() {
  let runner = runner();
  let workflow = |ctx: WorkflowContext| async move {
    let response = ctx.call("logo", CallSpec::new("https://cdn.example.com/logo.png")).await;
    Ok::<Vec<u8>, String>(response.body)
  };

  runner.handle(first("{}"), workflow).await;
  let call = runner.gateway().calls()[0].clone();
  let response = runner
    .handle(deliver_response(&call, 200, "iVBOR//+"), workflow)
    .await;

  assert_eq!(response.status, StatusCode::OK);
  assert_eq!(response.body_json().unwrap(), json!([137, 80, 78, 71, 255, 254]));
  assert!(runner.gateway().published().is_empty());
}

#[tokio::test]
async fn test_mismatched_call_response_is_rejected() {
  let runner = runner();
  let workflow = |ctx: WorkflowContext| async move {
    let response = ctx.call("ping", CallSpec::new("https://api.example.com/ping")).await;
    Ok::<u16, String>(response.status)
  };

  runner.handle(first("{}"), workflow).await;
  let call = runner.gateway().calls()[0].clone();
  let request = deliver_response(&call, 200, "")
    .with_header(WORKFLOW_STEP_ID, "7")
    .unwrap();
  let response = runner.handle(request, workflow).await;
  assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_failed_step_is_recorded_and_replayed() {
  let runner = runner();
  let executions = Arc::new(AtomicU32::new(0));
  let workflow = |ctx: WorkflowContext| {
    let executions = executions.clone();
    async move {
      let charged = ctx
        .run("charge", || async move {
          executions.fetch_add(1, Ordering::SeqCst);
          Err::<u32, String>("card declined".to_string())
        })
        .await;
      match charged {
        Err(StepError::Failed { message, .. }) => Ok(format!("refused: {}", message)),
        Err(e) => Err(e),
        Ok(_) => Ok("charged".to_string()),
      }
    }
  };

  runner.handle(first("{}"), workflow).await;
  let published = runner.gateway().published();
  assert_eq!(
    steps_of(&published[0])[0].outcome,
    StepOutcome::Failed {
      error: "card declined".to_string()
    }
  );

  let response = runner.handle(deliver(&published[0]), workflow).await;
  assert_eq!(response.body_json().unwrap(), json!("refused: card declined"));
  assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_workflow_error_is_a_server_error() {
  let runner = runner();
  let response = runner
    .handle(first("{}"), |_ctx| async { Err::<(), String>("boom".to_string()) })
    .await;
  assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
  assert_eq!(response.body_json().unwrap()["error"], "workflow failed: boom");
}

#[tokio::test]
async fn test_nested_step_is_rejected() {
  let runner = runner();
  let workflow = |ctx: WorkflowContext| async move {
    let inner = ctx.clone();
    ctx
      .run("outer", || async move {
        inner
          .run("inner", || async { Ok::<u32, String>(1) })
          .await
          .map_err(|e| e.to_string())
      })
      .await
  };

  let result = runner.invoke(&first("{}"), workflow).await;
  assert!(matches!(
    result,
    Err(WorkflowError::NestedStep { ref step_name, .. }) if step_name == "inner"
  ));
  assert!(runner.gateway().messages().is_empty());
}

#[tokio::test]
async fn test_publish_failure_allows_redelivery() {
  let runner = runner();
  let executions = Arc::new(AtomicU32::new(0));

  runner.gateway().fail_next();
  let response = runner
    .handle(first("{}"), |ctx| two_steps(ctx, executions.clone()))
    .await;
  assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
  assert!(runner.gateway().published().is_empty());

  let response = runner
    .handle(first("{}"), |ctx| two_steps(ctx, executions.clone()))
    .await;
  assert_eq!(response.status, StatusCode::OK);
  assert_eq!(runner.gateway().published().len(), 1);
}

#[tokio::test]
async fn test_best_effort_divergence_reexecutes() {
  let (sender, mut receiver) = mpsc::unbounded_channel();
  let runner = WorkflowRunner::with_notifier(
    config(),
    RecordingGateway::new(),
    ChannelNotifier::new(sender),
  )
  .with_clock(Arc::new(FixedClock::new(start())));
  let workflow = |ctx: WorkflowContext| async move {
    ctx.sleep("a", Duration::from_secs(30)).await;
    Ok::<(), String>(())
  };

  let request = continuation(vec![
    StepRecord::new(id(1), "a", StepOutcome::Ok { value: json!(1) }),
    StepRecord::new(id(2), "b", StepOutcome::Ok { value: json!(2) }),
  ]);
  let response = runner.handle(request, workflow).await;
  assert_eq!(response.status, StatusCode::OK);

  let published = runner.gateway().published();
  let steps = steps_of(&published[0]);
  assert_eq!(steps.len(), 1);
  assert_eq!(steps[0].kind(), StepKind::Sleep);

  let mut events = Vec::new();
  while let Ok(event) = receiver.try_recv() {
    events.push(event);
  }
  assert!(events.iter().any(|e| matches!(
    e,
    ExecutionEvent::DivergenceDetected { step_id, .. } if *step_id == id(1)
  )));
  assert!(matches!(events.last(), Some(ExecutionEvent::Suspended { .. })));
}

#[tokio::test]
async fn test_strict_divergence_halts() {
  let config = config().with_divergence(DivergencePolicy::Strict);
  let runner = WorkflowRunner::new(config, RecordingGateway::new());
  let workflow = |ctx: WorkflowContext| async move {
    ctx.sleep("a", Duration::from_secs(30)).await;
    Ok::<(), String>(())
  };

  let request = continuation(vec![StepRecord::new(id(1), "a", StepOutcome::Ok { value: json!(1) })]);
  let result = runner.invoke(&request, workflow).await;
  assert!(matches!(result, Err(WorkflowError::Divergence { step_id, .. }) if step_id == id(1)));
  assert!(runner.gateway().messages().is_empty());
}

#[tokio::test]
async fn test_unreached_records_at_completion() {
  let records = vec![
    StepRecord::new(id(1), "a", StepOutcome::Ok { value: json!(1) }),
    StepRecord::new(id(2), "b", StepOutcome::Ok { value: json!(2) }),
  ];
  let workflow = |ctx: WorkflowContext| async move {
    ctx.run("a", || async { Ok::<u32, String>(1) }).await
  };

  let lenient = runner();
  let outcome = lenient
    .invoke(&continuation(records.clone()), workflow)
    .await
    .unwrap();
  assert!(matches!(outcome, InvocationOutcome::Completed { ref output, .. } if *output == json!(1)));

  let strict = WorkflowRunner::new(
    config().with_divergence(DivergencePolicy::Strict),
    RecordingGateway::new(),
  );
  let response = strict.handle(continuation(records), workflow).await;
  assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_signatures_are_checked_before_any_step() {
  let keys = SigningKeys::new("sig_current", "sig_next");
  let runner = runner().with_verifier(SignatureVerifier::new(keys));
  let executions = Arc::new(AtomicU32::new(0));
  let ttl = Duration::from_secs(300);

  let response = runner
    .handle(first("{}"), |ctx| two_steps(ctx, executions.clone()))
    .await;
  assert_eq!(response.status, StatusCode::UNAUTHORIZED);

  let forged = stepwise_signature::sign("sig_unknown", b"{}", URL, ttl).unwrap();
  let request = first("{}").with_header(SIGNATURE, &forged).unwrap();
  let response = runner
    .handle(request, |ctx| two_steps(ctx, executions.clone()))
    .await;
  assert_eq!(response.status, StatusCode::FORBIDDEN);
  assert_eq!(executions.load(Ordering::SeqCst), 0);
  assert!(runner.gateway().messages().is_empty());

  for key in ["sig_current", "sig_next"] {
    let token = stepwise_signature::sign(key, b"{}", URL, ttl).unwrap();
    let request = first("{}").with_header(SIGNATURE, &token).unwrap();
    let response = runner
      .handle(request, |ctx| two_steps(ctx, executions.clone()))
      .await;
    assert_eq!(response.status, StatusCode::OK);
  }
  assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_serve_through_http_adapter() {
  let runner = runner();
  let request = http::Request::builder()
    .method("POST")
    .uri("/api/workflow")
    .header("host", "example.com")
    .body(Bytes::from_static(br#"{"name":"ada"}"#))
    .unwrap();

  let response = runner
    .serve(&HttpAdapter::new(), request, |ctx: WorkflowContext| async move {
      let input: serde_json::Value = ctx.payload()?;
      let greeting = format!("hello {}", input["name"].as_str().unwrap_or("?"));
      ctx.run("greet", || async move { Ok::<String, String>(greeting) }).await
    })
    .await;

  assert_eq!(response.status(), StatusCode::OK);
  let published = runner.gateway().published();
  assert_eq!(
    steps_of(&published[0])[0].outcome,
    StepOutcome::Ok { value: json!("hello ada") }
  );
  assert_eq!(
    decode_payload(&published[0].body).unwrap().raw_trigger_body,
    br#"{"name":"ada"}"#.to_vec()
  );
}

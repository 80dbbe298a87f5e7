//! Stepwise workflow engine.
//!
//! A workflow is an ordinary async function over a [`WorkflowContext`]. It is
//! served behind a message queue: every delivery re-runs the function from
//! the top, answers already-recorded steps from the step log carried in the
//! message, performs one new unit of work and publishes the extended log back
//! to the queue. No state lives on the server between deliveries.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       WorkflowRunner                         │
//! │  - verifies the queue signature                              │
//! │  - decodes first / continuation / call-response deliveries   │
//! │  - drives the workflow future and suspends or completes      │
//! └──────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │               WorkflowContext + StepExecutor                 │
//! │  - run / sleep / sleep_until / call                          │
//! │  - step ids, replay lookup, divergence handling              │
//! └──────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        QueueGateway                          │
//! │  - publish continuations, dispatch calls                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod clock;
mod config;
mod context;
mod error;
mod events;
mod executor;
pub mod headers;
mod request;
mod runner;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{DivergencePolicy, RunnerConfig};
pub use context::{CallSpec, WorkflowContext};
pub use error::{StepError, WorkflowError};
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use executor::ExecutorState;
pub use request::{FrameworkAdapter, HttpAdapter, WorkflowRequest, WorkflowResponse};
pub use runner::{InvocationOutcome, WorkflowRunner};

pub use stepwise_gateway::{
  CallRequest, Delivery, GatewayError, MessageId, PublishRequest, QstashConfig, QstashGateway,
  QueueGateway, RecordedMessage, RecordingGateway,
};
pub use stepwise_log::{CallResponse, StepId, StepKind, StepLog, StepOutcome, StepRecord};
pub use stepwise_signature::{SignatureVerifier, SigningKeys};

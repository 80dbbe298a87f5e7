//! Step bookkeeping shared by the context and the runner.
//!
//! Every context operation asks the executor for the next step id and whether
//! the log already answers it. Steps the log cannot answer are parked here
//! until the runner decides what to do with them in this invocation.

use std::collections::{BTreeMap, BTreeSet};
use std::task::Waker;
use std::time::Duration;

use chrono::{DateTime, Utc};
use stepwise_gateway::Delivery;
use stepwise_log::{CodecError, StepId, StepKind, StepLog, StepOutcome, StepRecord};
use tracing::{debug, warn};

use crate::config::DivergencePolicy;
use crate::context::CallSpec;
use crate::error::WorkflowError;

/// Where an invocation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
  /// Every step so far was answered from the log.
  Replaying,
  /// A step was not in the log; new work is being done.
  Executing,
  /// The run was handed back to the queue.
  Suspended,
  /// The workflow function returned.
  Completed,
  Failed,
}

/// A step the log could not answer.
#[derive(Debug, Clone)]
pub(crate) enum PendingStep {
  Run,
  /// A new sleep. `delay` is set when it was asked for as a duration.
  Sleep {
    wake_at: DateTime<Utc>,
    delay: Option<Duration>,
  },
  /// A recorded sleep that is not due yet.
  Wait { wake_at: DateTime<Utc> },
  Call(CallSpec),
}

#[derive(Debug)]
struct Registration {
  step_name: String,
  step: PendingStep,
  waker: Waker,
}

/// Answer to a step asking for its outcome.
#[derive(Debug)]
pub(crate) enum Lookup {
  Replay(StepOutcome),
  Miss,
  /// The invocation cannot go on; the step must never resolve.
  Halted,
}

/// The unit of work chosen for an invocation.
#[derive(Debug)]
pub(crate) enum Plan {
  /// Let the parked `run` steps execute their bodies.
  ExecuteRuns(Vec<Waker>),
  /// Publish the run with `records` appended.
  Continue {
    records: Vec<StepRecord>,
    delivery: Delivery,
  },
  /// Hand a call to the queue.
  Call {
    step_id: StepId,
    step_name: String,
    spec: CallSpec,
  },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Divergence {
  pub step_id: StepId,
  pub message: String,
}

pub(crate) struct StepExecutor {
  log: StepLog,
  policy: DivergencePolicy,
  state: ExecutorState,
  next_id: StepId,
  consumed: BTreeSet<StepId>,
  pending: BTreeMap<StepId, Registration>,
  released: BTreeSet<StepId>,
  /// The released `run` whose body is being polled right now.
  in_body: Option<StepId>,
  produced: BTreeMap<StepId, StepRecord>,
  replayed: Vec<(StepId, String)>,
  divergences: Vec<Divergence>,
  halt: Option<WorkflowError>,
}

impl StepExecutor {
  pub(crate) fn new(log: StepLog, policy: DivergencePolicy) -> Self {
    Self {
      log,
      policy,
      state: ExecutorState::Replaying,
      next_id: StepId::FIRST,
      consumed: BTreeSet::new(),
      pending: BTreeMap::new(),
      released: BTreeSet::new(),
      in_body: None,
      produced: BTreeMap::new(),
      replayed: Vec::new(),
      divergences: Vec::new(),
      halt: None,
    }
  }

  pub(crate) fn state(&self) -> ExecutorState {
    self.state
  }

  pub(crate) fn log(&self) -> &StepLog {
    &self.log
  }

  /// Assign the next step id and look it up in the log.
  pub(crate) fn begin_step(&mut self, kind: StepKind, step_name: &str) -> (StepId, Lookup) {
    let step_id = self.next_id;
    self.next_id = step_id.next();

    if self.halt.is_some() {
      return (step_id, Lookup::Halted);
    }
    if let Some(parent) = self.in_body {
      warn!(step_id = %step_id, step_name, parent = %parent, "step started inside a running step");
      self.halt = Some(WorkflowError::NestedStep {
        step_id,
        step_name: step_name.to_string(),
      });
      return (step_id, Lookup::Halted);
    }

    let lookup = match self.log.get(step_id) {
      Some(record) if record.kind() == kind => {
        self.consumed.insert(step_id);
        self.replayed.push((step_id, record.step_name.clone()));
        Lookup::Replay(record.outcome.clone())
      }
      Some(record) => {
        let message = format!(
          "recorded as {} '{}' but the workflow asked for {} '{}'",
          record.kind(),
          record.step_name,
          kind,
          step_name
        );
        self.diverge(step_id, message)
      }
      None => {
        self.state = ExecutorState::Executing;
        Lookup::Miss
      }
    };
    (step_id, lookup)
  }

  fn diverge(&mut self, step_id: StepId, message: String) -> Lookup {
    warn!(step_id = %step_id, policy = ?self.policy, %message, "step log diverged");
    self.divergences.push(Divergence {
      step_id,
      message: message.clone(),
    });

    match self.policy {
      DivergencePolicy::Strict => {
        self.halt = Some(WorkflowError::Divergence { step_id, message });
        Lookup::Halted
      }
      DivergencePolicy::BestEffort => {
        let dropped = self.log.truncate_from(step_id);
        debug!(step_id = %step_id, dropped = dropped.len(), "dropped diverged records");
        self.state = ExecutorState::Executing;
        Lookup::Miss
      }
    }
  }

  pub(crate) fn is_released(&self, step_id: StepId) -> bool {
    self.released.contains(&step_id)
  }

  /// Mark the body of `step_id` as being polled. Returns the previous mark.
  pub(crate) fn enter_body(&mut self, step_id: StepId) -> Option<StepId> {
    self.in_body.replace(step_id)
  }

  pub(crate) fn leave_body(&mut self, previous: Option<StepId>) {
    self.in_body = previous;
  }

  /// Park a step until the runner picks it, or refresh its waker.
  pub(crate) fn park(&mut self, step_id: StepId, step_name: &str, step: PendingStep, waker: &Waker) {
    match self.pending.get_mut(&step_id) {
      Some(registration) => {
        if !registration.waker.will_wake(waker) {
          registration.waker = waker.clone();
        }
      }
      None => {
        self.pending.insert(
          step_id,
          Registration {
            step_name: step_name.to_string(),
            step,
            waker: waker.clone(),
          },
        );
      }
    }
  }

  pub(crate) fn has_pending(&self) -> bool {
    !self.pending.is_empty()
  }

  pub(crate) fn has_released(&self) -> bool {
    !self.released.is_empty()
  }

  pub(crate) fn take_halt(&mut self) -> Option<WorkflowError> {
    if self.halt.is_some() {
      self.state = ExecutorState::Failed;
    }
    self.halt.take()
  }

  /// Choose what this invocation does with the parked steps.
  ///
  /// `run` steps go first, all of them together. Otherwise every sleep is
  /// recorded in one continuation. Otherwise the lowest call is dispatched.
  pub(crate) fn plan(&mut self, now: DateTime<Utc>) -> Option<Plan> {
    let runs: Vec<StepId> = self
      .pending
      .iter()
      .filter(|(_, r)| matches!(r.step, PendingStep::Run))
      .map(|(id, _)| *id)
      .collect();
    if !runs.is_empty() {
      debug!(steps = runs.len(), "executing run steps");
      let wakers = runs
        .iter()
        .filter_map(|id| self.pending.remove(id))
        .map(|r| r.waker)
        .collect();
      self.released.extend(runs);
      return Some(Plan::ExecuteRuns(wakers));
    }

    let sleeps: Vec<(StepId, &Registration, DateTime<Utc>)> = self
      .pending
      .iter()
      .filter_map(|(id, r)| match r.step {
        PendingStep::Sleep { wake_at, .. } | PendingStep::Wait { wake_at } => Some((*id, r, wake_at)),
        _ => None,
      })
      .collect();
    if let Some(latest) = sleeps.iter().map(|(_, _, at)| *at).max() {
      let records = sleeps
        .iter()
        .filter(|(_, r, _)| matches!(r.step, PendingStep::Sleep { .. }))
        .map(|(id, r, at)| StepRecord::new(*id, r.step_name.clone(), StepOutcome::Sleep { wake_at: *at }))
        .collect();
      let delivery = match sleeps.as_slice() {
        _ if latest <= now => Delivery::Immediate,
        [
          (
            _,
            Registration {
              step: PendingStep::Sleep {
                delay: Some(delay), ..
              },
              ..
            },
            _,
          ),
        ] => Delivery::Delay(whole_seconds(*delay)),
        _ => Delivery::NotBefore(latest),
      };
      self.state = ExecutorState::Suspended;
      return Some(Plan::Continue { records, delivery });
    }

    let step_id = self
      .pending
      .iter()
      .find(|(_, r)| matches!(r.step, PendingStep::Call(_)))
      .map(|(id, _)| *id)?;
    let registration = self.pending.remove(&step_id)?;
    let PendingStep::Call(spec) = registration.step else {
      return None;
    };
    self.state = ExecutorState::Suspended;
    Some(Plan::Call {
      step_id,
      step_name: registration.step_name,
      spec,
    })
  }

  /// Commit the outcome of a released `run` body.
  pub(crate) fn complete_run(&mut self, step_id: StepId, step_name: &str, outcome: StepOutcome) {
    self
      .produced
      .insert(step_id, StepRecord::new(step_id, step_name, outcome));
  }

  pub(crate) fn runs_finished(&self) -> bool {
    self.has_released() && self.released.iter().all(|id| self.produced.contains_key(id))
  }

  /// Every committed `run` outcome, for one continuation.
  pub(crate) fn finish_runs(&mut self) -> Vec<StepRecord> {
    self.state = ExecutorState::Suspended;
    std::mem::take(&mut self.produced).into_values().collect()
  }

  /// The log with `records` appended.
  pub(crate) fn extended_log(&self, records: &[StepRecord]) -> Result<StepLog, CodecError> {
    let mut log = self.log.clone();
    for record in records {
      log.append(record.clone())?;
    }
    Ok(log)
  }

  /// Mark the run complete, checking that the workflow reached every record.
  pub(crate) fn complete(&mut self) -> Result<(), WorkflowError> {
    let unconsumed: Vec<StepId> = self
      .log
      .step_ids()
      .filter(|id| !self.consumed.contains(id))
      .collect();

    if let Some(&step_id) = unconsumed.first() {
      let message = format!(
        "{} recorded step(s) were never reached by the workflow",
        unconsumed.len()
      );
      warn!(step_id = %step_id, policy = ?self.policy, %message, "step log diverged");
      self.divergences.push(Divergence {
        step_id,
        message: message.clone(),
      });
      if self.policy == DivergencePolicy::Strict {
        self.state = ExecutorState::Failed;
        return Err(WorkflowError::Divergence { step_id, message });
      }
    }

    self.state = ExecutorState::Completed;
    Ok(())
  }

  pub(crate) fn fail(&mut self) {
    self.state = ExecutorState::Failed;
  }

  pub(crate) fn take_replayed(&mut self) -> Vec<(StepId, String)> {
    std::mem::take(&mut self.replayed)
  }

  pub(crate) fn take_divergences(&mut self) -> Vec<Divergence> {
    std::mem::take(&mut self.divergences)
  }
}

/// Round up to whole seconds, the queue's delay granularity.
fn whole_seconds(delay: Duration) -> Duration {
  let extra = u64::from(delay.subsec_nanos() > 0);
  Duration::from_secs(delay.as_secs().saturating_add(extra))
}

//! The ordered history of completed steps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::record::{StepId, StepRecord};

/// Completed steps of one workflow run, totally ordered by [`StepId`].
///
/// Records are append-only across invocations. On the wire the log is a JSON
/// array sorted by step id; decoding rejects id 0 and duplicate ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<StepRecord>", into = "Vec<StepRecord>")]
pub struct StepLog {
  records: BTreeMap<StepId, StepRecord>,
}

impl StepLog {
  pub fn new() -> Self {
    Self::default()
  }

  /// Build a log from records in any order.
  pub fn from_records(records: impl IntoIterator<Item = StepRecord>) -> Result<Self, CodecError> {
    let mut log = Self::new();
    for record in records {
      log.append(record)?;
    }
    Ok(log)
  }

  /// Append a record. A record never replaces an existing one.
  pub fn append(&mut self, record: StepRecord) -> Result<(), CodecError> {
    if record.step_id.get() == 0 {
      return Err(CodecError::ZeroStepId);
    }
    if self.records.contains_key(&record.step_id) {
      return Err(CodecError::DuplicateStep {
        step_id: record.step_id,
      });
    }
    self.records.insert(record.step_id, record);
    Ok(())
  }

  pub fn get(&self, step_id: StepId) -> Option<&StepRecord> {
    self.records.get(&step_id)
  }

  pub fn contains(&self, step_id: StepId) -> bool {
    self.records.contains_key(&step_id)
  }

  /// Remove every record at or after `step_id`, returning them in order.
  pub fn truncate_from(&mut self, step_id: StepId) -> Vec<StepRecord> {
    self.records.split_off(&step_id).into_values().collect()
  }

  pub fn last_step_id(&self) -> Option<StepId> {
    self.records.keys().next_back().copied()
  }

  /// Step ids present in the log, ascending.
  pub fn step_ids(&self) -> impl Iterator<Item = StepId> + '_ {
    self.records.keys().copied()
  }

  pub fn iter(&self) -> impl Iterator<Item = &StepRecord> {
    self.records.values()
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }
}

impl TryFrom<Vec<StepRecord>> for StepLog {
  type Error = CodecError;

  fn try_from(records: Vec<StepRecord>) -> Result<Self, Self::Error> {
    Self::from_records(records)
  }
}

impl From<StepLog> for Vec<StepRecord> {
  fn from(log: StepLog) -> Self {
    log.records.into_values().collect()
  }
}

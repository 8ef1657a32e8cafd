//! Step execution records: the append-only audit trail of a run

use crate::{RunId, StepId, StepType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Waiting,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One visit of one step
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub id: String,
    pub run_id: RunId,
    pub step_id: StepId,
    pub step_type: StepType,
    pub status: StepStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl StepExecutionRecord {
    pub fn started(run_id: RunId, step_id: StepId, step_type: StepType, input: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            step_id,
            step_type,
            status: StepStatus::Started,
            input,
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
        }
    }

    pub fn complete(&mut self, output: Value) {
        self.status = StepStatus::Completed;
        self.output = Some(output);
        self.finish();
    }

    pub fn wait(&mut self, output: Value) {
        self.status = StepStatus::Waiting;
        self.output = Some(output);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.finish();
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
    }
}

//! Scheduled jobs: durable, delayed resume instructions

use crate::{JobId, RunId, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Execute,
    Resume,
    WaitComplete,
    ApprovalTimeout,
    SlaCheck,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Resume => "resume",
            Self::WaitComplete => "wait_complete",
            Self::ApprovalTimeout => "approval_timeout",
            Self::SlaCheck => "sla_check",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "execute" => Some(Self::Execute),
            "resume" => Some(Self::Resume),
            "wait_complete" => Some(Self::WaitComplete),
            "approval_timeout" => Some(Self::ApprovalTimeout),
            "sla_check" => Some(Self::SlaCheck),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted job payload: `{type, instanceId, nodeId?, data?}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub instance_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JobPayload {
    pub fn new(job_type: JobType, instance_id: RunId) -> Self {
        Self {
            job_type,
            instance_id,
            node_id: None,
            data: None,
        }
    }

    pub fn with_step(mut self, step: StepId) -> Self {
        self.node_id = Some(step);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued; delayed until `not_before`
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A job owned by the scheduling queue
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: JobId,
    pub payload: JobPayload,
    pub not_before: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn new(id: JobId, payload: JobPayload, not_before: DateTime<Utc>) -> Self {
        Self {
            id,
            payload,
            not_before,
            status: JobStatus::Queued,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type
    }

    pub fn instance_id(&self) -> &RunId {
        &self.payload.instance_id
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.not_before <= now
    }
}

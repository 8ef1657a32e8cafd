//! Identifiers for definitions, runs, steps, rules and jobs

use serde::{Deserialize, Serialize};

/// Unique identifier for a registered run definition version
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunDefinitionId(pub String);

impl RunDefinitionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl std::fmt::Display for RunDefinitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a run instance
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a step, unique within one definition
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a business rule
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub String);

impl RuleId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic identifier of a scheduled job.
///
/// Built from (deployment, job type, run, step, enqueue time) so that a
/// caller retrying the same schedule request produces the same id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn deterministic(
        deployment: &str,
        job_type: crate::JobType,
        run_id: &RunId,
        step_id: Option<&StepId>,
        enqueued_at_ms: i64,
    ) -> Self {
        let step = step_id.map(|s| s.as_str()).unwrap_or("-");
        Self(format!(
            "{}:{}:{}:{}:{}",
            deployment,
            job_type.as_str(),
            run_id,
            step,
            enqueued_at_ms
        ))
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobType;

    #[test]
    fn test_job_id_is_deterministic() {
        let run = RunId::new("run-1");
        let step = StepId::new("wait");
        let a = JobId::deterministic("node-a", JobType::WaitComplete, &run, Some(&step), 1000);
        let b = JobId::deterministic("node-a", JobType::WaitComplete, &run, Some(&step), 1000);
        assert_eq!(a, b);
        assert_eq!(a.0, "node-a:wait_complete:run-1:wait:1000");
    }

    #[test]
    fn test_job_id_without_step() {
        let id = JobId::deterministic("d", JobType::SlaCheck, &RunId::new("r"), None, 5);
        assert_eq!(id.0, "d:sla_check:r:-:5");
    }

    #[test]
    fn test_short_id() {
        let id = RunId::new("0123456789abcdef");
        assert_eq!(id.short(), "01234567");
        assert_eq!(RunId::new("abc").short(), "abc");
    }
}

//! Run instances: executing occurrences of run definitions
//!
//! A RunInstance is the only entity mutated while a run executes. It holds
//! the run state, the context visible to steps, the visited path, and any
//! pending approval tally, so a suspended run can be resumed from storage
//! alone.

use crate::{ApprovalPolicy, RunDefinitionId, RunId, RunflowError, RunflowResult, Scope, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// ── Run State ────────────────────────────────────────────────────────

/// Lifecycle state of a run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Pending,
    Running,
    WaitingApproval,
    WaitingCondition,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::WaitingApproval | Self::WaitingCondition)
    }

    /// Whether the state machine permits moving to `to`
    pub fn can_transition_to(&self, to: RunState) -> bool {
        use RunState::*;
        match (self, to) {
            (Pending, Running) | (Pending, Cancelled) | (Pending, Failed) => true,
            (Running, Completed)
            | (Running, Failed)
            | (Running, WaitingApproval)
            | (Running, WaitingCondition)
            | (Running, Cancelled) => true,
            (WaitingApproval, Running)
            | (WaitingApproval, Cancelled)
            | (WaitingApproval, Failed) => true,
            (WaitingCondition, Running)
            | (WaitingCondition, Cancelled)
            | (WaitingCondition, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::WaitingCondition => "waiting_condition",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Context ──────────────────────────────────────────────────────────

/// Data visible to steps: input, variables and prior step outputs
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub step_outputs: Map<String, Value>,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

impl RunContext {
    pub fn new(input: Value, triggered_by: Option<String>) -> Self {
        Self {
            input,
            variables: Map::new(),
            step_outputs: Map::new(),
            triggered_by,
        }
    }

    /// JSON scope used by expressions, templates and field paths
    pub fn scope(&self) -> Value {
        json!({
            "input": self.input,
            "variables": self.variables,
            "stepOutputs": self.step_outputs,
            "triggeredBy": self.triggered_by,
        })
    }

    /// Merge an object into the variables map; non-objects are ignored
    pub fn merge_variables(&mut self, data: &Value) {
        if let Value::Object(map) = data {
            for (k, v) in map {
                self.variables.insert(k.clone(), v.clone());
            }
        }
    }

    pub fn set_output(&mut self, step: &StepId, output: Value) {
        self.step_outputs.insert(step.0.clone(), output);
    }
}

/// One visited step in the execution path
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathEntry {
    pub step_id: StepId,
    pub at: DateTime<Utc>,
}

/// Failure detail of a failed run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunErrorDetail {
    pub message: String,
    pub step_id: Option<StepId>,
    /// Chain of step ids leading to the failure
    #[serde(default)]
    pub trace: Vec<String>,
}

/// Link from a child run back to the sub-run step that started it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParentLink {
    pub run_id: RunId,
    pub step_id: StepId,
    pub await_completion: bool,
}

// ── Approvals ────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approver: String,
    pub approved: bool,
    #[serde(default)]
    pub comments: Option<String>,
    pub at: DateTime<Utc>,
}

/// Outcome of an approval tally
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    TimedOut,
}

impl ApprovalDecision {
    /// Edge labels tried, most specific first
    pub fn edge_labels(&self) -> &'static [&'static str] {
        match self {
            Self::Approved => &["approved", "true"],
            Self::Rejected => &["rejected", "false"],
            Self::TimedOut => &["timeout", "rejected", "false"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::TimedOut => "timeout",
        }
    }
}

/// Approval request awaiting responses
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub step_id: StepId,
    pub approvers: Vec<String>,
    pub policy: ApprovalPolicy,
    #[serde(default)]
    pub responses: Vec<ApprovalResponse>,
    pub requested_at: DateTime<Utc>,
}

impl PendingApproval {
    pub fn new(step_id: StepId, approvers: Vec<String>, policy: ApprovalPolicy) -> Self {
        Self {
            step_id,
            approvers,
            policy,
            responses: Vec::new(),
            requested_at: Utc::now(),
        }
    }

    /// Record a response; a repeated approver replaces their earlier answer
    pub fn record(&mut self, response: ApprovalResponse) {
        self.responses.retain(|r| r.approver != response.approver);
        self.responses.push(response);
    }

    /// Tally responses according to the policy
    pub fn decision(&self) -> Option<ApprovalDecision> {
        let approvals = self.responses.iter().filter(|r| r.approved).count();
        let rejections = self.responses.len() - approvals;
        let total = self.approvers.len().max(self.responses.len()).max(1);
        match self.policy {
            ApprovalPolicy::Any => self.responses.first().map(|r| {
                if r.approved {
                    ApprovalDecision::Approved
                } else {
                    ApprovalDecision::Rejected
                }
            }),
            ApprovalPolicy::All => {
                if rejections > 0 {
                    Some(ApprovalDecision::Rejected)
                } else if approvals >= total {
                    Some(ApprovalDecision::Approved)
                } else {
                    None
                }
            }
            ApprovalPolicy::Majority => {
                if approvals * 2 > total {
                    Some(ApprovalDecision::Approved)
                } else if rejections * 2 >= total {
                    Some(ApprovalDecision::Rejected)
                } else {
                    None
                }
            }
        }
    }
}

// ── Run Instance ─────────────────────────────────────────────────────

/// A run of a definition
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunInstance {
    pub id: RunId,
    pub definition_id: RunDefinitionId,
    pub definition_code: String,
    pub definition_version: u32,
    pub scope: Scope,
    pub state: RunState,
    pub current_step: Option<StepId>,
    pub context: RunContext,
    pub execution_path: Vec<PathEntry>,
    pub pending_approval: Option<PendingApproval>,
    pub parent: Option<ParentLink>,
    pub error: Option<RunErrorDetail>,
    pub sla_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunInstance {
    pub fn new(
        definition_id: RunDefinitionId,
        definition_code: impl Into<String>,
        definition_version: u32,
        scope: Scope,
        context: RunContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::generate(),
            definition_id,
            definition_code: definition_code.into(),
            definition_version,
            scope,
            state: RunState::Pending,
            current_step: None,
            context,
            execution_path: Vec::new(),
            pending_approval: None,
            parent: None,
            error: None,
            sla_deadline: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn with_parent(mut self, parent: ParentLink) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Move to a new state, enforcing the state machine
    pub fn transition(&mut self, to: RunState) -> RunflowResult<()> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition_to(to) {
            return Err(RunflowError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        let now = Utc::now();
        if to == RunState::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        self.state = to;
        self.updated_at = now;
        Ok(())
    }

    /// Record a step visit and make it current
    pub fn enter_step(&mut self, step_id: &StepId) {
        self.current_step = Some(step_id.clone());
        self.execution_path.push(PathEntry {
            step_id: step_id.clone(),
            at: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, message: impl Into<String>, step_id: Option<StepId>) -> RunflowResult<()> {
        let trace = self
            .execution_path
            .iter()
            .map(|p| p.step_id.0.clone())
            .collect();
        self.error = Some(RunErrorDetail {
            message: message.into(),
            step_id,
            trace,
        });
        self.transition(RunState::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_waiting(&self) -> bool {
        self.state.is_waiting()
    }

    /// Step ids in visit order
    pub fn visited_steps(&self) -> Vec<&StepId> {
        self.execution_path.iter().map(|p| &p.step_id).collect()
    }

    pub fn sla_breached(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && self.sla_deadline.map(|d| now > d).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_run() -> RunInstance {
        RunInstance::new(
            RunDefinitionId::new("def-1"),
            "expense",
            1,
            Scope::tenant("acme"),
            RunContext::new(json!({"amount": 5}), Some("alice".into())),
        )
    }

    fn response(approver: &str, approved: bool) -> ApprovalResponse {
        ApprovalResponse {
            approver: approver.into(),
            approved,
            comments: None,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut run = make_run();
        assert_eq!(run.state, RunState::Pending);
        run.transition(RunState::Running).unwrap();
        assert!(run.started_at.is_some());
        run.transition(RunState::WaitingApproval).unwrap();
        assert!(run.is_waiting());
        run.transition(RunState::Running).unwrap();
        run.transition(RunState::Completed).unwrap();
        assert!(run.is_terminal());
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut run = make_run();
        run.transition(RunState::Running).unwrap();
        run.transition(RunState::Completed).unwrap();
        let err = run.transition(RunState::Running).unwrap_err();
        assert!(matches!(err, RunflowError::InvalidTransition { .. }));
    }

    #[test]
    fn test_pending_cannot_wait() {
        let mut run = make_run();
        assert!(run.transition(RunState::WaitingCondition).is_err());
    }

    #[test]
    fn test_fail_records_trace() {
        let mut run = make_run();
        run.transition(RunState::Running).unwrap();
        run.enter_step(&StepId::new("start"));
        run.enter_step(&StepId::new("call"));
        run.fail("boom", Some(StepId::new("call"))).unwrap();
        let err = run.error.as_ref().unwrap();
        assert_eq!(err.message, "boom");
        assert_eq!(err.trace, vec!["start".to_string(), "call".to_string()]);
        assert_eq!(run.state, RunState::Failed);
    }

    #[test]
    fn test_scope_exposes_context() {
        let mut ctx = RunContext::new(json!({"amount": 10}), None);
        ctx.merge_variables(&json!({"x": 1}));
        ctx.set_output(&StepId::new("s"), json!("out"));
        let scope = ctx.scope();
        assert_eq!(scope["input"]["amount"], json!(10));
        assert_eq!(scope["variables"]["x"], json!(1));
        assert_eq!(scope["stepOutputs"]["s"], json!("out"));
    }

    #[test]
    fn test_any_policy_first_response_decides() {
        let mut pending = PendingApproval::new(StepId::new("a"), vec!["m1".into(), "m2".into()], ApprovalPolicy::Any);
        assert_eq!(pending.decision(), None);
        pending.record(response("m2", false));
        assert_eq!(pending.decision(), Some(ApprovalDecision::Rejected));
    }

    #[test]
    fn test_all_policy() {
        let mut pending = PendingApproval::new(StepId::new("a"), vec!["m1".into(), "m2".into()], ApprovalPolicy::All);
        pending.record(response("m1", true));
        assert_eq!(pending.decision(), None);
        pending.record(response("m2", true));
        assert_eq!(pending.decision(), Some(ApprovalDecision::Approved));
        pending.record(response("m1", false));
        assert_eq!(pending.decision(), Some(ApprovalDecision::Rejected));
    }

    #[test]
    fn test_majority_policy() {
        let approvers = vec!["a".into(), "b".into(), "c".into()];
        let mut pending = PendingApproval::new(StepId::new("x"), approvers, ApprovalPolicy::Majority);
        pending.record(response("a", true));
        assert_eq!(pending.decision(), None);
        pending.record(response("b", true));
        assert_eq!(pending.decision(), Some(ApprovalDecision::Approved));

        let mut rejecting = PendingApproval::new(
            StepId::new("x"),
            vec!["a".into(), "b".into(), "c".into(), "d".into()],
            ApprovalPolicy::Majority,
        );
        rejecting.record(response("a", false));
        rejecting.record(response("b", false));
        assert_eq!(rejecting.decision(), Some(ApprovalDecision::Rejected));
    }
}

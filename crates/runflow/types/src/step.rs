//! Steps: the typed nodes of a run definition graph

use crate::{Comparator, StepId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ── Step types ───────────────────────────────────────────────────────

/// The type of a step, without its configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Start,
    End,
    Action,
    Condition,
    Approval,
    Wait,
    Parallel,
    Loop,
    SubRun,
    Script,
    Http,
    Notification,
    RecordOperation,
    SetVariable,
}

impl StepType {
    /// Steps that halt traversal and persist the run until resumed
    pub fn is_suspension(&self) -> bool {
        matches!(self, Self::Approval | Self::Wait)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Action => "action",
            Self::Condition => "condition",
            Self::Approval => "approval",
            Self::Wait => "wait",
            Self::Parallel => "parallel",
            Self::Loop => "loop",
            Self::SubRun => "sub_run",
            Self::Script => "script",
            Self::Http => "http",
            Self::Notification => "notification",
            Self::RecordOperation => "record_operation",
            Self::SetVariable => "set_variable",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Step configuration ───────────────────────────────────────────────

/// How a condition step decides which labeled edge to follow
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionCheck {
    /// Compare a path (`input.amount`, `variables.x`) to a value
    Field {
        field: String,
        comparator: Comparator,
        #[serde(default)]
        value: Value,
    },
    /// Free-form boolean expression over `input`, `variables`, `stepOutputs`
    Expression { expression: String },
}

/// Approval tally policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    /// The first response decides
    #[default]
    Any,
    /// Every approver must approve; one rejection rejects
    All,
    /// Strictly more than half decide either way
    Majority,
}

impl std::fmt::Display for ApprovalPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::All => write!(f, "all"),
            Self::Majority => write!(f, "majority"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Static approver list
    #[serde(default)]
    pub approvers: Vec<String>,
    /// Expression producing an approver or a list of approvers
    #[serde(default)]
    pub approvers_expression: Option<String>,
    #[serde(default)]
    pub policy: ApprovalPolicy,
    #[serde(default)]
    pub timeout_minutes: Option<u64>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationUnit {
    #[default]
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitConfig {
    pub amount: u64,
    #[serde(default)]
    pub unit: DurationUnit,
}

impl WaitConfig {
    pub fn millis(amount: u64) -> Self {
        Self {
            amount,
            unit: DurationUnit::Milliseconds,
        }
    }

    pub fn to_millis(&self) -> u64 {
        let factor: u64 = match self.unit {
            DurationUnit::Milliseconds => 1,
            DurationUnit::Seconds => 1_000,
            DurationUnit::Minutes => 60_000,
            DurationUnit::Hours => 3_600_000,
            DurationUnit::Days => 86_400_000,
        };
        self.amount.saturating_mul(factor)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Expression producing the array to iterate
    pub collection: String,
    /// Steps executed in order for each item
    pub body: Vec<StepId>,
    #[serde(default)]
    pub max_iterations: Option<usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SubRunConfig {
    pub definition_code: String,
    /// Child input key to expression over the parent scope.
    /// Empty mapping passes the parent's input through.
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
    /// Suspend the parent until the child reaches a terminal state
    #[serde(default)]
    pub await_completion: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptConfig {
    pub script: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub allow_http: bool,
    #[serde(default)]
    pub allow_data_query: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub template_code: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOperationKind {
    Create,
    Read,
    Update,
    Delete,
    Query,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordOperationConfig {
    pub operation: RecordOperationKind,
    pub collection: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub query: Option<Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    pub action_type: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// One variable write of a set-variable step
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub name: String,
    /// Literal value; strings may contain `{{path}}` placeholders
    #[serde(default)]
    pub value: Option<Value>,
    /// Expression evaluated in the sandbox; takes precedence over `value`
    #[serde(default)]
    pub expression: Option<String>,
}

/// Step type plus its type-specific configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Start,
    End,
    Action(ActionConfig),
    Condition(ConditionCheck),
    Approval(ApprovalConfig),
    Wait(WaitConfig),
    Parallel { branches: Vec<Vec<StepId>> },
    Loop(LoopConfig),
    SubRun(SubRunConfig),
    Script(ScriptConfig),
    Http(HttpConfig),
    Notification(NotificationConfig),
    RecordOperation(RecordOperationConfig),
    SetVariable { assignments: Vec<Assignment> },
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            Self::Start => StepType::Start,
            Self::End => StepType::End,
            Self::Action(_) => StepType::Action,
            Self::Condition(_) => StepType::Condition,
            Self::Approval(_) => StepType::Approval,
            Self::Wait(_) => StepType::Wait,
            Self::Parallel { .. } => StepType::Parallel,
            Self::Loop(_) => StepType::Loop,
            Self::SubRun(_) => StepType::SubRun,
            Self::Script(_) => StepType::Script,
            Self::Http(_) => StepType::Http,
            Self::Notification(_) => StepType::Notification,
            Self::RecordOperation(_) => StepType::RecordOperation,
            Self::SetVariable { .. } => StepType::SetVariable,
        }
    }

    /// Steps nested inside this one (parallel branches, loop body)
    pub fn nested_steps(&self) -> Vec<&StepId> {
        match self {
            Self::Parallel { branches } => branches.iter().flatten().collect(),
            Self::Loop(config) => config.body.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Whether executing this step may suspend the run
    pub fn may_suspend(&self) -> bool {
        match self {
            Self::SubRun(config) => config.await_completion,
            other => other.step_type().is_suspension(),
        }
    }
}

// ── Edges and steps ──────────────────────────────────────────────────

/// A labeled outgoing connection (`true`, `false`, `approved`, ...)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEdge {
    pub label: String,
    pub target: StepId,
}

/// One node of a run definition graph
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Default outgoing edge
    #[serde(default)]
    pub next: Option<StepId>,
    /// Labeled outgoing edges
    #[serde(default)]
    pub edges: Vec<StepEdge>,
    /// Target taken when this step fails
    #[serde(default)]
    pub on_error: Option<StepId>,
}

impl Step {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: StepId(id),
            kind,
            next: None,
            edges: Vec::new(),
            on_error: None,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::End)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next = Some(StepId(next.into()));
        self
    }

    pub fn on(mut self, label: impl Into<String>, target: impl Into<String>) -> Self {
        self.edges.push(StepEdge {
            label: label.into(),
            target: StepId(target.into()),
        });
        self
    }

    pub fn on_error(mut self, target: impl Into<String>) -> Self {
        self.on_error = Some(StepId(target.into()));
        self
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }

    /// Target of the edge with the given label
    pub fn edge(&self, label: &str) -> Option<&StepId> {
        self.edges
            .iter()
            .find(|e| e.label.eq_ignore_ascii_case(label))
            .map(|e| &e.target)
    }

    /// First labeled edge that matches, falling back to the default edge
    pub fn resolve_edge(&self, labels: &[&str]) -> Option<&StepId> {
        labels
            .iter()
            .find_map(|label| self.edge(label))
            .or(self.next.as_ref())
    }

    /// Every outgoing target, including the error edge
    pub fn successors(&self) -> Vec<&StepId> {
        let mut out: Vec<&StepId> = self.next.iter().collect();
        out.extend(self.edges.iter().map(|e| &e.target));
        out.extend(self.on_error.iter());
        out
    }
}

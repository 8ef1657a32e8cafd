//! Business rules evaluated against record mutations

use crate::{ConditionExpression, RuleId, Scope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The record mutation a rule reacts to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTrigger {
    BeforeInsert,
    AfterInsert,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
}

impl RuleTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeInsert => "before_insert",
            Self::AfterInsert => "after_insert",
            Self::BeforeUpdate => "before_update",
            Self::AfterUpdate => "after_update",
            Self::BeforeDelete => "before_delete",
            Self::AfterDelete => "after_delete",
        }
    }

    /// Bus topic for this trigger, e.g. `record.before_insert`
    pub fn topic(&self) -> String {
        format!("record.{}", self.as_str())
    }
}

impl std::fmt::Display for RuleTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a rule's action applies
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    Always,
    /// True when any listed field is among the changed fields
    FieldChanged { fields: Vec<String> },
    Expression { tree: ConditionExpression },
    Script { script: String },
}

/// Where a set-value mapping takes its value from
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum MappingSource {
    Literal { value: Value },
    /// Dotted path into the working record
    Field { path: String },
    /// `{{path}}` template over `record`, `previous`, `user`
    Template { template: String },
    Script { script: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub field: String,
    #[serde(flatten)]
    pub source: MappingSource,
}

/// One check of a validate action
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum CheckKind {
    Required,
    Email,
    Regex { pattern: String },
    Min { value: f64 },
    Max { value: f64 },
    /// Script returning a truthy value when the record is valid
    Script { script: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub field: String,
    #[serde(flatten)]
    pub kind: CheckKind,
    #[serde(default)]
    pub message: Option<String>,
}

/// What a matching rule does
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleAction {
    SetValue {
        mappings: Vec<FieldMapping>,
    },
    Validate {
        checks: Vec<ValidationCheck>,
    },
    Abort {
        message: String,
    },
    Script {
        script: String,
    },
    StartOrchestration {
        definition_code: String,
        /// Input key to dotted path into the record; empty passes the record
        #[serde(default)]
        input_mapping: BTreeMap<String, String>,
    },
    Notify {
        template_code: String,
        #[serde(default)]
        recipients: Vec<String>,
        #[serde(default)]
        data: Value,
    },
    ExternalCall {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<Value>,
    },
}

fn default_method() -> String {
    "POST".to_string()
}

impl RuleAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SetValue { .. } => "set_value",
            Self::Validate { .. } => "validate",
            Self::Abort { .. } => "abort",
            Self::Script { .. } => "script",
            Self::StartOrchestration { .. } => "start_orchestration",
            Self::Notify { .. } => "notify",
            Self::ExternalCall { .. } => "external_call",
        }
    }
}

/// What happens when a rule's action fails unexpectedly
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    #[default]
    AbortChain,
    NotifyAdmin,
    LogAndContinue,
}

/// A business rule
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusinessRule {
    #[serde(default = "RuleId::generate")]
    pub id: RuleId,
    pub name: String,
    #[serde(default)]
    pub scope: Scope,
    pub collection: String,
    pub trigger: RuleTrigger,
    /// Ascending execution order
    #[serde(default)]
    pub priority: i32,
    pub condition: RuleCondition,
    pub action: RuleAction,
    #[serde(default)]
    pub on_error: ErrorPolicy,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl BusinessRule {
    pub fn new(
        name: impl Into<String>,
        collection: impl Into<String>,
        trigger: RuleTrigger,
        action: RuleAction,
    ) -> Self {
        Self {
            id: RuleId::generate(),
            name: name.into(),
            scope: Scope::platform(),
            collection: collection.into(),
            trigger,
            priority: 0,
            condition: RuleCondition::Always,
            action,
            on_error: ErrorPolicy::default(),
            active: true,
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_condition(mut self, condition: RuleCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_on_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }
}

//! Input and output of one rule-chain execution

use runflow_types::{path, RuleId, RuleTrigger, Scope};
use runflow_script::ScriptContext;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A record mutation to run rules against
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleContext {
    pub scope: Scope,
    pub collection: String,
    pub trigger: RuleTrigger,
    pub record: Value,
    #[serde(default)]
    pub previous: Option<Value>,
    #[serde(default)]
    pub user: Value,
    /// Explicit changed fields; derived from `record`/`previous` when empty
    #[serde(default)]
    pub changed_fields: Vec<String>,
}

impl RuleContext {
    pub fn new(scope: Scope, collection: impl Into<String>, trigger: RuleTrigger, record: Value) -> Self {
        Self {
            scope,
            collection: collection.into(),
            trigger,
            record,
            previous: None,
            user: Value::Null,
            changed_fields: Vec::new(),
        }
    }

    pub fn with_previous(mut self, previous: Value) -> Self {
        self.previous = Some(previous);
        self
    }

    pub fn with_user(mut self, user: Value) -> Self {
        self.user = user;
        self
    }

    pub fn with_changed_fields(mut self, fields: Vec<String>) -> Self {
        self.changed_fields = fields;
        self
    }

    pub fn changed_fields(&self) -> Vec<String> {
        if self.changed_fields.is_empty() {
            path::changed_fields(&self.record, self.previous.as_ref())
        } else {
            self.changed_fields.clone()
        }
    }

    /// The actor id taken from `user.id`, if any
    pub fn actor(&self) -> Option<String> {
        match self.user.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Template/mapping scope for the current working record
    pub(crate) fn template_scope(&self, record: &Value) -> Value {
        json!({
            "record": record,
            "previous": self.previous.clone().unwrap_or(Value::Null),
            "user": self.user,
            "collection": self.collection,
        })
    }

    pub(crate) fn script_context(&self, record: &Value, changed: &[String]) -> ScriptContext {
        ScriptContext::new()
            .with_record(record.clone())
            .with_previous(self.previous.clone())
            .with_user(self.user.clone())
            .with_changed_fields(changed.to_vec())
    }
}

/// Outcome of a single rule within a chain
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleOutcome {
    pub rule_id: RuleId,
    pub rule_name: String,
    /// Whether the condition held and the action ran
    pub executed: bool,
    pub success: bool,
    #[serde(default)]
    pub modifications: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a full rule chain.
///
/// When `aborted` is true the caller must not persist `record`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleExecutionResult {
    pub success: bool,
    pub record: Value,
    pub results: Vec<RuleOutcome>,
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_message: Option<String>,
}

impl RuleExecutionResult {
    pub(crate) fn new(record: Value) -> Self {
        Self {
            success: true,
            record,
            results: Vec::new(),
            aborted: false,
            abort_message: None,
        }
    }

    pub(crate) fn abort(&mut self, message: String) {
        self.aborted = true;
        self.success = false;
        self.abort_message = Some(message);
    }

    /// Ids of the rules whose actions ran, in execution order
    pub fn executed_rules(&self) -> Vec<&RuleId> {
        self.results
            .iter()
            .filter(|r| r.executed)
            .map(|r| &r.rule_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed_fields_are_derived() {
        let ctx = RuleContext::new(
            Scope::platform(),
            "orders",
            RuleTrigger::BeforeUpdate,
            json!({"status": "paid", "total": 10}),
        )
        .with_previous(json!({"status": "open", "total": 10}));
        assert_eq!(ctx.changed_fields(), vec!["status".to_string()]);

        let explicit = ctx.clone().with_changed_fields(vec!["total".into()]);
        assert_eq!(explicit.changed_fields(), vec!["total".to_string()]);
    }

    #[test]
    fn test_actor_from_user() {
        let ctx = RuleContext::new(Scope::platform(), "orders", RuleTrigger::AfterInsert, json!({}))
            .with_user(json!({"id": "u-1"}));
        assert_eq!(ctx.actor().as_deref(), Some("u-1"));
    }
}

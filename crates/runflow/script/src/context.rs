//! Read-only context snapshot exposed to scripts as globals

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Context visible to a script.
///
/// Every field is exposed as a read-only global: `record`, `previous`,
/// `input`, `variables`, `user`, `changedFields`, `stepOutputs`, plus any
/// `extra` entries (e.g. `item` and `index` inside loops).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptContext {
    #[serde(default)]
    pub record: Value,
    #[serde(default)]
    pub previous: Value,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub variables: Value,
    #[serde(default)]
    pub user: Value,
    #[serde(default)]
    pub changed_fields: Vec<String>,
    #[serde(default)]
    pub step_outputs: Value,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl ScriptContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(mut self, record: Value) -> Self {
        self.record = record;
        self
    }

    pub fn with_previous(mut self, previous: Option<Value>) -> Self {
        self.previous = previous.unwrap_or(Value::Null);
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = variables;
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

    pub fn with_step_outputs(mut self, outputs: Value) -> Self {
        self.step_outputs = outputs;
        self
    }

    /// Add an extra global; context fields cannot be overridden
    pub fn with_global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }

    pub(crate) fn to_globals(&self) -> Map<String, Value> {
        let mut globals = self.extra.clone();
        globals.insert("record".into(), self.record.clone());
        globals.insert("previous".into(), self.previous.clone());
        globals.insert("input".into(), self.input.clone());
        globals.insert("variables".into(), self.variables.clone());
        globals.insert("user".into(), self.user.clone());
        globals.insert(
            "changedFields".into(),
            Value::Array(self.changed_fields.iter().cloned().map(Value::String).collect()),
        );
        globals.insert("stepOutputs".into(), self.step_outputs.clone());
        globals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_fields_win_over_extras() {
        let ctx = ScriptContext::new()
            .with_record(json!({"a": 1}))
            .with_global("record", json!("shadow"))
            .with_global("item", json!(3));
        let globals = ctx.to_globals();
        assert_eq!(globals["record"], json!({"a": 1}));
        assert_eq!(globals["item"], json!(3));
        assert_eq!(globals["changedFields"], json!([]));
    }
}

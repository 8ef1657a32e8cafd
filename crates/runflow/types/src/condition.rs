//! Structured condition trees
//!
//! A [`ConditionExpression`] is either a leaf comparison against one record
//! field or a logical group of child expressions. Trees are plain data so
//! they can be evaluated on the hot path without running any script.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison applied by a condition leaf.
///
/// Unrecognized comparator names deserialize to [`Comparator::Unknown`],
/// which always evaluates to `false`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    #[serde(alias = "equals", alias = "==")]
    Eq,
    #[serde(alias = "not_equals", alias = "!=")]
    Ne,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Lte,
    In,
    #[serde(alias = "not-in")]
    NotIn,
    Contains,
    #[serde(alias = "starts-with")]
    StartsWith,
    #[serde(alias = "ends-with")]
    EndsWith,
    #[serde(alias = "is-null")]
    IsNull,
    #[serde(alias = "is-not-null")]
    IsNotNull,
    Changed,
    #[serde(alias = "changed-to")]
    ChangedTo,
    #[serde(alias = "changed-from")]
    ChangedFrom,
    Regex,
    Between,
    #[serde(other)]
    Unknown,
}

/// Logical combinator of a condition group
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    And,
    Or,
    /// Negates the first child only
    Not,
}

/// Recursive boolean condition tree
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionExpression {
    Group {
        operator: LogicalOperator,
        children: Vec<ConditionExpression>,
    },
    Leaf {
        field: String,
        comparator: Comparator,
        #[serde(default)]
        value: Value,
    },
}

impl ConditionExpression {
    pub fn leaf(field: impl Into<String>, comparator: Comparator, value: Value) -> Self {
        Self::Leaf {
            field: field.into(),
            comparator,
            value,
        }
    }

    pub fn and(children: Vec<ConditionExpression>) -> Self {
        Self::Group {
            operator: LogicalOperator::And,
            children,
        }
    }

    pub fn or(children: Vec<ConditionExpression>) -> Self {
        Self::Group {
            operator: LogicalOperator::Or,
            children,
        }
    }

    pub fn not(child: ConditionExpression) -> Self {
        Self::Group {
            operator: LogicalOperator::Not,
            children: vec![child],
        }
    }

    /// Number of leaves in the tree
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Leaf { .. } => 1,
            Self::Group { children, .. } => children.iter().map(Self::leaf_count).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_nested_tree() {
        let tree: ConditionExpression = serde_json::from_value(json!({
            "operator": "and",
            "children": [
                {"field": "status", "comparator": "eq", "value": "open"},
                {"operator": "not", "children": [
                    {"field": "owner", "comparator": "is_null"}
                ]}
            ]
        }))
        .unwrap();
        assert_eq!(tree.leaf_count(), 2);
        match tree {
            ConditionExpression::Group { operator, children } => {
                assert_eq!(operator, LogicalOperator::And);
                assert_eq!(children.len(), 2);
            }
            _ => panic!("expected group"),
        }
    }

    #[test]
    fn test_unknown_comparator_deserializes() {
        let leaf: ConditionExpression =
            serde_json::from_value(json!({"field": "x", "comparator": "sounds_like", "value": 1}))
                .unwrap();
        assert!(matches!(
            leaf,
            ConditionExpression::Leaf {
                comparator: Comparator::Unknown,
                ..
            }
        ));
    }

    #[test]
    fn test_hyphenated_comparator_aliases() {
        let c: Comparator = serde_json::from_value(json!("not-in")).unwrap();
        assert_eq!(c, Comparator::NotIn);
        let c: Comparator = serde_json::from_value(json!("changed-to")).unwrap();
        assert_eq!(c, Comparator::ChangedTo);
    }
}

//! Structured condition evaluation
//!
//! [`evaluate`] is pure and total: malformed leaves, unknown comparators and
//! type mismatches yield `false`, never an error.

use regex::RegexBuilder;
use runflow_types::{path, Comparator, ConditionExpression, LogicalOperator};
use serde_json::Value;
use std::cmp::Ordering;

const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Evaluate a condition tree against a record and its previous version.
///
/// `not` considers only its first child; an empty `and` is true and an
/// empty `or` is false.
pub fn evaluate(tree: &ConditionExpression, record: &Value, previous: Option<&Value>) -> bool {
    match tree {
        ConditionExpression::Leaf {
            field,
            comparator,
            value,
        } => {
            let actual = path::lookup_or_null(record, field);
            let before = previous.map(|p| path::lookup_or_null(p, field));
            compare(&actual, *comparator, value, before.as_ref())
        }
        ConditionExpression::Group { operator, children } => match operator {
            LogicalOperator::And => children.iter().all(|c| evaluate(c, record, previous)),
            LogicalOperator::Or => children.iter().any(|c| evaluate(c, record, previous)),
            LogicalOperator::Not => children
                .first()
                .map(|c| !evaluate(c, record, previous))
                .unwrap_or(false),
        },
    }
}

/// Apply one comparator.
///
/// `before` is the field's previous value; `None` means there is no
/// previous record (an insert), in which case a non-null field counts as
/// changed.
pub fn compare(actual: &Value, comparator: Comparator, expected: &Value, before: Option<&Value>) -> bool {
    match comparator {
        Comparator::Eq => values_equal(actual, expected),
        Comparator::Ne => !values_equal(actual, expected),
        Comparator::Gt => ordering(actual, expected) == Some(Ordering::Greater),
        Comparator::Gte => matches!(ordering(actual, expected), Some(Ordering::Greater | Ordering::Equal)),
        Comparator::Lt => ordering(actual, expected) == Some(Ordering::Less),
        Comparator::Lte => matches!(ordering(actual, expected), Some(Ordering::Less | Ordering::Equal)),
        Comparator::In => match expected {
            Value::Array(options) => options.iter().any(|o| values_equal(actual, o)),
            _ => false,
        },
        Comparator::NotIn => match expected {
            Value::Array(options) => !options.iter().any(|o| values_equal(actual, o)),
            _ => false,
        },
        Comparator::Contains => match (actual, expected) {
            (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|i| values_equal(i, needle)),
            _ => false,
        },
        Comparator::StartsWith => match (actual, expected) {
            (Value::String(s), Value::String(prefix)) => s.starts_with(prefix.as_str()),
            _ => false,
        },
        Comparator::EndsWith => match (actual, expected) {
            (Value::String(s), Value::String(suffix)) => s.ends_with(suffix.as_str()),
            _ => false,
        },
        Comparator::IsNull => actual.is_null(),
        Comparator::IsNotNull => !actual.is_null(),
        Comparator::Changed => changed(actual, before),
        Comparator::ChangedTo => changed(actual, before) && values_equal(actual, expected),
        Comparator::ChangedFrom => {
            changed(actual, before) && before.map(|b| values_equal(b, expected)).unwrap_or(false)
        }
        Comparator::Regex => match (actual, expected) {
            (Value::String(s), Value::String(pattern)) => RegexBuilder::new(pattern)
                .size_limit(REGEX_SIZE_LIMIT)
                .build()
                .map(|re| re.is_match(s))
                .unwrap_or(false),
            _ => false,
        },
        Comparator::Between => match expected {
            Value::Array(bounds) if bounds.len() == 2 => {
                matches!(ordering(actual, &bounds[0]), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(ordering(actual, &bounds[1]), Some(Ordering::Less | Ordering::Equal))
            }
            _ => false,
        },
        Comparator::Unknown => false,
    }
}

fn changed(actual: &Value, before: Option<&Value>) -> bool {
    match before {
        Some(before) => !values_equal(actual, before),
        None => !actual.is_null(),
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Numbers (and numeric strings) compare by value; everything else by JSON
/// equality
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), _) | (_, Value::Number(_)) => match (numeric(a), numeric(b)) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        _ => a == b,
    }
}

fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => match (numeric(a), numeric(b)) {
            (Some(p), Some(q)) => p.partial_cmp(&q),
            _ => Some(x.cmp(y)),
        },
        _ => numeric(a)?.partial_cmp(&numeric(b)?),
    }
}

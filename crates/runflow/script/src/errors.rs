//! Sandbox error types
//!
//! Every error leaving the sandbox is sanitized: one line, bounded length,
//! and no host file paths.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

const MAX_MESSAGE_LEN: usize = 300;

/// Category of a script failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptErrorKind {
    Syntax,
    Reference,
    Type,
    Permission,
    Timeout,
    Limit,
    Runtime,
}

impl std::fmt::Display for ScriptErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Syntax => "SyntaxError",
            Self::Reference => "ReferenceError",
            Self::Type => "TypeError",
            Self::Permission => "PermissionError",
            Self::Timeout => "TimeoutError",
            Self::Limit => "LimitError",
            Self::Runtime => "Error",
        };
        f.write_str(name)
    }
}

/// A sanitized script failure
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ScriptError {
    pub kind: ScriptErrorKind,
    pub message: String,
}

impl ScriptError {
    pub fn new(kind: ScriptErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: sanitize(&message.into()),
        }
    }

    pub fn syntax(line: usize, col: usize, message: impl std::fmt::Display) -> Self {
        Self::new(
            ScriptErrorKind::Syntax,
            format!("{} (line {}, column {})", message, line, col),
        )
    }

    pub fn reference(name: &str) -> Self {
        Self::new(ScriptErrorKind::Reference, format!("{} is not defined", name))
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ScriptErrorKind::Type, message)
    }

    pub fn permission(capability: &str) -> Self {
        Self::new(
            ScriptErrorKind::Permission,
            format!("{} capability is not enabled for this script", capability),
        )
    }

    pub fn timeout(limit_ms: u64) -> Self {
        Self::new(
            ScriptErrorKind::Timeout,
            format!("script exceeded time limit of {}ms", limit_ms),
        )
    }

    pub fn limit(message: impl Into<String>) -> Self {
        Self::new(ScriptErrorKind::Limit, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ScriptErrorKind::Runtime, message)
    }
}

pub type ScriptResult<T> = Result<T, ScriptError>;

fn path_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?:[A-Za-z]:\\|/)(?:[\w.\-]+[/\\])+[\w.\-]*(?::\d+)*").ok())
        .as_ref()
}

/// Strip host details from an error message.
///
/// Keeps the first line only, replaces absolute paths and bounds length.
pub fn sanitize(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or("").trim();
    let cleaned = match path_pattern() {
        Some(re) => re.replace_all(first_line, "<path>").into_owned(),
        None => first_line.to_string(),
    };
    let mut out: String = cleaned.chars().take(MAX_MESSAGE_LEN).collect();
    if cleaned.chars().count() > MAX_MESSAGE_LEN {
        out.push_str("...");
    }
    out
}

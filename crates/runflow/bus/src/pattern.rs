//! Topic patterns
//!
//! ```text
//! "*"                 → every topic
//! "record.after_update" → that topic only
//! "record.*"          → every topic starting with "record."
//! "run.*.failed"      → wildcard regex ^run\..*\.failed$
//! ```

use crate::errors::{BusError, BusResult};
use regex::Regex;

const MAX_PATTERN_LEN: usize = 256;

#[derive(Clone, Debug)]
enum Matcher {
    All,
    Exact(String),
    Prefix(String),
    Wildcard(Regex),
}

/// A parsed subscription pattern
#[derive(Clone, Debug)]
pub struct TopicPattern {
    source: String,
    matcher: Matcher,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> BusResult<Self> {
        let invalid = |reason: &str| BusError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };
        if pattern.is_empty() {
            return Err(invalid("empty pattern"));
        }
        if pattern.len() > MAX_PATTERN_LEN {
            return Err(invalid("pattern too long"));
        }

        let stars = pattern.matches('*').count();
        let matcher = if pattern == "*" {
            Matcher::All
        } else if stars == 0 {
            Matcher::Exact(pattern.to_string())
        } else if stars == 1 && pattern.ends_with('*') {
            Matcher::Prefix(pattern.trim_end_matches('*').to_string())
        } else {
            let body = pattern
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            let regex = Regex::new(&format!("^{}$", body)).map_err(|e| invalid(&e.to_string()))?;
            Matcher::Wildcard(regex)
        };

        Ok(Self {
            source: pattern.to_string(),
            matcher,
        })
    }

    /// Pattern matching every topic
    pub fn all() -> Self {
        Self {
            source: "*".to_string(),
            matcher: Matcher::All,
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match &self.matcher {
            Matcher::All => true,
            Matcher::Exact(exact) => exact == topic,
            Matcher::Prefix(prefix) => topic.starts_with(prefix.as_str()),
            Matcher::Wildcard(regex) => regex.is_match(topic),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for TopicPattern {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pattern(p: &str) -> TopicPattern {
        TopicPattern::parse(p).unwrap()
    }

    #[test]
    fn test_bare_star_matches_everything() {
        let p = pattern("*");
        assert!(p.matches("record.before_insert"));
        assert!(p.matches("workflow.started"));
        assert!(p.matches(""));
    }

    #[test]
    fn test_trailing_star_is_prefix() {
        let p = pattern("record.*");
        assert!(p.matches("record.before_insert"));
        assert!(p.matches("record.after_update"));
        assert!(!p.matches("workflow.started"));
        assert!(!p.matches("record"));
    }

    #[test]
    fn test_exact_matches_only_itself() {
        let p = pattern("run.completed");
        assert!(p.matches("run.completed"));
        assert!(!p.matches("run.completed.extra"));
        assert!(!p.matches("run.complete"));
    }

    #[test]
    fn test_embedded_star_is_escaped_regex() {
        let p = pattern("run.*.failed");
        assert!(p.matches("run.step.failed"));
        assert!(!p.matches("runXstepXfailed"));

        let p = pattern("a+b*(c)");
        assert!(p.matches("a+bzz(c)"));
        assert!(!p.matches("aabzz(c)"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(TopicPattern::parse("").is_err());
        assert!(TopicPattern::parse(&"x".repeat(300)).is_err());
    }

    proptest! {
        #[test]
        fn prop_star_matches_any_topic(topic in "[a-z_.]{0,32}") {
            prop_assert!(TopicPattern::all().matches(&topic));
        }

        #[test]
        fn prop_exact_pattern_matches_itself(topic in "[a-z_.]{1,32}") {
            prop_assert!(pattern(&topic).matches(&topic));
        }

        #[test]
        fn prop_prefix_pattern_matches_extensions(prefix in "[a-z]{1,8}", rest in "[a-z_]{0,16}") {
            let p = pattern(&format!("{}.*", prefix));
            let topic = format!("{}.{}", prefix, rest);
            prop_assert!(p.matches(&topic));
        }
    }
}

//! Label matchers
//!
//! A matcher is a `(name, op, value)` tuple applied to label-set values.
//! Regex matchers are anchored on both ends, matching the whole value.

use crate::{Error, Result};
use regex::Regex;
use std::fmt;

/// Matcher operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherOp {
    /// `=`
    Equal,
    /// `!=`
    NotEqual,
    /// `=~`
    Regex,
    /// `!~`
    NotRegex,
}

impl fmt::Display for MatcherOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatcherOp::Equal => write!(f, "="),
            MatcherOp::NotEqual => write!(f, "!="),
            MatcherOp::Regex => write!(f, "=~"),
            MatcherOp::NotRegex => write!(f, "!~"),
        }
    }
}

/// A single label matcher.
#[derive(Debug, Clone)]
pub struct Matcher {
    pub name: String,
    pub op: MatcherOp,
    pub value: String,
    re: Option<Regex>,
}

impl Matcher {
    /// Create a matcher, compiling the value as an anchored regex for
    /// `=~` / `!~` operators.
    pub fn new(op: MatcherOp, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let value = value.into();
        let re = match op {
            MatcherOp::Regex | MatcherOp::NotRegex => {
                let re = Regex::new(&format!("^(?:{})$", value)).map_err(|e| {
                    Error::invalid_matcher(format!("invalid regex {:?} for {}: {}", value, name, e))
                })?;
                Some(re)
            }
            _ => None,
        };
        Ok(Self {
            name,
            op,
            value,
            re,
        })
    }

    /// Equality matcher, infallible
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatcherOp::Equal,
            value: value.into(),
            re: None,
        }
    }

    /// Inequality matcher, infallible
    pub fn not_equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatcherOp::NotEqual,
            value: value.into(),
            re: None,
        }
    }

    /// Evaluate the matcher against a label value.
    pub fn matches(&self, value: &str) -> bool {
        match self.op {
            MatcherOp::Equal => self.value == value,
            MatcherOp::NotEqual => self.value != value,
            MatcherOp::Regex => self.re.as_ref().map(|re| re.is_match(value)).unwrap_or(false),
            MatcherOp::NotRegex => self.re.as_ref().map(|re| !re.is_match(value)).unwrap_or(false),
        }
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.op == other.op && self.value == other.value
    }
}

impl Eq for Matcher {}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_matcher() {
        let m = Matcher::equal("env", "prod");
        assert!(m.matches("prod"));
        assert!(!m.matches("dev"));
    }

    #[test]
    fn test_not_equal_matcher() {
        let m = Matcher::not_equal("env", "prod");
        assert!(!m.matches("prod"));
        assert!(m.matches("dev"));
    }

    #[test]
    fn test_regex_matcher_is_anchored() {
        let m = Matcher::new(MatcherOp::Regex, "env", "pro.*").unwrap();
        assert!(m.matches("prod"));
        assert!(m.matches("pro"));
        // Anchored: a prefix elsewhere in the value does not match.
        assert!(!m.matches("xprod"));

        let m = Matcher::new(MatcherOp::Regex, "env", "ro").unwrap();
        assert!(!m.matches("prod"));
    }

    #[test]
    fn test_not_regex_matcher() {
        let m = Matcher::new(MatcherOp::NotRegex, "env", "prod|staging").unwrap();
        assert!(!m.matches("prod"));
        assert!(!m.matches("staging"));
        assert!(m.matches("dev"));
    }

    #[test]
    fn test_invalid_regex() {
        let err = Matcher::new(MatcherOp::Regex, "env", "(").unwrap_err();
        assert!(err.to_string().contains("invalid regex"));
    }
}

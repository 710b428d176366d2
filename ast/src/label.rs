use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use enquote::enquote;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ast_error::{AstError, AstResult};

pub const NAME_LABEL: &str = "__name__";

#[derive(
    Default, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Copy, Hash, Serialize, Deserialize,
)]
pub enum LabelFilterOp {
    #[default]
    Equal,
    NotEqual,
    RegexEqual,
    RegexNotEqual,
}

impl LabelFilterOp {
    pub fn is_negative(&self) -> bool {
        matches!(self, LabelFilterOp::NotEqual | LabelFilterOp::RegexNotEqual)
    }

    pub fn is_regex(&self) -> bool {
        matches!(
            self,
            LabelFilterOp::RegexEqual | LabelFilterOp::RegexNotEqual
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LabelFilterOp::Equal => "=",
            LabelFilterOp::NotEqual => "!=",
            LabelFilterOp::RegexEqual => "=~",
            LabelFilterOp::RegexNotEqual => "!~",
        }
    }
}

impl TryFrom<&str> for LabelFilterOp {
    type Error = AstError;

    fn try_from(op: &str) -> Result<Self, Self::Error> {
        match op {
            "=" => Ok(LabelFilterOp::Equal),
            "!=" => Ok(LabelFilterOp::NotEqual),
            "=~" => Ok(LabelFilterOp::RegexEqual),
            "!~" => Ok(LabelFilterOp::RegexNotEqual),
            _ => Err(AstError::General(format!(
                "unexpected match op literal: {op}"
            ))),
        }
    }
}

impl fmt::Display for LabelFilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single `label op "value"` filter from a series selector.
///
/// Regex filters are fully anchored, the way Prometheus matches them.
#[derive(Debug, Clone)]
pub struct LabelFilter {
    pub op: LabelFilterOp,
    pub label: String,
    pub value: String,
    re: Option<Regex>,
}

impl LabelFilter {
    pub fn new<N, V>(op: LabelFilterOp, label: N, value: V) -> AstResult<Self>
    where
        N: Into<String>,
        V: Into<String>,
    {
        let value = value.into();
        let re = if op.is_regex() {
            let anchored = format!("^(?:{value})$");
            let re = Regex::new(&anchored)
                .map_err(|e| AstError::InvalidRegex(value.clone(), e.to_string()))?;
            Some(re)
        } else {
            None
        };
        Ok(Self {
            op,
            label: label.into(),
            value,
            re,
        })
    }

    pub fn equal<N: Into<String>, V: Into<String>>(label: N, value: V) -> Self {
        Self {
            op: LabelFilterOp::Equal,
            label: label.into(),
            value: value.into(),
            re: None,
        }
    }

    pub fn not_equal<N: Into<String>, V: Into<String>>(label: N, value: V) -> Self {
        Self {
            op: LabelFilterOp::NotEqual,
            label: label.into(),
            value: value.into(),
            re: None,
        }
    }

    pub fn is_metric_name_filter(&self) -> bool {
        self.label == NAME_LABEL && self.op == LabelFilterOp::Equal
    }

    /// Reports whether the filter matches the given label value. A missing label matches
    /// as the empty string.
    pub fn is_match(&self, value: &str) -> bool {
        match (&self.op, &self.re) {
            (LabelFilterOp::Equal, _) => self.value == value,
            (LabelFilterOp::NotEqual, _) => self.value != value,
            (LabelFilterOp::RegexEqual, Some(re)) => re.is_match(value),
            (LabelFilterOp::RegexNotEqual, Some(re)) => !re.is_match(value),
            _ => false,
        }
    }
}

impl PartialEq for LabelFilter {
    fn eq(&self, other: &Self) -> bool {
        self.op == other.op && self.label == other.label && self.value == other.value
    }
}

impl Eq for LabelFilter {}

impl Hash for LabelFilter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.op.hash(state);
        self.label.hash(state);
        self.value.hash(state);
    }
}

impl PartialOrd for LabelFilter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LabelFilter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.label
            .cmp(&other.label)
            .then_with(|| self.op.cmp(&other.op))
            .then_with(|| self.value.cmp(&other.value))
    }
}

impl fmt::Display for LabelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.label, self.op, enquote('"', &self.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regex_filters_are_anchored() {
        let f = LabelFilter::new(LabelFilterOp::RegexEqual, "job", "api.*").unwrap();
        assert!(f.is_match("api-server"));
        assert!(!f.is_match("my-api"));

        let nf = LabelFilter::new(LabelFilterOp::RegexNotEqual, "job", "api").unwrap();
        assert!(nf.is_match("web"));
        assert!(!nf.is_match("api"));
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let err = LabelFilter::new(LabelFilterOp::RegexEqual, "job", "(").unwrap_err();
        assert!(matches!(err, AstError::InvalidRegex(..)));
    }

    #[test]
    fn display_quotes_value() {
        let f = LabelFilter::equal("job", "a\"b");
        assert_eq!(f.to_string(), r#"job="a\"b""#);
    }
}

//! Conversions between wire types and the querymesh-core label model

use crate::store::v1::{label_matcher, Label, LabelMatcher, LabelSet, TsdbInfo};
use querymesh_core::{self as core, Matcher, MatcherOp, TimeRange};

impl From<&core::Label> for Label {
    fn from(label: &core::Label) -> Self {
        Self {
            name: label.name.clone(),
            value: label.value.clone(),
        }
    }
}

impl From<&Label> for core::Label {
    fn from(label: &Label) -> Self {
        core::Label::new(&label.name, &label.value)
    }
}

impl From<&core::LabelSet> for LabelSet {
    fn from(set: &core::LabelSet) -> Self {
        Self {
            labels: set.labels().iter().map(Label::from).collect(),
        }
    }
}

impl From<&LabelSet> for core::LabelSet {
    fn from(set: &LabelSet) -> Self {
        core::LabelSet::new(set.labels.iter().map(core::Label::from).collect())
    }
}

/// Wire labels of a series, as a core label set.
pub fn label_set_from_wire(labels: &[Label]) -> core::LabelSet {
    core::LabelSet::new(labels.iter().map(core::Label::from).collect())
}

/// Core label set as wire labels.
pub fn label_set_to_wire(set: &core::LabelSet) -> Vec<Label> {
    set.labels().iter().map(Label::from).collect()
}

impl TryFrom<&LabelMatcher> for Matcher {
    type Error = core::Error;

    fn try_from(matcher: &LabelMatcher) -> core::Result<Self> {
        let op = match matcher.r#type() {
            label_matcher::Type::Eq => MatcherOp::Equal,
            label_matcher::Type::Neq => MatcherOp::NotEqual,
            label_matcher::Type::Re => MatcherOp::Regex,
            label_matcher::Type::Nre => MatcherOp::NotRegex,
        };
        Matcher::new(op, &matcher.name, &matcher.value)
    }
}

impl From<&Matcher> for LabelMatcher {
    fn from(matcher: &Matcher) -> Self {
        let r#type = match matcher.op {
            MatcherOp::Equal => label_matcher::Type::Eq,
            MatcherOp::NotEqual => label_matcher::Type::Neq,
            MatcherOp::Regex => label_matcher::Type::Re,
            MatcherOp::NotRegex => label_matcher::Type::Nre,
        };
        Self {
            r#type: r#type as i32,
            name: matcher.name.clone(),
            value: matcher.value.clone(),
        }
    }
}

/// Convert wire matchers, rejecting the whole list on the first malformed
/// entry.
pub fn matchers_from_wire(matchers: &[LabelMatcher]) -> core::Result<Vec<Matcher>> {
    matchers.iter().map(Matcher::try_from).collect()
}

/// Convert core matchers to wire matchers.
pub fn matchers_to_wire(matchers: &[Matcher]) -> Vec<LabelMatcher> {
    matchers.iter().map(LabelMatcher::from).collect()
}

impl TsdbInfo {
    pub fn new(labels: &core::LabelSet, range: TimeRange) -> Self {
        Self {
            labels: Some(LabelSet::from(labels)),
            min_time: range.min_time,
            max_time: range.max_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_set_roundtrip() {
        let set = core::LabelSet::from_pairs([("b", "2"), ("a", "1")]);
        let wire = LabelSet::from(&set);
        assert_eq!(wire.labels[0].name, "a");
        assert_eq!(core::LabelSet::from(&wire), set);
    }

    #[test]
    fn test_matcher_conversion() {
        let wire = LabelMatcher {
            r#type: label_matcher::Type::Re as i32,
            name: "env".to_string(),
            value: "prod|staging".to_string(),
        };
        let matcher = Matcher::try_from(&wire).unwrap();
        assert!(matcher.matches("prod"));
        assert!(!matcher.matches("dev"));

        let back = LabelMatcher::from(&matcher);
        assert_eq!(back, wire);
    }

    #[test]
    fn test_invalid_matcher_rejected() {
        let wire = LabelMatcher {
            r#type: label_matcher::Type::Re as i32,
            name: "env".to_string(),
            value: "(".to_string(),
        };
        assert!(matchers_from_wire(&[wire]).is_err());
    }
}

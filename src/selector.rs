//! # Message Selectors
//!
//! Typed property predicates evaluated by the facade when a sample reaches a
//! consumer's reader. Only header properties are inspected, never the body.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::facade::{ContentFilter, MessagePayload, PayloadHeader};
use crate::message::PropertyValue;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Exists,
}

impl SelectorOp {
    fn symbol(&self) -> &'static str {
        match self {
            SelectorOp::Eq => "=",
            SelectorOp::Neq => "<>",
            SelectorOp::Gt => ">",
            SelectorOp::Gte => ">=",
            SelectorOp::Lt => "<",
            SelectorOp::Lte => "<=",
            SelectorOp::Exists => "IS NOT NULL",
        }
    }
}

/// `property op value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSelector {
    pub property: String,
    pub op: SelectorOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<PropertyValue>,
}

impl MessageSelector {
    /// Compare a property against a value
    pub fn new(property: impl Into<String>, op: SelectorOp, value: impl Into<PropertyValue>) -> Self {
        Self {
            property: property.into(),
            op,
            value: Some(value.into()),
        }
    }

    /// Match messages that carry the property at all
    pub fn exists(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            op: SelectorOp::Exists,
            value: None,
        }
    }

    /// Evaluate against a payload header
    pub fn matches(&self, header: &PayloadHeader) -> bool {
        let Some(actual) = header.properties.get(&self.property) else {
            return false;
        };
        if self.op == SelectorOp::Exists {
            return true;
        }
        let Some(expected) = &self.value else {
            return false;
        };

        match self.op {
            SelectorOp::Eq => values_equal(actual, expected),
            SelectorOp::Neq => !values_equal(actual, expected),
            SelectorOp::Gt | SelectorOp::Gte | SelectorOp::Lt | SelectorOp::Lte => {
                let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) else {
                    return false;
                };
                match self.op {
                    SelectorOp::Gt => a > b,
                    SelectorOp::Gte => a >= b,
                    SelectorOp::Lt => a < b,
                    _ => a <= b,
                }
            }
            SelectorOp::Exists => true,
        }
    }

    /// Facade filter evaluating this selector
    pub fn to_content_filter(&self) -> ContentFilter {
        let selector = self.clone();
        ContentFilter::new(self.to_string(), move |payload: &MessagePayload| {
            selector.matches(&payload.header)
        })
    }
}

/// Numbers compare by value across integer widths
fn values_equal(a: &PropertyValue, b: &PropertyValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

impl fmt::Display for MessageSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) if self.op != SelectorOp::Exists => {
                write!(f, "{} {} {}", self.property, self.op.symbol(), value)
            }
            _ => write!(f, "{} {}", self.property, self.op.symbol()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(props: &[(&str, PropertyValue)]) -> PayloadHeader {
        let mut header = PayloadHeader::default();
        for (k, v) in props {
            header.properties.insert(k.to_string(), v.clone());
        }
        header
    }

    #[test]
    fn test_equality_on_strings() {
        let selector = MessageSelector::new("region", SelectorOp::Eq, "emea");
        assert!(selector.matches(&header(&[("region", "emea".into())])));
        assert!(!selector.matches(&header(&[("region", "apac".into())])));
        assert!(!selector.matches(&header(&[])));
    }

    #[test]
    fn test_numeric_comparison_across_widths() {
        let selector = MessageSelector::new("attempt", SelectorOp::Gte, 3);
        assert!(selector.matches(&header(&[("attempt", PropertyValue::Long(3))])));
        assert!(selector.matches(&header(&[("attempt", PropertyValue::Double(4.5))])));
        assert!(!selector.matches(&header(&[("attempt", PropertyValue::Short(2))])));
        assert!(!selector.matches(&header(&[("attempt", "three".into())])));
    }

    #[test]
    fn test_exists() {
        let selector = MessageSelector::exists("trace");
        assert!(selector.matches(&header(&[("trace", true.into())])));
        assert!(!selector.matches(&header(&[])));
    }

    #[test]
    fn test_display_is_selector_text() {
        assert_eq!(
            MessageSelector::new("region", SelectorOp::Neq, "emea").to_string(),
            "region <> 'emea'"
        );
        assert_eq!(MessageSelector::exists("trace").to_string(), "trace IS NOT NULL");
    }

    #[test]
    fn test_content_filter_uses_selector() {
        let filter = MessageSelector::new("n", SelectorOp::Lt, 10).to_content_filter();
        let mut payload = MessagePayload::default();
        payload.header = header(&[("n", 4.into())]);
        assert!(filter.accepts(&payload));
        assert_eq!(filter.expression(), "n < 10");
    }
}

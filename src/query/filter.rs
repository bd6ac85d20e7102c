// Filter Expressions - backend-agnostic boolean filters over entity attributes

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Equals,
    Contains,
    In,
    IsNull,
    IsNotNull,
    GreaterThan,
    GreaterThanOrEqualTo,
    LessThan,
    LessThanOrEqualTo,
    Between,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equals => "Equals",
            Operator::Contains => "Contains",
            Operator::In => "In",
            Operator::IsNull => "IsNull",
            Operator::IsNotNull => "IsNotNull",
            Operator::GreaterThan => "GreaterThan",
            Operator::GreaterThanOrEqualTo => "GreaterThanOrEqualTo",
            Operator::LessThan => "LessThan",
            Operator::LessThanOrEqualTo => "LessThanOrEqualTo",
            Operator::Between => "Between",
        }
    }

    /// IsNull / IsNotNull ignore the filter value
    pub fn needs_value(&self) -> bool {
        !matches!(self, Operator::IsNull | Operator::IsNotNull)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CombinationOperator {
    #[default]
    And,
    Or,
}

// ============================================================================
// FILTER + GROUP
// ============================================================================

/// Leaf condition: `field operator value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub field: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Filter {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<String>) -> Self {
        Filter {
            field: field.into(),
            operator,
            value: Some(value.into()),
        }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::new(field, Operator::Equals, value)
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Filter {
            field: field.into(),
            operator: Operator::IsNull,
            value: None,
        }
    }

    pub fn is_not_null(field: impl Into<String>) -> Self {
        Filter {
            field: field.into(),
            operator: Operator::IsNotNull,
            value: None,
        }
    }
}

/// Filters and nested groups joined by one combination operator
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterGroup {
    #[serde(default)]
    pub combination_operator: CombinationOperator,

    #[serde(default)]
    pub filters: Vec<Filter>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<FilterGroup>,
}

/// The root of a filter is just a group
pub type FilterExpression = FilterGroup;

impl FilterGroup {
    pub fn all(filters: Vec<Filter>) -> Self {
        FilterGroup {
            combination_operator: CombinationOperator::And,
            filters,
            groups: Vec::new(),
        }
    }

    pub fn any(filters: Vec<Filter>) -> Self {
        FilterGroup {
            combination_operator: CombinationOperator::Or,
            filters,
            groups: Vec::new(),
        }
    }

    /// Builder: nest a group
    pub fn with_group(mut self, group: FilterGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty() && self.groups.is_empty()
    }

    /// Total number of leaf filters, nested groups included
    pub fn filter_count(&self) -> usize {
        self.filters.len() + self.groups.iter().map(|g| g.filter_count()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_deserializes_from_api_shape() {
        let json = r#"{
            "combinationOperator": "Or",
            "filters": [
                {"field": "urn", "operator": "Equals", "value": "100"},
                {"field": "ukprn", "operator": "IsNull"}
            ],
            "groups": [
                {"filters": [{"field": "status", "operator": "In", "value": "open,closed"}]}
            ]
        }"#;

        let group: FilterGroup = serde_json::from_str(json).unwrap();
        assert_eq!(group.combination_operator, CombinationOperator::Or);
        assert_eq!(group.filters[1].value, None);
        assert_eq!(group.groups[0].combination_operator, CombinationOperator::And);
        assert_eq!(group.filter_count(), 3);
    }

    #[test]
    fn test_empty_group() {
        assert!(FilterGroup::default().is_empty());
        assert!(!FilterGroup::all(vec![Filter::is_null("urn")]).is_empty());
    }
}

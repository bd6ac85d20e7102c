// Query Compiler - FilterExpression + entity type + point in time -> Predicate
//
// All operator legality checks and value parsing happen here, once, against
// the attribute registry. Backends only render the resulting predicate tree.

use chrono::{DateTime, Utc};

use super::filter::{CombinationOperator, Filter, FilterExpression, FilterGroup, Operator};
use crate::attributes::{AttributeDefinition, AttributeRegistry, ScalarValue};
use crate::entities::EntityKey;
use crate::error::QueryError;

// ============================================================================
// PREDICATE TREE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    GreaterThan,
    GreaterThanOrEqualTo,
    LessThan,
    LessThanOrEqualTo,
}

/// Backend-neutral predicate over a registered entity version. Attribute
/// conditions hold for the version when some element of the attribute's value
/// array satisfies them.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),

    /// The attribute array holds `value`
    ArrayContains { field: String, value: ScalarValue },
    /// Some text element contains `fragment`
    ElementContains { field: String, fragment: String },
    ArrayEmpty { field: String },
    ArrayNotEmpty { field: String },
    ElementCompare {
        field: String,
        comparison: Comparison,
        value: ScalarValue,
    },
    /// A single element lies within [lower, upper]
    ElementInRange {
        field: String,
        lower: ScalarValue,
        upper: ScalarValue,
    },

    EntityTypeIs(String),
    /// valid_from <= T AND (valid_to IS NULL OR valid_to >= T)
    VisibleAt(DateTime<Utc>),
    /// The version has this snapshot among its members
    HasMember(EntityKey),
}

impl Predicate {
    /// Conditions every store query carries: entity type and visibility at T
    pub fn scoped(entity_type: &str, point_in_time: DateTime<Utc>, inner: Predicate) -> Predicate {
        Predicate::And(vec![
            Predicate::EntityTypeIs(entity_type.to_lowercase()),
            Predicate::VisibleAt(point_in_time),
            inner,
        ])
    }

    /// One AND group per member key, ORed, then ANDed with visibility at T
    pub fn any_member(keys: &[EntityKey], point_in_time: DateTime<Utc>) -> Predicate {
        let groups = keys
            .iter()
            .map(|k| {
                Predicate::And(vec![
                    Predicate::EntityTypeIs(k.entity_type.clone()),
                    Predicate::HasMember(k.clone()),
                ])
            })
            .collect();

        Predicate::And(vec![Predicate::VisibleAt(point_in_time), Predicate::Or(groups)])
    }
}

// ============================================================================
// COMPILER
// ============================================================================

pub struct QueryCompiler<'a> {
    registry: &'a AttributeRegistry,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(registry: &'a AttributeRegistry) -> Self {
        QueryCompiler { registry }
    }

    /// Compile a user filter and scope it to the entity type and point in time
    pub fn compile(
        &self,
        expression: &FilterExpression,
        entity_type: &str,
        point_in_time: DateTime<Utc>,
    ) -> Result<Predicate, QueryError> {
        let mut errors = Vec::new();
        let inner = self.compile_group(expression, entity_type, &mut errors);

        match (inner, errors.into_iter().next()) {
            (_, Some(err)) => Err(err),
            (Some(inner), None) => Ok(Predicate::scoped(entity_type, point_in_time, inner)),
            (None, None) => Err(QueryError::EmptyGroup),
        }
    }

    /// Every problem in the expression, for batch reporting
    pub fn validate(&self, expression: &FilterExpression, entity_type: &str) -> Vec<QueryError> {
        let mut errors = Vec::new();
        self.compile_group(expression, entity_type, &mut errors);
        errors
    }

    fn compile_group(
        &self,
        group: &FilterGroup,
        entity_type: &str,
        errors: &mut Vec<QueryError>,
    ) -> Option<Predicate> {
        if group.is_empty() {
            errors.push(QueryError::EmptyGroup);
            return None;
        }

        let mut children = Vec::with_capacity(group.filters.len() + group.groups.len());
        for filter in &group.filters {
            match self.compile_filter(filter, entity_type) {
                Ok(p) => children.push(p),
                Err(e) => errors.push(e),
            }
        }
        for nested in &group.groups {
            if let Some(p) = self.compile_group(nested, entity_type, errors) {
                children.push(p);
            }
        }

        Some(match group.combination_operator {
            CombinationOperator::And => Predicate::And(children),
            CombinationOperator::Or => Predicate::Or(children),
        })
    }

    fn compile_filter(&self, filter: &Filter, entity_type: &str) -> Result<Predicate, QueryError> {
        let attr = self
            .registry
            .searchable(entity_type, &filter.field)
            .ok_or_else(|| QueryError::UnknownField {
                field: filter.field.clone(),
                entity_type: entity_type.to_string(),
            })?;

        if !attr.type_.allows(filter.operator) {
            return Err(QueryError::InvalidOperatorForField {
                field: filter.field.clone(),
                operator: filter.operator.to_string(),
                valid: attr.valid_operator_list(),
            });
        }

        let field = attr.name.clone();
        let raw = filter.value.as_deref().unwrap_or("");
        if filter.operator.needs_value() && raw.trim().is_empty() {
            return Err(malformed(filter, "a value is required"));
        }

        let predicate = match filter.operator {
            Operator::Equals => Predicate::ArrayContains {
                value: parse(attr, filter, raw)?,
                field,
            },
            Operator::Contains => Predicate::ElementContains {
                fragment: raw.trim().to_lowercase(),
                field,
            },
            Operator::In => {
                let values = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(|v| parse(attr, filter, v))
                    .collect::<Result<Vec<_>, _>>()?;
                if values.is_empty() {
                    return Err(malformed(filter, "expected a comma separated list"));
                }
                Predicate::Or(
                    values
                        .into_iter()
                        .map(|value| Predicate::ArrayContains {
                            field: field.clone(),
                            value,
                        })
                        .collect(),
                )
            }
            Operator::IsNull => Predicate::ArrayEmpty { field },
            Operator::IsNotNull => Predicate::ArrayNotEmpty { field },
            Operator::GreaterThan => compare(field, Comparison::GreaterThan, parse(attr, filter, raw)?),
            Operator::GreaterThanOrEqualTo => {
                compare(field, Comparison::GreaterThanOrEqualTo, parse(attr, filter, raw)?)
            }
            Operator::LessThan => compare(field, Comparison::LessThan, parse(attr, filter, raw)?),
            Operator::LessThanOrEqualTo => {
                compare(field, Comparison::LessThanOrEqualTo, parse(attr, filter, raw)?)
            }
            Operator::Between => {
                let parts: Vec<&str> = raw.split(" to ").map(str::trim).collect();
                if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
                    return Err(malformed(filter, "expected '<lower> to <upper>'"));
                }
                let lower = parse(attr, filter, parts[0])?;
                let upper = parse(attr, filter, parts[1])?;
                if !in_order(&lower, &upper) {
                    return Err(malformed(filter, "lower bound is greater than upper bound"));
                }
                Predicate::ElementInRange { field, lower, upper }
            }
        };

        Ok(predicate)
    }
}

fn compare(field: String, comparison: Comparison, value: ScalarValue) -> Predicate {
    Predicate::ElementCompare {
        field,
        comparison,
        value,
    }
}

fn parse(attr: &AttributeDefinition, filter: &Filter, raw: &str) -> Result<ScalarValue, QueryError> {
    attr.type_
        .normalize(raw)
        .ok_or_else(|| malformed(filter, &format!("expected a {} value", attr.type_)))
}

fn in_order(lower: &ScalarValue, upper: &ScalarValue) -> bool {
    match (lower, upper) {
        (ScalarValue::Number(a), ScalarValue::Number(b)) => a <= b,
        (ScalarValue::Date(a), ScalarValue::Date(b)) => a <= b,
        (ScalarValue::Text(a), ScalarValue::Text(b)) => a <= b,
        _ => false,
    }
}

fn malformed(filter: &Filter, reason: &str) -> QueryError {
    QueryError::MalformedFilterValue {
        field: filter.field.clone(),
        value: filter.value.clone().unwrap_or_default(),
        reason: reason.to_string(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

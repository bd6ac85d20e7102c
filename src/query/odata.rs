// OData emitter - renders a Predicate as a search-engine filter expression
//
// Collection fields use lambda operators (`urn/any(x: x eq 100)`), empty
// collections are `not urn/any()`. Paging maps to $orderby/$skip/$top and
// the count shape sets $count with no paging.

use serde::Serialize;

use super::compiler::{Comparison, Predicate};
use super::QueryEmitter;
use crate::attributes::ScalarValue;
use crate::temporal::format_instant;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ODataRequest {
    #[serde(rename = "$filter")]
    pub filter: String,

    #[serde(rename = "$orderby", skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,

    #[serde(rename = "$skip", skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,

    #[serde(rename = "$top", skip_serializing_if = "Option::is_none")]
    pub top: Option<usize>,

    #[serde(rename = "$count")]
    pub count: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ODataEmitter;

impl ODataEmitter {
    pub fn filter(&self, predicate: &Predicate) -> String {
        render(predicate)
    }
}

impl QueryEmitter for ODataEmitter {
    type Query = ODataRequest;

    fn paged(&self, predicate: &Predicate, skip: usize, take: usize) -> ODataRequest {
        ODataRequest {
            filter: render(predicate),
            order_by: Some("id".to_string()),
            skip: Some(skip),
            top: Some(take),
            count: false,
        }
    }

    fn count(&self, predicate: &Predicate) -> ODataRequest {
        ODataRequest {
            filter: render(predicate),
            order_by: None,
            skip: None,
            top: Some(0),
            count: true,
        }
    }
}

fn render(predicate: &Predicate) -> String {
    match predicate {
        Predicate::And(children) => join(children, " and ", "true"),
        Predicate::Or(children) => join(children, " or ", "false"),

        Predicate::ArrayContains { field, value } => {
            format!("{}/any(x: x eq {})", field, literal(value))
        }
        Predicate::ElementContains { field, fragment } => {
            format!("{}/any(x: contains(x, {}))", field, quote(fragment))
        }
        Predicate::ArrayEmpty { field } => format!("not {}/any()", field),
        Predicate::ArrayNotEmpty { field } => format!("{}/any()", field),
        Predicate::ElementCompare {
            field,
            comparison,
            value,
        } => format!("{}/any(x: x {} {})", field, operator(*comparison), literal(value)),
        Predicate::ElementInRange {
            field,
            lower,
            upper,
        } => format!(
            "{}/any(x: x ge {} and x le {})",
            field,
            literal(lower),
            literal(upper)
        ),

        Predicate::EntityTypeIs(entity_type) => format!("entityType eq {}", quote(entity_type)),
        Predicate::VisibleAt(at) => {
            let at = format_instant(*at);
            format!("(validFrom le {} and (validTo eq null or validTo ge {}))", at, at)
        }
        Predicate::HasMember(key) => format!(
            "members/any(m: m/entityType eq {} and m/sourceSystemName eq {} and m/sourceSystemId eq {})",
            quote(&key.entity_type),
            quote(&key.source_system_name),
            quote(&key.source_system_id)
        ),
    }
}

fn join(children: &[Predicate], separator: &str, empty: &str) -> String {
    if children.is_empty() {
        return empty.to_string();
    }
    let parts: Vec<String> = children.iter().map(render).collect();
    format!("({})", parts.join(separator))
}

fn literal(value: &ScalarValue) -> String {
    match value {
        ScalarValue::Text(s) => quote(s),
        ScalarValue::Number(n) => n.to_string(),
        ScalarValue::Date(d) => format_instant(*d),
    }
}

/// Single quotes are escaped by doubling
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn operator(comparison: Comparison) -> &'static str {
    match comparison {
        Comparison::GreaterThan => "gt",
        Comparison::GreaterThanOrEqualTo => "ge",
        Comparison::LessThan => "lt",
        Comparison::LessThanOrEqualTo => "le",
    }
}

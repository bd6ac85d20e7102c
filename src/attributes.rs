// Attribute Registry - declared types for the well-known snapshot attributes
//
// Every snapshot carries its attributes as text. The registry declares how each
// well-known name is typed for query purposes, which filter operators are legal
// against it and how raw values are normalised before they are indexed or
// compared.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::query::Operator;

// ============================================================================
// ATTRIBUTE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeType {
    /// Free text, case-insensitive, supports substring search
    String,
    /// Closed vocabulary (status, type, ...), case-insensitive
    Enumeration,
    Number,
    Date,
}

impl AttributeType {
    /// Operators that can be compiled against a field of this type
    pub fn valid_operators(&self) -> &'static [Operator] {
        use Operator::*;
        match self {
            AttributeType::String => &[Equals, Contains, In, IsNull, IsNotNull],
            AttributeType::Enumeration => &[Equals, In, IsNull, IsNotNull],
            AttributeType::Number | AttributeType::Date => &[
                Equals,
                IsNull,
                IsNotNull,
                GreaterThan,
                GreaterThanOrEqualTo,
                LessThan,
                LessThanOrEqualTo,
                Between,
            ],
        }
    }

    pub fn allows(&self, operator: Operator) -> bool {
        self.valid_operators().contains(&operator)
    }

    /// Parse and normalise a raw value. Text is trimmed and lower-cased so that
    /// comparisons are case-insensitive on both sides.
    pub fn normalize(&self, raw: &str) -> Option<ScalarValue> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        match self {
            AttributeType::String | AttributeType::Enumeration => {
                Some(ScalarValue::Text(raw.to_lowercase()))
            }
            AttributeType::Number => raw
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(ScalarValue::Number),
            AttributeType::Date => parse_date(raw).map(ScalarValue::Date),
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttributeType::String => "string",
            AttributeType::Enumeration => "enumeration",
            AttributeType::Number => "number",
            AttributeType::Date => "date",
        };
        write!(f, "{}", name)
    }
}

/// Accepts ISO dates, RFC 3339 timestamps and the dd/mm/yyyy form some
/// source systems publish.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    ["%Y-%m-%d", "%d/%m/%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

// ============================================================================
// SCALAR VALUES
// ============================================================================

/// A normalised, typed attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Text(String),
    Number(f64),
    Date(DateTime<Utc>),
}

impl ScalarValue {
    /// JSON form used in the stored search index. Dates are kept as
    /// fixed-width RFC 3339 strings so they order lexically.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ScalarValue::Text(s) => serde_json::Value::String(s.clone()),
            ScalarValue::Number(n) => serde_json::json!(n),
            ScalarValue::Date(d) => serde_json::Value::String(crate::temporal::format_instant(*d)),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Text(s) => write!(f, "{}", s),
            ScalarValue::Number(n) => write!(f, "{}", n),
            ScalarValue::Date(d) => write!(f, "{}", crate::temporal::format_instant(*d)),
        }
    }
}

// ============================================================================
// ATTRIBUTE DEFINITION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeDefinition {
    /// Canonical camelCase name (e.g. "companiesHouseNumber")
    pub name: String,

    pub type_: AttributeType,

    pub description: String,

    /// Entity types this attribute is searchable for (empty = every type)
    pub searchable_for: Vec<String>,
}

impl AttributeDefinition {
    pub fn new(name: impl Into<String>, type_: AttributeType) -> Self {
        AttributeDefinition {
            name: name.into(),
            type_,
            description: String::new(),
            searchable_for: Vec::new(),
        }
    }

    /// Builder: add description
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Builder: restrict searchability to one entity type
    pub fn only_for(mut self, entity_type: impl Into<String>) -> Self {
        self.searchable_for.push(entity_type.into());
        self
    }

    pub fn is_searchable_for(&self, entity_type: &str) -> bool {
        self.searchable_for.is_empty()
            || self
                .searchable_for
                .iter()
                .any(|t| t.eq_ignore_ascii_case(entity_type))
    }

    /// Comma separated list of legal operators, for error messages
    pub fn valid_operator_list(&self) -> String {
        self.type_
            .valid_operators()
            .iter()
            .map(|op| op.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// ============================================================================
// ATTRIBUTE REGISTRY
// ============================================================================

/// Catalogue of the well-known attribute names. Lookups are case-insensitive,
/// so "Ukprn" and "ukprn" resolve to the same definition.
#[derive(Debug, Clone)]
pub struct AttributeRegistry {
    attributes: BTreeMap<String, AttributeDefinition>,
}

pub const LEARNING_PROVIDER: &str = "learning-provider";
pub const MANAGEMENT_GROUP: &str = "management-group";

impl AttributeRegistry {
    /// Create a registry holding every well-known attribute
    pub fn new() -> Self {
        let mut registry = AttributeRegistry {
            attributes: BTreeMap::new(),
        };

        registry.register_core_attributes();
        registry
    }

    fn register_core_attributes(&mut self) {
        use AttributeType::*;

        // ====================================================================
        // DESCRIPTIVE
        // ====================================================================
        self.register(
            AttributeDefinition::new("name", String).with_description("Display name"),
        );
        self.register(AttributeDefinition::new("type", Enumeration));
        self.register(AttributeDefinition::new("subType", Enumeration));
        self.register(
            AttributeDefinition::new("status", Enumeration)
                .with_description("Open, closed, proposed to open, ..."),
        );
        self.register(AttributeDefinition::new("openDate", Date));
        self.register(AttributeDefinition::new("closeDate", Date));

        // ====================================================================
        // CROSS-REFERENCE IDENTIFIERS
        // ====================================================================
        self.register(
            AttributeDefinition::new("urn", Number)
                .with_description("Unique reference number (establishments register)"),
        );
        self.register(
            AttributeDefinition::new("ukprn", Number)
                .with_description("UK provider reference number (provider register)"),
        );
        self.register(
            AttributeDefinition::new("uprn", Number)
                .with_description("Unique property reference number"),
        );
        self.register(AttributeDefinition::new("companiesHouseNumber", String));
        self.register(AttributeDefinition::new("charitiesCommissionNumber", String));
        self.register(AttributeDefinition::new("academyTrustCode", String));
        self.register(AttributeDefinition::new("dfeNumber", String));
        self.register(AttributeDefinition::new("localAuthorityCode", Enumeration));

        // ====================================================================
        // MANAGEMENT GROUP (denormalised onto providers)
        // ====================================================================
        self.register(
            AttributeDefinition::new("managementGroupType", Enumeration).only_for(LEARNING_PROVIDER),
        );
        self.register(
            AttributeDefinition::new("managementGroupId", String).only_for(LEARNING_PROVIDER),
        );
        self.register(
            AttributeDefinition::new("managementGroupCode", String).only_for(LEARNING_PROVIDER),
        );
        self.register(
            AttributeDefinition::new("managementGroupUkprn", Number).only_for(LEARNING_PROVIDER),
        );
        self.register(
            AttributeDefinition::new("managementGroupCompaniesHouseNumber", String)
                .only_for(LEARNING_PROVIDER),
        );
        self.register(
            AttributeDefinition::new("code", String)
                .with_description("Management group code")
                .only_for(MANAGEMENT_GROUP),
        );
        self.register(
            AttributeDefinition::new("identifier", String)
                .with_description("Management group identifier")
                .only_for(MANAGEMENT_GROUP),
        );
    }

    /// Register (or replace) an attribute
    pub fn register(&mut self, attr: AttributeDefinition) {
        self.attributes.insert(attr.name.to_lowercase(), attr);
    }

    /// Case-insensitive lookup
    pub fn get(&self, name: &str) -> Option<&AttributeDefinition> {
        self.attributes.get(&name.to_lowercase())
    }

    /// Lookup restricted to attributes searchable for `entity_type`
    pub fn searchable(&self, entity_type: &str, name: &str) -> Option<&AttributeDefinition> {
        self.get(name).filter(|a| a.is_searchable_for(entity_type))
    }

    pub fn list_all(&self) -> Vec<&AttributeDefinition> {
        self.attributes.values().collect()
    }

    pub fn count(&self) -> usize {
        self.attributes.len()
    }
}

impl Default for AttributeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

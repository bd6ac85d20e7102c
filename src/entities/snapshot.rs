// Entity Snapshot - one source system's current view of one thing
//
// The natural key is (type, source system name, source system id). Attributes
// are carried as text in a single bag; typed accessors below are derived views
// parsed on demand, never separate storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::link::LinkPointer;
use crate::attributes::parse_date;

// ============================================================================
// ENTITY KEY
// ============================================================================

/// Natural key of a snapshot. Source system names compare case-insensitively,
/// so they are lower-cased on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub entity_type: String,
    pub source_system_name: String,
    pub source_system_id: String,
}

impl EntityKey {
    pub fn new(
        entity_type: impl Into<String>,
        source_system_name: impl Into<String>,
        source_system_id: impl Into<String>,
    ) -> Self {
        EntityKey {
            entity_type: entity_type.into().to_lowercase(),
            source_system_name: source_system_name.into().to_lowercase(),
            source_system_id: source_system_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.entity_type, self.source_system_name, self.source_system_id
        )
    }
}

// ============================================================================
// ENTITY SNAPSHOT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    #[serde(rename = "type")]
    pub entity_type: String,

    pub source_system_name: String,

    pub source_system_id: String,

    /// Attribute bag keyed by lower-cased well-known name
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<LinkPointer>,
}

impl EntitySnapshot {
    pub fn new(
        entity_type: impl Into<String>,
        source_system_name: impl Into<String>,
        source_system_id: impl Into<String>,
    ) -> Self {
        EntitySnapshot {
            entity_type: entity_type.into().to_lowercase(),
            source_system_name: source_system_name.into().to_lowercase(),
            source_system_id: source_system_id.into(),
            attributes: BTreeMap::new(),
            links: Vec::new(),
        }
    }

    /// Builder: set an attribute
    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    /// Blank values are treated as absent and not stored
    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let name = name.to_lowercase();
        if value.trim().is_empty() {
            self.attributes.remove(&name);
        } else {
            self.attributes.insert(name, value);
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(
            &self.entity_type,
            &self.source_system_name,
            &self.source_system_id,
        )
    }

    pub fn is_same_entity(&self, other: &EntitySnapshot) -> bool {
        self.key() == other.key()
    }

    // ========================================================================
    // TYPED VIEWS
    // ========================================================================

    pub fn name(&self) -> Option<&str> {
        self.attribute("name")
    }

    pub fn status(&self) -> Option<&str> {
        self.attribute("status")
    }

    pub fn urn(&self) -> Option<i64> {
        self.number("urn")
    }

    pub fn ukprn(&self) -> Option<i64> {
        self.number("ukprn")
    }

    pub fn uprn(&self) -> Option<i64> {
        self.number("uprn")
    }

    pub fn companies_house_number(&self) -> Option<&str> {
        self.attribute("companiesHouseNumber")
    }

    pub fn open_date(&self) -> Option<DateTime<Utc>> {
        self.attribute("openDate").and_then(|d| parse_date(d.trim()))
    }

    pub fn close_date(&self) -> Option<DateTime<Utc>> {
        self.attribute("closeDate").and_then(|d| parse_date(d.trim()))
    }

    fn number(&self, name: &str) -> Option<i64> {
        self.attribute(name).and_then(|v| v.trim().parse().ok())
    }
}

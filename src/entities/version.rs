// Registered Entity Version - one time-bounded merge of a conceptual identity
//
// Versions are created, closed and deleted only by the reconciler. The
// searchable view of a version holds, for every attribute, the distinct
// normalised values across all members, because merged members may disagree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::link::LinkPointer;
use super::snapshot::{EntityKey, EntitySnapshot};
use crate::attributes::AttributeRegistry;
use crate::temporal::{format_instant, ValidityWindow};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredEntityVersion {
    pub id: String,

    #[serde(rename = "type")]
    pub entity_type: String,

    #[serde(flatten)]
    pub window: ValidityWindow,

    /// One snapshot per merged source contributor, ordered by key
    pub members: Vec<EntitySnapshot>,

    #[serde(default)]
    pub links: Vec<LinkPointer>,
}

impl RegisteredEntityVersion {
    /// Compose an open version. Members are deduplicated by natural key (the
    /// first occurrence wins) and the id is derived from type, member keys
    /// and start of validity, so replaying the same event reproduces it.
    pub fn compose(
        entity_type: &str,
        members: Vec<EntitySnapshot>,
        links: Vec<LinkPointer>,
        valid_from: DateTime<Utc>,
    ) -> Self {
        let mut unique: Vec<EntitySnapshot> = Vec::with_capacity(members.len());
        for member in members {
            if !unique.iter().any(|m| m.is_same_entity(&member)) {
                unique.push(member);
            }
        }
        unique.sort_by_key(|m| m.key());

        let mut links = links;
        links.sort();
        links.dedup();

        let entity_type = entity_type.to_lowercase();
        let id = Self::derive_id(&entity_type, unique.iter().map(|m| m.key()), valid_from);

        RegisteredEntityVersion {
            id,
            entity_type,
            window: ValidityWindow::open(valid_from),
            members: unique,
            links,
        }
    }

    pub fn derive_id(
        entity_type: &str,
        keys: impl Iterator<Item = EntityKey>,
        valid_from: DateTime<Utc>,
    ) -> String {
        let mut keys: Vec<String> = keys.map(|k| k.to_string()).collect();
        keys.sort();

        let mut hasher = Sha256::new();
        hasher.update(entity_type);
        for key in keys {
            hasher.update(b"|");
            hasher.update(key);
        }
        hasher.update(b"@");
        hasher.update(format_instant(valid_from));
        format!("{:x}", hasher.finalize())
    }

    pub fn valid_from(&self) -> DateTime<Utc> {
        self.window.valid_from
    }

    pub fn valid_to(&self) -> Option<DateTime<Utc>> {
        self.window.valid_to
    }

    pub fn is_current(&self) -> bool {
        self.window.is_current()
    }

    pub fn member_keys(&self) -> Vec<EntityKey> {
        self.members.iter().map(|m| m.key()).collect()
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.members.iter().any(|m| &m.key() == key)
    }

    pub fn member(&self, key: &EntityKey) -> Option<&EntitySnapshot> {
        self.members.iter().find(|m| &m.key() == key)
    }

    /// Per-attribute arrays of distinct normalised values. Every registered
    /// attribute is present, absent ones as empty arrays.
    pub fn search_index(&self, registry: &AttributeRegistry) -> BTreeMap<String, Vec<serde_json::Value>> {
        let mut index = BTreeMap::new();

        for attr in registry.list_all() {
            let mut values: Vec<serde_json::Value> = Vec::new();
            for member in &self.members {
                let normalized = member
                    .attribute(&attr.name)
                    .and_then(|raw| attr.type_.normalize(raw))
                    .map(|v| v.to_json());
                if let Some(value) = normalized {
                    if !values.contains(&value) {
                        values.push(value);
                    }
                }
            }
            index.insert(attr.name.to_lowercase(), values);
        }

        index
    }

    /// Best-known stable key: the first configured attribute any member
    /// carries, else the lowest member key.
    pub fn partition_key(&self, partition_attributes: &[String]) -> String {
        for attr in partition_attributes {
            for member in &self.members {
                if let Some(value) = member.attribute(attr) {
                    return format!("{}:{}", attr.to_lowercase(), value.trim());
                }
            }
        }

        self.members
            .iter()
            .map(|m| m.key().to_string())
            .min()
            .unwrap_or_else(|| self.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn gias() -> EntitySnapshot {
        EntitySnapshot::new("learning-provider", "gias", "100")
            .with_attribute("urn", "100")
            .with_attribute("name", "Oak Academy")
    }

    fn ukrlp() -> EntitySnapshot {
        EntitySnapshot::new("learning-provider", "ukrlp", "200")
            .with_attribute("ukprn", "200")
            .with_attribute("name", "OAK ACADEMY")
    }

    #[test]
    fn test_compose_dedupes_and_orders_members() {
        let newer = gias().with_attribute("status", "Open");
        let version = RegisteredEntityVersion::compose(
            "learning-provider",
            vec![newer.clone(), ukrlp(), gias()],
            vec![],
            t(1),
        );

        assert_eq!(version.members.len(), 2);
        assert_eq!(version.members[0].status(), Some("Open"));
        assert_eq!(version.members[1].source_system_name, "ukrlp");
        assert!(version.is_current());
    }

    #[test]
    fn test_id_is_deterministic() {
        let a = RegisteredEntityVersion::compose("learning-provider", vec![gias(), ukrlp()], vec![], t(1));
        let b = RegisteredEntityVersion::compose("learning-provider", vec![ukrlp(), gias()], vec![], t(1));
        let c = RegisteredEntityVersion::compose("learning-provider", vec![gias(), ukrlp()], vec![], t(2));

        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_search_index_holds_distinct_normalised_values() {
        let registry = AttributeRegistry::new();
        let version = RegisteredEntityVersion::compose("learning-provider", vec![gias(), ukrlp()], vec![], t(1));
        let index = version.search_index(&registry);

        assert_eq!(index["name"], vec![serde_json::json!("oak academy")]);
        assert_eq!(index["urn"], vec![serde_json::json!(100.0)]);
        assert_eq!(index["ukprn"], vec![serde_json::json!(200.0)]);
        assert!(index["uprn"].is_empty());
    }

    #[test]
    fn test_partition_key_prefers_configured_attributes() {
        let attrs = vec!["urn".to_string(), "ukprn".to_string()];
        let merged = RegisteredEntityVersion::compose("learning-provider", vec![gias(), ukrlp()], vec![], t(1));
        let ukrlp_only = RegisteredEntityVersion::compose("learning-provider", vec![ukrlp()], vec![], t(1));
        let bare = RegisteredEntityVersion::compose(
            "learning-provider",
            vec![EntitySnapshot::new("learning-provider", "x", "9")],
            vec![],
            t(1),
        );

        assert_eq!(merged.partition_key(&attrs), "urn:100");
        assert_eq!(ukrlp_only.partition_key(&attrs), "ukprn:200");
        assert_eq!(bare.partition_key(&attrs), "learning-provider:x:9");
    }
}

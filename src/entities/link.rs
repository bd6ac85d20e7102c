// Links - synonym and relationship links between snapshots
//
// A Link of type "Synonym" asserts that its members are the same real-world
// thing; any other type is a typed relation (e.g. management-group membership).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::snapshot::EntityKey;

pub const SYNONYM: &str = "Synonym";

/// Reference from a snapshot or version to a Link it participates in
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkPointer {
    pub link_type: String,
    pub link_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityLink {
    pub entity_type: String,
    pub source_system_name: String,
    pub source_system_id: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub created_reason: String,
}

impl EntityLink {
    pub fn new(
        key: &EntityKey,
        created_at: DateTime<Utc>,
        created_by: impl Into<String>,
        created_reason: impl Into<String>,
    ) -> Self {
        EntityLink {
            entity_type: key.entity_type.clone(),
            source_system_name: key.source_system_name.clone(),
            source_system_id: key.source_system_id.clone(),
            created_at,
            created_by: created_by.into(),
            created_reason: created_reason.into(),
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(
            &self.entity_type,
            &self.source_system_name,
            &self.source_system_id,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub id: String,

    #[serde(rename = "type")]
    pub link_type: String,

    /// Never holds two entries for the same (type, source, id)
    pub members: Vec<EntityLink>,
}

impl Link {
    /// Build a link whose id is derived from its type and member keys, so the
    /// same discovery made twice yields the same link.
    pub fn new(link_type: impl Into<String>, members: Vec<EntityLink>) -> Self {
        let link_type = link_type.into();
        let mut link = Link {
            id: String::new(),
            link_type,
            members: Vec::new(),
        };
        for member in members {
            link.add_member(member);
        }
        link.id = Link::derive_id(&link.link_type, link.members.iter().map(EntityLink::key));
        link
    }

    /// Returns false (and leaves the link untouched) for a duplicate member
    pub fn add_member(&mut self, member: EntityLink) -> bool {
        let key = member.key();
        if self.members.iter().any(|m| m.key() == key) {
            return false;
        }
        self.members.push(member);
        true
    }

    pub fn derive_id(link_type: &str, keys: impl Iterator<Item = EntityKey>) -> String {
        let mut keys: Vec<String> = keys.map(|k| k.to_string()).collect();
        keys.sort();
        keys.dedup();

        let mut hasher = Sha256::new();
        hasher.update(link_type.to_lowercase());
        for key in keys {
            hasher.update(b"|");
            hasher.update(key);
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn is_synonym(&self) -> bool {
        self.link_type.eq_ignore_ascii_case(SYNONYM)
    }

    pub fn pointer(&self) -> LinkPointer {
        LinkPointer {
            link_type: self.link_type.clone(),
            link_id: self.id.clone(),
        }
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.members.iter().any(|m| &m.key() == key)
    }
}

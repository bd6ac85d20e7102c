// 🏷️ Matching Rules - Rules as Data
// Matching profiles pair a source entity type with a candidate type and list
// rulesets of attribute-equality criteria, tried in order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::attributes::AttributeRegistry;
use crate::entities::{EntitySnapshot, SYNONYM};
use crate::query::{Filter, FilterGroup};

// ============================================================================
// RULESET
// ============================================================================

/// One attribute-equality test: source attribute == candidate attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub source: String,
    pub candidate: String,
}

impl Criterion {
    pub fn new(source: impl Into<String>, candidate: impl Into<String>) -> Self {
        Criterion {
            source: source.into(),
            candidate: candidate.into(),
        }
    }

    fn mirrored(&self) -> Self {
        Criterion {
            source: self.candidate.clone(),
            candidate: self.source.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingRuleset {
    /// Recorded as the match reason
    pub name: String,

    /// All criteria must hold (AND)
    pub criteria: Vec<Criterion>,
}

impl MatchingRuleset {
    pub fn new(name: impl Into<String>, criteria: Vec<Criterion>) -> Self {
        MatchingRuleset {
            name: name.into(),
            criteria,
        }
    }

    pub fn mirrored(&self) -> Self {
        MatchingRuleset {
            name: self.name.clone(),
            criteria: self.criteria.iter().map(Criterion::mirrored).collect(),
        }
    }

    /// Candidate search for `source`: Equals where the source has a value,
    /// IsNull where it does not, so "absent on both sides" still matches.
    pub fn filter_for(&self, source: &EntitySnapshot) -> FilterGroup {
        let filters = self
            .criteria
            .iter()
            .map(|c| match source.attribute(&c.source) {
                Some(value) => Filter::equals(&c.candidate, value),
                None => Filter::is_null(&c.candidate),
            })
            .collect();

        FilterGroup::all(filters)
    }

    /// Member-level check of a single candidate snapshot. Values are compared
    /// after normalisation for the candidate attribute's declared type.
    pub fn is_satisfied_by(
        &self,
        registry: &AttributeRegistry,
        source: &EntitySnapshot,
        candidate: &EntitySnapshot,
    ) -> bool {
        self.criteria.iter().all(|c| {
            let left = source.attribute(&c.source);
            let right = candidate.attribute(&c.candidate);

            match (left, right) {
                (None, None) => true,
                (Some(a), Some(b)) => match registry.get(&c.candidate) {
                    Some(attr) => match (attr.type_.normalize(a), attr.type_.normalize(b)) {
                        (Some(x), Some(y)) => x == y,
                        _ => false,
                    },
                    None => a.trim().eq_ignore_ascii_case(b.trim()),
                },
                _ => false,
            }
        })
    }
}

// ============================================================================
// PROFILE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingProfile {
    pub name: String,
    pub source_type: String,
    pub candidate_type: String,

    /// "Synonym" or a typed relation name
    #[serde(default = "default_link_type")]
    pub link_type: String,

    /// Tried in order; the first that yields results wins
    #[serde(default)]
    pub rulesets: Vec<MatchingRuleset>,
}

fn default_link_type() -> String {
    SYNONYM.to_string()
}

impl MatchingProfile {
    pub fn new(
        name: impl Into<String>,
        source_type: impl Into<String>,
        candidate_type: impl Into<String>,
        link_type: impl Into<String>,
    ) -> Self {
        MatchingProfile {
            name: name.into(),
            source_type: source_type.into(),
            candidate_type: candidate_type.into(),
            link_type: link_type.into(),
            rulesets: Vec::new(),
        }
    }

    pub fn with_ruleset(mut self, ruleset: MatchingRuleset) -> Self {
        self.rulesets.push(ruleset);
        self
    }

    pub fn is_synonym(&self) -> bool {
        self.link_type.eq_ignore_ascii_case(SYNONYM)
    }

    /// Swap source and candidate roles, including every criteria pair
    pub fn mirrored(&self) -> Self {
        MatchingProfile {
            name: self.name.clone(),
            source_type: self.candidate_type.clone(),
            candidate_type: self.source_type.clone(),
            link_type: self.link_type.clone(),
            rulesets: self.rulesets.iter().map(MatchingRuleset::mirrored).collect(),
        }
    }

    /// The profile as seen from `entity_type`. A profile whose source and
    /// candidate types are the same is used once, as written.
    pub fn oriented_for(&self, entity_type: &str) -> Option<MatchingProfile> {
        if self.source_type.eq_ignore_ascii_case(entity_type) {
            Some(self.clone())
        } else if self.candidate_type.eq_ignore_ascii_case(entity_type) {
            Some(self.mirrored())
        } else {
            None
        }
    }
}

// ============================================================================
// PROFILE SET
// ============================================================================

/// Read-only matching configuration, shared between workers without locking
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileSet {
    profiles: Vec<MatchingProfile>,
}

impl ProfileSet {
    pub fn new(profiles: Vec<MatchingProfile>) -> Self {
        ProfileSet { profiles }
    }

    /// Profiles that apply to `entity_type`, oriented so it is the source
    pub fn profiles_for(&self, entity_type: &str) -> Vec<MatchingProfile> {
        self.profiles
            .iter()
            .filter_map(|p| p.oriented_for(entity_type))
            .collect()
    }

    /// Every entity type named by a profile, lower-cased
    pub fn entity_types(&self) -> BTreeSet<String> {
        self.profiles
            .iter()
            .flat_map(|p| [p.source_type.to_lowercase(), p.candidate_type.to_lowercase()])
            .collect()
    }

    pub fn profiles(&self) -> &[MatchingProfile] {
        &self.profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Every structural problem, in profile order
    pub fn validate(&self, registry: &AttributeRegistry) -> Vec<String> {
        let mut problems = Vec::new();

        for profile in &self.profiles {
            if profile.rulesets.is_empty() {
                problems.push(format!("profile '{}' has no rulesets", profile.name));
            }
            for ruleset in &profile.rulesets {
                if ruleset.criteria.is_empty() {
                    problems.push(format!(
                        "ruleset '{}' of profile '{}' has no criteria",
                        ruleset.name, profile.name
                    ));
                }
                for c in &ruleset.criteria {
                    if registry.searchable(&profile.source_type, &c.source).is_none() {
                        problems.push(format!(
                            "profile '{}': '{}' is not an attribute of {}",
                            profile.name, c.source, profile.source_type
                        ));
                    }
                    if registry.searchable(&profile.candidate_type, &c.candidate).is_none() {
                        problems.push(format!(
                            "profile '{}': '{}' is not an attribute of {}",
                            profile.name, c.candidate, profile.candidate_type
                        ));
                    }
                }
            }
        }

        problems
    }
}

// ============================================================================
// TESTS
// ============================================================================

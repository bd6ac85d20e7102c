// 🔍 Matcher - find synonyms and typed relations for a changed entity
//
// For each applicable profile, rulesets are tried in order and the first one
// that yields any candidate wins. Stored versions index merged attribute
// arrays, so every candidate member is re-checked against the ruleset on its
// own before it counts as a match.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::attributes::AttributeRegistry;
use crate::entities::{EntityKey, EntitySnapshot};
use crate::error::{QueryError, StoreError, SyncError};
use crate::repository::Repository;
use crate::rules::{MatchingProfile, MatchingRuleset, ProfileSet};

pub const DEFAULT_PAGE_SIZE: usize = 100;

// ============================================================================
// MATCH RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCandidate {
    pub profile: String,
    pub ruleset: String,
    pub link_type: String,

    /// The candidate member as stored in `version_id`
    pub candidate: EntitySnapshot,
    pub version_id: String,
}

impl MatchCandidate {
    pub fn key(&self) -> EntityKey {
        self.candidate.key()
    }

    /// "<profile>/<ruleset>", recorded on created links
    pub fn reason(&self) -> String {
        format!("{}/{}", self.profile, self.ruleset)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchResult {
    /// Deduplicated by candidate identity
    pub synonyms: Vec<MatchCandidate>,

    /// One entry per typed match
    pub links: Vec<MatchCandidate>,
}

impl MatchResult {
    pub fn is_empty(&self) -> bool {
        self.synonyms.is_empty() && self.links.is_empty()
    }
}

// ============================================================================
// MATCHER
// ============================================================================

pub struct Matcher {
    repository: Arc<dyn Repository>,
    profiles: Arc<ProfileSet>,
    registry: Arc<AttributeRegistry>,
    page_size: usize,
}

impl Matcher {
    pub fn new(
        repository: Arc<dyn Repository>,
        profiles: Arc<ProfileSet>,
        registry: Arc<AttributeRegistry>,
    ) -> Self {
        Matcher {
            repository,
            profiles,
            registry,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn profiles(&self) -> &ProfileSet {
        &self.profiles
    }

    /// Candidates for `source` among versions visible at `point_in_time`.
    /// The source itself is never returned.
    pub fn match_entity(
        &self,
        source: &EntitySnapshot,
        point_in_time: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<MatchResult, SyncError> {
        let source_key = source.key();
        let mut result = MatchResult::default();

        for profile in self.profiles.profiles_for(&source.entity_type) {
            for ruleset in &profile.rulesets {
                if cancel.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }

                let matches = self.run_ruleset(&profile, ruleset, source, &source_key, point_in_time, cancel)?;
                if matches.is_empty() {
                    continue;
                }

                debug!(
                    entity = %source_key,
                    profile = %profile.name,
                    ruleset = %ruleset.name,
                    count = matches.len(),
                    "ruleset matched"
                );

                for m in matches {
                    if profile.is_synonym() {
                        if !result.synonyms.iter().any(|s| s.key() == m.key()) {
                            result.synonyms.push(m);
                        }
                    } else {
                        result.links.push(m);
                    }
                }
                break;
            }
        }

        Ok(result)
    }

    fn run_ruleset(
        &self,
        profile: &MatchingProfile,
        ruleset: &MatchingRuleset,
        source: &EntitySnapshot,
        source_key: &EntityKey,
        point_in_time: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<MatchCandidate>, SyncError> {
        let filter = ruleset.filter_for(source);
        let mut matches = Vec::new();
        let mut skip = 0;

        loop {
            let page = match self.repository.search(
                &filter,
                &profile.candidate_type,
                point_in_time,
                skip,
                self.page_size,
                cancel,
            ) {
                Ok(page) => page,
                // A source value that cannot be parsed for the candidate
                // attribute's type can never be equal to a stored one
                Err(StoreError::Query(QueryError::MalformedFilterValue { field, value, .. })) => {
                    debug!(entity = %source_key, field = %field, value = %value, "unmatchable source value");
                    return Ok(Vec::new());
                }
                Err(err) => return Err(err.into()),
            };

            for version in &page.results {
                for member in &version.members {
                    if !member.entity_type.eq_ignore_ascii_case(&profile.candidate_type) {
                        continue;
                    }
                    if &member.key() == source_key {
                        continue;
                    }
                    if !ruleset.is_satisfied_by(&self.registry, source, member) {
                        continue;
                    }

                    matches.push(MatchCandidate {
                        profile: profile.name.clone(),
                        ruleset: ruleset.name.clone(),
                        link_type: profile.link_type.clone(),
                        candidate: member.clone(),
                        version_id: version.id.clone(),
                    });
                }
            }

            skip += page.results.len();
            if page.results.is_empty() || skip >= page.total_count {
                break;
            }
        }

        Ok(matches)
    }
}

// ============================================================================
// TESTS
// ============================================================================

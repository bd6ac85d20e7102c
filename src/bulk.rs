// Bulk matching - re-derive the whole link set at one point in time
//
// SnapshotCache   read-through copy of the store for one run, never shared
//                 across runs; attribute indexes are built on first use
// work queue      Mutex<VecDeque> of entities still to match
// accumulator     DashMap-backed link builder, locked per key by its shards
//
// Synonym edges are closed transitively when the run finishes, so a chain
// a~b, b~c yields one link {a, b, c}.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::attributes::AttributeRegistry;
use crate::entities::{EntityKey, EntityLink, EntitySnapshot, Link, SYNONYM};
use crate::error::{StoreError, SyncError};
use crate::matcher::DEFAULT_PAGE_SIZE;
use crate::reconciliation::CREATED_BY;
use crate::repository::Repository;
use crate::rules::{MatchingProfile, MatchingRuleset, ProfileSet};

// ============================================================================
// SNAPSHOT CACHE
// ============================================================================

/// Candidate indices by normalised attribute value
type ValueIndex = HashMap<String, Vec<usize>>;

pub struct SnapshotCache {
    repository: Arc<dyn Repository>,
    registry: Arc<AttributeRegistry>,
    point_in_time: DateTime<Utc>,
    page_size: usize,

    entities: DashMap<String, Arc<Vec<EntitySnapshot>>>,
    indexes: DashMap<(String, String), Arc<ValueIndex>>,
}

impl SnapshotCache {
    pub fn new(
        repository: Arc<dyn Repository>,
        registry: Arc<AttributeRegistry>,
        point_in_time: DateTime<Utc>,
    ) -> Self {
        SnapshotCache {
            repository,
            registry,
            point_in_time,
            page_size: DEFAULT_PAGE_SIZE,
            entities: DashMap::new(),
            indexes: DashMap::new(),
        }
    }

    pub fn point_in_time(&self) -> DateTime<Utc> {
        self.point_in_time
    }

    /// Every member snapshot of `entity_type` visible at the run's point in
    /// time, loaded from the store on first use
    pub fn entities(&self, entity_type: &str, cancel: &CancellationToken) -> Result<Arc<Vec<EntitySnapshot>>, StoreError> {
        let entity_type = entity_type.to_lowercase();
        if let Some(cached) = self.entities.get(&entity_type) {
            return Ok(Arc::clone(&cached));
        }

        let mut snapshots = Vec::new();
        let mut skip = 0;
        loop {
            let page = self
                .repository
                .list(&entity_type, self.point_in_time, skip, self.page_size, cancel)?;
            for version in &page.results {
                snapshots.extend(
                    version
                        .members
                        .iter()
                        .filter(|m| m.entity_type.eq_ignore_ascii_case(&entity_type))
                        .cloned(),
                );
            }
            skip += page.results.len();
            if page.results.is_empty() || skip >= page.total_count {
                break;
            }
        }

        debug!(entity_type = %entity_type, count = snapshots.len(), "loaded snapshot");
        let loaded = self
            .entities
            .entry(entity_type)
            .or_insert_with(|| Arc::new(snapshots))
            .clone();
        Ok(loaded)
    }

    /// Index of `entity_type` snapshots by the normalised value of `attribute`
    fn index(&self, entity_type: &str, attribute: &str, cancel: &CancellationToken) -> Result<Arc<ValueIndex>, StoreError> {
        let key = (entity_type.to_lowercase(), attribute.to_lowercase());
        if let Some(cached) = self.indexes.get(&key) {
            return Ok(Arc::clone(&cached));
        }

        let entities = self.entities(entity_type, cancel)?;
        let mut index = ValueIndex::new();
        for (i, snapshot) in entities.iter().enumerate() {
            if let Some(value) = snapshot.attribute(attribute).and_then(|raw| self.normalized(attribute, raw)) {
                index.entry(value).or_default().push(i);
            }
        }

        Ok(self.indexes.entry(key).or_insert_with(|| Arc::new(index)).clone())
    }

    /// `raw` normalised for the declared type of `attribute`
    fn normalized(&self, attribute: &str, raw: &str) -> Option<String> {
        match self.registry.get(attribute) {
            Some(attr) => attr.type_.normalize(raw).map(|v| v.to_string()),
            None => Some(raw.trim().to_lowercase()),
        }
    }

    /// Candidates of `candidate_type` satisfying `ruleset` for `source`
    fn candidates(
        &self,
        candidate_type: &str,
        ruleset: &MatchingRuleset,
        source: &EntitySnapshot,
        cancel: &CancellationToken,
    ) -> Result<Vec<EntitySnapshot>, StoreError> {
        let entities = self.entities(candidate_type, cancel)?;
        let source_key = source.key();

        // Narrow by the first criterion the source has a value for
        let anchor = ruleset
            .criteria
            .iter()
            .find_map(|c| source.attribute(&c.source).map(|raw| (c, raw)));

        let pool: Vec<usize> = match anchor {
            Some((c, raw)) => {
                let Some(value) = self.normalized(&c.candidate, raw) else {
                    return Ok(Vec::new());
                };
                self.index(candidate_type, &c.candidate, cancel)?
                    .get(&value)
                    .cloned()
                    .unwrap_or_default()
            }
            None => (0..entities.len()).collect(),
        };

        Ok(pool
            .into_iter()
            .map(|i| &entities[i])
            .filter(|c| c.key() != source_key)
            .filter(|c| ruleset.is_satisfied_by(&self.registry, source, c))
            .cloned()
            .collect())
    }
}

// ============================================================================
// LINK ACCUMULATOR
// ============================================================================

/// Append-only, thread-safe builder for the links found in one run
#[derive(Default)]
pub struct LinkAccumulator {
    /// Symmetric synonym adjacency
    synonyms: DashMap<EntityKey, BTreeSet<EntityKey>>,

    /// First reason recorded for each synonym member
    reasons: DashMap<EntityKey, String>,

    /// (link type, lower key, higher key) -> reason
    typed: DashMap<(String, EntityKey, EntityKey), String>,
}

impl LinkAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_synonym(&self, a: &EntityKey, b: &EntityKey, reason: &str) {
        self.synonyms.entry(a.clone()).or_default().insert(b.clone());
        self.synonyms.entry(b.clone()).or_default().insert(a.clone());
        self.reasons.entry(a.clone()).or_insert_with(|| reason.to_string());
        self.reasons.entry(b.clone()).or_insert_with(|| reason.to_string());
    }

    /// Typed links are undirected; a mirrored discovery of the same pair is
    /// recorded once
    pub fn add_typed(&self, link_type: &str, a: &EntityKey, b: &EntityKey, reason: &str) {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        self.typed
            .entry((link_type.to_string(), low.clone(), high.clone()))
            .or_insert_with(|| reason.to_string());
    }

    /// Close synonym edges transitively and build the final links
    pub fn finish(&self, created_at: DateTime<Utc>) -> (Vec<Link>, Vec<Link>) {
        let adjacency: BTreeMap<EntityKey, BTreeSet<EntityKey>> = self
            .synonyms
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut seen: BTreeSet<EntityKey> = BTreeSet::new();
        let mut synonym_links = Vec::new();

        for start in adjacency.keys() {
            if seen.contains(start) {
                continue;
            }

            let mut component = Vec::new();
            let mut frontier = vec![start.clone()];
            while let Some(key) = frontier.pop() {
                if !seen.insert(key.clone()) {
                    continue;
                }
                if let Some(next) = adjacency.get(&key) {
                    frontier.extend(next.iter().filter(|k| !seen.contains(*k)).cloned());
                }
                component.push(key);
            }
            component.sort();

            let members = component
                .iter()
                .map(|k| {
                    let reason = self.reasons.get(k).map(|r| r.clone()).unwrap_or_default();
                    EntityLink::new(k, created_at, CREATED_BY, reason)
                })
                .collect();
            synonym_links.push(Link::new(SYNONYM, members));
        }

        let mut typed: Vec<_> = self
            .typed
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        typed.sort_by(|a, b| a.0.cmp(&b.0));

        let typed_links = typed
            .into_iter()
            .map(|((link_type, a, b), reason)| {
                Link::new(
                    link_type,
                    vec![
                        EntityLink::new(&a, created_at, CREATED_BY, reason.clone()),
                        EntityLink::new(&b, created_at, CREATED_BY, reason),
                    ],
                )
            })
            .collect();

        (synonym_links, typed_links)
    }
}

// ============================================================================
// BULK MATCHER
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkReport {
    pub point_in_time: DateTime<Utc>,
    pub entities: usize,
    pub synonym_links: Vec<Link>,
    pub links: Vec<Link>,
}

pub struct BulkMatcher {
    repository: Arc<dyn Repository>,
    profiles: Arc<ProfileSet>,
    registry: Arc<AttributeRegistry>,
    workers: usize,
}

impl BulkMatcher {
    pub fn new(
        repository: Arc<dyn Repository>,
        profiles: Arc<ProfileSet>,
        registry: Arc<AttributeRegistry>,
        workers: usize,
    ) -> Self {
        BulkMatcher {
            repository,
            profiles,
            registry,
            workers: workers.max(1),
        }
    }

    pub fn run(&self, point_in_time: DateTime<Utc>, cancel: &CancellationToken) -> Result<BulkReport, SyncError> {
        let cache = SnapshotCache::new(
            Arc::clone(&self.repository),
            Arc::clone(&self.registry),
            point_in_time,
        );

        // Load all reference data up front; workers only read it
        let mut work = VecDeque::new();
        for entity_type in self.profiles.entity_types() {
            work.extend(cache.entities(&entity_type, cancel)?.iter().cloned());
        }
        let entities = work.len();
        info!(entities, workers = self.workers, "bulk matching started");

        let work = Mutex::new(work);
        let accumulator = LinkAccumulator::new();
        let failure: Mutex<Option<StoreError>> = Mutex::new(None);
        let cancel = cancel.child_token();

        thread::scope(|scope| {
            for _ in 0..self.workers {
                scope.spawn(|| {
                    while !cancel.is_cancelled() {
                        let Some(source) = work.lock().pop_front() else {
                            break;
                        };
                        if let Err(err) = self.match_one(&cache, &accumulator, &source, &cancel) {
                            let mut slot = failure.lock();
                            if slot.is_none() {
                                *slot = Some(err);
                            }
                            cancel.cancel();
                        }
                    }
                });
            }
        });

        if let Some(err) = failure.into_inner() {
            return Err(err.into());
        }
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let (synonym_links, links) = accumulator.finish(point_in_time);
        info!(
            entities,
            synonym_links = synonym_links.len(),
            links = links.len(),
            "bulk matching finished"
        );

        Ok(BulkReport {
            point_in_time,
            entities,
            synonym_links,
            links,
        })
    }

    fn match_one(
        &self,
        cache: &SnapshotCache,
        accumulator: &LinkAccumulator,
        source: &EntitySnapshot,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let source_key = source.key();

        for profile in self.profiles.profiles_for(&source.entity_type) {
            if let Some((ruleset, found)) = first_match(cache, &profile, source, cancel)? {
                let reason = format!("{}/{}", profile.name, ruleset);
                for candidate in found {
                    if profile.is_synonym() {
                        accumulator.add_synonym(&source_key, &candidate.key(), &reason);
                    } else {
                        accumulator.add_typed(&profile.link_type, &source_key, &candidate.key(), &reason);
                    }
                }
            }
        }
        Ok(())
    }
}

/// The first ruleset of `profile` with any candidates, and those candidates
fn first_match(
    cache: &SnapshotCache,
    profile: &MatchingProfile,
    source: &EntitySnapshot,
    cancel: &CancellationToken,
) -> Result<Option<(String, Vec<EntitySnapshot>)>, StoreError> {
    for ruleset in &profile.rulesets {
        let found = cache.candidates(&profile.candidate_type, ruleset, source, cancel)?;
        if !found.is_empty() {
            return Ok(Some((ruleset.name.clone(), found)));
        }
    }
    Ok(None)
}

// ============================================================================
// TESTS
// ============================================================================

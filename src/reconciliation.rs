// ⚖️ Reconciliation Engine - fold one incoming snapshot into the versioned history
//
// For an item {entity, point in time T}:
//   1. match the entity against the store at T
//   2. compose the new version: entity + members of every synonym's version
//   3. close (ValidFrom < T) or delete (ValidFrom == T) the prior versions
//   4. carry the entity into later versions of the lineages it joined
//   5. write everything in one store call, under the locks of every key read
//
// Ordering keys off ValidFrom/ValidTo, not arrival order, so a late event
// slots into history between the versions around it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::entities::{EntityKey, EntityLink, EntitySnapshot, Link, RegisteredEntityVersion, SYNONYM};
use crate::error::SyncError;
use crate::locks::KeyedLocks;
use crate::matcher::{MatchResult, Matcher};
use crate::repository::{ChangeSet, Repository};
use crate::temporal::format_instant;

/// Recorded as CreatedBy on links the reconciler creates
pub const CREATED_BY: &str = "matcher";

// ============================================================================
// SYNC ITEM
// ============================================================================

/// One unit of queued work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItem {
    pub entity: EntitySnapshot,
    pub point_in_time: DateTime<Utc>,
}

impl SyncItem {
    pub fn new(entity: EntitySnapshot, point_in_time: DateTime<Utc>) -> Self {
        SyncItem {
            entity,
            point_in_time,
        }
    }
}

// ============================================================================
// RECONCILIATION REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub entity: String,
    pub point_in_time: String,

    /// Id of the newly composed version
    pub version_id: String,

    /// Ids of new versions (composed, plus a remnant when one was split off)
    pub upserted: Vec<String>,
    pub closed: Vec<String>,
    pub deleted: Vec<String>,

    pub synonyms: usize,
    pub links: usize,
}

impl ReconciliationReport {
    pub fn summary(&self) -> String {
        format!(
            "{} @ {}: version {}, {} new, {} closed, {} deleted, {} synonyms, {} links",
            self.entity,
            self.point_in_time,
            short_id(&self.version_id),
            self.upserted.len(),
            self.closed.len(),
            self.deleted.len(),
            self.synonyms,
            self.links
        )
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

// ============================================================================
// RECONCILER
// ============================================================================

pub struct Reconciler {
    repository: Arc<dyn Repository>,
    matcher: Matcher,

    /// Lower-cased entity types accepted for processing
    entity_types: BTreeSet<String>,

    /// Held over every natural key a reconciliation reads or rewrites
    locks: KeyedLocks<EntityKey>,
}

/// Everything one reconciliation will write, and the keys it depends on
struct Plan {
    changes: ChangeSet,
    report: ReconciliationReport,
    lineage: BTreeSet<EntityKey>,
}

enum Attempt {
    Stored(ReconciliationReport),
    Widen(BTreeSet<EntityKey>),
}

impl Reconciler {
    /// Types named by the matcher's profiles are always accepted; `extra_types`
    /// adds types that have no profile yet.
    pub fn new(
        repository: Arc<dyn Repository>,
        matcher: Matcher,
        extra_types: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut entity_types = matcher.profiles().entity_types();
        entity_types.extend(extra_types.into_iter().map(|t| t.to_lowercase()));

        Reconciler {
            repository,
            matcher,
            entity_types,
            locks: KeyedLocks::new(),
        }
    }

    pub fn entity_types(&self) -> &BTreeSet<String> {
        &self.entity_types
    }

    /// Plan under the locks of the keys known so far. When the plan touches
    /// a key outside that set, retake the locks over the wider set and plan
    /// again, so the write always happens under every key it reads.
    pub fn process(&self, item: &SyncItem, cancel: &CancellationToken) -> Result<ReconciliationReport, SyncError> {
        self.check_item(item)?;

        let mut keys = BTreeSet::from([item.entity.key()]);
        let report = loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let attempt = self.locks.with_locks(&keys, || -> Result<Attempt, SyncError> {
                let plan = self.plan(item, cancel)?;
                if !plan.lineage.is_subset(&keys) {
                    return Ok(Attempt::Widen(plan.lineage));
                }
                self.repository.store(&plan.changes, cancel)?;
                Ok(Attempt::Stored(plan.report))
            })?;

            match attempt {
                Attempt::Stored(report) => break report,
                Attempt::Widen(lineage) => {
                    debug!(
                        entity = %item.entity.key(),
                        keys = keys.len(),
                        lineage = lineage.len(),
                        "widening lineage locks"
                    );
                    keys.extend(lineage);
                }
            }
        };

        info!(
            entity = %report.entity,
            point_in_time = %report.point_in_time,
            version = short_id(&report.version_id),
            closed = report.closed.len(),
            deleted = report.deleted.len(),
            synonyms = report.synonyms,
            links = report.links,
            "reconciled"
        );
        Ok(report)
    }

    fn check_item(&self, item: &SyncItem) -> Result<(), SyncError> {
        let entity = &item.entity;

        if !self.entity_types.contains(&entity.entity_type.to_lowercase()) {
            return Err(SyncError::UnprocessableEvent(format!(
                "unrecognised entity type '{}'",
                entity.entity_type
            )));
        }
        if entity.source_system_name.trim().is_empty() || entity.source_system_id.trim().is_empty() {
            return Err(SyncError::UnprocessableEvent(format!(
                "{} entity is missing its source system name or id",
                entity.entity_type
            )));
        }
        Ok(())
    }

    fn plan(&self, item: &SyncItem, cancel: &CancellationToken) -> Result<Plan, SyncError> {
        let at = item.point_in_time;
        let entity = &item.entity;
        let key = entity.key();

        let matches = self.matcher.match_entity(entity, at, cancel)?;
        let own = self.repository.retrieve(&key, at, cancel)?;

        // Prior versions merged into the new one, one per synonym lineage
        let mut absorbed: Vec<RegisteredEntityVersion> = Vec::new();
        for synonym in &matches.synonyms {
            let synonym_key = synonym.key();
            if absorbed.iter().any(|v| v.contains(&synonym_key)) {
                continue;
            }
            let prior = match &own {
                Some(v) if v.contains(&synonym_key) => Some(v.clone()),
                _ => self.repository.retrieve(&synonym_key, at, cancel)?,
            };
            if let Some(prior) = prior {
                absorbed.push(prior);
            }
        }

        let own_absorbed = own
            .as_ref()
            .map_or(false, |o| absorbed.iter().any(|v| v.id == o.id));

        // Entity first so its new snapshot wins over the stored one
        let mut members = vec![entity.clone()];
        for version in &absorbed {
            members.extend(version.members.iter().cloned());
        }
        members.extend(matches.synonyms.iter().map(|s| s.candidate.clone()));

        let mut pointers: Vec<_> = absorbed.iter().flat_map(|v| v.links.iter().cloned()).collect();

        // Members of the entity's old lineage that it no longer matches keep
        // their own version
        let remnant_members: Vec<EntitySnapshot> = match &own {
            Some(o) if !own_absorbed => o
                .members
                .iter()
                .filter(|m| !m.is_same_entity(entity))
                .cloned()
                .collect(),
            _ => Vec::new(),
        };
        if let Some(o) = &own {
            if !own_absorbed && remnant_members.is_empty() {
                pointers.extend(o.links.iter().cloned());
            }
        }

        let mut composed = RegisteredEntityVersion::compose(&entity.entity_type, members, pointers, at);

        // The entity's own next known version bounds everything this event
        // writes for it
        let own_cap = match &own {
            Some(o) => o.valid_to().filter(|to| *to > at),
            None => self.next_start(&key, at, cancel)?,
        };

        // A late event ends where the next known version of any merged
        // lineage begins
        let cap = absorbed
            .iter()
            .filter_map(|v| v.valid_to())
            .filter(|to| *to > at)
            .chain(own_cap)
            .min();
        if let Some(cap) = cap {
            debug!(entity = %key, valid_to = %format_instant(cap), "late event, version inherits end of validity");
            composed.window.close(cap);
        }

        let links = self.new_links(&key, &composed, &matches, at);
        composed.links.extend(links.iter().map(Link::pointer));
        composed.links.sort();
        composed.links.dedup();

        let successors = self.successors(&key, &composed, &absorbed, own_cap, cancel)?;

        let mut changes = ChangeSet {
            links,
            ..ChangeSet::default()
        };
        let mut report = ReconciliationReport {
            entity: key.to_string(),
            point_in_time: format_instant(at),
            version_id: composed.id.clone(),
            synonyms: matches.synonyms.len(),
            links: matches.links.len(),
            ..ReconciliationReport::default()
        };

        let mut lineage: BTreeSet<EntityKey> = composed.member_keys().into_iter().collect();
        if let Some(o) = &own {
            lineage.extend(o.member_keys());
        }

        let own_only = own.iter().filter(|_| !own_absorbed);
        for prior in own_only.chain(absorbed.iter()) {
            if prior.valid_from() < at {
                let mut closed = prior.clone();
                closed.window.close(at);
                report.closed.push(closed.id.clone());
                changes.upserts.push(closed);
            } else {
                report.deleted.push(prior.id.clone());
                changes.deletes.push(prior.clone());
            }
        }

        if let Some(o) = &own {
            let remnant_members: Vec<EntitySnapshot> = remnant_members
                .into_iter()
                .filter(|m| !composed.contains(&m.key()))
                .collect();
            if !remnant_members.is_empty() {
                let mut remnant = RegisteredEntityVersion::compose(&o.entity_type, remnant_members, o.links.clone(), at);
                if let Some(to) = o.valid_to().filter(|to| *to > at) {
                    remnant.window.close(to);
                }
                debug!(entity = %key, remnant = short_id(&remnant.id), "split remnant lineage");
                report.upserted.push(remnant.id.clone());
                changes.upserts.push(remnant);
            }
        }

        // The entity joins the later versions of the lineage it merged into,
        // up to its own next version
        for successor in successors {
            lineage.extend(successor.member_keys());

            let mut members = successor.members.clone();
            members.push(entity.clone());
            let mut pointers = successor.links.clone();
            pointers.extend(composed.links.iter().filter(|p| p.link_type == SYNONYM).cloned());

            let mut carried =
                RegisteredEntityVersion::compose(&successor.entity_type, members, pointers, successor.valid_from());
            carried.window = successor.window;

            // The lineage outlives the entity's next own version: the tail
            // keeps the old members only
            if let Some(cap) = own_cap.filter(|cap| successor.valid_to().map_or(true, |to| to > *cap)) {
                carried.window.close(cap);
                let mut tail = RegisteredEntityVersion::compose(
                    &successor.entity_type,
                    successor.members.clone(),
                    successor.links.clone(),
                    cap,
                );
                tail.window.valid_to = successor.valid_to();
                report.upserted.push(tail.id.clone());
                changes.upserts.push(tail);
            }
            debug!(
                entity = %key,
                version = short_id(&carried.id),
                valid_from = %format_instant(carried.valid_from()),
                "carried into later lineage version"
            );

            report.deleted.push(successor.id.clone());
            report.upserted.push(carried.id.clone());
            changes.deletes.push(successor);
            changes.upserts.push(carried);
        }

        report.upserted.insert(0, composed.id.clone());
        changes.upserts.push(composed);

        Ok(Plan {
            changes,
            report,
            lineage,
        })
    }

    /// The unbroken run of versions that follow `composed` in the absorbed
    /// lineages, starting where `composed` ends and stopping at `own_cap`
    fn successors(
        &self,
        key: &EntityKey,
        composed: &RegisteredEntityVersion,
        absorbed: &[RegisteredEntityVersion],
        own_cap: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RegisteredEntityVersion>, SyncError> {
        let mut end = match composed.valid_to() {
            Some(end) if own_cap.map_or(true, |cap| end < cap) => end,
            _ => return Ok(Vec::new()),
        };

        let mut candidates: Vec<RegisteredEntityVersion> = Vec::new();
        let absorbed_keys: BTreeSet<EntityKey> = absorbed.iter().flat_map(|v| v.member_keys()).collect();
        for member in &absorbed_keys {
            for version in self.repository.history(member, cancel)? {
                let later = version.valid_from() >= end && own_cap.map_or(true, |cap| version.valid_from() < cap);
                if later && !version.contains(key) && !candidates.iter().any(|c| c.id == version.id) {
                    candidates.push(version);
                }
            }
        }
        candidates.sort_by(|a, b| a.valid_from().cmp(&b.valid_from()).then_with(|| a.id.cmp(&b.id)));

        let mut chain = Vec::new();
        while let Some(pos) = candidates.iter().position(|c| c.valid_from() == end) {
            let next = candidates.remove(pos);
            let next_end = next.valid_to();
            chain.push(next);
            match next_end {
                Some(to) if own_cap.map_or(true, |cap| to < cap) => end = to,
                _ => break,
            }
        }
        Ok(chain)
    }

    /// Start of the earliest stored version of `key` after `at`
    fn next_start(
        &self,
        key: &EntityKey,
        at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<DateTime<Utc>>, SyncError> {
        let history = self.repository.history(key, cancel)?;
        Ok(history
            .iter()
            .map(RegisteredEntityVersion::valid_from)
            .filter(|from| *from > at)
            .min())
    }

    /// A Synonym link over the composed members when anything merged, and a
    /// typed link per non-synonym match
    fn new_links(
        &self,
        key: &EntityKey,
        composed: &RegisteredEntityVersion,
        matches: &MatchResult,
        at: DateTime<Utc>,
    ) -> Vec<Link> {
        let mut links = Vec::new();

        if let Some(first) = matches.synonyms.first() {
            let members = composed
                .members
                .iter()
                .map(|m| {
                    let member_key = m.key();
                    let reason = matches
                        .synonyms
                        .iter()
                        .find(|s| s.key() == member_key)
                        .unwrap_or(first)
                        .reason();
                    EntityLink::new(&member_key, at, CREATED_BY, reason)
                })
                .collect();
            links.push(Link::new(SYNONYM, members));
        }

        for m in &matches.links {
            links.push(Link::new(
                m.link_type.clone(),
                vec![
                    EntityLink::new(key, at, CREATED_BY, m.reason()),
                    EntityLink::new(&m.key(), at, CREATED_BY, m.reason()),
                ],
            ));
        }

        links
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeRegistry;
    use crate::db::SqliteRepository;
    use crate::rules::{Criterion, MatchingProfile, MatchingRuleset, ProfileSet};
    use crate::error::StoreError;
    use crate::query::FilterExpression;
    use crate::repository::SearchResults;
    use crate::temporal::{validate_history, ValidityWindow};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;
    use std::time::Duration;

    const LP: &str = "learning-provider";
    const MG: &str = "management-group";

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn repository(registry: &Arc<AttributeRegistry>) -> SqliteRepository {
        SqliteRepository::open_in_memory(Arc::clone(registry), vec!["urn".to_string(), "ukprn".to_string()]).unwrap()
    }

    fn reconciler(repo: Arc<dyn Repository>, registry: Arc<AttributeRegistry>) -> Reconciler {
        let profiles = ProfileSet::new(vec![
            MatchingProfile::new("gias-ukrlp", LP, LP, SYNONYM)
                .with_ruleset(MatchingRuleset::new("by-ukprn", vec![Criterion::new("ukprn", "ukprn")])),
            MatchingProfile::new("provider-group", LP, MG, "ManagementGroup").with_ruleset(MatchingRuleset::new(
                "by-group-code",
                vec![Criterion::new("managementGroupCode", "code")],
            )),
        ]);
        let matcher = Matcher::new(Arc::clone(&repo), Arc::new(profiles), registry);
        Reconciler::new(repo, matcher, Vec::new())
    }

    fn setup() -> (Arc<SqliteRepository>, Reconciler) {
        let registry = Arc::new(AttributeRegistry::new());
        let repo = Arc::new(repository(&registry));
        let reconciler = reconciler(repo.clone(), registry);
        (repo, reconciler)
    }

    /// Holds every store call for `delay_ms` before delegating
    struct SlowStoreRepository {
        inner: SqliteRepository,
        delay_ms: AtomicU64,
    }

    impl Repository for SlowStoreRepository {
        fn retrieve(
            &self,
            key: &EntityKey,
            point_in_time: DateTime<Utc>,
            cancel: &CancellationToken,
        ) -> Result<Option<RegisteredEntityVersion>, StoreError> {
            self.inner.retrieve(key, point_in_time, cancel)
        }

        fn retrieve_batch(
            &self,
            keys: &[EntityKey],
            point_in_time: DateTime<Utc>,
            cancel: &CancellationToken,
        ) -> Result<Vec<RegisteredEntityVersion>, StoreError> {
            self.inner.retrieve_batch(keys, point_in_time, cancel)
        }

        fn search(
            &self,
            expression: &FilterExpression,
            entity_type: &str,
            point_in_time: DateTime<Utc>,
            skip: usize,
            take: usize,
            cancel: &CancellationToken,
        ) -> Result<SearchResults, StoreError> {
            self.inner.search(expression, entity_type, point_in_time, skip, take, cancel)
        }

        fn list(
            &self,
            entity_type: &str,
            point_in_time: DateTime<Utc>,
            skip: usize,
            take: usize,
            cancel: &CancellationToken,
        ) -> Result<SearchResults, StoreError> {
            self.inner.list(entity_type, point_in_time, skip, take, cancel)
        }

        fn store(&self, changes: &ChangeSet, cancel: &CancellationToken) -> Result<(), StoreError> {
            thread::sleep(Duration::from_millis(self.delay_ms.load(Ordering::SeqCst)));
            self.inner.store(changes, cancel)
        }

        fn retrieve_link(
            &self,
            link_type: &str,
            link_id: &str,
            cancel: &CancellationToken,
        ) -> Result<Option<Link>, StoreError> {
            self.inner.retrieve_link(link_type, link_id, cancel)
        }

        fn history(
            &self,
            key: &EntityKey,
            cancel: &CancellationToken,
        ) -> Result<Vec<RegisteredEntityVersion>, StoreError> {
            self.inner.history(key, cancel)
        }
    }

    fn gias(urn: &str) -> EntitySnapshot {
        EntitySnapshot::new(LP, "GIAS", urn).with_attribute("urn", urn)
    }

    fn ukrlp(ukprn: &str) -> EntitySnapshot {
        EntitySnapshot::new(LP, "UKRLP", ukprn).with_attribute("ukprn", ukprn)
    }

    fn process(reconciler: &Reconciler, entity: EntitySnapshot, at: DateTime<Utc>) -> ReconciliationReport {
        reconciler
            .process(&SyncItem::new(entity, at), &CancellationToken::new())
            .unwrap()
    }

    fn history(repo: &SqliteRepository, key: &EntityKey) -> Vec<RegisteredEntityVersion> {
        repo.history(key, &CancellationToken::new()).unwrap()
    }

    fn windows(versions: &[RegisteredEntityVersion]) -> Vec<ValidityWindow> {
        versions.iter().map(|v| v.window).collect()
    }

    fn assert_valid_history(repo: &SqliteRepository, key: &EntityKey) {
        let problems = validate_history(&windows(&history(repo, key)));
        assert!(problems.is_empty(), "{}: {:?}", key, problems);
    }

    fn member_ids(version: &RegisteredEntityVersion) -> Vec<String> {
        version.members.iter().map(|m| m.key().to_string()).collect()
    }

    #[test]
    fn test_single_entity_gets_one_open_version() {
        let (repo, reconciler) = setup();
        let report = process(&reconciler, gias("100"), t(1));

        assert_eq!(repo.version_count().unwrap(), 1);
        let versions = history(&repo, &gias("100").key());
        assert_eq!(versions.len(), 1);
        assert!(versions[0].is_current());
        assert_eq!(member_ids(&versions[0]), vec!["learning-provider:gias:100"]);
        assert_eq!(report.upserted, vec![versions[0].id.clone()]);
        assert!(report.closed.is_empty() && report.deleted.is_empty());
    }

    #[test]
    fn test_synonym_merge_closes_prior_and_opens_merged_version() {
        let (repo, reconciler) = setup();
        let gias_entity = gias("100").with_attribute("ukprn", "200");
        process(&reconciler, gias_entity.clone(), t(1));
        let report = process(&reconciler, ukrlp("200"), t(2));

        assert_eq!(report.synonyms, 1);
        assert_eq!(report.closed.len(), 1);

        let versions = history(&repo, &gias_entity.key());
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].valid_to(), Some(t(2)));
        assert_eq!(member_ids(&versions[0]), vec!["learning-provider:gias:100"]);
        assert!(versions[1].is_current());
        assert_eq!(versions[1].valid_from(), t(2));
        assert_eq!(
            member_ids(&versions[1]),
            vec!["learning-provider:gias:100", "learning-provider:ukrlp:200"]
        );

        // the synonym link is stored and pointed at
        let pointer = versions[1].links.iter().find(|p| p.link_type == SYNONYM).unwrap();
        let link = repo
            .retrieve_link(SYNONYM, &pointer.link_id, &CancellationToken::new())
            .unwrap()
            .unwrap();
        assert_eq!(link.members.len(), 2);
        assert!(link.members.iter().all(|m| m.created_by == CREATED_BY));
        assert_eq!(link.members[0].created_reason, "gias-ukrlp/by-ukprn");

        assert_valid_history(&repo, &gias_entity.key());
        assert_valid_history(&repo, &ukrlp("200").key());
    }

    #[test]
    fn test_same_instant_update_deletes_instead_of_zero_window() {
        let (repo, reconciler) = setup();
        let gias_entity = gias("100").with_attribute("ukprn", "200");
        process(&reconciler, gias_entity.clone(), t(1));
        let merged = process(&reconciler, ukrlp("200"), t(2));

        let renamed = gias_entity.clone().with_attribute("name", "Oak Academy");
        let report = process(&reconciler, renamed, t(2));

        assert_eq!(report.deleted, vec![merged.version_id.clone()]);
        assert!(report.closed.is_empty());

        let versions = history(&repo, &gias_entity.key());
        assert_eq!(versions.len(), 2);
        assert!(versions.iter().all(|v| !v.window.is_zero_length()));
        let current = versions.iter().find(|v| v.is_current()).unwrap();
        assert_eq!(current.valid_from(), t(2));
        assert_eq!(
            current.member(&gias_entity.key()).unwrap().name(),
            Some("Oak Academy")
        );
        assert_valid_history(&repo, &gias_entity.key());
    }

    #[test]
    fn test_redelivered_item_is_idempotent() {
        let (repo, reconciler) = setup();
        process(&reconciler, gias("100").with_attribute("ukprn", "200"), t(1));
        let first = process(&reconciler, ukrlp("200"), t(2));
        let count = repo.version_count().unwrap();

        let second = process(&reconciler, ukrlp("200"), t(2));
        assert_eq!(second.version_id, first.version_id);
        assert_eq!(repo.version_count().unwrap(), count);
        assert_valid_history(&repo, &ukrlp("200").key());
    }

    #[test]
    fn test_late_event_inherits_end_of_validity() {
        let (repo, reconciler) = setup();
        let key = gias("1").key();

        process(&reconciler, gias("1"), t(5));
        // arrives after the T5 event but happened before it
        let report = process(&reconciler, gias("1").with_attribute("name", "Early"), t(2));
        assert!(report.closed.is_empty());

        let versions = history(&repo, &key);
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].valid_from(), t(2));
        assert_eq!(versions[0].valid_to(), Some(t(5)));

        // and one landing inside a closed window splits it
        process(&reconciler, gias("1").with_attribute("name", "Middle"), t(3));
        let versions = history(&repo, &key);
        assert_eq!(versions.len(), 3);
        assert_eq!(versions[1].window.valid_from, t(3));
        assert_eq!(versions[1].valid_to(), Some(t(5)));
        assert_valid_history(&repo, &key);
    }

    #[test]
    fn test_unmatched_members_keep_a_remnant_version() {
        let (repo, reconciler) = setup();
        let gias_entity = gias("1").with_attribute("ukprn", "7");
        process(&reconciler, gias_entity.clone(), t(1));
        process(&reconciler, ukrlp("7"), t(2));

        // gias moves to a ukprn nobody else has
        let report = process(&reconciler, gias("1").with_attribute("ukprn", "8"), t(3));
        assert_eq!(report.upserted.len(), 2);

        let cancel = CancellationToken::new();
        let gias_now = repo.retrieve(&gias_entity.key(), t(4), &cancel).unwrap().unwrap();
        let ukrlp_now = repo.retrieve(&ukrlp("7").key(), t(4), &cancel).unwrap().unwrap();
        assert_eq!(member_ids(&gias_now), vec!["learning-provider:gias:1"]);
        assert_eq!(member_ids(&ukrlp_now), vec!["learning-provider:ukrlp:7"]);
        assert_eq!(ukrlp_now.valid_from(), t(3));

        assert_valid_history(&repo, &gias_entity.key());
        assert_valid_history(&repo, &ukrlp("7").key());
    }

    #[test]
    fn test_typed_link_is_created_and_pointed_at() {
        let (repo, reconciler) = setup();
        let group = EntitySnapshot::new(MG, "gias", "T7").with_attribute("code", "T7");
        process(&reconciler, group.clone(), t(1));

        let provider = gias("1").with_attribute("managementGroupCode", "t7");
        let report = process(&reconciler, provider.clone(), t(2));
        assert_eq!(report.links, 1);

        let version = repo
            .retrieve(&provider.key(), t(2), &CancellationToken::new())
            .unwrap()
            .unwrap();
        let pointer = version.links.iter().find(|p| p.link_type == "ManagementGroup").unwrap();
        let link = repo
            .retrieve_link("ManagementGroup", &pointer.link_id, &CancellationToken::new())
            .unwrap()
            .unwrap();
        assert!(link.contains(&group.key()));
        assert!(link.contains(&provider.key()));
        // typed links never merge versions
        assert_eq!(version.members.len(), 1);
    }

    #[test]
    fn test_unknown_type_is_unprocessable() {
        let (repo, reconciler) = setup();
        let item = SyncItem::new(EntitySnapshot::new("spaceship", "gias", "1"), t(1));
        let err = reconciler.process(&item, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, SyncError::UnprocessableEvent(_)));
        assert!(err.is_permanent());

        let item = SyncItem::new(EntitySnapshot::new(LP, "gias", " "), t(1));
        assert!(reconciler.process(&item, &CancellationToken::new()).unwrap_err().is_permanent());
        assert_eq!(repo.version_count().unwrap(), 0);
    }

    #[test]
    fn test_cancelled_item_writes_nothing() {
        let (repo, reconciler) = setup();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = reconciler.process(&SyncItem::new(gias("1"), t(1)), &cancel).unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(repo.version_count().unwrap(), 0);
    }

    #[test]
    fn test_concurrent_events_for_one_identity_keep_history_valid() {
        let (repo, reconciler) = setup();
        let reconciler = Arc::new(reconciler);

        let handles: Vec<_> = [3, 1, 4, 2]
            .into_iter()
            .map(|day| {
                let reconciler = Arc::clone(&reconciler);
                thread::spawn(move || {
                    let entity = gias("1").with_attribute("name", format!("day {}", day));
                    reconciler
                        .process(&SyncItem::new(entity, t(day)), &CancellationToken::new())
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let key = gias("1").key();
        assert_eq!(history(&repo, &key).len(), 4);
        assert_valid_history(&repo, &key);
    }

    #[test]
    fn test_events_for_two_members_of_one_lineage_are_serialised() {
        let registry = Arc::new(AttributeRegistry::new());
        let repo = Arc::new(SlowStoreRepository {
            inner: repository(&registry),
            delay_ms: AtomicU64::new(0),
        });
        let reconciler = reconciler(repo.clone(), registry);

        let gias_entity = gias("100").with_attribute("ukprn", "200");
        process(&reconciler, gias_entity.clone(), t(1));
        process(&reconciler, ukrlp("200"), t(2));

        // each writer sits on its store call long enough for the other to
        // read the lineage if nothing stops it
        repo.delay_ms.store(150, Ordering::SeqCst);
        let reconciler = Arc::new(reconciler);

        let renamed = gias_entity.clone().with_attribute("name", "Renamed");
        let first = {
            let reconciler = Arc::clone(&reconciler);
            thread::spawn(move || process(&reconciler, renamed, t(3)))
        };
        thread::sleep(Duration::from_millis(30));
        let second = {
            let reconciler = Arc::clone(&reconciler);
            thread::spawn(move || process(&reconciler, ukrlp("200").with_attribute("name", "Provider"), t(4)))
        };
        first.join().unwrap();
        second.join().unwrap();

        assert_valid_history(&repo.inner, &gias_entity.key());
        assert_valid_history(&repo.inner, &ukrlp("200").key());

        let open: Vec<_> = history(&repo.inner, &gias_entity.key())
            .into_iter()
            .filter(RegisteredEntityVersion::is_current)
            .collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].valid_from(), t(4));
        assert_eq!(
            member_ids(&open[0]),
            vec!["learning-provider:gias:100", "learning-provider:ukrlp:200"]
        );
        assert_eq!(open[0].member(&gias_entity.key()).unwrap().name(), Some("Renamed"));
    }

    #[test]
    fn test_late_synonym_joins_later_versions_of_the_lineage() {
        let (repo, reconciler) = setup();
        let gias_entity = gias("1").with_attribute("ukprn", "7");
        process(&reconciler, gias_entity.clone(), t(1));
        process(&reconciler, gias_entity.clone().with_attribute("name", "Renamed"), t(5));

        // happened at T3, arrives last
        let report = process(&reconciler, ukrlp("7"), t(3));
        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.deleted.len(), 1);

        let cancel = CancellationToken::new();
        let later = repo.retrieve(&ukrlp("7").key(), t(10), &cancel).unwrap().unwrap();
        assert!(later.is_current());
        assert_eq!(later.valid_from(), t(5));
        assert_eq!(member_ids(&later), vec!["learning-provider:gias:1", "learning-provider:ukrlp:7"]);
        assert_eq!(later.member(&gias_entity.key()).unwrap().name(), Some("Renamed"));
        assert!(later.links.iter().any(|p| p.link_type == SYNONYM));

        let ukrlp_history = history(&repo, &ukrlp("7").key());
        assert_eq!(ukrlp_history.len(), 2);
        assert_eq!(ukrlp_history[0].valid_from(), t(3));
        assert_eq!(ukrlp_history[0].valid_to(), Some(t(5)));
        assert_eq!(history(&repo, &gias_entity.key()).len(), 3);
        assert_valid_history(&repo, &gias_entity.key());
        assert_valid_history(&repo, &ukrlp("7").key());

        // redelivery changes nothing
        let count = repo.version_count().unwrap();
        process(&reconciler, ukrlp("7"), t(3));
        assert_eq!(repo.version_count().unwrap(), count);
        assert_valid_history(&repo, &ukrlp("7").key());
    }

    #[test]
    fn test_late_synonym_leaves_lineage_at_its_own_next_version() {
        let (repo, reconciler) = setup();
        let gias_entity = gias("1").with_attribute("ukprn", "7");
        process(&reconciler, gias_entity.clone(), t(1));
        process(&reconciler, gias_entity.clone().with_attribute("name", "Renamed"), t(5));
        // by T8 the provider record carries a ukprn nobody else has
        process(
            &reconciler,
            EntitySnapshot::new(LP, "UKRLP", "7").with_attribute("ukprn", "9"),
            t(8),
        );

        process(&reconciler, ukrlp("7"), t(3));

        let cancel = CancellationToken::new();
        let during = repo.retrieve(&ukrlp("7").key(), t(6), &cancel).unwrap().unwrap();
        assert_eq!(during.valid_from(), t(5));
        assert_eq!(during.valid_to(), Some(t(8)));
        assert!(during.contains(&gias_entity.key()));

        let after = repo.retrieve(&ukrlp("7").key(), t(9), &cancel).unwrap().unwrap();
        assert_eq!(member_ids(&after), vec!["learning-provider:ukrlp:7"]);
        let gias_after = repo.retrieve(&gias_entity.key(), t(9), &cancel).unwrap().unwrap();
        assert_eq!(member_ids(&gias_after), vec!["learning-provider:gias:1"]);
        assert_eq!(gias_after.valid_from(), t(8));
        assert!(gias_after.is_current());

        assert_valid_history(&repo, &gias_entity.key());
        assert_valid_history(&repo, &ukrlp("7").key());
    }

    #[test]
    fn test_report_summary() {
        let (_, reconciler) = setup();
        let report = process(&reconciler, gias("1"), t(1));
        assert!(report.summary().starts_with("learning-provider:gias:1 @ 2024-01-01"));
    }
}

// SQLite store - schema setup and the Repository implementation
//
// entity_versions  one row per stored version, JSON document + JSON search index
// entity_members   (version, member key) rows for point lookups by natural key
// links            stored Link documents
//
// The connection is long-lived and shared behind a mutex; each partition of a
// change set is written in its own transaction.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::attributes::AttributeRegistry;
use crate::entities::{EntityKey, Link, RegisteredEntityVersion};
use crate::error::StoreError;
use crate::query::{FilterExpression, Predicate, QueryCompiler, QueryEmitter, SqlQuery, SqliteEmitter};
use crate::repository::{ChangeSet, PartitionBatch, Repository, RetryPolicy, SearchResults, Throttle};
use crate::temporal::format_instant;

pub fn setup_database(conn: &Connection) -> anyhow::Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS entity_versions (
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            partition_key TEXT NOT NULL,
            valid_from TEXT NOT NULL,
            valid_to TEXT,
            document TEXT NOT NULL,
            search_index TEXT NOT NULL,
            stored_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS entity_members (
            version_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            source_system_name TEXT NOT NULL,
            source_system_id TEXT NOT NULL,
            PRIMARY KEY (version_id, entity_type, source_system_name, source_system_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS links (
            link_type TEXT NOT NULL,
            id TEXT NOT NULL,
            document TEXT NOT NULL,
            PRIMARY KEY (link_type, id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_versions_type_window
         ON entity_versions(entity_type, valid_from, valid_to)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_versions_partition ON entity_versions(partition_key)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_members_key
         ON entity_members(entity_type, source_system_name, source_system_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// SQLITE REPOSITORY
// ============================================================================

pub struct SqliteRepository {
    conn: Mutex<Connection>,
    registry: Arc<AttributeRegistry>,
    partition_attributes: Vec<String>,
    retry: RetryPolicy,
    throttle: Throttle,
}

impl SqliteRepository {
    pub fn open(
        path: &Path,
        registry: Arc<AttributeRegistry>,
        partition_attributes: Vec<String>,
        retry: RetryPolicy,
    ) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "opened registry database");
        Self::from_connection(conn, registry, partition_attributes, retry)
    }

    pub fn open_in_memory(
        registry: Arc<AttributeRegistry>,
        partition_attributes: Vec<String>,
    ) -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, registry, partition_attributes, RetryPolicy::default())
    }

    pub fn from_connection(
        conn: Connection,
        registry: Arc<AttributeRegistry>,
        partition_attributes: Vec<String>,
        retry: RetryPolicy,
    ) -> anyhow::Result<Self> {
        conn.busy_timeout(Duration::from_millis(250))?;
        setup_database(&conn)?;

        Ok(SqliteRepository {
            conn: Mutex::new(conn),
            registry,
            partition_attributes,
            retry,
            throttle: Throttle::new(),
        })
    }

    pub fn registry(&self) -> &AttributeRegistry {
        &self.registry
    }

    /// Number of stored versions (all windows)
    pub fn version_count(&self) -> anyhow::Result<i64> {
        let count = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM entity_versions", [], |row| row.get(0))?;
        Ok(count)
    }

    fn query_documents(&self, query: &SqlQuery, cancel: &CancellationToken) -> Result<Vec<RegisteredEntityVersion>, StoreError> {
        let documents: Vec<String> = self.retry.run(&self.throttle, cancel, || {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&query.sql)?;
            let rows = stmt
                .query_map(params_from_iter(query.params.iter()), |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        documents
            .iter()
            .map(|d| serde_json::from_str(d).map_err(StoreError::from))
            .collect()
    }

    fn query_count(&self, query: &SqlQuery, cancel: &CancellationToken) -> Result<usize, StoreError> {
        let count: i64 = self.retry.run(&self.throttle, cancel, || {
            let conn = self.conn.lock();
            let count = conn.query_row(&query.sql, params_from_iter(query.params.iter()), |row| row.get(0))?;
            Ok(count)
        })?;
        Ok(count.max(0) as usize)
    }

    fn run_paged(
        &self,
        predicate: &Predicate,
        skip: usize,
        take: usize,
        cancel: &CancellationToken,
    ) -> Result<SearchResults, StoreError> {
        let emitter = SqliteEmitter;
        let results = self.query_documents(&emitter.paged(predicate, skip, take), cancel)?;
        let total_count = self.query_count(&emitter.count(predicate), cancel)?;

        Ok(SearchResults {
            results,
            total_count,
        })
    }

    fn write_partition(&self, partition: &str, batch: &PartitionBatch) -> Result<(), StoreError> {
        let stored_at = format_instant(Utc::now());
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for version in &batch.deletes {
            tx.execute("DELETE FROM entity_members WHERE version_id = ?1", params![version.id])?;
            tx.execute("DELETE FROM entity_versions WHERE id = ?1", params![version.id])?;
        }

        for version in &batch.upserts {
            let document = serde_json::to_string(version)?;
            let search_index = serde_json::to_string(&version.search_index(&self.registry))?;

            tx.execute(
                "INSERT INTO entity_versions (
                    id, entity_type, partition_key, valid_from, valid_to, document, search_index, stored_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(id) DO UPDATE SET
                    partition_key = excluded.partition_key,
                    valid_from = excluded.valid_from,
                    valid_to = excluded.valid_to,
                    document = excluded.document,
                    search_index = excluded.search_index,
                    stored_at = excluded.stored_at",
                params![
                    version.id,
                    version.entity_type,
                    partition,
                    format_instant(version.valid_from()),
                    version.valid_to().map(format_instant),
                    document,
                    search_index,
                    stored_at,
                ],
            )?;

            tx.execute("DELETE FROM entity_members WHERE version_id = ?1", params![version.id])?;
            for key in version.member_keys() {
                tx.execute(
                    "INSERT OR IGNORE INTO entity_members (
                        version_id, entity_type, source_system_name, source_system_id
                    ) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        version.id,
                        key.entity_type,
                        key.source_system_name,
                        key.source_system_id
                    ],
                )?;
            }
        }

        for link in &batch.links {
            tx.execute(
                "INSERT OR REPLACE INTO links (link_type, id, document) VALUES (?1, ?2, ?3)",
                params![link.link_type.to_lowercase(), link.id, serde_json::to_string(link)?],
            )?;
        }

        tx.commit()?;
        Ok(())
    }
}

fn member_condition(key: &EntityKey) -> SqlQuery {
    SqliteEmitter.condition(&Predicate::HasMember(key.clone()))
}

impl Repository for SqliteRepository {
    fn retrieve(
        &self,
        key: &EntityKey,
        point_in_time: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<RegisteredEntityVersion>, StoreError> {
        let predicate = Predicate::And(vec![
            Predicate::EntityTypeIs(key.entity_type.clone()),
            Predicate::VisibleAt(point_in_time),
            Predicate::HasMember(key.clone()),
        ]);
        let mut query = SqliteEmitter.condition(&predicate);
        // Visibility is inclusive at valid_to, so a version closed at T and
        // its successor opened at T are both visible; prefer the successor.
        query.sql = format!(
            "SELECT v.document FROM entity_versions v WHERE {} ORDER BY v.valid_from DESC LIMIT 1",
            query.sql
        );

        Ok(self.query_documents(&query, cancel)?.into_iter().next())
    }

    fn retrieve_batch(
        &self,
        keys: &[EntityKey],
        point_in_time: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RegisteredEntityVersion>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = SqliteEmitter.condition(&Predicate::any_member(keys, point_in_time));
        query.sql = format!(
            "SELECT v.document FROM entity_versions v WHERE {} ORDER BY v.id",
            query.sql
        );
        self.query_documents(&query, cancel)
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
        let predicate = QueryCompiler::new(&self.registry).compile(expression, entity_type, point_in_time)?;
        debug!(entity_type, skip, take, "searching registry");
        self.run_paged(&predicate, skip, take, cancel)
    }

    fn list(
        &self,
        entity_type: &str,
        point_in_time: DateTime<Utc>,
        skip: usize,
        take: usize,
        cancel: &CancellationToken,
    ) -> Result<SearchResults, StoreError> {
        let predicate = Predicate::scoped(entity_type, point_in_time, Predicate::And(Vec::new()));
        self.run_paged(&predicate, skip, take, cancel)
    }

    fn store(&self, changes: &ChangeSet, cancel: &CancellationToken) -> Result<(), StoreError> {
        for (partition, batch) in changes.partitions(&self.partition_attributes) {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }

            self.retry
                .run(&self.throttle, cancel, || self.write_partition(&partition, &batch))?;

            debug!(
                partition = %partition,
                upserts = batch.upserts.len(),
                deletes = batch.deletes.len(),
                links = batch.links.len(),
                "partition committed"
            );
        }
        Ok(())
    }

    fn retrieve_link(
        &self,
        link_type: &str,
        link_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Link>, StoreError> {
        let document: Option<String> = self.retry.run(&self.throttle, cancel, || {
            let conn = self.conn.lock();
            let doc = conn
                .query_row(
                    "SELECT document FROM links WHERE link_type = ?1 AND id = ?2",
                    params![link_type.to_lowercase(), link_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(doc)
        })?;

        document
            .map(|d| serde_json::from_str(&d).map_err(StoreError::from))
            .transpose()
    }

    fn history(
        &self,
        key: &EntityKey,
        cancel: &CancellationToken,
    ) -> Result<Vec<RegisteredEntityVersion>, StoreError> {
        let mut query = member_condition(key);
        query.sql = format!(
            "SELECT v.document FROM entity_versions v WHERE {} ORDER BY v.valid_from, v.id",
            query.sql
        );
        self.query_documents(&query, cancel)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{EntityLink, EntitySnapshot, SYNONYM};
    use crate::query::{Filter, FilterGroup, Operator};
    use chrono::TimeZone;

    const LP: &str = "learning-provider";

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn repo() -> SqliteRepository {
        SqliteRepository::open_in_memory(
            Arc::new(AttributeRegistry::new()),
            vec!["urn".to_string(), "ukprn".to_string()],
        )
        .unwrap()
    }

    fn version(members: Vec<EntitySnapshot>, from: u32, to: Option<u32>) -> RegisteredEntityVersion {
        let mut v = RegisteredEntityVersion::compose(LP, members, vec![], t(from));
        if let Some(to) = to {
            v.window.close(t(to));
        }
        v
    }

    fn provider(source: &str, id: &str) -> EntitySnapshot {
        EntitySnapshot::new(LP, source, id)
    }

    fn upsert(repo: &SqliteRepository, versions: Vec<RegisteredEntityVersion>) {
        let changes = ChangeSet {
            upserts: versions,
            ..ChangeSet::default()
        };
        repo.store(&changes, &CancellationToken::new()).unwrap();
    }

    fn search_ids(repo: &SqliteRepository, group: FilterGroup, at: DateTime<Utc>) -> Vec<String> {
        let mut ids: Vec<String> = repo
            .search(&group, LP, at, 0, 100, &CancellationToken::new())
            .unwrap()
            .results
            .into_iter()
            .map(|v| v.members[0].source_system_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Five single-member versions, all open from day 1
    fn seeded() -> SqliteRepository {
        let repo = repo();
        upsert(
            &repo,
            vec![
                version(vec![provider("gias", "1").with_attribute("urn", "100").with_attribute("openDate", "2015-09-01")], 1, None),
                version(vec![provider("gias", "2").with_attribute("urn", "200").with_attribute("openDate", "2018-01-15")], 1, None),
                version(vec![provider("gias", "3").with_attribute("name", "Oak Primary School")], 1, None),
                version(
                    vec![
                        provider("gias", "4").with_attribute("urn", "100").with_attribute("openDate", "2010-01-01"),
                        provider("ukrlp", "4").with_attribute("urn", "400").with_attribute("openDate", "2022-06-30"),
                    ],
                    1,
                    None,
                ),
                version(vec![provider("gias", "5").with_attribute("status", "Closed")], 1, None),
            ],
        );
        repo
    }

    #[test]
    fn test_equals_matches_any_element_of_array() {
        let repo = seeded();
        let ids = search_ids(&repo, FilterGroup::all(vec![Filter::equals("urn", "100")]), t(5));
        assert_eq!(ids, vec!["1", "4"]);
    }

    #[test]
    fn test_is_null_matches_empty_arrays_only() {
        let repo = seeded();
        let ids = search_ids(&repo, FilterGroup::all(vec![Filter::is_null("urn")]), t(5));
        assert_eq!(ids, vec!["3", "5"]);

        let ids = search_ids(&repo, FilterGroup::all(vec![Filter::is_not_null("urn")]), t(5));
        assert_eq!(ids, vec!["1", "2", "4"]);
    }

    #[test]
    fn test_between_on_dates_needs_one_element_in_range() {
        let repo = seeded();
        let group = FilterGroup::all(vec![Filter::new("openDate", Operator::Between, "2015-01-01 to 2019-12-31")]);
        // version 4 has elements either side of the range but none inside it
        assert_eq!(search_ids(&repo, group, t(5)), vec!["1", "2"]);
    }

    #[test]
    fn test_contains_and_in_are_case_insensitive() {
        let repo = seeded();
        let ids = search_ids(&repo, FilterGroup::all(vec![Filter::new("name", Operator::Contains, "PRIMARY")]), t(5));
        assert_eq!(ids, vec!["3"]);

        let ids = search_ids(&repo, FilterGroup::all(vec![Filter::new("status", Operator::In, "open,CLOSED")]), t(5));
        assert_eq!(ids, vec!["5"]);
    }

    #[test]
    fn test_numeric_comparison() {
        let repo = seeded();
        let ids = search_ids(&repo, FilterGroup::all(vec![Filter::new("urn", Operator::GreaterThan, "150")]), t(5));
        assert_eq!(ids, vec!["2", "4"]);
    }

    #[test]
    fn test_or_group_with_nested_and() {
        let repo = seeded();
        let group = FilterGroup::any(vec![Filter::equals("urn", "200")])
            .with_group(FilterGroup::all(vec![Filter::is_null("urn"), Filter::is_not_null("status")]));
        assert_eq!(search_ids(&repo, group, t(5)), vec!["2", "5"]);
    }

    #[test]
    fn test_search_pages_and_counts() {
        let repo = seeded();
        let group = FilterGroup::all(vec![Filter::is_not_null("urn")]);
        let page = repo.search(&group, LP, t(5), 1, 1, &CancellationToken::new()).unwrap();
        assert_eq!(page.total_count, 3);
        assert_eq!(page.results.len(), 1);
    }

    #[test]
    fn test_point_in_time_visibility() {
        let repo = repo();
        upsert(
            &repo,
            vec![
                version(vec![provider("gias", "1").with_attribute("urn", "1")], 1, Some(5)),
                version(vec![provider("gias", "1").with_attribute("urn", "1"), provider("ukrlp", "9")], 5, None),
            ],
        );
        let cancel = CancellationToken::new();
        let key = EntityKey::new(LP, "gias", "1");

        assert!(repo.retrieve(&key, t(1) - chrono::Duration::days(1), &cancel).unwrap().is_none());
        assert_eq!(repo.retrieve(&key, t(3), &cancel).unwrap().unwrap().members.len(), 1);
        // both windows touch day 5; the successor wins
        assert_eq!(repo.retrieve(&key, t(5), &cancel).unwrap().unwrap().members.len(), 2);
        assert_eq!(repo.retrieve(&key, t(20), &cancel).unwrap().unwrap().members.len(), 2);

        let history = repo.history(&key, &cancel).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].valid_from() < history[1].valid_from());
    }

    #[test]
    fn test_retrieve_batch_returns_each_version_once() {
        let repo = seeded();
        let keys = vec![
            EntityKey::new(LP, "gias", "4"),
            EntityKey::new(LP, "ukrlp", "4"),
            EntityKey::new(LP, "gias", "2"),
            EntityKey::new(LP, "gias", "404"),
        ];
        let versions = repo.retrieve_batch(&keys, t(5), &CancellationToken::new()).unwrap();
        assert_eq!(versions.len(), 2);
    }

    #[test]
    fn test_store_deletes_and_links() {
        let repo = repo();
        let cancel = CancellationToken::new();
        let old = version(vec![provider("gias", "1").with_attribute("urn", "1")], 1, None);
        upsert(&repo, vec![old.clone()]);

        let link = Link::new(
            SYNONYM,
            vec![
                EntityLink::new(&EntityKey::new(LP, "gias", "1"), t(2), "matcher", "test"),
                EntityLink::new(&EntityKey::new(LP, "ukrlp", "2"), t(2), "matcher", "test"),
            ],
        );
        let merged = RegisteredEntityVersion::compose(
            LP,
            vec![provider("gias", "1").with_attribute("urn", "1"), provider("ukrlp", "2")],
            vec![link.pointer()],
            t(1),
        );
        let changes = ChangeSet {
            upserts: vec![merged],
            deletes: vec![old],
            links: vec![link.clone()],
        };
        repo.store(&changes, &cancel).unwrap();

        assert_eq!(repo.version_count().unwrap(), 1);
        let stored = repo.retrieve_link(SYNONYM, &link.id, &cancel).unwrap().unwrap();
        assert_eq!(stored.members.len(), 2);
    }

    #[test]
    fn test_cancelled_store_writes_nothing() {
        let repo = repo();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let changes = ChangeSet {
            upserts: vec![version(vec![provider("gias", "1")], 1, None)],
            ..ChangeSet::default()
        };
        assert!(matches!(repo.store(&changes, &cancel), Err(StoreError::Cancelled)));
        assert_eq!(repo.version_count().unwrap(), 0);
    }

    #[test]
    fn test_list_returns_visible_versions_of_type() {
        let repo = seeded();
        let page = repo.list(LP, t(5), 0, 100, &CancellationToken::new()).unwrap();
        assert_eq!(page.total_count, 5);
        let none = repo.list("management-group", t(5), 0, 100, &CancellationToken::new()).unwrap();
        assert_eq!(none.total_count, 0);
    }
}

// 🔎 Search API shape - request validation and paged responses
//
// Validation happens before the store is touched and reports every problem
// in one batch; an invalid request never reaches the repository.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::attributes::AttributeRegistry;
use crate::config::MAX_PAGE_SIZE;
use crate::entities::RegisteredEntityVersion;
use crate::error::StoreError;
use crate::query::{
    CombinationOperator, FilterExpression, FilterGroup, ODataEmitter, ODataRequest, QueryCompiler, QueryEmitter,
};
use crate::repository::Repository;

fn default_take() -> usize {
    25
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    #[serde(default)]
    pub groups: Vec<FilterGroup>,

    /// How the top-level groups combine
    #[serde(default)]
    pub combination_operator: CombinationOperator,

    /// Defaults to now
    #[serde(default)]
    pub point_in_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub skip: usize,

    #[serde(default = "default_take")]
    pub take: usize,
}

impl SearchRequest {
    pub fn new(groups: Vec<FilterGroup>) -> Self {
        SearchRequest {
            groups,
            combination_operator: CombinationOperator::And,
            point_in_time: None,
            skip: 0,
            take: default_take(),
        }
    }

    pub fn at(mut self, point_in_time: DateTime<Utc>) -> Self {
        self.point_in_time = Some(point_in_time);
        self
    }

    pub fn page(mut self, skip: usize, take: usize) -> Self {
        self.skip = skip;
        self.take = take;
        self
    }

    /// The groups folded under one root
    pub fn expression(&self) -> FilterExpression {
        FilterGroup {
            combination_operator: self.combination_operator,
            filters: Vec::new(),
            groups: self.groups.clone(),
        }
    }

    /// Every reason the request cannot run against `entity_type`
    pub fn validate(&self, registry: &AttributeRegistry, entity_type: &str) -> Vec<String> {
        let mut problems = Vec::new();

        if !(1..=MAX_PAGE_SIZE).contains(&self.take) {
            problems.push(format!("take must be between 1 and {}", MAX_PAGE_SIZE));
        }

        if self.groups.is_empty() {
            problems.push("at least one group is required".to_string());
            return problems;
        }

        let compiler = QueryCompiler::new(registry);
        for (i, group) in self.groups.iter().enumerate() {
            if group.filter_count() == 0 {
                problems.push(format!("group {} must have at least one filter", i));
                continue;
            }
            problems.extend(
                compiler
                    .validate(group, entity_type)
                    .into_iter()
                    .map(|e| e.to_string()),
            );
        }
        problems
    }

    /// Validate, then render the page as an OData search request instead of
    /// running it
    pub fn odata(&self, registry: &AttributeRegistry, entity_type: &str) -> Result<ODataRequest, SearchError> {
        let problems = self.validate(registry, entity_type);
        if !problems.is_empty() {
            return Err(SearchError::Invalid(problems));
        }

        let point_in_time = self.point_in_time.unwrap_or_else(Utc::now);
        let predicate = QueryCompiler::new(registry)
            .compile(&self.expression(), entity_type, point_in_time)
            .map_err(|err| SearchError::Invalid(vec![err.to_string()]))?;
        Ok(ODataEmitter.paged(&predicate, self.skip, self.take))
    }

    /// Validate, then run one page against the store
    pub fn execute(
        &self,
        repository: &dyn Repository,
        registry: &AttributeRegistry,
        entity_type: &str,
        cancel: &CancellationToken,
    ) -> Result<SearchResponse, SearchError> {
        let problems = self.validate(registry, entity_type);
        if !problems.is_empty() {
            return Err(SearchError::Invalid(problems));
        }

        let point_in_time = self.point_in_time.unwrap_or_else(Utc::now);
        let page = repository.search(
            &self.expression(),
            entity_type,
            point_in_time,
            self.skip,
            self.take,
            cancel,
        )?;

        debug!(
            entity_type,
            skip = self.skip,
            take = self.take,
            total = page.total_count,
            "search executed"
        );

        Ok(SearchResponse {
            taken: page.results.len(),
            results: page.results,
            skipped: self.skip,
            total_number_of_records: page.total_count,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub results: Vec<RegisteredEntityVersion>,
    pub skipped: usize,
    pub taken: usize,
    pub total_number_of_records: usize,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid search request: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::LEARNING_PROVIDER;
    use crate::db::SqliteRepository;
    use crate::entities::EntitySnapshot;
    use crate::query::{Filter, Operator};
    use crate::repository::ChangeSet;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: SearchRequest = serde_json::from_str(
            r#"{"groups": [{"filters": [{"field": "Ukprn", "operator": "Equals", "value": "100"}]}]}"#,
        )
        .unwrap();
        assert_eq!(request.take, 25);
        assert_eq!(request.skip, 0);
        assert!(request.point_in_time.is_none());
        assert!(request.validate(&AttributeRegistry::new(), LEARNING_PROVIDER).is_empty());
    }

    #[test]
    fn test_validation_is_batched() {
        let request = SearchRequest::new(vec![FilterGroup::all(vec![
            Filter::new("colour", Operator::Equals, "red"),
            Filter::new("ukprn", Operator::Between, "100"),
        ])])
        .page(0, 500);

        let problems = request.validate(&AttributeRegistry::new(), LEARNING_PROVIDER);
        assert_eq!(problems.len(), 3);
        assert!(problems[0].contains("take"));
        assert!(problems[1].contains("colour"));
        assert!(problems[2].contains("malformed"));
    }

    #[test]
    fn test_empty_groups_are_rejected() {
        let registry = AttributeRegistry::new();
        assert_eq!(
            SearchRequest::new(vec![]).validate(&registry, LEARNING_PROVIDER),
            vec!["at least one group is required".to_string()]
        );
        assert_eq!(
            SearchRequest::new(vec![FilterGroup::default()]).validate(&registry, LEARNING_PROVIDER),
            vec!["group 0 must have at least one filter".to_string()]
        );
    }

    #[test]
    fn test_empty_group_does_not_hide_problems_in_other_groups() {
        let request = SearchRequest::new(vec![
            FilterGroup::default(),
            FilterGroup::all(vec![
                Filter::new("colour", Operator::Equals, "red"),
                Filter::new("ukprn", Operator::Between, "100"),
            ]),
        ]);

        let problems = request.validate(&AttributeRegistry::new(), LEARNING_PROVIDER);
        assert_eq!(problems.len(), 3, "{:?}", problems);
        assert_eq!(problems[0], "group 0 must have at least one filter");
        assert!(problems[1].contains("colour"));
        assert!(problems[2].contains("malformed"));
    }

    #[test]
    fn test_odata_rendering_is_validated_and_paged() {
        let registry = AttributeRegistry::new();
        let request = SearchRequest::new(vec![FilterGroup::all(vec![Filter::new(
            "ukprn",
            Operator::Equals,
            "10012345",
        )])])
        .at(t(1))
        .page(10, 5);

        let odata = request.odata(&registry, LEARNING_PROVIDER).unwrap();
        assert!(odata.filter.contains("ukprn/any("));
        assert!(odata.filter.contains("10012345"));
        assert_eq!(odata.skip, Some(10));
        assert_eq!(odata.top, Some(5));
        assert!(!odata.count);

        let invalid = SearchRequest::new(vec![FilterGroup::all(vec![Filter::new("colour", Operator::Equals, "red")])]);
        assert!(matches!(
            invalid.odata(&registry, LEARNING_PROVIDER),
            Err(SearchError::Invalid(problems)) if problems.len() == 1
        ));
    }

    #[test]
    fn test_execute_pages_results() {
        let registry = Arc::new(AttributeRegistry::new());
        let repo = SqliteRepository::open_in_memory(Arc::clone(&registry), vec!["urn".to_string()]).unwrap();
        let cancel = CancellationToken::new();

        let upserts = (1..=3)
            .map(|i| {
                let snapshot = EntitySnapshot::new(LEARNING_PROVIDER, "gias", i.to_string())
                    .with_attribute("status", "Open");
                RegisteredEntityVersion::compose(LEARNING_PROVIDER, vec![snapshot], vec![], t(1))
            })
            .collect();
        repo.store(&ChangeSet { upserts, ..ChangeSet::default() }, &cancel).unwrap();

        let request = SearchRequest::new(vec![FilterGroup::all(vec![Filter::equals("status", "open")])])
            .at(t(2))
            .page(1, 1);
        let response = request.execute(&repo, &registry, LEARNING_PROVIDER, &cancel).unwrap();
        assert_eq!(response.total_number_of_records, 3);
        assert_eq!(response.skipped, 1);
        assert_eq!(response.taken, 1);

        let invalid = SearchRequest::new(vec![]).execute(&repo, &registry, LEARNING_PROVIDER, &cancel);
        assert!(matches!(invalid, Err(SearchError::Invalid(_))));
    }
}

// ⚙️ Registry Configuration - TOML file, defaults, validation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::attributes::{AttributeRegistry, LEARNING_PROVIDER, MANAGEMENT_GROUP};
use crate::db::SqliteRepository;
use crate::entities::SYNONYM;
use crate::error::ConfigError;
use crate::queue::SqliteQueue;
use crate::repository::RetryPolicy;
use crate::rules::{Criterion, MatchingProfile, MatchingRuleset, ProfileSet};
use crate::worker::WorkerOptions;

pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub count: usize,
    pub lease_seconds: u64,
    pub idle_poll_ms: u64,
    pub max_deliveries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let options = WorkerOptions::default();
        WorkerConfig {
            count: options.count,
            lease_seconds: options.lease.as_secs(),
            idle_poll_ms: options.idle_poll.as_millis() as u64,
            max_deliveries: options.max_deliveries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub database_path: PathBuf,

    /// Entity types accepted for reconciliation, on top of those named by
    /// the matching profiles
    pub entity_types: Vec<String>,

    /// Attributes tried in order when choosing a version's partition
    pub partition_attributes: Vec<String>,

    pub search_page_size: usize,

    pub workers: WorkerConfig,

    pub retry: RetryPolicy,

    pub profiles: Vec<MatchingProfile>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            database_path: PathBuf::from("registry.db"),
            entity_types: vec![LEARNING_PROVIDER.to_string(), MANAGEMENT_GROUP.to_string()],
            partition_attributes: vec!["urn".to_string(), "ukprn".to_string(), "uprn".to_string()],
            search_page_size: MAX_PAGE_SIZE,
            workers: WorkerConfig::default(),
            retry: RetryPolicy::default(),
            profiles: default_profiles(),
        }
    }
}

/// Providers cross-referenced between the establishments and provider
/// registers, and linked to their management group
fn default_profiles() -> Vec<MatchingProfile> {
    vec![
        MatchingProfile::new("gias-ukrlp", LEARNING_PROVIDER, LEARNING_PROVIDER, SYNONYM)
            .with_ruleset(MatchingRuleset::new("by-ukprn", vec![Criterion::new("ukprn", "ukprn")]))
            .with_ruleset(MatchingRuleset::new("by-urn", vec![Criterion::new("urn", "urn")])),
        MatchingProfile::new("provider-management-group", LEARNING_PROVIDER, MANAGEMENT_GROUP, "ManagementGroup")
            .with_ruleset(MatchingRuleset::new(
                "by-code",
                vec![Criterion::new("managementGroupCode", "code")],
            )),
    ]
}

impl RegistryConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: RegistryConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` when given, the defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Every problem at once
    pub fn validate(&self, registry: &AttributeRegistry) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.workers.count == 0 {
            problems.push("workers.count must be at least 1".to_string());
        }
        if self.workers.max_deliveries == 0 {
            problems.push("workers.max_deliveries must be at least 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if !(1..=MAX_PAGE_SIZE).contains(&self.search_page_size) {
            problems.push(format!(
                "search_page_size must be between 1 and {} (got {})",
                MAX_PAGE_SIZE, self.search_page_size
            ));
        }
        if self.entity_types.iter().any(|t| t.trim().is_empty()) {
            problems.push("entity_types must not contain blank names".to_string());
        }

        problems.extend(self.profile_set().validate(registry));

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { problems })
        }
    }

    pub fn profile_set(&self) -> ProfileSet {
        ProfileSet::new(self.profiles.clone())
    }

    pub fn open_repository(&self, registry: Arc<AttributeRegistry>) -> Result<SqliteRepository> {
        SqliteRepository::open(
            &self.database_path,
            registry,
            self.partition_attributes.clone(),
            self.retry.clone(),
        )
        .with_context(|| format!("failed to open registry database {}", self.database_path.display()))
    }

    /// The queue lives in the registry database file
    pub fn open_queue(&self) -> Result<SqliteQueue> {
        SqliteQueue::open(&self.database_path)
            .with_context(|| format!("failed to open work queue in {}", self.database_path.display()))
    }

    pub fn worker_options(&self, drain: bool) -> WorkerOptions {
        WorkerOptions {
            count: self.workers.count,
            lease: Duration::from_secs(self.workers.lease_seconds),
            idle_poll: Duration::from_millis(self.workers.idle_poll_ms),
            drain,
            max_deliveries: self.workers.max_deliveries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = RegistryConfig::default();
        assert!(config.validate(&AttributeRegistry::new()).is_ok());
        assert_eq!(config.profile_set().len(), 2);
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
database_path = "data/registry.db"
partition_attributes = ["ukprn"]
search_page_size = 50

[workers]
count = 2
lease_seconds = 60

[retry]
max_attempts = 3

[[profiles]]
name = "gias-ukrlp"
source_type = "learning-provider"
candidate_type = "learning-provider"
[[profiles.rulesets]]
name = "by-urn"
criteria = [{{ source = "urn", candidate = "urn" }}]
"#
        )
        .unwrap();

        let config = RegistryConfig::from_file(file.path()).unwrap();
        assert_eq!(config.database_path, PathBuf::from("data/registry.db"));
        assert_eq!(config.search_page_size, 50);
        assert_eq!(config.workers.count, 2);
        assert_eq!(config.workers.idle_poll_ms, 250);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.profiles.len(), 1);
        assert!(config.profiles[0].is_synonym());
        assert!(config.validate(&AttributeRegistry::new()).is_ok());

        let options = config.worker_options(true);
        assert_eq!(options.lease, Duration::from_secs(60));
        assert!(options.drain);
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let config = RegistryConfig {
            search_page_size: 0,
            workers: WorkerConfig {
                count: 0,
                ..WorkerConfig::default()
            },
            retry: RetryPolicy {
                max_attempts: 0,
                ..RetryPolicy::default()
            },
            profiles: vec![MatchingProfile::new("empty", LEARNING_PROVIDER, LEARNING_PROVIDER, SYNONYM)],
            ..RegistryConfig::default()
        };

        let err = config.validate(&AttributeRegistry::new()).unwrap_err();
        assert_eq!(err.problems.len(), 4);
        assert!(err.to_string().contains("profile 'empty' has no rulesets"));
    }

    #[test]
    fn test_repository_and_queue_share_the_database_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = RegistryConfig {
            database_path: dir.path().join("registry.db"),
            ..RegistryConfig::default()
        };

        let repo = config.open_repository(Arc::new(AttributeRegistry::new())).unwrap();
        let queue = config.open_queue().unwrap();
        assert_eq!(repo.version_count().unwrap(), 0);
        assert_eq!(queue.depth().unwrap(), 0);
        assert!(config.database_path.exists());
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = RegistryConfig::from_file(Path::new("/nonexistent/registry.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}

// Entity Registry - Core Library
// Temporal entity versions, rule-based matching and reconciliation.
// Exposes all modules for use in the CLI, the API server, and tests.

pub mod attributes;     // Semantic Layer - Attribute Registry
pub mod bulk;           // Bulk matching over a per-run snapshot
pub mod config;
pub mod db;             // SQLite repository
pub mod entities;       // Snapshots, versions, links
pub mod error;
pub mod ingest;         // CSV -> queue items
pub mod locks;
pub mod matcher;
pub mod query;          // Filter expressions -> backend queries
pub mod queue;          // Durable work queue
pub mod reconciliation; // Reconciliation Engine
pub mod repository;     // Storage port
pub mod rules;          // Matching Rules - Rules as Data
pub mod search;
pub mod temporal;       // Validity windows
pub mod worker;

// Re-export commonly used types
pub use attributes::{
    AttributeDefinition, AttributeRegistry, AttributeType, ScalarValue,
    LEARNING_PROVIDER, MANAGEMENT_GROUP,
};
pub use bulk::{BulkMatcher, BulkReport, LinkAccumulator, SnapshotCache};
pub use config::{RegistryConfig, WorkerConfig};
pub use db::{setup_database, SqliteRepository};
pub use entities::{
    EntityKey, EntityLink, EntitySnapshot, Link, LinkPointer, RegisteredEntityVersion, SYNONYM,
};
pub use error::{ConfigError, QueryError, StoreError, SyncError};
pub use ingest::load_csv;
pub use locks::KeyedLocks;
pub use matcher::{MatchCandidate, MatchResult, Matcher};
pub use query::{
    CombinationOperator, Filter, FilterExpression, FilterGroup, Operator, Predicate, QueryCompiler,
};
pub use queue::{QueuedItem, RejectedItem, SqliteQueue};
pub use reconciliation::{Reconciler, ReconciliationReport, SyncItem};
pub use repository::{ChangeSet, Repository, RetryPolicy, SearchResults};
pub use rules::{Criterion, MatchingProfile, MatchingRuleset, ProfileSet};
pub use search::{SearchError, SearchRequest, SearchResponse};
pub use temporal::ValidityWindow;
pub use worker::{WorkerOptions, WorkerPool, WorkerStats};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

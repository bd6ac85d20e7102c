// Repository Port - the store contract the matcher and reconciler depend on
//
// Store writes are atomic per partition only. Transient failures (throttling,
// timeouts) are retried by `RetryPolicy::run` with server-specified or
// exponential backoff; the retry-after deadline lives in a per-connection
// `Throttle`, never in global state.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::entities::{EntityKey, Link, RegisteredEntityVersion};
use crate::error::StoreError;
use crate::query::FilterExpression;

// ============================================================================
// PORT
// ============================================================================

/// One page of a search plus the total number of matching versions
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResults {
    pub results: Vec<RegisteredEntityVersion>,
    pub total_count: usize,
}

pub trait Repository: Send + Sync {
    /// The version holding `key` as a member at `point_in_time`
    fn retrieve(
        &self,
        key: &EntityKey,
        point_in_time: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<RegisteredEntityVersion>, StoreError>;

    /// Every version holding any of `keys` at `point_in_time`, each once
    fn retrieve_batch(
        &self,
        keys: &[EntityKey],
        point_in_time: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RegisteredEntityVersion>, StoreError>;

    fn search(
        &self,
        expression: &FilterExpression,
        entity_type: &str,
        point_in_time: DateTime<Utc>,
        skip: usize,
        take: usize,
        cancel: &CancellationToken,
    ) -> Result<SearchResults, StoreError>;

    /// Every version of `entity_type` visible at `point_in_time`, paged
    fn list(
        &self,
        entity_type: &str,
        point_in_time: DateTime<Utc>,
        skip: usize,
        take: usize,
        cancel: &CancellationToken,
    ) -> Result<SearchResults, StoreError>;

    fn store(&self, changes: &ChangeSet, cancel: &CancellationToken) -> Result<(), StoreError>;

    fn retrieve_link(
        &self,
        link_type: &str,
        link_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Link>, StoreError>;

    /// All stored versions that ever held `key`, oldest first
    fn history(
        &self,
        key: &EntityKey,
        cancel: &CancellationToken,
    ) -> Result<Vec<RegisteredEntityVersion>, StoreError>;
}

// ============================================================================
// CHANGE SET
// ============================================================================

/// Everything one reconciliation writes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub upserts: Vec<RegisteredEntityVersion>,
    pub deletes: Vec<RegisteredEntityVersion>,
    pub links: Vec<Link>,
}

/// The slice of a change set that must commit together
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionBatch {
    pub upserts: Vec<RegisteredEntityVersion>,
    pub deletes: Vec<RegisteredEntityVersion>,
    pub links: Vec<Link>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty() && self.links.is_empty()
    }

    /// Group the change set by partition key. A delete whose id is also
    /// upserted is dropped (the upsert replaces it), and each link travels
    /// with the first upserted version that points at it.
    pub fn partitions(&self, partition_attributes: &[String]) -> BTreeMap<String, PartitionBatch> {
        let mut batches: BTreeMap<String, PartitionBatch> = BTreeMap::new();
        let upserted: HashSet<&str> = self.upserts.iter().map(|v| v.id.as_str()).collect();

        for version in &self.deletes {
            if upserted.contains(version.id.as_str()) {
                continue;
            }
            batches
                .entry(version.partition_key(partition_attributes))
                .or_default()
                .deletes
                .push(version.clone());
        }

        for version in &self.upserts {
            batches
                .entry(version.partition_key(partition_attributes))
                .or_default()
                .upserts
                .push(version.clone());
        }

        for link in &self.links {
            let owner = self
                .upserts
                .iter()
                .find(|v| v.links.iter().any(|p| p.link_id == link.id))
                .map(|v| v.partition_key(partition_attributes))
                .unwrap_or_else(|| format!("link:{}", link.id));
            batches.entry(owner).or_default().links.push(link.clone());
        }

        batches
    }
}

// ============================================================================
// RETRY POLICY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given (1-based) attempt, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts or
    /// is cancelled. Cancellation is honoured while waiting.
    pub fn run<T>(
        &self,
        throttle: &Throttle,
        cancel: &CancellationToken,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            throttle.wait(cancel)?;
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }

            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = err.retry_after().unwrap_or_else(|| self.backoff(attempt));
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "transient store failure, backing off");
                    throttle.defer(delay);
                }
                Err(err) if err.is_transient() => {
                    return Err(StoreError::RetriesExhausted {
                        attempts: attempt,
                        last: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Retry-after deadline shared by every caller of one store connection
#[derive(Debug, Default)]
pub struct Throttle {
    until: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push the deadline out to at least now + `delay`
    pub fn defer(&self, delay: Duration) {
        let candidate = Instant::now() + delay;
        let mut until = self.until.lock();
        if until.map_or(true, |current| current < candidate) {
            *until = Some(candidate);
        }
    }

    /// Block until the deadline passes or the token is cancelled
    pub fn wait(&self, cancel: &CancellationToken) -> Result<(), StoreError> {
        let deadline = *self.until.lock();
        let Some(deadline) = deadline else {
            return Ok(());
        };

        let now = Instant::now();
        if deadline > now {
            debug!(wait_ms = (deadline - now).as_millis() as u64, "waiting out store throttle");
            sleep_cancellable(deadline - now, cancel)?;
        }
        Ok(())
    }
}

const SLEEP_SLICE: Duration = Duration::from_millis(10);

pub(crate) fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> Result<(), StoreError> {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! # Replica Configuration
//!
//! Everything a replica needs besides its collaborators (storage, transport,
//! election service, cipher). Defaults are documented constants; every value
//! can also come from the environment via [`ClusterConfig::from_env`].
//!
//! | Variable | Default |
//! |----------|---------|
//! | `CLUSTERDB_REPLICA_ID` | required |
//! | `CLUSTERDB_SEQUENCER_ID` | `<replica>/sequencer` |
//! | `CLUSTERDB_TOPIC_PREFIX` | `clusterdb` |
//! | `CLUSTERDB_POLL_BATCH_MAX` | 10000 |
//! | `CLUSTERDB_POLL_TIMEOUT_MS` | 1000 |
//! | `CLUSTERDB_RETRY_BASE_MS` | 1000 |
//! | `CLUSTERDB_RETRY_MAX_ATTEMPTS` | 3 |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::ReplicaId;

// =============================================================================
// Defaults
// =============================================================================

/// Prefix of the two log topics.
pub const DEFAULT_TOPIC_PREFIX: &str = "clusterdb";

/// Maximum records fetched per poll.
pub const DEFAULT_POLL_BATCH_MAX: usize = 10_000;

/// How long a poll waits for new records before returning empty.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1_000;

/// First retry delay for transport calls; doubles on every attempt.
pub const DEFAULT_RETRY_BASE_MS: u64 = 1_000;

/// Retries after the first failed attempt.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

/// Upper bound on a single retry delay.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Pending keys remembered for duplicate suppression on the unresolved log.
pub const DEFAULT_RESOLVED_ORIGIN_CACHE: usize = 65_536;

// =============================================================================
// Retry Policy
// =============================================================================

/// Exponential backoff for transport calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_retries: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            max_retries: DEFAULT_RETRY_MAX_ATTEMPTS,
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

// =============================================================================
// Cluster Configuration
// =============================================================================

/// Configuration of one replica process.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Identity stamped on everything this replica submits.
    pub replica_id: ReplicaId,

    /// Identity used while this process is the sequencer.
    pub sequencer_id: ReplicaId,

    /// Topics are `<prefix>-unresolved` and `<prefix>-resolved`.
    pub topic_prefix: String,

    pub poll_batch_max: usize,

    pub poll_timeout: Duration,

    pub retry: RetryPolicy,

    pub resolved_origin_cache: usize,
}

impl ClusterConfig {
    /// Configuration with defaults for everything but the replica id.
    pub fn new(replica_id: impl Into<ReplicaId>) -> Self {
        let replica_id = replica_id.into();
        Self {
            sequencer_id: default_sequencer_id(&replica_id),
            replica_id,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            poll_batch_max: DEFAULT_POLL_BATCH_MAX,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            retry: RetryPolicy::default(),
            resolved_origin_cache: DEFAULT_RESOLVED_ORIGIN_CACHE,
        }
    }

    /// Reads the configuration from `CLUSTERDB_*` environment variables.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if `CLUSTERDB_REPLICA_ID` is missing or a numeric
    /// variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let replica_id = lookup("CLUSTERDB_REPLICA_ID")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Config("CLUSTERDB_REPLICA_ID is not set".into()))?;

        let mut config = Self::new(replica_id);

        if let Some(id) = lookup("CLUSTERDB_SEQUENCER_ID").filter(|v| !v.is_empty()) {
            config.sequencer_id = ReplicaId::new(id);
        }
        if let Some(prefix) = lookup("CLUSTERDB_TOPIC_PREFIX").filter(|v| !v.is_empty()) {
            config.topic_prefix = prefix;
        }
        if let Some(max) = parse_var(&lookup, "CLUSTERDB_POLL_BATCH_MAX")? {
            config.poll_batch_max = max;
        }
        if let Some(ms) = parse_var(&lookup, "CLUSTERDB_POLL_TIMEOUT_MS")? {
            config.poll_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "CLUSTERDB_RETRY_BASE_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&lookup, "CLUSTERDB_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_retries = n;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks invariants between fields.
    pub fn validate(&self) -> Result<()> {
        if self.replica_id == self.sequencer_id {
            return Err(Error::Config(
                "sequencer id must differ from replica id".into(),
            ));
        }
        if self.poll_batch_max == 0 {
            return Err(Error::Config("poll batch max must be positive".into()));
        }
        if self.resolved_origin_cache == 0 {
            return Err(Error::Config("resolved origin cache must be positive".into()));
        }
        Ok(())
    }
}

fn default_sequencer_id(replica: &ReplicaId) -> ReplicaId {
    ReplicaId::new(format!("{}/sequencer", replica))
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has invalid value '{}'", name, raw))),
    }
}

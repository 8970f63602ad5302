//! Coordinator configuration

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tandem_common::NodeId;
use tandem_journal::JournalConfig;

/// Retry schedule for phase-two branch calls
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per branch, the first one included
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from the initial backoff.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// Configuration of a transaction manager
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Name of this coordinator node; transaction ids embed its hash
    pub node_id: String,

    pub default_transaction_timeout: Duration,

    /// Bound on every single call to a resource
    pub branch_call_timeout: Duration,

    /// Per-producer overrides of `branch_call_timeout`, by unique name
    pub resource_timeouts: HashMap<String, Duration>,

    pub commit_retry: RetryPolicy,

    /// Commit a lone branch in one phase, skipping prepare and the journal
    pub one_phase_optimization: bool,

    /// Prepare all branches concurrently
    pub parallel_prepare: bool,

    /// Period of the background recovery pass
    pub recovery_interval: Duration,

    /// Period of the transaction timeout watchdog
    pub timeout_check_interval: Duration,

    /// How long shutdown waits for in-flight transactions
    pub graceful_shutdown_interval: Duration,

    pub journal: JournalConfig,
}

impl CoordinatorConfig {
    pub fn node(&self) -> NodeId {
        NodeId::from_name(&self.node_id)
    }

    /// Call timeout for branches of the given producer.
    pub fn branch_timeout(&self, unique_name: &str) -> Duration {
        self.resource_timeouts
            .get(unique_name)
            .copied()
            .unwrap_or(self.branch_call_timeout)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: "tandem".to_string(),
            default_transaction_timeout: Duration::from_secs(60),
            branch_call_timeout: Duration::from_secs(30),
            resource_timeouts: HashMap::new(),
            commit_retry: RetryPolicy::default(),
            one_phase_optimization: false,
            parallel_prepare: false,
            recovery_interval: Duration::from_secs(60),
            timeout_check_interval: Duration::from_secs(1),
            graceful_shutdown_interval: Duration::from_secs(10),
            journal: JournalConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(50));
        assert_eq!(policy.backoff(2), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(200));
        assert_eq!(policy.backoff(10), Duration::from_secs(1));
    }

    #[test]
    fn test_per_resource_timeout_override() {
        let mut config = CoordinatorConfig::default();
        config
            .resource_timeouts
            .insert("slow-db".to_string(), Duration::from_secs(90));

        assert_eq!(config.branch_timeout("slow-db"), Duration::from_secs(90));
        assert_eq!(config.branch_timeout("orders"), Duration::from_secs(30));
    }
}

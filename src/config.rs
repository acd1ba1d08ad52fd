use crate::ledger::SchedulingPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry and timeout policy of the dispute coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Submissions attempted before giving up, the first one included.
    pub max_attempts: u32,
    /// Delay before the n-th retry is `n * backoff_ms`.
    pub backoff_ms: u64,
    pub mining_timeout_ms: u64,
    /// Added to the on-chain response window before treating it as elapsed.
    pub response_grace_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
            mining_timeout_ms: 30_000,
            response_grace_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(attempt as u64))
    }

    pub fn mining_timeout(&self) -> Duration {
        Duration::from_millis(self.mining_timeout_ms)
    }

    pub fn response_grace(&self) -> Duration {
        Duration::from_millis(self.response_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sent with every payload. Payloads from another major version are
    /// refused.
    pub wallet_version: String,
    pub scheduling_policy: SchedulingPolicy,
    /// States waiting for a missing predecessor, per channel.
    pub max_queued_states_per_channel: usize,
    /// Upper bound on crank rounds per inbound event.
    pub max_crank_iterations: usize,
    pub challenge: RetryConfig,
    /// Objectives without progress for this long are reported as stalled.
    pub objective_timeout_ms: u64,
    pub store_event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wallet_version: "channel-engine/0.1".into(),
            scheduling_policy: SchedulingPolicy::default(),
            max_queued_states_per_channel: 64,
            max_crank_iterations: 32,
            challenge: RetryConfig::default(),
            objective_timeout_ms: 60_000,
            store_event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn objective_timeout(&self) -> Duration {
        Duration::from_millis(self.objective_timeout_ms)
    }
}

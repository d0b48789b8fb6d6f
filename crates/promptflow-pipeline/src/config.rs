//! Execution configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{BackoffPolicy, JokerPolicy};

/// Usage ceilings for one run, nested pipeline calls included. Unset means
/// unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    pub max_price_usd: Option<f64>,
    pub max_total_tokens: Option<u64>,
    pub max_tool_calls: Option<u64>,
}

/// Configuration for a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Attempts per candidate task.
    pub max_attempts: usize,
    /// Upper bound on tasks in flight at once.
    pub max_parallel: usize,
    /// Per tool call; `None` waits indefinitely.
    #[serde(with = "crate::duration_serde::option", skip_serializing_if = "Option::is_none")]
    pub task_timeout: Option<Duration>,
    pub backoff: BackoffPolicy,
    pub joker_policy: JokerPolicy,
    pub limits: ExecutionLimits,
    /// Nesting bound for pipeline-call tasks.
    pub max_pipeline_depth: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_parallel: 5,
            task_timeout: None,
            backoff: BackoffPolicy::None,
            joker_policy: JokerPolicy::RetryThenFallback,
            limits: ExecutionLimits::default(),
            max_pipeline_depth: 8,
        }
    }
}

impl ExecutionConfig {
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn with_joker_policy(mut self, policy: JokerPolicy) -> Self {
        self.joker_policy = policy;
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// `max_parallel`, never below one.
    pub fn parallelism(&self) -> usize {
        self.max_parallel.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ExecutionConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.parallelism(), 5);
        assert_eq!(config.backoff, BackoffPolicy::None);
        assert_eq!(config.joker_policy, JokerPolicy::RetryThenFallback);
        assert_eq!(config.max_pipeline_depth, 8);
        assert_eq!(ExecutionConfig::default().with_max_parallel(0).parallelism(), 1);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ExecutionConfig = serde_json::from_str(
            r#"{"max_attempts": 1, "task_timeout": "30s", "joker_policy": "retry_every_candidate",
                "limits": {"max_tool_calls": 10}}"#,
        )
        .unwrap();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.max_parallel, 5);
        assert_eq!(config.task_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.joker_policy, JokerPolicy::RetryEveryCandidate);
        assert_eq!(config.limits.max_tool_calls, Some(10));
        assert_eq!(config.limits.max_price_usd, None);
    }
}

//! Retry and fallback policies for failed task attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff policy controlling the delay between attempts of one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Fixed delay between attempts.
    Fixed(#[serde(with = "crate::duration_serde")] Duration),
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential {
        #[serde(with = "crate::duration_serde")]
        base: Duration,
        #[serde(with = "crate::duration_serde")]
        max: Duration,
    },
    /// No delay between attempts.
    #[default]
    None,
}

impl BackoffPolicy {
    /// Compute the delay after a given failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let millis = (base.as_millis() as u64).saturating_mul(2u64.saturating_pow(attempt as u32));
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

/// How the attempt budget is spread over a task and its jokers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JokerPolicy {
    /// The primary task gets the full attempt budget; each joker is tried once.
    #[default]
    RetryThenFallback,
    /// Every candidate, primary or joker, gets the full attempt budget.
    RetryEveryCandidate,
}

impl JokerPolicy {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "retry-then-fallback" => Some(JokerPolicy::RetryThenFallback),
            "retry-every-candidate" => Some(JokerPolicy::RetryEveryCandidate),
            _ => None,
        }
    }

    /// Attempts a candidate gets, `max_attempts` being the configured budget.
    pub fn attempts_for(&self, is_joker: bool, max_attempts: usize) -> usize {
        let max_attempts = max_attempts.max(1);
        match self {
            JokerPolicy::RetryThenFallback if is_joker => 1,
            _ => max_attempts,
        }
    }
}

/// One entry of a task's attempt plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Task whose template is tried.
    pub task: String,
    pub is_joker: bool,
    pub attempts: usize,
}

/// The primary task followed by its jokers in declaration order.
pub fn candidate_plan(
    primary: &str,
    jokers: &[String],
    policy: JokerPolicy,
    max_attempts: usize,
) -> Vec<Candidate> {
    std::iter::once((primary, false))
        .chain(jokers.iter().map(|j| (j.as_str(), true)))
        .map(|(task, is_joker)| Candidate {
            task: task.to_string(),
            is_joker,
            attempts: policy.attempts_for(is_joker, max_attempts),
        })
        .collect()
}

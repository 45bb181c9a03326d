use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnect policy for the southbound handler.
///
/// The protocol default is a flat 5 s delay growing exponentially to a
/// 10 minute cap with a little jitter; attempts continue until a connect
/// succeeds or the handler is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Initial retry interval in milliseconds.
    #[serde(default = "RetryPolicy::default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    /// Maximum retry interval cap in milliseconds.
    #[serde(default = "RetryPolicy::default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Randomization factor in range [0.0, 1.0].
    #[serde(default = "RetryPolicy::default_randomization_factor")]
    pub randomization_factor: f64,

    /// Multiplicative factor for each retry step.
    #[serde(default = "RetryPolicy::default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: Self::default_initial_interval_ms(),
            max_interval_ms: Self::default_max_interval_ms(),
            randomization_factor: Self::default_randomization_factor(),
            multiplier: Self::default_multiplier(),
        }
    }
}

impl RetryPolicy {
    fn default_initial_interval_ms() -> u64 {
        5_000
    }

    fn default_max_interval_ms() -> u64 {
        600_000
    }

    fn default_randomization_factor() -> f64 {
        0.2
    }

    fn default_multiplier() -> f64 {
        2.0
    }

    /// A fast policy for tests.
    pub fn immediate() -> Self {
        Self {
            initial_interval_ms: 1,
            max_interval_ms: 10,
            randomization_factor: 0.0,
            multiplier: 1.0,
        }
    }
}

/// Build an `ExponentialBackoff` from a policy.
///
/// `max_elapsed_time` is disabled: reconnection never gives up, it only
/// slows down.
pub fn build_exponential_backoff(policy: &RetryPolicy) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(policy.initial_interval_ms.max(1)),
        max_interval: Duration::from_millis(policy.max_interval_ms.max(policy.initial_interval_ms)),
        randomization_factor: policy.randomization_factor.clamp(0.0, 1.0),
        multiplier: policy.multiplier.max(1.0),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

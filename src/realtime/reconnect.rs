//! # Reconnection Policy
//!
//! Exponential backoff with jitter, a bound on consecutive attempts, and a
//! circuit breaker that pauses retries once the bound is hit.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reconnection settings for channel subscriptions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// First retry delay
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for a single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor between attempts
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Fraction of the delay randomized in either direction (0.0 - 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Consecutive failures before the circuit opens
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Pause while the circuit is open; `None` gives up instead
    #[serde(default = "default_circuit_cooldown_secs")]
    pub circuit_cooldown_secs: Option<u64>,
}

fn default_initial_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.2
}
fn default_max_attempts() -> u32 {
    5
}
fn default_circuit_cooldown_secs() -> Option<u64> {
    Some(60)
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_attempts: default_max_attempts(),
            circuit_cooldown_secs: default_circuit_cooldown_secs(),
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before attempt `attempt` (1-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let millis = (self.initial_delay_ms as f64) * self.multiplier.powi(exp);
        Duration::from_millis(millis.min(self.max_delay_ms as f64) as u64)
    }

    /// Backoff before attempt `attempt` with jitter applied
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let spread = base * self.jitter.clamp(0.0, 1.0);
        if spread < 1.0 {
            return Duration::from_millis(base as u64);
        }
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((base + offset).max(0.0) as u64)
    }

    /// Circuit cooldown, if retries continue after the bound is hit
    pub fn cooldown(&self) -> Option<Duration> {
        self.circuit_cooldown_secs.map(Duration::from_secs)
    }
}

/// What a channel should do after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then try again
    Retry(Duration),
    /// Circuit opened: wait out the cooldown, then make one half-open attempt
    CircuitOpen(Duration),
    /// Stop retrying
    GiveUp,
}

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-channel failure bookkeeping
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    policy: ReconnectPolicy,
    failures: u32,
    state: CircuitState,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            state: CircuitState::Closed,
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Consecutive failures since the last success
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a successful open
    pub fn record_success(&mut self) {
        self.failures = 0;
        self.state = CircuitState::Closed;
    }

    /// Record a failure and decide what happens next
    pub fn record_failure(&mut self) -> RetryDecision {
        self.failures = self.failures.saturating_add(1);

        // A failed half-open probe reopens immediately.
        let exhausted =
            self.state == CircuitState::HalfOpen || self.failures >= self.policy.max_attempts;

        if !exhausted {
            return RetryDecision::Retry(self.policy.delay(self.failures));
        }

        match self.policy.cooldown() {
            Some(cooldown) => {
                self.state = CircuitState::Open;
                RetryDecision::CircuitOpen(cooldown)
            }
            None => RetryDecision::GiveUp,
        }
    }

    /// Cooldown elapsed; the next attempt is a probe
    pub fn half_open(&mut self) {
        if self.state == CircuitState::Open {
            self.state = CircuitState::HalfOpen;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: 3,
            circuit_cooldown_secs: Some(10),
        }
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        let p = policy();
        assert_eq!(p.base_delay(1), Duration::from_millis(100));
        assert_eq!(p.base_delay(2), Duration::from_millis(200));
        assert_eq!(p.base_delay(4), Duration::from_millis(800));
        assert_eq!(p.base_delay(5), Duration::from_millis(1_000));
        assert_eq!(p.base_delay(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let p = ReconnectPolicy {
            jitter: 0.5,
            ..policy()
        };
        for _ in 0..100 {
            let d = p.delay(2).as_millis();
            assert!((100..=300).contains(&d), "delay {} out of band", d);
        }
    }

    #[test]
    fn test_breaker_opens_after_bound() {
        let mut breaker = CircuitBreaker::new(policy());

        assert!(matches!(breaker.record_failure(), RetryDecision::Retry(_)));
        assert!(matches!(breaker.record_failure(), RetryDecision::Retry(_)));
        assert_eq!(
            breaker.record_failure(),
            RetryDecision::CircuitOpen(Duration::from_secs(10))
        );
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.half_open();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(matches!(breaker.record_failure(), RetryDecision::CircuitOpen(_)));

        breaker.half_open();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failures(), 0);
    }

    #[test]
    fn test_gives_up_without_cooldown() {
        let mut breaker = CircuitBreaker::new(ReconnectPolicy {
            circuit_cooldown_secs: None,
            max_attempts: 1,
            ..policy()
        });
        assert_eq!(breaker.record_failure(), RetryDecision::GiveUp);
    }
}

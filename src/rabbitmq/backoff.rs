// src/rabbitmq/backoff.rs
//! Capped exponential backoff with jitter and a simple circuit breaker.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random (0.15 = ±15%).
    pub jitter: f64,
    /// Consecutive failures after which the circuit opens.
    pub circuit_threshold: u32,
    /// Delay used while the circuit is open.
    pub circuit_cooldown: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.15,
            circuit_threshold: 10,
            circuit_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Backoff {
            policy,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);

        let base = if self.is_circuit_open() {
            self.policy.circuit_cooldown
        } else {
            let exponent = (self.failures - 1).min(63) as i32;
            let delay_ms = self.policy.initial.as_millis() as f64 * self.policy.multiplier.powi(exponent);
            Duration::from_millis(delay_ms.min(self.policy.max.as_millis() as f64) as u64)
        };

        let base_ms = base.as_millis() as f64;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * self.policy.jitter * base_ms;
        Duration::from_millis((base_ms + jitter).max(0.0) as u64)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_circuit_open(&self) -> bool {
        self.policy.circuit_threshold > 0 && self.failures >= self.policy.circuit_threshold
    }
}

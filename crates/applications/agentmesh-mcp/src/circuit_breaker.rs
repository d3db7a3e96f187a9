//! Per-target circuit breaker gating outbound calls

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time an open circuit waits before probing
    #[serde(rename = "recovery_timeout_secs", with = "crate::config::duration_secs")]
    pub recovery_timeout: Duration,
    /// Successful trial calls needed to close a half-open circuit
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60), // 1 minute
            half_open_max_calls: 3,
        }
    }
}

/// Circuit state for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the recovery timeout elapses
    Open,
    /// A limited number of trial calls are let through
    HalfOpen,
}

/// Lifetime counters for one target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Successes recorded
    pub total_successes: u64,
    /// Failures recorded
    pub total_failures: u64,
    /// Times the circuit opened
    pub trips: u64,
}

/// Breaker state tracked per target
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures
    pub failure_count: u32,
    /// Last failure timestamp
    pub last_failure_time: Option<Instant>,
    /// Calls admitted or succeeded while half-open
    pub half_open_calls: u32,
    /// Lifetime counters
    pub metrics: CircuitBreakerMetrics,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            half_open_calls: 0,
            metrics: CircuitBreakerMetrics::default(),
        }
    }
}

/// Tracks failures per named target and decides whether calls may proceed
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    states: Arc<DashMap<String, CircuitBreakerState>>,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: Arc::new(DashMap::new()),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a call to `target` may proceed.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open
    /// here.
    pub fn can_execute(&self, target: &str) -> bool {
        let Some(mut entry) = self.states.get_mut(target) else {
            return true;
        };

        match entry.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = entry
                    .last_failure_time
                    .map_or(true, |at| at.elapsed() > self.config.recovery_timeout);
                if cooled_down {
                    entry.state = CircuitState::HalfOpen;
                    entry.half_open_calls = 0;
                    info!("Circuit breaker for {} moved to half-open", target);
                    true
                } else {
                    debug!("Circuit breaker for {} is open, rejecting call", target);
                    false
                }
            }
            CircuitState::HalfOpen => entry.half_open_calls < self.config.half_open_max_calls,
        }
    }

    /// Record a successful call to `target`
    pub fn record_success(&self, target: &str) {
        let mut entry = self.states.entry(target.to_string()).or_default();
        entry.metrics.total_successes += 1;

        match entry.state {
            CircuitState::HalfOpen => {
                entry.half_open_calls += 1;
                if entry.half_open_calls >= self.config.half_open_max_calls {
                    entry.state = CircuitState::Closed;
                    entry.failure_count = 0;
                    entry.half_open_calls = 0;
                    info!("Circuit breaker for {} closed after recovery", target);
                }
            }
            CircuitState::Closed => entry.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    /// Record a failed call to `target`
    pub fn record_failure(&self, target: &str) {
        let mut entry = self.states.entry(target.to_string()).or_default();
        entry.failure_count += 1;
        entry.last_failure_time = Some(Instant::now());
        entry.metrics.total_failures += 1;

        match entry.state {
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.half_open_calls = 0;
                entry.metrics.trips += 1;
                warn!("Circuit breaker for {} reopened after a failed trial call", target);
            }
            CircuitState::Closed if entry.failure_count >= self.config.failure_threshold => {
                entry.state = CircuitState::Open;
                entry.metrics.trips += 1;
                warn!(
                    "Circuit breaker for {} opened after {} consecutive failures",
                    target, entry.failure_count
                );
            }
            _ => {}
        }
    }

    /// Current state of `target`; unknown targets are closed
    pub fn state(&self, target: &str) -> CircuitState {
        self.states
            .get(target)
            .map_or(CircuitState::Closed, |entry| entry.state)
    }

    /// Copy of the full state of `target`, if it has been seen
    pub fn snapshot(&self, target: &str) -> Option<CircuitBreakerState> {
        self.states.get(target).map(|entry| entry.clone())
    }

    /// Forget everything about `target`
    pub fn reset(&self, target: &str) {
        if self.states.remove(target).is_some() {
            info!("Circuit breaker for {} reset", target);
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

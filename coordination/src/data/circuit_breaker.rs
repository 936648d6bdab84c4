//! Per-dataset circuit breaker.
//!
//! Tracks consecutive exhausted fetches per dataset. Once the count reaches
//! the threshold the circuit *opens* and fetches for that dataset fail fast.
//! After a cooldown the circuit goes *half-open* and lets a probe through; a
//! success closes it again, a failure re-arms the cooldown.

use std::collections::HashMap;

/// Circuit state for a single dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Healthy; fetches allowed.
    Closed,
    /// Tripped; fetches rejected until cooldown expires.
    Open,
    /// Cooldown expired; probe allowed.
    HalfOpen,
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    consecutive_failures: HashMap<String, u32>,
    last_failure_secs: HashMap<String, u64>,
    /// Consecutive failures before the circuit opens. 0 disables the breaker.
    pub failure_threshold: u32,
    /// Seconds after last failure before Open → HalfOpen.
    pub cooldown_secs: u64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown_secs: u64) -> Self {
        Self {
            consecutive_failures: HashMap::new(),
            last_failure_secs: HashMap::new(),
            failure_threshold,
            cooldown_secs,
        }
    }

    /// Record a success; resets the circuit to Closed.
    pub fn record_success(&mut self, dataset: &str) {
        self.consecutive_failures.remove(dataset);
        self.last_failure_secs.remove(dataset);
    }

    /// Record a failure; may trip the circuit to Open.
    pub fn record_failure(&mut self, dataset: &str) {
        let count = self
            .consecutive_failures
            .entry(dataset.to_string())
            .or_insert(0);
        *count += 1;
        self.last_failure_secs
            .insert(dataset.to_string(), unix_now());
    }

    pub fn state(&self, dataset: &str) -> CircuitState {
        if self.failure_threshold == 0 {
            return CircuitState::Closed;
        }
        let failures = self.failure_count(dataset);
        if failures < self.failure_threshold {
            return CircuitState::Closed;
        }
        let last = self.last_failure_secs.get(dataset).copied().unwrap_or(0);
        if unix_now().saturating_sub(last) >= self.cooldown_secs {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    /// Whether a fetch may proceed (Closed or HalfOpen).
    pub fn is_available(&self, dataset: &str) -> bool {
        !matches!(self.state(dataset), CircuitState::Open)
    }

    pub fn failure_count(&self, dataset: &str) -> u32 {
        self.consecutive_failures.get(dataset).copied().unwrap_or(0)
    }

    /// Datasets whose circuit is currently open.
    pub fn open_datasets(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .consecutive_failures
            .keys()
            .filter(|d| self.state(d) == CircuitState::Open)
            .cloned()
            .collect();
        open.sort();
        open
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, 30)
    }
}

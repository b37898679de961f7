//! Per-agent circuit breaker, process-local.
//!
//! After `threshold` consecutive dispatch failures the breaker opens for
//! `open_for`; dispatches during that window fail fast. Once the window
//! elapses a single trial dispatch is let through (half-open); its success
//! closes the breaker, its failure re-opens the window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::EngineError;

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open: bool,
}

pub struct CircuitBreaker {
    threshold: u32,
    open_for: Duration,
    states: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_for: Duration) -> Self {
        Self {
            threshold,
            open_for,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Gate a dispatch. Errors with `AgentBreakerOpen` while the window is
    /// active.
    pub fn check(&self, agent_id: &str) -> Result<(), EngineError> {
        let mut states = self.states.lock().expect("breaker lock");
        let state = states.entry(agent_id.to_string()).or_default();
        let Some(opened_at) = state.opened_at else {
            return Ok(());
        };
        if opened_at.elapsed() < self.open_for {
            return Err(EngineError::AgentBreakerOpen(agent_id.to_string()));
        }
        // Window elapsed: allow one trial dispatch through.
        state.half_open = true;
        Ok(())
    }

    pub fn record_success(&self, agent_id: &str) {
        let mut states = self.states.lock().expect("breaker lock");
        let state = states.entry(agent_id.to_string()).or_default();
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.half_open = false;
    }

    pub fn record_failure(&self, agent_id: &str) {
        let mut states = self.states.lock().expect("breaker lock");
        let state = states.entry(agent_id.to_string()).or_default();
        state.consecutive_failures += 1;
        if state.half_open || state.consecutive_failures >= self.threshold {
            if state.opened_at.is_none() || state.half_open {
                tracing::warn!(agent_id, failures = state.consecutive_failures, "circuit breaker opened");
            }
            state.opened_at = Some(Instant::now());
            state.half_open = false;
        }
    }

    #[cfg(test)]
    fn force_open_elapsed(&self, agent_id: &str, age: Duration) {
        let mut states = self.states.lock().expect("breaker lock");
        if let Some(state) = states.get_mut(agent_id) {
            state.opened_at = Some(Instant::now() - age);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(60));
        for _ in 0..4 {
            breaker.record_failure("x");
            assert!(breaker.check("x").is_ok());
        }
        breaker.record_failure("x");
        let err = breaker.check("x").unwrap_err();
        assert_eq!(err.kind(), "agent_breaker_open");
    }

    #[test]
    fn success_resets_the_counter() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure("x");
        breaker.record_failure("x");
        breaker.record_success("x");
        breaker.record_failure("x");
        breaker.record_failure("x");
        assert!(breaker.check("x").is_ok());
    }

    #[test]
    fn half_open_trial_closes_on_success() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure("x");
        breaker.record_failure("x");
        assert!(breaker.check("x").is_err());

        breaker.force_open_elapsed("x", Duration::from_secs(61));
        assert!(breaker.check("x").is_ok());
        breaker.record_success("x");
        assert!(breaker.check("x").is_ok());
    }

    #[test]
    fn half_open_trial_reopens_on_failure() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure("x");
        breaker.record_failure("x");
        breaker.force_open_elapsed("x", Duration::from_secs(61));
        assert!(breaker.check("x").is_ok());
        breaker.record_failure("x");
        assert!(breaker.check("x").is_err());
    }

    #[test]
    fn breakers_are_independent_per_agent() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure("x");
        assert!(breaker.check("x").is_err());
        assert!(breaker.check("y").is_ok());
    }
}

// MNEMO Core - circuit breaker for external service calls
// Consecutive-failure counting with a timed open state

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::memory::config::CircuitBreakerConfig;
use crate::memory::{MemoryError, MemoryResult};

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Counts consecutive failures against an external service; once the
/// threshold is crossed the breaker opens and calls fail fast until the
/// open window elapses.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: &'static str,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(service: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            service,
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Fail fast while the breaker is open.
    pub fn check(&self) -> MemoryResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(until) = state.open_until {
            if Instant::now() < until {
                return Err(MemoryError::Upstream(format!(
                    "{} circuit open, failing fast",
                    self.service
                )));
            }
            // Half-open: allow the next call through.
            state.open_until = None;
            state.consecutive_failures = 0;
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.config.failure_threshold {
            state.open_until = Some(Instant::now() + self.config.open_for);
            warn!(
                service = self.service,
                failures = state.consecutive_failures,
                "circuit breaker opened"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 3,
                open_for: Duration::from_secs(60),
            },
        );

        assert!(breaker.check().is_ok());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.check().is_ok());
        breaker.record_failure();
        assert!(breaker.check().is_err());
    }

    #[test]
    fn test_success_resets_count() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 2,
                open_for: Duration::from_secs(60),
            },
        );

        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn test_reopens_after_window() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 1,
                open_for: Duration::from_millis(0),
            },
        );

        breaker.record_failure();
        // Zero-length window: the next check transitions to half-open.
        assert!(breaker.check().is_ok());
    }
}

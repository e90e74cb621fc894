//! Per-endpoint circuit breaker, kept separate from the retry loop (see
//! [`super::retry`]): breaker state tracks endpoint health across calls,
//! while retry classification is a pure per-call decision.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
}

/// `state == Open` implies `consecutive_failures >= threshold`; once
/// `reset_window` elapses from `last_failure_at` the breaker closes again
/// and allows a probe request.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    threshold: u32,
    reset_window: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_window: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            threshold,
            reset_window,
        }
    }

    /// Whether a request should be allowed through right now. Has the side
    /// effect of closing the breaker (allowing a probe) once the reset
    /// window has elapsed.
    pub fn allow_request(&mut self) -> bool {
        if self.state == BreakerState::Closed {
            return true;
        }
        match self.last_failure_at {
            Some(last) if last.elapsed() >= self.reset_window => {
                self.state = BreakerState::Closed;
                true
            }
            _ => false,
        }
    }

    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
    }

    pub fn on_failure(&mut self) {
        self.consecutive_failures += 1;
        self.last_failure_at = Some(Instant::now());
        if self.consecutive_failures >= self.threshold {
            self.state = BreakerState::Open;
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

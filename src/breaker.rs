//! Circuit breaker for failure protection around remote calls.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    total_trips: u64,
}

/// Snapshot of breaker state for health endpoints and logs.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: f64,
    pub total_trips: u64,
}

/// Tri-state failure isolator (CLOSED -> OPEN -> HALF_OPEN -> CLOSED).
///
/// When consecutive failures reach the threshold the circuit opens and calls
/// are refused without attempting the operation. After the recovery timeout
/// one probe call is allowed through (half-open); success closes the circuit,
/// failure re-opens it and restarts the clock.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                total_trips: 0,
            }),
        }
    }

    /// Current state, accounting for the recovery timeout. Observing an open
    /// circuit past its timeout transitions it to half-open.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.refresh_locked(&mut inner);
        inner.state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Record a successful call. Resets the failure count and closes the circuit.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state != CircuitState::Closed {
            info!(name = %self.name, "circuit closed");
        }
        inner.failure_count = 0;
        inner.state = CircuitState::Closed;
    }

    /// Record a failed call. May trip the circuit open.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.refresh_locked(&mut inner);
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        // A failed half-open probe re-opens immediately.
        if inner.failure_count >= self.failure_threshold || inner.state == CircuitState::HalfOpen {
            if inner.state != CircuitState::Open {
                inner.total_trips += 1;
                warn!(
                    name = %self.name,
                    failures = inner.failure_count,
                    recovery_timeout_secs = self.recovery_timeout.as_secs_f64(),
                    total_trips = inner.total_trips,
                    "circuit opened"
                );
            }
            inner.state = CircuitState::Open;
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.refresh_locked(&mut inner);
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            recovery_timeout_secs: self.recovery_timeout.as_secs_f64(),
            total_trips: inner.total_trips,
        }
    }

    fn refresh_locked(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure
                .map(|t| t.elapsed())
                .unwrap_or(Duration::MAX);
            if elapsed >= self.recovery_timeout {
                inner.state = CircuitState::HalfOpen;
                debug!(name = %self.name, "circuit half-open");
            }
        }
    }
}

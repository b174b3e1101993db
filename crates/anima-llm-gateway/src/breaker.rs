//! Circuit breaker: a three-state machine that sheds load during backend
//! outages and recovers cautiously through a single half-open probe.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Too many failures, calls are rejected immediately.
    Open,
    /// Testing recovery; one probe allowed through.
    HalfOpen,
}

impl CircuitState {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Rejection returned while the circuit is open.
#[derive(Debug, thiserror::Error)]
#[error("circuit breaker '{name}' is OPEN; service unavailable for {retry_in_secs:.0}s")]
pub struct CircuitOpen {
    /// The protected backend's name.
    pub name: String,
    /// Seconds until a probe will be allowed.
    pub retry_in_secs: f64,
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in `Closed` before opening.
    pub failure_threshold: u32,
    /// Time to wait in `Open` before allowing a probe.
    pub recovery_timeout: Duration,
    /// Successes in `HalfOpen` needed to close.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    probe_in_flight: bool,
    last_failure: Option<Instant>,
    last_transition: Instant,
}

/// Point-in-time breaker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    /// Backend name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures.
    pub failures: u32,
    /// Successes since entering half-open.
    pub successes: u32,
    /// Seconds spent in the current state.
    pub time_in_state_secs: f64,
    /// Seconds until a probe is allowed; zero unless open.
    pub time_until_retry_secs: f64,
}

/// A circuit breaker guarding one backend. Mutated only through
/// [`check`](CircuitBreaker::check) / [`record_success`](CircuitBreaker::record_success) /
/// [`record_failure`](CircuitBreaker::record_failure) on call outcomes.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker for the named backend.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let name = name.into();
        info!(
            breaker = %name,
            threshold = config.failure_threshold,
            timeout_secs = config.recovery_timeout.as_secs_f64(),
            "circuit breaker initialised"
        );
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                probe_in_flight: false,
                last_failure: None,
                last_transition: Instant::now(),
            }),
        }
    }

    /// Gate a call. `Ok` means the caller may proceed (and must report the
    /// outcome); `Err` is the distinguished circuit-open rejection.
    pub fn check(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.recovery_timeout {
                    info!(breaker = %self.name, "circuit HALF_OPEN, testing recovery");
                    inner.state = CircuitState::HalfOpen;
                    inner.successes = 0;
                    inner.probe_in_flight = true;
                    inner.last_transition = Instant::now();
                    Ok(())
                } else {
                    let retry_in = self.config.recovery_timeout.saturating_sub(elapsed);
                    Err(CircuitOpen {
                        name: self.name.clone(),
                        retry_in_secs: retry_in.as_secs_f64(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(CircuitOpen { name: self.name.clone(), retry_in_secs: 0.0 })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Report a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
            inner.successes += 1;
            info!(
                breaker = %self.name,
                successes = inner.successes,
                needed = self.config.success_threshold,
                "success in HALF_OPEN"
            );
            if inner.successes >= self.config.success_threshold {
                info!(breaker = %self.name, "circuit CLOSED, service recovered");
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.successes = 0;
                inner.last_transition = Instant::now();
            }
        }
    }

    /// Report a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        inner.last_failure = Some(Instant::now());
        warn!(
            breaker = %self.name,
            failures = inner.failures,
            threshold = self.config.failure_threshold,
            "failure recorded"
        );
        let should_open = match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                true
            }
            CircuitState::Closed => inner.failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open && inner.state != CircuitState::Open {
            error!(
                breaker = %self.name,
                timeout_secs = self.config.recovery_timeout.as_secs_f64(),
                "circuit OPENED"
            );
            inner.state = CircuitState::Open;
            inner.last_transition = Instant::now();
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        let time_until_retry = if inner.state == CircuitState::Open {
            inner
                .last_failure
                .map(|t| {
                    self.config
                        .recovery_timeout
                        .saturating_sub(t.elapsed())
                        .as_secs_f64()
                })
                .unwrap_or(0.0)
        } else {
            0.0
        };
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            time_in_state_secs: inner.last_transition.elapsed().as_secs_f64(),
            time_until_retry_secs: time_until_retry,
        }
    }

    /// Manually reset to closed with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        info!(breaker = %self.name, "manual reset");
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.successes = 0;
        inner.probe_in_flight = false;
        inner.last_transition = Instant::now();
    }
}

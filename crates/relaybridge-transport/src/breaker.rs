//! Circuit breaker guarding outbound connection attempts.
//!
//! Classical three-state machine: Closed counts outcomes over a rolling
//! evaluation window and trips Open once enough observations show a high
//! failure rate; Open rejects calls for a fixed duration, then HalfOpen
//! admits a single probe whose outcome decides between Closed and Open.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use metrics::gauge;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::{TransportError, TransportResult};

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failure rate at or above which the circuit trips, in [0,1]
    pub failure_rate_threshold: f64,
    /// Observations required in the window before the rate is trusted
    pub minimum_observations: u32,
    /// Rolling window over which outcomes are evaluated
    pub evaluation_window: Duration,
    /// How long the circuit stays open before probing
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.6,
            minimum_observations: 3,
            evaluation_window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing fast, no calls pass
    Open,
    /// A single probe call is allowed through
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0 closed, 1 half-open, 2 open
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

/// Observable breaker counters
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Requests since the last reset
    pub requests: u64,
    /// Successes since the last reset
    pub successes: u64,
    /// Failures since the last reset
    pub failures: u64,
    /// When a call last succeeded
    pub last_success_at: Option<Instant>,
    /// When a call last failed
    pub last_failure_at: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    window: VecDeque<(Instant, bool)>,
    requests: u64,
    successes: u64,
    failures: u64,
    last_success_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Three-state circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a named breaker; the name labels the `circuit_state` gauge
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                requests: 0,
                successes: 0,
                failures: 0,
                last_success_at: None,
                last_failure_at: None,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Create a breaker with the default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// The configured open duration, used by callers that sleep it out
    pub fn open_duration(&self) -> Duration {
        self.config.open_duration
    }

    /// Admit or reject a call. An admitted call must be followed by
    /// [`record`](Self::record).
    pub fn try_acquire(&self) -> TransportResult<()> {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(TransportError::CircuitOpen),
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(TransportError::CircuitOpen)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record the outcome of an admitted call
    pub fn record(&self, success: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.requests += 1;
        if success {
            inner.successes += 1;
            inner.last_success_at = Some(now);
        } else {
            inner.failures += 1;
            inner.last_failure_at = Some(now);
        }

        match inner.state {
            CircuitState::Closed => {
                inner.window.push_back((now, success));
                Self::prune(&mut inner.window, now, self.config.evaluation_window);
                if self.should_trip(&inner.window) {
                    self.trip(&mut inner, now);
                }
            }
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                if success {
                    debug!(name = %self.name, "half-open probe succeeded, closing circuit");
                    self.reset_counters(&mut inner);
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                    self.publish(CircuitState::Closed);
                } else {
                    self.trip(&mut inner, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Gate an async operation behind the breaker. The lock is never held
    /// across the awaited operation.
    pub async fn execute<F, Fut, T>(&self, op: F) -> TransportResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = TransportResult<T>>,
    {
        self.try_acquire()?;
        let result = op().await;
        // A cancelled call says nothing about the peer
        match &result {
            Err(e) if e.is_cancelled() => {
                let mut inner = self.inner.lock();
                inner.probe_in_flight = false;
            }
            other => self.record(other.is_ok()),
        }
        result
    }

    /// Current state, advancing Open to HalfOpen when the timer allows
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        inner.state
    }

    /// Snapshot of the observable counters
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        CircuitBreakerStats {
            state: inner.state,
            requests: inner.requests,
            successes: inner.successes,
            failures: inner.failures,
            last_success_at: inner.last_success_at,
            last_failure_at: inner.last_failure_at,
        }
    }

    /// (state ≠ Open) ∧ (success rate ≥ 0.8 ∨ no traffic)
    pub fn healthy(&self) -> bool {
        let stats = self.stats();
        if stats.state == CircuitState::Open {
            return false;
        }
        if stats.requests == 0 {
            return true;
        }
        stats.successes as f64 / stats.requests as f64 >= 0.8
    }

    fn advance(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed())
                .unwrap_or(Duration::ZERO);
            if elapsed >= self.config.open_duration {
                debug!(name = %self.name, "open duration elapsed, probing half-open");
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = false;
                self.publish(CircuitState::HalfOpen);
            }
        }
    }

    fn should_trip(&self, window: &VecDeque<(Instant, bool)>) -> bool {
        if (window.len() as u32) < self.config.minimum_observations {
            return false;
        }
        let failures = window.iter().filter(|(_, success)| !success).count();
        failures as f64 / window.len() as f64 >= self.config.failure_rate_threshold
    }

    fn trip(&self, inner: &mut Inner, now: Instant) {
        warn!(name = %self.name, "circuit breaker tripped open");
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.window.clear();
        inner.probe_in_flight = false;
        self.publish(CircuitState::Open);
    }

    fn reset_counters(&self, inner: &mut Inner) {
        inner.requests = 0;
        inner.successes = 0;
        inner.failures = 0;
        inner.window.clear();
    }

    fn prune(window: &mut VecDeque<(Instant, bool)>, now: Instant, span: Duration) {
        while let Some((at, _)) = window.front() {
            if now.duration_since(*at) > span {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    fn publish(&self, state: CircuitState) {
        gauge!("circuit_state", "name" => self.name.clone()).set(state.as_gauge());
    }
}

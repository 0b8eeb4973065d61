//! Per-dependency circuit breakers and the registry that owns them.
//!
//! A breaker is CLOSED while calls succeed, trips OPEN after
//! `failure_threshold` consecutive failures (or that many failures inside the
//! optional sliding window), and after `timeout` admits a single HALF_OPEN
//! probe. `success_threshold` consecutive probe successes close it again; any
//! probe failure re-opens it and restarts the timer.
//!
//! All state lives behind one mutex per breaker, so stat updates and the
//! transitions they trigger are observed atomically by concurrent callers.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::CircuitOpenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// How long OPEN lasts before a probe is admitted.
    pub timeout: Duration,
    /// Sliding window of recent outcomes; `None` means consecutive-only.
    pub window_size: Option<usize>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            window_size: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, success_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            timeout,
            window_size: None,
        }
    }

    pub fn with_window(mut self, window_size: usize) -> Self {
        self.window_size = Some(window_size);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    pub failure_count: u64,
    pub success_count: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_state_change: Option<DateTime<Utc>>,
}

/// How a call got through `before_call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker is closed; normal call.
    Pass,
    /// The single HALF_OPEN probe.
    Probe,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub stats: CircuitStats,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    stats: CircuitStats,
    opened_at: Option<Instant>,
    probe_started: Option<Instant>,
    window: VecDeque<bool>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            stats: CircuitStats::default(),
            opened_at: None,
            probe_started: None,
            window: VecDeque::new(),
        }
    }

    fn window_failures(&self) -> usize {
        self.window.iter().filter(|ok| !**ok).count()
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying a due OPEN → HALF_OPEN transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.promote_if_due(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitStats {
        self.inner.lock().stats.clone()
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.inner.lock();
        self.promote_if_due(&mut inner);
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            stats: inner.stats.clone(),
        }
    }

    /// Gate a call. Fails fast while OPEN; in HALF_OPEN admits exactly one
    /// probe at a time and rejects everyone else until it reports back.
    pub fn before_call(&self) -> Result<Admission, CircuitOpenError> {
        let mut inner = self.inner.lock();
        self.promote_if_due(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(Admission::Pass),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                Err(self.open_error(self.config.timeout.saturating_sub(elapsed)))
            }
            CircuitState::HalfOpen => match inner.probe_started {
                None => {
                    inner.probe_started = Some(Instant::now());
                    debug!(circuit = %self.name, "Admitting half-open probe");
                    Ok(Admission::Probe)
                }
                Some(started) if started.elapsed() >= self.config.timeout => {
                    warn!(circuit = %self.name, "Previous probe never reported, admitting a new one");
                    inner.probe_started = Some(Instant::now());
                    Ok(Admission::Probe)
                }
                Some(started) => {
                    Err(self.open_error(self.config.timeout.saturating_sub(started.elapsed())))
                }
            },
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.stats.success_count += 1;
        inner.stats.consecutive_successes += 1;
        inner.stats.consecutive_failures = 0;
        self.push_outcome(&mut inner, true);

        if inner.state == CircuitState::HalfOpen {
            inner.probe_started = None;
            if inner.stats.consecutive_successes >= self.config.success_threshold {
                self.transition(&mut inner, CircuitState::Closed);
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.stats.failure_count += 1;
        inner.stats.consecutive_failures += 1;
        inner.stats.consecutive_successes = 0;
        inner.stats.last_failure_time = Some(Utc::now());
        self.push_outcome(&mut inner, false);

        match inner.state {
            CircuitState::Closed => {
                let threshold = self.config.failure_threshold;
                let windowed = self.config.window_size.is_some()
                    && inner.window_failures() >= threshold as usize;
                if inner.stats.consecutive_failures >= threshold || windowed {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.probe_started = None;
                self.transition(&mut inner, CircuitState::Open);
            }
            // Late result from a call admitted before the trip; the timer stands.
            CircuitState::Open => {}
        }
    }

    /// Back to CLOSED with fresh stats.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = Inner::new();
        inner.stats.last_state_change = Some(Utc::now());
        info!(circuit = %self.name, "Circuit reset");
    }

    fn promote_if_due(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open
            && inner
                .opened_at
                .is_some_and(|t| t.elapsed() >= self.config.timeout)
        {
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.stats.last_state_change = Some(Utc::now());

        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.probe_started = None;
                warn!(
                    circuit = %self.name,
                    %from,
                    consecutive_failures = inner.stats.consecutive_failures,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.stats.consecutive_successes = 0;
                info!(circuit = %self.name, "Circuit half-open, awaiting probe");
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.probe_started = None;
                inner.window.clear();
                inner.stats.consecutive_failures = 0;
                info!(circuit = %self.name, %from, "Circuit closed");
            }
        }
    }

    fn push_outcome(&self, inner: &mut Inner, ok: bool) {
        let Some(size) = self.config.window_size else {
            return;
        };
        inner.window.push_back(ok);
        while inner.window.len() > size {
            inner.window.pop_front();
        }
    }

    fn open_error(&self, retry_in: Duration) -> CircuitOpenError {
        let delta = chrono::Duration::from_std(retry_in).unwrap_or_else(|_| chrono::Duration::zero());
        CircuitOpenError {
            name: self.name.clone(),
            reset_time: Utc::now() + delta,
            retry_in,
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

/// Named breakers, created lazily on first lookup.
///
/// Constructed once at startup and passed by reference (usually as an `Arc`)
/// to everything that needs circuit breaking; tests build their own.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    /// Breaker for `name`, created with the default config if absent.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_with_config(name, self.default_config.clone())
    }

    /// Breaker for `name`; `config` is used only if this call creates it.
    pub fn get_with_config(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let entry = self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(circuit = %name, "Registering circuit breaker");
                Arc::new(CircuitBreaker::new(name, config))
            });
        Arc::clone(entry.value())
    }

    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Returns false when no breaker by that name exists.
    pub fn reset(&self, name: &str) -> bool {
        match self.find(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.iter().map(|b| Arc::clone(b.value())).collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.breakers.iter().map(|b| b.key().clone()).collect();
        names.sort();
        names
    }

    pub fn snapshot_all(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<_> = self.breakers.iter().map(|b| Arc::clone(b.value())).collect();
        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

//! Sliding-window circuit breaker guarding the SMTP relay.
//!
//! Relays throttle or ban senders that keep failing authentication or flood
//! them with connections. Once `failure_threshold` failures land inside
//! `window_secs`, the breaker opens and every send is refused without a
//! network call until `cooldown_secs` have passed.
//!
//! # State Transitions
//!
//! ```text
//! ┌─────────┐  threshold failures within window  ┌──────┐
//! │ Closed  │ ─────────────────────────────────> │ Open │
//! └─────────┘                                    └──────┘
//!      ^                                            │
//!      │            cooldown elapsed                │
//!      └────────────────────────────────────────────┘
//! ```
//!
//! There is no half-open probing: the first read after the cooldown closes
//! the breaker and forgets the failure history. A success only drops the
//! oldest recorded failure, so one lucky send cannot hide a real outage.

use std::{collections::VecDeque, time::Duration};

use kova_common::tracing;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Length of the sliding failure window (seconds)
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// How long the circuit stays open (seconds)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

const fn default_failure_threshold() -> u32 {
    20
}

const fn default_window_secs() -> u64 {
    60
}

const fn default_cooldown_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
}

#[derive(Debug, Default)]
struct CircuitData {
    /// Failure instants, oldest first
    failures: VecDeque<Instant>,
    open_until: Option<Instant>,
}

impl CircuitData {
    fn prune(&mut self, now: Instant, window: Duration) {
        while self
            .failures
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) > window)
        {
            self.failures.pop_front();
        }
    }

    /// Close the circuit if the cooldown has passed. Returns the remaining
    /// open time otherwise.
    fn refresh(&mut self, now: Instant) -> Option<Duration> {
        let until = self.open_until?;
        if now < until {
            return Some(until - now);
        }

        self.open_until = None;
        self.failures.clear();
        tracing::info!("Circuit breaker CLOSED - sends allowed again");
        None
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    data: parking_lot::Mutex<CircuitData>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            data: parking_lot::Mutex::new(CircuitData::default()),
        }
    }

    const fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.config.cooldown_secs)
    }

    /// `true` while sends must be refused.
    pub fn is_open(&self) -> bool {
        self.remaining_open().is_some()
    }

    /// Time left before the circuit closes, or `None` when it is closed.
    pub fn remaining_open(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut data = self.data.lock();
        let remaining = data.refresh(now);
        data.prune(now, self.window());
        remaining
    }

    /// Record a failed send.
    ///
    /// Returns `true` if this failure opened the circuit.
    pub fn record_failure(&self) -> bool {
        let now = Instant::now();
        let mut data = self.data.lock();
        let was_open = data.refresh(now).is_some();
        data.prune(now, self.window());
        data.failures.push_back(now);

        let count = data.failures.len();
        if count < self.config.failure_threshold as usize {
            return false;
        }

        data.open_until = Some(now + self.cooldown());
        if was_open {
            return false;
        }

        tracing::warn!(
            failures = count,
            threshold = self.config.failure_threshold,
            cooldown_secs = self.config.cooldown_secs,
            "Circuit breaker OPENED - refusing sends to protect the relay"
        );
        true
    }

    /// Record a successful send by trimming the oldest failure.
    pub fn record_success(&self) {
        let now = Instant::now();
        let mut data = self.data.lock();
        data.prune(now, self.window());
        data.failures.pop_front();
    }

    pub fn state(&self) -> CircuitState {
        if self.is_open() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let now = Instant::now();
        let mut data = self.data.lock();
        let open_for = data.refresh(now);
        data.prune(now, self.window());
        CircuitBreakerStats {
            state: if open_for.is_some() {
                CircuitState::Open
            } else {
                CircuitState::Closed
            },
            recent_failures: data.failures.len(),
            open_for,
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    /// Failures inside the current window
    pub recent_failures: usize,
    /// Time left in the open state
    pub open_for: Option<Duration>,
}
